use std::io;

use nix::errno::Errno;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

/// An error emitted by the X11 platform.
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// This server cannot be driven by this library; another EGL platform
    /// should get a chance to try.
    #[error("{0}")]
    NotSupported(NotSupportedError),

    /// The requested rendering device cannot be used with this server.
    #[error("{0}")]
    DeviceMismatch(DeviceMismatchError),

    /// The native window handle was unusable.
    #[error("bad native window: {0}")]
    BadNativeWindow(&'static str),

    /// The native pixmap handle was unusable.
    #[error("bad native pixmap: {0}")]
    BadNativePixmap(&'static str),

    /// The config does not fit the requested surface.
    #[error("bad match: {0}")]
    BadMatch(&'static str),

    /// The screen number does not exist on this server.
    #[error("invalid screen number {0}")]
    InvalidScreen(usize),

    /// The display has not been initialized (or was terminated).
    #[error("the display is not initialized")]
    NotInitialized,

    /// The application closed the native display this EGL display wraps.
    #[error("the native display has been closed")]
    NativeDisplayClosed,

    /// Connecting to the X server failed.
    #[error("connecting to the X server failed")]
    ConnectionFailed(#[from] ConnectError),

    /// A wire round-trip returned an X error or the connection broke.
    #[error("X11 protocol error")]
    Protocol(#[from] ReplyOrIdError),

    /// Allocating buffers or kernel sync objects failed.
    #[error("{0}")]
    Allocation(#[from] AllocateBuffersError),

    /// The server went away, or the native window was destroyed behind our
    /// back. Observed as a dead event stream or a destroyed-window flag in
    /// a Present configure event.
    #[error("the X server terminated the window")]
    ServerTerminated,
}

/// Reasons a server is not usable by this library.
#[derive(Debug, thiserror::Error)]
pub enum NotSupportedError {
    /// The connection does not run over a UNIX domain socket, so file
    /// descriptors cannot be passed.
    #[error("the display connection is not a UNIX domain socket")]
    NotUnixSocket,

    /// A required extension was missing or too old.
    #[error("{0}")]
    MissingExtension(MissingExtensionError),

    /// The server exposes NV-GLX, which means the driver's own X11 path
    /// should handle it instead of this library.
    #[error("the server has a native NVIDIA GLX implementation")]
    NativeNvidiaServer,

    /// The device behind the server is not one this library can drive.
    #[error("the X server is not running on an NVIDIA device")]
    ServerNotNvidia,

    /// Neither direct presentation nor PRIME is possible.
    #[error("no usable presentation path between the device and the server")]
    NoPresentationPath,
}

/// An error that occurs when a required X11 extension is not usable.
#[derive(Debug, thiserror::Error)]
pub enum MissingExtensionError {
    /// An extension was not found.
    #[error("extension \"{name}\" version {major}.{minor} was not found")]
    NotFound {
        /// The name of the required extension.
        name: &'static str,
        /// The minimum required major version.
        major: u32,
        /// The minimum required minor version.
        minor: u32,
    },

    /// An extension was present, but with an incompatible version.
    #[error("extension \"{name}\" version {required_major}.{required_minor} is required but only version {available_major}.{available_minor} is available")]
    WrongVersion {
        /// The name of the extension.
        name: &'static str,
        /// The required major version (must match exactly).
        required_major: u32,
        /// The minimum required minor version.
        required_minor: u32,
        /// The major version available on the server.
        available_major: u32,
        /// The minor version available on the server.
        available_minor: u32,
    },
}

/// Device selection failures during initialization.
#[derive(Debug, thiserror::Error)]
pub enum DeviceMismatchError {
    /// Offload between two NVIDIA devices was requested; the server's
    /// device must be used directly instead.
    #[error("render offload between two NVIDIA devices is not supported")]
    NvidiaToNvidia,

    /// The requested device was not found in the driver's device list.
    #[error("the requested rendering device was not found")]
    NoSuchDevice,

    /// No usable rendering device was found at all.
    #[error("no usable NVIDIA rendering device was found")]
    NoDevice,
}

/// An error which may occur when allocating buffers or sync objects.
#[derive(Debug, thiserror::Error)]
pub enum AllocateBuffersError {
    /// Opening or duplicating a file descriptor failed.
    #[error("failed to open or duplicate a file descriptor")]
    OpenDevice(#[from] io::Error),

    /// The gbm allocator could not create the buffer.
    #[error("failed to allocate a gbm buffer")]
    GbmAllocation,

    /// Exporting a buffer as a dma-buf failed.
    #[error("failed to export a buffer as dma-buf")]
    ExportDmabuf,

    /// The driver refused the buffer.
    #[error(transparent)]
    Driver(#[from] crate::driver::DriverError),

    /// Creating or converting a kernel syncobj failed.
    #[error("kernel syncobj operation failed")]
    Syncobj(#[source] io::Error),
}

impl From<MissingExtensionError> for X11Error {
    fn from(err: MissingExtensionError) -> Self {
        Self::NotSupported(NotSupportedError::MissingExtension(err))
    }
}

impl From<NotSupportedError> for X11Error {
    fn from(err: NotSupportedError) -> Self {
        Self::NotSupported(err)
    }
}

impl From<DeviceMismatchError> for X11Error {
    fn from(err: DeviceMismatchError) -> Self {
        Self::DeviceMismatch(err)
    }
}

impl From<ReplyError> for X11Error {
    fn from(err: ReplyError) -> Self {
        Self::Protocol(err.into())
    }
}

impl From<ConnectionError> for X11Error {
    fn from(err: ConnectionError) -> Self {
        Self::Protocol(err.into())
    }
}

impl From<crate::driver::DriverError> for X11Error {
    fn from(err: crate::driver::DriverError) -> Self {
        Self::Allocation(err.into())
    }
}

impl From<Errno> for AllocateBuffersError {
    fn from(err: Errno) -> Self {
        Self::OpenDevice(err.into())
    }
}
