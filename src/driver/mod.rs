//! The driver side of the platform contract.
//!
//! The EGL driver renders; this crate only moves finished buffers around.
//! Everything the crate needs from the driver is collected in two traits:
//!
//! - [`CallbackSafeOps`] is the small set of operations the driver documents
//!   as safe to call while it is invoking one of our surface callbacks (the
//!   driver holds its internal window-system lock at that point, so anything
//!   outside this set can deadlock).
//! - [`PlatformDriver`] is the full interface, only usable from platform
//!   entry points that run for the calling thread's current surface (surface
//!   creation, buffer swaps, teardown).
//!
//! The split is deliberate: update and damage callbacks receive a
//! `&dyn CallbackSafeOps`, so re-entering the driver on an unsafe path is a
//! compile error rather than an occasional deadlock.
//!
//! Handles are opaque tokens minted by the driver. The crate never looks
//! inside them; it only passes them back.

use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};

/// Version of the platform-surface interface this crate was written against.
///
/// The driver reports its own version from
/// [`PlatformDriver::interface_version`]; the major versions must be equal
/// and the driver's minor version must be at least this one.
pub const INTERFACE_MAJOR_VERSION: u16 = 0;
/// Minimum minor version required, see [`INTERFACE_MAJOR_VERSION`].
pub const INTERFACE_MINOR_VERSION: u16 = 1;

/// Opaque handle to a driver color buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBufferHandle(pub u64);

/// Opaque handle to a driver surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverSurface(pub u64);

/// Opaque handle to one of the driver's EGL configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverConfig(pub u64);

/// Opaque handle to a driver rendering device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverDevice(pub u64);

/// Opaque handle to the driver's internal display for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverDisplay(pub u64);

/// Opaque handle to a driver sync object backed by a native fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFence(pub u64);

/// Errors reported by the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The driver does not implement the requested operation.
    #[error("the driver does not support this operation")]
    Unsupported,
    /// The driver ran out of memory or another finite resource.
    #[error("the driver is out of resources")]
    OutOfResources,
    /// The driver rejected the operation.
    #[error("the driver rejected the operation: {0}")]
    Rejected(&'static str),
}

/// Result alias for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Memory layout of a dma-buf as it crosses the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Fourcc code of the pixel data.
    pub fourcc: DrmFourcc,
    /// Stride of the (single) plane in bytes.
    pub stride: u32,
    /// Offset of the plane in bytes.
    pub offset: u32,
    /// Format modifier.
    pub modifier: DrmModifier,
}

/// A color buffer exported from the driver, together with its layout.
#[derive(Debug)]
pub struct ExportedBuffer {
    /// The dma-buf file descriptor. The caller owns it.
    pub fd: OwnedFd,
    /// Layout of the exported image.
    pub layout: BufferLayout,
}

/// The buffers attached to a driver surface.
///
/// A surface must stay single- or double-buffered over its lifetime: the
/// `front`/`back` attachments may be swapped for other buffers but not
/// added or removed. The `blit_target` attachment may change between
/// `None` and `Some` freely; it is the pitch-linear buffer that PRIME
/// presentation copies into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAttachments {
    /// The front buffer, if the surface has one.
    pub front: Option<ColorBufferHandle>,
    /// The back buffer.
    pub back: Option<ColorBufferHandle>,
    /// The PRIME blit target, if any.
    pub blit_target: Option<ColorBufferHandle>,
}

/// Flags passed to [`SurfaceCallbacks::damage`]. The driver defines none
/// yet; the type exists so adding one later is not a breaking change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DamageFlags(pub u32);

/// Callbacks a surface registers with the driver at creation time.
///
/// Both callbacks run on the driver's own threads while the driver holds
/// its internal window-system lock. Implementations only get access to the
/// [`CallbackSafeOps`] subset of the driver and must not block on anything
/// that could re-enter the driver.
pub trait SurfaceCallbacks: Send + Sync {
    /// Called before the driver starts using the surface, e.g. from
    /// `eglMakeCurrent` or at the start of a frame. The surface is expected
    /// to bring its buffers up to date with the current window size.
    ///
    /// Only ever called for a thread's current surface, so it cannot race
    /// with a swap on the same surface.
    fn update(&self, driver: &dyn CallbackSafeOps);

    /// Called after the driver flushed rendering to the front (or single)
    /// buffer. `sync_fd` is a fence for that rendering, or `None` if the
    /// driver already waited. The driver closes the fd after the callback
    /// returns; implementations that keep it must duplicate it.
    fn damage(&self, driver: &dyn CallbackSafeOps, sync_fd: Option<BorrowedFd<'_>>, flags: DamageFlags);
}

/// Driver operations that are documented as safe to call from inside
/// [`SurfaceCallbacks`].
pub trait CallbackSafeOps: Send + Sync {
    /// Imports a dma-buf as a color buffer. The fd is only borrowed for the
    /// duration of the call.
    fn import_color_buffer(
        &self,
        display: DriverDisplay,
        fd: BorrowedFd<'_>,
        layout: &BufferLayout,
    ) -> DriverResult<ColorBufferHandle>;

    /// Allocates a color buffer with the given layout. With `force_sysmem`
    /// the buffer is placed in system memory, which is what a cross-device
    /// blit target needs.
    fn alloc_color_buffer(
        &self,
        display: DriverDisplay,
        width: u32,
        height: u32,
        fourcc: DrmFourcc,
        modifier: DrmModifier,
        force_sysmem: bool,
    ) -> DriverResult<ColorBufferHandle>;

    /// Exports a color buffer as a dma-buf.
    fn export_color_buffer(&self, display: DriverDisplay, buffer: ColorBufferHandle)
        -> DriverResult<ExportedBuffer>;

    /// Frees a color buffer. Buffers still attached to a surface are freed
    /// by the driver once detached.
    fn free_color_buffer(&self, display: DriverDisplay, buffer: ColorBufferHandle);

    /// Replaces the buffers attached to a surface. Outside a callback this
    /// may only be called for the calling thread's current surface.
    fn set_color_buffers(
        &self,
        display: DriverDisplay,
        surface: DriverSurface,
        attachments: &BufferAttachments,
    ) -> DriverResult<()>;
}

/// The full driver interface.
///
/// Everything beyond [`CallbackSafeOps`] may only be called from platform
/// entry points, never from inside a surface callback.
pub trait PlatformDriver: CallbackSafeOps {
    /// The platform-surface interface version the driver implements, as
    /// `(major, minor)`.
    fn interface_version(&self) -> (u16, u16);

    /// Enumerates the driver's rendering devices.
    fn devices(&self) -> Vec<DriverDevice>;

    /// Returns the DRM primary node path of a device, if it has one.
    fn device_node_path(&self, device: DriverDevice) -> Option<PathBuf>;

    /// Obtains the internal display for a device. `master_fd`, when given,
    /// is the device fd handed to us by the server, which the driver may
    /// use instead of opening the node itself.
    fn display_for_device(
        &self,
        device: DriverDevice,
        master_fd: Option<BorrowedFd<'_>>,
    ) -> DriverResult<DriverDisplay>;

    /// Initializes an internal display. May be called more than once; the
    /// driver tracks references.
    fn initialize_display(&self, display: DriverDisplay) -> DriverResult<()>;

    /// Terminates an internal display previously initialized.
    fn terminate_display(&self, display: DriverDisplay);

    /// The fourcc codes the display can import as dma-bufs.
    fn query_dmabuf_formats(&self, display: DriverDisplay) -> DriverResult<Vec<DrmFourcc>>;

    /// The modifiers the display supports for a format. The `bool` is the
    /// external-only flag: such modifiers can be sampled but not rendered.
    fn query_dmabuf_modifiers(
        &self,
        display: DriverDisplay,
        fourcc: DrmFourcc,
    ) -> DriverResult<Vec<(DrmModifier, bool)>>;

    /// The driver's EGL configs for a display.
    fn configs(&self, display: DriverDisplay) -> Vec<DriverConfig>;

    /// The fourcc code of a config, or `None` if the config has no dma-buf
    /// representable format.
    fn config_fourcc(&self, display: DriverDisplay, config: DriverConfig) -> Option<DrmFourcc>;

    /// Whether the display supports Android-style native fence syncs.
    fn supports_native_fence_sync(&self, display: DriverDisplay) -> bool;

    /// Whether the driver exposes the copy/alloc/export color-buffer
    /// entrypoints needed for PRIME.
    fn supports_prime_blits(&self) -> bool;

    /// Creates a surface with the given attachments and callbacks.
    ///
    /// `y_inverted` tells the driver the buffer origin is the top-left
    /// corner, which is the X11 convention.
    fn create_surface(
        &self,
        display: DriverDisplay,
        config: DriverConfig,
        attachments: &BufferAttachments,
        y_inverted: bool,
        callbacks: Arc<dyn SurfaceCallbacks>,
    ) -> DriverResult<DriverSurface>;

    /// Destroys a surface. When this returns, all callbacks for the surface
    /// have finished and no new ones will start.
    fn destroy_surface(&self, display: DriverDisplay, surface: DriverSurface);

    /// Copies `src` into `dst` as part of the current context's command
    /// stream. `dst` must be pitch linear.
    fn copy_color_buffer(
        &self,
        display: DriverDisplay,
        src: ColorBufferHandle,
        dst: ColorBufferHandle,
    ) -> DriverResult<()>;

    /// Creates a native-fence sync object in the current context.
    fn create_native_fence(&self, display: DriverDisplay) -> DriverResult<NativeFence>;

    /// Duplicates the fence fd out of a native-fence sync. Flushes the
    /// context first if the fence has no fd yet.
    fn dup_native_fence_fd(&self, display: DriverDisplay, fence: NativeFence) -> DriverResult<OwnedFd>;

    /// Destroys a sync object.
    fn destroy_sync(&self, display: DriverDisplay, fence: NativeFence);

    /// Makes the GPU wait for a fence fd before executing subsequent work
    /// in the current context.
    fn gpu_wait_fd(&self, display: DriverDisplay, fence: BorrowedFd<'_>) -> DriverResult<()>;

    /// Flushes the current context.
    fn flush(&self, display: DriverDisplay);

    /// Finishes (CPU-waits) the current context.
    fn finish(&self, display: DriverDisplay);
}

/// Checks a driver-reported interface version for compatibility.
pub fn interface_version_compatible(major: u16, minor: u16) -> bool {
    major == INTERFACE_MAJOR_VERSION && minor >= INTERFACE_MINOR_VERSION
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable in-memory driver used by unit tests across the crate.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeDriverState {
        pub freed: Vec<ColorBufferHandle>,
        pub copies: Vec<(ColorBufferHandle, ColorBufferHandle)>,
        pub attachments: HashMap<DriverSurface, BufferAttachments>,
        pub finish_calls: u32,
    }

    /// Driver stub that mints handles and records what was done with them.
    #[derive(Debug, Default)]
    pub struct FakeDriver {
        pub(crate) next: AtomicU64,
        pub state: Mutex<FakeDriverState>,
        pub formats: Vec<(DrmFourcc, Vec<(DrmModifier, bool)>)>,
        pub native_fence_sync: bool,
        pub prime_blits: bool,
    }

    impl FakeDriver {
        fn mint(&self) -> u64 {
            self.next.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    impl CallbackSafeOps for FakeDriver {
        fn import_color_buffer(
            &self,
            _display: DriverDisplay,
            _fd: BorrowedFd<'_>,
            _layout: &BufferLayout,
        ) -> DriverResult<ColorBufferHandle> {
            Ok(ColorBufferHandle(self.mint()))
        }

        fn alloc_color_buffer(
            &self,
            _display: DriverDisplay,
            _width: u32,
            _height: u32,
            _fourcc: DrmFourcc,
            _modifier: DrmModifier,
            _force_sysmem: bool,
        ) -> DriverResult<ColorBufferHandle> {
            Ok(ColorBufferHandle(self.mint()))
        }

        fn export_color_buffer(
            &self,
            _display: DriverDisplay,
            _buffer: ColorBufferHandle,
        ) -> DriverResult<ExportedBuffer> {
            Err(DriverError::Unsupported)
        }

        fn free_color_buffer(&self, _display: DriverDisplay, buffer: ColorBufferHandle) {
            self.state.lock().unwrap().freed.push(buffer);
        }

        fn set_color_buffers(
            &self,
            _display: DriverDisplay,
            surface: DriverSurface,
            attachments: &BufferAttachments,
        ) -> DriverResult<()> {
            self.state.lock().unwrap().attachments.insert(surface, *attachments);
            Ok(())
        }
    }

    impl PlatformDriver for FakeDriver {
        fn interface_version(&self) -> (u16, u16) {
            (INTERFACE_MAJOR_VERSION, INTERFACE_MINOR_VERSION)
        }

        fn devices(&self) -> Vec<DriverDevice> {
            vec![DriverDevice(1)]
        }

        fn device_node_path(&self, _device: DriverDevice) -> Option<PathBuf> {
            None
        }

        fn display_for_device(
            &self,
            _device: DriverDevice,
            _master_fd: Option<BorrowedFd<'_>>,
        ) -> DriverResult<DriverDisplay> {
            Ok(DriverDisplay(self.mint()))
        }

        fn initialize_display(&self, _display: DriverDisplay) -> DriverResult<()> {
            Ok(())
        }

        fn terminate_display(&self, _display: DriverDisplay) {}

        fn query_dmabuf_formats(&self, _display: DriverDisplay) -> DriverResult<Vec<DrmFourcc>> {
            Ok(self.formats.iter().map(|(fourcc, _)| *fourcc).collect())
        }

        fn query_dmabuf_modifiers(
            &self,
            _display: DriverDisplay,
            fourcc: DrmFourcc,
        ) -> DriverResult<Vec<(DrmModifier, bool)>> {
            Ok(self
                .formats
                .iter()
                .find(|(code, _)| *code == fourcc)
                .map(|(_, modifiers)| modifiers.clone())
                .unwrap_or_default())
        }

        fn configs(&self, _display: DriverDisplay) -> Vec<DriverConfig> {
            self.formats
                .iter()
                .enumerate()
                .map(|(idx, _)| DriverConfig(idx as u64 + 1))
                .collect()
        }

        fn config_fourcc(&self, _display: DriverDisplay, config: DriverConfig) -> Option<DrmFourcc> {
            self.formats.get(config.0 as usize - 1).map(|(fourcc, _)| *fourcc)
        }

        fn supports_native_fence_sync(&self, _display: DriverDisplay) -> bool {
            self.native_fence_sync
        }

        fn supports_prime_blits(&self) -> bool {
            self.prime_blits
        }

        fn create_surface(
            &self,
            _display: DriverDisplay,
            _config: DriverConfig,
            attachments: &BufferAttachments,
            _y_inverted: bool,
            _callbacks: Arc<dyn SurfaceCallbacks>,
        ) -> DriverResult<DriverSurface> {
            let surface = DriverSurface(self.mint());
            self.state.lock().unwrap().attachments.insert(surface, *attachments);
            Ok(surface)
        }

        fn destroy_surface(&self, _display: DriverDisplay, surface: DriverSurface) {
            self.state.lock().unwrap().attachments.remove(&surface);
        }

        fn copy_color_buffer(
            &self,
            _display: DriverDisplay,
            src: ColorBufferHandle,
            dst: ColorBufferHandle,
        ) -> DriverResult<()> {
            self.state.lock().unwrap().copies.push((src, dst));
            Ok(())
        }

        fn create_native_fence(&self, _display: DriverDisplay) -> DriverResult<NativeFence> {
            Ok(NativeFence(self.mint()))
        }

        fn dup_native_fence_fd(
            &self,
            _display: DriverDisplay,
            _fence: NativeFence,
        ) -> DriverResult<OwnedFd> {
            Err(DriverError::Unsupported)
        }

        fn destroy_sync(&self, _display: DriverDisplay, _fence: NativeFence) {}

        fn gpu_wait_fd(&self, _display: DriverDisplay, _fence: BorrowedFd<'_>) -> DriverResult<()> {
            Ok(())
        }

        fn flush(&self, _display: DriverDisplay) {}

        fn finish(&self, _display: DriverDisplay) {
            self.state.lock().unwrap().finish_calls += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_check_requires_exact_major() {
        assert!(interface_version_compatible(
            INTERFACE_MAJOR_VERSION,
            INTERFACE_MINOR_VERSION
        ));
        assert!(interface_version_compatible(
            INTERFACE_MAJOR_VERSION,
            INTERFACE_MINOR_VERSION + 3
        ));
        assert!(!interface_version_compatible(
            INTERFACE_MAJOR_VERSION + 1,
            INTERFACE_MINOR_VERSION
        ));
    }
}
