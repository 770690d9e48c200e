//! The per-display core.
//!
//! A [`DisplayInstance`] is created by `eglInitialize` and torn down by
//! `eglTerminate`. Everything in it is immutable after creation, which is
//! what makes the driver's update callback safe: the callback may read
//! the instance through its `Arc` without taking any display-level lock.
//! Surfaces hold strong references, so an instance outlives a terminate
//! that races against an in-flight surface operation.

mod buffer;
mod device;
mod error;
#[macro_use]
mod extension;
mod formats;
mod pixmap;
mod sync;
mod timeline;
mod window;

pub use self::buffer::{BufferStatus, ColorBuffer};
pub use self::device::{is_nvidia_device, DrmDeviceFd};
pub use self::error::{
    AllocateBuffersError, DeviceMismatchError, MissingExtensionError, NotSupportedError, X11Error,
};
pub use self::formats::{ConfigRecord, DriverFormat, FormatTable, SurfaceTypes};
pub use self::pixmap::PixmapSurface;
pub(crate) use self::sync::ImplicitSync;
pub use self::timeline::Timeline;
pub use self::window::{
    negotiate, BufferPool, FrameTracker, Negotiated, WindowSurface, MAX_COLOR_BUFFERS,
    MAX_PENDING_FRAMES, MAX_PRIME_BUFFERS,
};

use std::os::unix::io::{AsFd as _, AsRawFd as _};
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use slog::{info, o};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::Screen;
use x11rb::rust_connection::RustConnection;

use crate::driver::DriverDevice;
use crate::format;
use crate::platform::PlatformData;

use self::extension::{reject_native_nvidia_server, Extensions};
use self::window::EventRouter;

/// Caller-controlled knobs for display initialization.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceOptions {
    /// A specific rendering device the caller asked for.
    pub requested_device: Option<DriverDevice>,
    /// Whether picking an NVIDIA device behind a non-NVIDIA server
    /// ("render offload") is allowed.
    pub allow_offload: bool,
}

/// Everything one initialized display session owns.
///
/// Reference counted; the last surface or external display reference
/// dropping it closes the device and, for connections we opened
/// ourselves, the wire connection.
pub struct DisplayInstance {
    pub(crate) platform: Arc<PlatformData>,
    pub(crate) connection: Arc<RustConnection>,
    pub(crate) owns_connection: bool,
    pub(crate) screen_number: usize,
    pub(crate) screen: Screen,

    pub(crate) device: DrmDeviceFd,
    /// libgbm is not thread-safe; every allocation takes this lock.
    pub(crate) gbm: std::sync::Mutex<gbm::Device<DrmDeviceFd>>,
    pub(crate) driver_device: DriverDevice,
    pub(crate) driver_display: crate::driver::DriverDisplay,

    pub(crate) force_prime: bool,
    pub(crate) supports_prime: bool,
    pub(crate) supports_implicit_sync: bool,
    pub(crate) supports_explicit_sync: bool,
    pub(crate) supports_native_fence_sync: bool,

    pub(crate) formats: FormatTable,
    configs: Vec<ConfigRecord>,
    pub(crate) extensions: Extensions,
    pub(crate) events: EventRouter,
    pub(crate) log: slog::Logger,
}

impl std::fmt::Debug for DisplayInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayInstance")
            .field("screen", &self.screen_number)
            .field("owns_connection", &self.owns_connection)
            .field("extensions", &self.extensions)
            .field("force_prime", &self.force_prime)
            .field("supports_explicit_sync", &self.supports_explicit_sync)
            .finish()
    }
}

impl DisplayInstance {
    /// Probes the server and the driver and assembles a display instance.
    ///
    /// `screen_number` must already be resolved (attribute, caller value,
    /// `DISPLAY` fallback); this function validates it against the setup.
    pub fn new(
        platform: Arc<PlatformData>,
        connection: Arc<RustConnection>,
        owns_connection: bool,
        screen_number: usize,
        options: InstanceOptions,
    ) -> Result<Arc<DisplayInstance>, X11Error> {
        let log = platform.log().new(o!("x11_screen" => screen_number));

        let screen = connection
            .setup()
            .roots
            .get(screen_number)
            .cloned()
            .ok_or(X11Error::InvalidScreen(screen_number))?;

        // Everything below depends on passing file descriptors over the
        // wire, which needs a local socket.
        let stream_fd = connection.stream().as_fd().as_raw_fd();
        nix::sys::socket::getsockname::<nix::sys::socket::UnixAddr>(stream_fd)
            .map_err(|_| NotSupportedError::NotUnixSocket)?;

        reject_native_nvidia_server(connection.as_ref())?;
        let extensions = Extensions::check_extensions(connection.as_ref(), &log)?;

        // Which device does the server composite from?
        let open = connection.dri3_open(screen.root, 0)?.reply()?;
        device::set_cloexec(open.device_fd.as_fd()).map_err(AllocateBuffersError::from)?;
        let server_device = DrmDeviceFd::new(open.device_fd);
        let server_is_nvidia = is_nvidia_device(&server_device);

        let driver = platform.driver();
        let server_node = server_device.primary_node_path();
        let server_driver_device = server_node.as_ref().and_then(|node| {
            driver
                .devices()
                .into_iter()
                .find(|dev| driver.device_node_path(*dev).as_ref() == Some(node))
        });

        let mut supports_implicit_sync = false;
        let mut force_prime = false;

        let (driver_device, device) = if server_is_nvidia {
            let matched = server_driver_device.ok_or(DeviceMismatchError::NoDevice)?;
            if let Some(requested) = options.requested_device {
                if requested != matched {
                    // Copying between two discrete NVIDIA GPUs through a
                    // linear buffer would be all cost and no benefit.
                    return Err(DeviceMismatchError::NvidiaToNvidia.into());
                }
            }
            (matched, server_device.clone())
        } else {
            let chosen = match options.requested_device {
                Some(requested) => {
                    if !driver.devices().contains(&requested) {
                        return Err(DeviceMismatchError::NoSuchDevice.into());
                    }
                    requested
                }
                None if options.allow_offload => *driver
                    .devices()
                    .first()
                    .ok_or(DeviceMismatchError::NoDevice)?,
                None => return Err(NotSupportedError::ServerNotNvidia.into()),
            };

            let node = driver
                .device_node_path(chosen)
                .ok_or(DeviceMismatchError::NoSuchDevice)?;
            let device = DrmDeviceFd::open(&node).map_err(AllocateBuffersError::from)?;
            supports_implicit_sync = true;
            force_prime = true;
            (chosen, device)
        };

        let gbm = gbm::Device::new(device.clone()).map_err(AllocateBuffersError::OpenDevice)?;

        let driver_display = driver.display_for_device(
            driver_device,
            if server_is_nvidia {
                Some(device.as_fd())
            } else {
                None
            },
        )?;
        driver.initialize_display(driver_display)?;

        let supports_native_fence_sync = driver.supports_native_fence_sync(driver_display);
        let mut supports_prime =
            driver.supports_prime_blits() && supports_native_fence_sync && !server_is_nvidia;

        let probed = (|| -> Result<FormatTable, X11Error> {
            let formats = FormatTable::query(driver, driver_display)?;
            if formats.is_empty() {
                return Err(X11Error::BadMatch("the driver reported no usable formats"));
            }

            // One probe format tells us whether the server and this
            // device can share buffers directly, and whether linear PRIME
            // buffers are even presentable.
            let probe = format::info(DrmFourcc::Xrgb8888).expect("probe format is always known");
            let (window_mods, screen_mods) =
                formats::server_supported_modifiers(connection.as_ref(), screen.root, probe)?;
            let mut server_modifiers = screen_mods;
            server_modifiers.extend(window_mods);

            let supports_linear = server_modifiers.contains(&DrmModifier::Linear);
            let supports_direct = formats
                .find(DrmFourcc::Xrgb8888)
                .map(|fmt| fmt.renderable.iter().any(|m| server_modifiers.contains(m)))
                .unwrap_or(false);

            if !supports_linear {
                supports_prime = false;
            }
            if !supports_direct {
                force_prime = true;
            }
            if force_prime && !supports_prime {
                return Err(NotSupportedError::NoPresentationPath.into());
            }
            Ok(formats)
        })();

        let formats = match probed {
            Ok(formats) => formats,
            Err(err) => {
                driver.terminate_display(driver_display);
                return Err(err);
            }
        };

        let supports_explicit_sync = supports_native_fence_sync
            && extensions.supports_syncobj_requests()
            && device.supports_syncobj_timeline();

        let configs = formats::build_config_list(driver, driver_display, &formats, &screen.allowed_depths);

        info!(
            log,
            "Initialized X11 display";
            "connection" => if owns_connection { "owned" } else { "borrowed" },
            "server_nvidia" => server_is_nvidia,
            "force_prime" => force_prime,
            "explicit_sync" => supports_explicit_sync,
        );

        Ok(Arc::new(DisplayInstance {
            platform,
            connection,
            owns_connection,
            screen_number,
            screen,
            device,
            gbm: std::sync::Mutex::new(gbm),
            driver_device,
            driver_display,
            force_prime,
            supports_prime,
            supports_implicit_sync,
            supports_explicit_sync,
            supports_native_fence_sync,
            formats,
            configs,
            extensions,
            events: EventRouter::new(),
            log,
        }))
    }

    /// The screen this display talks to.
    pub fn screen_number(&self) -> usize {
        self.screen_number
    }

    /// The config records built for this display.
    pub fn configs(&self) -> &[ConfigRecord] {
        &self.configs
    }

    /// The rendering device selected for this display.
    pub fn driver_device(&self) -> DriverDevice {
        self.driver_device
    }

    /// Whether frames must always take the PRIME path on this display.
    pub fn force_prime(&self) -> bool {
        self.force_prime
    }

    /// Looks up a config record by its driver handle.
    pub fn find_config(&self, config: crate::driver::DriverConfig) -> Option<&ConfigRecord> {
        self.configs.iter().find(|record| record.driver_config == config)
    }

    /// Checks a native pixmap against a config by asking the server for
    /// its depth and bpp. Used by config selection with a native pixmap.
    pub fn config_matches_pixmap(
        &self,
        record: &ConfigRecord,
        pixmap: u32,
    ) -> Result<bool, X11Error> {
        let reply = self
            .connection
            .dri3_buffers_from_pixmap(pixmap)?
            .reply()
            .map_err(|_| X11Error::BadNativePixmap("invalid pixmap id"))?;
        Ok(record.matches_native_pixmap(reply.depth, reply.bpp))
    }
}

impl Drop for DisplayInstance {
    fn drop(&mut self) {
        self.platform.driver().terminate_display(self.driver_display);
    }
}
