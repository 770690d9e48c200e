//! External display records.
//!
//! One [`PlatformDisplay`] corresponds to one EGLDisplay handed to the
//! application. It survives `eglTerminate`/`eglInitialize` cycles; the
//! per-session state lives in the [`DisplayInstance`] it holds while
//! initialized. Access follows the lock order from the concurrency
//! model: the registry lock (in [`Platform`](super::Platform)) is only
//! held for lookups, the per-display instance lock is written by
//! initialize/terminate and read by everything else, and no display-level
//! lock is held while a surface operation blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use slog::info;
use x11rb::rust_connection::RustConnection;

use crate::driver::{DriverConfig, DriverDevice, DriverSurface};
use crate::x11::{
    ConfigRecord, DisplayInstance, InstanceOptions, PixmapSurface, WindowSurface, X11Error,
};

use super::PlatformData;

/// Environment variable requesting render offload onto a secondary GPU.
const OFFLOAD_ENV: &str = "__NV_PRIME_RENDER_OFFLOAD";
/// Environment variable naming the offload device node, e.g.
/// `/dev/dri/card1`.
const OFFLOAD_PROVIDER_ENV: &str = "__NV_PRIME_RENDER_OFFLOAD_PROVIDER";

/// The native display handle an application passed in.
#[derive(Clone)]
pub enum NativeDisplay {
    /// No native handle; connect to the server in `DISPLAY` ourselves.
    Default,
    /// A connection owned by the application (XCB, or the connection
    /// behind an Xlib `Display`).
    Connection {
        /// The shared connection.
        connection: Arc<RustConnection>,
        /// The application's default screen for this connection, if known
        /// (Xlib carries one, plain XCB does not).
        screen: Option<usize>,
        /// Set by the embedder when the application closes the native
        /// display. Xlib reports this through a close hook; XCB has no
        /// equivalent, so the flag simply stays unset there.
        closed: Option<Arc<AtomicBool>>,
    },
}

impl std::fmt::Debug for NativeDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeDisplay::Default => f.write_str("Default"),
            NativeDisplay::Connection { screen, .. } => {
                f.debug_struct("Connection").field("screen", screen).finish_non_exhaustive()
            }
        }
    }
}

impl NativeDisplay {
    fn is_closed(&self) -> bool {
        match self {
            NativeDisplay::Default => false,
            NativeDisplay::Connection { closed, .. } => closed
                .as_ref()
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false),
        }
    }
}

/// Attributes accepted by display creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisplayAttributes {
    /// The screen number attribute, highest-precedence screen selection.
    pub screen: Option<usize>,
}

/// One external EGL display.
pub struct PlatformDisplay {
    data: Arc<PlatformData>,
    native: NativeDisplay,
    /// `DISPLAY` as it was when the display was created; later connects
    /// and screen fallbacks use this snapshot, not the live environment.
    display_env: Option<String>,
    attributes: DisplayAttributes,
    instance: RwLock<Option<Arc<DisplayInstance>>>,
    surfaces: Mutex<Vec<Surface>>,
    log: slog::Logger,
}

impl std::fmt::Debug for PlatformDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformDisplay")
            .field("native", &self.native)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum Surface {
    Window(Arc<WindowSurface>),
    Pixmap(Arc<PixmapSurface>),
}

impl Surface {
    fn handle(&self) -> Option<DriverSurface> {
        match self {
            Surface::Window(window) => window.driver_surface(),
            Surface::Pixmap(pixmap) => pixmap.driver_surface(),
        }
    }

    fn destroy(&self) {
        match self {
            Surface::Window(window) => window.destroy(),
            Surface::Pixmap(pixmap) => pixmap.destroy(),
        }
    }
}

impl PlatformDisplay {
    pub(super) fn new(
        data: Arc<PlatformData>,
        native: NativeDisplay,
        attributes: DisplayAttributes,
    ) -> PlatformDisplay {
        let log = data.log().clone();
        PlatformDisplay {
            data,
            native,
            display_env: std::env::var("DISPLAY").ok(),
            attributes,
            instance: RwLock::new(None),
            surfaces: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Whether this record answers for the given native handle and
    /// attributes. A closed native display never matches again, even if
    /// the allocator hands a new connection the same address.
    pub(super) fn is_same(&self, native: &NativeDisplay, attributes: &DisplayAttributes) -> bool {
        if self.native.is_closed() {
            return false;
        }
        if self.attributes != *attributes {
            return false;
        }
        match (&self.native, native) {
            (NativeDisplay::Default, NativeDisplay::Default) => true,
            (
                NativeDisplay::Connection { connection: a, .. },
                NativeDisplay::Connection { connection: b, .. },
            ) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Opens (or borrows) the connection and resolves the screen number:
    /// attribute, then caller-provided screen, then the display string,
    /// then 0.
    fn connect(&self) -> Result<(Arc<RustConnection>, bool, usize), X11Error> {
        match &self.native {
            NativeDisplay::Default => {
                let (connection, default_screen) =
                    RustConnection::connect(self.display_env.as_deref())?;
                let screen = self.attributes.screen.unwrap_or(default_screen);
                Ok((Arc::new(connection), true, screen))
            }
            NativeDisplay::Connection { connection, screen, .. } => {
                let resolved = self
                    .attributes
                    .screen
                    .or(*screen)
                    .or_else(|| {
                        let parsed = x11rb::reexports::x11rb_protocol::parse_display::parse_display(
                            self.display_env.as_deref(),
                        )
                        .ok()?;
                        Some(parsed.screen as usize)
                    })
                    .unwrap_or(0);
                Ok((connection.clone(), false, resolved))
            }
        }
    }

    fn instance_options(&self) -> InstanceOptions {
        let allow_offload = std::env::var(OFFLOAD_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<i32>().ok())
            .map(|value| value != 0)
            .unwrap_or(false);

        let requested_device: Option<DriverDevice> = std::env::var(OFFLOAD_PROVIDER_ENV)
            .ok()
            .map(std::path::PathBuf::from)
            .and_then(|node| {
                let driver = self.data.driver();
                driver
                    .devices()
                    .into_iter()
                    .find(|dev| driver.device_node_path(*dev).as_ref() == Some(&node))
            });

        InstanceOptions {
            // Naming a provider implies offload even without the flag.
            allow_offload: allow_offload || requested_device.is_some(),
            requested_device,
        }
    }

    /// Creates and immediately drops an instance, verifying that the
    /// server is one this library can drive at all.
    pub(super) fn probe(&self) -> Result<(), X11Error> {
        let (connection, owned, screen) = self.connect()?;
        DisplayInstance::new(self.data.clone(), connection, owned, screen, self.instance_options())?;
        Ok(())
    }

    /// Initializes the display session. Initializing an already
    /// initialized display succeeds without building a new session,
    /// matching reference-tracked EGL semantics.
    pub fn initialize(&self) -> Result<(), X11Error> {
        if self.native.is_closed() {
            return Err(X11Error::NativeDisplayClosed);
        }

        let mut slot = self.instance.write().unwrap();
        if slot.is_some() {
            return Ok(());
        }

        let (connection, owned, screen) = self.connect()?;
        *slot = Some(DisplayInstance::new(
            self.data.clone(),
            connection,
            owned,
            screen,
            self.instance_options(),
        )?);
        Ok(())
    }

    /// Terminates the session: destroys remaining surfaces and drops the
    /// instance. Terminating an uninitialized display is a successful
    /// no-op. Surfaces still referenced elsewhere keep the instance's
    /// resources alive until they are destroyed.
    pub fn terminate(&self) {
        let surfaces: Vec<Surface> = self.surfaces.lock().unwrap().drain(..).collect();
        for surface in &surfaces {
            surface.destroy();
        }

        let previous = self.instance.write().unwrap().take();
        if previous.is_some() {
            info!(self.log, "Terminated X11 display");
        }
    }

    /// Whether the display currently has an initialized session.
    pub fn is_initialized(&self) -> bool {
        self.instance.read().unwrap().is_some()
    }

    /// The active session, for callers that need direct access (tests,
    /// config queries).
    pub fn instance(&self) -> Result<Arc<DisplayInstance>, X11Error> {
        self.instance
            .read()
            .unwrap()
            .clone()
            .ok_or(X11Error::NotInitialized)
    }

    /// The config records of the initialized display.
    pub fn configs(&self) -> Result<Vec<ConfigRecord>, X11Error> {
        Ok(self.instance()?.configs().to_vec())
    }

    /// Creates a window surface for `config` on `window`.
    pub fn create_window_surface(
        &self,
        config: DriverConfig,
        window: u32,
    ) -> Result<DriverSurface, X11Error> {
        let instance = self.instance()?;
        let record = *instance
            .find_config(config)
            .ok_or(X11Error::BadMatch("unknown config"))?;

        let surface = WindowSurface::create(&instance, &record, window)?;
        let handle = surface.driver_surface().expect("surface creation sets the handle");
        self.surfaces.lock().unwrap().push(Surface::Window(surface));
        Ok(handle)
    }

    /// Creates a pixmap surface for `config` on `pixmap`.
    pub fn create_pixmap_surface(
        &self,
        config: DriverConfig,
        pixmap: u32,
    ) -> Result<DriverSurface, X11Error> {
        let instance = self.instance()?;
        let record = *instance
            .find_config(config)
            .ok_or(X11Error::BadMatch("unknown config"))?;

        let surface = PixmapSurface::create(&instance, &record, pixmap)?;
        let handle = surface.driver_surface().expect("surface creation sets the handle");
        self.surfaces.lock().unwrap().push(Surface::Pixmap(surface));
        Ok(handle)
    }

    /// Destroys a surface by handle. Unknown handles are ignored, the
    /// application may race a destroy against a terminate.
    pub fn destroy_surface(&self, handle: DriverSurface) {
        let surface = {
            let mut surfaces = self.surfaces.lock().unwrap();
            match surfaces.iter().position(|s| s.handle() == Some(handle)) {
                Some(index) => Some(surfaces.swap_remove(index)),
                None => None,
            }
        };
        if let Some(surface) = surface {
            surface.destroy();
        }
    }

    /// Swaps the window surface behind `handle`.
    ///
    /// The surface is looked up and cloned out under the lock, and the
    /// swap itself runs without any display-level lock held: swap may
    /// block on the server, and nothing else should have to wait for it.
    pub fn swap_buffers(&self, handle: DriverSurface) -> Result<(), X11Error> {
        let surface = {
            let surfaces = self.surfaces.lock().unwrap();
            surfaces.iter().find_map(|s| match s {
                Surface::Window(window) if window.driver_surface() == Some(handle) => {
                    Some(window.clone())
                }
                _ => None,
            })
        };

        match surface {
            Some(window) => window.swap_buffers(),
            // Pixmap surfaces accept eglSwapBuffers as a no-op.
            None => Ok(()),
        }
    }

    /// `eglSwapBuffersWithDamage`: the damage rectangles are accepted for
    /// interface completeness but not forwarded yet; Present updates the
    /// whole window either way, the rects are only ever an optimization
    /// hint.
    pub fn swap_buffers_with_damage(
        &self,
        handle: DriverSurface,
        _rects: &[(i32, i32, u32, u32)],
    ) -> Result<(), X11Error> {
        self.swap_buffers(handle)
    }

    /// Sets the swap interval of a window surface.
    pub fn swap_interval(&self, handle: DriverSurface, interval: i32) {
        let surfaces = self.surfaces.lock().unwrap();
        for surface in surfaces.iter() {
            if let Surface::Window(window) = surface {
                if window.driver_surface() == Some(handle) {
                    window.set_swap_interval(interval);
                    return;
                }
            }
        }
    }

    /// `eglWaitGL`: finish client rendering on the display's context.
    pub fn wait_gl(&self) -> Result<(), X11Error> {
        let instance = self.instance()?;
        self.data.driver().finish(instance.driver_display);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FakeDriver;
    use crate::platform::Platform;

    fn test_display(native: NativeDisplay, attributes: DisplayAttributes) -> PlatformDisplay {
        let platform = Platform::new(Arc::new(FakeDriver::default()), None).unwrap();
        PlatformDisplay::new(platform.data.clone(), native, attributes)
    }

    /// Terminating a display that is not initialized (or was already
    /// terminated) is a successful no-op, any number of times.
    #[test]
    fn terminate_is_idempotent() {
        let display = test_display(NativeDisplay::Default, DisplayAttributes::default());
        assert!(!display.is_initialized());
        display.terminate();
        display.terminate();
        assert!(!display.is_initialized());
        assert!(matches!(display.instance(), Err(X11Error::NotInitialized)));
    }

    #[test]
    fn entry_points_require_initialization() {
        let display = test_display(NativeDisplay::Default, DisplayAttributes::default());
        assert!(display.configs().is_err());
        assert!(display
            .create_window_surface(DriverConfig(1), 0x123)
            .is_err());
        // Swapping an unknown surface is tolerated; the surface may have
        // been destroyed by a concurrent terminate.
        assert!(display.swap_buffers(DriverSurface(7)).is_ok());
    }

    #[test]
    fn default_displays_with_same_screen_match() {
        let display = test_display(
            NativeDisplay::Default,
            DisplayAttributes { screen: Some(1) },
        );
        assert!(display.is_same(&NativeDisplay::Default, &DisplayAttributes { screen: Some(1) }));
        assert!(!display.is_same(&NativeDisplay::Default, &DisplayAttributes { screen: Some(0) }));
        assert!(!display.is_same(&NativeDisplay::Default, &DisplayAttributes { screen: None }));
    }

    /// Offload env parsing: the provider variable implies offload.
    #[test]
    fn offload_env_is_parsed() {
        let display = test_display(NativeDisplay::Default, DisplayAttributes::default());

        std::env::remove_var(OFFLOAD_ENV);
        std::env::remove_var(OFFLOAD_PROVIDER_ENV);
        assert!(!display.instance_options().allow_offload);

        std::env::set_var(OFFLOAD_ENV, "1");
        assert!(display.instance_options().allow_offload);

        std::env::set_var(OFFLOAD_ENV, "0");
        assert!(!display.instance_options().allow_offload);
        std::env::remove_var(OFFLOAD_ENV);
    }
}
