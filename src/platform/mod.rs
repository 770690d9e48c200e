//! Platform bookkeeping shared by all displays.
//!
//! [`Platform`] is the embedder's entry point: it validates the driver's
//! interface version once, owns the registry of external displays, and
//! carries the process-scoped pieces of state (the implicit-sync support
//! latch) that the original implementation kept in free globals. Keeping
//! them here instead makes every test run against fresh state.

mod display;

pub use display::{DisplayAttributes, NativeDisplay, PlatformDisplay};

use std::sync::{Arc, Mutex};

use crate::driver::{interface_version_compatible, CallbackSafeOps, PlatformDriver};
use crate::x11::X11Error;

pub(crate) use crate::x11::ImplicitSync;

/// Errors from platform construction.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The driver implements an incompatible platform-surface interface.
    #[error("incompatible driver interface version {major}.{minor}")]
    IncompatibleDriver {
        /// Major version the driver reported.
        major: u16,
        /// Minor version the driver reported.
        minor: u16,
    },
}

/// State shared between the platform, its displays, and their surfaces.
pub struct PlatformData {
    driver: Arc<dyn PlatformDriver>,
    safe_ops: Arc<dyn CallbackSafeOps>,
    pub(crate) implicit_sync: ImplicitSync,
    log: slog::Logger,
}

impl std::fmt::Debug for PlatformData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformData").finish_non_exhaustive()
    }
}

impl PlatformData {
    /// The full driver interface, for platform entry points.
    pub(crate) fn driver(&self) -> &dyn PlatformDriver {
        self.driver.as_ref()
    }

    /// The callback-safe subset, for everything that may run under the
    /// driver's window-system lock.
    pub(crate) fn safe_ops(&self) -> &dyn CallbackSafeOps {
        self.safe_ops.as_ref()
    }

    pub(crate) fn log(&self) -> &slog::Logger {
        &self.log
    }
}

/// The loaded platform: driver handle plus the display registry.
#[derive(Debug)]
pub struct Platform {
    data: Arc<PlatformData>,
    displays: Mutex<Vec<Arc<PlatformDisplay>>>,
}

impl Platform {
    /// Wraps a driver after checking its interface version.
    pub fn new<D, L>(driver: Arc<D>, logger: L) -> Result<Platform, PlatformError>
    where
        D: PlatformDriver + 'static,
        L: Into<Option<slog::Logger>>,
    {
        let log = crate::slog_or_fallback(logger).new(slog::o!("module" => "egl_x11_bridge"));

        let (major, minor) = driver.interface_version();
        if !interface_version_compatible(major, minor) {
            return Err(PlatformError::IncompatibleDriver { major, minor });
        }

        let safe_ops: Arc<dyn CallbackSafeOps> = driver.clone();
        let driver: Arc<dyn PlatformDriver> = driver;

        Ok(Platform {
            data: Arc::new(PlatformData {
                driver,
                safe_ops,
                implicit_sync: ImplicitSync::new(),
                log,
            }),
            displays: Mutex::new(Vec::new()),
        })
    }

    /// Finds or creates the external display for a native handle.
    ///
    /// A matching display that was handed out before is returned again
    /// (`eglGetPlatformDisplay` semantics). New displays get a probe
    /// initialization to verify the server before the handle is exposed,
    /// so an unsupported server fails here rather than in `eglInitialize`.
    pub fn get_display(
        &self,
        native: NativeDisplay,
        attributes: DisplayAttributes,
    ) -> Result<Arc<PlatformDisplay>, X11Error> {
        let mut displays = self.displays.lock().unwrap();

        if let Some(existing) = displays.iter().find(|d| d.is_same(&native, &attributes)) {
            return Ok(existing.clone());
        }

        let display = Arc::new(PlatformDisplay::new(self.data.clone(), native, attributes));
        display.probe()?;
        displays.push(display.clone());
        Ok(display)
    }

    /// Drops the registry. Displays stay alive while the embedder holds
    /// references, but no future `get_display` will find them.
    pub fn cleanup(&self) {
        self.displays.lock().unwrap().clear();
    }
}
