#![warn(missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like EGL
#![allow(clippy::upper_case_acronyms)]

//! **egl-x11-bridge: present EGL-rendered buffers into X11**
//!
//! This library is the window-system half of an EGL implementation for X11
//! servers that speak DRI3 1.2+ and Present 1.2+ (in practice: XWayland and
//! modesetting-based servers). The EGL driver renders into color buffers that
//! this library allocates through [gbm](::gbm); finished frames are shared
//! with the server as dma-buf file descriptors and displayed with the Present
//! extension. Synchronization uses DRM timeline syncobjs where the server
//! supports them, implicit dma-buf fences otherwise, and a CPU wait as the
//! last resort. When the rendering device is not the device the server scans
//! out from, frames are blitted into linear buffers first ("PRIME").
//!
//! The driver side of the contract is expressed by the traits in [`driver`]:
//! the embedder supplies an implementation and receives update/damage
//! callbacks on its own threads. [`platform`] holds the display bookkeeping
//! that outlives individual initialize/terminate cycles, and [`x11`] contains
//! the per-display core: format/config registries, the window presenter, and
//! the pixmap presenter.
//!
//! Most entry points take an optional [`slog::Logger`](::slog::Logger) as
//! argument that will be used as a drain for logging. If `None` is provided,
//! the behavior depends on whether the `slog-stdlog` feature is enabled. If
//! yes, logs go to the global logger of the `log` crate. If not, they are
//! discarded.

pub mod driver;
pub mod format;
pub mod platform;
pub mod x11;

#[cfg(feature = "slog-stdlog")]
#[allow(dead_code)]
fn slog_or_fallback<L>(logger: L) -> ::slog::Logger
where
    L: Into<Option<::slog::Logger>>,
{
    use slog::Drain;
    logger
        .into()
        .unwrap_or_else(|| ::slog::Logger::root(::slog_stdlog::StdLog.fuse(), slog::o!()))
}

#[cfg(not(feature = "slog-stdlog"))]
#[allow(dead_code)]
fn slog_or_fallback<L>(logger: L) -> ::slog::Logger
where
    L: Into<Option<::slog::Logger>>,
{
    logger
        .into()
        .unwrap_or_else(|| ::slog::Logger::root(::slog::Discard, slog::o!()))
}
