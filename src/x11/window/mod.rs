//! The window presenter.
//!
//! One [`WindowSurface`] drives presentation for one X11 window: it owns
//! the buffer pools, the Present event context, and the per-window state
//! machine that swap-buffers, the event pump, and the driver's update and
//! damage callbacks all act on.
//!
//! Locking is deliberately narrow. The driver invokes the update and
//! damage callbacks on its own threads while holding its internal
//! window-system lock, so those paths take only the presenter mutex and
//! talk to the driver exclusively through [`CallbackSafeOps`]. Swap
//! buffers runs for the calling thread's current surface and may use the
//! full driver interface, but it too drops the presenter mutex before any
//! wait that can outlast a wire round-trip.

mod events;
mod frames;
mod negotiate;
mod pool;

pub use self::frames::{FrameTracker, MAX_PENDING_FRAMES};
pub use self::negotiate::{negotiate, Negotiated};
pub use self::pool::{BufferPool, MAX_COLOR_BUFFERS, MAX_PRIME_BUFFERS};

pub(crate) use self::events::{EventQueue, EventRouter};

use std::os::unix::io::{AsFd as _, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use drm_fourcc::{DrmFourcc, DrmModifier};
use slog::{info, o, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, Window};

use crate::driver::{BufferAttachments, CallbackSafeOps, DamageFlags, DriverSurface, SurfaceCallbacks};
use crate::format::FormatInfo;

use self::events::{apply_event, PresentState, SyncMode, EVENT_WAIT_SLICE};
use super::buffer::ColorBuffer;
use super::error::X11Error;
use super::formats::{server_supported_modifiers, ConfigRecord, SurfaceTypes};
use super::timeline::{wait_any_available, Timeline};
use super::{sync, DisplayInstance};

/// Which of a window's two pools an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Render,
    Prime,
}

#[derive(Debug)]
struct WindowState {
    driver_surface: Option<DriverSurface>,
    info: &'static FormatInfo,
    fourcc: DrmFourcc,

    width: u16,
    height: u16,
    /// Candidate modifiers from negotiation. The first allocation lets the
    /// allocator choose among them; the choice is then pinned so all
    /// buffers of a pool generation share one layout.
    modifiers: Vec<DrmModifier>,
    chosen_modifier: Option<DrmModifier>,
    prime: bool,
    sync: SyncMode,
    swap_interval: u32,
    caps_async: bool,

    event_id: u32,
    pool: BufferPool,
    prime_pool: BufferPool,
    front: Option<usize>,
    back: Option<usize>,
    prime_current: Option<usize>,

    present: PresentState,
    deleted: bool,
}

impl WindowState {
    fn attachments(&self) -> BufferAttachments {
        BufferAttachments {
            front: self.front.map(|idx| self.pool.get(idx).driver_buffer),
            back: self.back.map(|idx| self.pool.get(idx).driver_buffer),
            blit_target: self.prime_current.map(|idx| self.prime_pool.get(idx).driver_buffer),
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut BufferPool {
        match kind {
            PoolKind::Render => &mut self.pool,
            PoolKind::Prime => &mut self.prime_pool,
        }
    }

    fn pool_ref(&self, kind: PoolKind) -> &BufferPool {
        match kind {
            PoolKind::Render => &self.pool,
            PoolKind::Prime => &self.prime_pool,
        }
    }
}

/// Presenter for one X11 window surface.
pub struct WindowSurface {
    display: Arc<DisplayInstance>,
    window: Window,
    queue: Arc<EventQueue>,
    /// Non-zero while a platform entry point is active on this surface;
    /// the update callback then does nothing, the entry point will leave
    /// the surface consistent itself.
    skip_update_callback: AtomicUsize,
    state: Mutex<WindowState>,
    log: slog::Logger,
}

impl std::fmt::Debug for WindowSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowSurface").field("window", &self.window).finish()
    }
}

impl WindowSurface {
    /// Creates the presenter and the driver surface for `window`.
    pub fn create(
        display: &Arc<DisplayInstance>,
        config: &ConfigRecord,
        window: Window,
    ) -> Result<Arc<WindowSurface>, X11Error> {
        if !config.surface_types.contains(SurfaceTypes::WINDOW) {
            return Err(X11Error::BadMatch("config does not support window surfaces"));
        }
        let fourcc = config.fourcc.expect("window-capable config always has a format");
        let format = display
            .formats
            .find(fourcc)
            .ok_or(X11Error::BadMatch("config format not supported by the driver"))?;
        let log = display.log.new(o!("window" => window));

        let connection = &display.connection;

        let negotiated = if display.force_prime {
            negotiate(&format.renderable, None, &[], display.supports_prime, true)
        } else {
            let (window_mods, screen_mods) = server_supported_modifiers(connection.as_ref(), window, format.info)?;
            negotiate(
                &format.renderable,
                Some(&window_mods),
                &screen_mods,
                display.supports_prime,
                false,
            )
        }
        .ok_or(X11Error::BadMatch("no common format modifiers for this window"))?;

        let caps = connection.present_query_capabilities(window)?.reply()?.capabilities;
        let caps_async = caps & u32::from(present::Capability::ASYNC) != 0;
        let use_explicit_sync =
            display.supports_explicit_sync && caps & u32::from(present::Capability::SYNCOBJ) != 0;

        let sync_mode = if use_explicit_sync {
            SyncMode::Explicit
        } else if display.supports_implicit_sync {
            SyncMode::Implicit
        } else {
            SyncMode::NoSync
        };

        // Events first, geometry second: a resize between the two ends up
        // in our queue instead of getting lost.
        let queue = Arc::new(EventQueue::default());
        display.events.register(window, queue.clone());

        let event_id = match connection.generate_id() {
            Ok(id) => id,
            Err(err) => {
                display.events.unregister(window);
                return Err(err.into());
            }
        };
        let mut event_mask = present::EventMask::CONFIGURE_NOTIFY | present::EventMask::COMPLETE_NOTIFY;
        if sync_mode != SyncMode::Explicit {
            event_mask = event_mask | present::EventMask::IDLE_NOTIFY;
        }

        let setup = (|| -> Result<(u16, u16), X11Error> {
            connection.present_select_input(event_id, window, event_mask)?;

            let attributes = connection
                .get_window_attributes(window)?
                .reply()
                .map_err(|_| X11Error::BadNativeWindow("invalid window id"))?;
            if Some(attributes.visual) != config.native_visual {
                return Err(X11Error::BadMatch("window visual does not match the config"));
            }

            let geometry = connection
                .get_geometry(window)?
                .reply()
                .map_err(|_| X11Error::BadNativeWindow("invalid window id"))?;
            if geometry.root != display.screen.root {
                return Err(X11Error::BadNativeWindow("window is on a different screen"));
            }
            if geometry.width == 0 || geometry.height == 0 {
                return Err(X11Error::BadNativeWindow("window has no size"));
            }
            Ok((geometry.width, geometry.height))
        })();

        let (width, height) = match setup {
            Ok(size) => size,
            Err(err) => {
                display.events.unregister(window);
                return Err(err);
            }
        };

        let mut state = WindowState {
            driver_surface: None,
            info: format.info,
            fourcc,
            width,
            height,
            modifiers: negotiated.render_modifiers,
            chosen_modifier: None,
            prime: negotiated.prime,
            sync: sync_mode,
            swap_interval: 1,
            caps_async,
            event_id,
            pool: BufferPool::new(MAX_COLOR_BUFFERS),
            prime_pool: BufferPool::new(MAX_PRIME_BUFFERS),
            front: None,
            back: None,
            prime_current: None,
            present: PresentState {
                pending_width: width,
                pending_height: height,
                ..Default::default()
            },
            deleted: false,
        };

        let prime = state.prime;
        if let Err(err) = initial_buffers(display, &mut state) {
            for buffer in state.pool.drain().into_iter().chain(state.prime_pool.drain()) {
                buffer.destroy(
                    display.connection.as_ref(),
                    &display.device,
                    display.platform.safe_ops(),
                    display.driver_display,
                );
            }
            display.events.unregister(window);
            return Err(err);
        }
        let attachments = state.attachments();

        let surface = Arc::new(WindowSurface {
            display: display.clone(),
            window,
            queue,
            skip_update_callback: AtomicUsize::new(0),
            state: Mutex::new(state),
            log,
        });

        let created = surface.display.platform.driver().create_surface(
            display.driver_display,
            config.driver_config,
            &attachments,
            true,
            surface.clone() as Arc<dyn SurfaceCallbacks>,
        );

        match created {
            Ok(driver_surface) => {
                surface.state.lock().unwrap().driver_surface = Some(driver_surface);
                info!(
                    surface.log,
                    "Created window surface";
                    "size" => format!("{}x{}", width, height),
                    "prime" => prime,
                    "sync" => ?sync_mode,
                );
                Ok(surface)
            }
            Err(err) => {
                surface.release_resources();
                Err(err.into())
            }
        }
    }

    /// The XID this surface presents to.
    pub fn window(&self) -> Window {
        self.window
    }

    /// The driver surface handle, once created.
    pub fn driver_surface(&self) -> Option<DriverSurface> {
        self.state.lock().unwrap().driver_surface
    }

    /// Sets the swap interval; zero (or lower, clamped) selects async
    /// presents when the server supports them.
    pub fn set_swap_interval(&self, interval: i32) {
        self.state.lock().unwrap().swap_interval = interval.max(0) as u32;
    }

    /// Whether a suboptimal-copy notification is pending a re-check.
    pub fn needs_modifier_check(&self) -> bool {
        self.state.lock().unwrap().present.needs_modifier_check
    }

    fn drain_queue(&self, state: &mut WindowState) {
        let (sync_mode, force_prime) = (state.sync, self.display.force_prime);
        for event in self.queue.drain() {
            apply_event(
                &mut state.present,
                &mut state.pool,
                &mut state.prime_pool,
                sync_mode,
                force_prime,
                event,
            );
        }
    }

    /// Drops the presenter mutex, waits one bounded slice for connection
    /// activity, re-takes the mutex and folds new events in. A dead
    /// connection is terminal and surfaces as `native_destroyed`.
    fn wait_for_events<'a>(
        &'a self,
        guard: MutexGuard<'a, WindowState>,
    ) -> MutexGuard<'a, WindowState> {
        drop(guard);
        let wait_result = self.display.events.wait(&self.display.connection, EVENT_WAIT_SLICE);
        let mut guard = self.state.lock().unwrap();
        if let Err(err) = wait_result {
            warn!(self.log, "Lost the X server while waiting for events: {}", err);
            guard.present.native_destroyed = true;
        }
        self.drain_queue(&mut guard);
        guard
    }

    fn poll_events(&self, state: &mut WindowState) {
        if let Err(err) = self.display.events.poll(&self.display.connection) {
            warn!(self.log, "Lost the X server while polling for events: {}", err);
            state.present.native_destroyed = true;
        }
        self.drain_queue(state);
    }

    /// Allocates one buffer into the given pool.
    fn allocate_buffer(
        &self,
        state: &mut WindowState,
        driver: &dyn CallbackSafeOps,
        kind: PoolKind,
    ) -> Result<usize, X11Error> {
        allocate_buffer(&self.display, state, driver, kind)
    }

    /// Free-buffer selection: returns a renderable buffer index in `kind`,
    /// waiting out the server when the pool is exhausted. The presenter
    /// mutex is released during each bounded wait and destruction flags
    /// are re-checked after every wake-up.
    fn acquire_free<'a>(
        &'a self,
        mut guard: MutexGuard<'a, WindowState>,
        driver: &dyn CallbackSafeOps,
        kind: PoolKind,
        skip: Option<usize>,
    ) -> Result<(MutexGuard<'a, WindowState>, usize), X11Error> {
        loop {
            self.poll_events(&mut guard);
            if guard.deleted || guard.present.native_destroyed {
                return Err(X11Error::BadNativeWindow("the native window was destroyed"));
            }

            if let Some(idx) = guard.pool_ref(kind).select_idle(skip) {
                return Ok((guard, idx));
            }
            if !guard.pool_ref(kind).is_full() {
                let idx = self.allocate_buffer(&mut guard, driver, kind)?;
                return Ok((guard, idx));
            }

            match guard.sync {
                SyncMode::Explicit => {
                    if let Some(idx) = self.wait_explicit_release(&mut guard, kind)? {
                        return Ok((guard, idx));
                    }
                    let any_waitable = {
                        let pool = guard.pool_ref(kind);
                        pool.in_use().iter().any(|&idx| pool.get(idx).timeline.is_some())
                    };
                    if !any_waitable {
                        guard = self.wait_for_events(guard);
                    }
                }
                SyncMode::Implicit => {
                    if let Some(idx) = self.wait_implicit_release(&mut guard, kind) {
                        return Ok((guard, idx));
                    }
                    guard = self.wait_for_events(guard);
                }
                SyncMode::NoSync => {
                    guard = self.wait_for_events(guard);
                }
            }
        }
    }

    /// Waits (bounded) for any in-flight buffer's release point to become
    /// available, then queues a GPU wait on it and recycles the buffer.
    fn wait_explicit_release(
        &self,
        state: &mut WindowState,
        kind: PoolKind,
    ) -> Result<Option<usize>, X11Error> {
        let in_use = state.pool_ref(kind).in_use();
        let entries: Vec<(&Timeline, u64)> = in_use
            .iter()
            .filter_map(|&idx| {
                let timeline = state.pool_ref(kind).get(idx).timeline.as_ref()?;
                Some((timeline, timeline.point()))
            })
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }

        let signaled = wait_any_available(&self.display.device, &entries, EVENT_WAIT_SLICE)?;
        let Some(position) = signaled else {
            return Ok(None);
        };
        let idx = in_use[position];

        // Let the GPU do the waiting when possible; stall the CPU only if
        // the fence cannot be expressed as an fd.
        let timeline = state.pool_ref(kind).get(idx).timeline.as_ref().expect("waited on it");
        match timeline.point_to_sync_fd(&self.display.device) {
            Ok(fd) => {
                if self
                    .display
                    .platform
                    .driver()
                    .gpu_wait_fd(self.display.driver_display, fd.as_fd())
                    .is_err()
                {
                    sync::wait_fence_fd(fd.as_fd());
                }
            }
            Err(err) => {
                warn!(self.log, "Falling back to CPU wait for a release point: {}", err);
                let _ = timeline.wait_point_available(
                    &self.display.device,
                    timeline.point(),
                    std::time::Duration::from_secs(1),
                );
            }
        }

        state.pool_mut(kind).mark_idle(idx);
        Ok(Some(idx))
    }

    /// Recycles the oldest `IDLE_NOTIFIED` buffer once its reservation
    /// fences can be waited on by the GPU (preferred) or have cleared.
    fn wait_implicit_release(&self, state: &mut WindowState, kind: PoolKind) -> Option<usize> {
        let idx = state.pool_ref(kind).oldest_notified()?;

        let buffer = state.pool_ref(kind).get(idx);
        let Some(dmabuf) = buffer.dmabuf.as_ref() else {
            // Nothing to wait on; IdleNotify is all the information there is.
            state.pool_mut(kind).mark_idle(idx);
            return Some(idx);
        };

        if let Some(fence) = self.display.platform.implicit_sync.export_sync_file(dmabuf.as_fd()) {
            if self
                .display
                .platform
                .driver()
                .gpu_wait_fd(self.display.driver_display, fence.as_fd())
                .is_err()
            {
                sync::wait_fence_fd(fence.as_fd());
            }
        } else if !sync::poll_dmabuf_writable(dmabuf.as_fd(), EVENT_WAIT_SLICE.as_millis() as i32) {
            return None;
        }

        state.pool_mut(kind).mark_idle(idx);
        Some(idx)
    }

    /// Produces a fence fd for the rendering that was just flushed.
    fn render_fence_fd(&self) -> Option<OwnedFd> {
        if !self.display.supports_native_fence_sync {
            return None;
        }
        let driver = self.display.platform.driver();
        let display = self.display.driver_display;
        let fence = driver.create_native_fence(display).ok()?;
        let fd = driver.dup_native_fence_fd(display, fence);
        driver.destroy_sync(display, fence);
        fd.ok()
    }

    /// The synchronization step of a present: publish the rendering fence
    /// so the server reads the buffer only after rendering finished.
    fn synchronize_present(
        &self,
        state: &mut WindowState,
        kind: PoolKind,
        idx: usize,
    ) -> Result<(), X11Error> {
        match state.sync {
            SyncMode::Explicit => {
                let fd = self
                    .render_fence_fd()
                    .ok_or(X11Error::BadMatch("explicit sync without a native fence"))?;
                let buffer = state.pool_mut(kind).get_mut(idx);
                if buffer.timeline.is_none() {
                    buffer.timeline = Some(Timeline::new(
                        self.display.connection.as_ref(),
                        &self.display.device,
                        self.window,
                    )?);
                }
                let timeline = buffer.timeline.as_mut().expect("just created");
                timeline.attach_sync_fd(&self.display.device, fd.as_fd())?;
            }
            SyncMode::Implicit => {
                let Some(fd) = self.render_fence_fd() else {
                    self.display.platform.driver().finish(self.display.driver_display);
                    return Ok(());
                };
                let buffer = state.pool_ref(kind).get(idx);
                let imported = buffer
                    .dmabuf
                    .as_ref()
                    .map(|dmabuf| {
                        self.display
                            .platform
                            .implicit_sync
                            .import_sync_file(dmabuf.as_fd(), fd.as_fd())
                    })
                    .unwrap_or(false);
                if !imported {
                    sync::wait_fence_fd(fd.as_fd());
                }
            }
            SyncMode::NoSync => {
                self.display.platform.driver().finish(self.display.driver_display);
            }
        }
        Ok(())
    }

    /// Sends the Present request for the buffer and records the serial.
    fn send_present(
        &self,
        state: &mut WindowState,
        kind: PoolKind,
        idx: usize,
        options: u32,
        target_msc: u64,
    ) -> Result<(), X11Error> {
        let connection = self.display.connection.as_ref();
        let info = state.info;
        let pixmap = state
            .pool_mut(kind)
            .get_mut(idx)
            .ensure_pixmap(connection, self.window, info)?;
        let serial = state.present.frames.next_serial();

        if state.sync == SyncMode::Explicit {
            let buffer = state.pool_mut(kind).get_mut(idx);
            let timeline = buffer.timeline.as_mut().expect("attached before sending");
            let acquire_point = timeline.point();
            let release_point = acquire_point + 1;
            connection.present_pixmap_synced(
                self.window,
                pixmap,
                serial,
                0,
                0,
                0,
                0,
                0,
                timeline.xid(),
                timeline.xid(),
                acquire_point,
                release_point,
                options,
                target_msc,
                0,
                0,
                &[],
            )?;
            timeline.advance();
        } else {
            connection.present_pixmap(
                self.window,
                pixmap,
                serial,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
                options,
                target_msc,
                0,
                0,
                &[],
            )?;
        }

        state.pool_mut(kind).mark_presented(idx, serial);
        connection.flush()?;
        trace!(self.log, "Presented"; "serial" => serial, "target_msc" => target_msc);
        Ok(())
    }

    /// Rebuilds the buffer pools when the window was resized or a
    /// suboptimal-copy notification asked for a modifier re-check.
    /// Returns true when the pools were rebuilt.
    fn reallocate(
        &self,
        state: &mut WindowState,
        driver: &dyn CallbackSafeOps,
        allow_modifier_change: bool,
    ) -> Result<bool, X11Error> {
        let resized =
            state.present.pending_width != state.width || state.present.pending_height != state.height;
        let modifier_stale = allow_modifier_change && state.present.needs_modifier_check;
        if !resized && !modifier_stale {
            return Ok(false);
        }

        if modifier_stale {
            state.present.needs_modifier_check = false;
            let format = self
                .display
                .formats
                .find(state.fourcc)
                .expect("format table is immutable after init");
            let (window_mods, screen_mods) =
                server_supported_modifiers(self.display.connection.as_ref(), self.window, state.info)?;
            if let Some(negotiated) = negotiate(
                &format.renderable,
                Some(&window_mods),
                &screen_mods,
                self.display.supports_prime,
                self.display.force_prime,
            ) {
                if negotiated.prime != state.prime || negotiated.render_modifiers != state.modifiers {
                    info!(
                        self.log,
                        "Window modifiers changed";
                        "prime" => negotiated.prime,
                    );
                    state.prime = negotiated.prime;
                    state.modifiers = negotiated.render_modifiers;
                    state.chosen_modifier = None;
                }
            }
        }

        self.release_buffers(state, driver);
        state.width = state.present.pending_width;
        state.height = state.present.pending_height;

        let front = self.allocate_buffer(state, driver, PoolKind::Render)?;
        let back = self.allocate_buffer(state, driver, PoolKind::Render)?;
        state.front = Some(front);
        state.back = Some(back);
        state.prime_current = if state.prime {
            Some(self.allocate_buffer(state, driver, PoolKind::Prime)?)
        } else {
            None
        };
        debug_assert_ne!(state.front, state.back);

        if let Some(surface) = state.driver_surface {
            driver.set_color_buffers(self.display.driver_display, surface, &state.attachments())?;
        }
        Ok(true)
    }

    fn release_buffers(&self, state: &mut WindowState, driver: &dyn CallbackSafeOps) {
        state.front = None;
        state.back = None;
        state.prime_current = None;
        for buffer in state.pool.drain().into_iter().chain(state.prime_pool.drain()) {
            buffer.destroy(
                self.display.connection.as_ref(),
                &self.display.device,
                driver,
                self.display.driver_display,
            );
        }
    }

    /// Presents the current back buffer.
    ///
    /// On a destroyed native window this fails with
    /// [`X11Error::BadNativeWindow`], including when the destruction is
    /// discovered while blocked waiting for the server; a surface already
    /// being torn down returns successfully as a no-op.
    pub fn swap_buffers(&self) -> Result<(), X11Error> {
        self.skip_update_callback.fetch_add(1, Ordering::SeqCst);
        let result = self.swap_inner();
        self.skip_update_callback.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn swap_inner(&self) -> Result<(), X11Error> {
        let driver = self.display.platform.driver();
        let safe_ops = self.display.platform.safe_ops();

        let mut guard = self.state.lock().unwrap();
        self.drain_queue(&mut guard);
        if guard.deleted {
            return Ok(());
        }
        if guard.present.native_destroyed {
            return Err(X11Error::BadNativeWindow("the native window was destroyed"));
        }

        // Pick the buffer the server will read. Under PRIME that is a
        // linear intermediate the back buffer gets blitted into.
        let (kind, shared_idx) = if guard.prime {
            let back = guard.back.expect("window surfaces always have a back buffer");
            let (reacquired, idx) = self.acquire_free(guard, safe_ops, PoolKind::Prime, None)?;
            let src = reacquired.pool.get(back).driver_buffer;
            let dst = reacquired.prime_pool.get(idx).driver_buffer;
            driver.copy_color_buffer(self.display.driver_display, src, dst)?;
            guard = reacquired;
            guard.prime_current = Some(idx);
            (PoolKind::Prime, idx)
        } else {
            let back = guard.back.expect("window surfaces always have a back buffer");
            (PoolKind::Render, back)
        };

        self.synchronize_present(&mut guard, kind, shared_idx)?;

        let mut options = 0u32;
        if !self.display.force_prime {
            options |= u32::from(present::Option::SUBOPTIMAL);
        }
        let async_present = guard.swap_interval == 0 && guard.caps_async;
        if async_present {
            options |= u32::from(present::Option::ASYNC);
        }

        // Keep at most MAX_PENDING_FRAMES in flight beyond this one.
        while guard.present.frames.needs_throttle() {
            guard = self.wait_for_events(guard);
            if guard.deleted {
                return Ok(());
            }
            if guard.present.native_destroyed {
                return Err(X11Error::BadNativeWindow("the native window was destroyed"));
            }
        }

        let target_msc = guard.present.frames.target_msc(guard.swap_interval, async_present);
        self.send_present(&mut guard, kind, shared_idx, options, target_msc)?;

        // The server has the frame; bring the pools up to date for the
        // next one.
        if self.reallocate(&mut guard, safe_ops, true)? {
            return Ok(());
        }

        let old_back = guard.back.take().expect("still attached");
        guard.front = Some(old_back);
        let (mut guard, new_back) = self.acquire_free(guard, safe_ops, PoolKind::Render, Some(old_back))?;
        guard.back = Some(new_back);
        debug_assert_ne!(guard.front, guard.back);

        if let Some(surface) = guard.driver_surface {
            safe_ops.set_color_buffers(self.display.driver_display, surface, &guard.attachments())?;
        }
        Ok(())
    }

    /// Tears the surface down. The driver surface is destroyed first,
    /// which synchronously finishes any callback still running.
    pub fn destroy(&self) {
        self.skip_update_callback.fetch_add(1, Ordering::SeqCst);
        let driver_surface = {
            let mut state = self.state.lock().unwrap();
            state.deleted = true;
            state.driver_surface.take()
        };

        if let Some(surface) = driver_surface {
            self.display
                .platform
                .driver()
                .destroy_surface(self.display.driver_display, surface);
        }

        self.release_resources();
        self.skip_update_callback.fetch_sub(1, Ordering::SeqCst);
    }

    fn release_resources(&self) {
        let mut state = self.state.lock().unwrap();
        state.deleted = true;
        self.release_buffers(&mut state, self.display.platform.safe_ops());
        let event_id = state.event_id;
        drop(state);

        self.display.events.unregister(self.window);
        let connection = self.display.connection.as_ref();
        let _ = connection.present_select_input(event_id, self.window, present::EventMask::NO_EVENT);
        let _ = connection.flush();
    }
}

/// Allocates the initial front/back (and PRIME) buffers during creation.
fn initial_buffers(display: &Arc<DisplayInstance>, state: &mut WindowState) -> Result<(), X11Error> {
    let driver = display.platform.safe_ops();

    let front = allocate_buffer(display, state, driver, PoolKind::Render)?;
    let back = allocate_buffer(display, state, driver, PoolKind::Render)?;
    state.front = Some(front);
    state.back = Some(back);
    if state.prime {
        state.prime_current = Some(allocate_buffer(display, state, driver, PoolKind::Prime)?);
    }
    Ok(())
}

fn allocate_buffer(
    display: &Arc<DisplayInstance>,
    state: &mut WindowState,
    driver: &dyn CallbackSafeOps,
    kind: PoolKind,
) -> Result<usize, X11Error> {
    let (width, height, fourcc) = (state.width as u32, state.height as u32, state.fourcc);
    let buffer = match kind {
        PoolKind::Render => {
            // The first allocation lets the allocator pick the layout; all
            // later ones reuse it so the pool stays homogeneous.
            let modifiers = match state.chosen_modifier {
                Some(modifier) => vec![modifier],
                None => state.modifiers.clone(),
            };
            let buffer = ColorBuffer::allocate_render(
                &display.gbm.lock().unwrap(),
                driver,
                display.driver_display,
                width,
                height,
                fourcc,
                &modifiers,
            )?;
            if state.chosen_modifier.is_none() {
                state.chosen_modifier = Some(buffer.layout.modifier);
            }
            buffer
        }
        PoolKind::Prime => {
            ColorBuffer::allocate_prime(driver, display.driver_display, width, height, fourcc)?
        }
    };
    Ok(state.pool_mut(kind).push(buffer))
}

impl SurfaceCallbacks for WindowSurface {
    /// Brings the surface up to date before the driver uses it. Runs under
    /// the driver's window-system lock, so this path keeps to the
    /// presenter mutex and the callback-safe driver subset, and performs a
    /// resize-only reallocation (modifier changes wait for the next swap).
    fn update(&self, driver: &dyn CallbackSafeOps) {
        if self.skip_update_callback.load(Ordering::SeqCst) > 0 {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.deleted || state.present.native_destroyed {
            return;
        }

        self.poll_events(&mut state);
        if let Err(err) = self.reallocate(&mut state, driver, false) {
            warn!(self.log, "Deferring resize to the next swap: {}", err);
        }
    }

    /// Publishes front-buffer damage mid-frame. The driver flushed the
    /// rendering already; `sync_fd` fences it.
    fn damage(&self, _driver: &dyn CallbackSafeOps, sync_fd: Option<BorrowedFd<'_>>, _flags: DamageFlags) {
        let mut state = self.state.lock().unwrap();
        if state.deleted || state.present.native_destroyed {
            return;
        }

        let (kind, idx) = if state.prime {
            match state.prime_current {
                Some(idx) => (PoolKind::Prime, idx),
                None => return,
            }
        } else {
            match state.front {
                Some(idx) => (PoolKind::Render, idx),
                None => return,
            }
        };

        if let Some(fence) = sync_fd {
            match state.sync {
                SyncMode::Explicit => {
                    let connection = self.display.connection.as_ref();
                    let buffer = state.pool_mut(kind).get_mut(idx);
                    if buffer.timeline.is_none() {
                        buffer.timeline =
                            Timeline::new(connection, &self.display.device, self.window).ok();
                    }
                    let attached = buffer
                        .timeline
                        .as_mut()
                        .map(|timeline| timeline.attach_sync_fd(&self.display.device, fence).is_ok())
                        .unwrap_or(false);
                    if !attached {
                        sync::wait_fence_fd(fence);
                    }
                }
                SyncMode::Implicit | SyncMode::NoSync => {
                    let buffer = state.pool_ref(kind).get(idx);
                    let imported = buffer
                        .dmabuf
                        .as_ref()
                        .map(|dmabuf| {
                            self.display
                                .platform
                                .implicit_sync
                                .import_sync_file(dmabuf.as_fd(), fence)
                        })
                        .unwrap_or(false);
                    if !imported {
                        sync::wait_fence_fd(fence);
                    }
                }
            }
        }

        // Mid-frame damage is a copy of what is already on screen, shown
        // as soon as possible; it never flips or waits for a vblank.
        let options = u32::from(present::Option::ASYNC) | u32::from(present::Option::COPY);
        if let Err(err) = self.send_present(&mut state, kind, idx, options, 0) {
            warn!(self.log, "Damage present failed: {}", err);
        }
    }
}
