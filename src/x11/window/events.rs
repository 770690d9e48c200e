//! The Present event pump.
//!
//! All windows share one connection, and x11rb delivers Present's
//! XGE events through the ordinary event stream. The [`EventRouter`]
//! drains that stream and sorts events into per-window queues; each
//! window presenter drains its queue into its own state while holding its
//! own mutex. Waiting is always bounded: a blocked swap re-checks its
//! window's destruction flags every ~100 ms even if the server goes
//! quiet, and a thread whose event was consumed by another thread's drain
//! picks it up from its queue at the next timeout at the latest.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsFd, AsRawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use x11rb::connection::Connection;
use x11rb::protocol::present;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use super::frames::FrameTracker;
use super::pool::BufferPool;
use crate::x11::error::X11Error;

/// How long a bounded wait sleeps before re-checking state.
pub(crate) const EVENT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// `PresentConfigureNotify.pixmap_flags` bit the server sets when the
/// native window is gone (XWayland sends this once the toplevel dies).
const PIXMAP_FLAG_WINDOW_DESTROYED: u32 = 1 << 0;

/// Which synchronization scheme a window ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// DRM timeline syncobjs via `PresentPixmapSynced`.
    Explicit,
    /// Fences carried by the dma-buf reservation object.
    Implicit,
    /// `glFinish` before presenting, trust `IdleNotify` afterwards.
    NoSync,
}

/// How a present completed, reduced to what the presenter cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompleteKind {
    /// Flip, copy or skip; nothing to do beyond bookkeeping.
    Normal,
    /// The server copied and tells us a different modifier would flip.
    SuboptimalCopy,
}

/// A Present event, reduced to the fields this crate consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PresentEvent {
    /// `PresentConfigureNotify`.
    Configure {
        /// New window width.
        width: u16,
        /// New window height.
        height: u16,
        /// The native window no longer exists.
        window_destroyed: bool,
    },
    /// `PresentIdleNotify`.
    Idle {
        /// Pixmap the server is done with.
        pixmap: u32,
        /// Serial of the present that used it.
        serial: u32,
    },
    /// `PresentCompleteNotify` for a pixmap present.
    Complete {
        /// Serial of the completed present.
        serial: u32,
        /// MSC at completion.
        msc: u64,
        /// Completion mode.
        kind: CompleteKind,
    },
}

/// Extracts the Present event for `window`, if `event` is one.
pub(crate) fn translate(event: &Event, window: u32) -> Option<PresentEvent> {
    match event {
        Event::PresentConfigureNotify(configure) if configure.window == window => {
            Some(PresentEvent::Configure {
                width: configure.width,
                height: configure.height,
                window_destroyed: configure.pixmap_flags & PIXMAP_FLAG_WINDOW_DESTROYED != 0,
            })
        }
        Event::PresentIdleNotify(idle) if idle.window == window => Some(PresentEvent::Idle {
            pixmap: idle.pixmap,
            serial: idle.serial,
        }),
        Event::PresentCompleteNotify(complete)
            if complete.window == window && complete.kind == present::CompleteKind::PIXMAP =>
        {
            Some(PresentEvent::Complete {
                serial: complete.serial,
                msc: complete.msc,
                kind: if complete.mode == present::CompleteMode::SUBOPTIMAL_COPY {
                    CompleteKind::SuboptimalCopy
                } else {
                    CompleteKind::Normal
                },
            })
        }
        _ => None,
    }
}

/// The event-driven half of a window presenter's state.
#[derive(Debug, Default)]
pub(crate) struct PresentState {
    /// Window size according to the newest ConfigureNotify. Only the event
    /// pump writes this; a successful reallocation copies it into the
    /// actual surface size.
    pub pending_width: u16,
    /// See [`PresentState::pending_width`].
    pub pending_height: u16,
    /// The native window is gone; everything from here on is teardown.
    pub native_destroyed: bool,
    /// A `SUBOPTIMAL_COPY` completion arrived; the next swap re-queries
    /// the server's modifiers.
    pub needs_modifier_check: bool,
    /// Serial/MSC bookkeeping.
    pub frames: FrameTracker,
}

/// Folds one event into the window state.
///
/// Both pools are searched for idle notifications: without PRIME the
/// presented pixmaps belong to the render pool, with PRIME to the linear
/// intermediates.
pub(crate) fn apply_event(
    state: &mut PresentState,
    render_pool: &mut BufferPool,
    prime_pool: &mut BufferPool,
    sync: SyncMode,
    force_prime: bool,
    event: PresentEvent,
) {
    match event {
        PresentEvent::Configure {
            width,
            height,
            window_destroyed,
        } => {
            state.pending_width = width;
            state.pending_height = height;
            if window_destroyed {
                state.native_destroyed = true;
            }
        }
        PresentEvent::Idle { pixmap, serial } => {
            // Under explicit sync Idle events are neither requested nor
            // trusted; buffer liveness comes from timeline waits.
            if sync != SyncMode::Explicit {
                let direct = sync == SyncMode::NoSync;
                if render_pool.idle_notify(pixmap, serial, direct).is_none() {
                    prime_pool.idle_notify(pixmap, serial, direct);
                }
            }
        }
        PresentEvent::Complete { serial, msc, kind } => {
            state.frames.note_complete(serial, msc);
            if kind == CompleteKind::SuboptimalCopy && !force_prime {
                state.needs_modifier_check = true;
            }
        }
    }
}

/// Per-window queue of translated events.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<PresentEvent>>,
}

impl EventQueue {
    fn push(&self, event: PresentEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    /// Removes and returns all queued events.
    pub fn drain(&self) -> Vec<PresentEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

/// Routes Present events from the shared connection to window queues.
#[derive(Debug, Default)]
pub(crate) struct EventRouter {
    queues: Mutex<HashMap<u32, Arc<EventQueue>>>,
}

impl EventRouter {
    pub fn new() -> EventRouter {
        EventRouter::default()
    }

    /// Starts routing events for `window` into `queue`. Must happen before
    /// the window's geometry is first fetched so a racing resize cannot be
    /// missed.
    pub fn register(&self, window: u32, queue: Arc<EventQueue>) {
        self.queues.lock().unwrap().insert(window, queue);
    }

    pub fn unregister(&self, window: u32) {
        self.queues.lock().unwrap().remove(&window);
    }

    fn dispatch(&self, event: &Event) {
        let queues = self.queues.lock().unwrap();
        for (&window, queue) in queues.iter() {
            if let Some(translated) = translate(event, window) {
                queue.push(translated);
                break;
            }
        }
    }

    /// Drains every event the connection already has, without blocking.
    pub fn poll(&self, connection: &RustConnection) -> Result<(), X11Error> {
        while let Some(event) = connection.poll_for_event()? {
            self.dispatch(&event);
        }
        Ok(())
    }

    /// Waits up to `timeout` for the connection to become readable, then
    /// drains it. Returning without any new event is normal; callers loop
    /// and re-check their own state between slices.
    pub fn wait(&self, connection: &RustConnection, timeout: Duration) -> Result<(), X11Error> {
        self.poll(connection)?;

        let stream = connection.stream();
        let mut fds = [PollFd::new(stream.as_fd().as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(err) => return Err(X11Error::Allocation(err.into())),
        }

        self.poll(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x11::buffer::{BufferStatus, ColorBuffer};
    use x11rb::x11_utils::TryParse;

    const WINDOW: u32 = 0x600;

    fn state_and_pools() -> (PresentState, BufferPool, BufferPool) {
        let mut pool = BufferPool::new(4);
        pool.push(ColorBuffer::stub(1, Some(0x400)));
        pool.push(ColorBuffer::stub(2, Some(0x401)));
        let mut prime = BufferPool::new(2);
        prime.push(ColorBuffer::stub(3, Some(0x500)));
        (PresentState::default(), pool, prime)
    }

    #[test]
    fn configure_updates_pending_size_only() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::NoSync,
            false,
            PresentEvent::Configure {
                width: 1024,
                height: 768,
                window_destroyed: false,
            },
        );
        assert_eq!((state.pending_width, state.pending_height), (1024, 768));
        assert!(!state.native_destroyed);
    }

    #[test]
    fn destroyed_flag_is_terminal() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::NoSync,
            false,
            PresentEvent::Configure {
                width: 1,
                height: 1,
                window_destroyed: true,
            },
        );
        assert!(state.native_destroyed);
    }

    #[test]
    fn idle_is_ignored_under_explicit_sync() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        pool.mark_presented(0, 1);
        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::Explicit,
            false,
            PresentEvent::Idle {
                pixmap: 0x400,
                serial: 1,
            },
        );
        assert_eq!(pool.get(0).status, BufferStatus::InUse);
    }

    #[test]
    fn idle_transitions_depend_on_sync_mode() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        pool.mark_presented(0, 1);
        pool.mark_presented(1, 2);

        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::Implicit,
            true,
            PresentEvent::Idle {
                pixmap: 0x400,
                serial: 1,
            },
        );
        assert_eq!(pool.get(0).status, BufferStatus::IdleNotified);

        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::NoSync,
            false,
            PresentEvent::Idle {
                pixmap: 0x401,
                serial: 2,
            },
        );
        assert_eq!(pool.get(1).status, BufferStatus::Idle);
    }

    #[test]
    fn suboptimal_copy_requests_modifier_check() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        state.frames.next_serial();

        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::NoSync,
            false,
            PresentEvent::Complete {
                serial: 1,
                msc: 42,
                kind: CompleteKind::SuboptimalCopy,
            },
        );
        assert!(state.needs_modifier_check);
        assert_eq!(state.frames.last_complete_serial(), 1);
        assert_eq!(state.frames.last_complete_msc(), 42);
    }

    /// Under forced PRIME the shared pixmap is always linear, so the
    /// server's suboptimal hint carries no information.
    #[test]
    fn suboptimal_copy_is_moot_under_force_prime() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        state.frames.next_serial();

        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::Implicit,
            true,
            PresentEvent::Complete {
                serial: 1,
                msc: 0,
                kind: CompleteKind::SuboptimalCopy,
            },
        );
        assert!(!state.needs_modifier_check);
    }

    /// Parsing a wire-format CompleteNotify and translating it preserves
    /// (serial, msc, mode) exactly.
    #[test]
    fn complete_notify_wire_round_trip() {
        let serial: u32 = 0xdead_beef;
        let msc: u64 = 0x0123_4567_89ab_cdef;

        let mut bytes = Vec::new();
        bytes.push(35u8); // GeGeneric
        bytes.push(0x80u8); // extension opcode
        bytes.extend_from_slice(&0u16.to_ne_bytes()); // sequence
        bytes.extend_from_slice(&2u32.to_ne_bytes()); // length
        bytes.extend_from_slice(&1u16.to_ne_bytes()); // CompleteNotify
        bytes.push(u8::from(present::CompleteKind::PIXMAP));
        bytes.push(u8::from(present::CompleteMode::SUBOPTIMAL_COPY));
        bytes.extend_from_slice(&0x77u32.to_ne_bytes()); // event id
        bytes.extend_from_slice(&WINDOW.to_ne_bytes());
        bytes.extend_from_slice(&serial.to_ne_bytes());
        bytes.extend_from_slice(&0u64.to_ne_bytes()); // ust
        bytes.extend_from_slice(&msc.to_ne_bytes());

        let (parsed, _) = present::CompleteNotifyEvent::try_parse(&bytes).unwrap();
        assert_eq!(parsed.serial, serial);
        assert_eq!(parsed.msc, msc);
        assert_eq!(parsed.mode, present::CompleteMode::SUBOPTIMAL_COPY);

        let translated = translate(&Event::PresentCompleteNotify(parsed), WINDOW).unwrap();
        assert_eq!(
            translated,
            PresentEvent::Complete {
                serial,
                msc,
                kind: CompleteKind::SuboptimalCopy,
            }
        );
    }

    /// Under PRIME the presented pixmaps belong to the linear pool.
    #[test]
    fn idle_reaches_the_prime_pool() {
        let (mut state, mut pool, mut prime) = state_and_pools();
        prime.mark_presented(0, 3);
        apply_event(
            &mut state,
            &mut pool,
            &mut prime,
            SyncMode::Implicit,
            true,
            PresentEvent::Idle {
                pixmap: 0x500,
                serial: 3,
            },
        );
        assert_eq!(prime.get(0).status, BufferStatus::IdleNotified);
    }

    /// Four presents on a two-buffer pool with in-order completions:
    /// serials advance 1..=4, completions follow, and nothing is left in
    /// use at the end.
    #[test]
    fn smoke_present_sequence() {
        let (mut state, mut pool, mut prime) = state_and_pools();

        for expected_serial in 1..=4u32 {
            let target = pool.select_idle(None).expect("a buffer must be available");
            let serial = state.frames.next_serial();
            assert_eq!(serial, expected_serial);
            pool.mark_presented(target, serial);

            apply_event(
                &mut state,
                &mut pool,
                &mut prime,
                SyncMode::Implicit,
                false,
                PresentEvent::Complete {
                    serial,
                    msc: 1000 + serial as u64,
                    kind: CompleteKind::Normal,
                },
            );
            let pixmap = pool.get(target).pixmap().unwrap();
            apply_event(
                &mut state,
                &mut pool,
                &mut prime,
                SyncMode::Implicit,
                false,
                PresentEvent::Idle { pixmap, serial },
            );
            assert_eq!(pool.get(target).status, BufferStatus::IdleNotified);
            // The fence check happens at reuse time; emulate it passing.
            pool.mark_idle(target);
        }

        assert_eq!(state.frames.last_present_serial(), 4);
        assert_eq!(state.frames.last_complete_serial(), 4);
        assert_eq!(state.frames.last_complete_msc(), 1004);
        assert!(pool.in_use().is_empty());
        assert!(!state.needs_modifier_check);
    }

    #[test]
    fn translate_filters_foreign_windows() {
        let complete = present::CompleteNotifyEvent {
            response_type: 35,
            extension: 0x80,
            sequence: 0,
            length: 2,
            event_type: 1,
            kind: present::CompleteKind::PIXMAP,
            mode: present::CompleteMode::FLIP,
            event: 0x77,
            window: WINDOW + 1,
            serial: 5,
            ust: 0,
            msc: 9,
        };
        assert_eq!(translate(&Event::PresentCompleteNotify(complete), WINDOW), None);
    }
}
