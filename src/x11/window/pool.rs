//! The per-window buffer pools.
//!
//! A window owns up to [`MAX_COLOR_BUFFERS`] shared render buffers and,
//! under PRIME, up to [`MAX_PRIME_BUFFERS`] linear intermediates. Buffers
//! are allocated lazily as presents outpace completions and recycled
//! through the status machine in [`BufferStatus`].
//!
//! Instead of moving recycled buffers to the tail of a list, each slot
//! carries a monotonically increasing idle stamp; selection prefers the
//! smallest stamp. The effect is the same (the buffer idle the longest is
//! reused first, giving its fences the most time to clear) without
//! invalidating the indices that the window's current front/back/prime
//! pointers hold.

use crate::x11::buffer::{BufferStatus, ColorBuffer};

/// Upper bound on shared render buffers per window.
pub const MAX_COLOR_BUFFERS: usize = 4;
/// Upper bound on PRIME intermediates per window.
pub const MAX_PRIME_BUFFERS: usize = 2;

#[derive(Debug)]
struct Slot {
    buffer: ColorBuffer,
    idle_order: u64,
}

/// A bounded pool of color buffers with recycle tracking.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Slot>,
    cap: usize,
    next_order: u64,
}

impl BufferPool {
    /// Creates an empty pool holding at most `cap` buffers.
    pub fn new(cap: usize) -> BufferPool {
        BufferPool {
            slots: Vec::with_capacity(cap),
            cap,
            next_order: 0,
        }
    }

    /// Number of allocated buffers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool reached its cap.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.cap
    }

    /// True if no buffers are allocated.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds a freshly allocated buffer, returning its index.
    ///
    /// Panics if the pool is full; callers check [`BufferPool::is_full`]
    /// as part of free-buffer selection.
    pub fn push(&mut self, buffer: ColorBuffer) -> usize {
        assert!(!self.is_full(), "buffer pool exceeded its cap");
        let order = self.bump_order();
        self.slots.push(Slot {
            buffer,
            idle_order: order,
        });
        self.slots.len() - 1
    }

    /// Shared access to a buffer.
    pub fn get(&self, index: usize) -> &ColorBuffer {
        &self.slots[index].buffer
    }

    /// Exclusive access to a buffer.
    pub fn get_mut(&mut self, index: usize) -> &mut ColorBuffer {
        &mut self.slots[index].buffer
    }

    /// Iterates over `(index, buffer)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ColorBuffer)> {
        self.slots.iter().enumerate().map(|(idx, slot)| (idx, &slot.buffer))
    }

    /// Removes and returns all buffers, e.g. for a resize re-pool.
    pub fn drain(&mut self) -> Vec<ColorBuffer> {
        self.slots.drain(..).map(|slot| slot.buffer).collect()
    }

    fn bump_order(&mut self) -> u64 {
        self.next_order += 1;
        self.next_order
    }

    /// Picks the longest-idle `IDLE` buffer, skipping `skip` (the buffer
    /// that was just attached as the new front must not become the new
    /// back as well).
    pub fn select_idle(&self, skip: Option<usize>) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(idx, slot)| Some(*idx) != skip && slot.buffer.status == BufferStatus::Idle)
            .min_by_key(|(_, slot)| slot.idle_order)
            .map(|(idx, _)| idx)
    }

    /// The longest-idle buffer the server has released but whose fences
    /// have not been inspected yet.
    pub fn oldest_notified(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.buffer.status == BufferStatus::IdleNotified)
            .min_by_key(|(_, slot)| slot.idle_order)
            .map(|(idx, _)| idx)
    }

    /// Indices of buffers the server still holds.
    pub fn in_use(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.buffer.status == BufferStatus::InUse)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Marks a buffer as handed to the server by the present with `serial`.
    pub fn mark_presented(&mut self, index: usize, serial: u32) {
        let slot = &mut self.slots[index];
        slot.buffer.status = BufferStatus::InUse;
        slot.buffer.last_present_serial = serial;
    }

    /// Marks a buffer ready for rendering again.
    pub fn mark_idle(&mut self, index: usize) {
        let order = self.bump_order();
        let slot = &mut self.slots[index];
        slot.buffer.status = BufferStatus::Idle;
        slot.idle_order = order;
    }

    /// Applies a `PresentIdleNotify` for `(pixmap, serial)`.
    ///
    /// With `direct_idle` (no-sync mode) the buffer becomes `IDLE`
    /// immediately; otherwise it parks in `IDLE_NOTIFIED` until its fences
    /// have been waited on. Returns the matched index.
    pub fn idle_notify(&mut self, pixmap: u32, serial: u32, direct_idle: bool) -> Option<usize> {
        let index = self.slots.iter().position(|slot| {
            slot.buffer.pixmap() == Some(pixmap) && slot.buffer.last_present_serial == serial
        })?;

        let order = self.bump_order();
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.buffer.status, BufferStatus::InUse);
        slot.buffer.status = if direct_idle {
            BufferStatus::Idle
        } else {
            BufferStatus::IdleNotified
        };
        slot.idle_order = order;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize, cap: usize) -> BufferPool {
        let mut pool = BufferPool::new(cap);
        for i in 0..n {
            pool.push(ColorBuffer::stub(i as u64 + 1, Some(0x400 + i as u32)));
        }
        pool
    }

    #[test]
    fn in_use_buffers_are_never_selected() {
        let mut pool = pool_of(3, MAX_COLOR_BUFFERS);
        pool.mark_presented(0, 1);
        pool.mark_presented(1, 2);

        for _ in 0..16 {
            let chosen = pool.select_idle(None).unwrap();
            assert_eq!(chosen, 2);
        }

        pool.mark_presented(2, 3);
        assert_eq!(pool.select_idle(None), None);
        assert_eq!(pool.in_use(), vec![0, 1, 2]);
    }

    #[test]
    fn selection_skips_the_new_front() {
        let mut pool = pool_of(2, MAX_COLOR_BUFFERS);
        pool.mark_idle(0);
        pool.mark_idle(1);
        assert_eq!(pool.select_idle(Some(0)), Some(1));
        assert_eq!(pool.select_idle(Some(1)), Some(0));
    }

    #[test]
    fn oldest_idle_is_preferred() {
        let mut pool = pool_of(3, MAX_COLOR_BUFFERS);
        // Re-idle in the order 2, 0, 1: buffer 2 becomes the oldest.
        pool.mark_idle(2);
        pool.mark_idle(0);
        pool.mark_idle(1);
        assert_eq!(pool.select_idle(None), Some(2));
        assert_eq!(pool.select_idle(Some(2)), Some(0));
    }

    #[test]
    fn idle_notify_matches_pixmap_and_serial() {
        let mut pool = pool_of(2, MAX_COLOR_BUFFERS);
        pool.mark_presented(0, 7);
        pool.mark_presented(1, 8);

        // Wrong serial for the pixmap: no match.
        assert_eq!(pool.idle_notify(0x400, 8, false), None);

        assert_eq!(pool.idle_notify(0x401, 8, false), Some(1));
        assert_eq!(pool.get(1).status, BufferStatus::IdleNotified);
        // Not renderable yet; its fences have not been checked.
        assert_eq!(pool.select_idle(None), None);

        pool.mark_idle(1);
        assert_eq!(pool.select_idle(None), Some(1));
    }

    #[test]
    fn no_sync_mode_idles_directly() {
        let mut pool = pool_of(1, MAX_COLOR_BUFFERS);
        pool.mark_presented(0, 1);
        assert_eq!(pool.idle_notify(0x400, 1, true), Some(0));
        assert_eq!(pool.get(0).status, BufferStatus::Idle);
        assert_eq!(pool.select_idle(None), Some(0));
    }

    #[test]
    #[should_panic(expected = "exceeded its cap")]
    fn cap_is_enforced() {
        let mut pool = pool_of(MAX_PRIME_BUFFERS, MAX_PRIME_BUFFERS);
        pool.push(ColorBuffer::stub(99, None));
    }

    /// A full present/complete/idle cycle leaves nothing in use.
    #[test]
    fn cycle_leaves_no_buffer_in_use() {
        let mut pool = pool_of(2, MAX_COLOR_BUFFERS);
        for serial in 1..=4u32 {
            let target = pool.select_idle(None).expect("a buffer must be free");
            pool.mark_presented(target, serial);
            let pixmap = pool.get(target).pixmap().unwrap();
            assert_eq!(pool.idle_notify(pixmap, serial, false), Some(target));
            pool.mark_idle(target);
        }
        assert!(pool.in_use().is_empty());
    }
}
