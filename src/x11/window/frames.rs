//! Present serial and MSC accounting.
//!
//! Serials are 32-bit and assigned by us; the server echoes them in
//! `CompleteNotify` and `IdleNotify`. Events can arrive out of order
//! (the server may switch between flip and copy paths), and the serial
//! counter is allowed to wrap, so all comparisons use wrapping distances
//! from the most recent present.

/// How many frames may be in flight beyond the current one before a swap
/// throttles on a Present event.
pub const MAX_PENDING_FRAMES: u32 = 1;

/// Tracks presented and completed frames for one window.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameTracker {
    last_present_serial: u32,
    last_complete_serial: u32,
    last_complete_msc: u64,
}

impl FrameTracker {
    /// Serial of the most recent present, 0 before the first one.
    pub fn last_present_serial(&self) -> u32 {
        self.last_present_serial
    }

    /// Serial of the newest completed present.
    pub fn last_complete_serial(&self) -> u32 {
        self.last_complete_serial
    }

    /// MSC at which the newest completed present was shown.
    pub fn last_complete_msc(&self) -> u64 {
        self.last_complete_msc
    }

    /// Consumes the next present serial.
    pub fn next_serial(&mut self) -> u32 {
        self.last_present_serial = self.last_present_serial.wrapping_add(1);
        self.last_present_serial
    }

    /// Number of presents the server has not yet completed.
    pub fn pending(&self) -> u32 {
        self.last_present_serial.wrapping_sub(self.last_complete_serial)
    }

    /// Whether a swap must wait for a Present event before sending more.
    pub fn needs_throttle(&self) -> bool {
        self.pending() > MAX_PENDING_FRAMES
    }

    /// Records a `CompleteNotify`. Returns true if it advanced the
    /// completed serial.
    ///
    /// A completion only advances the state when its serial is closer to
    /// the most recent present than the previous completion was; anything
    /// else is a stale event delivered late.
    pub fn note_complete(&mut self, serial: u32, msc: u64) -> bool {
        let candidate = self.last_present_serial.wrapping_sub(serial);
        let current = self.last_present_serial.wrapping_sub(self.last_complete_serial);
        if candidate < current {
            self.last_complete_serial = serial;
            self.last_complete_msc = msc;
            true
        } else {
            false
        }
    }

    /// Computes the MSC to target for the next present.
    ///
    /// Async presents target 0 (immediately). Otherwise the frame is
    /// scheduled `swap_interval` refreshes after the newest frame that
    /// would complete before it. This deliberately approximates "show for
    /// N refreshes" in favor of keeping the pipeline full.
    pub fn target_msc(&self, swap_interval: u32, async_present: bool) -> u64 {
        if async_present {
            0
        } else {
            self.last_complete_msc + (self.pending() as u64 + 1) * swap_interval as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_advance_in_order() {
        let mut frames = FrameTracker::default();
        for expected in 1..=4u32 {
            let serial = frames.next_serial();
            assert_eq!(serial, expected);
            assert!(frames.note_complete(serial, serial as u64 * 100));
            assert_eq!(frames.last_complete_serial(), expected);
        }
        assert_eq!(frames.pending(), 0);
        assert_eq!(frames.last_complete_msc(), 400);
    }

    /// Completions delivered in reversed pairs (2,1), (4,3), ... must never
    /// regress the completed serial.
    #[test]
    fn reordered_completions_never_regress() {
        let mut frames = FrameTracker::default();
        for _ in 0..10 {
            frames.next_serial();
        }

        for pair in (1..=10u32).step_by(2) {
            let newer = pair + 1;
            assert!(frames.note_complete(newer, newer as u64));
            assert_eq!(frames.last_complete_serial(), newer);
            // The older completion of the pair is stale.
            assert!(!frames.note_complete(pair, pair as u64));
            assert_eq!(frames.last_complete_serial(), newer);
        }

        assert_eq!(frames.last_complete_serial(), 10);
        assert_eq!(frames.pending(), 0);
    }

    /// A duplicate completion does not advance anything.
    #[test]
    fn duplicate_completion_is_ignored() {
        let mut frames = FrameTracker::default();
        frames.next_serial();
        assert!(frames.note_complete(1, 7));
        assert!(!frames.note_complete(1, 9));
        assert_eq!(frames.last_complete_msc(), 7);
    }

    /// The guard must stay correct across a serial wrap at `u32::MAX`.
    #[test]
    fn complete_guard_survives_serial_wrap() {
        let mut frames = FrameTracker {
            last_present_serial: u32::MAX - 1,
            last_complete_serial: u32::MAX - 1,
            last_complete_msc: 0,
        };

        // Two presents straddling the wrap: MAX, then 0.
        assert_eq!(frames.next_serial(), u32::MAX);
        assert_eq!(frames.next_serial(), 0);
        assert_eq!(frames.pending(), 2);

        // They complete in reverse order.
        assert!(frames.note_complete(0, 2));
        assert_eq!(frames.pending(), 0);
        assert!(!frames.note_complete(u32::MAX, 1));
        assert_eq!(frames.last_complete_serial(), 0);
    }

    #[test]
    fn throttle_kicks_in_beyond_max_pending() {
        let mut frames = FrameTracker::default();
        frames.next_serial();
        assert!(!frames.needs_throttle());
        frames.next_serial();
        assert!(frames.needs_throttle());
        frames.note_complete(1, 1);
        assert!(!frames.needs_throttle());
    }

    #[test]
    fn msc_targeting() {
        let mut frames = FrameTracker::default();
        frames.next_serial();
        frames.note_complete(1, 1000);

        // Nothing pending: next vblank-aligned target is one interval out.
        assert_eq!(frames.target_msc(1, false), 1001);
        assert_eq!(frames.target_msc(2, false), 1002);

        // One frame pending pushes the target out by another interval.
        frames.next_serial();
        assert_eq!(frames.target_msc(1, false), 1002);

        // Async presents always target now.
        assert_eq!(frames.target_msc(1, true), 0);
    }
}
