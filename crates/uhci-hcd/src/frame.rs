use crate::dma::FRAME_LIST_ENTRIES;

const FRAME_WRAP: u64 = FRAME_LIST_ENTRIES as u64;

/// Extends the 10-bit hardware frame counter to a monotonic 64-bit frame count.
///
/// Wraps are only detected between consecutive observations, so the counter must be sampled at
/// least once per 1024 frames (every interrupt and timer pass does).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClock {
    last_raw: u16,
    now: u64,
}

impl FrameClock {
    pub fn new(raw: u16) -> Self {
        let raw = raw % FRAME_WRAP as u16;
        Self {
            last_raw: raw,
            now: u64::from(raw),
        }
    }

    pub fn observe(&mut self, raw: u16) -> u64 {
        let raw = raw % FRAME_WRAP as u16;
        let delta = (u64::from(raw) + FRAME_WRAP - u64::from(self.last_raw)) % FRAME_WRAP;
        self.now += delta;
        self.last_raw = raw;
        self.now
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Absolute frame of the next occurrence of frame-list slot `slot` that is at or after `now`.
    pub fn next_occurrence(&self, slot: u16) -> u64 {
        let slot = u64::from(slot) % FRAME_WRAP;
        let cur = self.now % FRAME_WRAP;
        self.now + (slot + FRAME_WRAP - cur) % FRAME_WRAP
    }
}

pub fn slot_of(frame: u64) -> usize {
    (frame % FRAME_WRAP) as usize
}
