use core::time::Duration;

use crate::error::{HcdError, Result};
use crate::schedule::SKELETON_QH_COUNT;

/// Host controller driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcdConfig {
    /// Bus address of the DMA region. Must be 4 KiB aligned: the frame list sits at its start.
    pub dma_base: u32,
    /// Number of transfer descriptors in the pool.
    pub td_count: u16,
    /// Number of queue heads in the pool, including the schedule skeleton.
    pub qh_count: u16,
    /// Bytes reserved for setup packets and transfer data.
    pub buffer_bytes: u32,
    /// Frames between "now" and the first packet of an as-soon-as-possible isochronous stream
    /// that has nothing to continue from.
    pub iso_asap_delay_frames: u16,
    /// Longest isochronous span (in frames) a single request may book.
    pub max_iso_frames: usize,
    /// A control/bulk request with no progress for this long stops holding the bandwidth
    /// reclamation loop open.
    pub fsbr_idle_timeout: Duration,
    /// Missing interrupts for this long (with work in flight) marks the controller as hung.
    pub watchdog_timeout: Duration,
    /// Reset-and-rebuild attempts before the controller is declared dead.
    pub max_reanimations: u32,
    /// When false, no interrupt line is wired and [`crate::Hcd::timer_tick`] drives the
    /// completion walk.
    pub use_irq: bool,
}

impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            dma_base: 0x0010_0000,
            td_count: 1024,
            qh_count: 128,
            buffer_bytes: 64 * 1024,
            iso_asap_delay_frames: 2,
            max_iso_frames: 900,
            fsbr_idle_timeout: Duration::from_millis(50),
            watchdog_timeout: Duration::from_secs(1),
            max_reanimations: 5,
            use_irq: true,
        }
    }
}

impl HcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dma_base & 0xfff != 0 {
            return Err(HcdError::InvalidConfig("dma_base must be 4 KiB aligned"));
        }
        if usize::from(self.qh_count) <= SKELETON_QH_COUNT {
            return Err(HcdError::InvalidConfig(
                "qh_count must leave room beyond the schedule skeleton",
            ));
        }
        if self.td_count == 0 {
            return Err(HcdError::InvalidConfig("td_count must be non-zero"));
        }
        if self.max_iso_frames == 0 || self.max_iso_frames >= 1024 {
            return Err(HcdError::InvalidConfig(
                "max_iso_frames must be between 1 and 1023",
            ));
        }
        if self.iso_asap_delay_frames == 0 || self.iso_asap_delay_frames >= 1024 {
            return Err(HcdError::InvalidConfig(
                "iso_asap_delay_frames must be between 1 and 1023",
            ));
        }
        let end = u64::from(self.dma_base)
            + 4096
            + u64::from(self.qh_count) * 16
            + u64::from(self.td_count) * 32
            + u64::from(self.buffer_bytes)
            + 64;
        if end > u64::from(u32::MAX) {
            return Err(HcdError::InvalidConfig(
                "DMA region does not fit in the 32-bit bus address space",
            ));
        }
        Ok(())
    }
}
