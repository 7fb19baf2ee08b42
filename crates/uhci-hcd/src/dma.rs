//! DMA-visible memory shared between the driver and the controller.
//!
//! The region is one contiguous block of 32-bit words addressed by bus address. The controller
//! reads (and writes back TD status) concurrently with the driver, so every word is an atomic:
//! driver writes use `Release`, reads use `Acquire`, and [`DmaMemory::publish_barrier`] orders a
//! fully built descriptor chain before the link that makes it reachable.
//!
//! Layout, from `dma_base`:
//! - the 1024-entry frame list (4 KiB)
//! - the QH region (16 bytes per QH)
//! - the TD region (32 bytes per TD, hardware uses the first 16)
//! - the bounce-buffer region for setup packets and transfer data

use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::hw::{QhId, TdId};

pub const FRAME_LIST_ENTRIES: usize = 1024;
pub const FRAME_LIST_BYTES: u32 = (FRAME_LIST_ENTRIES * 4) as u32;
pub const QH_STRIDE: u32 = 16;
pub const TD_STRIDE: u32 = 32;
pub const BUFFER_ALIGN: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaLayout {
    base: u32,
    qh_base: u32,
    qh_count: u16,
    td_base: u32,
    td_count: u16,
    buffer_base: u32,
    buffer_len: u32,
}

impl DmaLayout {
    pub fn new(base: u32, qh_count: u16, td_count: u16, buffer_bytes: u32) -> Self {
        let qh_base = base + FRAME_LIST_BYTES;
        let td_base = align_up(qh_base + u32::from(qh_count) * QH_STRIDE, TD_STRIDE);
        let buffer_base = align_up(td_base + u32::from(td_count) * TD_STRIDE, BUFFER_ALIGN);
        Self {
            base,
            qh_base,
            qh_count,
            td_base,
            td_count,
            buffer_base,
            buffer_len: align_up(buffer_bytes, BUFFER_ALIGN),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn frame_list_base(&self) -> u32 {
        self.base
    }

    pub fn frame_slot_addr(&self, slot: usize) -> u32 {
        self.base + (slot % FRAME_LIST_ENTRIES) as u32 * 4
    }

    pub fn qh_count(&self) -> u16 {
        self.qh_count
    }

    pub fn td_count(&self) -> u16 {
        self.td_count
    }

    pub fn qh_addr(&self, qh: QhId) -> u32 {
        self.qh_base + u32::from(qh.index()) * QH_STRIDE
    }

    pub fn td_addr(&self, td: TdId) -> u32 {
        self.td_base + u32::from(td.index()) * TD_STRIDE
    }

    pub fn qh_from_addr(&self, addr: u32) -> Option<QhId> {
        let off = addr.checked_sub(self.qh_base)?;
        if off % QH_STRIDE != 0 {
            return None;
        }
        let idx = off / QH_STRIDE;
        (idx < u32::from(self.qh_count)).then(|| QhId::new(idx as u16))
    }

    pub fn td_from_addr(&self, addr: u32) -> Option<TdId> {
        let off = addr.checked_sub(self.td_base)?;
        if off % TD_STRIDE != 0 {
            return None;
        }
        let idx = off / TD_STRIDE;
        (idx < u32::from(self.td_count)).then(|| TdId::new(idx as u16))
    }

    pub fn buffer_base(&self) -> u32 {
        self.buffer_base
    }

    pub fn buffer_len(&self) -> u32 {
        self.buffer_len
    }

    pub fn end(&self) -> u32 {
        self.buffer_base + self.buffer_len
    }

    pub fn total_bytes(&self) -> u32 {
        self.end() - self.base
    }
}

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

pub struct DmaMemory {
    layout: DmaLayout,
    words: Box<[AtomicU32]>,
}

impl DmaMemory {
    pub fn new(layout: DmaLayout) -> Self {
        let len = (layout.total_bytes() / 4) as usize;
        let words = (0..len).map(|_| AtomicU32::new(0)).collect();
        Self { layout, words }
    }

    pub fn layout(&self) -> &DmaLayout {
        &self.layout
    }

    fn word(&self, addr: u32) -> Option<&AtomicU32> {
        let off = addr.checked_sub(self.layout.base)?;
        if off % 4 != 0 {
            return None;
        }
        self.words.get((off / 4) as usize)
    }

    /// Reads a 32-bit word. Addresses outside the region read as zero, matching an open bus.
    pub fn read_u32(&self, addr: u32) -> u32 {
        self.word(addr).map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Writes a 32-bit word. Writes outside the region are dropped.
    pub fn write_u32(&self, addr: u32, value: u32) {
        if let Some(w) = self.word(addr) {
            w.store(value, Ordering::Release);
        }
    }

    /// Full fence between building a descriptor and publishing the link that reaches it.
    pub fn publish_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    pub fn read_physical(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u32);
            let word = self.read_u32(a & !3);
            *b = (word >> ((a & 3) * 8)) as u8;
        }
    }

    /// Byte writes are read-modify-write on the containing word. Callers only use this on buffers
    /// they currently own (not concurrently written by the controller).
    pub fn write_physical(&self, addr: u32, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            let Some(w) = self.word(a & !3) else {
                continue;
            };
            let shift = (a & 3) * 8;
            let old = w.load(Ordering::Acquire);
            let new = (old & !(0xff << shift)) | (u32::from(*b) << shift);
            w.store(new, Ordering::Release);
        }
    }
}

impl core::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
