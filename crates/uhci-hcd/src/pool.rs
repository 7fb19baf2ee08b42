//! Descriptor pool: TD/QH slots and DMA bounce buffers with frame-stamped cooldown.
//!
//! Slots never move, so a descriptor's bus address is stable for its whole lifetime. A freed
//! descriptor is not reusable straight away: it sits on the cooldown list stamped with the frame
//! it was released in and only returns to the free list once the frame counter has moved past
//! that frame. The pool has its own lock, independent of the schedule lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::dma::{DmaMemory, BUFFER_ALIGN};
use crate::error::{HcdError, Result};
use crate::hw::{self, Link, QhId, TdId, LINK_PTR_T};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    addr: u32,
    len: u32,
}

impl DmaBuffer {
    pub const EMPTY: DmaBuffer = DmaBuffer { addr: 0, len: 0 };

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Td(TdId),
    Qh(QhId),
    Buffer(DmaBuffer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Allocated,
    CoolingDown,
}

pub struct DescriptorPool {
    mem: Arc<DmaMemory>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    td_free: VecDeque<TdId>,
    qh_free: VecDeque<QhId>,
    td_state: Vec<SlotState>,
    qh_state: Vec<SlotState>,
    buffers: BufferArena,
    cooldown: VecDeque<(u64, Descriptor)>,
}

impl DescriptorPool {
    pub fn new(mem: Arc<DmaMemory>) -> Self {
        let layout = *mem.layout();
        let inner = PoolInner {
            td_free: (0..layout.td_count()).map(TdId::new).collect(),
            qh_free: (0..layout.qh_count()).map(QhId::new).collect(),
            td_state: vec![SlotState::Free; usize::from(layout.td_count())],
            qh_state: vec![SlotState::Free; usize::from(layout.qh_count())],
            buffers: BufferArena::new(layout.buffer_base(), layout.buffer_len()),
            cooldown: VecDeque::new(),
        };
        Self {
            mem,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate_td(&self) -> Result<TdId> {
        let td = {
            let mut inner = self.lock();
            let td = inner.td_free.pop_front().ok_or(HcdError::OutOfDescriptors)?;
            inner.td_state[usize::from(td.index())] = SlotState::Allocated;
            td
        };
        // Start from an inert descriptor: terminated link, inactive status.
        hw::write_td_link_raw(&self.mem, td, LINK_PTR_T);
        hw::write_td_status(&self.mem, td, 0);
        hw::write_td_token_raw(&self.mem, td, 0);
        trace!(td = td.index(), "allocate td");
        Ok(td)
    }

    pub fn allocate_qh(&self) -> Result<QhId> {
        let qh = {
            let mut inner = self.lock();
            let qh = inner.qh_free.pop_front().ok_or(HcdError::OutOfDescriptors)?;
            inner.qh_state[usize::from(qh.index())] = SlotState::Allocated;
            qh
        };
        hw::write_qh(&self.mem, qh, Link::Terminate, Link::Terminate);
        trace!(qh = qh.index(), "allocate qh");
        Ok(qh)
    }

    pub fn allocate_buffer(&self, len: usize) -> Result<DmaBuffer> {
        if len == 0 {
            return Ok(DmaBuffer::EMPTY);
        }
        let size = u32::try_from(len).map_err(|_| HcdError::OutOfBufferSpace { requested: len })?;
        self.lock()
            .buffers
            .alloc(size)
            .ok_or(HcdError::OutOfBufferSpace { requested: len })
    }

    /// Hands a descriptor back. It becomes reusable once `reclaim` sees a frame after
    /// `last_used_frame`.
    pub fn free(&self, desc: Descriptor, last_used_frame: u64) {
        let mut inner = self.lock();
        match desc {
            Descriptor::Td(td) => {
                let state = &mut inner.td_state[usize::from(td.index())];
                if *state != SlotState::Allocated {
                    error!(td = td.index(), ?state, "BUG: freeing td that is not allocated");
                    return;
                }
                *state = SlotState::CoolingDown;
            }
            Descriptor::Qh(qh) => {
                let state = &mut inner.qh_state[usize::from(qh.index())];
                if *state != SlotState::Allocated {
                    error!(qh = qh.index(), ?state, "BUG: freeing qh that is not allocated");
                    return;
                }
                *state = SlotState::CoolingDown;
            }
            Descriptor::Buffer(buf) if buf.is_empty() => return,
            Descriptor::Buffer(_) => {}
        }
        inner.cooldown.push_back((last_used_frame, desc));
    }

    /// Returns cooled-down descriptors to the free lists. Returns how many were reclaimed.
    pub fn reclaim(&self, current_frame: u64) -> usize {
        let mut inner = self.lock();
        let mut n = 0;
        while let Some(&(stamp, desc)) = inner.cooldown.front() {
            if stamp >= current_frame {
                break;
            }
            inner.cooldown.pop_front();
            inner.release(desc);
            n += 1;
        }
        if n != 0 {
            trace!(n, current_frame, "reclaimed descriptors");
        }
        n
    }

    /// Reclaims everything on the cooldown list. Only valid while the controller is stopped.
    pub fn force_reclaim(&self) -> usize {
        let mut inner = self.lock();
        let mut n = 0;
        while let Some((_, desc)) = inner.cooldown.pop_front() {
            inner.release(desc);
            n += 1;
        }
        n
    }

    pub fn td_state(&self, td: TdId) -> SlotState {
        self.lock().td_state[usize::from(td.index())]
    }

    pub fn qh_state(&self, qh: QhId) -> SlotState {
        self.lock().qh_state[usize::from(qh.index())]
    }

    /// State of the TD or QH slot at `addr`, if `addr` is a descriptor slot.
    pub fn slot_state(&self, addr: u32) -> Option<SlotState> {
        let layout = self.mem.layout();
        if let Some(td) = layout.td_from_addr(addr) {
            return Some(self.td_state(td));
        }
        layout.qh_from_addr(addr).map(|qh| self.qh_state(qh))
    }

    pub fn free_td_count(&self) -> usize {
        self.lock().td_free.len()
    }

    pub fn free_qh_count(&self) -> usize {
        self.lock().qh_free.len()
    }

    pub fn cooling_count(&self) -> usize {
        self.lock().cooldown.len()
    }
}

impl PoolInner {
    fn release(&mut self, desc: Descriptor) {
        match desc {
            Descriptor::Td(td) => {
                self.td_state[usize::from(td.index())] = SlotState::Free;
                self.td_free.push_back(td);
            }
            Descriptor::Qh(qh) => {
                self.qh_state[usize::from(qh.index())] = SlotState::Free;
                self.qh_free.push_back(qh);
            }
            Descriptor::Buffer(buf) => self.buffers.free(buf),
        }
    }
}

/// First-fit allocator over the bounce-buffer region. Free ranges stay sorted and coalesced.
struct BufferArena {
    free: Vec<(u32, u32)>,
}

impl BufferArena {
    fn new(base: u32, len: u32) -> Self {
        let free = if len == 0 { Vec::new() } else { vec![(base, len)] };
        Self { free }
    }

    fn alloc(&mut self, size: u32) -> Option<DmaBuffer> {
        let size = size.checked_add(BUFFER_ALIGN - 1)? & !(BUFFER_ALIGN - 1);
        let idx = self.free.iter().position(|&(_, len)| len >= size)?;
        let (addr, len) = self.free[idx];
        if len == size {
            self.free.remove(idx);
        } else {
            self.free[idx] = (addr + size, len - size);
        }
        Some(DmaBuffer { addr, len: size })
    }

    fn free(&mut self, buf: DmaBuffer) {
        let idx = self.free.partition_point(|&(addr, _)| addr < buf.addr);
        self.free.insert(idx, (buf.addr, buf.len));
        if idx + 1 < self.free.len() {
            let (addr, len) = self.free[idx];
            let (next_addr, next_len) = self.free[idx + 1];
            if addr + len == next_addr {
                self.free[idx] = (addr, len + next_len);
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (prev_addr, prev_len) = self.free[idx - 1];
            let (addr, len) = self.free[idx];
            if prev_addr + prev_len == addr {
                self.free[idx - 1] = (prev_addr, prev_len + len);
                self.free.remove(idx);
            }
        }
    }
}
