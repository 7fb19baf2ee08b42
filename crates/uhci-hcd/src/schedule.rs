//! The hardware-walkable schedule: the 1024-entry frame list, the interrupt anchor tree and the
//! control/bulk chain.
//!
//! ```text
//! slot n ──> int[k] ──> int[k-1] ──> .. ──> int[0] ──> ls_control ──> fs_control ──> bulk ──> chain_end
//!                                                                        ^                       │
//!                                                                        └── reclamation loop ───┘
//! ```
//!
//! Slot `n` enters the tree at `int[k]` where `2^k` is the largest power of two dividing `n + 1`
//! (capped at 128), so `int[k]` runs once every `2^k` frames. Isochronous TDs are pushed on the
//! front of individual frame slots, ahead of the tree.
//!
//! The controller walks these links concurrently with every mutation here. Each splice writes the
//! new descriptor's outgoing link first, issues [`DmaMemory::publish_barrier`], and only then
//! redirects the predecessor, so any intermediate state is a valid schedule. The horizontal order
//! of linked QHs is mirrored in software (`next`/`prev`) so predecessors never have to be found by
//! walking DMA memory.

use std::collections::{BTreeSet, HashMap};

use tracing::{error, trace};

use crate::dma::{DmaMemory, FRAME_LIST_ENTRIES};
use crate::hw::{self, decode_link, encode_link, Link, QhId, TdId};

pub const INTERRUPT_ANCHORS: usize = 8;
/// Interrupt anchors, low-speed control, full-speed control, bulk, chain end.
pub const SKELETON_QH_COUNT: usize = INTERRUPT_ANCHORS + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before,
    After,
}

/// Anchor index for an interrupt polling interval: the interval rounded down to a power of two,
/// as a log2 clamped to the deepest anchor.
pub fn anchor_for_interval(interval: u8) -> usize {
    if interval <= 1 {
        return 0;
    }
    (7 - interval.leading_zeros() as usize).min(INTERRUPT_ANCHORS - 1)
}

/// Interrupt anchor a frame slot enters the tree at.
pub fn slot_anchor(slot: usize) -> usize {
    ((slot + 1).trailing_zeros() as usize).min(INTERRUPT_ANCHORS - 1)
}

#[derive(Debug)]
pub struct Schedule {
    int_anchors: [QhId; INTERRUPT_ANCHORS],
    ls_control: QhId,
    fs_control: QhId,
    bulk: QhId,
    chain_end: QhId,
    next: HashMap<QhId, QhId>,
    prev: HashMap<QhId, QhId>,
    reclamation: bool,
}

impl Schedule {
    pub fn new(skeleton: [QhId; SKELETON_QH_COUNT]) -> Self {
        let mut int_anchors = [skeleton[0]; INTERRUPT_ANCHORS];
        int_anchors.copy_from_slice(&skeleton[..INTERRUPT_ANCHORS]);
        Self {
            int_anchors,
            ls_control: skeleton[INTERRUPT_ANCHORS],
            fs_control: skeleton[INTERRUPT_ANCHORS + 1],
            bulk: skeleton[INTERRUPT_ANCHORS + 2],
            chain_end: skeleton[INTERRUPT_ANCHORS + 3],
            next: HashMap::new(),
            prev: HashMap::new(),
            reclamation: false,
        }
    }

    /// Writes the skeleton and points every frame slot into it, dropping whatever was linked
    /// before. Only valid while the controller is stopped.
    pub fn rebuild(&mut self, mem: &DmaMemory) {
        self.next.clear();
        self.prev.clear();
        self.reclamation = false;

        let chain = self.skeleton_chain();
        hw::write_qh(mem, self.chain_end, Link::Terminate, Link::Terminate);
        for pair in chain.windows(2).rev() {
            hw::write_qh(mem, pair[0], Link::Qh(pair[1]), Link::Terminate);
            self.next.insert(pair[0], pair[1]);
            self.prev.insert(pair[1], pair[0]);
        }

        let layout = mem.layout();
        for slot in 0..FRAME_LIST_ENTRIES {
            let anchor = self.int_anchors[slot_anchor(slot)];
            mem.write_u32(
                layout.frame_slot_addr(slot),
                encode_link(layout, Link::Qh(anchor), false),
            );
        }
        mem.publish_barrier();
        trace!("schedule skeleton rebuilt");
    }

    fn skeleton_chain(&self) -> Vec<QhId> {
        let mut chain: Vec<QhId> = self.int_anchors.iter().rev().copied().collect();
        chain.extend([self.ls_control, self.fs_control, self.bulk, self.chain_end]);
        chain
    }

    pub fn interrupt_anchor(&self, k: usize) -> QhId {
        self.int_anchors[k.min(INTERRUPT_ANCHORS - 1)]
    }

    pub fn ls_control(&self) -> QhId {
        self.ls_control
    }

    pub fn fs_control(&self) -> QhId {
        self.fs_control
    }

    pub fn bulk(&self) -> QhId {
        self.bulk
    }

    pub fn chain_end(&self) -> QhId {
        self.chain_end
    }

    pub fn is_linked(&self, qh: QhId) -> bool {
        self.prev.contains_key(&qh) || self.next.contains_key(&qh)
    }

    pub fn next_of(&self, qh: QhId) -> Option<QhId> {
        self.next.get(&qh).copied()
    }

    pub fn prev_of(&self, qh: QhId) -> Option<QhId> {
        self.prev.get(&qh).copied()
    }

    /// Links a fully built QH into the horizontal chain next to `anchor`.
    pub fn insert_qh(&mut self, mem: &DmaMemory, anchor: QhId, new: QhId, pos: Position) -> bool {
        let (pred, succ) = match pos {
            Position::After => (anchor, self.next_of(anchor)),
            Position::Before => match self.prev_of(anchor) {
                Some(pred) => (pred, Some(anchor)),
                None => {
                    error!(anchor = anchor.index(), "BUG: insert before a QH with no predecessor");
                    return false;
                }
            },
        };

        // Inherit exactly what the controller currently sees after `pred`.
        hw::write_qh_head_raw(mem, new, hw::read_qh_head_raw(mem, pred));
        mem.publish_barrier();
        hw::write_qh_head(mem, pred, Link::Qh(new));

        self.next.insert(pred, new);
        self.prev.insert(new, pred);
        if let Some(succ) = succ {
            self.next.insert(new, succ);
            self.prev.insert(succ, new);
        }
        trace!(qh = new.index(), pred = pred.index(), "qh linked");
        true
    }

    /// Unhooks `qh` from the horizontal chain. Its own head link is left intact so a controller
    /// already standing on it still finds its way back into the schedule.
    pub fn unlink_qh(&mut self, mem: &DmaMemory, qh: QhId) -> bool {
        let Some(pred) = self.prev.remove(&qh) else {
            error!(qh = qh.index(), "BUG: unlinking a QH that is not in the schedule");
            return false;
        };
        hw::write_qh_head_raw(mem, pred, hw::read_qh_head_raw(mem, qh));
        match self.next.remove(&qh) {
            Some(succ) => {
                self.next.insert(pred, succ);
                self.prev.insert(succ, pred);
            }
            None => {
                self.next.remove(&pred);
            }
        }
        trace!(qh = qh.index(), pred = pred.index(), "qh unlinked");
        true
    }

    /// Puts `new` in the horizontal position of `old`. `old` keeps pointing at `new`, so a
    /// controller that was on `old` continues through `new`.
    pub fn replace_qh(&mut self, mem: &DmaMemory, old: QhId, new: QhId) -> bool {
        let Some(pred) = self.prev_of(old) else {
            error!(qh = old.index(), "BUG: replacing a QH that is not in the schedule");
            return false;
        };
        hw::write_qh_head_raw(mem, new, hw::read_qh_head_raw(mem, old));
        mem.publish_barrier();
        hw::write_qh_head(mem, old, Link::Qh(new));
        hw::write_qh_head(mem, pred, Link::Qh(new));

        self.prev.remove(&old);
        self.next.insert(pred, new);
        self.prev.insert(new, pred);
        if let Some(succ) = self.next.remove(&old) {
            self.next.insert(new, succ);
            self.prev.insert(succ, new);
        }
        true
    }

    /// Appends an already built TD (or TD chain) to the vertical queue of `qh`.
    pub fn insert_td_in_queue(&self, mem: &DmaMemory, qh: QhId, td: TdId) {
        let mut last = match hw::read_qh_element(mem, qh) {
            Link::Td(first) => first,
            Link::Terminate | Link::Qh(_) => {
                mem.publish_barrier();
                hw::write_qh_element(mem, qh, Link::Td(td));
                return;
            }
        };
        for _ in 0..mem.layout().td_count() {
            match hw::read_td_link(mem, last) {
                Link::Td(next) => last = next,
                _ => break,
            }
        }
        mem.publish_barrier();
        hw::write_td_link(mem, last, Link::Td(td), true);
    }

    /// Points the link of `td` at `qh`, making `qh` the continuation of the TD's queue.
    pub fn append_qh_after_td(&self, mem: &DmaMemory, td: TdId, qh: QhId) {
        mem.publish_barrier();
        hw::write_td_link(mem, td, Link::Qh(qh), true);
    }

    pub fn reclamation_enabled(&self) -> bool {
        self.reclamation
    }

    /// Opens or closes the bandwidth reclamation loop from the chain end back to full-speed
    /// control.
    pub fn set_reclamation_loop(&mut self, mem: &DmaMemory, enabled: bool) {
        if self.reclamation == enabled {
            return;
        }
        let head = if enabled {
            Link::Qh(self.fs_control)
        } else {
            Link::Terminate
        };
        hw::write_qh_head(mem, self.chain_end, head);
        self.reclamation = enabled;
        trace!(enabled, "reclamation loop");
    }

    /// Pushes an isochronous TD on the front of frame slot `slot`.
    pub fn link_iso_td(&self, mem: &DmaMemory, slot: usize, td: TdId) {
        let layout = mem.layout();
        let slot_addr = layout.frame_slot_addr(slot);
        hw::write_td_link_raw(mem, td, mem.read_u32(slot_addr));
        mem.publish_barrier();
        mem.write_u32(slot_addr, encode_link(layout, Link::Td(td), false));
    }

    /// Removes an isochronous TD from frame slot `slot`. Returns false if it was not found.
    pub fn unlink_iso_td(&self, mem: &DmaMemory, slot: usize, td: TdId) -> bool {
        let layout = mem.layout();
        let slot_addr = layout.frame_slot_addr(slot);
        let bypass = hw::read_td_link_raw(mem, td);

        if decode_link(layout, mem.read_u32(slot_addr)) == Link::Td(td) {
            mem.write_u32(slot_addr, bypass);
            return true;
        }
        let mut cur = decode_link(layout, mem.read_u32(slot_addr));
        for _ in 0..layout.td_count() {
            let Link::Td(pred) = cur else {
                break;
            };
            let next = hw::read_td_link(mem, pred);
            if next == Link::Td(td) {
                hw::write_td_link_raw(mem, pred, bypass);
                return true;
            }
            cur = next;
        }
        error!(td = td.index(), slot, "BUG: isochronous TD not found in its frame slot");
        false
    }

    /// Bus addresses of every TD and QH the controller can reach from the frame list.
    pub fn reachable(mem: &DmaMemory) -> BTreeSet<u32> {
        let layout = mem.layout();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Link> = (0..FRAME_LIST_ENTRIES)
            .map(|slot| decode_link(layout, mem.read_u32(layout.frame_slot_addr(slot))))
            .collect();
        while let Some(link) = stack.pop() {
            match link {
                Link::Terminate => {}
                Link::Td(td) => {
                    if seen.insert(layout.td_addr(td)) {
                        stack.push(hw::read_td_link(mem, td));
                    }
                }
                Link::Qh(qh) => {
                    if seen.insert(layout.qh_addr(qh)) {
                        stack.push(hw::read_qh_head(mem, qh));
                        stack.push(hw::read_qh_element(mem, qh));
                    }
                }
            }
        }
        seen
    }
}
