//! Completion walker: inspects what the controller wrote back, retires finished requests and
//! re-arms periodic ones.

use tracing::{debug, trace, warn};

use crate::dma::DmaMemory;
use crate::error::TransferError;
use crate::frame::slot_of;
use crate::hw::{
    self, Link, Pid, LEN_FIELD_ZERO, TD_CTRL_ACTIVE, TD_CTRL_ACTLEN_MASK, TD_CTRL_CERR_MASK,
    TD_CTRL_CERR_SHIFT, TD_CTRL_STATUS_MASK, TD_TOKEN_D,
};
use crate::request::{PipeType, RequestState, TransferFlags};
use crate::state::{Delivery, HcdState, Shared, Tick};
use crate::transfer::{map_status, Stage, Transfer};

enum Progress {
    Pending,
    Done(Result<(), TransferError>),
}

impl HcdState {
    /// One completion pass: deferred frees that are due, then every active request newest
    /// first. Returns the completions to deliver once the lock is dropped.
    pub(crate) fn scan(&mut self, shared: &Shared, tick: Tick) -> Vec<Delivery> {
        let mut done = Vec::new();
        self.free_unlinked(shared, tick.frame, false, &mut done);

        // Retiring the head of a bulk queue promotes its successor, which may already be
        // finished as well; walk again until nothing moves. Every repeat retires a request.
        let mut passes = self.active.len();
        while passes > 0 && self.walk_active(shared, tick, &mut done) {
            passes -= 1;
        }

        shared.pool.reclaim(tick.frame);
        done
    }

    fn walk_active(&mut self, shared: &Shared, tick: Tick, done: &mut Vec<Delivery>) -> bool {
        let mut promoted = false;
        let mut i = self.active.len();
        while i > 0 {
            i -= 1;
            if i >= self.active.len() {
                continue;
            }
            if self.active[i].pipe == PipeType::Bulk && !self.is_queue_head(i) {
                continue;
            }
            match self.evaluate(&shared.mem, i, tick) {
                Progress::Pending => {}
                Progress::Done(status) => {
                    let t = &self.active[i];
                    if t.pipe == PipeType::Interrupt && t.interval > 0 && status.is_ok() {
                        self.rearm_interrupt(shared, i, tick, done);
                    } else {
                        promoted |= self.retire(shared, i, status, tick, done);
                    }
                }
            }
        }
        promoted
    }

    fn is_queue_head(&self, i: usize) -> bool {
        let t = &self.active[i];
        self.endpoints
            .get(&t.key)
            .and_then(|ep| ep.bulk_queue.first())
            .map_or(true, |&head| head == t.handle)
    }

    fn evaluate(&mut self, mem: &DmaMemory, i: usize, tick: Tick) -> Progress {
        let t = &mut self.active[i];
        if t.toggle_mismatch {
            return Progress::Done(Err(TransferError::DataToggleMismatch));
        }

        if t.pipe == PipeType::Isochronous {
            let all_retired = t
                .tds
                .iter()
                .all(|td| !hw::read_td_status(mem, td.id).active());
            // Packets whose frame has gone by without the controller picking them up are missed.
            return if all_retired || tick.frame >= t.iso_end() {
                Progress::Done(Ok(()))
            } else {
                Progress::Pending
            };
        }

        let status_idx = t.tds.len().saturating_sub(1);
        let mut short = false;
        let mut idx = 0;
        while idx < t.tds.len() {
            let td = t.tds[idx];
            let st = hw::read_td_status(mem, td.id);
            if st.active() {
                return Progress::Pending;
            }
            if st.has_error() {
                return Progress::Done(Err(map_status(st, td.pid)));
            }
            if td.stage == Stage::Data && td.pid == Pid::In && st.actual_len() < td.len {
                short = true;
                if t.pipe != PipeType::Control {
                    break;
                }
                // Short control read: the controller stopped on the data stage, so the status
                // stage is started by hand. Only once.
                let status_td = t.tds[status_idx];
                if !t.status_rearmed && hw::read_td_status(mem, status_td.id).active() {
                    if let Some(qh) = t.qh {
                        mem.publish_barrier();
                        hw::write_qh_element(mem, qh, Link::Td(status_td.id));
                    }
                    t.status_rearmed = true;
                    trace!(handle = %t.handle, "short control read, status stage re-armed");
                    return Progress::Pending;
                }
                idx = status_idx.max(idx + 1);
                continue;
            }
            idx += 1;
        }

        if short && t.flags.contains(TransferFlags::SHORT_NOT_OK) {
            Progress::Done(Err(TransferError::ShortPacket))
        } else {
            Progress::Done(Ok(()))
        }
    }

    /// Delivers a periodic interrupt completion and puts the TD back in service with the next
    /// toggle.
    fn rearm_interrupt(&mut self, shared: &Shared, i: usize, tick: Tick, done: &mut Vec<Delivery>) {
        let mem = &*shared.mem;
        let t = &mut self.active[i];
        let completion = t.completion(mem, Ok(()));
        let callback = t.on_complete.clone();

        let Some(qh) = t.qh else {
            return;
        };
        let Some(td) = t.tds.first_mut() else {
            return;
        };
        td.toggle = !td.toggle;
        let toggle = td.toggle;
        let id = td.id;

        let token = hw::read_td_token_raw(mem, id) & !TD_TOKEN_D;
        hw::write_td_token_raw(mem, id, if toggle { token | TD_TOKEN_D } else { token });
        let ctrl = hw::read_td_status(mem, id).0
            & !(TD_CTRL_STATUS_MASK | TD_CTRL_ACTLEN_MASK | TD_CTRL_CERR_MASK);
        hw::write_td_status(
            mem,
            id,
            ctrl | TD_CTRL_ACTIVE | LEN_FIELD_ZERO | (3 << TD_CTRL_CERR_SHIFT),
        );
        mem.publish_barrier();
        hw::write_qh_element(mem, qh, Link::Td(id));

        t.last_activity = tick.uptime;
        trace!(handle = %t.handle, toggle, "interrupt transfer re-armed");
        done.push((callback, completion));
    }

    /// Unhooks a finished request, hands its descriptors to the pool and queues its completion.
    /// Returns true if a queued bulk request took its place in the schedule.
    fn retire(
        &mut self,
        shared: &Shared,
        i: usize,
        status: Result<(), TransferError>,
        tick: Tick,
        done: &mut Vec<Delivery>,
    ) -> bool {
        let mem = &*shared.mem;
        let mut t = self.active.remove(i);
        if status == Err(TransferError::Stall) && t.pipe != PipeType::Control {
            self.endpoint(t.key).halted = true;
            warn!(
                handle = %t.handle,
                device = t.key.device,
                endpoint = t.key.endpoint,
                "endpoint halted"
            );
        }

        let promoted = self.detach(mem, &mut t);
        let completion = t.completion(mem, status);
        for desc in t.descriptors() {
            shared.pool.free(desc, tick.frame);
        }
        t.state = RequestState::Freed;
        debug!(
            handle = %t.handle,
            ?status,
            actual = completion.actual_length,
            frame = tick.frame,
            "retired"
        );
        done.push((t.on_complete.take(), completion));
        promoted
    }

    /// Removes a request's descriptors from every hardware-reachable chain. The descriptors
    /// themselves stay untouched. Returns true if a queued bulk request was promoted.
    pub(crate) fn detach(&mut self, mem: &DmaMemory, t: &mut Transfer) -> bool {
        self.fsbr_release(mem, t);
        match t.pipe {
            PipeType::Isochronous => {
                for td in &t.tds {
                    self.schedule.unlink_iso_td(mem, slot_of(td.frame), td.id);
                }
                false
            }
            PipeType::Bulk => self.bulk_dequeue(mem, t),
            PipeType::Interrupt => {
                if let Some(qh) = t.qh {
                    self.schedule.unlink_qh(mem, qh);
                }
                // A TD that never moved data leaves the endpoint on the toggle it was armed with.
                let armed = t.tds.first().map(|td| td.toggle);
                if let Some(toggle) = t.resume_toggle(mem).or(armed) {
                    self.endpoint(t.key).toggle = toggle;
                }
                false
            }
            PipeType::Control => {
                if let Some(qh) = t.qh {
                    self.schedule.unlink_qh(mem, qh);
                }
                false
            }
        }
    }

    /// Takes a bulk request out of its endpoint queue, re-sequencing the toggles of everything
    /// queued behind it first.
    fn bulk_dequeue(&mut self, mem: &DmaMemory, t: &Transfer) -> bool {
        let queue = self
            .endpoints
            .get(&t.key)
            .map(|ep| ep.bulk_queue.clone())
            .unwrap_or_default();
        let Some(pos) = queue.iter().position(|&h| h == t.handle) else {
            warn!(handle = %t.handle, "bulk transfer missing from its endpoint queue");
            if let Some(qh) = t.qh {
                if self.schedule.is_linked(qh) {
                    self.schedule.unlink_qh(mem, qh);
                }
            }
            return false;
        };

        let mut toggle = match t.resume_toggle(mem) {
            Some(toggle) => toggle,
            None => self.endpoint(t.key).toggle,
        };
        for &handle in &queue[pos + 1..] {
            if let Some(next) = self.transfer_mut(handle) {
                toggle = resequence_toggles(mem, next, toggle);
            }
        }

        let successor = queue
            .get(pos + 1)
            .and_then(|&h| self.transfer(h))
            .and_then(|next| next.qh);
        if pos == 0 {
            match (t.qh, successor) {
                (Some(qh), Some(next)) => {
                    self.schedule.replace_qh(mem, qh, next);
                }
                (Some(qh), None) => {
                    self.schedule.unlink_qh(mem, qh);
                }
                (None, _) => {}
            }
        } else {
            let pred_bottom = self
                .transfer(queue[pos - 1])
                .and_then(|pred| pred.bottom_qh);
            if let Some(pred_bottom) = pred_bottom {
                let bypass = match t.bottom_qh {
                    Some(bottom) => hw::read_qh_element(mem, bottom),
                    None => Link::Terminate,
                };
                hw::write_qh_element(mem, pred_bottom, bypass);
            }
        }

        let ep = self.endpoint(t.key);
        ep.bulk_queue.retain(|&h| h != t.handle);
        ep.toggle = toggle;
        pos == 0 && successor.is_some()
    }
}

/// Rewrites the toggles of a queued bulk request so it starts with `toggle`. Returns the toggle
/// following its last packet.
fn resequence_toggles(mem: &DmaMemory, t: &mut Transfer, mut toggle: bool) -> bool {
    let mut mismatch = false;
    for td in t.tds.iter_mut() {
        if td.toggle != toggle {
            if hw::read_td_status(mem, td.id).active() {
                let token = hw::read_td_token_raw(mem, td.id) ^ TD_TOKEN_D;
                hw::write_td_token_raw(mem, td.id, token);
                td.toggle = toggle;
            } else {
                mismatch = true;
            }
        }
        toggle = !toggle;
    }
    if mismatch {
        warn!(handle = %t.handle, "queued bulk transfer already ran with the wrong toggle");
        t.toggle_mismatch = true;
    }
    toggle
}
