//! Timer-driven housekeeping: per-request timeouts and bandwidth reclamation idling.

use tracing::{debug, trace};

use crate::error::TransferError;
use crate::hw;
use crate::state::{HcdState, Shared, Tick};

impl HcdState {
    /// Cancels every request whose deadline has passed. They complete with
    /// [`TransferError::TimedOut`] through the normal two-phase unlink.
    pub(crate) fn expire_timeouts(&mut self, shared: &Shared, tick: Tick) {
        while let Some(i) = self
            .active
            .iter()
            .position(|t| t.deadline.is_some_and(|deadline| deadline <= tick.uptime))
        {
            debug!(handle = %self.active[i].handle, frame = tick.frame, "transfer timed out");
            self.begin_unlink(shared, i, tick.frame, TransferError::TimedOut);
        }
    }

    /// Drops requests that made no progress for `fsbr_idle_timeout` out of the reclamation loop,
    /// and takes them back in once the controller moves their queue again.
    pub(crate) fn idle_reclamation(&mut self, shared: &Shared, tick: Tick) {
        let mem = &*shared.mem;
        let idle = shared.config.fsbr_idle_timeout;
        for i in 0..self.active.len() {
            let t = &mut self.active[i];
            let Some(qh) = t.qh else {
                continue;
            };
            if !t.fsbr_eligible {
                continue;
            }

            let element = hw::read_qh_element_raw(mem, qh);
            if element != t.element_snapshot {
                t.element_snapshot = element;
                t.last_activity = tick.uptime;
                if !t.fsbr {
                    t.fsbr = true;
                    trace!(handle = %t.handle, "fsbr resumed");
                    self.loop_acquire(mem);
                }
            } else if t.fsbr && tick.uptime.saturating_sub(t.last_activity) >= idle {
                t.fsbr = false;
                trace!(handle = %t.handle, "fsbr idle");
                self.loop_release(mem);
            }
        }
    }
}
