//! Two-phase cancellation.
//!
//! Phase one runs under the schedule lock and never waits: the request's descriptors are unhooked
//! from every chain the controller can reach, the current frame is stamped on the record and the
//! record moves to the unlinked list. The controller may still be holding a pointer into the old
//! chain for the rest of that frame, so phase two (returning descriptors to the pool and
//! delivering the completion) only happens once the frame counter has moved past the stamp.

use tracing::debug;

use crate::error::{HcdError, Result, TransferError};
use crate::request::{RequestHandle, RequestState};
use crate::state::{Delivery, HcdState, Shared};

impl HcdState {
    pub(crate) fn cancel(
        &mut self,
        shared: &Shared,
        handle: RequestHandle,
        frame: u64,
        reason: TransferError,
    ) -> Result<()> {
        if let Some(i) = self.position(handle) {
            self.begin_unlink(shared, i, frame, reason);
            return Ok(());
        }
        if self.unlinked.iter().any(|t| t.handle == handle) {
            return Ok(());
        }
        Err(HcdError::UnknownRequest)
    }

    /// Phase one for `self.active[i]`.
    pub(crate) fn begin_unlink(
        &mut self,
        shared: &Shared,
        i: usize,
        frame: u64,
        reason: TransferError,
    ) {
        let mut t = self.active.remove(i);
        t.state = RequestState::UnlinkRequested;
        self.detach(&shared.mem, &mut t);
        t.unlink_frame = frame;
        t.unlink_status = Some(reason);
        t.state = RequestState::UnlinkedPendingFree;
        debug!(handle = %t.handle, ?reason, frame, "unlinked");
        self.unlinked.push(t);
    }

    /// Phase two for every unlinked request whose stamp lies at least one frame in the past, or
    /// for all of them when `force` is set (controller stopped).
    pub(crate) fn free_unlinked(
        &mut self,
        shared: &Shared,
        frame: u64,
        force: bool,
        done: &mut Vec<Delivery>,
    ) {
        let mut i = 0;
        while i < self.unlinked.len() {
            if !force && frame <= self.unlinked[i].unlink_frame {
                i += 1;
                continue;
            }
            let mut t = self.unlinked.remove(i);
            let reason = t.unlink_status.unwrap_or(TransferError::Cancelled);
            let completion = t.completion(&shared.mem, Err(reason));
            for desc in t.descriptors() {
                shared.pool.free(desc, frame);
            }
            t.state = RequestState::Freed;
            debug!(handle = %t.handle, ?reason, frame, "freed");
            done.push((t.on_complete.take(), completion));
        }
    }

    /// Unlinks and frees everything, completing every in-flight request with `reason`. Requests
    /// that were already being cancelled keep their own result. Only valid with the controller
    /// stopped.
    pub(crate) fn fail_all(
        &mut self,
        shared: &Shared,
        frame: u64,
        reason: TransferError,
        done: &mut Vec<Delivery>,
    ) {
        while !self.active.is_empty() {
            self.begin_unlink(shared, 0, frame, reason);
        }
        self.free_unlinked(shared, frame, true, done);
        shared.pool.force_reclaim();
        self.loop_usage = 0;
        self.endpoints.clear();
    }

    pub(crate) fn request_state(&self, handle: RequestHandle) -> Option<RequestState> {
        if let Some(t) = self.transfer(handle) {
            return Some(t.state);
        }
        if let Some(t) = self.unlinked.iter().find(|t| t.handle == handle) {
            return Some(t.state);
        }
        (handle.0 > 0 && handle.0 < self.next_handle).then_some(RequestState::Freed)
    }
}
