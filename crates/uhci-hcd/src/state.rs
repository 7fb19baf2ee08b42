use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::config::HcdConfig;
use crate::dma::DmaMemory;
use crate::frame::FrameClock;
use crate::pool::DescriptorPool;
use crate::request::{Completion, CompletionFn, RequestHandle};
use crate::schedule::Schedule;
use crate::transfer::{EndpointKey, Transfer};

/// Everything the schedule lock does not need to cover.
pub(crate) struct Shared {
    pub mem: Arc<DmaMemory>,
    pub pool: DescriptorPool,
    pub config: HcdConfig,
}

/// Wall-clock and frame time sampled once per entry point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick {
    pub frame: u64,
    pub uptime: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct EndpointState {
    /// Toggle the next newly submitted packet on this endpoint starts with.
    pub toggle: bool,
    pub halted: bool,
    /// Bulk requests chained on this endpoint, oldest (the one linked into the schedule) first.
    pub bulk_queue: Vec<RequestHandle>,
}

pub(crate) type Delivery = (Option<CompletionFn>, Completion);

/// State guarded by the schedule lock.
pub(crate) struct HcdState {
    pub schedule: Schedule,
    pub clock: FrameClock,
    /// Submitted requests in insertion order.
    pub active: Vec<Transfer>,
    /// Requests unhooked from the schedule whose descriptors are waiting out a frame.
    pub unlinked: Vec<Transfer>,
    pub endpoints: HashMap<EndpointKey, EndpointState>,
    /// Requests currently holding the reclamation loop open.
    pub loop_usage: usize,
    pub running: bool,
    pub dead: bool,
    pub last_irq: Duration,
    pub last_poll_frame: Option<u16>,
    pub reanimations: u32,
    pub next_handle: u64,
}

impl HcdState {
    pub fn new(schedule: Schedule, clock: FrameClock) -> Self {
        Self {
            schedule,
            clock,
            active: Vec::new(),
            unlinked: Vec::new(),
            endpoints: HashMap::new(),
            loop_usage: 0,
            running: false,
            dead: false,
            last_irq: Duration::ZERO,
            last_poll_frame: None,
            reanimations: 0,
            next_handle: 1,
        }
    }

    pub fn position(&self, handle: RequestHandle) -> Option<usize> {
        self.active.iter().position(|t| t.handle == handle)
    }

    pub fn transfer(&self, handle: RequestHandle) -> Option<&Transfer> {
        self.active.iter().find(|t| t.handle == handle)
    }

    pub fn transfer_mut(&mut self, handle: RequestHandle) -> Option<&mut Transfer> {
        self.active.iter_mut().find(|t| t.handle == handle)
    }

    pub fn endpoint(&mut self, key: EndpointKey) -> &mut EndpointState {
        self.endpoints.entry(key).or_default()
    }

    /// Counts a request towards the reclamation loop, opening it for the first user.
    pub fn fsbr_acquire(&mut self, mem: &DmaMemory, t: &mut Transfer) {
        if !t.fsbr_eligible || t.fsbr {
            return;
        }
        t.fsbr = true;
        self.loop_acquire(mem);
    }

    /// Drops a request's claim on the reclamation loop, closing it after the last user.
    pub fn fsbr_release(&mut self, mem: &DmaMemory, t: &mut Transfer) {
        if !t.fsbr {
            return;
        }
        t.fsbr = false;
        self.loop_release(mem);
        trace!(handle = %t.handle, loop_usage = self.loop_usage, "fsbr released");
    }

    pub fn loop_acquire(&mut self, mem: &DmaMemory) {
        self.loop_usage += 1;
        if self.loop_usage == 1 {
            self.schedule.set_reclamation_loop(mem, true);
        }
    }

    pub fn loop_release(&mut self, mem: &DmaMemory) {
        self.loop_usage = self.loop_usage.saturating_sub(1);
        if self.loop_usage == 0 {
            self.schedule.set_reclamation_loop(mem, false);
        }
    }
}

/// Runs completion callbacks. Must be called without the schedule lock held.
pub(crate) fn deliver(done: Vec<Delivery>) {
    for (callback, completion) in done {
        if let Some(callback) = callback {
            callback(&completion);
        }
    }
}
