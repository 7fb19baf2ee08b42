use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::config::HcdConfig;
use crate::dma::{DmaLayout, DmaMemory};
use crate::error::{HcdError, Result, TransferError};
use crate::frame::FrameClock;
use crate::hw::QhId;
use crate::platform::HcPlatform;
use crate::pool::{DescriptorPool, SlotState};
use crate::regs::{
    FRAME_LIST_INDEX_MASK, REG_FLBASEADD, REG_FRNUM, REG_SOFMOD, REG_USBCMD, REG_USBINTR,
    REG_USBSTS, USBCMD_CF, USBCMD_HCRESET, USBCMD_MAXP, USBCMD_RS, USBINTR_ALL, USBSTS_HCPROCESSERR,
    USBSTS_HSE, USBSTS_USBERRINT, USBSTS_W1C_MASK,
};
use crate::request::{Direction, RequestHandle, RequestState, TransferRequest};
use crate::schedule::{Schedule, SKELETON_QH_COUNT};
use crate::state::{deliver, HcdState, Shared, Tick};
use crate::transfer::EndpointKey;

/// Default SOF timing adjustment (12000 bit times per frame).
const SOFMOD_DEFAULT: u32 = 64;

/// A UHCI host controller driver instance.
///
/// All entry points take `&self`; submission, the interrupt handler and the periodic timer can
/// run on different threads. Completion callbacks run on whichever thread drove the walk that
/// found the completion, after the schedule lock has been released.
pub struct Hcd<P: HcPlatform> {
    pub(crate) platform: P,
    pub(crate) shared: Shared,
    state: Mutex<HcdState>,
}

impl<P: HcPlatform> Hcd<P> {
    /// Allocates the DMA region and builds the schedule skeleton. The controller is not touched
    /// until [`Hcd::start`].
    pub fn new(platform: P, config: HcdConfig) -> Result<Self> {
        config.validate()?;
        let layout = DmaLayout::new(
            config.dma_base,
            config.qh_count,
            config.td_count,
            config.buffer_bytes,
        );
        let mem = Arc::new(DmaMemory::new(layout));
        let pool = DescriptorPool::new(mem.clone());

        let mut skeleton = [QhId::new(0); SKELETON_QH_COUNT];
        for qh in skeleton.iter_mut() {
            *qh = pool.allocate_qh()?;
        }
        let mut schedule = Schedule::new(skeleton);
        schedule.rebuild(&mem);

        let clock = FrameClock::new(platform.read_frame_number());
        Ok(Self {
            platform,
            shared: Shared { mem, pool, config },
            state: Mutex::new(HcdState::new(schedule, clock)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HcdState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn tick(&self, state: &mut HcdState) -> Tick {
        let raw = self.platform.read_frame_number() & FRAME_LIST_INDEX_MASK;
        Tick {
            frame: state.clock.observe(raw),
            uptime: self.platform.uptime(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &HcdConfig {
        &self.shared.config
    }

    /// The DMA region the controller walks.
    pub fn dma_memory(&self) -> Arc<DmaMemory> {
        self.shared.mem.clone()
    }

    /// Resets the controller, programs the frame list and sets it running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.dead {
            return Err(HcdError::ControllerDead);
        }
        self.reset_controller();
        self.run_controller(&mut state);
        Ok(())
    }

    pub(crate) fn reset_controller(&self) {
        self.platform.disable_interrupts();
        self.platform
            .write_reg(REG_USBCMD, 2, u32::from(USBCMD_HCRESET));
        self.platform.write_reg(REG_USBCMD, 2, 0);
        self.platform
            .write_reg(REG_USBSTS, 2, u32::from(USBSTS_W1C_MASK));
    }

    pub(crate) fn run_controller(&self, state: &mut HcdState) {
        let frame_list = self.shared.mem.layout().frame_list_base();
        self.platform.write_reg(REG_FLBASEADD, 4, frame_list);
        self.platform.write_reg(REG_FRNUM, 2, 0);
        self.platform.write_reg(REG_SOFMOD, 1, SOFMOD_DEFAULT);
        let intr = if self.shared.config.use_irq {
            USBINTR_ALL
        } else {
            0
        };
        self.platform.write_reg(REG_USBINTR, 2, u32::from(intr));
        self.platform.write_reg(
            REG_USBCMD,
            2,
            u32::from(USBCMD_RS | USBCMD_CF | USBCMD_MAXP),
        );
        if self.shared.config.use_irq {
            self.platform.enable_interrupts(intr);
        }

        let tick = self.tick(state);
        state.running = true;
        state.last_irq = tick.uptime;
        state.last_poll_frame = None;
        debug!(frame_list, frame = tick.frame, "controller running");
    }

    pub fn submit(&self, req: TransferRequest) -> Result<RequestHandle> {
        let mut state = self.lock();
        let tick = self.tick(&mut state);
        state.submit(&self.shared, req, tick)
    }

    /// Starts cancelling a request. The completion (with [`TransferError::Cancelled`]) arrives
    /// later, from the walk that runs at least one frame after this call.
    pub fn cancel(&self, handle: RequestHandle) -> Result<()> {
        let mut state = self.lock();
        let tick = self.tick(&mut state);
        state.cancel(&self.shared, handle, tick.frame, TransferError::Cancelled)
    }

    /// Interrupt entry point. Returns false when the controller did not raise the interrupt.
    pub fn handle_interrupt(&self) -> bool {
        let status = self.platform.read_reg(REG_USBSTS, 2) as u16 & USBSTS_W1C_MASK;
        if status == 0 {
            return false;
        }
        self.platform.write_reg(REG_USBSTS, 2, u32::from(status));

        let done = {
            let mut state = self.lock();
            let tick = self.tick(&mut state);
            state.last_irq = tick.uptime;
            if status & USBSTS_HSE != 0 {
                error!(frame = tick.frame, "host system error");
            }
            if status & USBSTS_HCPROCESSERR != 0 {
                error!(frame = tick.frame, "host controller process error");
            }
            if status & USBSTS_USBERRINT != 0 {
                debug!(frame = tick.frame, "transfer error interrupt");
            }
            state.scan(&self.shared, tick)
        };
        deliver(done);
        true
    }

    /// Periodic housekeeping: timeouts, reclamation idling, deferred frees and, without an
    /// interrupt line, the completion walk itself.
    pub fn timer_tick(&self) {
        let done = {
            let mut state = self.lock();
            let tick = self.tick(&mut state);
            state.expire_timeouts(&self.shared, tick);
            state.idle_reclamation(&self.shared, tick);
            if self.shared.config.use_irq {
                let mut done = Vec::new();
                state.free_unlinked(&self.shared, tick.frame, false, &mut done);
                self.shared.pool.reclaim(tick.frame);
                done
            } else {
                state.scan(&self.shared, tick)
            }
        };
        deliver(done);
    }

    /// Clears the halted flag of an endpoint and resets its data toggle to DATA0.
    pub fn clear_halt(&self, device: u8, endpoint: u8, direction: Direction) {
        let mut state = self.lock();
        let ep = state.endpoint(EndpointKey {
            device,
            endpoint,
            direction,
        });
        ep.halted = false;
        ep.toggle = false;
        debug!(device, endpoint, ?direction, "halt cleared");
    }

    /// Stops the controller and completes everything in flight with
    /// [`TransferError::Shutdown`].
    pub fn shutdown(&self) {
        let done = {
            let mut state = self.lock();
            let tick = self.tick(&mut state);
            self.reset_controller();
            state.running = false;
            let mut done = Vec::new();
            state.fail_all(&self.shared, tick.frame, TransferError::Shutdown, &mut done);
            state.schedule.rebuild(&self.shared.mem);
            debug!(frame = tick.frame, failed = done.len(), "controller shut down");
            done
        };
        deliver(done);
    }

    /// Bus addresses of every descriptor the controller can currently reach.
    pub fn reachable_descriptors(&self) -> BTreeSet<u32> {
        let _state = self.lock();
        Schedule::reachable(&self.shared.mem)
    }

    pub fn slot_state(&self, bus_addr: u32) -> Option<SlotState> {
        self.shared.pool.slot_state(bus_addr)
    }

    /// Free TD and QH slots, not counting descriptors still cooling down.
    pub fn free_descriptors(&self) -> (usize, usize) {
        (
            self.shared.pool.free_td_count(),
            self.shared.pool.free_qh_count(),
        )
    }

    pub fn cooling_descriptors(&self) -> usize {
        self.shared.pool.cooling_count()
    }

    pub fn request_state(&self, handle: RequestHandle) -> Option<RequestState> {
        self.lock().request_state(handle)
    }

    pub fn is_halted(&self, device: u8, endpoint: u8, direction: Direction) -> bool {
        let key = EndpointKey {
            device,
            endpoint,
            direction,
        };
        self.lock().endpoints.get(&key).is_some_and(|ep| ep.halted)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_free_count(&self) -> usize {
        self.lock().unlinked.len()
    }

    pub fn reclamation_enabled(&self) -> bool {
        self.lock().schedule.reclamation_enabled()
    }

    pub fn reanimation_count(&self) -> u32 {
        self.lock().reanimations
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Monotonic frame count as of the last time any entry point sampled the frame counter.
    pub fn current_frame(&self) -> u64 {
        self.lock().clock.now()
    }
}

impl<P: HcPlatform> core::fmt::Debug for Hcd<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hcd")
            .field("config", &self.shared.config)
            .field("mem", &self.shared.mem)
            .finish_non_exhaustive()
    }
}
