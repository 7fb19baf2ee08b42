//! Root hub status polling and the missed-interrupt watchdog.

use tracing::{error, warn};

use crate::error::TransferError;
use crate::frame::slot_of;
use crate::hcd::Hcd;
use crate::platform::HcPlatform;
use crate::regs::{
    portsc_offset, PORTSC_CHANGE_MASK, REG_USBSTS, ROOT_PORTS, USBSTS_FATAL_MASK,
    USBSTS_HCHALTED,
};
use crate::state::{deliver, Delivery, HcdState, Tick};

impl<P: HcPlatform> Hcd<P> {
    /// Returns a bitmap of root ports with pending connect/enable changes (bit `n` for port `n`)
    /// and runs the watchdog.
    ///
    /// The controller counts as hung when requests are in flight, no interrupt has arrived for
    /// `watchdog_timeout`, and it either reports itself halted/faulted or its frame counter has
    /// not moved since the previous poll. A hung controller is reset, its schedule rebuilt and
    /// every in-flight request failed with [`TransferError::ControllerReset`]. After
    /// `max_reanimations` resets it is declared dead.
    pub fn poll_periodic_status(&self) -> u8 {
        let mut changed = 0u8;
        for port in 0..ROOT_PORTS {
            let portsc = self.platform.read_reg(portsc_offset(port), 2) as u16;
            if portsc & PORTSC_CHANGE_MASK != 0 {
                changed |= 1 << port;
            }
        }

        let done = {
            let mut state = self.lock();
            self.watchdog(&mut state)
        };
        deliver(done);
        changed
    }

    fn watchdog(&self, state: &mut HcdState) -> Vec<Delivery> {
        if !state.running || state.dead {
            return Vec::new();
        }
        let tick = self.tick(state);
        let raw = slot_of(tick.frame) as u16;
        let frame_stuck = state.last_poll_frame == Some(raw);
        state.last_poll_frame = Some(raw);

        if state.active.is_empty() {
            return Vec::new();
        }
        let silent = tick.uptime.saturating_sub(state.last_irq);
        if silent < self.shared.config.watchdog_timeout {
            return Vec::new();
        }
        let status = self.platform.read_reg(REG_USBSTS, 2) as u16;
        if status & (USBSTS_HCHALTED | USBSTS_FATAL_MASK) == 0 && !frame_stuck {
            return Vec::new();
        }

        warn!(
            silent_ms = silent.as_millis() as u64,
            status,
            frame = tick.frame,
            "host controller appears hung"
        );
        self.reanimate(state, tick)
    }

    fn reanimate(&self, state: &mut HcdState, tick: Tick) -> Vec<Delivery> {
        let mut done = Vec::new();
        self.reset_controller();
        state.running = false;
        state.reanimations += 1;

        if state.reanimations > self.shared.config.max_reanimations {
            error!(
                reanimations = state.reanimations,
                "host controller is dead, giving up"
            );
            state.dead = true;
            state.fail_all(&self.shared, tick.frame, TransferError::ControllerDead, &mut done);
            state.schedule.rebuild(&self.shared.mem);
            return done;
        }

        warn!(attempt = state.reanimations, "resetting host controller");
        state.fail_all(&self.shared, tick.frame, TransferError::ControllerReset, &mut done);
        state.schedule.rebuild(&self.shared.mem);
        self.run_controller(state);
        done
    }
}
