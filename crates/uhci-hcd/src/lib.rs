//! Transfer scheduling and descriptor management for UHCI (USB 1.1) host controllers.
//!
//! [`Hcd`] turns [`TransferRequest`]s into chains of transfer descriptors (TDs) and queue heads
//! (QHs) in a DMA region, splices them into the controller's 1024-entry frame schedule, walks the
//! written-back status on interrupts and delivers a [`Completion`] per request through a callback.
//!
//! The bus glue (PCI function, I/O BAR, IRQ line, clock) is supplied through [`HcPlatform`].
//! Every entry point takes `&self`: submission, [`Hcd::handle_interrupt`], [`Hcd::timer_tick`] and
//! [`Hcd::poll_periodic_status`] may race on different threads. One lock covers the schedule and
//! request lists; the descriptor pool has its own.

mod complete;
mod config;
mod error;
mod frame;
mod hcd;
mod platform;
mod pool;
mod reclaim;
mod request;
mod schedule;
mod state;
mod submit;
mod transfer;
mod unlink;
mod watchdog;

pub mod dma;
pub mod hw;
pub mod regs;

pub use config::HcdConfig;
pub use error::{HcdError, Result, TransferError};
pub use frame::FrameClock;
pub use hcd::Hcd;
pub use platform::HcPlatform;
pub use pool::{DmaBuffer, SlotState};
pub use request::{
    Completion, CompletionFn, Direction, IsoPacketResult, PipeType, RequestHandle, RequestState,
    Speed, TransferFlags, TransferRequest,
};
pub use schedule::{anchor_for_interval, slot_anchor, INTERRUPT_ANCHORS, SKELETON_QH_COUNT};
