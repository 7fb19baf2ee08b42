//! Caller-facing request and completion types.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Speed {
    #[default]
    Full,
    Low,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u32 {
        /// A short IN transfer completes with [`TransferError::ShortPacket`].
        const SHORT_NOT_OK = 1 << 0;
        /// Bulk: allow appending behind a request already running on the same endpoint.
        const QUEUE_BULK = 1 << 1;
        /// Control/bulk: never hold the bandwidth reclamation loop open for this request.
        const NO_FSBR = 1 << 2;
        /// Isochronous: start right after whatever is already booked on the endpoint.
        const ISO_ASAP = 1 << 3;
    }
}

/// Opaque handle naming one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub(crate) u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urb#{}", self.0)
    }
}

/// Lifecycle of a submitted request, as reported by [`crate::Hcd::request_state`].
///
/// Cancellation moves a request from `Active` through `UnlinkRequested` (descriptors being
/// unhooked from the schedule) to `UnlinkedPendingFree`, where it waits at least one frame before
/// its descriptors return to the pool and the completion is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Active,
    UnlinkRequested,
    UnlinkedPendingFree,
    Freed,
}

/// Completion callback. Invoked from the completion walker without the schedule lock held.
pub type CompletionFn = Arc<dyn Fn(&Completion) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoPacketResult {
    pub status: Result<(), TransferError>,
    pub actual_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: RequestHandle,
    pub status: Result<(), TransferError>,
    /// Bytes moved before the transfer finished or failed (data stage only for control).
    pub actual_length: usize,
    /// Number of TDs that retired with an error bit set.
    pub error_count: u32,
    /// Received bytes for IN transfers; empty for OUT.
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketResult>,
    pub start_frame: Option<u16>,
}

/// A transfer to submit with [`crate::Hcd::submit`].
#[derive(Clone)]
pub struct TransferRequest {
    pub pipe: PipeType,
    pub device: u8,
    pub endpoint: u8,
    pub direction: Direction,
    pub speed: Speed,
    pub max_packet: u16,
    /// The 8-byte SETUP packet of a control transfer.
    pub setup: Option<[u8; 8]>,
    /// OUT payload. Ignored for IN transfers.
    pub data: Vec<u8>,
    /// Bytes to transfer. For OUT transfers this must equal `data.len()`.
    pub length: usize,
    pub flags: TransferFlags,
    /// Interrupt polling interval in frames; zero submits a one-shot interrupt transfer.
    pub interval: u8,
    /// Isochronous packet sizes, one packet per frame.
    pub iso_packets: Vec<usize>,
    /// Isochronous start frame (0..=1023), used unless [`TransferFlags::ISO_ASAP`] is set.
    pub iso_start_frame: u16,
    pub timeout: Option<Duration>,
    pub on_complete: Option<CompletionFn>,
}

impl TransferRequest {
    fn base(pipe: PipeType, device: u8, endpoint: u8, direction: Direction) -> Self {
        Self {
            pipe,
            device,
            endpoint,
            direction,
            speed: Speed::Full,
            max_packet: 64,
            setup: None,
            data: Vec::new(),
            length: 0,
            flags: TransferFlags::empty(),
            interval: 0,
            iso_packets: Vec::new(),
            iso_start_frame: 0,
            timeout: None,
            on_complete: None,
        }
    }

    /// Control transfer with an OUT data stage (or no data stage when `data` is empty).
    pub fn control_out(device: u8, setup: [u8; 8], data: Vec<u8>) -> Self {
        let mut req = Self::base(PipeType::Control, device, 0, Direction::Out);
        req.setup = Some(setup);
        req.length = data.len();
        req.data = data;
        req.max_packet = 8;
        req
    }

    /// Control transfer reading `length` bytes in the data stage.
    pub fn control_in(device: u8, setup: [u8; 8], length: usize) -> Self {
        let mut req = Self::base(PipeType::Control, device, 0, Direction::In);
        req.setup = Some(setup);
        req.length = length;
        req.max_packet = 8;
        req
    }

    pub fn bulk_out(device: u8, endpoint: u8, data: Vec<u8>) -> Self {
        let mut req = Self::base(PipeType::Bulk, device, endpoint, Direction::Out);
        req.length = data.len();
        req.data = data;
        req
    }

    pub fn bulk_in(device: u8, endpoint: u8, length: usize) -> Self {
        let mut req = Self::base(PipeType::Bulk, device, endpoint, Direction::In);
        req.length = length;
        req
    }

    pub fn interrupt_in(device: u8, endpoint: u8, length: usize, interval: u8) -> Self {
        let mut req = Self::base(PipeType::Interrupt, device, endpoint, Direction::In);
        req.length = length;
        req.interval = interval;
        req.max_packet = 8;
        req
    }

    pub fn interrupt_out(device: u8, endpoint: u8, data: Vec<u8>, interval: u8) -> Self {
        let mut req = Self::base(PipeType::Interrupt, device, endpoint, Direction::Out);
        req.length = data.len();
        req.data = data;
        req.interval = interval;
        req.max_packet = 8;
        req
    }

    pub fn iso_in(device: u8, endpoint: u8, packets: Vec<usize>) -> Self {
        let mut req = Self::base(PipeType::Isochronous, device, endpoint, Direction::In);
        req.length = packets.iter().sum();
        req.iso_packets = packets;
        req.max_packet = 1023;
        req.flags = TransferFlags::ISO_ASAP;
        req
    }

    /// Isochronous OUT; `data` is split across packets in order.
    pub fn iso_out(device: u8, endpoint: u8, packets: Vec<usize>, data: Vec<u8>) -> Self {
        let mut req = Self::base(PipeType::Isochronous, device, endpoint, Direction::Out);
        req.length = data.len();
        req.data = data;
        req.iso_packets = packets;
        req.max_packet = 1023;
        req.flags = TransferFlags::ISO_ASAP;
        req
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_max_packet(mut self, max_packet: u16) -> Self {
        self.max_packet = max_packet;
        self
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_start_frame(mut self, frame: u16) -> Self {
        self.flags.remove(TransferFlags::ISO_ASAP);
        self.iso_start_frame = frame;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&Completion) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("pipe", &self.pipe)
            .field("device", &self.device)
            .field("endpoint", &self.endpoint)
            .field("direction", &self.direction)
            .field("speed", &self.speed)
            .field("max_packet", &self.max_packet)
            .field("length", &self.length)
            .field("flags", &self.flags)
            .field("interval", &self.interval)
            .field("iso_packets", &self.iso_packets.len())
            .finish_non_exhaustive()
    }
}
