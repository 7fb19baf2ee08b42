//! Driver-side record of one submitted request and the descriptors it owns.

use core::time::Duration;

use crate::dma::DmaMemory;
use crate::error::TransferError;
use crate::hw::{self, Pid, QhId, TdId, TD_CTRL_BABBLE, TD_CTRL_BITSTUFF, TD_CTRL_CRC_TIMEOUT};
use crate::hw::{TdStatus, TD_CTRL_DBUFERR, TD_CTRL_NAK, TD_CTRL_STALLED};
use crate::pool::{Descriptor, DmaBuffer};
use crate::request::{
    Completion, CompletionFn, Direction, IsoPacketResult, PipeType, RequestHandle, RequestState,
    Speed, TransferFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EndpointKey {
    pub device: u8,
    pub endpoint: u8,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Setup,
    Data,
    Status,
    Iso,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TdSlot {
    pub id: TdId,
    pub stage: Stage,
    pub pid: Pid,
    pub toggle: bool,
    pub len: usize,
    /// Offset of this TD's data within the request's data buffer.
    pub offset: usize,
    /// Absolute frame an isochronous TD is booked in.
    pub frame: u64,
}

pub(crate) struct Transfer {
    pub handle: RequestHandle,
    pub pipe: PipeType,
    pub key: EndpointKey,
    pub speed: Speed,
    pub flags: TransferFlags,
    pub state: RequestState,
    pub length: usize,
    pub qh: Option<QhId>,
    /// Bulk queue helper: the continuation point the next queued request hangs off.
    pub bottom_qh: Option<QhId>,
    pub tds: Vec<TdSlot>,
    pub setup_buf: DmaBuffer,
    pub data_buf: DmaBuffer,
    pub interval: u8,
    pub iso_start: u64,
    pub status_rearmed: bool,
    pub toggle_mismatch: bool,
    pub fsbr_eligible: bool,
    pub fsbr: bool,
    pub element_snapshot: u32,
    pub last_activity: Duration,
    pub deadline: Option<Duration>,
    pub unlink_frame: u64,
    pub unlink_status: Option<TransferError>,
    pub on_complete: Option<CompletionFn>,
}

impl Transfer {
    pub fn new(handle: RequestHandle, pipe: PipeType, key: EndpointKey) -> Self {
        Self {
            handle,
            pipe,
            key,
            speed: Speed::Full,
            flags: TransferFlags::empty(),
            state: RequestState::Active,
            length: 0,
            qh: None,
            bottom_qh: None,
            tds: Vec::new(),
            setup_buf: DmaBuffer::EMPTY,
            data_buf: DmaBuffer::EMPTY,
            interval: 0,
            iso_start: 0,
            status_rearmed: false,
            toggle_mismatch: false,
            fsbr_eligible: false,
            fsbr: false,
            element_snapshot: 0,
            last_activity: Duration::ZERO,
            deadline: None,
            unlink_frame: 0,
            unlink_status: None,
            on_complete: None,
        }
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        let mut out: Vec<Descriptor> = self.tds.iter().map(|td| Descriptor::Td(td.id)).collect();
        out.extend(self.qh.map(Descriptor::Qh));
        out.extend(self.bottom_qh.map(Descriptor::Qh));
        out.push(Descriptor::Buffer(self.setup_buf));
        out.push(Descriptor::Buffer(self.data_buf));
        out
    }

    /// Frame after the last booked isochronous packet.
    pub fn iso_end(&self) -> u64 {
        self.iso_start + self.tds.len() as u64
    }

    pub fn data_tds(&self) -> impl Iterator<Item = &TdSlot> {
        self.tds.iter().filter(|td| td.stage == Stage::Data)
    }

    /// The toggle the endpoint should continue with if this request stopped now: the toggle of
    /// the first data TD that did not complete, or the successor of the last one.
    pub fn resume_toggle(&self, mem: &DmaMemory) -> Option<bool> {
        let mut last = None;
        for td in self.data_tds() {
            let st = hw::read_td_status(mem, td.id);
            if st.active() || st.has_error() {
                return Some(td.toggle);
            }
            if st.actual_len() < td.len {
                return Some(!td.toggle);
            }
            last = Some(!td.toggle);
        }
        last
    }

    /// Builds the caller-visible completion from what the controller wrote back.
    pub fn completion(&self, mem: &DmaMemory, status: Result<(), TransferError>) -> Completion {
        let mut completion = Completion {
            handle: self.handle,
            status,
            actual_length: 0,
            error_count: 0,
            data: Vec::new(),
            iso_packets: Vec::new(),
            start_frame: None,
        };

        for td in &self.tds {
            let st = hw::read_td_status(mem, td.id);
            if st.has_error() {
                completion.error_count += 1;
            }
            match td.stage {
                Stage::Data if !st.active() => completion.actual_length += st.actual_len(),
                Stage::Iso => {
                    let packet = if st.active() {
                        IsoPacketResult {
                            status: Err(TransferError::Timeout),
                            actual_length: 0,
                        }
                    } else if st.has_error() {
                        IsoPacketResult {
                            status: Err(map_status(st, td.pid)),
                            actual_length: st.actual_len(),
                        }
                    } else {
                        IsoPacketResult {
                            status: Ok(()),
                            actual_length: st.actual_len(),
                        }
                    };
                    completion.actual_length += packet.actual_length;
                    completion.iso_packets.push(packet);
                }
                _ => {}
            }
        }

        if self.pipe == PipeType::Isochronous {
            completion.start_frame = Some((self.iso_start % 1024) as u16);
        }
        if self.key.direction == Direction::In && !self.data_buf.is_empty() {
            let len = if self.pipe == PipeType::Isochronous {
                self.data_buf.len().min(self.length)
            } else {
                completion.actual_length.min(self.length)
            };
            let mut data = vec![0u8; len];
            mem.read_physical(self.data_buf.addr(), &mut data);
            completion.data = data;
        }
        completion
    }
}

/// Maps the status word of a TD that retired with an error to a result code.
///
/// The order is fixed: bit stuffing, CRC/timeout, NAK, babble, buffer error, stall.
pub(crate) fn map_status(status: TdStatus, pid: Pid) -> TransferError {
    let bits = status.0;
    if bits & TD_CTRL_BITSTUFF != 0 {
        TransferError::BitStuff
    } else if bits & TD_CTRL_CRC_TIMEOUT != 0 {
        if pid == Pid::In {
            TransferError::Crc
        } else {
            TransferError::Timeout
        }
    } else if bits & TD_CTRL_NAK != 0 {
        TransferError::Timeout
    } else if bits & TD_CTRL_BABBLE != 0 {
        TransferError::Babble
    } else if bits & TD_CTRL_DBUFERR != 0 {
        TransferError::BufferError
    } else if bits & TD_CTRL_STALLED != 0 {
        TransferError::Stall
    } else {
        TransferError::Protocol
    }
}
