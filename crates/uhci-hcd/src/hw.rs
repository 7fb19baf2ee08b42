//! Hardware descriptor layout (UHCI 1.1 spec, section 3).
//!
//! Descriptors are handled through typed ids and the [`Link`] enum everywhere in the driver; the
//! raw link words with their tag bits only exist at the [`encode_link`] / [`decode_link`] boundary.

use crate::dma::{DmaLayout, DmaMemory};

pub const LINK_PTR_T: u32 = 1 << 0;
pub const LINK_PTR_Q: u32 = 1 << 1;
pub const LINK_PTR_VF: u32 = 1 << 2;
pub const LINK_PTR_ADDR_MASK: u32 = 0xffff_fff0;

pub const TD_CTRL_ACTLEN_MASK: u32 = 0x7ff;
pub const TD_CTRL_BITSTUFF: u32 = 1 << 17;
pub const TD_CTRL_CRC_TIMEOUT: u32 = 1 << 18;
pub const TD_CTRL_NAK: u32 = 1 << 19;
pub const TD_CTRL_BABBLE: u32 = 1 << 20;
pub const TD_CTRL_DBUFERR: u32 = 1 << 21;
pub const TD_CTRL_STALLED: u32 = 1 << 22;
pub const TD_CTRL_ACTIVE: u32 = 1 << 23;
pub const TD_CTRL_IOC: u32 = 1 << 24;
pub const TD_CTRL_ISO: u32 = 1 << 25;
pub const TD_CTRL_LS: u32 = 1 << 26;
pub const TD_CTRL_CERR_SHIFT: u32 = 27;
pub const TD_CTRL_CERR_MASK: u32 = 3 << TD_CTRL_CERR_SHIFT;
pub const TD_CTRL_SPD: u32 = 1 << 29;

/// Status bits that retire a TD with an error.
pub const TD_CTRL_ERROR_MASK: u32 =
    TD_CTRL_BITSTUFF | TD_CTRL_CRC_TIMEOUT | TD_CTRL_BABBLE | TD_CTRL_DBUFERR | TD_CTRL_STALLED;
/// Every status bit the controller writes back.
pub const TD_CTRL_STATUS_MASK: u32 = TD_CTRL_ERROR_MASK | TD_CTRL_NAK | TD_CTRL_ACTIVE;

pub const TD_TOKEN_PID_MASK: u32 = 0xff;
pub const TD_TOKEN_DEVADDR_SHIFT: u32 = 8;
pub const TD_TOKEN_DEVADDR_MASK: u32 = 0x7f << TD_TOKEN_DEVADDR_SHIFT;
pub const TD_TOKEN_ENDPT_SHIFT: u32 = 15;
pub const TD_TOKEN_ENDPT_MASK: u32 = 0x0f << TD_TOKEN_ENDPT_SHIFT;
pub const TD_TOKEN_D: u32 = 1 << 19;
pub const TD_TOKEN_MAXLEN_SHIFT: u32 = 21;
pub const TD_TOKEN_MAXLEN_MASK: u32 = 0x7ff << TD_TOKEN_MAXLEN_SHIFT;

/// Encoded "zero bytes" for both MaxLen and ActLen.
pub const LEN_FIELD_ZERO: u32 = 0x7ff;

// Word offsets inside a descriptor.
const TD_LINK: u32 = 0x00;
const TD_CTRL_STS: u32 = 0x04;
const TD_TOKEN: u32 = 0x08;
const TD_BUFFER: u32 = 0x0c;
const QH_HEAD: u32 = 0x00;
const QH_ELEMENT: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TdId(u16);

impl TdId {
    pub(crate) fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QhId(u16);

impl QhId {
    pub(crate) fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> u16 {
        self.0
    }
}

/// Logical link between descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Terminate,
    Td(TdId),
    Qh(QhId),
}

/// Serializes a link. `depth_first` only has meaning on TD link words.
pub fn encode_link(layout: &DmaLayout, link: Link, depth_first: bool) -> u32 {
    match link {
        Link::Terminate => LINK_PTR_T,
        Link::Td(td) => {
            let vf = if depth_first { LINK_PTR_VF } else { 0 };
            layout.td_addr(td) | vf
        }
        Link::Qh(qh) => layout.qh_addr(qh) | LINK_PTR_Q,
    }
}

/// Decodes a raw link word. Addresses that do not land on a descriptor slot decode as
/// [`Link::Terminate`].
pub fn decode_link(layout: &DmaLayout, raw: u32) -> Link {
    if raw & LINK_PTR_T != 0 {
        return Link::Terminate;
    }
    let addr = raw & LINK_PTR_ADDR_MASK;
    let decoded = if raw & LINK_PTR_Q != 0 {
        layout.qh_from_addr(addr).map(Link::Qh)
    } else {
        layout.td_from_addr(addr).map(Link::Td)
    };
    decoded.unwrap_or(Link::Terminate)
}

/// Encodes a byte count into the 11-bit `n - 1` length representation.
pub fn encode_len(len: usize) -> u32 {
    if len == 0 {
        LEN_FIELD_ZERO
    } else {
        (len as u32 - 1) & 0x7ff
    }
}

pub fn decode_len(field: u32) -> usize {
    let field = field & 0x7ff;
    if field == LEN_FIELD_ZERO {
        0
    } else {
        field as usize + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Setup = 0x2d,
    In = 0x69,
    Out = 0xe1,
}

impl Pid {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x2d => Some(Self::Setup),
            0x69 => Some(Self::In),
            0xe1 => Some(Self::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdToken {
    pub pid: Pid,
    pub device: u8,
    pub endpoint: u8,
    pub toggle: bool,
    pub max_len: usize,
}

impl TdToken {
    pub fn encode(&self) -> u32 {
        let toggle = if self.toggle { TD_TOKEN_D } else { 0 };
        u32::from(self.pid as u8)
            | ((u32::from(self.device) << TD_TOKEN_DEVADDR_SHIFT) & TD_TOKEN_DEVADDR_MASK)
            | ((u32::from(self.endpoint) << TD_TOKEN_ENDPT_SHIFT) & TD_TOKEN_ENDPT_MASK)
            | toggle
            | (encode_len(self.max_len) << TD_TOKEN_MAXLEN_SHIFT)
    }

    pub fn decode(raw: u32) -> Option<Self> {
        Some(Self {
            pid: Pid::from_u8((raw & TD_TOKEN_PID_MASK) as u8)?,
            device: ((raw & TD_TOKEN_DEVADDR_MASK) >> TD_TOKEN_DEVADDR_SHIFT) as u8,
            endpoint: ((raw & TD_TOKEN_ENDPT_MASK) >> TD_TOKEN_ENDPT_SHIFT) as u8,
            toggle: raw & TD_TOKEN_D != 0,
            max_len: decode_len(raw >> TD_TOKEN_MAXLEN_SHIFT),
        })
    }
}

/// Snapshot of a TD's control/status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdStatus(pub u32);

impl TdStatus {
    pub fn active(self) -> bool {
        self.0 & TD_CTRL_ACTIVE != 0
    }

    pub fn actual_len(self) -> usize {
        decode_len(self.0 & TD_CTRL_ACTLEN_MASK)
    }

    pub fn has_error(self) -> bool {
        self.0 & TD_CTRL_ERROR_MASK != 0
    }

    pub fn stalled(self) -> bool {
        self.0 & TD_CTRL_STALLED != 0
    }

    pub fn ioc(self) -> bool {
        self.0 & TD_CTRL_IOC != 0
    }
}

/// Driver-side description of a TD before it is written to DMA memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub link: Link,
    pub depth_first: bool,
    pub low_speed: bool,
    pub isochronous: bool,
    pub ioc: bool,
    pub short_packet_detect: bool,
    pub token: TdToken,
    pub buffer: u32,
}

impl TransferDescriptor {
    pub fn new(token: TdToken, buffer: u32) -> Self {
        Self {
            link: Link::Terminate,
            depth_first: true,
            low_speed: false,
            isochronous: false,
            ioc: false,
            short_packet_detect: false,
            token,
            buffer,
        }
    }

    /// Control/status word for a freshly armed TD: active, three retries, zero actual length.
    pub fn control_word(&self) -> u32 {
        let mut ctrl = TD_CTRL_ACTIVE | LEN_FIELD_ZERO;
        if !self.isochronous {
            ctrl |= 3 << TD_CTRL_CERR_SHIFT;
        }
        if self.low_speed {
            ctrl |= TD_CTRL_LS;
        }
        if self.isochronous {
            ctrl |= TD_CTRL_ISO;
        }
        if self.ioc {
            ctrl |= TD_CTRL_IOC;
        }
        if self.short_packet_detect {
            ctrl |= TD_CTRL_SPD;
        }
        ctrl
    }
}

/// Writes every word of an unpublished TD. The link word goes last.
pub fn write_td(mem: &DmaMemory, td: TdId, desc: &TransferDescriptor) {
    let layout = mem.layout();
    let addr = layout.td_addr(td);
    mem.write_u32(addr + TD_BUFFER, desc.buffer);
    mem.write_u32(addr + TD_TOKEN, desc.token.encode());
    mem.write_u32(addr + TD_CTRL_STS, desc.control_word());
    mem.write_u32(
        addr + TD_LINK,
        encode_link(layout, desc.link, desc.depth_first),
    );
}

pub fn read_td_status(mem: &DmaMemory, td: TdId) -> TdStatus {
    TdStatus(mem.read_u32(mem.layout().td_addr(td) + TD_CTRL_STS))
}

pub fn write_td_status(mem: &DmaMemory, td: TdId, value: u32) {
    mem.write_u32(mem.layout().td_addr(td) + TD_CTRL_STS, value);
}

pub fn read_td_token_raw(mem: &DmaMemory, td: TdId) -> u32 {
    mem.read_u32(mem.layout().td_addr(td) + TD_TOKEN)
}

pub fn read_td_token(mem: &DmaMemory, td: TdId) -> Option<TdToken> {
    TdToken::decode(read_td_token_raw(mem, td))
}

pub fn write_td_token_raw(mem: &DmaMemory, td: TdId, value: u32) {
    mem.write_u32(mem.layout().td_addr(td) + TD_TOKEN, value);
}

pub fn read_td_link(mem: &DmaMemory, td: TdId) -> Link {
    decode_link(mem.layout(), mem.read_u32(mem.layout().td_addr(td) + TD_LINK))
}

pub fn read_td_link_raw(mem: &DmaMemory, td: TdId) -> u32 {
    mem.read_u32(mem.layout().td_addr(td) + TD_LINK)
}

pub fn write_td_link(mem: &DmaMemory, td: TdId, link: Link, depth_first: bool) {
    let raw = encode_link(mem.layout(), link, depth_first);
    mem.write_u32(mem.layout().td_addr(td) + TD_LINK, raw);
}

pub fn write_td_link_raw(mem: &DmaMemory, td: TdId, raw: u32) {
    mem.write_u32(mem.layout().td_addr(td) + TD_LINK, raw);
}

pub fn read_td_buffer(mem: &DmaMemory, td: TdId) -> u32 {
    mem.read_u32(mem.layout().td_addr(td) + TD_BUFFER)
}

pub fn write_qh(mem: &DmaMemory, qh: QhId, head: Link, element: Link) {
    write_qh_element(mem, qh, element);
    write_qh_head(mem, qh, head);
}

pub fn read_qh_head(mem: &DmaMemory, qh: QhId) -> Link {
    decode_link(mem.layout(), read_qh_head_raw(mem, qh))
}

pub fn read_qh_head_raw(mem: &DmaMemory, qh: QhId) -> u32 {
    mem.read_u32(mem.layout().qh_addr(qh) + QH_HEAD)
}

pub fn write_qh_head(mem: &DmaMemory, qh: QhId, head: Link) {
    write_qh_head_raw(mem, qh, encode_link(mem.layout(), head, false));
}

pub fn write_qh_head_raw(mem: &DmaMemory, qh: QhId, raw: u32) {
    mem.write_u32(mem.layout().qh_addr(qh) + QH_HEAD, raw);
}

pub fn read_qh_element(mem: &DmaMemory, qh: QhId) -> Link {
    decode_link(mem.layout(), read_qh_element_raw(mem, qh))
}

pub fn read_qh_element_raw(mem: &DmaMemory, qh: QhId) -> u32 {
    mem.read_u32(mem.layout().qh_addr(qh) + QH_ELEMENT)
}

pub fn write_qh_element(mem: &DmaMemory, qh: QhId, element: Link) {
    let raw = encode_link(mem.layout(), element, false);
    mem.write_u32(mem.layout().qh_addr(qh) + QH_ELEMENT, raw);
}
