#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uhci_hcd::dma::DmaMemory;
use uhci_hcd::hw::{
    decode_link, encode_len, Link, Pid, TdToken, LINK_PTR_ADDR_MASK, LINK_PTR_Q, LINK_PTR_T,
    LINK_PTR_VF, TD_CTRL_ACTIVE, TD_CTRL_ACTLEN_MASK, TD_CTRL_CRC_TIMEOUT, TD_CTRL_IOC,
    TD_CTRL_ISO, TD_CTRL_NAK, TD_CTRL_SPD, TD_CTRL_STALLED, TD_CTRL_STATUS_MASK,
};
use uhci_hcd::regs::{
    REG_FLBASEADD, REG_FRNUM, REG_PORTSC1, REG_SOFMOD, REG_USBCMD, REG_USBINTR, REG_USBSTS,
    ROOT_PORTS, PORTSC_CCS, PORTSC_CHANGE_MASK, PORTSC_CSC, USBCMD_HCRESET, USBCMD_RS,
    USBSTS_HCHALTED, USBSTS_HSE, USBSTS_USBERRINT, USBSTS_USBINT, USBSTS_W1C_MASK,
};
use uhci_hcd::{Completion, HcPlatform, Hcd, HcdConfig};

/// Schedule links followed per frame before the walk is declared runaway.
const MAX_LINKS_PER_FRAME: usize = 4096;
/// TDs executed from one queue per frame.
const MAX_QUEUE_STEPS: usize = 1024;
/// QHs nested through element links (bulk queue continuation points).
const MAX_NESTING: usize = 16;

/// What a device endpoint answers to the next transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// OUT/SETUP: accepted. IN: a full packet of counting bytes.
    Ack,
    Nak,
    Stall,
    Timeout,
    /// IN: exactly these bytes (truncated to MaxLen). OUT: accepted.
    Data(Vec<u8>),
}

/// A transaction the simulated controller completed (NAKed attempts are not recorded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub frame: u16,
    pub device: u8,
    pub endpoint: u8,
    pub pid: Pid,
    pub toggle: bool,
    pub len: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hang {
    /// Frames stop until the next HCRESET.
    UntilReset,
    /// Frames never advance again.
    Permanent,
}

#[derive(Default)]
struct EndpointSim {
    script: VecDeque<Response>,
    default: Option<Response>,
    bytes_in: usize,
}

struct SimState {
    usbcmd: u16,
    usbsts: u16,
    usbintr: u16,
    frnum: u16,
    flbaseadd: u32,
    sofmod: u8,
    portsc: [u16; ROOT_PORTS],
    irq_enabled: bool,
    uptime: Duration,
    mem: Option<Arc<DmaMemory>>,
    endpoints: HashMap<(u8, u8), EndpointSim>,
    packets: Vec<Packet>,
    hang: Option<Hang>,
    resets: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            usbcmd: 0,
            usbsts: 0,
            usbintr: 0,
            frnum: 0,
            flbaseadd: 0,
            sofmod: 64,
            portsc: [0; ROOT_PORTS],
            irq_enabled: false,
            uptime: Duration::ZERO,
            mem: None,
            endpoints: HashMap::new(),
            packets: Vec::new(),
            hang: None,
            resets: 0,
        }
    }

    fn reset(&mut self) {
        self.usbcmd = 0;
        self.usbsts = 0;
        self.usbintr = 0;
        self.frnum = 0;
        self.flbaseadd = 0;
        self.sofmod = 64;
        for port in self.portsc.iter_mut() {
            *port &= !PORTSC_CHANGE_MASK;
        }
        self.resets += 1;
        if self.hang == Some(Hang::UntilReset) {
            self.hang = None;
        }
    }

    fn running(&self) -> bool {
        self.usbcmd & USBCMD_RS != 0 && self.hang.is_none() && self.mem.is_some()
    }

    fn respond(&mut self, device: u8, endpoint: u8) -> Response {
        let ep = self.endpoints.entry((device, endpoint)).or_default();
        ep.script
            .pop_front()
            .or_else(|| ep.default.clone())
            .unwrap_or(Response::Ack)
    }
}

/// A UHCI controller model that walks the driver's DMA schedule one frame at a time.
///
/// Cloning yields another handle to the same controller, so tests keep one while the [`Hcd`]
/// owns the other.
#[derive(Clone)]
pub struct Sim {
    inner: Arc<Mutex<SimState>>,
}

impl Sim {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap()
    }

    pub fn attach(&self, mem: Arc<DmaMemory>) {
        self.state().mem = Some(mem);
    }

    /// Queues one-shot responses for `device`/`endpoint`, consumed in order by every transaction
    /// (of any PID) on that endpoint.
    pub fn script(&self, device: u8, endpoint: u8, responses: impl IntoIterator<Item = Response>) {
        let mut st = self.state();
        let ep = st.endpoints.entry((device, endpoint)).or_default();
        ep.script.extend(responses);
    }

    /// Response used once the script for the endpoint is exhausted.
    pub fn set_default(&self, device: u8, endpoint: u8, response: Response) {
        let mut st = self.state();
        st.endpoints.entry((device, endpoint)).or_default().default = Some(response);
    }

    pub fn hang(&self, hang: Hang) {
        self.state().hang = Some(hang);
    }

    /// Stops the controller with the given USBSTS error bits, as after a host system error.
    pub fn fault(&self, status: u16) {
        let mut st = self.state();
        st.usbsts |= status;
        st.usbcmd &= !USBCMD_RS;
    }

    pub fn connect(&self, port: usize) {
        self.state().portsc[port] |= PORTSC_CCS | PORTSC_CSC;
    }

    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    pub fn frame_number(&self) -> u16 {
        self.state().frnum & 0x3ff
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.state().packets.clone()
    }

    pub fn packets_for(&self, device: u8, endpoint: u8) -> Vec<Packet> {
        self.state()
            .packets
            .iter()
            .filter(|p| p.device == device && p.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn irq_pending(&self) -> bool {
        let st = self.state();
        st.irq_enabled && st.usbintr != 0 && st.usbsts & USBSTS_W1C_MASK != 0
    }

    /// Runs one 1 ms frame: walks the frame list entry for the current frame number, then
    /// advances FRNUM. A stopped or hung controller only lets time pass.
    pub fn run_frame(&self) {
        let mut guard = self.state();
        let st = &mut *guard;
        st.uptime += Duration::from_millis(1);
        if !st.running() {
            return;
        }
        let Some(mem) = st.mem.clone() else {
            return;
        };

        let frame = st.frnum & 0x3ff;
        let entry = mem.read_u32(st.flbaseadd + u32::from(frame) * 4);
        let mut walker = Walker {
            mem: &mem,
            st: &mut *st,
            frame,
            visited: HashSet::new(),
        };
        walker.walk(entry);
        st.frnum = (st.frnum + 1) & 0x7ff;
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl HcPlatform for Sim {
    fn read_frame_number(&self) -> u16 {
        self.state().frnum & 0x3ff
    }

    fn read_reg(&self, offset: u16, _width: usize) -> u32 {
        let st = self.state();
        let value = match offset {
            REG_USBCMD => st.usbcmd,
            REG_USBSTS => {
                let halted = if st.usbcmd & USBCMD_RS == 0 {
                    USBSTS_HCHALTED
                } else {
                    0
                };
                st.usbsts | halted
            }
            REG_USBINTR => st.usbintr,
            REG_FRNUM => st.frnum,
            REG_FLBASEADD => return st.flbaseadd,
            REG_SOFMOD => u16::from(st.sofmod),
            off if (REG_PORTSC1..REG_PORTSC1 + 2 * ROOT_PORTS as u16).contains(&off) => {
                st.portsc[usize::from((off - REG_PORTSC1) / 2)]
            }
            _ => 0xffff,
        };
        u32::from(value)
    }

    fn write_reg(&self, offset: u16, _width: usize, value: u32) {
        let mut st = self.state();
        let v = value as u16;
        match offset {
            REG_USBCMD => {
                if v & USBCMD_HCRESET != 0 {
                    st.reset();
                } else {
                    st.usbcmd = v;
                }
            }
            REG_USBSTS => st.usbsts &= !(v & USBSTS_W1C_MASK),
            REG_USBINTR => st.usbintr = v & 0x0f,
            REG_FRNUM => st.frnum = v & 0x07ff,
            REG_FLBASEADD => st.flbaseadd = value & !0xfff,
            REG_SOFMOD => st.sofmod = value as u8,
            off if (REG_PORTSC1..REG_PORTSC1 + 2 * ROOT_PORTS as u16).contains(&off) => {
                let port = &mut st.portsc[usize::from((off - REG_PORTSC1) / 2)];
                *port &= !(v & PORTSC_CHANGE_MASK);
            }
            _ => {}
        }
    }

    fn enable_interrupts(&self, _mask: u16) {
        self.state().irq_enabled = true;
    }

    fn disable_interrupts(&self) {
        self.state().irq_enabled = false;
    }

    fn uptime(&self) -> Duration {
        self.state().uptime
    }
}

enum Outcome {
    /// The TD was not active.
    Skipped,
    Nak,
    /// Completed; the queue may move on to the TD's link.
    Advanced,
    /// Completed with an error or a short packet; the queue stops here.
    Stopped,
}

struct Walker<'a> {
    mem: &'a DmaMemory,
    st: &'a mut SimState,
    frame: u16,
    visited: HashSet<u32>,
}

impl Walker<'_> {
    fn walk(&mut self, mut link: u32) {
        for _ in 0..MAX_LINKS_PER_FRAME {
            if link & LINK_PTR_T != 0 {
                return;
            }
            let addr = link & LINK_PTR_ADDR_MASK;
            if addr == 0 {
                return;
            }
            if link & LINK_PTR_Q != 0 {
                // Coming back to a QH means the reclamation loop closed; the frame is over.
                if !self.visited.insert(addr) {
                    return;
                }
                self.process_queue(addr, 0);
            } else {
                if !self.visited.insert(addr) {
                    self.st.usbsts |= USBSTS_USBERRINT | USBSTS_HSE;
                    return;
                }
                self.execute(addr);
            }
            link = self.mem.read_u32(addr);
        }
        self.st.usbsts |= USBSTS_USBERRINT | USBSTS_HSE;
    }

    /// Runs the element chain of the QH at `qh_addr`. Its horizontal link is left to the caller.
    fn process_queue(&mut self, qh_addr: u32, depth: usize) {
        let mut elem = self.mem.read_u32(qh_addr + 4);
        for _ in 0..MAX_QUEUE_STEPS {
            if elem & LINK_PTR_T != 0 {
                return;
            }
            let addr = elem & LINK_PTR_ADDR_MASK;
            if elem & LINK_PTR_Q != 0 {
                if depth < MAX_NESTING && self.visited.insert(addr) {
                    self.process_queue(addr, depth + 1);
                }
                return;
            }
            match self.execute(addr) {
                Outcome::Skipped | Outcome::Nak | Outcome::Stopped => return,
                Outcome::Advanced => {
                    let next = self.mem.read_u32(addr);
                    self.mem.write_u32(qh_addr + 4, next);
                    if next & LINK_PTR_VF == 0 {
                        return;
                    }
                    elem = next;
                }
            }
        }
    }

    fn execute(&mut self, td_addr: u32) -> Outcome {
        let ctrl = self.mem.read_u32(td_addr + 4);
        if ctrl & TD_CTRL_ACTIVE == 0 {
            return Outcome::Skipped;
        }
        let Some(token) = TdToken::decode(self.mem.read_u32(td_addr + 8)) else {
            self.complete(td_addr, ctrl, TD_CTRL_STALLED, 0);
            return Outcome::Stopped;
        };
        let buffer = self.mem.read_u32(td_addr + 12);
        let iso = ctrl & TD_CTRL_ISO != 0;

        let mut response = self.st.respond(token.device, token.endpoint);
        if iso && response == Response::Nak {
            response = Response::Data(Vec::new());
        }

        let (error, data) = match (&response, token.pid) {
            (Response::Nak, _) => {
                self.mem
                    .write_u32(td_addr + 4, ctrl | TD_CTRL_NAK | TD_CTRL_ACTIVE);
                return Outcome::Nak;
            }
            (Response::Stall, _) => (TD_CTRL_STALLED, Vec::new()),
            (Response::Timeout, _) => (TD_CTRL_CRC_TIMEOUT, Vec::new()),
            (Response::Ack, Pid::In) => {
                let ep = self
                    .st
                    .endpoints
                    .entry((token.device, token.endpoint))
                    .or_default();
                let data: Vec<u8> = (0..token.max_len)
                    .map(|i| (ep.bytes_in + i) as u8)
                    .collect();
                (0, data)
            }
            (Response::Data(bytes), Pid::In) => {
                let mut data = bytes.clone();
                data.truncate(token.max_len);
                (0, data)
            }
            (Response::Ack | Response::Data(_), Pid::Out | Pid::Setup) => {
                let mut data = vec![0u8; token.max_len];
                self.mem.read_physical(buffer, &mut data);
                (0, data)
            }
        };

        if error != 0 {
            self.complete(td_addr, ctrl, error, 0);
            return if iso {
                Outcome::Advanced
            } else {
                Outcome::Stopped
            };
        }

        if token.pid == Pid::In {
            self.mem.write_physical(buffer, &data);
            self.st
                .endpoints
                .entry((token.device, token.endpoint))
                .or_default()
                .bytes_in += data.len();
        }
        self.st.packets.push(Packet {
            frame: self.frame,
            device: token.device,
            endpoint: token.endpoint,
            pid: token.pid,
            toggle: token.toggle,
            len: data.len(),
            data: data.clone(),
        });
        self.complete(td_addr, ctrl, 0, data.len());

        let short = token.pid == Pid::In && data.len() < token.max_len;
        if short && ctrl & TD_CTRL_SPD != 0 && !iso {
            self.st.usbsts |= USBSTS_USBINT;
            return Outcome::Stopped;
        }
        Outcome::Advanced
    }

    fn complete(&mut self, td_addr: u32, ctrl: u32, error: u32, actual: usize) {
        let status =
            (ctrl & !(TD_CTRL_STATUS_MASK | TD_CTRL_ACTLEN_MASK)) | error | encode_len(actual);
        self.mem.write_u32(td_addr + 4, status);
        if error != 0 {
            self.st.usbsts |= USBSTS_USBERRINT;
        }
        if ctrl & TD_CTRL_IOC != 0 {
            self.st.usbsts |= USBSTS_USBINT;
        }
    }
}

pub fn config() -> HcdConfig {
    HcdConfig {
        td_count: 512,
        qh_count: 64,
        buffer_bytes: 32 * 1024,
        fsbr_idle_timeout: Duration::from_millis(10),
        watchdog_timeout: Duration::from_millis(20),
        ..HcdConfig::default()
    }
}

pub fn setup_with(config: HcdConfig) -> (Sim, Hcd<Sim>) {
    let sim = Sim::new();
    let hcd = Hcd::new(sim.clone(), config).unwrap();
    sim.attach(hcd.dma_memory());
    hcd.start().unwrap();
    (sim, hcd)
}

pub fn setup() -> (Sim, Hcd<Sim>) {
    setup_with(config())
}

/// Runs `frames` frames, servicing the interrupt line and the driver timer after each one.
pub fn run(sim: &Sim, hcd: &Hcd<Sim>, frames: usize) {
    for _ in 0..frames {
        sim.run_frame();
        if sim.irq_pending() {
            hcd.handle_interrupt();
        }
        hcd.timer_tick();
    }
}

/// Like [`run`], but also polls root hub status (and with it the watchdog) every frame.
pub fn run_polling(sim: &Sim, hcd: &Hcd<Sim>, frames: usize) {
    for _ in 0..frames {
        run(sim, hcd, 1);
        hcd.poll_periodic_status();
    }
}

/// Completion sink shared between a test and the callbacks it installs.
#[derive(Clone, Default)]
pub struct Completions {
    inner: Arc<Mutex<Vec<(u16, Completion)>>>,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback recording each completion together with the controller frame it arrived in.
    pub fn sink(&self, sim: &Sim) -> impl Fn(&Completion) + Send + Sync + 'static {
        let inner = self.inner.clone();
        let sim = sim.clone();
        move |c: &Completion| {
            let frame = sim.frame_number();
            inner.lock().unwrap().push((frame, c.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Completion> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn with_frames(&self) -> Vec<(u16, Completion)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Completion> {
        self.inner.lock().unwrap().last().map(|(_, c)| c.clone())
    }
}

/// QHs reachable horizontally from frame slot `slot`, in walk order, stopping at the first
/// repeat.
pub fn horizontal_chain(mem: &DmaMemory, slot: usize) -> Vec<u32> {
    let layout = mem.layout();
    let mut out = Vec::new();
    let mut link = decode_link(layout, mem.read_u32(layout.frame_slot_addr(slot)));
    loop {
        match link {
            Link::Qh(qh) => {
                let addr = layout.qh_addr(qh);
                if out.contains(&addr) {
                    break;
                }
                out.push(addr);
                link = decode_link(layout, mem.read_u32(addr));
            }
            Link::Td(td) => {
                link = decode_link(layout, mem.read_u32(layout.td_addr(td)));
            }
            Link::Terminate => break,
        }
    }
    out
}
