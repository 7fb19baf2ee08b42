//! Submission: turning a [`TransferRequest`] into a descriptor chain and linking it into the
//! schedule.
//!
//! Every builder allocates everything it needs before writing a single hardware-visible link.
//! Allocation goes through [`ChainAlloc`], which hands all descriptors back to the pool if the
//! builder bails out, so a failed submission leaves nothing behind.

use tracing::debug;

use crate::dma::{DmaMemory, FRAME_LIST_ENTRIES};
use crate::error::{HcdError, Result};
use crate::frame::slot_of;
use crate::hw::{self, Link, Pid, QhId, TdId, TdToken, TransferDescriptor};
use crate::pool::{Descriptor, DescriptorPool, DmaBuffer};
use crate::request::{Direction, PipeType, RequestHandle, Speed, TransferFlags, TransferRequest};
use crate::schedule::{anchor_for_interval, Position};
use crate::state::{HcdState, Shared, Tick};
use crate::transfer::{EndpointKey, Stage, TdSlot, Transfer};

/// Largest packet a TD's 11-bit MaxLen field is allowed to describe on a full-speed bus.
const MAX_PACKET_LIMIT: u16 = 1023;
const LOW_SPEED_MAX_PACKET: u16 = 8;

/// Descriptors allocated for one request that is still being built.
struct ChainAlloc<'a> {
    pool: &'a DescriptorPool,
    frame: u64,
    descs: Vec<Descriptor>,
    committed: bool,
}

impl<'a> ChainAlloc<'a> {
    fn new(pool: &'a DescriptorPool, frame: u64) -> Self {
        Self {
            pool,
            frame,
            descs: Vec::new(),
            committed: false,
        }
    }

    fn td(&mut self) -> Result<TdId> {
        let td = self.pool.allocate_td()?;
        self.descs.push(Descriptor::Td(td));
        Ok(td)
    }

    fn qh(&mut self) -> Result<QhId> {
        let qh = self.pool.allocate_qh()?;
        self.descs.push(Descriptor::Qh(qh));
        Ok(qh)
    }

    fn buffer(&mut self, len: usize) -> Result<DmaBuffer> {
        let buf = self.pool.allocate_buffer(len)?;
        self.descs.push(Descriptor::Buffer(buf));
        Ok(buf)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ChainAlloc<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for desc in self.descs.drain(..) {
            self.pool.free(desc, self.frame);
        }
    }
}

fn validate(req: &TransferRequest) -> Result<()> {
    if req.device > 127 {
        return Err(HcdError::InvalidRequest("device address out of range"));
    }
    if req.endpoint > 15 {
        return Err(HcdError::InvalidRequest("endpoint number out of range"));
    }
    if req.max_packet == 0 || req.max_packet > MAX_PACKET_LIMIT {
        return Err(HcdError::InvalidRequest("max packet size out of range"));
    }
    if req.speed == Speed::Low {
        if !matches!(req.pipe, PipeType::Control | PipeType::Interrupt) {
            return Err(HcdError::InvalidRequest(
                "low-speed devices only have control and interrupt endpoints",
            ));
        }
        if req.max_packet > LOW_SPEED_MAX_PACKET {
            return Err(HcdError::InvalidRequest("low-speed max packet is 8 bytes"));
        }
    }
    if req.direction == Direction::Out && req.data.len() != req.length {
        return Err(HcdError::InvalidRequest("OUT payload does not match length"));
    }
    match req.pipe {
        PipeType::Control => {
            if req.setup.is_none() {
                return Err(HcdError::InvalidRequest("control transfer without setup packet"));
            }
        }
        PipeType::Interrupt => {
            if req.length > usize::from(req.max_packet) {
                return Err(HcdError::InvalidRequest(
                    "interrupt transfer longer than one packet",
                ));
            }
        }
        PipeType::Isochronous => {
            if req.iso_packets.is_empty() {
                return Err(HcdError::InvalidRequest("isochronous transfer without packets"));
            }
            if req
                .iso_packets
                .iter()
                .any(|&len| len > usize::from(req.max_packet))
            {
                return Err(HcdError::InvalidRequest(
                    "isochronous packet larger than max packet",
                ));
            }
            if req.iso_packets.iter().sum::<usize>() != req.length {
                return Err(HcdError::InvalidRequest(
                    "isochronous packet sizes do not add up to length",
                ));
            }
        }
        PipeType::Bulk => {}
    }
    Ok(())
}

/// Splits `length` bytes into max-packet sized data TDs with alternating toggles, appending them
/// to `out`. With `zero_length_packet` an empty transfer still gets one empty packet. Returns the
/// toggle following the last packet.
fn plan_data(
    alloc: &mut ChainAlloc<'_>,
    out: &mut Vec<TdSlot>,
    pid: Pid,
    length: usize,
    max_packet: usize,
    mut toggle: bool,
    zero_length_packet: bool,
) -> Result<bool> {
    let mut offset = 0;
    let mut first = true;
    while offset < length || (first && zero_length_packet) {
        let len = max_packet.min(length - offset);
        out.push(TdSlot {
            id: alloc.td()?,
            stage: Stage::Data,
            pid,
            toggle,
            len,
            offset,
            frame: 0,
        });
        toggle = !toggle;
        offset += len;
        first = false;
    }
    Ok(toggle)
}

/// Writes the TDs of a control/bulk/interrupt request, each linked depth-first to the next.
fn write_tds(mem: &DmaMemory, t: &Transfer) {
    let last = t.tds.len().saturating_sub(1);
    for (i, slot) in t.tds.iter().enumerate().rev() {
        let token = TdToken {
            pid: slot.pid,
            device: t.key.device,
            endpoint: t.key.endpoint,
            toggle: slot.toggle,
            max_len: slot.len,
        };
        let buffer = match slot.stage {
            Stage::Setup => t.setup_buf.addr(),
            _ => t.data_buf.addr() + slot.offset as u32,
        };
        let mut desc = TransferDescriptor::new(token, buffer);
        desc.link = t.tds.get(i + 1).map_or(Link::Terminate, |next| Link::Td(next.id));
        desc.low_speed = t.speed == Speed::Low;
        desc.ioc = i == last;
        desc.short_packet_detect = slot.stage == Stage::Data && slot.pid == Pid::In;
        hw::write_td(mem, slot.id, &desc);
    }
}

fn data_pid(direction: Direction) -> Pid {
    match direction {
        Direction::In => Pid::In,
        Direction::Out => Pid::Out,
    }
}

impl HcdState {
    pub(crate) fn submit(
        &mut self,
        shared: &Shared,
        mut req: TransferRequest,
        tick: Tick,
    ) -> Result<RequestHandle> {
        if self.dead {
            return Err(HcdError::ControllerDead);
        }
        if !self.running {
            return Err(HcdError::NotRunning);
        }
        validate(&req)?;

        let key = EndpointKey {
            device: req.device,
            endpoint: req.endpoint,
            direction: req.direction,
        };
        if self.endpoints.get(&key).is_some_and(|ep| ep.halted) {
            return Err(HcdError::EndpointHalted {
                device: req.device,
                endpoint: req.endpoint,
            });
        }

        let handle = RequestHandle(self.next_handle);
        let mut t = Transfer::new(handle, req.pipe, key);
        t.speed = req.speed;
        t.flags = req.flags;
        t.length = req.length;
        t.interval = req.interval;
        t.deadline = req.timeout.map(|timeout| tick.uptime + timeout);
        t.last_activity = tick.uptime;
        t.on_complete = req.on_complete.take();

        match req.pipe {
            PipeType::Control => self.submit_control(shared, &req, &mut t, tick)?,
            PipeType::Bulk => self.submit_bulk(shared, &req, &mut t, tick)?,
            PipeType::Interrupt => self.submit_interrupt(shared, &req, &mut t, tick)?,
            PipeType::Isochronous => self.submit_iso(shared, &req, &mut t, tick)?,
        }
        self.next_handle += 1;

        t.fsbr_eligible = match req.pipe {
            PipeType::Control => req.speed == Speed::Full,
            PipeType::Bulk => true,
            _ => false,
        } && !req.flags.contains(TransferFlags::NO_FSBR);
        self.fsbr_acquire(&shared.mem, &mut t);
        if let Some(qh) = t.qh {
            t.element_snapshot = hw::read_qh_element_raw(&shared.mem, qh);
        }

        debug!(
            %handle,
            device = req.device,
            endpoint = req.endpoint,
            pipe = ?req.pipe,
            length = req.length,
            tds = t.tds.len(),
            frame = tick.frame,
            "submitted"
        );
        self.active.push(t);
        Ok(handle)
    }

    fn submit_control(
        &mut self,
        shared: &Shared,
        req: &TransferRequest,
        t: &mut Transfer,
        tick: Tick,
    ) -> Result<()> {
        let busy = self.active.iter().any(|other| {
            other.pipe == PipeType::Control
                && other.key.device == t.key.device
                && other.key.endpoint == t.key.endpoint
        });
        if busy {
            return Err(HcdError::EndpointBusy {
                device: t.key.device,
                endpoint: t.key.endpoint,
            });
        }
        let setup = req
            .setup
            .ok_or(HcdError::InvalidRequest("control transfer without setup packet"))?;

        let mem = &*shared.mem;
        let mut alloc = ChainAlloc::new(&shared.pool, tick.frame);
        t.setup_buf = alloc.buffer(setup.len())?;
        t.data_buf = alloc.buffer(req.length)?;
        let qh = alloc.qh()?;

        let mut tds = vec![TdSlot {
            id: alloc.td()?,
            stage: Stage::Setup,
            pid: Pid::Setup,
            toggle: false,
            len: setup.len(),
            offset: 0,
            frame: 0,
        }];
        plan_data(
            &mut alloc,
            &mut tds,
            data_pid(req.direction),
            req.length,
            usize::from(req.max_packet),
            true,
            false,
        )?;
        let status_pid = if req.length > 0 && req.direction == Direction::In {
            Pid::Out
        } else {
            Pid::In
        };
        tds.push(TdSlot {
            id: alloc.td()?,
            stage: Stage::Status,
            pid: status_pid,
            toggle: true,
            len: 0,
            offset: 0,
            frame: 0,
        });
        t.tds = tds;

        mem.write_physical(t.setup_buf.addr(), &setup);
        if req.direction == Direction::Out {
            mem.write_physical(t.data_buf.addr(), &req.data);
        }
        write_tds(mem, t);
        self.schedule.insert_td_in_queue(mem, qh, t.tds[0].id);

        // Low-speed control runs ahead of full-speed control, outside the reclamation loop.
        let anchor = match req.speed {
            Speed::Low => self.schedule.fs_control(),
            Speed::Full => self.schedule.bulk(),
        };
        if !self.schedule.insert_qh(mem, anchor, qh, Position::Before) {
            return Err(HcdError::InvalidRequest("control schedule anchor missing"));
        }
        alloc.commit();
        t.qh = Some(qh);
        Ok(())
    }

    fn submit_bulk(
        &mut self,
        shared: &Shared,
        req: &TransferRequest,
        t: &mut Transfer,
        tick: Tick,
    ) -> Result<()> {
        let queue_flag = req.flags.contains(TransferFlags::QUEUE_BULK);
        let tail = self
            .endpoints
            .get(&t.key)
            .and_then(|ep| ep.bulk_queue.last().copied());
        let append_to = match tail {
            None => None,
            Some(tail) => match self.transfer(tail).and_then(|other| other.bottom_qh) {
                Some(bottom) if queue_flag => Some(bottom),
                _ => {
                    return Err(HcdError::EndpointBusy {
                        device: t.key.device,
                        endpoint: t.key.endpoint,
                    })
                }
            },
        };
        let toggle = self.endpoint(t.key).toggle;

        let mem = &*shared.mem;
        let mut alloc = ChainAlloc::new(&shared.pool, tick.frame);
        t.data_buf = alloc.buffer(req.length)?;
        let qh = alloc.qh()?;
        let bottom = if queue_flag { Some(alloc.qh()?) } else { None };
        let mut tds = Vec::new();
        let next_toggle = plan_data(
            &mut alloc,
            &mut tds,
            data_pid(req.direction),
            req.length,
            usize::from(req.max_packet),
            toggle,
            true,
        )?;
        t.tds = tds;

        if req.direction == Direction::Out {
            mem.write_physical(t.data_buf.addr(), &req.data);
        }
        write_tds(mem, t);
        if let (Some(bottom), Some(last)) = (bottom, t.tds.last()) {
            self.schedule.append_qh_after_td(mem, last.id, bottom);
        }
        self.schedule.insert_td_in_queue(mem, qh, t.tds[0].id);

        match append_to {
            Some(prev_bottom) => {
                mem.publish_barrier();
                hw::write_qh_element(mem, prev_bottom, Link::Qh(qh));
            }
            None => {
                let anchor = self.schedule.chain_end();
                if !self.schedule.insert_qh(mem, anchor, qh, Position::Before) {
                    return Err(HcdError::InvalidRequest("bulk schedule anchor missing"));
                }
            }
        }
        alloc.commit();
        t.qh = Some(qh);
        t.bottom_qh = bottom;

        let ep = self.endpoint(t.key);
        ep.toggle = next_toggle;
        ep.bulk_queue.push(t.handle);
        Ok(())
    }

    fn submit_interrupt(
        &mut self,
        shared: &Shared,
        req: &TransferRequest,
        t: &mut Transfer,
        tick: Tick,
    ) -> Result<()> {
        let key = t.key;
        if self
            .active
            .iter()
            .any(|other| other.pipe == PipeType::Interrupt && other.key == key)
        {
            return Err(HcdError::EndpointBusy {
                device: key.device,
                endpoint: key.endpoint,
            });
        }
        let toggle = self.endpoint(key).toggle;

        let mem = &*shared.mem;
        let mut alloc = ChainAlloc::new(&shared.pool, tick.frame);
        t.data_buf = alloc.buffer(req.length)?;
        let qh = alloc.qh()?;
        t.tds = vec![TdSlot {
            id: alloc.td()?,
            stage: Stage::Data,
            pid: data_pid(req.direction),
            toggle,
            len: req.length,
            offset: 0,
            frame: 0,
        }];

        if req.direction == Direction::Out {
            mem.write_physical(t.data_buf.addr(), &req.data);
        }
        write_tds(mem, t);
        self.schedule.insert_td_in_queue(mem, qh, t.tds[0].id);
        let anchor = self
            .schedule
            .interrupt_anchor(anchor_for_interval(req.interval));
        if !self.schedule.insert_qh(mem, anchor, qh, Position::After) {
            return Err(HcdError::InvalidRequest("interrupt schedule anchor missing"));
        }
        alloc.commit();
        t.qh = Some(qh);
        Ok(())
    }

    fn submit_iso(
        &mut self,
        shared: &Shared,
        req: &TransferRequest,
        t: &mut Transfer,
        tick: Tick,
    ) -> Result<()> {
        let packets = req.iso_packets.len();
        let max = shared.config.max_iso_frames;
        if packets > max {
            return Err(HcdError::IsoSpanTooLong { packets, max });
        }

        let key = t.key;
        let booked: Vec<(u64, u64)> = self
            .active
            .iter()
            .filter(|other| other.pipe == PipeType::Isochronous && other.key == key)
            .map(|other| (other.iso_start, other.iso_end()))
            .collect();

        let now = tick.frame;
        let start = if req.flags.contains(TransferFlags::ISO_ASAP) {
            match booked.iter().map(|&(_, end)| end).max() {
                Some(end) if end > now => end,
                _ => now + u64::from(shared.config.iso_asap_delay_frames),
            }
        } else {
            self.clock.next_occurrence(req.iso_start_frame)
        };
        let end = start + packets as u64;
        let conflict = HcdError::IsoConflict {
            start_frame: slot_of(start) as u16,
            packets,
        };
        // The controller is already in the current frame's slot, and the whole window has to fit
        // in one pass over the frame list.
        if start <= now || end - now > FRAME_LIST_ENTRIES as u64 {
            return Err(conflict);
        }
        if booked.iter().any(|&(s, e)| start < e && s < end) {
            return Err(conflict);
        }

        let mem = &*shared.mem;
        let mut alloc = ChainAlloc::new(&shared.pool, tick.frame);
        t.data_buf = alloc.buffer(req.length)?;
        let pid = data_pid(req.direction);
        let mut offset = 0;
        for (i, &len) in req.iso_packets.iter().enumerate() {
            t.tds.push(TdSlot {
                id: alloc.td()?,
                stage: Stage::Iso,
                pid,
                toggle: false,
                len,
                offset,
                frame: start + i as u64,
            });
            offset += len;
        }

        if req.direction == Direction::Out {
            mem.write_physical(t.data_buf.addr(), &req.data);
        }
        let last = t.tds.len() - 1;
        for (i, slot) in t.tds.iter().enumerate() {
            let token = TdToken {
                pid,
                device: key.device,
                endpoint: key.endpoint,
                toggle: false,
                max_len: slot.len,
            };
            let mut desc =
                TransferDescriptor::new(token, t.data_buf.addr() + slot.offset as u32);
            desc.depth_first = false;
            desc.isochronous = true;
            desc.ioc = i == last;
            hw::write_td(mem, slot.id, &desc);
        }
        for slot in &t.tds {
            self.schedule.link_iso_td(mem, slot_of(slot.frame), slot.id);
        }
        alloc.commit();
        t.iso_start = start;
        Ok(())
    }
}
