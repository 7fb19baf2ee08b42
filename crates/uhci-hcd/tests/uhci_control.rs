use uhci_hcd::hw::Pid;
use uhci_hcd::{HcdError, RequestState, Speed, TransferError, TransferFlags, TransferRequest};

mod util;

use util::{horizontal_chain, run, setup, Completions, Response};

const GET_DESCRIPTOR: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02];
const SET_CONFIGURATION: [u8; 8] = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];

#[test]
fn control_read_splits_data_stage_and_alternates_toggles() {
    let (sim, hcd) = setup();
    let done = Completions::new();
    let handle = hcd
        .submit(
            TransferRequest::control_in(1, GET_DESCRIPTOR, 512)
                .with_max_packet(256)
                .on_complete(done.sink(&sim)),
        )
        .unwrap();

    run(&sim, &hcd, 2);

    let packets = sim.packets_for(1, 0);
    let shape: Vec<(Pid, bool, usize)> = packets.iter().map(|p| (p.pid, p.toggle, p.len)).collect();
    assert_eq!(
        shape,
        vec![
            (Pid::Setup, false, 8),
            (Pid::In, true, 256),
            (Pid::In, false, 256),
            (Pid::Out, true, 0),
        ]
    );
    assert_eq!(packets[0].data, GET_DESCRIPTOR);

    let c = done.last().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(c.handle, handle);
    assert_eq!(c.status, Ok(()));
    assert_eq!(c.actual_length, 512);
    let expected: Vec<u8> = (0..512).map(|i| i as u8).collect();
    assert_eq!(c.data, expected);
    assert_eq!(hcd.request_state(handle), Some(RequestState::Freed));
    assert_eq!(hcd.active_count(), 0);
}

#[test]
fn control_without_data_stage_uses_in_status() {
    let (sim, hcd) = setup();
    let done = Completions::new();
    hcd.submit(
        TransferRequest::control_out(1, SET_CONFIGURATION, Vec::new()).on_complete(done.sink(&sim)),
    )
    .unwrap();
    run(&sim, &hcd, 1);

    let shape: Vec<(Pid, bool)> = sim
        .packets_for(1, 0)
        .iter()
        .map(|p| (p.pid, p.toggle))
        .collect();
    assert_eq!(shape, vec![(Pid::Setup, false), (Pid::In, true)]);
    let c = done.last().unwrap();
    assert_eq!(c.status, Ok(()));
    assert_eq!(c.actual_length, 0);
    assert!(c.data.is_empty());
}

#[test]
fn control_write_sends_payload() {
    let (sim, hcd) = setup();
    let done = Completions::new();
    let payload: Vec<u8> = (0..20).collect();
    hcd.submit(
        TransferRequest::control_out(1, SET_CONFIGURATION, payload.clone())
            .on_complete(done.sink(&sim)),
    )
    .unwrap();
    run(&sim, &hcd, 1);

    let packets = sim.packets_for(1, 0);
    let out: Vec<u8> = packets
        .iter()
        .filter(|p| p.pid == Pid::Out)
        .flat_map(|p| p.data.clone())
        .collect();
    assert_eq!(out, payload);
    let toggles: Vec<bool> = packets.iter().map(|p| p.toggle).collect();
    // SETUP is DATA0, the data stage starts at DATA1 and alternates, STATUS is always DATA1.
    assert_eq!(toggles, vec![false, true, false, true, true]);
    assert_eq!(packets.last().unwrap().pid, Pid::In);
    assert_eq!(done.last().unwrap().actual_length, 20);
}

#[test]
fn short_control_read_restarts_status_stage() {
    let (sim, hcd) = setup();
    sim.script(
        1,
        0,
        [
            Response::Ack,
            Response::Data(vec![0x11; 8]),
            Response::Data(vec![0x22; 3]),
        ],
    );
    let done = Completions::new();
    hcd.submit(TransferRequest::control_in(1, GET_DESCRIPTOR, 64).on_complete(done.sink(&sim)))
        .unwrap();

    run(&sim, &hcd, 1);
    // The controller stopped on the short packet; the status stage has not run yet.
    assert!(done.is_empty());
    run(&sim, &hcd, 1);

    let shape: Vec<(Pid, bool, usize)> = sim
        .packets_for(1, 0)
        .iter()
        .map(|p| (p.pid, p.toggle, p.len))
        .collect();
    assert_eq!(
        shape,
        vec![
            (Pid::Setup, false, 8),
            (Pid::In, true, 8),
            (Pid::In, false, 3),
            (Pid::Out, true, 0),
        ]
    );
    let c = done.last().unwrap();
    assert_eq!(c.status, Ok(()));
    assert_eq!(c.actual_length, 11);
    let mut expected = vec![0x11; 8];
    expected.extend([0x22; 3]);
    assert_eq!(c.data, expected);
}

#[test]
fn short_control_read_with_short_not_ok_fails() {
    let (sim, hcd) = setup();
    sim.script(1, 0, [Response::Ack, Response::Data(vec![0x33; 2])]);
    let done = Completions::new();
    hcd.submit(
        TransferRequest::control_in(1, GET_DESCRIPTOR, 18)
            .with_flags(TransferFlags::SHORT_NOT_OK)
            .on_complete(done.sink(&sim)),
    )
    .unwrap();
    run(&sim, &hcd, 3);

    let c = done.last().unwrap();
    assert_eq!(c.status, Err(TransferError::ShortPacket));
    assert_eq!(c.actual_length, 2);
    assert_eq!(sim.packets_for(1, 0).last().unwrap().pid, Pid::Out);
}

#[test]
fn control_stall_is_reported_without_halting_endpoint_zero() {
    let (sim, hcd) = setup();
    sim.script(1, 0, [Response::Ack, Response::Stall]);
    let done = Completions::new();
    hcd.submit(TransferRequest::control_in(1, GET_DESCRIPTOR, 8).on_complete(done.sink(&sim)))
        .unwrap();
    run(&sim, &hcd, 1);

    let c = done.last().unwrap();
    assert_eq!(c.status, Err(TransferError::Stall));
    assert_eq!(c.error_count, 1);
    assert!(!hcd.is_halted(1, 0, uhci_hcd::Direction::In));

    hcd.submit(TransferRequest::control_in(1, GET_DESCRIPTOR, 8).on_complete(done.sink(&sim)))
        .unwrap();
    run(&sim, &hcd, 1);
    assert_eq!(done.last().unwrap().status, Ok(()));
}

#[test]
fn one_control_transfer_per_endpoint() {
    let (sim, hcd) = setup();
    sim.set_default(1, 0, Response::Nak);
    hcd.submit(TransferRequest::control_in(1, GET_DESCRIPTOR, 8))
        .unwrap();
    assert_eq!(
        hcd.submit(TransferRequest::control_in(1, GET_DESCRIPTOR, 8)),
        Err(HcdError::EndpointBusy {
            device: 1,
            endpoint: 0
        })
    );
    // Other devices are unaffected.
    hcd.submit(TransferRequest::control_in(2, GET_DESCRIPTOR, 8))
        .unwrap();
}

#[test]
fn low_speed_control_runs_ahead_of_full_speed_control() {
    let (sim, hcd) = setup();
    sim.set_default(3, 0, Response::Nak);
    sim.set_default(4, 0, Response::Nak);
    let mem = hcd.dma_memory();
    let baseline = horizontal_chain(&mem, 0);
    assert_eq!(baseline.len(), 5);

    hcd.submit(TransferRequest::control_in(3, GET_DESCRIPTOR, 8).with_speed(Speed::Low))
        .unwrap();
    assert!(!hcd.reclamation_enabled());
    let chain = horizontal_chain(&mem, 0);
    assert_eq!(chain.len(), 6);
    assert_eq!(chain[..2], baseline[..2]);
    assert!(!baseline.contains(&chain[2]));
    assert_eq!(chain[3..], baseline[2..]);

    hcd.submit(TransferRequest::control_in(4, GET_DESCRIPTOR, 8))
        .unwrap();
    assert!(hcd.reclamation_enabled());
    let chain = horizontal_chain(&mem, 0);
    assert_eq!(chain.len(), 7);
    assert_eq!(chain[3], baseline[2]);
    assert!(!baseline.contains(&chain[4]));
    assert_eq!(chain[5..], baseline[3..]);
}
