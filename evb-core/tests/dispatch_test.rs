use evb_core::testing::{MemCompletionQueue, MemEndpoint};
use evb_core::{
    connect_builders, pending_queue, BatchManager, CompletionQueue, Contributor,
    ContributorParams, DispatchError, Link, PendingKind, PendingRx, SharedRegion,
};
use evb_proto::{DgramHeader, ImmKind, PulseId, Service, SrcId, HEADER_SIZE};
use std::thread;
use std::time::Duration;

const TMO: Duration = Duration::from_millis(500);

fn params(n_builders: usize) -> ContributorParams {
    ContributorParams {
        id: 3,
        builders: (1 << n_builders) - 1,
        partition: 0,
        contractor: 1,
        batching: true,
        max_entries: 16,
        batch_count: 64,
        max_input_size: 64,
        max_tr_size: 64,
        max_tr_buffers: 4,
        credit_wait_ms: 200,
        ..ContributorParams::default()
    }
}

struct BuilderSide {
    cq: MemCompletionQueue,
    region: SharedRegion,
    link: Link<MemEndpoint>,
}

fn harness(prms: &ContributorParams) -> (Contributor<MemEndpoint>, PendingRx, Vec<BuilderSide>) {
    let batman = BatchManager::new(prms);
    let region_size = batman.region_size();
    let tr_space = prms.max_tr_buffers * prms.max_tr_size;

    let mut endpoints = Vec::new();
    let mut cqs = Vec::new();
    let mut penders = Vec::new();
    for id in 0..prms.num_builders() {
        let cq = MemCompletionQueue::new();
        let (poster_ep, pender_ep) = MemEndpoint::pair_with_cq(&cq);
        penders.push(thread::spawn(move || {
            let pending = Link::pender(pender_ep, SrcId(id as u8)).unwrap();
            let region = SharedRegion::new(pending.announced_size() + tr_space);
            let link = pending.expose(&region).unwrap();
            (link, region)
        }));
        endpoints.push(poster_ep);
        cqs.push(cq);
    }

    let links = connect_builders(endpoints, SrcId(prms.id), region_size).unwrap();
    let sides = penders
        .into_iter()
        .zip(cqs)
        .map(|(pender, cq)| {
            let (link, region) = pender.join().unwrap();
            BuilderSide { cq, region, link }
        })
        .collect();

    let (pending_tx, pending_rx) = pending_queue(256);
    (
        Contributor::new(prms.clone(), batman, links, pending_tx),
        pending_rx,
        sides,
    )
}

fn l1(pid: u64) -> DgramHeader {
    DgramHeader::new(PulseId(pid), Service::L1Accept, SrcId(3), 1)
}

fn feed(ctrb: &mut Contributor<MemEndpoint>, hdr: &DgramHeader) {
    let offset = ctrb.allocate(hdr, hdr.pulse_id().0).unwrap().unwrap();
    ctrb.write_fragment(offset, hdr, &[]).unwrap();
    ctrb.process(hdr, offset, 0).unwrap();
}

#[test]
fn non_monotonic_pulse_id_is_fatal() {
    let prms = params(1);
    let (mut ctrb, _pending, _sides) = harness(&prms);

    feed(&mut ctrb, &l1(0x200));
    let err = ctrb.allocate(&l1(0x100), 0).unwrap_err();
    assert_eq!(
        err,
        DispatchError::NonMonotonicPulseId {
            prev: PulseId(0x200),
            cur: PulseId(0x100),
        }
    );
}

#[test]
fn window_expiry_closes_and_posts_the_batch() {
    let prms = params(3);
    let (mut ctrb, pending, mut sides) = harness(&prms);

    feed(&mut ctrb, &l1(0x100));
    feed(&mut ctrb, &l1(0x101));
    assert_eq!(ctrb.counters().batches, 0);

    // 0x110 lies outside the window opened by 0x100
    feed(&mut ctrb, &l1(0x110));
    assert_eq!(ctrb.counters().batches, 1);

    let entry = pending.try_pop().unwrap();
    assert_eq!(entry.start_pid, PulseId(0x100));
    assert_eq!(entry.kind, PendingKind::Posted { dst: 1 });

    // The selected builder is (0x10 / max_entries) mod num_builders = 1.
    let imm = sides[1].cq.pend(TMO).unwrap();
    assert_eq!(imm.kind(), ImmKind::Buffer);
    assert!(imm.is_response());
    assert_eq!(imm.src(), SrcId(3));
    assert_eq!(imm.idx(), 0x10 * 16);

    let base = imm.idx() as usize * prms.max_input_size;
    let first = sides[1].region.read_header(base).unwrap();
    assert_eq!(first.pulse_id(), PulseId(0x100));
    assert!(!first.is_eol());
    let second = sides[1]
        .region
        .read_header(base + prms.max_input_size)
        .unwrap();
    assert_eq!(second.pulse_id(), PulseId(0x101));
    assert!(second.is_eol());
}

#[test]
fn transitions_are_forwarded_to_unselected_builders() {
    let prms = params(3);
    let (mut ctrb, pending, mut sides) = harness(&prms);

    let disable = DgramHeader::new(PulseId(0x200), Service::Disable, SrcId(3), 1);
    feed(&mut ctrb, &disable);

    // dst = ((0x200 >> 4) / 16) mod 3 = 2 receives it inside a batch and
    // will respond.
    let entry = pending.try_pop().unwrap();
    assert_eq!(entry.kind, PendingKind::Posted { dst: 2 });
    let imm = sides[2].cq.pend(TMO).unwrap();
    assert_eq!(imm.kind(), ImmKind::Buffer);
    assert!(imm.is_response());
    let hdr = sides[2]
        .region
        .read_header(imm.idx() as usize * prms.max_input_size)
        .unwrap();
    assert_eq!(hdr.service(), Some(Service::Disable));
    assert!(hdr.is_eol());

    // The other two receive it standalone, without response, each spending
    // one transition-buffer credit.
    let batch_region_size = prms.batch_count * prms.max_entries * prms.max_input_size;
    for pos in [0, 1] {
        let side = &mut sides[pos];
        let imm = side.cq.pend(TMO).unwrap();
        assert_eq!(imm.kind(), ImmKind::Transition);
        assert!(!imm.is_response());
        assert_eq!(imm.idx(), 0); // First credit off the free list

        let offset = batch_region_size + imm.idx() as usize * prms.max_tr_size;
        let hdr = side.region.read_header(offset).unwrap();
        assert_eq!(hdr.service(), Some(Service::Disable));
        assert_eq!(hdr.pulse_id(), PulseId(0x200));
        assert!(hdr.is_eol());
    }

    // A second transition consumes the next credit.
    let begin = DgramHeader::new(PulseId(0x300), Service::Enable, SrcId(3), 1);
    feed(&mut ctrb, &begin);
    let _ = sides[0].cq.pend(TMO).unwrap(); // its own batch went to dst 0
    let imm = sides[1].cq.pend(TMO).unwrap();
    assert_eq!(imm.kind(), ImmKind::Transition);
    assert_eq!(imm.idx(), 1);
}

#[test]
fn bypass_fragments_skip_the_builders() {
    let prms = params(2);
    let (mut ctrb, pending, mut sides) = harness(&prms);

    feed(&mut ctrb, &l1(0x100));

    // Group 1 does not intersect the partition group: bypass.
    let stray = DgramHeader::new(PulseId(0x101), Service::L1Accept, SrcId(3), 0b10);
    feed(&mut ctrb, &stray);

    // The open batch was closed and posted first.
    let first = pending.try_pop().unwrap();
    assert_eq!(first.start_pid, PulseId(0x100));
    assert!(matches!(first.kind, PendingKind::Posted { .. }));
    let _ = sides[1].cq.pend(TMO).unwrap();

    // Then the bypass entry, EOL-terminated for the matcher.
    let entry = pending.try_pop().unwrap();
    assert_eq!(entry.kind, PendingKind::Bypass);
    assert_eq!(entry.start_pid, PulseId(0x101));
    let hdr = ctrb
        .batch_manager()
        .region()
        .read_header(entry.offset)
        .unwrap();
    assert!(hdr.is_eol());

    // Neither builder saw the stray fragment.
    assert!(matches!(
        sides[0].cq.pend(Duration::from_millis(50)),
        Err(evb_core::TransportError::Timeout)
    ));
    assert!(matches!(
        sides[1].cq.pend(Duration::from_millis(50)),
        Err(evb_core::TransportError::Timeout)
    ));
}

#[test]
fn exhausted_credits_time_out_fatally() {
    let prms = ContributorParams {
        max_tr_buffers: 0,
        credit_wait_ms: 20,
        ..params(2)
    };
    let (mut ctrb, _pending, _sides) = harness(&prms);

    let disable = DgramHeader::new(PulseId(0x200), Service::Disable, SrcId(3), 1);
    let offset = ctrb.allocate(&disable, 0).unwrap().unwrap();
    ctrb.write_fragment(offset, &disable, &[]).unwrap();
    let err = ctrb.process(&disable, offset, 0).unwrap_err();
    assert!(matches!(err, DispatchError::NoTransitionBuffer { .. }));
}

#[test]
fn transitions_with_payload_are_rejected() {
    let prms = params(2);
    let (mut ctrb, _pending, _sides) = harness(&prms);

    let disable = DgramHeader::new(PulseId(0x200), Service::Disable, SrcId(3), 1);
    let offset = ctrb.allocate(&disable, 0).unwrap().unwrap();
    ctrb.write_fragment(offset, &disable, &[1, 2, 3]).unwrap();
    let err = ctrb.process(&disable, offset, 3).unwrap_err();
    assert_eq!(
        err,
        DispatchError::UnexpectedPayload {
            service: Service::Disable,
            size: 3,
        }
    );
}

#[test]
fn eol_marking_does_not_corrupt_the_stored_fragment() {
    let prms = params(1);
    let (mut ctrb, pending, _sides) = harness(&prms);

    let hdr = l1(0x107);
    let offset = ctrb.allocate(&hdr, 42).unwrap().unwrap();
    ctrb.write_fragment(offset, &hdr, &[9; 16]).unwrap();
    let disable = DgramHeader::new(PulseId(0x108), Service::Disable, SrcId(3), 1);
    let d_off = ctrb.allocate(&disable, 43).unwrap().unwrap();
    ctrb.write_fragment(d_off, &disable, &[]).unwrap();
    ctrb.process(&hdr, offset, 16).unwrap();
    ctrb.process(&disable, d_off, 0).unwrap();

    let entry = pending.try_pop().unwrap();
    let region = ctrb.batch_manager().region();
    let first = region.read_header(entry.offset).unwrap();
    assert_eq!(first.pulse_id(), PulseId(0x107));
    let mut payload = [0u8; 16];
    region.read_at(entry.offset + HEADER_SIZE, &mut payload).unwrap();
    assert_eq!(payload, [9; 16]);
}
