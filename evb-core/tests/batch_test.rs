use evb_core::{BatchError, BatchManager, ContributorParams};
use evb_proto::{DgramHeader, PulseId, Service, SrcId, HEADER_SIZE};
use std::thread;
use std::time::Duration;

fn params() -> ContributorParams {
    ContributorParams {
        max_entries: 16,
        batch_count: 64,
        max_input_size: 64,
        ..ContributorParams::default()
    }
}

#[test]
fn batch_index_follows_the_pulse_window() {
    let batman = BatchManager::new(&params());
    assert_eq!(batman.batch_index(PulseId(0x100)), 0x10);
    assert_eq!(batman.batch_index(PulseId(0x10f)), 0x10);
    assert_eq!(batman.batch_index(PulseId(0x110)), 0x11);
    // Wraps modulo the ring size
    assert_eq!(batman.batch_index(PulseId(0x400)), 0);
}

#[test]
fn expiry_is_a_window_comparison() {
    let batman = BatchManager::new(&params());
    assert!(!batman.expired(PulseId(0x10f), PulseId(0x100)));
    assert!(batman.expired(PulseId(0x110), PulseId(0x100)));
    assert!(batman.expired(PulseId(0x0ff), PulseId(0x100)));
}

#[test]
fn allocate_packs_the_batch_until_full() {
    let mut batman = BatchManager::new(&params());
    let idx = batman.fetch_wait(PulseId(0x100)).unwrap();
    assert_eq!(idx, 0x10);

    for i in 0..16 {
        let offset = batman.allocate(idx).unwrap();
        assert_eq!(offset, 0x10 * 16 * 64 + i * 64);
    }
    assert_eq!(
        batman.allocate(idx),
        Err(BatchError::BatchFull { index: 0x10 })
    );
    assert_eq!(batman.batch_extent(idx), 16 * 64);
}

#[test]
fn stored_tokens_are_retrieved_by_pulse() {
    let mut batman = BatchManager::new(&params());
    let handle = batman.handle();

    batman.fetch_wait(PulseId(0x100)).unwrap();
    batman.store(PulseId(0x100), 0xdead);
    batman.store(PulseId(0x101), 0xbeef);
    assert_eq!(handle.retrieve(PulseId(0x100)), 0xdead);
    assert_eq!(handle.retrieve(PulseId(0x101)), 0xbeef);
}

#[test]
fn fragments_roundtrip_through_the_region() {
    let mut batman = BatchManager::new(&params());
    let idx = batman.fetch_wait(PulseId(0x100)).unwrap();
    let offset = batman.allocate(idx).unwrap();

    let hdr = DgramHeader::new(PulseId(0x100), Service::L1Accept, SrcId(3), 1);
    batman.write_fragment(offset, &hdr, &[7; 8]).unwrap();
    batman.mark_eol(offset).unwrap();

    let back = batman.region().read_header(offset).unwrap();
    assert_eq!(back.pulse_id(), PulseId(0x100));
    assert!(back.is_eol());
    let mut payload = [0u8; 8];
    batman
        .region()
        .read_at(offset + HEADER_SIZE, &mut payload)
        .unwrap();
    assert_eq!(payload, [7; 8]);
}

#[test]
fn sealed_slot_blocks_fetch_until_released() {
    let mut batman = BatchManager::new(&params());
    let handle = batman.handle();

    let idx = batman.fetch_wait(PulseId(0x100)).unwrap();
    batman.allocate(idx).unwrap();
    batman.seal(idx);
    assert_eq!(batman.counters().in_use, 1);

    // The ring has wrapped: the same slot is wanted for a later window.
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.release(PulseId(0x100));
    });

    let again = batman.fetch_wait(PulseId(0x500)).unwrap();
    releaser.join().unwrap();
    assert_eq!(again, idx);
    // The slot was re-armed for the new window.
    assert_eq!(batman.batch_extent(again), 0);
    assert_eq!(batman.start_pid(again), Some(PulseId(0x500)));
    assert_eq!(batman.counters().frees, 1);
}

#[test]
fn stop_wakes_blocked_fetches_and_startup_rearms() {
    let mut batman = BatchManager::new(&params());

    // Seal the slot so the next fetch of its window would block, then stop:
    // the fetch must return None instead of waiting forever.
    let idx = batman.fetch_wait(PulseId(0x100)).unwrap();
    batman.seal(idx);
    batman.stop();
    assert_eq!(batman.fetch_wait(PulseId(0x500)), None);

    batman.startup();
    assert!(batman.fetch_wait(PulseId(0x100)).is_some());
}

#[test]
fn same_window_refetch_reuses_the_open_batch() {
    let mut batman = BatchManager::new(&params());

    let a = batman.fetch_wait(PulseId(0x100)).unwrap();
    batman.allocate(a).unwrap();
    let b = batman.fetch_wait(PulseId(0x101)).unwrap();
    assert_eq!(a, b);
    // Still the same fill: the second fetch did not reset the batch.
    assert_eq!(batman.batch_extent(b), 64);
    assert_eq!(batman.start_pid(b), Some(PulseId(0x100)));
}
