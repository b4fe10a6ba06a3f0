//! Contributor-side batch ring.
//!
//! A pre-registered region carved into `batch_count` batch slots of
//! `max_entries` fragment entries each.  The slot for a pulse follows from
//! the pulse id alone, so both sides of a link agree on placement without
//! negotiation.  A slot posted to a builder stays *pending* until the
//! matching result comes back; fetching a pending slot blocks, which is the
//! backpressure that keeps at most `MAX_LATENCY` entries in flight.

use crate::bitset::BitSet;
use crate::config::ContributorParams;
use crate::error::{BatchError, TransportError};
use crate::transport::SharedRegion;
use evb_proto::constants::BATCH_WORDS;
use evb_proto::{DgramHeader, PulseId, HEADER_SIZE};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
struct BatchState {
    start_pid: Option<PulseId>,
    fill: usize,
    sealed: bool,
}

/// State shared with the result-receiver thread.
#[derive(Debug)]
struct BatchCore {
    pending: Mutex<BitSet<BATCH_WORDS>>,
    released: Condvar,
    running: AtomicBool,
    app_prms: Mutex<Vec<u64>>,
    frees: AtomicU64,
    waiting: AtomicU64,
    log2_entries: u32,
    batch_count: usize,
    max_entries: usize,
}

impl BatchCore {
    #[inline]
    fn batch_index(&self, pid: PulseId) -> usize {
        ((pid.0 >> self.log2_entries) as usize) % self.batch_count
    }

    #[inline]
    fn entry_index(&self, pid: PulseId) -> usize {
        self.batch_index(pid) * self.max_entries + (pid.0 as usize & (self.max_entries - 1))
    }
}

/// Cloneable handle the result side uses to look up stored tokens and hand
/// slots back to the dispatcher.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    core: Arc<BatchCore>,
}

impl BatchHandle {
    /// The opaque token stored for `pid` when its fragment was batched.
    pub fn retrieve(&self, pid: PulseId) -> u64 {
        let idx = self.core.entry_index(pid);
        self.core.app_prms.lock()[idx]
    }

    /// Returns the slot holding `pid` to the ring once its result has been
    /// consumed, waking a dispatcher blocked on it.
    pub fn release(&self, pid: PulseId) {
        let idx = self.core.batch_index(pid);
        let mut pending = self.core.pending.lock();
        if pending.unset(idx) {
            self.core.frees.fetch_add(1, Ordering::Relaxed);
        }
        self.core.released.notify_all();
    }

    /// Initiates teardown from any thread: wakes every blocked fetch, which
    /// then returns None.
    pub fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        self.core.released.notify_all();
    }
}

/// Snapshot of the ring's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub allocs: u64,
    pub frees: u64,
    pub in_use: u64,
    pub waiting: u64,
}

pub struct BatchManager {
    region: SharedRegion,
    max_entries: usize,
    max_input_size: usize,
    batches: Vec<BatchState>,
    core: Arc<BatchCore>,
    allocs: u64,
}

impl BatchManager {
    pub fn new(prms: &ContributorParams) -> BatchManager {
        let region_size = prms.batch_count * prms.max_entries * prms.max_input_size;
        BatchManager {
            region: SharedRegion::new(region_size),
            max_entries: prms.max_entries,
            max_input_size: prms.max_input_size,
            batches: vec![BatchState::default(); prms.batch_count],
            core: Arc::new(BatchCore {
                pending: Mutex::new(BitSet::new()),
                released: Condvar::new(),
                running: AtomicBool::new(true),
                app_prms: Mutex::new(vec![0; prms.batch_count * prms.max_entries]),
                frees: AtomicU64::new(0),
                waiting: AtomicU64::new(0),
                log2_entries: prms.max_entries.trailing_zeros(),
                batch_count: prms.batch_count,
                max_entries: prms.max_entries,
            }),
            allocs: 0,
        }
    }

    pub fn handle(&self) -> BatchHandle {
        BatchHandle {
            core: Arc::clone(&self.core),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn region_size(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn batch_index(&self, pid: PulseId) -> usize {
        self.core.batch_index(pid)
    }

    /// True iff `cur` lies outside the batch window opened by `start`.
    #[inline]
    pub fn expired(&self, cur: PulseId, start: PulseId) -> bool {
        (cur.0 >> self.core.log2_entries) != (start.0 >> self.core.log2_entries)
    }

    /// Reserves the batch slot for `pid`, blocking while the slot is still
    /// awaiting its result.  None only during teardown.
    pub fn fetch_wait(&mut self, pid: PulseId) -> Option<usize> {
        let idx = self.core.batch_index(pid);
        {
            let mut pending = self.core.pending.lock();
            while pending.get(idx) && self.core.running.load(Ordering::Acquire) {
                self.core.waiting.fetch_add(1, Ordering::Relaxed);
                self.core.released.wait(&mut pending);
                self.core.waiting.fetch_sub(1, Ordering::Relaxed);
            }
            if !self.core.running.load(Ordering::Acquire) {
                return None;
            }
        }

        let reset = match self.batches[idx] {
            BatchState {
                start_pid: Some(start),
                sealed,
                ..
            } => sealed || self.expired(pid, start),
            BatchState {
                start_pid: None, ..
            } => true,
        };
        if reset {
            self.batches[idx] = BatchState {
                start_pid: Some(pid),
                fill: 0,
                sealed: false,
            };
            self.allocs += 1;
        }
        Some(idx)
    }

    /// Bumps the batch's fill pointer by one fragment slot, returning the
    /// region offset of the reserved slot.
    pub fn allocate(&mut self, idx: usize) -> Result<usize, BatchError> {
        let state = &mut self.batches[idx];
        if state.fill + self.max_input_size > self.max_entries * self.max_input_size {
            return Err(BatchError::BatchFull { index: idx });
        }
        let offset = idx * self.max_entries * self.max_input_size + state.fill;
        state.fill += self.max_input_size;
        Ok(offset)
    }

    /// Records the caller's opaque per-event token for later [`retrieve`].
    ///
    /// [`retrieve`]: BatchHandle::retrieve
    pub fn store(&self, pid: PulseId, app_prm: u64) {
        let idx = self.core.entry_index(pid);
        self.core.app_prms.lock()[idx] = app_prm;
    }

    /// Copies a fragment into its reserved slot.
    pub fn write_fragment(
        &self,
        offset: usize,
        header: &DgramHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        debug_assert!(HEADER_SIZE + payload.len() <= self.max_input_size);
        self.region.write_header(offset, header)?;
        if !payload.is_empty() {
            self.region.write_at(offset + HEADER_SIZE, payload)?;
        }
        Ok(())
    }

    /// Terminates the fragment at `offset` as the last of its batch.
    pub fn mark_eol(&self, offset: usize) -> Result<(), TransportError> {
        let mut header = self.region.read_header(offset)?;
        header.set_eol();
        self.region.write_header(offset, &header)
    }

    /// Marks the batch as posted; fetches of this slot now block until the
    /// result side releases it.
    pub fn seal(&mut self, idx: usize) {
        self.batches[idx].sealed = true;
        self.core.pending.lock().set(idx);
    }

    pub fn batch_offset(&self, idx: usize) -> usize {
        idx * self.max_entries * self.max_input_size
    }

    /// Bytes filled so far in the batch.
    pub fn batch_extent(&self, idx: usize) -> usize {
        self.batches[idx].fill
    }

    pub fn start_pid(&self, idx: usize) -> Option<PulseId> {
        self.batches[idx].start_pid
    }

    /// Wakes every blocked fetch; they return None.
    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Re-arms the ring for a new run cycle.
    pub fn startup(&mut self) {
        self.core.pending.lock().clear();
        self.core.app_prms.lock().fill(0);
        for state in &mut self.batches {
            *state = BatchState::default();
        }
        self.core.running.store(true, Ordering::Release);
    }

    pub fn counters(&self) -> BatchCounters {
        BatchCounters {
            allocs: self.allocs,
            frees: self.core.frees.load(Ordering::Relaxed),
            in_use: self.core.pending.lock().count_ones() as u64,
            waiting: self.core.waiting.load(Ordering::Relaxed),
        }
    }

    /// Logs any slots still awaiting results.
    pub fn dump(&self) {
        let pending = self.core.pending.lock();
        if let Some(first) = pending.first_one() {
            tracing::info!(
                in_use = pending.count_ones(),
                first,
                "batch slots still awaiting results"
            );
        }
    }
}
