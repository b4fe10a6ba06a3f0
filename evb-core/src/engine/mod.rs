//! The event-builder engine: a bounded, keyed reassembly buffer.
//!
//! Fragments arrive in arbitrary per-contributor order; the engine groups
//! them by pulse identifier into epochs and events, tracks each event's
//! contract, and delivers completed events strictly in pulse order.  Events
//! that fail to complete within the configured timeout are fixed up: marked
//! damaged, reported per missing contributor, and delivered in order anyway.
//!
//! The engine is single-threaded; its only suspension points are in the
//! caller's transport loop.

mod event;
mod pool;

pub use event::{Contribution, Event};

use self::event::Epoch;
use self::pool::SlotPool;
use crate::config::BuilderParams;
use crate::error::EngineError;
use crate::time::TimeProvider;
use evb_proto::{DgramHeader, PulseId, SrcId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The capabilities the engine needs from its owner.
///
/// The engine owns the sink; the sink holds no reference back.
pub trait EventSink {
    /// The contributors required for the event this fragment creates,
    /// derived from its readout groups.  Called once per event, on the first
    /// fragment seen.
    fn contract(&self, header: &DgramHeader) -> u64;

    /// A finished event, complete or fixed up, delivered in pulse order.
    fn process(&mut self, event: &Event);

    /// `src` was expected by `event`'s contract but never arrived.  Called
    /// once per missing contributor before the event is delivered damaged.
    fn fixup(&mut self, event: &mut Event, src: SrcId);
}

/// Monotonic bookkeeping, exposed by value so observers never reach into
/// live engine state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub epoch_allocs: u64,
    pub epoch_frees: u64,
    pub event_allocs: u64,
    pub event_frees: u64,
    pub event_occupancy: u64,
    pub event_pool_depth: u64,
    /// Events that exceeded the timeout.
    pub timeouts: u64,
    /// Events delivered with a fixup.
    pub fixups: u64,
    /// Fragments that arrived after their event was already delivered.
    pub late_arrivals: u64,
    /// Contributor bitmap of the most recent fixup.
    pub missing: u64,
    /// Age of the oldest pending event at the last idle check.
    pub age: Duration,
}

pub struct EventBuilder<S> {
    sink: S,
    time: Arc<dyn TimeProvider>,
    mask: u64,
    entries: usize,
    log2_entries: u32,
    n_epochs: usize,
    event_timeout: Duration,
    epochs: SlotPool<Epoch>,
    events: SlotPool<Event>,
    /// Epoch pool indices, oldest first, strictly ascending key.
    pending: VecDeque<u32>,
    epoch_lut: Vec<Option<(u64, u32)>>,
    event_lut: Vec<Option<(PulseId, u32)>>,
    t_last_flush: Instant,
    last_flushed: Option<PulseId>,
    timeouts: u64,
    fixups: u64,
    late_arrivals: u64,
    missing: u64,
    age: Duration,
}

impl<S: EventSink> EventBuilder<S> {
    /// `entries` is the epoch width (power of two); `epochs` bounds how many
    /// epochs may be in flight before the pool runs dry.
    pub fn new(
        entries: usize,
        epochs: usize,
        event_timeout: Duration,
        time: Arc<dyn TimeProvider>,
        sink: S,
    ) -> Self {
        assert!(entries.is_power_of_two(), "entries must be a power of two");
        let now = time.now();
        Self {
            sink,
            time,
            mask: entries as u64 - 1,
            entries,
            log2_entries: entries.trailing_zeros(),
            n_epochs: epochs,
            event_timeout,
            epochs: SlotPool::new(epochs),
            events: SlotPool::new(epochs * entries),
            pending: VecDeque::new(),
            epoch_lut: vec![None; epochs],
            event_lut: vec![None; epochs * entries],
            t_last_flush: now,
            last_flushed: None,
            timeouts: 0,
            fixups: 0,
            late_arrivals: 0,
            missing: 0,
            age: Duration::ZERO,
        }
    }

    pub fn with_params(params: &BuilderParams, time: Arc<dyn TimeProvider>, sink: S) -> Self {
        Self::new(
            params.max_entries,
            params.epochs(),
            Duration::from_millis(params.event_timeout_ms),
            time,
            sink,
        )
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// When the engine last made flush progress.
    pub fn last_flush(&self) -> Instant {
        self.t_last_flush
    }

    #[inline]
    fn ep_index(&self, epoch_key: u64) -> usize {
        ((epoch_key >> self.log2_entries) as usize) % self.n_epochs
    }

    #[inline]
    fn ev_index(&self, pid: PulseId) -> usize {
        self.ep_index(pid.epoch_key(self.mask)) * self.entries + pid.event_key(self.mask) as usize
    }

    /// Feeds one fragment into the reassembly buffer, then flushes whatever
    /// became deliverable.  `buf_size` is the slot size the fragment
    /// occupies; `prm` is an opaque parameter stored with the contribution.
    pub fn process(
        &mut self,
        header: &DgramHeader,
        buf_size: usize,
        prm: u64,
    ) -> Result<(), EngineError> {
        let pid = header.pulse_id();

        if let Some(last) = self.last_flushed {
            if pid <= last {
                self.late_arrivals += 1;
                debug!(pid = %pid, src = %header.src(), "late fragment dropped");
                return Ok(());
            }
        }

        let ep_idx = self.match_epoch(pid)?;
        self.match_event(ep_idx, header, buf_size, prm)?;
        self.try_flush();
        Ok(())
    }

    fn match_epoch(&mut self, pid: PulseId) -> Result<u32, EngineError> {
        let key = pid.epoch_key(self.mask);
        let slot = self.ep_index(key);

        if let Some((held, idx)) = self.epoch_lut[slot] {
            if held == key {
                return Ok(idx);
            }
            // Entries are cleared on retire, so a differing key is a live
            // epoch: the key space wrapped faster than the flush rate.
            return Err(EngineError::LutCollision {
                held: PulseId(held),
                probed: pid,
            });
        }

        let idx = self
            .epochs
            .alloc(Epoch::new(key))
            .ok_or(EngineError::PoolExhausted { what: "epoch", pid })?;

        let epochs = &self.epochs;
        let pos = self
            .pending
            .iter()
            .rposition(|&e| epochs.get(e).key < key)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.pending.insert(pos, idx);
        self.epoch_lut[slot] = Some((key, idx));
        Ok(idx)
    }

    fn match_event(
        &mut self,
        ep_idx: u32,
        header: &DgramHeader,
        buf_size: usize,
        prm: u64,
    ) -> Result<(), EngineError> {
        let pid = header.pulse_id();
        let slot = self.ev_index(pid);

        if let Some((held, idx)) = self.event_lut[slot] {
            if held == pid {
                let ev = self.events.get_mut(idx);
                if ev.contribution(header.src()).is_some() {
                    warn!(pid = %pid, src = %header.src(), "duplicate contribution");
                }
                ev.add(header, prm, buf_size);
                return Ok(());
            }
            return Err(EngineError::LutCollision { held, probed: pid });
        }

        let contract = self.sink.contract(header);
        let arrival = self.time.now();
        let idx = self
            .events
            .alloc(Event::new(header, prm, contract, arrival, buf_size))
            .ok_or(EngineError::PoolExhausted { what: "event", pid })?;

        let (epochs, events) = (&self.epochs, &self.events);
        let epoch = epochs.get(ep_idx);
        let pos = epoch
            .events
            .iter()
            .rposition(|&e| events.get(e).pulse_id() < pid)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.epochs.get_mut(ep_idx).events.insert(pos, idx);
        self.event_lut[slot] = Some((pid, idx));
        Ok(())
    }

    /// Delivers every due event from the head of the pending list, stopping
    /// at the first incomplete one.  No event is ever delivered before an
    /// older one.
    fn try_flush(&mut self) {
        let mut flushed = false;

        'pending: while let Some(&ep_idx) = self.pending.front() {
            while let Some(&ev_idx) = self.epochs.get(ep_idx).events.front() {
                if !self.events.get(ev_idx).is_complete() {
                    break 'pending;
                }
                self.epochs.get_mut(ep_idx).events.pop_front();
                self.retire(ev_idx);
                flushed = true;
            }
            // Drained; discard the epoch at the head.
            self.pending.pop_front();
            let epoch = self.epochs.free(ep_idx);
            let slot = self.ep_index(epoch.key);
            if matches!(self.epoch_lut[slot], Some((key, idx)) if key == epoch.key && idx == ep_idx)
            {
                self.epoch_lut[slot] = None;
            }
        }

        if flushed {
            self.t_last_flush = self.time.now();
        }
    }

    fn retire(&mut self, ev_idx: u32) {
        let ev = self.events.free(ev_idx);
        let slot = self.ev_index(ev.pulse_id());
        self.event_lut[slot] = None;
        self.last_flushed = Some(ev.pulse_id());
        self.sink.process(&ev);
    }

    /// Times out stuck events.  Called when input is idle.
    ///
    /// Anchors on the oldest incomplete event past the timeout and fixes it
    /// up along with any incomplete events in front of it: ordering forbids
    /// delivering the due event over those, but anything newer keeps its
    /// full timeout and may still complete cleanly.
    pub fn expired(&mut self) {
        let now = self.time.now();

        let mut due: Option<PulseId> = None;
        'aged: for &ep_idx in &self.pending {
            for &ev_idx in &self.epochs.get(ep_idx).events {
                let ev = self.events.get(ev_idx);
                if !ev.is_complete()
                    && now.saturating_duration_since(ev.arrival()) >= self.event_timeout
                {
                    due = Some(ev.pulse_id());
                    break 'aged;
                }
            }
        }

        if let Some(due) = due {
            let mut to_fix = Vec::new();
            'scan: for &ep_idx in &self.pending {
                for &ev_idx in &self.epochs.get(ep_idx).events {
                    let ev = self.events.get(ev_idx);
                    if ev.pulse_id() > due {
                        break 'scan;
                    }
                    if !ev.is_complete() {
                        to_fix.push(ev_idx);
                    }
                }
            }
            for ev_idx in to_fix {
                self.fixup_event(ev_idx);
            }
            self.try_flush();
        }

        self.age = self
            .pending
            .front()
            .and_then(|&ep| self.epochs.get(ep).events.front().copied())
            .map(|ev_idx| now.saturating_duration_since(self.events.get(ev_idx).arrival()))
            .unwrap_or(Duration::ZERO);
    }

    fn fixup_event(&mut self, ev_idx: u32) {
        let Self { events, sink, .. } = self;
        let ev = events.get_mut(ev_idx);
        let missing = ev.remaining();
        debug!(pid = %ev.pulse_id(), missing = format_args!("{missing:#x}"), "fixing up event");

        ev.mark_dropped();
        let mut bits = missing;
        while bits != 0 {
            let src = SrcId(bits.trailing_zeros() as u8);
            bits &= bits - 1;
            sink.fixup(ev, src);
        }
        ev.clear_remaining();

        self.missing = missing;
        self.timeouts += 1;
        self.fixups += 1;
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            epoch_allocs: self.epochs.allocs(),
            epoch_frees: self.epochs.frees(),
            event_allocs: self.events.allocs(),
            event_frees: self.events.frees(),
            event_occupancy: self.events.in_use() as u64,
            event_pool_depth: self.events.capacity() as u64,
            timeouts: self.timeouts,
            fixups: self.fixups,
            late_arrivals: self.late_arrivals,
            missing: self.missing,
            age: self.age,
        }
    }

    pub fn reset_counters(&mut self) {
        self.epochs.reset_counters();
        self.events.reset_counters();
        self.timeouts = 0;
        self.fixups = 0;
        self.late_arrivals = 0;
        self.missing = 0;
        self.age = Duration::ZERO;
    }

    /// Logs what is still in flight.
    pub fn dump(&self) {
        info!(
            epochs = self.pending.len(),
            events = self.events.in_use(),
            last_flushed = self.last_flushed.map(|p| p.0),
            "event builder state"
        );
        for &ep_idx in &self.pending {
            let epoch = self.epochs.get(ep_idx);
            for &ev_idx in &epoch.events {
                let ev = self.events.get(ev_idx);
                debug!(
                    key = format_args!("{:014x}", epoch.key),
                    pid = %ev.pulse_id(),
                    remaining = format_args!("{:#x}", ev.remaining()),
                    "pending event"
                );
            }
        }
    }

    /// Discards all pending state between runs without delivering anything.
    pub fn clear(&mut self) {
        let dropped = self.events.in_use();
        if dropped > 0 {
            info!(events = dropped, "discarding undelivered events");
        }
        while let Some(ep_idx) = self.pending.pop_front() {
            let epoch = self.epochs.free(ep_idx);
            for ev_idx in epoch.events {
                self.events.free(ev_idx);
            }
        }
        self.epoch_lut.fill(None);
        self.event_lut.fill(None);
        self.last_flushed = None;
        self.t_last_flush = self.time.now();
        self.age = Duration::ZERO;
    }
}
