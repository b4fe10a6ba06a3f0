//! Contributor-side dispatcher and result matcher.
//!
//! The dispatcher consumes the local fragment stream in pulse order,
//! accumulates fragments into the current batch, closes the batch when its
//! window expires or a non-batchable transition arrives, posts it to the
//! builder selected by the pulse id, and records it on the pending queue.
//! Transitions are additionally forwarded to every other builder through the
//! transition-buffer credit protocol so those builders stay synchronized.
//!
//! The matcher runs on its own thread, pending on the result completion
//! stream, pairing each result batch with the head of the pending queue and
//! releasing the batch slot it answered.

use crate::batch::{BatchHandle, BatchManager};
use crate::config::ContributorParams;
use crate::error::{DispatchError, LinkError, TransportError};
use crate::link::{sort_links, Link};
use crate::pending::{PendingEntry, PendingKind, PendingRx, PendingTx};
use crate::transport::{CompletionQueue, LinkTransport, SharedRegion};
use evb_proto::{DgramHeader, ImmData, ImmKind, PulseId, Service, SrcId, HEADER_SIZE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Monotonic dispatcher bookkeeping, by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    /// Fragments handled.
    pub events: u64,
    /// Batches posted.
    pub batches: u64,
}

#[derive(Debug, Clone, Copy)]
struct OpenBatch {
    index: usize,
    start_pid: PulseId,
    /// Region offset of the first fragment; the batch is posted from here,
    /// not from the slot base, since a window can be partially occupied.
    start_offset: usize,
    /// Region offset of the most recent fragment, the batch end.
    last_offset: usize,
}

pub struct Contributor<T> {
    prms: ContributorParams,
    batman: BatchManager,
    /// Builder links in destination order (sorted by peer id).
    links: Vec<Link<T>>,
    /// Per-builder free transition-slot indices.
    tr_credits: Vec<VecDeque<u32>>,
    pending: PendingTx,
    open: Option<OpenBatch>,
    contractor: u16,
    previous_pid: Option<PulseId>,
    event_count: u64,
    batch_count: u64,
}

/// Bootstraps one poster link per builder endpoint and re-indexes them by the
/// builders' announced identifiers.
pub fn connect_builders<T: LinkTransport>(
    endpoints: Vec<T>,
    my_id: SrcId,
    region_size: usize,
) -> Result<Vec<Link<T>>, LinkError> {
    let count = endpoints.len();
    let mut links = Vec::with_capacity(count);
    for ep in endpoints {
        links.push(Link::poster(ep, my_id, region_size)?);
    }
    sort_links(links, count)
}

impl<T: LinkTransport> Contributor<T> {
    pub fn new(
        prms: ContributorParams,
        batman: BatchManager,
        links: Vec<Link<T>>,
        pending: PendingTx,
    ) -> Contributor<T> {
        let tr_credits = links
            .iter()
            .map(|_| (0..prms.max_tr_buffers as u32).collect())
            .collect();
        Contributor {
            prms,
            batman,
            links,
            tr_credits,
            pending,
            open: None,
            contractor: 0,
            previous_pid: None,
            event_count: 0,
            batch_count: 0,
        }
    }

    pub fn batch_manager(&self) -> &BatchManager {
        &self.batman
    }

    /// Reserves the batch slot for the next fragment, enforcing pulse-id
    /// monotonicity, and stores the caller's token.  Returns the region
    /// offset to copy the fragment into, or None during teardown.
    pub fn allocate(
        &mut self,
        header: &DgramHeader,
        app_prm: u64,
    ) -> Result<Option<usize>, DispatchError> {
        let pid = header.pulse_id();
        if let Some(prev) = self.previous_pid {
            if pid <= prev {
                error!(prev = %prev, cur = %pid, "pulse id did not advance");
                return Err(DispatchError::NonMonotonicPulseId { prev, cur: pid });
            }
        }
        self.previous_pid = Some(pid);

        let Some(idx) = self.batman.fetch_wait(pid) else {
            return Ok(None); // Terminating
        };

        self.event_count += 1;
        self.batman.store(pid, app_prm);
        let offset = self.batman.allocate(idx)?;
        Ok(Some(offset))
    }

    /// Copies a fragment into the slot returned by [`allocate`].
    ///
    /// [`allocate`]: Contributor::allocate
    pub fn write_fragment(
        &self,
        offset: usize,
        header: &DgramHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.batman.write_fragment(offset, header, payload)
    }

    /// Decides the fragment's fate: extend the open batch, close and post it,
    /// bypass the builders, and/or forward a transition.
    pub fn process(
        &mut self,
        header: &DgramHeader,
        offset: usize,
        payload_len: usize,
    ) -> Result<(), DispatchError> {
        let pid = header.pulse_id();
        let groups = header.readout_groups();
        let svc = header.service().expect("locally produced service is valid");

        if groups & (1 << self.prms.partition) != 0 {
            // Common readout group triggered
            if self.open.is_none() {
                self.open = Some(OpenBatch {
                    index: self.batman.batch_index(pid),
                    start_pid: pid,
                    start_offset: offset,
                    last_offset: offset,
                });
                self.contractor = groups & self.prms.contractor;
            }

            let open = self.open.expect("batch is open");
            let expired = self.batman.expired(pid, open.start_pid);
            let flush = !svc.is_batchable() || !self.prms.batching;

            if !(expired || flush) {
                // Most frequent case when batching
                let open = self.open.as_mut().expect("batch is open");
                open.last_offset = offset;
                self.contractor |= groups & self.prms.contractor;
            } else {
                if expired {
                    // Never true when not batching
                    if self.contractor != 0 {
                        self.post_open()?;
                    }
                    // Start a new batch with the fragment that expired it
                    self.open = Some(OpenBatch {
                        index: self.batman.batch_index(pid),
                        start_pid: pid,
                        start_offset: offset,
                        last_offset: offset,
                    });
                    self.contractor = groups & self.prms.contractor;
                }

                if flush {
                    // Post the batch together with the transition
                    self.contractor |= groups & self.prms.contractor;
                    if let Some(open) = self.open.as_mut() {
                        open.last_offset = offset;
                    }
                    if self.contractor != 0 {
                        self.post_open()?;
                    }
                    self.open = None;
                }
            }
        } else {
            // Common readout group did not trigger: bypass the builders
            if self.open.is_some() && self.contractor != 0 {
                self.post_open()?;
            }
            self.open = None;

            self.batman.mark_eol(offset)?;
            self.pending.push(PendingEntry {
                start_pid: pid,
                index: self.batman.batch_index(pid),
                offset,
                kind: PendingKind::Bypass,
            })?;
        }

        // Keep non-selected builders synchronized by forwarding transitions.
        // In particular, Disable flushes out whatever result batch they have
        // in progress.
        if !svc.is_event() && self.contractor != 0 {
            self.forward_transition(header, payload_len)?;
        }

        Ok(())
    }

    fn post_open(&mut self) -> Result<(), DispatchError> {
        let open = self.open.expect("posting requires an open batch");
        let idx = open.index;
        let start_entry = (open.start_offset / self.prms.max_input_size) as u32;
        let dst = (idx / self.prms.max_entries) % self.links.len();

        // Terminate before publishing: the receiver must never walk past the
        // batch end, and the entry must be queued before any result can
        // answer it.
        self.batman.mark_eol(open.last_offset)?;
        self.pending.push(PendingEntry {
            start_pid: open.start_pid,
            index: idx,
            offset: open.start_offset,
            kind: PendingKind::Posted { dst },
        })?;
        self.batman.seal(idx);

        let extent = open.last_offset + self.prms.max_input_size - open.start_offset;
        let mut buf = vec![0u8; extent];
        self.batman.region().read_at(open.start_offset, &mut buf)?;

        let imm = ImmData::buffer(SrcId(self.prms.id), start_entry);
        let remote_offset = start_entry as usize * self.prms.max_input_size;
        debug!(
            batch = self.batch_count,
            idx,
            pid = %open.start_pid,
            extent,
            dst,
            "posting batch"
        );
        self.links[dst].post(&buf, remote_offset, imm)?;

        self.batch_count += 1;
        Ok(())
    }

    /// Sends a transition to every builder except the one whose batch
    /// already contains it.  These builders do not generate responses.
    fn forward_transition(
        &mut self,
        header: &DgramHeader,
        payload_len: usize,
    ) -> Result<(), DispatchError> {
        if self.links.len() < 2 {
            return Ok(());
        }

        let svc = header.service().expect("locally produced service is valid");
        if payload_len != 0 {
            error!(service = %svc, size = payload_len, "transition has unexpected payload");
            return Err(DispatchError::UnexpectedPayload {
                service: svc,
                size: payload_len,
            });
        }

        let pid = header.pulse_id();
        let dst = (self.batman.batch_index(pid) / self.prms.max_entries) % self.links.len();

        let mut fwd = *header;
        fwd.set_eol(); // A "batch" of one entry
        let mut bytes = [0u8; HEADER_SIZE];
        fwd.write_to(&mut bytes);

        for pos in 0..self.links.len() {
            if pos == dst {
                continue; // Skip the one that got the batch
            }
            let idx = self.next_tr_buf(pos, svc)?;
            let offset = self.batman.region_size() + idx as usize * self.prms.max_tr_size;
            let imm = ImmData::transition(SrcId(self.prms.id), idx);
            if svc != Service::SlowUpdate {
                info!(service = %svc, pid = %pid, dst = %self.links[pos].id(), idx, "forwarding transition");
            } else {
                debug!(service = %svc, pid = %pid, dst = %self.links[pos].id(), idx, "forwarding transition");
            }
            self.links[pos].post(&bytes, offset, imm)?;
        }
        Ok(())
    }

    /// Pops a free transition-slot index for the builder at `pos`, draining
    /// any replenishments first and waiting a bounded time if none are on
    /// hand.
    fn next_tr_buf(&mut self, pos: usize, svc: Service) -> Result<u32, DispatchError> {
        let link = &mut self.links[pos];
        while let Some(imm) = link.poll() {
            self.tr_credits[pos].push_back(imm.idx());
        }

        if let Some(idx) = self.tr_credits[pos].pop_front() {
            return Ok(idx);
        }

        match link.poll_wait(Duration::from_millis(self.prms.credit_wait_ms)) {
            Ok(imm) => Ok(imm.idx()),
            Err(_) => {
                let dst = link.id();
                error!(dst = %dst, service = %svc, "no transition buffer credit");
                Err(DispatchError::NoTransitionBuffer { dst, service: svc })
            }
        }
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            events: self.event_count,
            batches: self.batch_count,
        }
    }

    pub fn reset_counters(&mut self) {
        self.event_count = 0;
        self.batch_count = 0;
    }

    /// Unblocks the dispatcher and result receiver for teardown.
    pub fn stop(&self) {
        self.batman.stop();
    }
}

/// One delivered result, complete with the token stored when its fragment
/// was dispatched.
#[derive(Debug, Clone, Copy)]
pub struct ResultRecord {
    pub pulse_id: PulseId,
    pub header: DgramHeader,
    pub token: u64,
    /// True for fragments that never went to a builder.
    pub bypass: bool,
}

/// Matches result batches against the pending queue.
pub struct Receiver<Q> {
    cq: Q,
    result_region: SharedRegion,
    batch_region: SharedRegion,
    max_result_size: usize,
    pending: PendingRx,
    batches: BatchHandle,
    front: Option<PendingEntry>,
}

impl<Q: CompletionQueue> Receiver<Q> {
    pub fn new(
        cq: Q,
        result_region: SharedRegion,
        batch_region: SharedRegion,
        max_result_size: usize,
        pending: PendingRx,
        batches: BatchHandle,
    ) -> Receiver<Q> {
        Receiver {
            cq,
            result_region,
            batch_region,
            max_result_size,
            pending,
            batches,
            front: None,
        }
    }

    fn peek(&mut self) -> Option<&PendingEntry> {
        if self.front.is_none() {
            self.front = self.pending.try_pop();
        }
        self.front.as_ref()
    }

    fn take(&mut self) -> Option<PendingEntry> {
        self.front.take().or_else(|| self.pending.try_pop())
    }

    fn deliver_bypass<F: FnMut(ResultRecord)>(
        &mut self,
        entry: PendingEntry,
        deliver: &mut F,
    ) -> Result<(), TransportError> {
        let header = self.batch_region.read_header(entry.offset)?;
        deliver(ResultRecord {
            pulse_id: entry.start_pid,
            header,
            token: self.batches.retrieve(entry.start_pid),
            bypass: true,
        });
        Ok(())
    }

    /// Waits up to `tmo` for one result batch and matches it up.
    /// Ok(false) means the wait timed out.
    pub fn process_one<F: FnMut(ResultRecord)>(
        &mut self,
        tmo: Duration,
        deliver: &mut F,
    ) -> Result<bool, TransportError> {
        let imm = match self.cq.pend(tmo) {
            Ok(imm) => imm,
            Err(TransportError::Timeout) => return Ok(false),
            Err(e) => return Err(e),
        };
        if imm.kind() != ImmKind::Buffer {
            warn!(raw = imm.raw(), "unexpected immediate on result stream");
            return Ok(true);
        }

        let mut offset = imm.idx() as usize * self.max_result_size;
        let first = self.result_region.read_header(offset)?;

        // Fragments that bypassed the builders are delivered once results
        // catch up to them, preserving order.
        while let Some(entry) = self.peek() {
            if entry.kind == PendingKind::Bypass && entry.start_pid < first.pulse_id() {
                let entry = self.take().expect("peeked entry");
                self.deliver_bypass(entry, deliver)?;
            } else {
                break;
            }
        }

        loop {
            let header = self.result_region.read_header(offset)?;
            let pid = header.pulse_id();
            deliver(ResultRecord {
                pulse_id: pid,
                header,
                token: self.batches.retrieve(pid),
                bypass: false,
            });

            if header.is_eol() {
                match self.take() {
                    Some(entry) if matches!(entry.kind, PendingKind::Posted { .. }) => {
                        if entry.start_pid != first.pulse_id() {
                            warn!(
                                expected = %entry.start_pid,
                                got = %first.pulse_id(),
                                "result batch does not match pending head"
                            );
                        }
                        self.batches.release(entry.start_pid);
                    }
                    _ => warn!(pid = %pid, "result batch without matching pending entry"),
                }
                break;
            }
            offset += self.max_result_size;
        }
        Ok(true)
    }

    /// Pends until `running` clears, then drains what it can.
    pub fn run<F: FnMut(ResultRecord)>(
        &mut self,
        running: &AtomicBool,
        deliver: &mut F,
    ) -> Result<(), TransportError> {
        const TMO: Duration = Duration::from_millis(100);
        while running.load(Ordering::Acquire) {
            match self.process_one(TMO, deliver) {
                Ok(_) => {}
                Err(TransportError::Disconnected) => break,
                Err(e) => return Err(e),
            }
        }
        // Leftover bypass entries need no results; deliver them on the way
        // out.
        while let Some(entry) = self.take() {
            if entry.kind == PendingKind::Bypass {
                self.deliver_bypass(entry, deliver)?;
            }
        }
        Ok(())
    }
}
