//! Deterministic in-memory transport for exercising the pipeline without a
//! fabric: paired endpoints with reliable ordered message queues, shared
//! regions standing in for pinned memory, and immediate streams that can be
//! routed either to a per-link queue or to a shared completion queue.

use crate::builder::ContractTable;
use crate::engine::{Event, EventSink};
use crate::error::TransportError;
use crate::transport::{CompletionQueue, LinkTransport, RemoteRegion, SharedRegion};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use evb_proto::{Damage, DgramHeader, ImmData, PulseId, SrcId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type RegionSlot = Arc<Mutex<Option<SharedRegion>>>;

/// One end of a simulated reliable link.
#[derive(Debug)]
pub struct MemEndpoint {
    sync_tx: Sender<Vec<u8>>,
    sync_rx: Receiver<Vec<u8>>,
    /// Immediates we emit land either in the peer's per-link queue or in its
    /// shared completion queue.
    imm_tx: Sender<u64>,
    /// Our own per-link immediate queue.
    imm_rx: Receiver<u64>,
    /// Region the peer has exposed for our one-sided writes.
    peer_region: RegionSlot,
    /// Slot we publish our own region into.
    local_region: RegionSlot,
}

/// A completion stream shared by every link terminating at one endpoint.
pub struct MemCompletionQueue {
    tx: Sender<u64>,
    rx: Receiver<u64>,
}

impl MemCompletionQueue {
    pub fn new() -> MemCompletionQueue {
        let (tx, rx) = unbounded();
        MemCompletionQueue { tx, rx }
    }

    fn sender(&self) -> Sender<u64> {
        self.tx.clone()
    }
}

impl Default for MemCompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue for MemCompletionQueue {
    fn pend(&mut self, tmo: Duration) -> Result<ImmData, TransportError> {
        match self.rx.recv_timeout(tmo) {
            Ok(imm) => Ok(ImmData::from_u64(imm)),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

impl MemEndpoint {
    /// A symmetric pair; each side's immediates land in the other's
    /// per-link queue.
    pub fn pair() -> (MemEndpoint, MemEndpoint) {
        Self::build(None)
    }

    /// A pair whose pender side aggregates immediates into `cq` (the usual
    /// arrangement for a builder's input links or a contributor's result
    /// link).  Returns `(poster_side, pender_side)`.
    pub fn pair_with_cq(cq: &MemCompletionQueue) -> (MemEndpoint, MemEndpoint) {
        Self::build(Some(cq.sender()))
    }

    fn build(pender_cq: Option<Sender<u64>>) -> (MemEndpoint, MemEndpoint) {
        let (a_sync_tx, b_sync_rx) = unbounded();
        let (b_sync_tx, a_sync_rx) = unbounded();
        let (a_imm_tx, b_imm_rx) = unbounded();
        let (b_imm_tx, a_imm_rx) = unbounded();

        let a_region: RegionSlot = Arc::new(Mutex::new(None));
        let b_region: RegionSlot = Arc::new(Mutex::new(None));

        let poster = MemEndpoint {
            sync_tx: a_sync_tx,
            sync_rx: a_sync_rx,
            // Writes from the poster notify the pender's completion stream.
            imm_tx: pender_cq.unwrap_or(a_imm_tx),
            imm_rx: a_imm_rx,
            peer_region: Arc::clone(&b_region),
            local_region: a_region.clone(),
        };
        let pender = MemEndpoint {
            sync_tx: b_sync_tx,
            sync_rx: b_sync_rx,
            imm_tx: b_imm_tx,
            imm_rx: b_imm_rx,
            peer_region: a_region,
            local_region: b_region,
        };
        (poster, pender)
    }
}

/// What a [`RecordingSink`] saw for one delivered event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub pulse_id: PulseId,
    pub contract: u64,
    pub damage: Damage,
    pub size: usize,
    pub srcs: Vec<SrcId>,
    pub prms: Vec<u64>,
}

/// An [`EventSink`] that resolves contracts from a table and records every
/// delivery and fixup for later inspection.
#[derive(Debug)]
pub struct RecordingSink {
    pub contracts: ContractTable,
    pub events: Vec<RecordedEvent>,
    pub fixups: Vec<(PulseId, SrcId)>,
}

impl RecordingSink {
    pub fn new(contracts: ContractTable) -> RecordingSink {
        RecordingSink {
            contracts,
            events: Vec::new(),
            fixups: Vec::new(),
        }
    }
}

impl EventSink for RecordingSink {
    fn contract(&self, header: &DgramHeader) -> u64 {
        self.contracts.contract_for(header)
    }

    fn process(&mut self, event: &Event) {
        self.events.push(RecordedEvent {
            pulse_id: event.pulse_id(),
            contract: event.contract(),
            damage: event.damage(),
            size: event.size(),
            srcs: event.contributions().iter().map(|c| c.src).collect(),
            prms: event.contributions().iter().map(|c| c.prm).collect(),
        });
    }

    fn fixup(&mut self, event: &mut Event, src: SrcId) {
        self.fixups.push((event.pulse_id(), src));
    }
}

impl LinkTransport for MemEndpoint {
    fn send_sync(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.sync_tx
            .send(buf.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv_sync(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let msg = self
            .sync_rx
            .recv()
            .map_err(|_| TransportError::Disconnected)?;
        if msg.len() != buf.len() {
            return Err(TransportError::Failed(format!(
                "expected {} bytes, peer sent {}",
                buf.len(),
                msg.len()
            )));
        }
        buf.copy_from_slice(&msg);
        Ok(())
    }

    fn register_region(&mut self, region: &SharedRegion) -> Result<(), TransportError> {
        *self.local_region.lock() = Some(region.clone());
        Ok(())
    }

    fn write_data(
        &mut self,
        buf: &[u8],
        remote: &RemoteRegion,
        offset: usize,
        imm: ImmData,
    ) -> Result<(), TransportError> {
        {
            let guard = self.peer_region.lock();
            let region = guard
                .as_ref()
                .ok_or_else(|| TransportError::Failed("peer has no registered region".into()))?;
            if region.rkey() != remote.rkey {
                return Err(TransportError::Failed(format!(
                    "rkey {} does not match registered region {}",
                    remote.rkey,
                    region.rkey()
                )));
            }
            region.write_at(offset, buf)?;
        }
        self.imm_tx
            .send(imm.as_u64())
            .map_err(|_| TransportError::Disconnected)
    }

    fn inject(&mut self, imm: ImmData) -> Result<(), TransportError> {
        self.imm_tx
            .send(imm.as_u64())
            .map_err(|_| TransportError::Disconnected)
    }

    fn poll(&mut self) -> Option<ImmData> {
        self.imm_rx.try_recv().ok().map(ImmData::from_u64)
    }

    fn poll_wait(&mut self, tmo: Duration) -> Result<ImmData, TransportError> {
        match self.imm_rx.recv_timeout(tmo) {
            Ok(imm) => Ok(ImmData::from_u64(imm)),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}
