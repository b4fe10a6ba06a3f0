//! Builder-side input frontend.
//!
//! Owns one pre-registered input region per contributor, carved into an
//! event-buffer zone and a transition zone.  Pends on the shared completion
//! stream, locates each deposited batch from its immediate data, walks the
//! batch to its EOL fragment, and feeds every fragment to the event-builder
//! engine.  A timeout on the stream is the idle signal that drives the
//! engine's fixup scan.

use crate::config::BuilderParams;
use crate::engine::{EventBuilder, EventSink};
use crate::error::{BuilderError, LinkError, SetupError, TransportError};
use crate::link::Link;
use crate::time::TimeProvider;
use crate::transport::{CompletionQueue, LinkTransport, SharedRegion};
use evb_proto::constants::NUM_READOUT_GROUPS;
use evb_proto::{DgramHeader, ImmData, ImmKind, Service, SrcId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Expected contributors per readout group.  The effective contract for an
/// event is the OR of the entries selected by its readout-group bitmap,
/// which the first fragment of the event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractTable {
    table: [u64; NUM_READOUT_GROUPS],
}

impl ContractTable {
    pub fn new(table: [u64; NUM_READOUT_GROUPS]) -> ContractTable {
        ContractTable { table }
    }

    pub fn contract_for(&self, header: &DgramHeader) -> u64 {
        let mut contract = 0;
        let mut groups = header.readout_groups();
        while groups != 0 {
            let group = groups.trailing_zeros() as usize;
            groups &= groups - 1;
            contract |= self.table[group];
        }
        contract
    }

    /// Removes a dead contributor from every group so subsequent events stop
    /// waiting for it.
    pub fn trim(&mut self, src: SrcId) {
        for entry in &mut self.table {
            *entry &= !src.bit();
        }
    }
}

pub struct Builder<S, T, Q> {
    prms: BuilderParams,
    engine: EventBuilder<S>,
    links: Vec<Link<T>>,
    regions: Vec<SharedRegion>,
    buf_reg_size: Vec<usize>,
    max_buf_size: Vec<usize>,
    cq: Q,
    buffer_cnt: u64,
}

impl<S: EventSink, T: LinkTransport, Q: CompletionQueue> Builder<S, T, Q> {
    /// Bootstraps one pender link per contributor endpoint, sizing each
    /// input region from the size its contributor announced, and re-indexes
    /// everything by contributor id.
    pub fn configure(
        prms: BuilderParams,
        endpoints: Vec<T>,
        cq: Q,
        time: Arc<dyn TimeProvider>,
        sink: S,
    ) -> Result<Builder<S, T, Q>, SetupError> {
        prms.validate()?;

        let count = endpoints.len();
        let mut slots: Vec<Option<(Link<T>, SharedRegion, usize)>> = Vec::with_capacity(count);
        slots.resize_with(count, || None);

        for ep in endpoints {
            let pending = Link::pender(ep, SrcId(prms.id))?;
            let announced = pending.announced_size();
            let per_buf = prms.max_ev_buffers * prms.max_entries;
            if announced % per_buf != 0 {
                return Err(LinkError::SizeMismatch {
                    announced,
                    allocated: per_buf,
                }
                .into());
            }

            // Event buffers first, transition slots after them.
            let region = SharedRegion::new(announced + prms.max_tr_buffers * prms.max_tr_size);
            let link = pending.expose(&region)?;

            let id = link.id().0 as usize;
            if id >= count || slots[id].is_some() {
                return Err(LinkError::BadPeerId(id as u32).into());
            }
            info!(src = id, announced, "inbound link configured");
            slots[id] = Some((link, region, announced));
        }

        let mut links = Vec::with_capacity(count);
        let mut regions = Vec::with_capacity(count);
        let mut buf_reg_size = Vec::with_capacity(count);
        let mut max_buf_size = Vec::with_capacity(count);
        for (id, slot) in slots.into_iter().enumerate() {
            let (link, region, announced) =
                slot.ok_or(SetupError::Link(LinkError::BadPeerId(id as u32)))?;
            links.push(link);
            regions.push(region);
            buf_reg_size.push(announced);
            max_buf_size.push(announced / (prms.max_ev_buffers * prms.max_entries));
        }

        let engine = EventBuilder::with_params(&prms, time, sink);
        Ok(Builder {
            prms,
            engine,
            links,
            regions,
            buf_reg_size,
            max_buf_size,
            cq,
            buffer_cnt: 0,
        })
    }

    pub fn engine(&self) -> &EventBuilder<S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut EventBuilder<S> {
        &mut self.engine
    }

    pub fn buffer_count(&self) -> u64 {
        self.buffer_cnt
    }

    /// Pends for one deposit and feeds its fragments to the engine.
    /// A timeout instead runs the engine's fixup scan and returns Ok(false).
    pub fn process(&mut self, tmo: Duration) -> Result<bool, BuilderError> {
        let imm = match self.cq.pend(tmo) {
            Ok(imm) => imm,
            Err(TransportError::Timeout) => {
                // Contributions have ceased flowing; time out stuck events.
                self.engine.expired();
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        self.buffer_cnt += 1;

        let src = imm.src().0 as usize;
        let (mut offset, stride) = match imm.kind() {
            ImmKind::Buffer => (
                imm.idx() as usize * self.max_buf_size[src],
                self.max_buf_size[src],
            ),
            ImmKind::Transition => (
                self.buf_reg_size[src] + imm.idx() as usize * self.prms.max_tr_size,
                self.prms.max_tr_size,
            ),
        };

        loop {
            let header = self.regions[src].read_header(offset)?;

            if header.src() != imm.src() {
                warn!(link = src, dgram = %header.src(), "link src != dgram src");
            }
            match header.service() {
                Some(Service::L1Accept) => {}
                Some(svc @ Service::SlowUpdate) => {
                    debug!(service = %svc, pid = %header.pulse_id(), src, "saw transition");
                }
                Some(svc) => {
                    info!(service = %svc, pid = %header.pulse_id(), src, "saw transition");
                }
                None => {
                    warn!(src, control = header.control(), "dropping fragment with bad service");
                    if header.is_eol() {
                        break;
                    }
                    offset += stride;
                    continue;
                }
            }

            self.engine
                .process(&header, self.max_buf_size[src], imm.as_u64())?;

            if header.is_eol() {
                break;
            }
            offset += stride;
        }

        Ok(true)
    }

    /// Hands a consumed transition slot back to its contributor as a credit.
    pub fn return_transition_buffer(
        &mut self,
        src: SrcId,
        idx: u32,
    ) -> Result<(), TransportError> {
        let imm = ImmData::credit(SrcId(self.prms.id), idx);
        debug!(src = %src, idx, "returning transition buffer");
        self.links[src.0 as usize].inject(imm)
    }

    /// Dumps and discards whatever the engine still holds, between runs.
    pub fn unconfigure(&mut self) {
        self.engine.dump();
        self.engine.clear();
    }
}
