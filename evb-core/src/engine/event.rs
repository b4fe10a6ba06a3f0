use evb_proto::{Damage, DgramHeader, PulseId, SrcId};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::Instant;

/// One received fragment of an event: the header fields the core read, plus
/// the opaque parameter the caller associated with it (typically the raw
/// immediate data locating the payload in its region).
#[derive(Debug, Clone)]
pub struct Contribution {
    pub src: SrcId,
    pub header: DgramHeader,
    pub prm: u64,
}

/// The reassembly record for one pulse identifier.
///
/// Holds the contract fixed when the first fragment arrived, the
/// contributors still outstanding, and the fragments received so far in
/// contributor order.  Invariant: `remaining ⊆ contract`, and the received
/// set is exactly `contract \ remaining`.
#[derive(Debug)]
pub struct Event {
    pulse_id: PulseId,
    contract: u64,
    remaining: u64,
    damage: Damage,
    arrival: Instant,
    size: usize,
    creator_src: SrcId,
    contribs: SmallVec<[Contribution; 8]>,
}

impl Event {
    pub(crate) fn new(
        header: &DgramHeader,
        prm: u64,
        contract: u64,
        arrival: Instant,
        buf_size: usize,
    ) -> Event {
        let src = header.src();
        let mut contribs = SmallVec::new();
        contribs.push(Contribution {
            src,
            header: *header,
            prm,
        });
        Event {
            pulse_id: header.pulse_id(),
            contract,
            remaining: contract & !src.bit(),
            damage: header.damage(),
            arrival,
            size: buf_size,
            creator_src: src,
            contribs,
        }
    }

    /// Folds another fragment into the event.
    pub(crate) fn add(&mut self, header: &DgramHeader, prm: u64, buf_size: usize) {
        let src = header.src();
        let pos = self
            .contribs
            .iter()
            .position(|c| c.src > src)
            .unwrap_or(self.contribs.len());
        self.contribs.insert(
            pos,
            Contribution {
                src,
                header: *header,
                prm,
            },
        );
        self.remaining &= !src.bit();
        self.damage |= header.damage();
        self.size += buf_size;
    }

    pub fn pulse_id(&self) -> PulseId {
        self.pulse_id
    }

    pub fn contract(&self) -> u64 {
        self.contract
    }

    /// Contributors expected but not yet seen.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn damage(&self) -> Damage {
        self.damage
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// Sum of the buffer sizes of the received fragments.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Received fragments, ordered by contributor.
    pub fn contributions(&self) -> &[Contribution] {
        &self.contribs
    }

    pub fn contribution(&self, src: SrcId) -> Option<&Contribution> {
        self.contribs.iter().find(|c| c.src == src)
    }

    /// The first fragment received, which fixed the contract.
    pub fn creator(&self) -> &Contribution {
        self.contribution(self.creator_src)
            .expect("creator contribution present")
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.damage |= Damage::DROPPED_CONTRIBUTION;
    }

    pub(crate) fn clear_remaining(&mut self) {
        self.remaining = 0;
    }
}

/// A group of events sharing the masked high bits of their pulse ids, queued
/// oldest-first in the engine's pending list.
#[derive(Debug)]
pub(crate) struct Epoch {
    pub key: u64,
    /// Event pool indices in ascending pulse order.
    pub events: VecDeque<u32>,
}

impl Epoch {
    pub fn new(key: u64) -> Epoch {
        Epoch {
            key,
            events: VecDeque::new(),
        }
    }
}
