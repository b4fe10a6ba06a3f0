//! # evb-proto
//!
//! Wire-level vocabulary for the pulse-resolved event-building pipeline.
//!
//! Both sides of every link, contributors producing fragments and builders
//! reassembling them into events, share this crate: the pulse and source
//! identifiers that key everything, the bit-exact datagram header, the
//! transition (service) ids, the damage bitmap, the immediate-data encoding
//! carried alongside one-sided writes, and the protocol constants.
//!
//! The header layout is fixed by the detector side and must not change shape;
//! everything here is plain data with no I/O.

pub mod constants;
pub mod dgram;
pub mod imm;
pub mod pulse;
pub mod service;

pub use dgram::{Damage, DgramHeader, HEADER_SIZE};
pub use imm::{ImmData, ImmKind};
pub use pulse::{PulseId, SrcId};
pub use service::Service;
