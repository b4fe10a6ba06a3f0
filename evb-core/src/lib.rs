//! # evb-core
//!
//! The event-building pipeline for a pulse-resolved data-acquisition
//! facility: contributors stream timestamped fragments, builders gather the
//! fragments of each pulse from every expected contributor, and complete
//! events flow downstream in pulse order with bounded latency even when
//! contributors are missing, late, or dead.
//!
//! ## Architecture
//!
//! - **Engine** ([`engine`]): a bounded, keyed reassembly buffer grouping
//!   in-flight fragments by pulse identifier into epochs and events,
//!   flushing complete events in order and fixing up stuck ones after a
//!   timeout.
//! - **Batching** ([`batch`], [`pending`], [`dispatch`]): the contributor
//!   side partitions its fragment stream into pulse-window batches, posts
//!   each to one builder chosen from the pulse id, and matches results back
//!   through a bounded pending queue.
//! - **Links** ([`link`], [`transport`]): a small bootstrap handshake
//!   exchanges peer ids and remote-memory descriptors so fragments and
//!   batches are deposited directly into pre-registered buffers.
//!
//! All state is in memory, per run; the wire transport itself lives outside
//! this crate.

pub mod batch;
pub mod bitset;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod link;
pub mod pending;
pub mod testing;
pub mod time;
pub mod transport;

pub use batch::{BatchCounters, BatchHandle, BatchManager};
pub use builder::{Builder, ContractTable};
pub use config::{BuilderParams, ContributorParams};
pub use dispatch::{connect_builders, Contributor, DispatchCounters, Receiver, ResultRecord};
pub use engine::{Contribution, EngineCounters, Event, EventBuilder, EventSink};
pub use error::{
    BatchError, BuilderError, ConfigError, DispatchError, EngineError, LinkError, SetupError,
    TransportError,
};
pub use link::{sort_links, Link, PendingLink};
pub use pending::{pending_queue, PendingEntry, PendingKind, PendingRx, PendingTx};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transport::{CompletionQueue, LinkTransport, RemoteRegion, SharedRegion};
