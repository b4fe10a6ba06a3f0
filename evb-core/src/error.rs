use evb_proto::{PulseId, Service, SrcId};
use thiserror::Error;

/// Errors raised by the transport layer beneath the links.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No completion arrived within the wait; drives the idle path, not a
    /// failure.
    #[error("timed out waiting for a completion")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    /// Stored as a string because underlying errors may not be Clone/Eq.
    #[error("transport failed: {0}")]
    Failed(String),
}

/// Errors from the link bootstrap handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("transport failed during bootstrap: {0}")]
    TransportFailed(String),
    #[error("peer announced region size {announced} which does not fit {allocated}")]
    SizeMismatch { announced: usize, allocated: usize },
    #[error("peer closed the connection during bootstrap")]
    PeerClosed,
    #[error("peer id {0} out of range or already taken")]
    BadPeerId(u32),
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> LinkError {
        match err {
            TransportError::Disconnected => LinkError::PeerClosed,
            other => LinkError::TransportFailed(other.to_string()),
        }
    }
}

/// Configuration rejected before any link activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("contract for readout group {group} names contributors {extra:#x} outside the partition")]
    BadContract { group: usize, extra: u64 },
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("batch ring of {batch_count} slots exceeds the in-flight tracking limit")]
    RingTooLarge { batch_count: usize },
    #[error("config file: {0}")]
    Io(String),
    #[error("config parse: {0}")]
    Parse(String),
}

/// Fatal divergence detected inside the event-builder engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The pool ran dry: the timeout is too long relative to the input rate
    /// and buffer count.
    #[error("{what} pool exhausted at pulse {pid}")]
    PoolExhausted { what: &'static str, pid: PulseId },
    /// A lookup-table slot already holds a live record with a different key:
    /// the key space wrapped faster than the flush rate.
    #[error("lookup table collision: slot holds {held}, probed with {probed}")]
    LutCollision { held: PulseId, probed: PulseId },
}

/// Errors from the contributor-side batch ring.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// The dispatcher must close a batch before it fills; hitting this is a
    /// programmer error.
    #[error("batch {index} already holds its full complement of entries")]
    BatchFull { index: usize },
}

/// Fatal conditions detected by the contributor dispatcher.  All of these
/// indicate protocol-invariant violations; aborting is the caller's policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("pulse id did not advance: {cur} after {prev}")]
    NonMonotonicPulseId { prev: PulseId, cur: PulseId },
    #[error("pending-batch queue overflowed; backpressure was not honored")]
    BatchPendingOverflow,
    #[error("no transition buffer credit from builder {dst} for {service}")]
    NoTransitionBuffer { dst: SrcId, service: Service },
    #[error("{service} transition has an unexpected payload of {size} bytes")]
    UnexpectedPayload { service: Service, size: usize },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures while wiring up a builder or contributor instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures on the builder's input path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuilderError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
