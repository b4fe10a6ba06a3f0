//! Fundamental and derived constants for the event-building protocol.

// --- Peer limits ---

/// The maximum number of contributors in a partition.
/// Contract and remaining bitmaps are `u64`, one bit per contributor.
pub const MAX_CONTRIBUTORS: usize = 64;

/// The maximum number of builders a contributor can address.
/// Bounded by the source field of the immediate data, shared with contributors.
pub const MAX_BUILDERS: usize = 64;

/// The number of readout groups (trigger classes) in the contract table.
pub const NUM_READOUT_GROUPS: usize = 16;

// --- Batch geometry ---

/// Default number of fragment entries per batch window.  Must be a power of
/// two so the window test reduces to a shift comparison.
pub const MAX_ENTRIES: usize = 64;

/// The maximum number of fragment entries allowed in flight to one builder
/// before the contributor must stall for results.
pub const MAX_LATENCY: usize = 16384;

/// The number of batch slots in the contributor's pre-registered ring.
pub const MAX_BATCHES: usize = MAX_LATENCY / MAX_ENTRIES;

/// Number of 64-bit words needed to track every batch slot in a bitset.
pub const BATCH_WORDS: usize = MAX_BATCHES.div_ceil(64);

// --- Transition buffers ---

/// Transition slots a builder provisions per contributor.  Sized to hold one
/// of each non-L1 transition kind plus headroom for a SlowUpdate in flight.
pub const TR_BUFFERS: usize = 18;

/// How long a contributor waits for a transition-buffer credit before
/// giving up (milliseconds).
pub const CREDIT_WAIT_MS: u64 = 5000;

// --- Immediate-data field widths (32 bits total) ---

/// Bits carrying the `(kind, response)` flags.
pub const IMM_FLAG_BITS: u32 = 2;
/// Bits carrying the peer (source) identifier.
pub const IMM_SRC_BITS: u32 = 6;
/// Bits carrying the buffer slot index within the destination region.
pub const IMM_IDX_BITS: u32 = 32 - IMM_FLAG_BITS - IMM_SRC_BITS;
