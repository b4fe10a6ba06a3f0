use crate::constants::{IMM_FLAG_BITS, IMM_IDX_BITS, IMM_SRC_BITS};
use crate::pulse::SrcId;

/// What the accompanying one-sided write deposited at the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmKind {
    /// A batch landed in the event-buffer region; `idx` is the slot of its
    /// first fragment.
    Buffer,
    /// A single transition landed in the transition region (or, flowing the
    /// other way, the transition slot `idx` is being returned as a credit).
    Transition,
}

/// The 32-bit sideband word delivered atomically with each one-sided write:
/// a `(kind, src, idx)` triple plus a flag telling the receiver whether the
/// sender expects a result.
///
/// ```text
/// [31]     no-response flag
/// [30]     kind (0 = Buffer, 1 = Transition)
/// [29..24] src: peer identifier
/// [23..0]  idx: buffer slot index within the destination region
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmData(u32);

const KIND_BIT: u32 = 1 << 30;
const NO_RESPONSE_BIT: u32 = 1 << 31;

impl ImmData {
    pub fn new(kind: ImmKind, response: bool, src: SrcId, idx: u32) -> ImmData {
        debug_assert!(idx < (1 << IMM_IDX_BITS));
        debug_assert!((src.0 as u32) < (1 << IMM_SRC_BITS));
        let mut val = idx & ((1 << IMM_IDX_BITS) - 1);
        val |= ((src.0 as u32) & ((1 << IMM_SRC_BITS) - 1)) << IMM_IDX_BITS;
        if kind == ImmKind::Transition {
            val |= KIND_BIT;
        }
        if !response {
            val |= NO_RESPONSE_BIT;
        }
        ImmData(val)
    }

    /// A posted batch the receiver is expected to answer with a result.
    pub fn buffer(src: SrcId, idx: u32) -> ImmData {
        ImmData::new(ImmKind::Buffer, true, src, idx)
    }

    /// A forwarded transition; no result will be generated for it.
    pub fn transition(src: SrcId, idx: u32) -> ImmData {
        ImmData::new(ImmKind::Transition, false, src, idx)
    }

    /// A transition-buffer credit returned to the contributor.
    pub fn credit(src: SrcId, idx: u32) -> ImmData {
        ImmData::new(ImmKind::Transition, false, src, idx)
    }

    #[inline]
    pub fn kind(self) -> ImmKind {
        if self.0 & KIND_BIT != 0 {
            ImmKind::Transition
        } else {
            ImmKind::Buffer
        }
    }

    #[inline]
    pub fn is_response(self) -> bool {
        self.0 & NO_RESPONSE_BIT == 0
    }

    #[inline]
    pub fn src(self) -> SrcId {
        SrcId(((self.0 >> IMM_IDX_BITS) & ((1 << IMM_SRC_BITS) - 1)) as u8)
    }

    #[inline]
    pub fn idx(self) -> u32 {
        self.0 & ((1 << IMM_IDX_BITS) - 1)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs the triple from the 64-bit immediate the transport hands
    /// back; the upper half is unused by this protocol.
    #[inline]
    pub fn from_u64(imm: u64) -> ImmData {
        ImmData(imm as u32)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }
}
