//! The contract this core requires from the wire transport: reliable ordered
//! two-sided messages for the bootstrap, one-sided writes with immediate data
//! for fragments and batches, and completion delivery.
//!
//! The transport itself (fabric setup, connection management, congestion
//! control) lives outside this crate; `testing` provides a deterministic
//! in-memory realization for the test suite.

use crate::error::TransportError;
use evb_proto::{DgramHeader, ImmData, HEADER_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Descriptor for a peer's registered memory, exchanged during bootstrap.
/// Later one-sided writes specify an offset relative to `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub rkey: u64,
    pub addr: u64,
    pub extent: u64,
}

impl RemoteRegion {
    pub const WIRE_SIZE: usize = 24;

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.rkey.to_ne_bytes());
        out[8..16].copy_from_slice(&self.addr.to_ne_bytes());
        out[16..24].copy_from_slice(&self.extent.to_ne_bytes());
    }

    pub fn read_from(buf: &[u8]) -> RemoteRegion {
        RemoteRegion {
            rkey: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            addr: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            extent: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// One endpoint of a reliable bidirectional channel to a single peer.
///
/// `send_sync`/`recv_sync` are used only during the bootstrap handshake.
/// After the handshake, all data flows through `write_data` (one-sided, with
/// a 32-bit immediate delivered atomically to the peer) and `poll`/`poll_wait`
/// (this link's own immediate stream, used for credit returns).
pub trait LinkTransport: Send {
    fn send_sync(&mut self, buf: &[u8]) -> Result<(), TransportError>;
    fn recv_sync(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Pins `region` for one-sided access by the peer.
    fn register_region(&mut self, region: &SharedRegion) -> Result<(), TransportError>;

    /// Deposits `buf` at `offset` within the peer's registered region and
    /// delivers `imm` to the peer's completion stream.
    fn write_data(
        &mut self,
        buf: &[u8],
        remote: &RemoteRegion,
        offset: usize,
        imm: ImmData,
    ) -> Result<(), TransportError>;

    /// Delivers an immediate with no accompanying data, e.g. a freed
    /// transition-buffer index flowing back to its contributor.
    fn inject(&mut self, imm: ImmData) -> Result<(), TransportError>;

    /// Non-blocking check of this link's immediate stream.
    fn poll(&mut self) -> Option<ImmData>;

    /// Blocking variant with a bounded wait.
    fn poll_wait(&mut self, tmo: Duration) -> Result<ImmData, TransportError>;
}

/// A completion stream shared across every link terminating at one endpoint.
/// The builder's pend thread and the contributor's result receiver block
/// here.
pub trait CompletionQueue: Send {
    /// `Err(Timeout)` is not a failure; it signals the idle path (the engine
    /// times out stuck events).
    fn pend(&mut self, tmo: Duration) -> Result<ImmData, TransportError>;
}

static NEXT_RKEY: AtomicU64 = AtomicU64::new(1);

/// A registered memory region.
///
/// One side owns it, the other writes into it; after the bootstrap no
/// synchronization is needed on the bytes themselves because the sender
/// guarantees no two in-flight writes target the same slot and the receiver
/// reads a slot only after seeing its immediate-data notification.  The lock
/// here gives the in-memory transport a sound way to honor that contract.
#[derive(Debug, Clone)]
pub struct SharedRegion {
    buf: Arc<Mutex<Box<[u8]>>>,
    rkey: u64,
}

impl SharedRegion {
    pub fn new(len: usize) -> SharedRegion {
        SharedRegion {
            buf: Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice())),
            rkey: NEXT_RKEY.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rkey(&self) -> u64 {
        self.rkey
    }

    pub fn descriptor(&self) -> RemoteRegion {
        RemoteRegion {
            rkey: self.rkey,
            addr: 0,
            extent: self.len() as u64,
        }
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<(), TransportError> {
        let mut buf = self.buf.lock();
        let end = offset + bytes.len();
        if end > buf.len() {
            return Err(TransportError::Failed(format!(
                "write of {} bytes at {offset} exceeds region of {}",
                bytes.len(),
                buf.len()
            )));
        }
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), TransportError> {
        let buf = self.buf.lock();
        let end = offset + out.len();
        if end > buf.len() {
            return Err(TransportError::Failed(format!(
                "read of {} bytes at {offset} exceeds region of {}",
                out.len(),
                buf.len()
            )));
        }
        out.copy_from_slice(&buf[offset..end]);
        Ok(())
    }

    /// Reads the fragment header at `offset`.
    pub fn read_header(&self, offset: usize) -> Result<DgramHeader, TransportError> {
        let mut bytes = [0u8; HEADER_SIZE];
        self.read_at(offset, &mut bytes)?;
        Ok(DgramHeader::read_from(&bytes))
    }

    /// Writes the fragment header at `offset`, leaving any payload bytes
    /// after it untouched.
    pub fn write_header(&self, offset: usize, header: &DgramHeader) -> Result<(), TransportError> {
        let mut bytes = [0u8; HEADER_SIZE];
        header.write_to(&mut bytes);
        self.write_at(offset, &bytes)
    }
}
