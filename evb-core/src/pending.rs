//! The bounded FIFO of batches posted but not yet answered.
//!
//! Single producer (the dispatcher), single consumer (the result receiver).
//! The dispatcher pushes *before* the one-sided write is issued, so the
//! receiver can never see a result race ahead of the batch it answers.
//! Overflow means backpressure was not honored upstream and is fatal.

use crate::error::{DispatchError, TransportError};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use evb_proto::PulseId;
use std::time::Duration;

/// Why an entry sits on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// A batch posted to builder `dst`; exactly one result will answer it.
    Posted { dst: usize },
    /// A fragment that bypassed the builders; the receiver delivers it
    /// locally, in order, when results catch up to it.
    Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    /// First pulse of the batch, or the bypassed fragment's pulse.
    pub start_pid: PulseId,
    /// Batch slot in the contributor's ring.
    pub index: usize,
    /// Region offset of the batch start (or of the bypassed fragment).
    pub offset: usize,
    pub kind: PendingKind,
}

pub fn pending_queue(capacity: usize) -> (PendingTx, PendingRx) {
    let (tx, rx) = bounded(capacity);
    (PendingTx { tx }, PendingRx { rx })
}

#[derive(Debug, Clone)]
pub struct PendingTx {
    tx: Sender<PendingEntry>,
}

impl PendingTx {
    pub fn push(&self, entry: PendingEntry) -> Result<(), DispatchError> {
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::BatchPendingOverflow),
            Err(TrySendError::Disconnected(_)) => {
                Err(DispatchError::Transport(TransportError::Disconnected))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[derive(Debug)]
pub struct PendingRx {
    rx: Receiver<PendingEntry>,
}

impl PendingRx {
    pub fn try_pop(&self) -> Option<PendingEntry> {
        self.rx.try_recv().ok()
    }

    pub fn pop_wait(&self, tmo: Duration) -> Result<PendingEntry, TransportError> {
        self.rx.recv_timeout(tmo).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_fatal() {
        let (tx, _rx) = pending_queue(2);
        let entry = PendingEntry {
            start_pid: PulseId(1),
            index: 0,
            offset: 0,
            kind: PendingKind::Bypass,
        };
        tx.push(entry).unwrap();
        tx.push(entry).unwrap();
        assert_eq!(tx.push(entry), Err(DispatchError::BatchPendingOverflow));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (tx, rx) = pending_queue(8);
        for pid in [3u64, 5, 9] {
            tx.push(PendingEntry {
                start_pid: PulseId(pid),
                index: 0,
                offset: 0,
                kind: PendingKind::Posted { dst: 0 },
            })
            .unwrap();
        }
        assert_eq!(rx.try_pop().unwrap().start_pid, PulseId(3));
        assert_eq!(rx.try_pop().unwrap().start_pid, PulseId(5));
        assert_eq!(rx.try_pop().unwrap().start_pid, PulseId(9));
        assert!(rx.try_pop().is_none());
    }
}
