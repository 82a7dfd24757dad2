//! Delivery counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live delivery counters, updated lock-free from every producer and worker
#[derive(Debug, Default)]
pub struct TransmitterStats {
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed_batches: AtomicU64,
    failed_records: AtomicU64,
    /// Records accepted but not yet delivered or dropped
    pending: AtomicUsize,
}

/// Point-in-time copy of [`TransmitterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub sent: u64,
    /// Every record lost, whatever the reason
    pub dropped: u64,
    /// Batch requests that exhausted their retries
    pub failed_batches: u64,
    /// Records that exhausted their retries, alone or inside a batch
    pub failed_records: u64,
    pub pending: usize,
}

impl TransmitterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            failed_records: self.failed_records.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Acquire),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Accept a record unconditionally
    pub(crate) fn accepted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Accept a record only while fewer than `limit` are pending
    pub(crate) fn try_accept(&self, limit: usize) -> bool {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < limit).then_some(pending + 1)
            })
            .is_ok();
        if reserved {
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    /// An accepted record could not be queued after all
    pub(crate) fn rejected_after_accept(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.enqueued.fetch_sub(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was refused before it was accepted
    pub(crate) fn refused(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, count: usize) {
        self.sent.fetch_add(count as u64, Ordering::Relaxed);
        self.pending.fetch_sub(count, Ordering::AcqRel);
    }

    /// A single record exhausted its retries
    pub(crate) fn record_failed(&self) {
        self.failed_records.fetch_add(1, Ordering::Relaxed);
        self.discarded(1);
    }

    /// A batch exhausted its retries
    pub(crate) fn batch_failed(&self, count: usize) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.failed_records.fetch_add(count as u64, Ordering::Relaxed);
        self.discarded(count);
    }

    /// Accepted records given up without a delivery attempt failing,
    /// e.g. abandoned at shutdown
    pub(crate) fn discarded(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        self.pending.fetch_sub(count, Ordering::AcqRel);
    }
}
