//! # Request Queue Time Buffer
//!
//! ## Responsibility
//! Accumulates latency samples keyed by the Unix second they were observed
//! in, until the dispatcher drains them.
//!
//! ## Guarantees
//! - Thread-safe: any number of request handlers may `add` concurrently
//! - Non-blocking: `add` only holds the lock long enough to push one sample
//! - Atomic drain: `snapshot_and_clear` swaps the whole map out under the lock,
//!   so every sample lands in exactly one snapshot
//! - Bounded on failure: `repopulate` evicts buckets older than the TTL
//!
//! ## NOT Responsible For
//! - Network delivery (see `transport`)
//! - Deciding when to drain (see `dispatcher`)

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One request queue time measurement, in milliseconds.
pub type Sample = u64;

/// Unix second a bucket covers.
pub type Bucket = i64;

/// Drained buffer contents, ascending by bucket.
pub type Snapshot = BTreeMap<Bucket, Vec<Sample>>;

/// Time-bucketed sample store shared by request handlers and the dispatcher.
#[derive(Debug, Default)]
pub struct Buffer {
    entries: Mutex<Snapshot>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `sample` to the bucket for second `at`, creating it if absent.
    pub fn add(&self, sample: Sample, at: Bucket) {
        self.lock().entry(at).or_default().push(sample);
    }

    /// Take everything recorded so far and leave the buffer empty.
    pub fn snapshot_and_clear(&self) -> Snapshot {
        std::mem::take(&mut *self.lock())
    }

    /// Merge an undelivered snapshot back in, then evict every bucket older
    /// than `ttl_secs` relative to `now`.
    ///
    /// `pending` was recorded before anything added since it was taken, so
    /// its samples go in front of any concurrent samples for the same second.
    /// A bucket aged exactly `ttl_secs` is kept. Returns the number of
    /// buckets evicted.
    pub fn repopulate(&self, pending: Snapshot, now: Bucket, ttl_secs: u64) -> usize {
        let mut entries = self.lock();
        for (bucket, mut samples) in pending {
            let slot = entries.entry(bucket).or_default();
            samples.append(slot);
            *slot = samples;
        }

        let cutoff = now.saturating_sub(ttl_secs.min(i64::MAX as u64) as i64);
        let before = entries.len();
        // Buckets are ordered, so everything below the cutoff is a prefix.
        *entries = entries.split_off(&cutoff);
        before - entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current contents without draining.
    pub fn peek(&self) -> Snapshot {
        self.lock().clone()
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    // The map holds plain data, so a panic elsewhere cannot leave it in a
    // state worth refusing to read.
    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
