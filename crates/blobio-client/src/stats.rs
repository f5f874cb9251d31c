//! I/O statistics for blobs and the dispatch pool
//!
//! All counters are relaxed atomics: they are observed by operators, never
//! used to make decisions on the data path.

use blobio_common::IoKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of latency buckets, the last one open-ended
pub const LATENCY_BUCKETS: usize = 16;

/// Bucket upper bounds in microseconds: a 1-2-5 series from 10us to 500ms,
/// then everything slower
const BUCKET_BOUNDS_US: [u64; LATENCY_BUCKETS] = [
    10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 200_000,
    500_000, u64::MAX,
];

/// Latency distribution of one request stage.
///
/// Percentiles are bucket-accurate: they report the upper bound of the
/// bucket holding the quantile. Samples past the last finite bound are
/// reported as the slowest sample seen.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Index of the bucket a sample falls in; bounds are exclusive
    fn bucket_of(us: u64) -> usize {
        BUCKET_BOUNDS_US.partition_point(|&bound| bound <= us)
    }

    /// Record how long one request spent in this stage
    pub fn record(&self, elapsed: Duration) {
        self.record_us(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    /// Record a sample already in microseconds
    pub fn record_us(&self, us: u64) {
        let bucket = Self::bucket_of(us).min(LATENCY_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Samples recorded
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all samples in microseconds
    pub fn sum(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Mean sample in microseconds, 0 when empty
    pub fn avg(&self) -> u64 {
        self.sum().checked_div(self.count()).unwrap_or(0)
    }

    /// Fastest sample in microseconds, 0 when empty
    pub fn min(&self) -> u64 {
        match self.min_us.load(Ordering::Relaxed) {
            u64::MAX => 0,
            min => min,
        }
    }

    /// Slowest sample in microseconds
    pub fn max(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Upper bound in microseconds of the bucket holding quantile `q`
    /// (0.0 to 1.0); 0 when empty
    pub fn percentile(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let rank = ((total as f64) * q).ceil().max(1.0) as u64;

        let mut seen = 0u64;
        for (bucket, &bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US.iter()) {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return if bound == u64::MAX { self.max() } else { bound };
            }
        }
        self.max()
    }

    /// `(upper bound us, count)` per bucket, for Prometheus export
    pub fn bucket_counts(&self) -> Vec<(u64, u64)> {
        BUCKET_BOUNDS_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }

    /// Mean, extremes and the usual percentiles in one read
    pub fn percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles {
            avg: self.avg(),
            min: self.min(),
            max: self.max(),
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p99: self.percentile(0.99),
            p999: self.percentile(0.999),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentiles snapshot, all in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Per-blob logical request statistics
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    split_ops: AtomicU64,
    failed_ops: AtomicU64,
    checksum_errors: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished logical request
    pub fn record(&self, kind: IoKind, bytes: u64, elapsed: Duration, split: bool, ok: bool) {
        match kind {
            IoKind::Read => {
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
                self.read_latency.record(elapsed);
            }
            IoKind::Write => {
                self.write_ops.fetch_add(1, Ordering::Relaxed);
                self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
                self.write_latency.record(elapsed);
            }
        }
        if split {
            self.split_ops.fetch_add(1, Ordering::Relaxed);
        }
        if !ok {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Relaxed)
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    /// Logical requests that crossed an extent boundary
    pub fn split_ops(&self) -> u64 {
        self.split_ops.load(Ordering::Relaxed)
    }

    pub fn failed_ops(&self) -> u64 {
        self.failed_ops.load(Ordering::Relaxed)
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self) -> &LatencyHistogram {
        &self.read_latency
    }

    pub fn write_latency(&self) -> &LatencyHistogram {
        &self.write_latency
    }
}

/// Dispatch pool statistics, split by stage
#[derive(Debug, Default)]
pub struct DispatchStats {
    pushed: AtomicU64,
    issued: AtomicU64,
    expired: AtomicU64,
    full_retries: AtomicU64,
    /// Time spent in a ring before a worker picked the item up
    queue_wait: LatencyHistogram,
    /// Time a worker spent handing the item to the transport
    issue_cost: LatencyHistogram,
    /// Time spent running completion handlers
    callback_cost: LatencyHistogram,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pushed(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_issued(&self, queue_wait: Duration, issue_cost: Duration) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.queue_wait.record(queue_wait);
        self.issue_cost.record(issue_cost);
    }

    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full_retry(&self) {
        self.full_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the cost of one completion handler
    pub fn record_callback(&self, elapsed: Duration) {
        self.callback_cost.record(elapsed);
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Push attempts that found the target ring full
    pub fn full_retries(&self) -> u64 {
        self.full_retries.load(Ordering::Relaxed)
    }

    pub fn queue_wait(&self) -> &LatencyHistogram {
        &self.queue_wait
    }

    pub fn issue_cost(&self) -> &LatencyHistogram {
        &self.issue_cost
    }

    pub fn callback_cost(&self) -> &LatencyHistogram {
        &self.callback_cost
    }
}
