//! Range-overlap admission
//!
//! Before a read or write runs, its byte range `[offset, offset + len)` is
//! checked against every range currently admitted on the same blob. Ranges
//! that overlap are rejected or parked on a single FIFO.
//!
//! ```text
//! offset >> SPLIT_SHIFT  ──►  unit  ──►  unit & (SHARD_COUNT-1)  ──►  shard
//!
//! shard k: BTreeMap<start, end>   (ranges whose start falls in a unit ≡ k)
//! ```
//!
//! A range is stored only in the shard owning its start offset. Because
//! admitted ranges are at most `max_range_len` long, a check locks every
//! shard that can hold a range reaching into the requested one: the units
//! from `offset - max_range_len + 1` up to the requested end.
//!
//! A new range also waits when it overlaps anything already parked, so a
//! later request never runs ahead of an earlier one touching the same bytes.
//!
//! The pending FIFO is re-examined at its front only. When the front still
//! overlaps, later entries wait even if they have become admissible; they
//! are picked up once they reach the front.

use blobio_common::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// log2 of the address-space unit that selects a shard (1 MB)
pub const SPLIT_SHIFT: u32 = 20;
/// Address-space unit that selects a shard
pub const SPLIT_UNIT: u64 = 1 << SPLIT_SHIFT;
/// Number of shards, a power of two
pub const SHARD_COUNT: usize = 64;

/// A half-open byte range `[offset, offset + len)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoRange {
    pub offset: u64,
    pub len: u64,
}

impl IoRange {
    #[must_use]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Called with the range once it has been admitted
pub type AdmitFn = Box<dyn FnOnce(IoRange) + Send + 'static>;

/// Outcome of [`RangeScheduler::admit_or_enqueue`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Admitted immediately; the callback has already run
    Admitted,
    /// Parked on the pending FIFO
    Queued,
}

struct PendingRange {
    range: IoRange,
    on_admit: AdmitFn,
}

type Shard = BTreeMap<u64, u64>;

/// Admits non-overlapping byte ranges
pub struct RangeScheduler {
    shards: Box<[Mutex<Shard>]>,
    pending: Mutex<VecDeque<PendingRange>>,
    max_range_len: u64,
    admitted: AtomicUsize,
}

impl RangeScheduler {
    /// Create a scheduler accepting ranges up to `max_range_len` bytes
    #[must_use]
    pub fn new(max_range_len: u64) -> Self {
        assert!(max_range_len > 0, "max range length must be positive");
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            pending: Mutex::new(VecDeque::new()),
            max_range_len,
            admitted: AtomicUsize::new(0),
        }
    }

    /// Shard owning ranges that start at `offset`
    #[must_use]
    pub const fn shard_of(offset: u64) -> usize {
        ((offset >> SPLIT_SHIFT) as usize) & (SHARD_COUNT - 1)
    }

    /// Largest range this scheduler accepts
    #[must_use]
    pub const fn max_range_len(&self) -> u64 {
        self.max_range_len
    }

    /// Number of ranges currently admitted
    pub fn admitted_len(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    /// Number of ranges waiting on the FIFO
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether `range` could be admitted right now
    pub fn check(&self, range: IoRange) -> Result<bool> {
        self.validate(range)?;
        let span = self.shard_span(range);
        let guards = self.lock_span(&span);
        Ok(!guards.iter().any(|shard| Self::overlaps_in(shard, range)))
    }

    /// Admit `range` if it overlaps nothing currently admitted
    pub fn try_admit(&self, range: IoRange) -> Result<bool> {
        self.validate(range)?;
        Ok(self.admit_locked(range))
    }

    /// Admit `range` now, or park it on the pending FIFO.
    ///
    /// The range is parked when it overlaps an admitted range or any range
    /// already waiting.
    ///
    /// `on_admit` runs exactly once: inline before this returns when the
    /// range is admitted immediately, otherwise on the thread whose
    /// completion lets the range through.
    pub fn admit_or_enqueue(&self, range: IoRange, on_admit: AdmitFn) -> Result<Admission> {
        self.validate(range)?;

        // Pending is locked across the check so a completion racing with us
        // either happens before the check or sees us on the FIFO.
        let mut pending = self.pending.lock();
        let behind_pending = pending.iter().any(|p| p.range.overlaps(&range));
        if !behind_pending && self.admit_locked(range) {
            drop(pending);
            on_admit(range);
            return Ok(Admission::Admitted);
        }

        debug!(offset = range.offset, len = range.len, "range overlaps, queued");
        pending.push_back(PendingRange { range, on_admit });
        Ok(Admission::Queued)
    }

    /// Release an admitted range, then re-examine the FIFO front.
    ///
    /// Returns whether the range was found.
    pub fn complete(&self, range: IoRange) -> bool {
        let removed = {
            let mut shard = self.shards[Self::shard_of(range.offset)].lock();
            match shard.get(&range.offset) {
                Some(&end) if end == range.end() => {
                    shard.remove(&range.offset);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
        } else {
            warn!(
                offset = range.offset,
                len = range.len,
                "completed range was not admitted"
            );
        }

        self.reevaluate();
        removed
    }

    /// Admit the FIFO front if it no longer overlaps anything.
    ///
    /// Only the front is examined. Returns whether it was admitted.
    pub fn reevaluate(&self) -> bool {
        let mut pending = self.pending.lock();
        let Some(front) = pending.front() else {
            return false;
        };
        if !self.admit_locked(front.range) {
            return false;
        }
        let Some(entry) = pending.pop_front() else {
            return false;
        };
        drop(pending);

        debug!(
            offset = entry.range.offset,
            len = entry.range.len,
            "pending range admitted"
        );
        (entry.on_admit)(entry.range);
        true
    }

    fn validate(&self, range: IoRange) -> Result<()> {
        if range.len == 0 {
            return Err(Error::invalid_argument("empty range"));
        }
        if range.len > self.max_range_len {
            return Err(Error::invalid_argument(format!(
                "range length {} exceeds scheduler limit {}",
                range.len, self.max_range_len
            )));
        }
        if range.offset.checked_add(range.len).is_none() {
            return Err(Error::invalid_argument("range end overflows"));
        }
        Ok(())
    }

    fn admit_locked(&self, range: IoRange) -> bool {
        let span = self.shard_span(range);
        let mut guards = self.lock_span(&span);
        if guards.iter().any(|shard| Self::overlaps_in(shard, range)) {
            return false;
        }

        let owner = Self::shard_of(range.offset);
        // The owner shard is always inside the span: its unit lies between
        // the lowest and highest unit locked.
        if let Some(pos) = span.iter().position(|&idx| idx == owner) {
            guards[pos].insert(range.offset, range.end());
            self.admitted.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Shards that may hold a range overlapping `range`, ascending
    fn shard_span(&self, range: IoRange) -> Vec<usize> {
        let lo_unit = range.offset.saturating_sub(self.max_range_len - 1) >> SPLIT_SHIFT;
        let hi_unit = (range.end() - 1) >> SPLIT_SHIFT;

        if hi_unit - lo_unit + 1 >= SHARD_COUNT as u64 {
            return (0..SHARD_COUNT).collect();
        }

        let mut span: Vec<usize> = (lo_unit..=hi_unit)
            .map(|unit| (unit as usize) & (SHARD_COUNT - 1))
            .collect();
        // Ascending index order keeps lock acquisition deadlock-free even
        // when the unit span wraps past the last shard.
        span.sort_unstable();
        span.dedup();
        span
    }

    fn lock_span(&self, span: &[usize]) -> Vec<MutexGuard<'_, Shard>> {
        span.iter().map(|&idx| self.shards[idx].lock()).collect()
    }

    fn overlaps_in(shard: &Shard, range: IoRange) -> bool {
        // Right: first range starting at or after the requested start.
        if let Some((&start, _)) = shard.range(range.offset..).next()
            && start < range.end()
        {
            return true;
        }
        // Left: nearest range starting before the requested start.
        if let Some((_, &end)) = shard.range(..range.offset).next_back()
            && end > range.offset
        {
            return true;
        }
        false
    }
}

impl std::fmt::Debug for RangeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeScheduler")
            .field("max_range_len", &self.max_range_len)
            .field("admitted", &self.admitted_len())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn flag() -> (Arc<AtomicBool>, AdmitFn) {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        (fired, Box::new(move |_| f.store(true, Ordering::SeqCst)))
    }

    #[test]
    fn test_shard_index() {
        assert_eq!(RangeScheduler::shard_of(0), 0);
        assert_eq!(RangeScheduler::shard_of(SPLIT_UNIT - 1), 0);
        assert_eq!(RangeScheduler::shard_of(SPLIT_UNIT), 1);
        assert_eq!(RangeScheduler::shard_of(SPLIT_UNIT * SHARD_COUNT as u64), 0);
    }

    #[test]
    fn test_adjacent_ranges_admit_overlap_rejected() {
        let sched = RangeScheduler::new(SPLIT_UNIT);

        assert!(sched.try_admit(IoRange::new(0, 4096)).unwrap());
        assert!(sched.try_admit(IoRange::new(4096, 8192)).unwrap());
        assert!(!sched.try_admit(IoRange::new(8192, 720)).unwrap());
        assert_eq!(sched.admitted_len(), 2);

        let (fired, cb) = flag();
        let admission = sched
            .admit_or_enqueue(IoRange::new(8192, 720), cb)
            .unwrap();
        assert_eq!(admission, Admission::Queued);
        assert!(!fired.load(Ordering::SeqCst));

        assert!(sched.complete(IoRange::new(4096, 8192)));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(sched.admitted_len(), 2);
    }

    #[test]
    fn test_left_and_right_overlap() {
        let sched = RangeScheduler::new(SPLIT_UNIT);
        assert!(sched.try_admit(IoRange::new(1000, 1000)).unwrap());

        // Starts inside an admitted range
        assert!(!sched.check(IoRange::new(1500, 10)).unwrap());
        // Ends inside an admitted range
        assert!(!sched.check(IoRange::new(500, 501)).unwrap());
        // Covers an admitted range
        assert!(!sched.check(IoRange::new(0, 4000)).unwrap());
        // Touches on both sides
        assert!(sched.check(IoRange::new(500, 500)).unwrap());
        assert!(sched.check(IoRange::new(2000, 10)).unwrap());
    }

    #[test]
    fn test_overlap_across_shards() {
        let sched = RangeScheduler::new(4 * SPLIT_UNIT);

        // Starts in shard 0 and reaches into shard 2
        assert!(
            sched
                .try_admit(IoRange::new(SPLIT_UNIT - 10, 2 * SPLIT_UNIT))
                .unwrap()
        );
        // Starts in shard 2, only the earlier shard holds the conflict
        assert!(!sched.check(IoRange::new(2 * SPLIT_UNIT, 100)).unwrap());
        assert!(sched.check(IoRange::new(3 * SPLIT_UNIT, 100)).unwrap());
    }

    #[test]
    fn test_overlap_across_shard_wrap() {
        let sched = RangeScheduler::new(4 * SPLIT_UNIT);
        let wrap = SHARD_COUNT as u64 * SPLIT_UNIT;

        assert!(
            sched
                .try_admit(IoRange::new(wrap - SPLIT_UNIT, 2 * SPLIT_UNIT))
                .unwrap()
        );
        assert!(!sched.check(IoRange::new(wrap + 10, 10)).unwrap());
        // Same shard index, a full wrap later: no conflict
        assert!(sched.check(IoRange::new(2 * wrap, 10)).unwrap());
    }

    #[test]
    fn test_pending_front_only() {
        let sched = RangeScheduler::new(SPLIT_UNIT);
        let a = IoRange::new(0, 4096);
        let d = IoRange::new(8192, 4096);
        assert!(sched.try_admit(a).unwrap());
        assert!(sched.try_admit(d).unwrap());

        let (p1_fired, p1) = flag();
        let (p2_fired, p2) = flag();
        // Front waits on d, the entry behind it waits on a
        sched
            .admit_or_enqueue(IoRange::new(8192, 8), p1)
            .unwrap();
        sched.admit_or_enqueue(IoRange::new(0, 100), p2).unwrap();
        assert_eq!(sched.pending_len(), 2);

        // Completing a frees p2's range, but the front still overlaps d
        sched.complete(a);
        assert!(!p1_fired.load(Ordering::SeqCst));
        assert!(!p2_fired.load(Ordering::SeqCst));
        assert_eq!(sched.pending_len(), 2);

        assert!(!sched.reevaluate());
        assert_eq!(sched.pending_len(), 2);

        // Completing d admits the front only
        sched.complete(d);
        assert!(p1_fired.load(Ordering::SeqCst));
        assert!(!p2_fired.load(Ordering::SeqCst));
        assert_eq!(sched.pending_len(), 1);

        // The entry behind waits for an explicit re-evaluation
        assert!(sched.reevaluate());
        assert!(p2_fired.load(Ordering::SeqCst));
        assert_eq!(sched.pending_len(), 0);
    }

    #[test]
    fn test_range_overlapping_pending_waits_its_turn() {
        let sched = RangeScheduler::new(SPLIT_UNIT);
        let first = IoRange::new(0, 4096);
        let second = IoRange::new(2048, 4096);
        let third = IoRange::new(4096, 4096);
        assert!(sched.try_admit(first).unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |order: &Arc<Mutex<Vec<u64>>>| -> AdmitFn {
            let order = Arc::clone(order);
            Box::new(move |r| order.lock().push(r.offset))
        };

        assert_eq!(
            sched.admit_or_enqueue(second, record(&order)).unwrap(),
            Admission::Queued
        );
        // Free of admitted ranges, but it overlaps the parked one
        assert!(sched.check(third).unwrap());
        assert_eq!(
            sched.admit_or_enqueue(third, record(&order)).unwrap(),
            Admission::Queued
        );
        assert_eq!(sched.pending_len(), 2);

        sched.complete(first);
        assert_eq!(*order.lock(), vec![2048]);
        sched.complete(second);
        assert_eq!(*order.lock(), vec![2048, 4096]);

        // Disjoint from everything parked and admitted: straight through
        let (fired, cb) = flag();
        assert_eq!(
            sched
                .admit_or_enqueue(IoRange::new(1 << 16, 512), cb)
                .unwrap(),
            Admission::Admitted
        );
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_blocked_requests_keep_fifo_order() {
        let sched = Arc::new(RangeScheduler::new(SPLIT_UNIT));
        let blocker = IoRange::new(0, 4096);
        assert!(sched.try_admit(blocker).unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u64 {
            let order = Arc::clone(&order);
            let range = IoRange::new(i * 100, 50);
            sched
                .admit_or_enqueue(range, Box::new(move |r| order.lock().push(r.offset)))
                .unwrap();
        }

        sched.complete(blocker);
        assert_eq!(*order.lock(), vec![0]);
        sched.complete(IoRange::new(0, 50));
        sched.complete(IoRange::new(100, 50));
        assert_eq!(*order.lock(), vec![0, 100, 200]);
    }

    #[test]
    fn test_invalid_ranges() {
        let sched = RangeScheduler::new(4096);
        assert!(sched.try_admit(IoRange::new(0, 0)).is_err());
        assert!(sched.try_admit(IoRange::new(0, 4097)).is_err());
        assert!(sched.try_admit(IoRange::new(u64::MAX - 10, 100)).is_err());
    }

    #[test]
    fn test_complete_unknown_range() {
        let sched = RangeScheduler::new(4096);
        assert!(sched.try_admit(IoRange::new(0, 100)).unwrap());
        assert!(!sched.complete(IoRange::new(0, 50)));
        assert_eq!(sched.admitted_len(), 1);
    }

    #[test]
    fn test_concurrent_admissions_never_overlap() {
        let max_len = 3 * SPLIT_UNIT;
        let sched = Arc::new(RangeScheduler::new(max_len));
        let witness: Arc<Mutex<Vec<IoRange>>> = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sched = Arc::clone(&sched);
                let witness = Arc::clone(&witness);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..2000 {
                        let offset = rng.gen_range(0..(128 * SPLIT_UNIT));
                        let len = rng.gen_range(1..=max_len);
                        let range = IoRange::new(offset, len);
                        if !sched.try_admit(range).unwrap() {
                            continue;
                        }
                        {
                            let mut live = witness.lock();
                            assert!(
                                live.iter().all(|other| !other.overlaps(&range)),
                                "{range:?} admitted while overlapping range live"
                            );
                            live.push(range);
                        }
                        {
                            let mut live = witness.lock();
                            let pos = live.iter().position(|r| *r == range).unwrap();
                            live.swap_remove(pos);
                        }
                        assert!(sched.complete(range));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sched.admitted_len(), 0);
    }
}
