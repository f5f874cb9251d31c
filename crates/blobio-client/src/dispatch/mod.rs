//! Sharded dispatch worker pool
//!
//! Decouples callers from network latency. Each of `N` worker threads owns a
//! bounded ring; a request goes to the worker chosen by hashing its extent,
//! so requests for one extent are always issued in push order by the same
//! thread while different extents proceed in parallel.
//!
//! ```text
//! caller ──push(key)──► ring[hash(key) & (N-1)] ──► worker ──issue()──► transport
//!                                                                  │
//!                       transport I/O thread ◄── completion ───────┘
//! ```
//!
//! Issuing never waits for the network: the transport completes the request
//! later on one of its own threads. A full ring stalls the producer (spin,
//! then short sleeps) instead of dropping work.
//!
//! A completion that runs on a worker thread (the null transport completes
//! inline) may push again. If it targets that worker's own full ring, the
//! push issues the worker's older queued work itself until a slot frees, so
//! per-key order holds and the worker never waits on itself.
//!
//! On shutdown every worker is woken and joined, and anything still queued
//! is expired: its owner completes it inline with a closed-device status.

mod ring;
mod signal;

pub use ring::Ring;
pub use signal::WakeSignal;

use crate::stats::DispatchStats;
use blobio_common::{DispatchConfig, Error, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

/// Items a worker takes from its ring per lock acquisition
const DRAIN_BATCH: usize = 64;

thread_local! {
    /// `(pool, worker)` when the current thread is a dispatch worker
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// A unit of work handed to the pool
pub trait DispatchItem: Send + 'static {
    /// Start the network operation. Must not wait for its completion.
    fn issue(self: Box<Self>);

    /// Complete without issuing because the pool has shut down
    fn expire(self: Box<Self>);
}

struct Queued {
    item: Box<dyn DispatchItem>,
    enqueued_at: Instant,
}

struct Worker {
    id: usize,
    ring: Ring<Queued>,
    signal: WakeSignal,
    /// Items taken off the ring and not yet issued. Touched by the worker
    /// thread, and by pool shutdown once that thread is gone.
    backlog: Mutex<VecDeque<Queued>>,
}

impl Worker {
    fn next_backlog(&self) -> Option<Queued> {
        self.backlog.lock().pop_front()
    }
}

struct PoolShared {
    workers: Vec<Worker>,
    running: AtomicBool,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
}

impl PoolShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Identity of this pool as seen from its worker threads
    fn identity(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn on_worker(&self, id: usize) -> bool {
        CURRENT_WORKER.with(Cell::get) == Some((self.identity(), id))
    }

    /// Issue `q`, or expire it once the pool is stopping
    fn run(&self, q: Queued) {
        if !self.is_running() {
            self.stats.record_expired();
            q.item.expire();
            return;
        }
        let queue_wait = q.enqueued_at.elapsed();
        let start = Instant::now();
        q.item.issue();
        self.stats.record_issued(queue_wait, start.elapsed());
    }

    fn expire_queued(&self, worker: &Worker) -> usize {
        let mut queued: Vec<Queued> = worker.backlog.lock().drain(..).collect();
        queued.extend(worker.ring.drain());
        let n = queued.len();
        for q in queued {
            self.stats.record_expired();
            q.item.expire();
        }
        n
    }
}

/// Fixed set of dispatch worker threads
pub struct DispatchPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Validate `config` and start its workers
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;

        let capacity = config.ring_capacity();
        let workers = (0..config.workers)
            .map(|id| Worker {
                id,
                ring: Ring::new(capacity),
                signal: WakeSignal::new(),
                backlog: Mutex::new(VecDeque::new()),
            })
            .collect();

        let shared = Arc::new(PoolShared {
            workers,
            running: AtomicBool::new(true),
            config,
            stats: Arc::new(DispatchStats::new()),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            handles: Mutex::new(Vec::with_capacity(shared.config.workers)),
        };

        for id in 0..shared.config.workers {
            let worker_shared = Arc::clone(&shared);
            let cpu = shared.config.cpu_affinity.get(id).copied();
            let handle = thread::Builder::new()
                .name(format!("blobio-dispatch-{id}"))
                .spawn(move || worker_loop(&worker_shared, id, cpu))
                .map_err(|e| Error::internal(format!("spawn dispatch worker {id}: {e}")))?;
            pool.handles.lock().push(handle);
        }

        info!(
            workers = shared.config.workers,
            ring_capacity = capacity,
            "dispatch pool started"
        );
        Ok(pool)
    }

    /// Worker index serving `key`; stable for the pool's lifetime
    #[must_use]
    pub fn worker_for(&self, key: u64) -> usize {
        worker_index(key, self.shared.workers.len())
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Items waiting in one worker's ring
    pub fn queued(&self, worker: usize) -> usize {
        self.shared.workers.get(worker).map_or(0, |w| w.ring.len())
    }

    /// Queue `item` on the worker owning `key`.
    ///
    /// Blocks while that worker's ring is full, unless called on that very
    /// worker: then older queued items are issued inline to make room.
    /// After shutdown the item is expired inline instead of queued.
    pub fn push(&self, key: u64, item: Box<dyn DispatchItem>) {
        let shared = &self.shared;
        let index = self.worker_for(key);
        let worker = &shared.workers[index];

        if !shared.is_running() {
            shared.stats.record_expired();
            item.expire();
            return;
        }

        let backoff = Duration::from_micros(shared.config.backoff_us);
        let mut queued = Queued {
            item,
            enqueued_at: Instant::now(),
        };
        let mut attempts: u32 = 0;
        loop {
            match worker.ring.try_push(queued) {
                Ok(()) => break,
                Err(back) => {
                    if !shared.is_running() {
                        shared.stats.record_expired();
                        back.item.expire();
                        return;
                    }
                    queued = back;
                    shared.stats.record_full_retry();
                    if shared.on_worker(index) {
                        if let Some(older) = worker.next_backlog().or_else(|| worker.ring.pop()) {
                            shared.run(older);
                        }
                        continue;
                    }
                    attempts = attempts.wrapping_add(1);
                    if attempts % shared.config.spin_batch == 0 {
                        thread::sleep(backoff);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }
        }

        shared.stats.record_pushed();
        worker.signal.post();

        // Shutdown may have drained this ring between our running check and
        // the push; expire whatever it left behind.
        if !shared.is_running() {
            let n = shared.expire_queued(worker);
            if n > 0 {
                debug!(worker = worker.id, expired = n, "expired items pushed during shutdown");
            }
        }
    }

    /// Stop every worker and expire anything still queued. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for worker in &self.shared.workers {
            worker.signal.wake_all();
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                // Stopped from inside a worker (an inline completion); that
                // worker drains its own ring on the way out.
                continue;
            }
            if handle.join().is_err() {
                warn!("dispatch worker panicked");
            }
        }

        let expired: usize = self
            .shared
            .workers
            .iter()
            .map(|w| self.shared.expire_queued(w))
            .sum();

        info!(expired, "dispatch pool stopped");
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPool")
            .field("workers", &self.shared.workers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Stable worker selection: xxh64 of the key, masked to the worker count
#[must_use]
pub fn worker_index(key: u64, workers: usize) -> usize {
    debug_assert!(workers.is_power_of_two());
    (xxh64(&key.to_le_bytes(), 0) as usize) & (workers - 1)
}

fn worker_loop(shared: &PoolShared, id: usize, cpu: Option<usize>) {
    if let Some(cpu) = cpu
        && let Err(e) = pin_to_cpu(cpu)
    {
        warn!(worker = id, cpu, "failed to set cpu affinity: {e}");
    }

    CURRENT_WORKER.with(|current| current.set(Some((shared.identity(), id))));
    let worker = &shared.workers[id];
    let wake_timeout = Duration::from_millis(shared.config.wake_timeout_ms);
    let mut batch = Vec::with_capacity(DRAIN_BATCH);

    debug!(worker = id, "dispatch worker started");

    while shared.is_running() {
        worker.signal.wait(wake_timeout);

        while shared.is_running() && worker.ring.pop_batch(DRAIN_BATCH, &mut batch) > 0 {
            worker.backlog.lock().extend(batch.drain(..));
            while let Some(q) = worker.next_backlog() {
                shared.run(q);
            }
        }
    }

    let expired = shared.expire_queued(worker);
    debug!(worker = id, expired, "dispatch worker stopped");
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> std::result::Result<(), String> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu).map_err(|e| e.to_string())?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| e.to_string())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> std::result::Result<(), String> {
    Ok(())
}
