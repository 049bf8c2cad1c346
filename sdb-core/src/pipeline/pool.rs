//! Bounded-lookahead parallel map over a worker-thread pool.
//!
//! ## Backpressure
//!
//! A plain parallel map happily races ahead of its consumer; with items
//! that are whole in-memory audio buffers and a consumer paced by a
//! training loop, that is an OOM. The pool therefore gates dispatch on a
//! counting gauge:
//!
//! ```text
//! feeder ──(gauge < lookahead? dispatch : poll-sleep)──► workers ──► results
//!    ▲                                                               │
//!    └──────────── gauge -1 when the caller consumes ◄───────────────┘
//! ```
//!
//! At most `lookahead` items are dispatched-but-unconsumed at any moment.
//! Results arrive unordered by default (max throughput); ordered mode
//! reorders behind the same gate, so the reorder buffer is bounded too.
//!
//! Dropping the pool stops the feeder (the gate poll observes the
//! shutdown flag, so a blocked feeder always gets released), lets workers
//! drain and joins every thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::unbounded;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker thread count.
    pub workers: usize,
    /// Maximum dispatched-but-unconsumed items.
    pub lookahead: usize,
    /// Reorder results back to submission order.
    pub ordered: bool,
    /// Sleep between gate polls while the feeder is blocked.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            workers,
            lookahead: workers,
            ordered: false,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Handle over a running pool; iterate it to consume results.
pub struct LimitingPool<U> {
    results: crossbeam_channel::Receiver<(u64, U)>,
    in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    ordered: bool,
    next_seq: u64,
    reordered: BTreeMap<u64, U>,
}

impl<U: Send + 'static> LimitingPool<U> {
    /// Start feeding `inputs` through `make_worker()` jobs.
    ///
    /// `make_worker` runs once per worker thread and builds that worker's
    /// private job state (transform chains, RNGs); the returned closure
    /// maps one input to one output.
    pub fn spawn<T, I, W, F>(inputs: I, make_worker: F, config: PoolConfig) -> Self
    where
        T: Send + 'static,
        I: IntoIterator<Item = T> + Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(T) -> U,
    {
        let worker_count = config.workers.max(1);
        let lookahead = config.lookahead.max(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (input_tx, input_rx) = unbounded::<(u64, T)>();
        let (result_tx, result_rx) = unbounded::<(u64, U)>();

        debug!(workers = worker_count, lookahead, ordered = config.ordered, "pool starting");

        let feeder = {
            let in_flight = Arc::clone(&in_flight);
            let shutdown = Arc::clone(&shutdown);
            let poll_interval = config.poll_interval;
            thread::spawn(move || {
                let mut seq = 0u64;
                for item in inputs {
                    while in_flight.load(Ordering::Acquire) >= lookahead {
                        if shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        thread::sleep(poll_interval);
                    }
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    in_flight.fetch_add(1, Ordering::AcqRel);
                    if input_tx.send((seq, item)).is_err() {
                        return;
                    }
                    seq += 1;
                }
            })
        };

        let make_worker = Arc::new(make_worker);
        let workers = (0..worker_count)
            .map(|_| {
                let input_rx = input_rx.clone();
                let result_tx = result_tx.clone();
                let make_worker = Arc::clone(&make_worker);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    let mut job = make_worker();
                    for (seq, item) in input_rx.iter() {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let out = job(item);
                        if result_tx.send((seq, out)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            results: result_rx,
            in_flight,
            shutdown,
            feeder: Some(feeder),
            workers,
            ordered: config.ordered,
            next_seq: 0,
            reordered: BTreeMap::new(),
        }
    }
}

impl<U> LimitingPool<U> {
    fn consume_one(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<U> Iterator for LimitingPool<U> {
    type Item = U;

    fn next(&mut self) -> Option<U> {
        if !self.ordered {
            return match self.results.recv() {
                Ok((_, out)) => {
                    self.consume_one();
                    Some(out)
                }
                Err(_) => None,
            };
        }
        loop {
            if let Some(out) = self.reordered.remove(&self.next_seq) {
                self.next_seq += 1;
                self.consume_one();
                return Some(out);
            }
            match self.results.recv() {
                Ok((seq, out)) if seq == self.next_seq => {
                    self.next_seq += 1;
                    self.consume_one();
                    return Some(out);
                }
                Ok((seq, out)) => {
                    // Out-of-order arrival; holding it still counts toward
                    // the gate, so the buffer stays within lookahead.
                    self.reordered.insert(seq, out);
                }
                Err(_) => {
                    // Channel closed; drain whatever arrived, tolerating
                    // gaps from workers that stopped early.
                    return self.reordered.pop_first().map(|(seq, out)| {
                        self.next_seq = seq + 1;
                        self.consume_one();
                        out
                    });
                }
            }
        }
    }
}

impl<U> Drop for LimitingPool<U> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize, lookahead: usize, ordered: bool) -> PoolConfig {
        PoolConfig {
            workers,
            lookahead,
            ordered,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn maps_every_item_exactly_once() {
        let pool = LimitingPool::spawn(0..100u64, || |x: u64| x * 2, config(4, 8, false));
        let mut out: Vec<u64> = pool.collect();
        out.sort_unstable();
        let expected: Vec<u64> = (0..100).map(|x| x * 2).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn ordered_mode_preserves_submission_order() {
        let pool = LimitingPool::spawn(
            0..200u64,
            || {
                |x: u64| {
                    // Uneven job times shuffle completion order.
                    if x % 7 == 0 {
                        thread::sleep(Duration::from_millis(2));
                    }
                    x
                }
            },
            config(4, 8, true),
        );
        let out: Vec<u64> = pool.collect();
        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn lookahead_bounds_dispatched_but_unconsumed() {
        let lookahead = 4;
        let started = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = {
            let started = Arc::clone(&started);
            let consumed = Arc::clone(&consumed);
            let peak = Arc::clone(&peak);
            LimitingPool::spawn(
                0..1000u64,
                move || {
                    let started = Arc::clone(&started);
                    let consumed = Arc::clone(&consumed);
                    let peak = Arc::clone(&peak);
                    move |x: u64| {
                        let outstanding = started.fetch_add(1, Ordering::SeqCst) + 1
                            - consumed.load(Ordering::SeqCst);
                        peak.fetch_max(outstanding, Ordering::SeqCst);
                        x
                    }
                },
                config(8, lookahead, false),
            )
        };

        for (i, _) in pool.enumerate() {
            consumed.store(i + 1, Ordering::SeqCst);
            // Slow consumer: the gate, not the consumer, must be the limit.
            if i % 50 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(started.load(Ordering::SeqCst), 1000);
        let observed = peak.load(Ordering::SeqCst);
        assert!(
            observed <= lookahead,
            "peak concurrency {observed} exceeded lookahead {lookahead}"
        );
    }

    #[test]
    fn make_worker_runs_once_per_thread() {
        let inits = Arc::new(AtomicUsize::new(0));
        let pool = {
            let inits = Arc::clone(&inits);
            LimitingPool::spawn(
                0..32u64,
                move || {
                    inits.fetch_add(1, Ordering::SeqCst);
                    |x: u64| x
                },
                config(3, 4, false),
            )
        };
        assert_eq!(pool.count(), 32);
        assert_eq!(inits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_the_pool_releases_a_blocked_feeder() {
        let mut pool = LimitingPool::spawn(0..u64::MAX, || |x: u64| x, config(2, 2, false));
        for _ in 0..5 {
            pool.next();
        }
        // Feeder is gate-blocked on an effectively infinite input here;
        // drop must still complete by signalling shutdown and joining.
        drop(pool);
    }
}
