// SPDX-License-Identifier: Apache-2.0

//! A dedicated timer thread backed by a deadline-ordered binary heap,
//! implementing [`DelayedExecutor`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flux_traits::{Cancellable, DelayedExecutor};
use parking_lot::{Condvar, Mutex};

enum Entry {
    Once { cancelled: Arc<AtomicBool>, action: Box<dyn FnOnce() + Send> },
    Periodic { cancelled: Arc<AtomicBool>, period: Duration, action: Arc<dyn Fn() + Send + Sync> },
}

struct ScheduledTask {
    deadline: Instant,
    seq: u64,
    entry: Entry,
}

// `BinaryHeap` is a max-heap; reversing the comparison turns it into a
// min-heap by deadline, with insertion order breaking ties.
impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<ScheduledTask>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Runs delayed and periodic actions from one dedicated timer thread ordered
/// by deadline.
///
/// Dropping the executor stops the timer thread and joins it; any actions
/// still in the heap are abandoned.
pub struct TimerExecutor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TimerExecutor {
    /// Spawns the timer thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("flux-controller-timer".to_owned())
                .spawn(move || run(&shared))
                .expect("failed to spawn flux-controller timer thread")
        };
        Self { shared, worker: Some(worker) }
    }

    fn push(&self, deadline: Instant, entry: Entry) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.heap.lock().push(ScheduledTask { deadline, seq, entry });
        self.shared.condvar.notify_one();
    }
}

impl Default for TimerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn run(shared: &Shared) {
    let mut heap = shared.heap.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            tracing::debug!("flux-controller timer thread shutting down");
            return;
        }
        let now = Instant::now();
        let due = matches!(heap.peek(), Some(task) if task.deadline <= now);
        if due {
            let task = heap.pop().expect("peek confirmed an entry is present");
            parking_lot::MutexGuard::unlocked(&mut heap, || run_task(shared, task));
            continue;
        }
        match heap.peek().map(|task| task.deadline) {
            Some(deadline) => {
                let _ = shared.condvar.wait_for(&mut heap, deadline - now);
            }
            None => shared.condvar.wait(&mut heap),
        }
    }
}

fn run_task(shared: &Shared, task: ScheduledTask) {
    match task.entry {
        Entry::Once { cancelled, action } => {
            if !cancelled.load(Ordering::Acquire) {
                action();
            }
        }
        Entry::Periodic { cancelled, period, action } => {
            if !cancelled.load(Ordering::Acquire) {
                action();
                if !cancelled.load(Ordering::Acquire) {
                    let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
                    shared.heap.lock().push(ScheduledTask {
                        deadline: Instant::now() + period,
                        seq,
                        entry: Entry::Periodic { cancelled, period, action },
                    });
                    shared.condvar.notify_one();
                }
            }
        }
    }
}

impl DelayedExecutor for TimerExecutor {
    fn schedule_after(&self, delay: Duration, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.push(Instant::now() + delay, Entry::Once { cancelled: cancelled.clone(), action });
        Box::new(TimerHandle { cancelled })
    }

    fn schedule_periodically(
        &self,
        initial_delay: Duration,
        period: Duration,
        action: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Cancellable> {
        let action: Arc<dyn Fn() + Send + Sync> = Arc::from(action);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.push(Instant::now() + initial_delay, Entry::Periodic { cancelled: cancelled.clone(), period, action });
        Box::new(TimerHandle { cancelled })
    }
}

impl Drop for TimerExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable for TimerHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn schedule_after_runs_once_the_delay_elapses() {
        let executor = TimerExecutor::new();
        let (tx, rx) = mpsc::channel();
        drop(executor.schedule_after(Duration::from_millis(10), Box::new(move || {
            let _ = tx.send(());
        })));
        rx.recv_timeout(Duration::from_secs(5)).expect("action never ran");
    }

    #[test]
    fn cancelling_before_the_delay_elapses_skips_the_action() {
        let executor = TimerExecutor::new();
        let (tx, rx) = mpsc::channel();
        let handle = executor.schedule_after(Duration::from_millis(200), Box::new(move || {
            let _ = tx.send(());
        }));
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn schedule_periodically_fires_more_than_once() {
        let executor = TimerExecutor::new();
        let (tx, rx) = mpsc::channel();
        let handle = executor.schedule_periodically(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).expect("first tick never arrived");
        rx.recv_timeout(Duration::from_secs(5)).expect("second tick never arrived");
        handle.cancel();
    }
}
