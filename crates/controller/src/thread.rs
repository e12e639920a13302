// SPDX-License-Identifier: Apache-2.0

//! A single dedicated worker thread draining a task queue, implementing
//! [`Executor`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flux_traits::{Cancellable, Executor};
use parking_lot::{Condvar, Mutex};

struct Task {
    cancelled: Arc<AtomicBool>,
    action: Box<dyn FnOnce() + Send>,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// Runs every scheduled action, in arrival order, on one dedicated OS thread.
///
/// Dropping the executor signals the worker to stop once its queue drains
/// and joins it, so no actions are lost or abandoned mid-run.
pub struct ThreadExecutor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadExecutor {
    /// Spawns the worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("flux-controller-worker".to_owned())
                .spawn(move || run(&shared))
                .expect("failed to spawn flux-controller worker thread")
        };
        Self { shared, worker: Some(worker) }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn run(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.condvar.wait(&mut queue);
            }
        };
        let Some(task) = task else {
            tracing::debug!("flux-controller worker thread shutting down");
            return;
        };
        if !task.cancelled.load(Ordering::Acquire) {
            (task.action)();
        }
    }
}

impl Executor for ThreadExecutor {
    fn schedule(&self, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.shared.queue.lock().push_back(Task { cancelled: cancelled.clone(), action });
        self.shared.condvar.notify_one();
        Box::new(TaskHandle { cancelled })
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable for TaskHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_scheduled_actions_in_order() {
        let executor = ThreadExecutor::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            drop(executor.schedule(Box::new(move || tx.send(i).expect("receiver dropped"))));
        }
        drop(tx);
        let received: Vec<i32> = rx.iter().collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelling_before_it_runs_skips_the_action() {
        let executor = ThreadExecutor::new();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ran_tx, ran_rx) = mpsc::channel::<()>();
        // Blocks the worker on the first task until the gate is released below,
        // guaranteeing the cancelled second task is still sitting in the queue
        // (not already running) when `cancel` is called.
        drop(executor.schedule(Box::new(move || {
            let _ = gate_rx.recv();
        })));
        let second = executor.schedule(Box::new(move || {
            let _ = ran_tx.send(());
        }));
        second.cancel();
        gate_tx.send(()).expect("worker thread gone");
        drop(executor);
        assert!(ran_rx.try_recv().is_err());
    }
}
