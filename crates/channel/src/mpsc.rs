// SPDX-License-Identifier: Apache-2.0

//! Multiple-producer, single-consumer queue, used wherever a stage fans in
//! from more than one upstream (`merge`, `flatMap`, `groupBy` substream
//! dispatch).

use flux_traits::{Queue, QueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct State<T> {
    buffer: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    senders: AtomicUsize,
}

/// A cloneable producer handle; cloning registers another live sender.
pub struct MpscSender<T> {
    shared: Arc<Shared<T>>,
}

/// The single consumer handle.
pub struct MpscReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a bounded MPSC channel with room for `capacity` elements.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (MpscSender<T>, MpscReceiver<T>) {
    new(Some(capacity))
}

/// Creates an unbounded MPSC channel.
#[must_use]
pub fn unbounded<T>() -> (MpscSender<T>, MpscReceiver<T>) {
    new(None)
}

fn new<T>(capacity: Option<usize>) -> (MpscSender<T>, MpscReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity.unwrap_or(0)),
            capacity,
            closed: false,
        }),
        senders: AtomicUsize::new(1),
    });
    (
        MpscSender {
            shared: shared.clone(),
        },
        MpscReceiver { shared },
    )
}

impl<T> Clone for MpscSender<T> {
    fn clone(&self) -> Self {
        let _ = self.shared.senders.fetch_add(1, Ordering::Relaxed);
        MpscSender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for MpscSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.state.lock().closed = true;
        }
    }
}

impl<T> MpscReceiver<T> {
    /// Marks the channel closed from the consumer side; further offers fail.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
    }

    /// Returns `true` once every sender has been dropped and the buffer has drained.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed && state.buffer.is_empty()
    }
}

impl<T: Send> Queue<T> for MpscSender<T> {
    fn offer(&self, value: T) -> Result<(), QueueError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed(value));
        }
        if let Some(cap) = state.capacity {
            if state.buffer.len() >= cap {
                return Err(QueueError::Full(value));
            }
        }
        state.buffer.push_back(value);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.shared.state.lock().buffer.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.shared.state.lock().buffer.is_empty()
    }

    fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }
}

impl<T: Send> Queue<T> for MpscReceiver<T> {
    fn offer(&self, value: T) -> Result<(), QueueError<T>> {
        Err(QueueError::Closed(value))
    }

    fn poll(&self) -> Option<T> {
        self.shared.state.lock().buffer.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.shared.state.lock().buffer.is_empty()
    }

    fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn multiple_senders_interleave_safely() {
        let (tx, rx) = unbounded::<i32>();
        let tx2 = tx.clone();
        let h1 = thread::spawn(move || {
            for i in 0..1000 {
                let _ = tx.offer(i);
            }
        });
        let h2 = thread::spawn(move || {
            for i in 1000..2000 {
                let _ = tx2.offer(i);
            }
        });
        h1.join().expect("producer thread panicked");
        h2.join().expect("producer thread panicked");
        let mut count = 0;
        while rx.poll().is_some() {
            count += 1;
        }
        assert_eq!(count, 2000);
    }

    #[test]
    fn closes_once_all_senders_dropped() {
        let (tx, rx) = unbounded::<i32>();
        let tx2 = tx.clone();
        drop(tx);
        assert!(!rx.is_terminated());
        drop(tx2);
        assert!(rx.is_terminated());
    }
}
