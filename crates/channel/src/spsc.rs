// SPDX-License-Identifier: Apache-2.0

//! Single-producer, single-consumer queue.
//!
//! Only one [`SpscSender`] and one [`SpscReceiver`] may exist per channel;
//! this is a usage contract, not a type-level guarantee, because both sides
//! must still be `Clone`-free `Send` handles shared with exactly one stage
//! endpoint each. A successful [`SpscSender::offer`] happens-before the
//! corresponding [`SpscReceiver::poll`] sees it: both sides go through the
//! same mutex, so the ordering guarantee is free.

use flux_traits::{Queue, QueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct State<T> {
    buffer: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// The producer half of an SPSC channel.
pub struct SpscSender<T> {
    shared: Arc<Shared<T>>,
}

/// The consumer half of an SPSC channel.
pub struct SpscReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a bounded SPSC channel with room for `capacity` elements.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (SpscSender<T>, SpscReceiver<T>) {
    new(Some(capacity))
}

/// Creates an unbounded SPSC channel.
#[must_use]
pub fn unbounded<T>() -> (SpscSender<T>, SpscReceiver<T>) {
    new(None)
}

fn new<T>(capacity: Option<usize>) -> (SpscSender<T>, SpscReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity.unwrap_or(0)),
            capacity,
            closed: false,
        }),
    });
    (
        SpscSender {
            shared: shared.clone(),
        },
        SpscReceiver { shared },
    )
}

impl<T> SpscSender<T> {
    /// Marks the channel closed; subsequent offers fail, buffered values remain pollable.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
    }
}

impl<T: Send> Queue<T> for SpscSender<T> {
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

impl<T: Send> Queue<T> for SpscReceiver<T> {
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

    #[test]
    fn offer_then_poll_preserves_order() {
        let (tx, rx) = bounded::<i32>(4);
        assert!(tx.offer(1).is_ok());
        assert!(tx.offer(2).is_ok());
        assert_eq!(rx.poll(), Some(1));
        assert_eq!(rx.poll(), Some(2));
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn bounded_rejects_when_full() {
        let (tx, _rx) = bounded::<i32>(1);
        assert!(tx.offer(1).is_ok());
        match tx.offer(2) {
            Err(QueueError::Full(v)) => assert_eq!(v, 2),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn closed_rejects_offers_but_drains_remaining() {
        let (tx, rx) = unbounded::<i32>();
        assert!(tx.offer(1).is_ok());
        tx.close();
        match tx.offer(2) {
            Err(QueueError::Closed(v)) => assert_eq!(v, 2),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(rx.poll(), Some(1));
    }
}
