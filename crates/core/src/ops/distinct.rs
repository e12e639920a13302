// SPDX-License-Identifier: Apache-2.0

//! `distinct`/`distinct_until_changed`: suppress repeated elements by key.

use std::collections::HashSet;

use crate::flow::{shared, Flow};
use crate::stage::{map_filter_source, Step};

/// Suppresses elements whose key has been seen before in this subscription.
/// See [`Flow::map`] for the cross-subscription sharing caveat on `key_fn`.
pub fn distinct<T, K, F>(upstream: Flow<T>, key_fn: F) -> Flow<T>
where
    T: Send + Sync + 'static,
    K: std::hash::Hash + Eq + Send + 'static,
    F: FnMut(&T) -> K + Send + 'static,
{
    let key_fn = shared(key_fn);
    Flow::from_arc(map_filter_source(upstream.into_source(), move || {
        let key_fn = key_fn.clone();
        let mut seen: HashSet<K> = HashSet::new();
        move |v: T| {
            let key = (key_fn.lock())(&v);
            if seen.insert(key) {
                Step::Emit(v)
            } else {
                Step::Skip
            }
        }
    }))
}

/// Suppresses an element whose key equals the immediately preceding element's.
/// See [`Flow::map`] for the cross-subscription sharing caveat on `key_fn`.
pub fn distinct_until_changed<T, K, F>(upstream: Flow<T>, key_fn: F) -> Flow<T>
where
    T: Send + Sync + 'static,
    K: PartialEq + Send + 'static,
    F: FnMut(&T) -> K + Send + 'static,
{
    let key_fn = shared(key_fn);
    Flow::from_arc(map_filter_source(upstream.into_source(), move || {
        let key_fn = key_fn.clone();
        let mut last: Option<K> = None;
        move |v: T| {
            let key = (key_fn.lock())(&v);
            if last.as_ref() == Some(&key) {
                Step::Skip
            } else {
                last = Some(key);
                Step::Emit(v)
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn distinct_suppresses_every_repeat_regardless_of_position() {
        let flow = distinct(Flow::from_iter(vec![1, 2, 1, 3, 2, 4]), |v: &i32| *v);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn distinct_until_changed_only_suppresses_immediate_repeats() {
        let flow = distinct_until_changed(Flow::from_iter(vec![1, 1, 2, 2, 1, 3, 3]), |v: &i32| *v);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 1, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn distinct_uses_a_fresh_seen_set_per_subscription() {
        let flow = distinct(Flow::from_iter(vec![1, 1, 2]), |v: &i32| *v);
        let first = TestConsumer::new();
        flow.clone().subscribe(first.as_consumer());
        first.request(u64::MAX);
        let second = TestConsumer::new();
        flow.subscribe(second.as_consumer());
        second.request(u64::MAX);
        assert_eq!(first.values(), vec![1, 2]);
        assert_eq!(second.values(), vec![1, 2]);
    }
}
