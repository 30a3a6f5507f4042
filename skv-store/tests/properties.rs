//! Property tests driving `LruStore` against a naive shadow model.
//!
//! The shadow keeps entries in an explicit recency order, so comparing
//! results and accounting after every step checks the budget, the
//! index/list agreement, and that eviction always removes the oldest keys.

use std::sync::Arc;

use proptest::prelude::*;

use skv_store::{LruStore, Storage};

const BUDGET: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    PutIfAbsent(Vec<u8>, Vec<u8>),
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Get(Vec<u8>),
}

/// Reference implementation: a vector ordered LRU-first.
#[derive(Default)]
struct Shadow {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Shadow {
    fn position(&self, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    fn used(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn evict_for(&mut self, incoming: usize) {
        while self.used() + incoming > BUDGET {
            self.entries.remove(0);
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > BUDGET {
            return false;
        }
        match self.position(key) {
            Some(pos) => {
                let (k, _) = self.entries.remove(pos);
                self.evict_for(k.len() + value.len());
                self.entries.push((k, value.to_vec()));
            }
            None => {
                self.evict_for(key.len() + value.len());
                self.entries.push((key.to_vec(), value.to_vec()));
            }
        }
        true
    }

    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
        if self.position(key).is_some() {
            return false;
        }
        self.put(key, value)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        if self.position(key).is_none() {
            return false;
        }
        self.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        match self.position(key) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let pos = self.position(key)?;
        let entry = self.entries.remove(pos);
        let value = entry.1.clone();
        self.entries.push(entry);
        Some(value)
    }
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    // A handful of hot keys plus occasional cold ones keeps collisions
    // frequent enough to exercise updates and promotions.
    prop::collection::vec(prop::num::u8::ANY, 1..4)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::num::u8::ANY, 0..24)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Set(k, v)),
        key_strategy().prop_map(Op::Delete),
        key_strategy().prop_map(Op::Get),
    ]
}

proptest! {
    #[test]
    fn store_matches_shadow_model(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut store = LruStore::new(BUDGET);
        let mut shadow = Shadow::default();

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    prop_assert_eq!(store.put(k, v), shadow.put(k, v));
                }
                Op::PutIfAbsent(k, v) => {
                    prop_assert_eq!(store.put_if_absent(k, v), shadow.put_if_absent(k, v));
                }
                Op::Set(k, v) => {
                    prop_assert_eq!(store.set(k, v), shadow.set(k, v));
                }
                Op::Delete(k) => {
                    prop_assert_eq!(store.delete(k), shadow.delete(k));
                }
                Op::Get(k) => {
                    let got = store.get(k).map(|v: Arc<[u8]>| v.to_vec());
                    prop_assert_eq!(got, shadow.get(k));
                }
            }

            prop_assert_eq!(store.len(), shadow.entries.len());
            prop_assert_eq!(store.used_bytes(), shadow.used());
            prop_assert!(store.used_bytes() <= store.max_bytes());
        }

        // Final membership check; order no longer matters, so the gets
        // here may promote freely.
        let keys: Vec<Vec<u8>> = shadow.entries.iter().map(|(k, _)| k.clone()).collect();
        for key in keys {
            let expected = shadow.get(&key);
            prop_assert_eq!(store.get(&key).map(|v| v.to_vec()), expected);
        }
    }

    #[test]
    fn oversized_entries_never_mutate(extra in prop::collection::vec(prop::num::u8::ANY, 0..8)) {
        let mut store = LruStore::new(16);
        prop_assert!(store.put(b"keep", b"safe"));
        let used = store.used_bytes();

        let mut big = vec![b'x'; 17];
        big.extend_from_slice(&extra);
        prop_assert!(!store.put(b"k", &big));
        prop_assert_eq!(store.used_bytes(), used);
        prop_assert_eq!(store.len(), 1);
        prop_assert!(store.get(b"keep").is_some());
    }
}
