//! # Storage Trait
//!
//! The seam between the network layer and the cache backend. Commands are
//! executed against `&mut dyn Storage` (or a generic `S: Storage`), so a
//! different backend can be dropped in without touching the server.
//!
//! Refusals are ordinary return values, not errors: an operation that
//! cannot apply (key absent, key present, entry over budget) returns
//! `false`/`None` and leaves the store untouched.

use std::sync::Arc;

/// Bounded key/value store with recency-ordered eviction.
///
/// All methods are non-suspending and complete in amortized O(1) plus the
/// key hash/compare and the value copy. The store is single-writer:
/// multi-threaded deployments wrap it in an external mutex; the coroutine
/// server does not, because every call happens on the one server thread.
pub trait Storage {
    /// Inserts or overwrites. Fails only when `key.len() + value.len()`
    /// exceeds the byte budget. The entry becomes most-recently used.
    fn put(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Inserts only if `key` is absent.
    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Overwrites only if `key` is present.
    fn set(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Removes `key`. Fails if it is absent.
    fn delete(&mut self, key: &[u8]) -> bool;

    /// Looks up `key`. A hit promotes the entry to most-recently used.
    fn get(&mut self, key: &[u8]) -> Option<Arc<[u8]>>;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// True when the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of `key.len() + value.len()` over all live entries.
    fn used_bytes(&self) -> usize;

    /// The configured byte budget.
    fn max_bytes(&self) -> usize;
}
