//! # Byte-Budgeted LRU Store
//!
//! Map-backed cache with an enforced byte budget and least-recently-used
//! eviction, the default backend for the StrandKV server.
//!
//! ## Design Principles
//!
//! 1. **Slot Arena**: Entries live in a `Vec` of slots; recency links and
//!    the free list are slot indices, so no unsafe pointer aliasing and
//!    O(1) relinks.
//! 2. **Self-Hosting Free List**: A vacated slot stores the index of the
//!    next vacant slot, so slot recycling needs no side allocation.
//! 3. **Shared Key Buffers**: The map key and the entry key are the same
//!    `Arc<[u8]>`, so a key is stored once for the entry's lifetime.
//! 4. **Byte Accounting**: Every entry costs `|key| + |value|` budget
//!    bytes; `used_bytes <= max_bytes` holds after every operation.
//! 5. **All-Or-Nothing Operations**: An operation that cannot apply leaves
//!    the store byte-for-byte unchanged, including eviction state.
//!
//! ## Structure Overview
//!
//! ```text
//! LruStore
//!   ├── map: HashMap<Arc<[u8]>, usize>     key -> slot index
//!   ├── slots: Vec<Slot>                   Occupied(Node) | Vacant
//!   ├── next_free                          free list threaded through
//!   │                                      the vacant slots
//!   └── head/tail                          LRU / MRU ends
//!         └── Node { key, value, size, link: { prev, next } }
//! ```

use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use crate::storage::Storage;

/// Recency-order neighbours of one entry, as slot indices.
#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

/// One live cache entry.
#[derive(Debug)]
struct Node {
    // Shared key buffer; the map stores the same Arc, so the key is
    // allocated once and stable for the entry's lifetime.
    key: Arc<[u8]>,
    // Shared value buffer for zero-copy reads.
    value: Arc<[u8]>,
    // Byte cost for budget accounting (key + value).
    size: usize,
    // Position in the recency order.
    link: Link,
}

/// Arena slot: a live entry, or a vacancy carrying the free list onward.
#[derive(Debug)]
enum Slot {
    Occupied(Node),
    Vacant { next_free: Option<usize> },
}

/// Byte-budgeted LRU cache.
///
/// The recency order runs from `head` (least recently used, evicted
/// first) to `tail` (most recently used). Every successful `get`, `put`,
/// `put_if_absent` and `set` leaves the touched key at the tail.
#[derive(Debug)]
pub struct LruStore {
    /// Key -> slot index for O(1) lookup.
    map: HashMap<Arc<[u8]>, usize, RandomState>,
    /// Entry arena; vacant slots chain the free list.
    slots: Vec<Slot>,
    /// First vacant slot, if any.
    next_free: Option<usize>,
    /// LRU end; eviction always removes this entry.
    head: Option<usize>,
    /// MRU end.
    tail: Option<usize>,
    /// Byte budget.
    max_bytes: usize,
    /// Current byte usage.
    used_bytes: usize,
}

impl LruStore {
    /// Creates a store with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        LruStore {
            map: HashMap::with_hasher(RandomState::new()),
            slots: Vec::new(),
            next_free: None,
            head: None,
            tail: None,
            max_bytes,
            used_bytes: 0,
        }
    }

    fn node(&self, idx: usize) -> &Node {
        match &self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("recency link points at a vacant slot"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        match &mut self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("recency link points at a vacant slot"),
        }
    }

    /// Claims a slot for `node`, preferring the free list over growth.
    fn alloc_slot(&mut self, node: Node) -> usize {
        match self.next_free {
            Some(idx) => {
                self.next_free = match self.slots[idx] {
                    Slot::Vacant { next_free } => next_free,
                    Slot::Occupied(_) => panic!("free list points at an occupied slot"),
                };
                self.slots[idx] = Slot::Occupied(node);
                idx
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        }
    }

    /// Vacates a slot, pushing it onto the free list, and returns its node.
    fn free_slot(&mut self, idx: usize) -> Node {
        let vacancy = Slot::Vacant {
            next_free: self.next_free,
        };
        self.next_free = Some(idx);
        match std::mem::replace(&mut self.slots[idx], vacancy) {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("slot vacated twice"),
        }
    }

    /// Unlinks `idx` from the recency order, patching neighbours and ends.
    fn detach(&mut self, idx: usize) {
        let Link { prev, next } = self.node(idx).link;
        match prev {
            Some(prev_idx) => self.node_mut(prev_idx).link.next = next,
            None => self.head = next,
        }
        match next {
            Some(next_idx) => self.node_mut(next_idx).link.prev = prev,
            None => self.tail = prev,
        }
        self.node_mut(idx).link = Link::default();
    }

    /// Links `idx` at the tail, making it the most recently used entry.
    fn attach_mru(&mut self, idx: usize) {
        let old_tail = self.tail;
        self.node_mut(idx).link = Link {
            prev: old_tail,
            next: None,
        };
        match old_tail {
            Some(tail_idx) => self.node_mut(tail_idx).link.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Moves an accessed entry to the tail; already-MRU entries stay put.
    fn promote(&mut self, idx: usize) {
        if self.tail != Some(idx) {
            self.detach(idx);
            self.attach_mru(idx);
        }
    }

    /// Removes one entry outright: recency order, arena, index, and byte
    /// accounting in a single step. Returns the bytes given back.
    fn drop_entry(&mut self, idx: usize) -> usize {
        self.detach(idx);
        let node = self.free_slot(idx);
        self.map.remove(node.key.as_ref());
        self.used_bytes -= node.size;
        node.size
    }

    /// Evicts from the head until `used_bytes` is at most `target`.
    ///
    /// `target` must already be known to fit an empty store; the caller
    /// checks `entry size <= max_bytes` before any eviction so a failing
    /// operation never evicts.
    fn evict_until(&mut self, target: usize) {
        while self.used_bytes > target {
            match self.head {
                Some(idx) => self.drop_entry(idx),
                None => break,
            };
        }
    }

    /// Replaces the value of an existing entry and promotes it.
    ///
    /// The entry is moved to the tail before eviction runs, so eviction can
    /// never remove the entry being updated.
    fn update_in_place(&mut self, idx: usize, value: &[u8], new_size: usize) {
        let old_size = self.node(idx).size;
        self.promote(idx);

        // Post-update usage is used - old + new, so a growing value needs
        // used <= max - (new - old) before it lands. The caller has already
        // checked new_size <= max_bytes, so the target cannot underflow and
        // the loop always stops before reaching the freshly-promoted tail.
        if new_size > old_size {
            self.evict_until(self.max_bytes - (new_size - old_size));
        }

        let node = self.node_mut(idx);
        node.value = Arc::from(value);
        node.size = new_size;
        self.used_bytes = self.used_bytes - old_size + new_size;
    }

    /// Inserts a fresh entry, evicting from the head to make room.
    fn insert_fresh(&mut self, key: &[u8], value: &[u8], size: usize) {
        self.evict_until(self.max_bytes - size);

        let key: Arc<[u8]> = Arc::from(key);
        let idx = self.alloc_slot(Node {
            key: Arc::clone(&key),
            value: Arc::from(value),
            size,
            link: Link::default(),
        });
        self.attach_mru(idx);
        self.map.insert(key, idx);
        self.used_bytes += size;
    }
}

impl Storage for LruStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        let size = key.len() + value.len();
        if size > self.max_bytes {
            return false;
        }
        match self.map.get(key).copied() {
            Some(idx) => self.update_in_place(idx, value, size),
            None => self.insert_fresh(key, value, size),
        }
        true
    }

    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
        if self.map.contains_key(key) {
            return false;
        }
        let size = key.len() + value.len();
        if size > self.max_bytes {
            return false;
        }
        self.insert_fresh(key, value, size);
        true
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        let idx = match self.map.get(key).copied() {
            Some(idx) => idx,
            None => return false,
        };
        let size = key.len() + value.len();
        if size > self.max_bytes {
            return false;
        }
        self.update_in_place(idx, value, size);
        true
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.drop_entry(idx);
                true
            }
            None => false,
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<Arc<[u8]>> {
        let idx = self.map.get(key).copied()?;
        self.promote(idx);
        Some(Arc::clone(&self.node(idx).value))
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
