//! Indexed binary min-heap over `(priority, seq)`.
//!
//! A plain binary heap cannot remove an arbitrary entry (needed when a
//! caller withdraws a request or a settled active request leaves the heap),
//! so positions are mirrored in an id→index map, giving O(log n)
//! removal-by-identity.

use std::collections::HashMap;

use crate::request::RequestId;

/// Heap ordering key: priority first (lower is better), then insertion
/// sequence so equal priorities pop in deterministic submit order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortKey {
    pub priority: f64,
    pub seq: u64,
}

impl SortKey {
    fn cmp(&self, other: &SortKey) -> std::cmp::Ordering {
        // Priorities are validated finite at submit, so total_cmp matches
        // numeric order here.
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }

    fn lt(&self, other: &SortKey) -> bool {
        self.cmp(other).is_lt()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeapEntry {
    pub key: SortKey,
    pub id: RequestId,
}

#[derive(Debug, Default)]
pub struct PriorityHeap {
    entries: Vec<HeapEntry>,
    index: HashMap<RequestId, usize>,
}

impl PriorityHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    /// Ids of all entries, heap order (only the first is meaningful).
    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn push(&mut self, key: SortKey, id: RequestId) {
        debug_assert!(!self.index.contains_key(&id), "duplicate heap entry {id}");
        let pos = self.entries.len();
        self.entries.push(HeapEntry { key, id });
        self.index.insert(id, pos);
        self.sift_up(pos);
    }

    pub fn pop(&mut self) -> Option<HeapEntry> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove an arbitrary entry by identity. Returns false if absent.
    pub fn remove(&mut self, id: RequestId) -> bool {
        match self.index.get(&id).copied() {
            Some(pos) => {
                self.remove_at(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn remove_at(&mut self, pos: usize) -> HeapEntry {
        let last = self.entries.len() - 1;
        self.swap(pos, last);
        let removed = self.entries.pop().unwrap_or_else(|| unreachable!());
        self.index.remove(&removed.id);
        if pos < self.entries.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        removed
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index.insert(self.entries[a].id, a);
        self.index.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].key.lt(&self.entries[parent].key) {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.entries[left].key.lt(&self.entries[smallest].key) {
                smallest = left;
            }
            if right < len && self.entries[right].key.lt(&self.entries[smallest].key) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
