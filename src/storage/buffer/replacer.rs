use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

const NIL: usize = usize::MAX;

struct Node<T> {
    value: T,
    prev: usize,
    next: usize,
}

struct LruInner<T> {
    /// Arena of list nodes; the list owns its nodes, the map only indexes them
    nodes: Vec<Node<T>>,
    free_slots: Vec<usize>,
    map: HashMap<T, usize>,
    /// Most recently inserted
    head: usize,
    /// Victim end
    tail: usize,
}

/// LRU victim selector over opaque values. `insert` refreshes an entry to the
/// front, `victim` pops the tail, `erase` unlinks an arbitrary entry; all
/// operations are O(1) and serialized by one internal mutex.
pub struct LruReplacer<T> {
    inner: Mutex<LruInner<T>>,
}

impl<T: Copy + Eq + Hash> LruReplacer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free_slots: Vec::new(),
                map: HashMap::new(),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    /// Insert `value`, or move it to the front if already present.
    pub fn insert(&self, value: T) {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(&value) {
            inner.unlink(idx);
            inner.push_front(idx);
            return;
        }
        let idx = inner.alloc(value);
        inner.map.insert(value, idx);
        inner.push_front(idx);
    }

    /// Remove and return the least recently inserted value.
    pub fn victim(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let idx = inner.tail;
        if idx == NIL {
            return None;
        }
        let value = inner.nodes[idx].value;
        inner.unlink(idx);
        inner.map.remove(&value);
        inner.free_slots.push(idx);
        Some(value)
    }

    /// Unlink `value` if present; returns whether it was.
    pub fn erase(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.remove(&value) {
            Some(idx) => {
                inner.unlink(idx);
                inner.free_slots.push(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Copy + Eq + Hash> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruInner<T> {
    fn alloc(&mut self, value: T) -> usize {
        match self.free_slots.pop() {
            Some(idx) => {
                self.nodes[idx].value = value;
                idx
            }
            None => {
                self.nodes.push(Node {
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order() {
        let replacer = LruReplacer::new();
        for v in 1..=5 {
            replacer.insert(v);
        }
        replacer.erase(3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(4));
        assert_eq!(replacer.victim(), Some(5));
        assert_eq!(replacer.victim(), None);
        assert_eq!(replacer.len(), 0);
    }

    #[test]
    fn test_insert_refreshes_position() {
        let replacer = LruReplacer::new();
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(3);
        // 1 is now most recent, so 2 becomes the victim
        replacer.insert(1);

        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_erase_missing() {
        let replacer = LruReplacer::new();
        replacer.insert(7);
        assert!(!replacer.erase(8));
        assert!(replacer.erase(7));
        assert!(replacer.is_empty());
    }

    #[test]
    fn test_slot_reuse() {
        let replacer = LruReplacer::new();
        for round in 0..3 {
            for v in 0..10 {
                replacer.insert(round * 10 + v);
            }
            while replacer.victim().is_some() {}
        }
        assert!(replacer.is_empty());
    }
}
