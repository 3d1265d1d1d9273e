//! Binary min-heap over identifiers whose keys and positions live in an
//! external slot table.
//!
//! Both the per-plugin task heap and the global plugin heap are built on
//! [`IndexedHeap`]: every mutation writes the element's new position back
//! through [`Slots::set_index`], so removal and re-positioning by identity
//! are O(log n).

/// Key lookup and position bookkeeping for heap members.
pub trait Slots<Id> {
    type Key: Ord;

    fn key(&self, id: Id) -> Self::Key;

    /// Records the position of `id`; `None` once it leaves the heap.
    fn set_index(&mut self, id: Id, index: Option<usize>);
}

#[derive(Debug, Clone)]
pub struct IndexedHeap<Id> {
    items: Vec<Id>,
}

impl<Id> Default for IndexedHeap<Id> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<Id: Copy> IndexedHeap<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<Id> {
        self.items.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.items.iter().copied()
    }

    pub fn push<S: Slots<Id>>(&mut self, slots: &mut S, id: Id) {
        self.items.push(id);
        let index = self.items.len() - 1;
        slots.set_index(id, Some(index));
        self.sift_up(slots, index);
    }

    pub fn pop<S: Slots<Id>>(&mut self, slots: &mut S) -> Option<Id> {
        if self.items.is_empty() {
            return None;
        }
        self.remove(slots, 0)
    }

    /// Removes the element at `index`.
    pub fn remove<S: Slots<Id>>(&mut self, slots: &mut S, index: usize) -> Option<Id> {
        if index >= self.items.len() {
            return None;
        }
        let last = self.items.len() - 1;
        if index != last {
            self.swap(slots, index, last);
        }
        let id = self.items.pop()?;
        slots.set_index(id, None);
        if index < self.items.len() {
            self.fix(slots, index);
        }
        Some(id)
    }

    /// Restores heap order after the key of the element at `index` changed
    /// in either direction.
    pub fn fix<S: Slots<Id>>(&mut self, slots: &mut S, index: usize) {
        if index >= self.items.len() {
            return;
        }
        if !self.sift_down(slots, index) {
            self.sift_up(slots, index);
        }
    }

    pub fn clear<S: Slots<Id>>(&mut self, slots: &mut S) {
        for id in self.items.drain(..) {
            slots.set_index(id, None);
        }
    }

    fn less<S: Slots<Id>>(&self, slots: &S, a: usize, b: usize) -> bool {
        slots.key(self.items[a]) < slots.key(self.items[b])
    }

    fn swap<S: Slots<Id>>(&mut self, slots: &mut S, a: usize, b: usize) {
        self.items.swap(a, b);
        slots.set_index(self.items[a], Some(a));
        slots.set_index(self.items[b], Some(b));
    }

    fn sift_up<S: Slots<Id>>(&mut self, slots: &mut S, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(slots, index, parent) {
                break;
            }
            self.swap(slots, index, parent);
            index = parent;
        }
    }

    /// Returns true if the element moved.
    fn sift_down<S: Slots<Id>>(&mut self, slots: &mut S, start: usize) -> bool {
        let len = self.items.len();
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(slots, right, left) {
                right
            } else {
                left
            };
            if !self.less(slots, child, index) {
                break;
            }
            self.swap(slots, index, child);
            index = child;
        }
        index > start
    }
}
