//! # MetricsRing - Bounded Sample Buffer
//!
//! Fixed-size ring holding the most recent samples. Tracks a `head` (next
//! slot to write) and a `tail` (oldest retained slot). Pushing into a full
//! ring evicts the oldest sample first.
//!
//! # Invariant
//!
//! `head` never advances onto `tail` while samples remain: the ring allocates
//! `retain + 1` slots and keeps one slot free, so `head == tail` means empty.

pub struct MetricsRing<T> {
    slots: Vec<Option<T>>,

    /// Next slot to write into.
    head: usize,

    /// Oldest retained slot.
    tail: usize,
}

impl<T> MetricsRing<T> {
    /// Create a ring retaining at most `retain` samples.
    ///
    /// # Panics
    /// Panics if `retain == 0`.
    pub fn new(retain: usize) -> Self {
        assert!(retain >= 1, "Metrics ring must retain at least 1 sample");
        let mut slots = Vec::with_capacity(retain + 1);
        slots.resize_with(retain + 1, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.next_pos(self.head) == self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.slots.len() - self.tail + self.head
        }
    }

    /// Maximum number of retained samples.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Append a sample, returning the evicted oldest one when the ring was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.pop_oldest()
        } else {
            None
        };
        self.slots[self.head] = Some(value);
        self.head = self.next_pos(self.head);
        evicted
    }

    /// Remove and return the oldest sample.
    pub fn pop_oldest(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.tail].take();
        self.tail = self.next_pos(self.tail);
        value
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len()).filter_map(move |i| {
            let pos = (self.tail + i) % self.slots.len();
            self.slots[pos].as_ref()
        })
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
    }

    #[inline]
    fn next_pos(&self, pos: usize) -> usize {
        (pos + 1) % self.slots.len()
    }
}
