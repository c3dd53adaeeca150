//! Plain FIFO buffer with amortised O(1) dequeue.
//!
//! Dequeued slots are left behind an offset instead of shifting the backing
//! vector on every call. Once the wasted prefix reaches half of the buffer the
//! live tail is compacted to the front.

#[derive(Debug)]
pub struct MemoryQueue<T> {
    items: Vec<Option<T>>,
    offset: usize,
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            offset: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.items.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&mut self, item: T) {
        self.items.push(Some(item));
    }

    /// Remove and return the oldest entry, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let item = self.items[self.offset].take();
        self.offset += 1;

        if self.offset * 2 >= self.items.len() {
            self.items.drain(..self.offset);
            self.offset = 0;
        }

        item
    }

    /// Oldest entry without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.get(self.offset).and_then(Option::as_ref)
    }

    #[cfg(test)]
    fn wasted_prefix(&self) -> usize {
        self.offset
    }
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_reports_no_value() {
        let mut queue: MemoryQueue<u32> = MemoryQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.peek(), None);
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn preserves_insertion_order() {
        let mut queue = MemoryQueue::new();
        for value in ["a", "b", "c"] {
            queue.enqueue(value);
        }

        assert_eq!(queue.peek(), Some(&"a"));
        assert_eq!(queue.dequeue(), Some("a"));
        assert_eq!(queue.dequeue(), Some("b"));
        queue.enqueue("d");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Some("c"));
        assert_eq!(queue.dequeue(), Some("d"));
        assert!(queue.is_empty());
    }

    #[test]
    fn compacts_once_half_the_buffer_is_wasted() {
        let mut queue = MemoryQueue::new();
        for value in 0..10 {
            queue.enqueue(value);
        }

        for expected in 0..4 {
            assert_eq!(queue.dequeue(), Some(expected));
        }
        assert_eq!(queue.wasted_prefix(), 4);

        assert_eq!(queue.dequeue(), Some(4));
        assert_eq!(queue.wasted_prefix(), 0);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek(), Some(&5));
    }
}
