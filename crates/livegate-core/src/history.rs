use std::collections::VecDeque;

/// Fixed-capacity ring buffer keeping the most recent `capacity` items.
///
/// Pushing into a full buffer silently drops the oldest entry.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contiguous copy, oldest first.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest_when_full() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(i);
        }
        assert_eq!(rb.len(), 3);
        assert!(rb.is_full());
        assert_eq!(rb.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut rb = RingBuffer::new(0);
        rb.push(true);
        rb.push(false);
        assert_eq!(rb.capacity(), 1);
        assert_eq!(rb.to_vec(), vec![false]);
    }

    #[test]
    fn test_clear() {
        let mut rb = RingBuffer::new(2);
        rb.push(1);
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.to_vec(), Vec::<i32>::new());
    }
}
