use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex-guarded FIFO shared between a notify callback and the watch loop.
pub struct FifoQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_insertion_order() {
        let queue = FifoQueue::new();
        queue.push(1);
        queue.push(2);
        assert!(!queue.is_empty());
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
