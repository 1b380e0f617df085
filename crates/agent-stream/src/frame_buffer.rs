use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::SystemTime;

/// One telemetry reading. `percent` is `used` over the configured limit, in
/// `0.0..=1.0` when usage stays within it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub used: u64,
    pub percent: f64,
}

/// Bounded FIFO history. Pushing onto a full buffer evicts the oldest entry.
#[derive(Debug)]
pub struct FrameBuffer<T> {
    capacity: usize,
    frames: Mutex<VecDeque<T>>,
}

impl<T: Clone> FrameBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, frame: T) {
        let mut frames = self.frames.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Oldest first. The returned vector is detached from the buffer.
    pub fn snapshot(&self) -> Vec<T> {
        self.frames.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<T> {
        self.frames.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let buffer = FrameBuffer::new(3);
        for value in 1..=4 {
            buffer.push(value);
        }
        assert_eq!(buffer.snapshot(), vec![2, 3, 4]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest(), Some(4));
    }

    #[test]
    fn snapshot_is_isolated_from_later_pushes() {
        let buffer = FrameBuffer::new(2);
        buffer.push("a");
        let before = buffer.snapshot();
        buffer.push("b");
        buffer.push("c");
        assert_eq!(before, vec!["a"]);
        assert_eq!(buffer.snapshot(), vec!["b", "c"]);
    }

    #[test]
    fn zero_capacity_keeps_one_frame() {
        let buffer = FrameBuffer::new(0);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.snapshot(), vec![2]);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
