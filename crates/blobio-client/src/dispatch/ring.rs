//! Bounded ring handing work from producer threads to one worker

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Fixed-capacity FIFO.
///
/// Slots are allocated on demand, so a large capacity costs nothing until
/// the ring actually fills.
pub struct Ring<T> {
    slots: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Ring<T> {
    /// Create a ring holding at most `capacity` items (a power of two)
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        Self {
            slots: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append an item, handing it back when the ring is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return Err(item);
        }
        slots.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.slots.lock().pop_front()
    }

    /// Move up to `max` items into `out`, returning how many were moved
    pub fn pop_batch(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut slots = self.slots.lock();
        let n = slots.len().min(max);
        out.extend(slots.drain(..n));
        n
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.slots.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
