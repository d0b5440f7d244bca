use std::fmt::{self, Display};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("{name} is full ({capacity} entries)")]
    BufferFull { name: &'static str, capacity: usize },
    #[error("{name} has no free slot ({capacity} entries)")]
    TableFull { name: &'static str, capacity: usize },
    #[error("{name} has no entry for key {key}")]
    NotFound { name: &'static str, key: u64 },
}

/// Fixed-capacity FIFO ring.
///
/// `front` and `rear` are both `None` exactly when the ring is empty.
/// Flushing only resets the pointers; stale slots are overwritten by
/// later insertions.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
    front: Option<usize>,
    rear: Option<usize>,
}

impl<T> CircularBuffer<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "{name} needs at least one slot");
        Self {
            name,
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            front: None,
            rear: None,
        }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn size(&self) -> usize {
        match (self.front, self.rear) {
            (Some(front), Some(rear)) => (rear + self.capacity() - front) % self.capacity() + 1,
            _ => 0,
        }
    }
    pub fn free(&self) -> usize {
        self.capacity() - self.size()
    }
    pub fn is_empty(&self) -> bool {
        self.front.is_none()
    }
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }
    pub fn pointers(&self) -> (Option<usize>, Option<usize>) {
        (self.front, self.rear)
    }
    /// appends at the rear, converting `item` into the stored shape.
    pub fn add(&mut self, item: impl Into<T>) -> Result<(), BufferError> {
        if self.is_full() {
            return Err(BufferError::BufferFull {
                name: self.name,
                capacity: self.capacity(),
            });
        }
        let rear = match self.rear {
            Some(rear) => (rear + 1) % self.capacity(),
            None => {
                self.front = Some(0);
                0
            }
        };
        self.slots[rear] = Some(item.into());
        self.rear = Some(rear);
        Ok(())
    }
    /// drops the front entry; a no-op on an empty ring.
    pub fn remove(&mut self) -> Option<T> {
        let front = self.front?;
        let item = self.slots[front].take();
        if self.front == self.rear {
            self.front = None;
            self.rear = None;
        } else {
            self.front = Some((front + 1) % self.capacity());
        }
        item
    }
    fn slot_of(&self, offset: usize) -> Option<usize> {
        let front = self.front?;
        (offset < self.size()).then(|| (front + offset) % self.capacity())
    }
    /// entry `offset` places behind the front.
    pub fn get(&self, offset: usize) -> Option<&T> {
        self.slot_of(offset).and_then(|i| self.slots[i].as_ref())
    }
    pub fn get_mut(&mut self, offset: usize) -> Option<&mut T> {
        self.slot_of(offset).and_then(|i| self.slots[i].as_mut())
    }
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }
    pub fn back(&self) -> Option<&T> {
        self.size().checked_sub(1).and_then(|i| self.get(i))
    }
    pub fn back_mut(&mut self) -> Option<&mut T> {
        self.size().checked_sub(1).and_then(|i| self.get_mut(i))
    }
    pub fn flush(&mut self) {
        self.front = None;
        self.rear = None;
    }
    /// entries from front to rear.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.size()).filter_map(|i| self.get(i))
    }
}

impl<T: Display> Display for CircularBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = |p: Option<usize>| p.map_or("-".to_string(), |p| p.to_string());
        writeln!(
            f,
            "{} ({}/{}, front: {}, rear: {}) {{",
            self.name,
            self.size(),
            self.capacity(),
            ptr(self.front),
            ptr(self.rear)
        )?;
        for (i, item) in self.iter().enumerate() {
            writeln!(f, "  {i:>3}: {item}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut b = CircularBuffer::<u32>::new("ring", 3);
        assert!(b.is_empty());
        b.add(1u32).unwrap();
        b.add(2u32).unwrap();
        assert_eq!(b.remove(), Some(1));
        b.add(3u32).unwrap();
        b.add(4u32).unwrap();
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(b.get(2), Some(&4));
        assert_eq!(b.get(3), None);
        assert_eq!(b.back(), Some(&4));
    }

    #[test]
    fn test_capacity() {
        let mut b = CircularBuffer::<u32>::new("ring", 16);
        for i in 0..16u32 {
            b.add(i).unwrap();
            assert_eq!(b.size() + b.free(), 16);
        }
        assert_eq!(b.size(), 16);
        assert_eq!(
            b.add(99u32),
            Err(BufferError::BufferFull {
                name: "ring",
                capacity: 16
            })
        );
    }

    #[test]
    fn test_flush_and_remove_empty() {
        let mut b = CircularBuffer::<u32>::new("ring", 4);
        assert_eq!(b.remove(), None);
        b.add(7u32).unwrap();
        b.add(8u32).unwrap();
        b.flush();
        assert_eq!(b.size(), 0);
        assert_eq!(b.pointers(), (None, None));
        assert_eq!(b.get(0), None);
        b.add(9u32).unwrap();
        assert_eq!(b.front(), Some(&9));
        assert_eq!(b.remove(), Some(9));
        assert!(b.is_empty());
    }

    #[test]
    fn test_wraps_around() {
        let mut b = CircularBuffer::<u32>::new("ring", 2);
        for i in 0..10u32 {
            b.add(i).unwrap();
            assert_eq!(b.remove(), Some(i));
        }
        assert_eq!(b.size(), 0);
    }
}
