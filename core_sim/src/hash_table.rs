use std::fmt::{self, Display};

pub use crate::circular::BufferError;

/// Entries stored in a [`HashTableBuffer`] expose the key they are found by.
pub trait Keyed {
    fn key(&self) -> u64;
}

/// Fixed-capacity open-addressing table with linear probing.
///
/// Entries are never removed, so a probe may stop at the first empty slot.
#[derive(Debug, Clone)]
pub struct HashTableBuffer<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
}

impl<T: Keyed> HashTableBuffer<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "{name} needs at least one slot");
        Self {
            name,
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
        }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn size(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
    pub fn free(&self) -> usize {
        self.capacity() - self.size()
    }
    fn probe(&self, key: u64) -> impl Iterator<Item = usize> {
        let capacity = self.capacity();
        let home = (key % capacity as u64) as usize;
        (0..capacity).map(move |i| (home + i) % capacity)
    }
    /// slot holding `key`, or else the first empty slot on its probe path.
    fn find(&self, key: u64) -> Result<usize, Option<usize>> {
        for i in self.probe(key) {
            match &self.slots[i] {
                Some(entry) if entry.key() == key => return Ok(i),
                Some(_) => continue,
                None => return Err(Some(i)),
            }
        }
        Err(None)
    }
    /// stores `item` in the first empty slot on its probe path.
    /// The caller checks that the key is not already present.
    pub fn add(&mut self, item: impl Into<T>) -> Result<(), BufferError> {
        let item = item.into();
        match self.find(item.key()) {
            Err(Some(i)) => {
                self.slots[i] = Some(item);
                Ok(())
            }
            Ok(_) => {
                debug_assert!(false, "{}: duplicate key {}", self.name, item.key());
                Ok(())
            }
            Err(None) => Err(BufferError::TableFull {
                name: self.name,
                capacity: self.capacity(),
            }),
        }
    }
    pub fn get(&self, key: u64) -> Option<&T> {
        self.find(key).ok().and_then(|i| self.slots[i].as_ref())
    }
    pub fn contains(&self, key: u64) -> bool {
        self.find(key).is_ok()
    }
    /// replaces the entry with the same key as `item`.
    pub fn update(&mut self, item: impl Into<T>) -> Result<(), BufferError> {
        let item = item.into();
        let key = item.key();
        match self.find(key) {
            Ok(i) => {
                self.slots[i] = Some(item);
                Ok(())
            }
            Err(_) => Err(BufferError::NotFound {
                name: self.name,
                key,
            }),
        }
    }
    /// Inserts or replaces `item`; returns `false`, storing nothing, when
    /// the key is absent and no slot is free.
    pub fn remember(&mut self, item: impl Into<T>) -> bool {
        let item = item.into();
        match self.find(item.key()) {
            Ok(i) | Err(Some(i)) => {
                self.slots[i] = Some(item);
                true
            }
            Err(None) => false,
        }
    }
    /// `update` when the key is present, `add` otherwise.
    pub fn put(&mut self, item: impl Into<T>) -> Result<(), BufferError> {
        if self.remember(item) {
            Ok(())
        } else {
            Err(BufferError::TableFull {
                name: self.name,
                capacity: self.capacity(),
            })
        }
    }
    /// occupied slots with their index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i, e)))
    }
}

impl<T: Keyed + Display> Display for HashTableBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}/{}) {{", self.name, self.size(), self.capacity())?;
        for (i, entry) in self.iter() {
            writeln!(f, "  {i:>3}: {entry}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pair(u64, i32);

    impl Keyed for Pair {
        fn key(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_probing_collisions() {
        let mut t = HashTableBuffer::<Pair>::new("table", 4);
        t.add(Pair(1, 10)).unwrap();
        t.add(Pair(5, 50)).unwrap();
        t.add(Pair(9, 90)).unwrap();
        assert_eq!(t.get(5), Some(&Pair(5, 50)));
        assert_eq!(t.get(9), Some(&Pair(9, 90)));
        assert_eq!(t.get(13), None);
        assert_eq!(t.iter().map(|(i, _)| i).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_update_and_full() {
        let mut t = HashTableBuffer::<Pair>::new("table", 2);
        assert_eq!(
            t.update(Pair(3, 0)),
            Err(BufferError::NotFound {
                name: "table",
                key: 3
            })
        );
        t.put(Pair(3, 1)).unwrap();
        t.put(Pair(3, 2)).unwrap();
        assert_eq!(t.get(3), Some(&Pair(3, 2)));
        assert_eq!(t.size(), 1);
        t.put(Pair(4, 4)).unwrap();
        assert!(t.get(7).is_none());
        assert!(!t.remember(Pair(6, 6)));
        assert!(t.remember(Pair(4, 5)));
        assert_eq!(
            t.add(Pair(8, 8)),
            Err(BufferError::TableFull {
                name: "table",
                capacity: 2
            })
        );
    }

    #[test]
    fn test_keys_stay_unique() {
        let mut t = HashTableBuffer::<Pair>::new("table", 8);
        for (k, v) in [(1, 1), (9, 2), (1, 3), (17, 4), (9, 5)] {
            t.put(Pair(k, v)).unwrap();
        }
        let mut keys: Vec<_> = t.iter().map(|(_, p)| p.0).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 9, 17]);
        assert_eq!(t.get(9), Some(&Pair(9, 5)));
    }
}
