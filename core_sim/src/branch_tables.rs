use std::fmt;

use crate::hash_table::{HashTableBuffer, Keyed};

/// Stores `item` in a predictor table. A full table keeps its old entries
/// and the new one is dropped, so the branch is simply not learned.
pub fn learn<T: Keyed>(table: &mut HashTableBuffer<T>, item: impl Into<T>) {
    if !table.remember(item) {
        log::debug!("{} is full, entry dropped", table.name());
    }
}

/// Last known taken-target of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtbEntry {
    pub source: u64,
    pub destination: u64,
}

impl Keyed for BtbEntry {
    fn key(&self) -> u64 {
        self.source
    }
}

impl From<(u64, u64)> for BtbEntry {
    fn from((source, destination): (u64, u64)) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl fmt::Display for BtbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

pub type BranchTargetBuffer = HashTableBuffer<BtbEntry>;

pub fn new_btb(capacity: usize) -> BranchTargetBuffer {
    BranchTargetBuffer::new("branch target buffer", capacity)
}

/// Direction state kept per branch (or per history-hashed index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionEntry<C> {
    pub index: u64,
    pub certainty: C,
}

impl<C> Keyed for DirectionEntry<C> {
    fn key(&self) -> u64 {
        self.index
    }
}

impl<C> From<(u64, C)> for DirectionEntry<C> {
    fn from((index, certainty): (u64, C)) -> Self {
        Self { index, certainty }
    }
}

impl<C: fmt::Display> fmt::Display for DirectionEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.certainty)
    }
}

pub type DirectionBuffer<C> = HashTableBuffer<DirectionEntry<C>>;

pub fn new_direction_buffer<C>(capacity: usize) -> DirectionBuffer<C> {
    DirectionBuffer::new("direction buffer", capacity)
}

/// Last observed outcome, as kept by one-bit style predictors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastOutcome(pub bool);

impl fmt::Display for LastOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0 { "taken" } else { "not taken" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SaturatingCounter {
    StronglyUntaken,
    WeaklyUntaken,
    WeaklyTaken,
    StronglyTaken,
}

impl SaturatingCounter {
    /// state a fresh entry starts in after its first outcome.
    pub fn seeded(taken: bool) -> Self {
        if taken {
            SaturatingCounter::WeaklyTaken
        } else {
            SaturatingCounter::WeaklyUntaken
        }
    }

    pub fn next(self) -> Self {
        match self {
            SaturatingCounter::StronglyUntaken => SaturatingCounter::WeaklyUntaken,
            SaturatingCounter::WeaklyUntaken => SaturatingCounter::WeaklyTaken,
            SaturatingCounter::WeaklyTaken => SaturatingCounter::StronglyTaken,
            SaturatingCounter::StronglyTaken => SaturatingCounter::StronglyTaken,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SaturatingCounter::StronglyUntaken => SaturatingCounter::StronglyUntaken,
            SaturatingCounter::WeaklyUntaken => SaturatingCounter::StronglyUntaken,
            SaturatingCounter::WeaklyTaken => SaturatingCounter::WeaklyUntaken,
            SaturatingCounter::StronglyTaken => SaturatingCounter::WeaklyTaken,
        }
    }

    pub fn record(self, taken: bool) -> Self {
        if taken {
            self.next()
        } else {
            self.prev()
        }
    }

    pub fn predicts_taken(self) -> bool {
        self >= SaturatingCounter::WeaklyTaken
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SaturatingCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates() {
        let mut c = SaturatingCounter::seeded(true);
        assert_eq!(c.level(), 2);
        for _ in 0..5 {
            c = c.record(true);
        }
        assert_eq!(c, SaturatingCounter::StronglyTaken);
        c = c.record(false);
        assert!(c.predicts_taken());
        c = c.record(false);
        assert!(!c.predicts_taken());
        for _ in 0..5 {
            c = c.record(false);
        }
        assert_eq!(c.level(), 0);
        assert_eq!(SaturatingCounter::seeded(false).level(), 1);
    }

    #[test]
    fn test_btb_lookup() {
        let mut btb = new_btb(4);
        btb.add((3u64, 9u64)).unwrap();
        btb.update((3u64, 11u64)).unwrap();
        assert_eq!(btb.get(3).map(|e| e.destination), Some(11));
        assert!(!btb.contains(7));
    }
}
