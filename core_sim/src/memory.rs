use std::{fmt::Display, ops::Range};

#[cfg(feature = "stat")]
use std::cell::RefCell;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Addr(usize);

impl Addr {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn inner(self) -> usize {
        self.0
    }
    pub fn disp(&self, amount: usize) -> Self {
        Self(self.0 + amount)
    }
}

impl TryFrom<i64> for Addr {
    type Error = MemoryAccessError;
    fn try_from(v: i64) -> Result<Self> {
        usize::try_from(v)
            .map(Addr)
            .map_err(|_| MemoryAccessError::NegativeAddress { address: v })
    }
}

impl TryFrom<u64> for Addr {
    type Error = MemoryAccessError;
    fn try_from(v: u64) -> Result<Self> {
        Addr::try_from(v as i64)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// One memory cell: a data word, or an instruction token in the text section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Word(i64),
    Token(String),
}

impl Default for Cell {
    fn default() -> Self {
        Cell::Word(0)
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Word(w) => write!(f, "{w}"),
            Cell::Token(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryAccessError {
    #[error("address {accessed_address} out of range for memory of {size} cells")]
    OutOfBounds {
        accessed_address: usize,
        size: usize,
    },
    #[error("negative address {address}")]
    NegativeAddress { address: i64 },
    #[error("expected a data word at {addr}, found instruction `{found}`")]
    NotAWord { addr: Addr, found: String },
    #[error("expected an instruction at {addr}, found word {found}")]
    NotAToken { addr: Addr, found: i64 },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

pub struct Memory {
    inner: Vec<Cell>,
    text: Range<usize>,
    #[cfg(feature = "stat")]
    stat: RefCell<stat::MemoryStat>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: vec![Cell::default(); size],
            text: 0..0,
            #[cfg(feature = "stat")]
            stat: RefCell::default(),
        }
    }
    /// copies `cells` to the bottom of memory; `text` marks the instruction cells.
    pub fn init_from_slice(&mut self, cells: &[Cell], text: Range<usize>) -> Result<()> {
        if cells.len() > self.inner.len() {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: cells.len() - 1,
                size: self.inner.len(),
            });
        }
        self.inner[..cells.len()].clone_from_slice(cells);
        self.text = text;
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    pub fn text_range(&self) -> Range<usize> {
        self.text.clone()
    }
    fn bounds_check(&self, addr: Addr) -> Result<usize> {
        if addr.0 >= self.inner.len() {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: addr.0,
                size: self.inner.len(),
            });
        }
        Ok(addr.0)
    }
    pub fn get(&self, addr: Addr) -> Result<&Cell> {
        let index = self.bounds_check(addr)?;
        #[cfg(feature = "stat")]
        self.stat.borrow_mut().on_read(self.text.contains(&index));
        Ok(&self.inner[index])
    }
    pub fn get_word(&self, addr: Addr) -> Result<i64> {
        match self.get(addr)? {
            Cell::Word(w) => Ok(*w),
            Cell::Token(t) => Err(MemoryAccessError::NotAWord {
                addr,
                found: t.clone(),
            }),
        }
    }
    pub fn get_token(&self, addr: Addr) -> Result<&str> {
        match self.get(addr)? {
            Cell::Token(t) => Ok(t),
            Cell::Word(w) => Err(MemoryAccessError::NotAToken { addr, found: *w }),
        }
    }
    pub fn set(&mut self, addr: Addr, cell: Cell) -> Result<()> {
        let index = self.bounds_check(addr)?;
        #[cfg(feature = "stat")]
        self.stat.borrow_mut().on_write(self.text.contains(&index));
        self.inner[index] = cell;
        Ok(())
    }
    /// cells in `[start, start + len)`, without touching the access counters.
    pub fn slice(&self, start: Addr, len: usize) -> Result<&[Cell]> {
        let end = start.0.saturating_add(len);
        if end > self.inner.len() {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: end.saturating_sub(1),
                size: self.inner.len(),
            });
        }
        Ok(&self.inner[start.0..end])
    }
    pub fn get_view(&self, start: Addr, len: usize) -> MemoryView<'_> {
        let start = start.0.min(self.inner.len());
        let end = start.saturating_add(len).min(self.inner.len());
        MemoryView {
            m: self,
            range: start..end,
        }
    }
}

pub struct MemoryView<'a> {
    m: &'a Memory,
    range: Range<usize>,
}

impl Display for MemoryView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in self.range.clone() {
            let marker = if self.m.text.contains(&i) { 't' } else { 'd' };
            writeln!(f, "{:>6} {marker} {}", Addr(i), self.m.inner[i])?;
        }
        Ok(())
    }
}

#[cfg(feature = "stat")]
impl AddStats for Memory {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat.borrow().clone()));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Default, Clone)]
    pub struct MemoryStat {
        text_read: usize,
        text_write: usize,
        data_read: usize,
        data_write: usize,
    }

    impl MemoryStat {
        pub fn on_read(&mut self, in_text: bool) {
            if in_text {
                self.text_read += 1;
            } else {
                self.data_read += 1;
            }
        }
        pub fn on_write(&mut self, in_text: bool) {
            if in_text {
                self.text_write += 1;
            } else {
                self.data_write += 1;
            }
        }
    }

    impl Stat for MemoryStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(MemoryStatView { stat: self })
        }
    }

    pub struct MemoryStatView<'a> {
        stat: &'a MemoryStat,
    }

    impl StatView for MemoryStatView<'_> {
        fn header(&self) -> &'static str {
            "memory access (format: `# of read / # of write`)"
        }
        fn width(&self) -> usize {
            31
        }
    }

    impl fmt::Display for MemoryStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = self.stat;
            writeln!(f, "  text: {:>10} / {:>10}", s.text_read, s.text_write)?;
            writeln!(f, "  data: {:>10} / {:>10}", s.data_read, s.data_write)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Memory {
        let mut m = Memory::new(8);
        m.init_from_slice(
            &[
                Cell::Token("mov rax 5".into()),
                Cell::Token("syscall".into()),
                Cell::Word(42),
            ],
            0..2,
        )
        .unwrap();
        m
    }

    #[test]
    fn test_typed_access() {
        let m = sample();
        assert_eq!(m.get_token(Addr::new(0)).unwrap(), "mov rax 5");
        assert_eq!(m.get_word(Addr::new(2)).unwrap(), 42);
        assert_eq!(m.get_word(Addr::new(3)).unwrap(), 0);
        assert!(matches!(
            m.get_word(Addr::new(1)),
            Err(MemoryAccessError::NotAWord { .. })
        ));
    }

    #[test]
    fn test_bounds() {
        let mut m = sample();
        assert_eq!(
            m.set(Addr::new(8), Cell::Word(1)),
            Err(MemoryAccessError::OutOfBounds {
                accessed_address: 8,
                size: 8
            })
        );
        assert!(Addr::try_from(-1i64).is_err());
        assert!(m.slice(Addr::new(6), 3).is_err());
        assert_eq!(m.slice(Addr::new(1), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_too_large_image() {
        let mut m = Memory::new(1);
        assert!(m
            .init_from_slice(&[Cell::Word(1), Cell::Word(2)], 0..0)
            .is_err());
    }
}
