use std::fmt::Display;

use bitmask_enum::bitmask;

use crate::register::{RegId, RegRef, RegisterError, Width, MAX_REG_ID, REGISTER_TABLE};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[cfg(feature = "stat")]
use stat::RegFileStat;

#[bitmask(u8)]
pub enum Flags {
    Sign,
    Zero,
    Parity,
}

impl Flags {
    /// flags describing `value`; parity is the parity of the full value.
    pub fn of(value: i64) -> Self {
        let mut flags = Flags::none();
        if value < 0 {
            flags |= Flags::Sign;
        }
        if value == 0 {
            flags |= Flags::Zero;
        }
        if value % 2 == 0 {
            flags |= Flags::Parity;
        }
        flags
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bit = |flag: Flags| u8::from(self.contains(flag));
        write!(
            f,
            "SF={} ZF={} PF={}",
            bit(Flags::Sign),
            bit(Flags::Zero),
            bit(Flags::Parity)
        )
    }
}

/// Either eight little-endian bytes or, for `mbr`/`cir`, an instruction token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    Bytes([u8; 8]),
    Text(String),
}

impl Default for RegValue {
    fn default() -> Self {
        RegValue::Bytes([0; 8])
    }
}

impl Display for RegValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegValue::Bytes(b) => write!(f, "{}", i64::from_le_bytes(*b)),
            RegValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

pub struct RegFile {
    inner: [RegValue; MAX_REG_ID],
    flags: Flags,
    #[cfg(feature = "stat")]
    stat: RegFileStat,
}

impl RegFile {
    pub fn new() -> Self {
        Self {
            inner: std::array::from_fn(|_| RegValue::default()),
            flags: Flags::none(),
            #[cfg(feature = "stat")]
            stat: RegFileStat::new(),
        }
    }
    /// reads the low `r.width` bytes, zero-extended.
    pub fn get(&self, r: RegRef) -> Result<u64, RegisterError> {
        #[cfg(feature = "stat")]
        self.stat.encounter_read(r.id.inner());
        match &self.inner[r.id.inner()] {
            RegValue::Bytes(b) => Ok(r.width.truncate(u64::from_le_bytes(*b))),
            RegValue::Text(_) => Err(RegisterError::NotNumeric(r.id)),
        }
    }
    pub fn get_i(&self, r: RegRef) -> Result<i64, RegisterError> {
        self.get(r).map(|v| v as i64)
    }
    /// overwrites the low `r.width` bytes, leaving the rest intact.
    pub fn set(&mut self, r: RegRef, val: u64) {
        #[cfg(feature = "stat")]
        self.stat.encounter_write(r.id.inner());
        let slot = &mut self.inner[r.id.inner()];
        let mut bytes = match slot {
            RegValue::Bytes(b) => *b,
            RegValue::Text(_) => [0; 8],
        };
        let n = r.width.bytes();
        bytes[..n].copy_from_slice(&val.to_le_bytes()[..n]);
        *slot = RegValue::Bytes(bytes);
    }
    pub fn get_text(&self, id: RegId) -> Option<&str> {
        match &self.inner[id.inner()] {
            RegValue::Text(s) => Some(s),
            RegValue::Bytes(_) => None,
        }
    }
    pub fn set_text(&mut self, id: RegId, text: impl Into<String>) {
        #[cfg(feature = "stat")]
        self.stat.encounter_write(id.inner());
        self.inner[id.inner()] = RegValue::Text(text.into());
    }
    pub fn value(&self, id: RegId) -> &RegValue {
        &self.inner[id.inner()]
    }
    pub fn flags(&self) -> Flags {
        self.flags
    }
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }
}

#[cfg(feature = "stat")]
impl AddStats for RegFile {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat.to_owned()));
    }
}

impl RegFile {
    pub fn get_view(&self, chunk_size: usize) -> RegFileView<'_> {
        RegFileView {
            r: self,
            chunk_size,
        }
    }
}

pub struct RegFileView<'a> {
    r: &'a RegFile,
    chunk_size: usize,
}

impl<'a> Display for RegFileView<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map: Vec<_> = REGISTER_TABLE
            .iter()
            .zip(self.r.inner.iter())
            .map(|(n, v)| format!("{n:>4}: {:>20}", v.to_string()))
            .collect();
        writeln!(f, "RegFile {{")?;
        for chunk in map.chunks(self.chunk_size.max(1)) {
            writeln!(f, "  {},", chunk.join(", "))?;
        }
        writeln!(f, "  flags: {}", self.r.flags)?;
        write!(f, "}}")
    }
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

/// shorthand for the accumulator at `width`.
pub fn acc(width: Width) -> RegRef {
    RegId::RAX.narrowed(width)
}

#[cfg(feature = "stat")]
mod stat {
    use std::{cell::RefCell, fmt};

    use super::*;
    use crate::stat::*;

    #[derive(Clone)]
    pub struct RegFileStat {
        write: [usize; MAX_REG_ID],
        read: RefCell<[usize; MAX_REG_ID]>,
    }

    impl RegFileStat {
        pub fn new() -> Self {
            Self {
                write: [0; MAX_REG_ID],
                read: RefCell::new([0; MAX_REG_ID]),
            }
        }
        pub fn encounter_write(&mut self, id: usize) {
            self.write[id] += 1;
        }
        pub fn encounter_read(&self, id: usize) {
            self.read.borrow_mut()[id] += 1;
        }
    }

    const CELL_WIDTH: usize = 27;

    impl Stat for RegFileStat {
        fn view(&self, max_width: usize) -> Box<dyn StatView + '_> {
            Box::new(RegFileStatView {
                stat: self,
                per_row: columns(CELL_WIDTH, max_width),
            })
        }
    }

    pub struct RegFileStatView<'a> {
        stat: &'a RegFileStat,
        per_row: usize,
    }

    impl StatView for RegFileStatView<'_> {
        fn header(&self) -> &'static str {
            "register load (format: `# of read / # of write`)"
        }
        fn width(&self) -> usize {
            self.per_row * CELL_WIDTH + (self.per_row - 1) * 2 + 2
        }
    }

    impl fmt::Display for RegFileStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let cells: Vec<_> = REGISTER_TABLE
                .iter()
                .zip(self.stat.read.borrow().iter())
                .zip(self.stat.write.iter())
                .map(|((n, r), w)| format!("{n:>4}:{r:>10} /{w:>10}"))
                .collect();
            write_rows(f, &cells, self.per_row)
        }
    }
}
