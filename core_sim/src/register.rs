use std::{collections::HashMap, fmt::Display};

use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct RegId(u8);

impl RegId {
    pub const RAX: RegId = RegId(0);
    pub const RBX: RegId = RegId(1);
    pub const RCX: RegId = RegId(2);
    pub const RDX: RegId = RegId(3);
    pub const RSI: RegId = RegId(4);
    pub const RDI: RegId = RegId(5);
    pub const CS: RegId = RegId(16);
    pub const DS: RegId = RegId(17);
    pub const RIP: RegId = RegId(18);
    pub const MAR: RegId = RegId(19);
    pub const MBR: RegId = RegId(20);
    pub const CIR: RegId = RegId(21);

    pub fn inner(&self) -> usize {
        self.0 as usize
    }
    /// pipeline registers are not addressable by programs.
    pub fn is_internal(&self) -> bool {
        self.0 >= Self::RIP.0
    }
    /// full-width reference to this register.
    pub fn full(self) -> RegRef {
        RegRef::new(self, Width::Quad)
    }
    pub fn narrowed(self, width: Width) -> RegRef {
        RegRef::new(self, width)
    }
}

pub const MAX_REG_ID: usize = 22;

pub static REGISTER_TABLE: [&str; MAX_REG_ID] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "cs", "ds", "rip", "mar", "mbr", "cir",
];

pub static REGISTER_LOOKUP: Lazy<HashMap<&str, RegId>> = Lazy::new(|| {
    REGISTER_TABLE
        .iter()
        .enumerate()
        .map(|(i, n)| (*n, RegId(i as u8)))
        .collect()
});

impl Display for RegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REGISTER_TABLE[self.0 as usize])
    }
}

impl TryFrom<&str> for RegId {
    type Error = RegisterError;
    fn try_from(name: &str) -> Result<Self, Self::Error> {
        REGISTER_LOOKUP
            .get(name)
            .copied()
            .ok_or_else(|| RegisterError::UnknownRegister(name.to_string()))
    }
}

/// Number of low-order bytes an access touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Long = 4,
    #[default]
    Quad = 8,
}

impl Width {
    pub fn bytes(self) -> usize {
        self as usize
    }
    pub fn from_suffix(c: char) -> Option<Self> {
        match c {
            'b' => Some(Width::Byte),
            'w' => Some(Width::Word),
            'l' => Some(Width::Long),
            'q' => Some(Width::Quad),
            _ => None,
        }
    }
    pub fn suffix(self) -> char {
        match self {
            Width::Byte => 'b',
            Width::Word => 'w',
            Width::Long => 'l',
            Width::Quad => 'q',
        }
    }
    /// zero-extends the low bytes of `value`.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Width::Quad => value,
            w => value & ((1u64 << (w.bytes() * 8)) - 1),
        }
    }
}

impl Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// A register name as written in an operand, e.g. `rbxb` or `rip`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct RegRef {
    pub id: RegId,
    pub width: Width,
}

impl RegRef {
    pub fn new(id: RegId, width: Width) -> Self {
        Self { id, width }
    }
}

impl TryFrom<&str> for RegRef {
    type Error = RegisterError;
    fn try_from(name: &str) -> Result<Self, Self::Error> {
        if let Ok(id) = RegId::try_from(name) {
            return Ok(id.full());
        }
        let mut chars = name.chars();
        let width = chars
            .next_back()
            .and_then(Width::from_suffix)
            .ok_or_else(|| RegisterError::UnknownRegister(name.to_string()))?;
        let id = RegId::try_from(chars.as_str())
            .map_err(|_| RegisterError::UnknownRegister(name.to_string()))?;
        Ok(Self { id, width })
    }
}

impl Display for RegRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.width {
            Width::Quad => write!(f, "{}", self.id),
            w => write!(f, "{}{}", self.id, w.suffix()),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    #[error("unknown register `{0}`")]
    UnknownRegister(String),
    #[error("register {0} holds an instruction token, not a number")]
    NotNumeric(RegId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffix() {
        assert_eq!(RegRef::try_from("rax").unwrap(), RegId::RAX.full());
        assert_eq!(
            RegRef::try_from("rbxb").unwrap(),
            RegId::RBX.narrowed(Width::Byte)
        );
        assert_eq!(
            RegRef::try_from("ripb").unwrap(),
            RegId::RIP.narrowed(Width::Byte)
        );
        let r8w = RegRef::try_from("r8w").unwrap();
        assert_eq!(r8w.width, Width::Word);
        assert_eq!(format!("{r8w}"), "r8w");
        assert!(RegRef::try_from("raxz").is_err());
        assert!(RegRef::try_from("foo").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(Width::Byte.truncate(0x1234), 0x34);
        assert_eq!(Width::Long.truncate(u64::MAX), 0xFFFF_FFFF);
        assert_eq!(Width::Quad.truncate(u64::MAX), u64::MAX);
    }
}
