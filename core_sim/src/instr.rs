use std::{fmt, str::FromStr};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    reg_file::Flags,
    register::{RegRef, Width},
};

/// Opcodes of the internal micro-instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MicroOpcode {
    Load,
    Sto,
    Add,
    Sub,
    Cmp,
    Jmp,
    Syscall,
    Noop,
}

impl MicroOpcode {
    pub const COUNT: usize = 8;
    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}

impl fmt::Display for MicroOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MicroOpcode::Load => "LOAD",
            MicroOpcode::Sto => "STO",
            MicroOpcode::Add => "ADD",
            MicroOpcode::Sub => "SUB",
            MicroOpcode::Cmp => "CMP",
            MicroOpcode::Jmp => "JMP",
            MicroOpcode::Syscall => "SYSCALL",
            MicroOpcode::Noop => "NOOP",
        };
        f.write_str(s)
    }
}

impl FromStr for MicroOpcode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        (0..Self::COUNT as u8)
            .filter_map(|i| MicroOpcode::try_from(i).ok())
            .find(|op| op.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown micro-opcode `{s}`"))
    }
}

/// Branch condition, named by the mnemonic suffix after `j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Always,
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
}

impl Condition {
    pub fn from_suffix(s: &str) -> Option<Self> {
        Some(match s {
            "mp" => Condition::Always,
            "e" => Condition::Equal,
            "ne" => Condition::NotEqual,
            "g" => Condition::Greater,
            "l" => Condition::Less,
            "ge" => Condition::GreaterEqual,
            "le" => Condition::LessEqual,
            _ => return None,
        })
    }
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::Always => "mp",
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::Greater => "g",
            Condition::Less => "l",
            Condition::GreaterEqual => "ge",
            Condition::LessEqual => "le",
        }
    }
    /// `cmp a, b` leaves `b - a` in the flags, so `g` tests the sign bit.
    pub fn is_met(self, flags: Flags) -> bool {
        let sf = flags.contains(Flags::Sign);
        let zf = flags.contains(Flags::Zero);
        match self {
            Condition::Always => true,
            Condition::Equal => zf,
            Condition::NotEqual => !zf,
            Condition::Greater => sf,
            Condition::Less => !sf,
            Condition::GreaterEqual => sf || zf,
            Condition::LessEqual => !sf || zf,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(RegRef),
    /// address expression with the brackets stripped
    Memory(String),
    Immediate(i64),
    Condition(Condition),
    None,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{r}"),
            Operand::Memory(e) => write!(f, "[{e}]"),
            Operand::Immediate(i) => write!(f, "{i}"),
            Operand::Condition(c) => write!(f, "{c}"),
            Operand::None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroOp {
    pub opcode: MicroOpcode,
    pub operand: Operand,
    pub width: Width,
    /// fetched on a predicted-taken path
    pub speculative: bool,
}

impl MicroOp {
    pub fn new(opcode: MicroOpcode, operand: Operand, width: Width, speculative: bool) -> Self {
        Self {
            opcode,
            operand,
            width,
            speculative,
        }
    }
}

impl fmt::Display for MicroOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        if self.width != Width::Quad {
            write!(f, " ({}B)", self.width)?;
        }
        if self.speculative {
            write!(f, " *")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions() {
        let greater = Flags::Sign;
        assert!(Condition::Greater.is_met(greater));
        assert!(!Condition::Less.is_met(greater));
        assert!(Condition::GreaterEqual.is_met(greater));
        let equal = Flags::Zero | Flags::Parity;
        assert!(Condition::Equal.is_met(equal));
        assert!(Condition::LessEqual.is_met(equal));
        assert!(!Condition::NotEqual.is_met(equal));
        assert!(Condition::Always.is_met(Flags::none()));
        assert_eq!(Condition::from_suffix("ge"), Some(Condition::GreaterEqual));
        assert_eq!(Condition::from_suffix("z"), None);
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!("jmp".parse::<MicroOpcode>(), Ok(MicroOpcode::Jmp));
        assert_eq!("SYSCALL".parse::<MicroOpcode>(), Ok(MicroOpcode::Syscall));
        assert!("mov".parse::<MicroOpcode>().is_err());
        assert_eq!(MicroOpcode::Noop.index(), MicroOpcode::COUNT - 1);
    }
}
