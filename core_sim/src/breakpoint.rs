use std::fmt::Display;

use crate::instr::{MicroOp, MicroOpcode};

pub struct BreakPoint {
    pub id: usize,
    pub cond: BreakPointCond,
}

impl BreakPoint {
    pub fn new(id: usize, cond: BreakPointCond) -> Self {
        Self { id, cond }
    }
    /// whether the cycle numbered `cycle`, which executed `executed`, stops here.
    pub fn hits(&self, cycle: usize, executed: Option<&MicroOp>) -> bool {
        match &self.cond {
            BreakPointCond::Cycle(c) => *c == cycle,
            BreakPointCond::Opcode(op) => executed.map_or(false, |m| m.opcode == *op),
            BreakPointCond::Operand(s) => {
                executed.map_or(false, |m| m.operand.to_string() == *s)
            }
        }
    }
}

impl Display for BreakPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}: {}", self.id, self.cond)
    }
}

pub enum BreakPointCond {
    Opcode(MicroOpcode),
    Operand(String),
    Cycle(usize),
}

impl Display for BreakPointCond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakPointCond::Opcode(op) => write!(f, "opcode {op}"),
            BreakPointCond::Operand(s) => write!(f, "operand {s}"),
            BreakPointCond::Cycle(c) => write!(f, "cycle #{c}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{instr::Operand, register::Width};

    #[test]
    fn test_hits() {
        let op = MicroOp::new(MicroOpcode::Load, Operand::Immediate(5), Width::Quad, false);
        let by_opcode = BreakPoint::new(0, BreakPointCond::Opcode(MicroOpcode::Load));
        let by_operand = BreakPoint::new(1, BreakPointCond::Operand("5".to_string()));
        let by_cycle = BreakPoint::new(2, BreakPointCond::Cycle(3));
        assert!(by_opcode.hits(0, Some(&op)));
        assert!(!by_opcode.hits(0, None));
        assert!(by_operand.hits(0, Some(&op)));
        assert!(by_cycle.hits(3, None));
        assert!(!by_cycle.hits(4, Some(&op)));
    }
}
