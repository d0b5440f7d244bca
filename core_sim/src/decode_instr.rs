use thiserror::Error;

use crate::{
    instr::{Condition, MicroOp, MicroOpcode, Operand},
    register::{RegRef, Width},
};

/// longest micro-op group a single instruction expands into.
pub const MAX_GROUP_LEN: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode found: `{0}`")]
    InvalidOpcode(String),
    #[error("`{mnemonic}` takes {expected} operand(s), found {found}")]
    OperandCount {
        mnemonic: String,
        expected: usize,
        found: usize,
    },
    #[error("malformed operand `{0}`")]
    MalformedOperand(String),
    #[error("`{0}` cannot be written to")]
    InvalidDestination(String),
}

impl Operand {
    pub fn parse(token: &str) -> Result<Self, DecodeError> {
        if let Some(expr) = token.strip_prefix('[') {
            return expr
                .strip_suffix(']')
                .filter(|e| !e.is_empty())
                .map(|e| Operand::Memory(e.to_string()))
                .ok_or_else(|| DecodeError::MalformedOperand(token.to_string()));
        }
        if let Ok(imm) = token.parse::<i64>() {
            return Ok(Operand::Immediate(imm));
        }
        RegRef::try_from(token)
            .map(Operand::Register)
            .map_err(|_| DecodeError::MalformedOperand(token.to_string()))
    }
}

fn destination(token: &str) -> Result<Operand, DecodeError> {
    match Operand::parse(token)? {
        Operand::Immediate(_) => Err(DecodeError::InvalidDestination(token.to_string())),
        Operand::Register(r) if r.id.is_internal() => {
            Err(DecodeError::InvalidDestination(token.to_string()))
        }
        op => Ok(op),
    }
}

/// narrowest register suffix among the operands; full width when none.
fn operand_width(operands: &[Operand]) -> Width {
    operands
        .iter()
        .filter_map(|op| match op {
            Operand::Register(r) => Some(r.width),
            _ => None,
        })
        .min()
        .unwrap_or(Width::Quad)
}

/// Expands one macro-instruction token into its micro-op group.
///
/// `speculative` is copied onto every micro-op of the group.
pub fn decode(token: &str, speculative: bool) -> Result<Vec<MicroOp>, DecodeError> {
    use MicroOpcode::*;

    let mut words = token
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|w| !w.is_empty());
    let mnemonic = words
        .next()
        .ok_or_else(|| DecodeError::InvalidOpcode(token.to_string()))?
        .to_ascii_lowercase();
    let raw: Vec<&str> = words.collect();
    let arity = |expected: usize| {
        if raw.len() == expected {
            Ok(())
        } else {
            Err(DecodeError::OperandCount {
                mnemonic: mnemonic.clone(),
                expected,
                found: raw.len(),
            })
        }
    };

    let (group, width) = match mnemonic.as_str() {
        "mov" => {
            arity(2)?;
            let ops = [destination(raw[0])?, Operand::parse(raw[1])?];
            let width = operand_width(&ops);
            let [dst, src] = ops;
            (vec![(Load, src), (Sto, dst)], width)
        }
        "cmp" => {
            arity(2)?;
            let ops = [Operand::parse(raw[0])?, Operand::parse(raw[1])?];
            let width = operand_width(&ops);
            let [a, b] = ops;
            (vec![(Load, b), (Cmp, a)], width)
        }
        "inc" | "dec" => {
            arity(1)?;
            let target = destination(raw[0])?;
            let width = operand_width(std::slice::from_ref(&target));
            let step = if mnemonic == "inc" { Add } else { Sub };
            (
                vec![
                    (Load, target.clone()),
                    (step, Operand::Immediate(1)),
                    (Sto, target),
                ],
                width,
            )
        }
        "syscall" => {
            arity(0)?;
            (vec![(Syscall, Operand::None)], Width::Quad)
        }
        "noop" | "nop" => {
            arity(0)?;
            (vec![(Noop, Operand::None)], Width::Quad)
        }
        jump if jump.starts_with('j') => {
            let cond = Condition::from_suffix(&jump[1..])
                .ok_or_else(|| DecodeError::InvalidOpcode(mnemonic.clone()))?;
            arity(1)?;
            let target = Operand::parse(raw[0])?;
            let width = operand_width(std::slice::from_ref(&target));
            (
                vec![(Load, target), (Jmp, Operand::Condition(cond))],
                width,
            )
        }
        _ => return Err(DecodeError::InvalidOpcode(mnemonic.clone())),
    };

    Ok(group
        .into_iter()
        .map(|(opcode, operand)| MicroOp::new(opcode, operand, width, speculative))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegId;

    fn shape(group: &[MicroOp]) -> Vec<(MicroOpcode, Operand)> {
        group
            .iter()
            .map(|m| (m.opcode, m.operand.clone()))
            .collect()
    }

    #[test]
    fn test_mov() {
        let g = decode("mov rax 5", false).unwrap();
        assert_eq!(
            shape(&g),
            vec![
                (MicroOpcode::Load, Operand::Immediate(5)),
                (MicroOpcode::Sto, Operand::Register(RegId::RAX.full())),
            ]
        );
        assert!(g.iter().all(|m| m.width == Width::Quad && !m.speculative));
    }

    #[test]
    fn test_width_from_suffix() {
        let g = decode("mov [rbx+1], rcxb", true).unwrap();
        assert_eq!(g[0].operand, Operand::Register(RegId::RCX.narrowed(Width::Byte)));
        assert_eq!(g[1].operand, Operand::Memory("rbx+1".to_string()));
        assert!(g.iter().all(|m| m.width == Width::Byte && m.speculative));
        let g = decode("cmp raxw rbxl", false).unwrap();
        assert_eq!(g[0].width, Width::Word);
    }

    #[test]
    fn test_expansions() {
        let jl = decode("jl 6", false).unwrap();
        assert_eq!(
            shape(&jl),
            vec![
                (MicroOpcode::Load, Operand::Immediate(6)),
                (MicroOpcode::Jmp, Operand::Condition(Condition::Less)),
            ]
        );
        let cmp = decode("cmp rbx 3", false).unwrap();
        assert_eq!(
            shape(&cmp),
            vec![
                (MicroOpcode::Load, Operand::Immediate(3)),
                (MicroOpcode::Cmp, Operand::Register(RegId::RBX.full())),
            ]
        );
        let inc = decode("inc rcx", false).unwrap();
        assert_eq!(inc.len(), MAX_GROUP_LEN);
        assert_eq!(inc[1].opcode, MicroOpcode::Add);
        assert_eq!(decode("dec rcx", false).unwrap()[1].opcode, MicroOpcode::Sub);
        assert_eq!(decode("syscall", false).unwrap().len(), 1);
        assert_eq!(decode("noop", false).unwrap()[0].opcode, MicroOpcode::Noop);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            decode("push rax", false),
            Err(DecodeError::InvalidOpcode("push".to_string()))
        );
        assert_eq!(
            decode("jz 4", false),
            Err(DecodeError::InvalidOpcode("jz".to_string()))
        );
        assert!(matches!(
            decode("mov rax", false),
            Err(DecodeError::OperandCount { expected: 2, found: 1, .. })
        ));
        assert_eq!(
            decode("mov 5 rax", false),
            Err(DecodeError::InvalidDestination("5".to_string()))
        );
        assert_eq!(
            decode("mov rax [rbx", false),
            Err(DecodeError::MalformedOperand("[rbx".to_string()))
        );
        assert!(decode("", false).is_err());
    }
}
