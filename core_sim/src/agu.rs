//! Address generation: evaluates memory operands like `[rbx+rcx*2+5]`.

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{multispace0, one_of},
    combinator::{all_consuming, map},
    multi::many1,
    sequence::delimited,
    IResult,
};
use thiserror::Error;

use crate::{reg_file::RegFile, register::RegRef};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AguError {
    #[error("malformed address expression `{expr}`: {reason}")]
    MalformedExpression { expr: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operator {
    fn precedence(self) -> u8 {
        match self {
            Operator::Add | Operator::Sub => 1,
            Operator::Mul | Operator::Div => 2,
        }
    }
    fn apply(self, a: i64, b: i64) -> Option<i64> {
        match self {
            Operator::Add => Some(a.wrapping_add(b)),
            Operator::Sub => Some(a.wrapping_sub(b)),
            Operator::Mul => Some(a.wrapping_mul(b)),
            Operator::Div => a.checked_div(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Operand(&'a str),
    Operator(Operator),
}

fn operand(input: &str) -> IResult<&str, Token<'_>> {
    map(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        Token::Operand,
    )(input)
}

fn operator(input: &str) -> IResult<&str, Token<'_>> {
    map(one_of("+-*/"), |c| {
        Token::Operator(match c {
            '+' => Operator::Add,
            '-' => Operator::Sub,
            '*' => Operator::Mul,
            _ => Operator::Div,
        })
    })(input)
}

fn tokenize(input: &str) -> IResult<&str, Vec<Token<'_>>> {
    all_consuming(many1(delimited(
        multispace0,
        alt((operand, operator)),
        multispace0,
    )))(input)
}

/// Operands and operators must alternate, starting and ending with an operand.
fn check_infix(tokens: &[Token<'_>]) -> Result<(), String> {
    for (i, token) in tokens.iter().enumerate() {
        match (i % 2 == 0, token) {
            (true, Token::Operator(_)) => return Err(format!("operator at token {i}")),
            (false, Token::Operand(s)) => return Err(format!("missing operator before `{s}`")),
            _ => {}
        }
    }
    if tokens.len() % 2 == 0 {
        return Err("missing operand".to_string());
    }
    Ok(())
}

/// Reorders infix tokens into postfix order; all operators are left-associative.
fn to_postfix(tokens: Vec<Token<'_>>) -> Vec<Token<'_>> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut ops: Vec<Operator> = Vec::new();
    for token in tokens {
        match token {
            Token::Operand(_) => output.push(token),
            Token::Operator(op) => {
                while let Some(&top) = ops.last() {
                    if top.precedence() < op.precedence() {
                        break;
                    }
                    output.push(Token::Operator(top));
                    ops.pop();
                }
                ops.push(op);
            }
        }
    }
    output.extend(ops.into_iter().rev().map(Token::Operator));
    output
}

/// Evaluates `expr` against a snapshot of the register file.
///
/// Operands are decimal literals or register names (with an optional width
/// suffix). Surrounding brackets are ignored and whitespace may appear
/// between tokens, but never inside one. Division truncates toward zero.
pub fn generate(expr: &str, regs: &RegFile) -> Result<i64, AguError> {
    let malformed = |reason: String| AguError::MalformedExpression {
        expr: expr.to_string(),
        reason,
    };
    let stripped = expr
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    let (_, tokens) = tokenize(stripped).map_err(|e| malformed(e.to_string()))?;
    check_infix(&tokens).map_err(malformed)?;

    let mut stack: Vec<i64> = Vec::new();
    for token in to_postfix(tokens) {
        match token {
            Token::Operand(s) => {
                let value = match s.parse::<i64>() {
                    Ok(v) => v,
                    Err(_) => {
                        let r = RegRef::try_from(s).map_err(|e| malformed(e.to_string()))?;
                        regs.get_i(r).map_err(|e| malformed(e.to_string()))?
                    }
                };
                stack.push(value);
            }
            Token::Operator(op) => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return Err(malformed("missing operand".to_string()));
                };
                let v = op
                    .apply(a, b)
                    .ok_or_else(|| malformed("division by zero".to_string()))?;
                stack.push(v);
            }
        }
    }
    match stack.as_slice() {
        [v] => Ok(*v),
        _ => Err(malformed("dangling operand".to_string())),
    }
}
