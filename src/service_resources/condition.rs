//! Condition expressions
//!
//! Used by conditional dependencies and conditional attribute requirements.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | "(" expr ")" | comparison
//! comparison := operand ( op operand )?
//! op         := "==" | "!=" | ">=" | "<=" | ">" | "<" | "in" | "contains"
//! operand    := string | number | "true" | "false" | "null" | list | path
//! path       := ident ( "." ident )*
//! ```
//!
//! Paths resolve against a JSON context with the roots `options`, `params`,
//! `cbu` and `entity`. A missing path resolves to `null`.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, multispace0, satisfy},
    combinator::{map, not, opt, peek, recognize, value},
    error::{convert_error, VerboseError},
    multi::{many0, separated_list0, separated_list1},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated},
    Finish, IResult,
};
use serde_json::{json, Value as JsonValue};
use std::cmp::Ordering;
use thiserror::Error;

use super::types::{CbuFacts, IntentOptions, ResourceParameters};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("empty condition expression")]
    Empty,

    #[error("invalid condition '{expression}': {message}")]
    Parse { expression: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(Vec<String>),
    Literal(JsonValue),
    List(Vec<Operand>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Vec<Condition>),
    And(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Truthy(Operand),
}

// =============================================================================
// PARSER
// =============================================================================

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A word that is not the prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> ParseResult<'a, &'a str> {
    terminated(tag(word), not(peek(satisfy(is_ident_char))))
}

fn parse_ident(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn parse_path(input: &str) -> ParseResult<'_, Vec<String>> {
    map(separated_list1(char('.'), parse_ident), |parts| {
        parts.into_iter().map(String::from).collect()
    })(input)
}

fn parse_string(input: &str) -> ParseResult<'_, String> {
    map(
        alt((
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
        )),
        String::from,
    )(input)
}

fn parse_number(input: &str) -> ParseResult<'_, JsonValue> {
    map(
        preceded(peek(satisfy(|c: char| c.is_ascii_digit() || c == '-')), double),
        |n| {
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                json!(n as i64)
            } else {
                json!(n)
            }
        },
    )(input)
}

fn parse_list(input: &str) -> ParseResult<'_, Vec<Operand>> {
    delimited(
        ws(char('[')),
        separated_list0(ws(char(',')), ws(parse_operand)),
        ws(char(']')),
    )(input)
}

fn parse_operand(input: &str) -> ParseResult<'_, Operand> {
    alt((
        map(parse_string, |s| Operand::Literal(JsonValue::String(s))),
        value(Operand::Literal(JsonValue::Bool(true)), keyword("true")),
        value(Operand::Literal(JsonValue::Bool(false)), keyword("false")),
        value(Operand::Literal(JsonValue::Null), keyword("null")),
        map(parse_number, Operand::Literal),
        map(parse_list, Operand::List),
        map(parse_path, Operand::Path),
    ))(input)
}

fn parse_op(input: &str) -> ParseResult<'_, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::In, keyword("in")),
        value(CompareOp::Contains, keyword("contains")),
    ))(input)
}

fn parse_comparison(input: &str) -> ParseResult<'_, Condition> {
    let (input, left) = ws(parse_operand)(input)?;
    let (input, tail) = opt(pair(ws(parse_op), ws(parse_operand)))(input)?;
    let condition = match tail {
        Some((op, right)) => Condition::Compare { left, op, right },
        None => Condition::Truthy(left),
    };
    Ok((input, condition))
}

fn parse_unary(input: &str) -> ParseResult<'_, Condition> {
    alt((
        map(preceded(ws(char('!')), parse_unary), |c| {
            Condition::Not(Box::new(c))
        }),
        delimited(ws(char('(')), parse_or, ws(char(')'))),
        parse_comparison,
    ))(input)
}

fn parse_and(input: &str) -> ParseResult<'_, Condition> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), parse_unary))(input)?;
    Ok((input, fold(first, rest, Condition::And)))
}

fn parse_or(input: &str) -> ParseResult<'_, Condition> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), parse_and))(input)?;
    Ok((input, fold(first, rest, Condition::Or)))
}

fn fold(first: Condition, rest: Vec<Condition>, combine: fn(Vec<Condition>) -> Condition) -> Condition {
    if rest.is_empty() {
        first
    } else {
        let mut all = Vec::with_capacity(rest.len() + 1);
        all.push(first);
        all.extend(rest);
        combine(all)
    }
}

/// Parse a condition expression.
pub fn parse_condition(expression: &str) -> Result<Condition, ConditionError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(ConditionError::Empty);
    }
    match parse_or(trimmed).finish() {
        Ok((rest, condition)) if rest.trim().is_empty() => Ok(condition),
        Ok((rest, _)) => Err(ConditionError::Parse {
            expression: expression.to_string(),
            message: format!("unexpected trailing input '{}'", rest),
        }),
        Err(e) => Err(ConditionError::Parse {
            expression: expression.to_string(),
            message: convert_error(trimmed, e),
        }),
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Build the evaluation context for one requirement.
pub fn condition_context(
    options: &IntentOptions,
    params: &ResourceParameters,
    facts: &CbuFacts,
) -> JsonValue {
    json!({
        "options": options,
        "params": params,
        "cbu": facts.cbu,
        "entity": facts.entity,
    })
}

impl Condition {
    pub fn evaluate(&self, ctx: &JsonValue) -> bool {
        match self {
            Self::Or(items) => items.iter().any(|c| c.evaluate(ctx)),
            Self::And(items) => items.iter().all(|c| c.evaluate(ctx)),
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::Truthy(operand) => is_truthy(&operand.resolve(ctx)),
            Self::Compare { left, op, right } => op.apply(&left.resolve(ctx), &right.resolve(ctx)),
        }
    }
}

impl Operand {
    fn resolve(&self, ctx: &JsonValue) -> JsonValue {
        match self {
            Self::Literal(v) => v.clone(),
            Self::List(items) => JsonValue::Array(items.iter().map(|i| i.resolve(ctx)).collect()),
            Self::Path(parts) => {
                let mut current = ctx;
                for part in parts {
                    match current.get(part.as_str()) {
                        Some(next) => current = next,
                        None => return JsonValue::Null,
                    }
                }
                current.clone()
            }
        }
    }
}

impl CompareOp {
    fn apply(self, left: &JsonValue, right: &JsonValue) -> bool {
        match self {
            Self::Eq => json_eq(left, right),
            Self::Ne => !json_eq(left, right),
            Self::Gt => ordering(left, right) == Some(Ordering::Greater),
            Self::Ge => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => ordering(left, right) == Some(Ordering::Less),
            Self::Le => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
            Self::In => match right {
                JsonValue::Array(items) => items.iter().any(|i| json_eq(left, i)),
                JsonValue::String(haystack) => left.as_str().is_some_and(|n| haystack.contains(n)),
                _ => false,
            },
            Self::Contains => Self::In.apply(right, left),
        }
    }
}

fn json_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn ordering(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(l), JsonValue::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (JsonValue::String(l), JsonValue::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}
