//! Variable mappings and sequence-flow conditions.
//!
//! An expression is either a JSON literal (`42`, `"text"`, `{"a": 1}`) or a variable
//! path such as `order.items[0].price`. Mapping targets are dotted paths without
//! indexes; nested targets merge into the existing value of the root variable.

use nom::{
    branch::alt,
    bytes::complete::take_while,
    character::complete::{char, digit1, satisfy},
    combinator::{all_consuming, map, map_res, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("failed to evaluate expression '{expression}': no variable found with name '{name}'")]
    VariableNotFound { expression: String, name: String },

    #[error("failed to evaluate expression '{expression}': '{segment}' not found")]
    PathNotFound { expression: String, segment: String },

    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("invalid mapping target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

// ── Mapping / condition definitions ──

/// `source` is evaluated in the element scope; the result is written to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">=")]
    Gte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub op: ConditionOp,
    pub value: Value,
}

// ── Paths ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePath {
    pub root: String,
    pub segments: Vec<PathSegment>,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
    ))(input)
}

fn field(input: &str) -> IResult<&str, PathSegment> {
    map(preceded(char('.'), identifier), |name: &str| {
        PathSegment::Field(name.to_string())
    })(input)
}

fn index(input: &str) -> IResult<&str, PathSegment> {
    map_res(delimited(char('['), digit1, char(']')), |digits: &str| {
        digits.parse::<usize>().map(PathSegment::Index)
    })(input)
}

fn path(input: &str) -> IResult<&str, (&str, Vec<PathSegment>)> {
    all_consuming(pair(identifier, many0(alt((field, index)))))(input)
}

impl VariablePath {
    pub fn parse(input: &str) -> Result<Self, MappingError> {
        let trimmed = input.trim();
        let (_, (root, segments)) = path(trimmed).map_err(|e| {
            let at = match e {
                nom::Err::Error(e) | nom::Err::Failure(e) => e.input,
                nom::Err::Incomplete(_) => "",
            };
            let reason = if trimmed.is_empty() {
                "empty path".to_string()
            } else {
                format!("unexpected '{at}' at offset {}", trimmed.len() - at.len())
            };
            MappingError::InvalidExpression {
                expression: input.to_string(),
                reason,
            }
        })?;
        Ok(Self {
            root: root.to_string(),
            segments,
        })
    }

    /// Parses a mapping target: a dotted path without indexes.
    pub fn parse_target(input: &str) -> Result<Self, MappingError> {
        let path = Self::parse(input).map_err(|e| MappingError::InvalidTarget {
            target: input.to_string(),
            reason: e.to_string(),
        })?;
        if path
            .segments
            .iter()
            .any(|s| matches!(s, PathSegment::Index(_)))
        {
            return Err(MappingError::InvalidTarget {
                target: input.to_string(),
                reason: "indexes are not allowed in targets".to_string(),
            });
        }
        Ok(path)
    }
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Path(VariablePath),
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, MappingError> {
        let trimmed = input.trim();
        let looks_literal = matches!(trimmed, "true" | "false" | "null")
            || trimmed
                .chars()
                .next()
                .map(|c| c.is_ascii_digit() || matches!(c, '-' | '"' | '{' | '['))
                .unwrap_or(false);
        if looks_literal {
            serde_json::from_str(trimmed)
                .map(Expression::Literal)
                .map_err(|e| MappingError::InvalidExpression {
                    expression: input.to_string(),
                    reason: e.to_string(),
                })
        } else {
            VariablePath::parse(trimmed).map(Expression::Path)
        }
    }

    /// Evaluates the expression, resolving root variables through `lookup`.
    pub fn evaluate<F>(&self, source: &str, lookup: F) -> Result<Value, MappingError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Path(path) => {
                let root = lookup(&path.root).ok_or_else(|| MappingError::VariableNotFound {
                    expression: source.to_string(),
                    name: path.root.clone(),
                })?;
                select(&root, &path.segments).cloned().map_err(|segment| {
                    MappingError::PathNotFound {
                        expression: source.to_string(),
                        segment: segment.to_string(),
                    }
                })
            }
        }
    }
}

fn select<'a>(value: &'a Value, segments: &'a [PathSegment]) -> Result<&'a Value, &'a PathSegment> {
    let mut current = value;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name).ok_or(segment)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i).ok_or(segment)?,
            _ => return Err(segment),
        };
    }
    Ok(current)
}

/// Evaluates `source` with `lookup`. Shorthand for parse + evaluate.
pub fn evaluate<F>(source: &str, lookup: F) -> Result<Value, MappingError>
where
    F: Fn(&str) -> Option<Value>,
{
    Expression::parse(source)?.evaluate(source, lookup)
}

/// Returns the new value of the target's root variable after writing `value` at `target`.
///
/// `current` is the visible value of the root variable, if any. Non-object values
/// along the path are replaced by objects.
pub fn assign(target: &VariablePath, current: Option<Value>, value: Value) -> Value {
    let fields: Vec<&str> = target
        .segments
        .iter()
        .filter_map(|s| match s {
            PathSegment::Field(name) => Some(name.as_str()),
            PathSegment::Index(_) => None,
        })
        .collect();
    let mut root = current.unwrap_or(Value::Null);
    assign_into(&mut root, &fields, value);
    root
}

fn assign_into(slot: &mut Value, fields: &[&str], value: Value) {
    let Some((first, rest)) = fields.split_first() else {
        *slot = value;
        return;
    };
    if !slot.is_object() {
        *slot = Value::Object(Default::default());
    }
    if let Value::Object(map) = slot {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        assign_into(child, rest, value);
    }
}

// ── Conditions ──

impl Condition {
    pub fn evaluate<F>(&self, lookup: F) -> Result<bool, MappingError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let actual = evaluate(&self.variable, lookup)?;
        Ok(match self.op {
            ConditionOp::Eq => values_equal(&actual, &self.value),
            ConditionOp::Neq => !values_equal(&actual, &self.value),
            ConditionOp::Lt => compare(&actual, &self.value) == Some(Ordering::Less),
            ConditionOp::Gt => compare(&actual, &self.value) == Some(Ordering::Greater),
            ConditionOp::Lte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOp::Gte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
