//! Core data types for livevar
//!
//! This module contains the value model shared by every part of the crate.
//!
//! # Main Types
//!
//! - [`Value`] - A dynamically typed sample (float, int, bool, text or row)
//! - [`ValueKind`] - The declared kind of a variable and its coercion rule
//! - [`VariableId`] - Stable identity token for a variable or history getter
//! - [`Notification`] - The record delivered to listeners on every update
//!
//! # Coercion
//!
//! Every [`Variable`](crate::Variable) declares a [`ValueKind`]. Values that
//! enter the variable (from `set_value`, from the get function, or from a
//! setter reply) are passed through [`ValueKind::coerce`], so the stored
//! value always has the declared kind:
//!
//! - `Float` accepts floats, ints, bools (`1.0`/`0.0`), numeric text and
//!   single-element rows
//! - `Int` accepts ints, finite floats (truncated), bools and integer text
//! - `Bool` accepts bools, numbers (non-zero is `true`) and the words
//!   `true/false/yes/no/on/off/1/0`
//! - `Text` accepts anything and renders it
//! - `Row` accepts rows, scalars (one-element row) and comma or whitespace
//!   separated numbers
//! - `Any` stores values unchanged

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// A single value held by a variable or carried in a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit floating point
    Float(f64),
    /// 64-bit signed integer
    Int(i64),
    /// Boolean value
    Bool(bool),
    /// Free text
    Text(String),
    /// Fixed-width numeric row (one entry per channel)
    Row(Vec<f64>),
}

impl Value {
    /// The kind this value currently has
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
            Value::Text(_) => ValueKind::Text,
            Value::Row(_) => ValueKind::Row,
        }
    }

    /// Numeric view of a scalar value, used for plotting
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Row(row) if row.len() == 1 => Some(row[0]),
            Value::Row(_) => None,
        }
    }

    /// Borrow the row of a `Row` value
    pub fn as_row(&self) -> Option<&[f64]> {
        match self {
            Value::Row(row) => Some(row),
            _ => None,
        }
    }

    /// Pick one column out of a row, or the scalar itself when `column` is 0
    pub fn column(&self, column: usize) -> Option<f64> {
        match self {
            Value::Row(row) => row.get(column).copied(),
            other if column == 0 => other.as_f64(),
            _ => None,
        }
    }

    /// Flatten this value into numeric columns
    ///
    /// Scalars become one column, rows are copied, text is rejected.
    pub fn flatten_into(&self, out: &mut Vec<f64>) -> Result<()> {
        match self {
            Value::Row(row) => out.extend_from_slice(row),
            Value::Text(_) => {
                let v = ValueKind::Float.coerce(self.clone())?;
                out.extend(v.as_f64());
            }
            other => out.extend(other.as_f64()),
        }
        Ok(())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Row(row) => {
                write!(f, "[")?;
                for (i, v) in row.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Row(v)
    }
}

/// Declared kind of a variable, which doubles as its coercion rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// 64-bit floating point
    #[default]
    Float,
    /// 64-bit signed integer
    Int,
    /// Boolean value
    Bool,
    /// Free text
    Text,
    /// Numeric row
    Row,
    /// No coercion
    Any,
}

impl ValueKind {
    /// Coerce `value` to this kind
    ///
    /// Fails with [`LiveError::TypeCoercion`] when no sensible conversion
    /// exists (for example `"x"` to a float).
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if *self == ValueKind::Any {
            return Ok(value);
        }

        let coerced = match (self, &value) {
            (ValueKind::Float, Value::Float(v)) => Some(Value::Float(*v)),
            (ValueKind::Float, Value::Int(v)) => Some(Value::Float(*v as f64)),
            (ValueKind::Float, Value::Bool(v)) => Some(Value::Float(if *v { 1.0 } else { 0.0 })),
            (ValueKind::Float, Value::Text(s)) => s.trim().parse().ok().map(Value::Float),
            (ValueKind::Float, Value::Row(row)) if row.len() == 1 => Some(Value::Float(row[0])),

            (ValueKind::Int, Value::Int(v)) => Some(Value::Int(*v)),
            (ValueKind::Int, Value::Float(f)) => float_to_int(*f).map(Value::Int),
            (ValueKind::Int, Value::Bool(v)) => Some(Value::Int(*v as i64)),
            (ValueKind::Int, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),

            (ValueKind::Bool, Value::Bool(v)) => Some(Value::Bool(*v)),
            (ValueKind::Bool, Value::Int(v)) => Some(Value::Bool(*v != 0)),
            (ValueKind::Bool, Value::Float(f)) if !f.is_nan() => Some(Value::Bool(*f != 0.0)),
            (ValueKind::Bool, Value::Text(s)) => parse_bool(s).map(Value::Bool),

            (ValueKind::Text, Value::Text(_)) => Some(value.clone()),
            (ValueKind::Text, other) => Some(Value::Text(other.to_string())),

            (ValueKind::Row, Value::Row(_)) => Some(value.clone()),
            (ValueKind::Row, Value::Text(s)) => parse_row(s).map(Value::Row),
            (ValueKind::Row, other) => other.as_f64().map(|x| Value::Row(vec![x])),

            _ => None,
        };

        coerced.ok_or_else(|| LiveError::coercion(*self, describe(&value)))
    }
}

/// Truncate toward zero, `None` for NaN, infinities and values outside `i64`
fn float_to_int(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    let t = f.trunc();
    (t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Float => write!(f, "float"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Text => write!(f, "text"),
            ValueKind::Row => write!(f, "row"),
            ValueKind::Any => write!(f, "any"),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Text(s) => format!("{:?}", s),
        other => format!("{} {}", other.kind(), other),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_row(s: &str) -> Option<Vec<f64>> {
    let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.trim().is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f64>().ok())
        .collect()
}

/// Global counter for generating unique variable IDs
static NEXT_VARIABLE_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of a variable or history getter
///
/// Unique per instance for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub u32);

impl VariableId {
    /// Allocate the next free id
    pub fn next() -> Self {
        VariableId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "var#{}", self.0)
    }
}

/// Record delivered to every listener on each update or set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Identity of the variable that produced this notification
    pub source: VariableId,
    /// Seconds since the source's time offset
    pub timestamp: f64,
    /// Value after coercion
    pub value: Value,
    /// What the setter returned, when the notification came from a set
    pub reply: Option<Value>,
}

impl Notification {
    /// Create a notification without a reply
    pub fn new(source: VariableId, timestamp: f64, value: Value) -> Self {
        Self {
            source,
            timestamp,
            value,
            reply: None,
        }
    }

    /// Attach a setter reply
    pub fn with_reply(mut self, reply: Option<Value>) -> Self {
        self.reply = reply;
        self
    }

    /// True if this notification was triggered by a set
    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }
}
