//! Decoded scalar values.

use serde::Serialize;
use std::fmt;

/// One decoded wire scalar.
///
/// Decode functions return a list of these; everything downstream (frame
/// context cells, point fields, conditional choice matching) speaks this
/// closed set of shapes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Short name of the value's shape, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Non-negative integer view, used to resolve length and repeat
    /// expressions. Anything that is not a whole non-negative integer is
    /// rejected by the caller with a type-conversion error.
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Value::Int(i) if *i >= 0 => usize::try_from(*i).ok(),
            Value::UInt(u) => usize::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Canonical string form, used for conditional choice matching and
    /// `${var}` template expansion: integers in decimal, bytes as lowercase
    /// hex, strings as-is.
    pub fn render(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
