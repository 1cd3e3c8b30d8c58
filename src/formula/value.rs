// Formula values - fixed-precision decimals and booleans, never floats

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// VALUE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Boolean,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "number" | "num" | "decimal" => Ok(ValueKind::Number),
            "boolean" | "bool" => Ok(ValueKind::Boolean),
            other => Err(format!("unknown value kind: {}", other)),
        }
    }
}

// ============================================================================
// VALUE
// ============================================================================

/// A formula input or output.
///
/// Numbers are `rust_decimal::Decimal` so repeated recomputation reproduces
/// totals to the exact digit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(Decimal),
    Bool(bool),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Boolean,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(_) => None,
        }
    }

    /// Parse a user-supplied literal: `true`/`false` or a decimal number.
    pub fn parse_literal(raw: &str) -> Option<Value> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => Decimal::from_str(trimmed).ok().map(Value::Number),
        }
    }
}

impl From<Decimal> for Value {
    fn from(n: Decimal) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Decimal::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Decimal::from(n))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        assert_eq!(Value::parse_literal("8"), Some(Value::from(8)));
        assert_eq!(
            Value::parse_literal(" 1.12 "),
            Some(Value::Number(Decimal::new(112, 2)))
        );
        assert_eq!(Value::parse_literal("TRUE"), Some(Value::Bool(true)));
        assert_eq!(Value::parse_literal("eight"), None);
    }

    #[test]
    fn test_json_shape() {
        let number: Value = serde_json::from_str("\"4000.50\"").unwrap();
        assert_eq!(number, Value::Number(Decimal::new(400050, 2)));

        let from_int: Value = serde_json::from_str("500").unwrap();
        assert_eq!(from_int, Value::from(500));

        let flag: Value = serde_json::from_str("true").unwrap();
        assert_eq!(flag.kind(), ValueKind::Boolean);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("number".parse::<ValueKind>(), Ok(ValueKind::Number));
        assert_eq!("Bool".parse::<ValueKind>(), Ok(ValueKind::Boolean));
        assert!("text".parse::<ValueKind>().is_err());
    }
}
