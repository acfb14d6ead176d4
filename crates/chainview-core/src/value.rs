//! Typed field values for event payloads and entity state.
//!
//! On-chain integers are carried as 256-bit values (`alloy-primitives`), so
//! comparisons and reducer arithmetic never go through floating point.

use std::cmp::Ordering;
use std::fmt;

use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};

/// A single payload or entity field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Unsigned integer up to 256 bits.
    Uint(U256),
    /// Signed integer up to 256 bits.
    Int(I256),
    Bool(bool),
    Str(String),
    /// EVM address, `0x`-prefixed hex. Compared case-insensitively.
    Address(String),
    Bytes(Vec<u8>),
    /// Unix timestamp (seconds).
    Timestamp(i64),
    Array(Vec<Value>),
    Null,
}

impl Value {
    /// Build an address value.
    pub fn address(addr: impl Into<String>) -> Self {
        Value::Address(addr.into())
    }

    /// Build an unsigned integer value.
    pub fn uint(v: impl Into<U256>) -> Self {
        Value::Uint(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The unsigned integer held by this value, if any.
    ///
    /// Non-negative `Int` and `Timestamp` values are widened.
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if !v.is_negative() => Some(v.into_raw()),
            Value::Timestamp(t) if *t >= 0 => Some(U256::from(*t as u64)),
            _ => None,
        }
    }

    /// The signed integer held by this value, if it fits in an `I256`.
    pub fn as_int(&self) -> Option<I256> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) => I256::try_from(*v).ok(),
            Value::Timestamp(t) => I256::try_from(*t).ok(),
            _ => None,
        }
    }

    /// String-like contents (`Str` or `Address`).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Address(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::Uint(v) => i64::try_from(*v).ok(),
            Value::Int(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Partial comparison used by query predicates.
    ///
    /// Numbers compare across `Uint`, `Int` and `Timestamp`; strings and
    /// addresses compare with each other, addresses case-insensitively.
    /// Values of unrelated kinds are incomparable (`None`).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Uint(a), Uint(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Uint(_) | Int(_) | Timestamp(_), Uint(_) | Int(_) | Timestamp(_)) => {
                compare_numeric(self, other)
            }
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Address(a), Address(b)) | (Address(a), Str(b)) | (Str(a), Address(b)) => {
                Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
            }
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Null, Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Total order used for sorting: kind rank first, then value.
    ///
    /// Unlike [`Value::compare`], addresses rank apart from strings and
    /// break case-insensitive ties on their raw text, and array elements
    /// are ordered recursively with this same order. Every pair of values
    /// is ordered and the order is transitive.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (Address(a), Address(b)) => a
                .to_ascii_lowercase()
                .cmp(&b.to_ascii_lowercase())
                .then_with(|| a.cmp(b)),
            (Array(a), Array(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.sort_cmp(y))
                .find(|ord| ord.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            // same rank: numbers, strings, bytes, bools or nulls
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        })
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Uint(_) | Value::Int(_) | Value::Timestamp(_) => 1,
            Value::Str(_) => 2,
            Value::Address(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
            Value::Null => 6,
        }
    }

    /// Infer a value from a plain string (CLI arguments, config files).
    ///
    /// `true`/`false` → `Bool`, decimal digits → `Uint`/`Int`, a 20-byte
    /// `0x` hex string → `Address`, anything else → `Str`.
    pub fn infer(raw: &str) -> Value {
        let s = raw.trim();
        match s {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            "null" => return Value::Null,
            _ => {}
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = U256::from_str_radix(s, 10) {
                return Value::Uint(v);
            }
        }
        if let Some(digits) = s.strip_prefix('-') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(v) = I256::from_dec_str(s) {
                    return Value::Int(v);
                }
            }
        }
        if let Some(hex) = s.strip_prefix("0x") {
            if hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Value::Address(s.to_string());
            }
        }
        Value::Str(s.to_string())
    }
}

fn compare_numeric(a: &Value, b: &Value) -> Option<Ordering> {
    let a = a.as_int_wide()?;
    let b = b.as_int_wide()?;
    Some(match (a, b) {
        (Wide::Neg(x), Wide::Neg(y)) => x.cmp(&y),
        (Wide::Neg(_), Wide::Pos(_)) => Ordering::Less,
        (Wide::Pos(_), Wide::Neg(_)) => Ordering::Greater,
        (Wide::Pos(x), Wide::Pos(y)) => x.cmp(&y),
    })
}

// Sign + magnitude view so a full-range U256 and a negative I256 compare
// without overflow.
enum Wide {
    Neg(I256),
    Pos(U256),
}

impl Value {
    fn as_int_wide(&self) -> Option<Wide> {
        match self {
            Value::Uint(v) => Some(Wide::Pos(*v)),
            Value::Int(v) if v.is_negative() => Some(Wide::Neg(*v)),
            Value::Int(v) => Some(Wide::Pos(v.into_raw())),
            Value::Timestamp(t) if *t < 0 => I256::try_from(*t).ok().map(Wide::Neg),
            Value::Timestamp(t) => Some(Wide::Pos(U256::from(*t as u64))),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Address(a) => write!(f, "{a}"),
            Value::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Array(v) => {
                let parts: Vec<_> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Null => write!(f, "null"),
        }
    }
}

impl From<U256> for Value {
    fn from(v: U256) -> Self {
        Value::Uint(v)
    }
}

impl From<I256> for Value {
    fn from(v: I256) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(U256::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
