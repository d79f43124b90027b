//! Typed remote call arguments
//!
//! Arguments travel as `(kind tag, string value)` pairs. The set of kinds is
//! closed: a peer receiving a tag it does not know rejects the call instead
//! of guessing.

use crate::error::{FilegateError, Result};
use std::fmt;
use std::str::FromStr;

/// Supported argument kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// UTF-8 text
    String,
    /// `true` / `false`
    Boolean,
    /// Single Unicode scalar
    Char,
    /// 8-bit signed integer
    Byte,
    /// 16-bit signed integer
    Short,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
}

impl ArgKind {
    /// All kinds, in tag order
    pub const ALL: [ArgKind; 9] = [
        ArgKind::String,
        ArgKind::Boolean,
        ArgKind::Char,
        ArgKind::Byte,
        ArgKind::Short,
        ArgKind::Int,
        ArgKind::Long,
        ArgKind::Float,
        ArgKind::Double,
    ];

    /// Wire tag
    pub fn tag(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Boolean => "boolean",
            ArgKind::Char => "char",
            ArgKind::Byte => "byte",
            ArgKind::Short => "short",
            ArgKind::Int => "int",
            ArgKind::Long => "long",
            ArgKind::Float => "float",
            ArgKind::Double => "double",
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        ArgKind::ALL.iter().copied().find(|k| k.tag() == tag)
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A remote call argument
///
/// There is no null variant: an absent argument cannot be built, so it can
/// never reach the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    /// Text
    String(String),
    /// Boolean
    Boolean(bool),
    /// Character
    Char(char),
    /// i8
    Byte(i8),
    /// i16
    Short(i16),
    /// i32
    Int(i32),
    /// i64
    Long(i64),
    /// f32
    Float(f32),
    /// f64
    Double(f64),
}

impl RpcValue {
    /// Kind of this value
    pub fn kind(&self) -> ArgKind {
        match self {
            RpcValue::String(_) => ArgKind::String,
            RpcValue::Boolean(_) => ArgKind::Boolean,
            RpcValue::Char(_) => ArgKind::Char,
            RpcValue::Byte(_) => ArgKind::Byte,
            RpcValue::Short(_) => ArgKind::Short,
            RpcValue::Int(_) => ArgKind::Int,
            RpcValue::Long(_) => ArgKind::Long,
            RpcValue::Float(_) => ArgKind::Float,
            RpcValue::Double(_) => ArgKind::Double,
        }
    }

    /// String form sent on the wire
    pub fn to_wire(&self) -> String {
        match self {
            RpcValue::String(s) => s.clone(),
            RpcValue::Boolean(b) => b.to_string(),
            RpcValue::Char(c) => c.to_string(),
            RpcValue::Byte(v) => v.to_string(),
            RpcValue::Short(v) => v.to_string(),
            RpcValue::Int(v) => v.to_string(),
            RpcValue::Long(v) => v.to_string(),
            RpcValue::Float(v) => v.to_string(),
            RpcValue::Double(v) => v.to_string(),
        }
    }

    /// Rebuild a value from its kind and wire form
    pub fn from_wire(kind: ArgKind, text: &str) -> Result<Self> {
        fn parse<T: FromStr>(kind: ArgKind, text: &str) -> Result<T> {
            text.trim().parse().map_err(|_| {
                FilegateError::invalid(format!("'{}' is not a valid {} value", text, kind))
            })
        }

        Ok(match kind {
            ArgKind::String => RpcValue::String(text.to_string()),
            ArgKind::Boolean => RpcValue::Boolean(parse(kind, text)?),
            ArgKind::Char => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => RpcValue::Char(c),
                    _ => {
                        return Err(FilegateError::invalid(format!(
                            "'{}' is not a single character",
                            text
                        )))
                    }
                }
            }
            ArgKind::Byte => RpcValue::Byte(parse(kind, text)?),
            ArgKind::Short => RpcValue::Short(parse(kind, text)?),
            ArgKind::Int => RpcValue::Int(parse(kind, text)?),
            ArgKind::Long => RpcValue::Long(parse(kind, text)?),
            ArgKind::Float => RpcValue::Float(parse(kind, text)?),
            ArgKind::Double => RpcValue::Double(parse(kind, text)?),
        })
    }

    /// Parse `kind:value` as typed on a command line
    ///
    /// Text without a known kind prefix is taken as a string.
    pub fn parse_typed(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((tag, value)) => match ArgKind::from_tag(tag) {
                Some(kind) => Self::from_wire(kind, value),
                None => Ok(RpcValue::String(text.to_string())),
            },
            None => Ok(RpcValue::String(text.to_string())),
        }
    }

    /// Text content of a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer kind, widened
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Byte(v) => Some(i64::from(*v)),
            RpcValue::Short(v) => Some(i64::from(*v)),
            RpcValue::Int(v) => Some(i64::from(*v)),
            RpcValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Any numeric kind, widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Float(v) => Some(f64::from(*v)),
            RpcValue::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RpcValue {
                fn from(v: $ty) -> Self {
                    RpcValue::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    String => String,
    bool => Boolean,
    char => Char,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        RpcValue::String(v.to_string())
    }
}
