//! Field and method descriptors.
//!
//! Descriptors are the type strings of the class-file format: `I`, `J`,
//! `Ljava/lang/String;`, `[[D`, and method descriptors such as
//! `(IJLjava/lang/Object;)V`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::{Category, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("empty descriptor")]
    Empty,
    #[error("invalid descriptor '{0}'")]
    Invalid(String),
    #[error("trailing characters in descriptor '{0}'")]
    Trailing(String),
}

/// Storage kind of a field, array element or local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl FieldKind {
    pub fn category(self) -> Category {
        match self {
            FieldKind::Long | FieldKind::Double => Category::Two,
            _ => Category::One,
        }
    }

    /// Kind for a `newarray` type code (`T_BOOLEAN` = 4 .. `T_LONG` = 11).
    pub fn from_array_type(atype: u8) -> Option<Self> {
        Some(match atype {
            4 => FieldKind::Boolean,
            5 => FieldKind::Char,
            6 => FieldKind::Float,
            7 => FieldKind::Double,
            8 => FieldKind::Byte,
            9 => FieldKind::Short,
            10 => FieldKind::Int,
            11 => FieldKind::Long,
            _ => return None,
        })
    }

    /// Descriptor character of a primitive kind.
    pub fn descriptor_char(self) -> Option<char> {
        Some(match self {
            FieldKind::Boolean => 'Z',
            FieldKind::Byte => 'B',
            FieldKind::Char => 'C',
            FieldKind::Short => 'S',
            FieldKind::Int => 'I',
            FieldKind::Long => 'J',
            FieldKind::Float => 'F',
            FieldKind::Double => 'D',
            FieldKind::Reference => return None,
        })
    }

    /// Narrow an int to the width of this kind, as stores to sub-int
    /// fields and array elements do.
    pub fn narrow(self, value: Value) -> Value {
        match (self, value) {
            (FieldKind::Boolean, Value::Int(n)) => Value::Int(n & 1),
            (FieldKind::Byte, Value::Int(n)) => Value::Int(n as i8 as i32),
            (FieldKind::Char, Value::Int(n)) => Value::Int(n as u16 as i32),
            (FieldKind::Short, Value::Int(n)) => Value::Int(n as i16 as i32),
            _ => value,
        }
    }
}

/// A parsed field type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let (ty, rest) = Self::parse_prefix(descriptor)?;
        if !rest.is_empty() {
            return Err(DescriptorError::Trailing(descriptor.to_string()));
        }
        Ok(ty)
    }

    /// Parse one field type from the front of `s`, returning the remainder.
    fn parse_prefix(s: &str) -> Result<(Self, &str), DescriptorError> {
        let mut chars = s.chars();
        let first = chars.next().ok_or(DescriptorError::Empty)?;
        let rest = chars.as_str();
        let ty = match first {
            'Z' => FieldType::Boolean,
            'B' => FieldType::Byte,
            'C' => FieldType::Char,
            'S' => FieldType::Short,
            'I' => FieldType::Int,
            'J' => FieldType::Long,
            'F' => FieldType::Float,
            'D' => FieldType::Double,
            'L' => {
                let end = rest
                    .find(';')
                    .ok_or_else(|| DescriptorError::Invalid(s.to_string()))?;
                if end == 0 {
                    return Err(DescriptorError::Invalid(s.to_string()));
                }
                return Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
            }
            '[' => {
                let (component, rest) = Self::parse_prefix(rest)?;
                return Ok((FieldType::Array(Box::new(component)), rest));
            }
            _ => return Err(DescriptorError::Invalid(s.to_string())),
        };
        Ok((ty, rest))
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldType::Boolean => FieldKind::Boolean,
            FieldType::Byte => FieldKind::Byte,
            FieldType::Char => FieldKind::Char,
            FieldType::Short => FieldKind::Short,
            FieldType::Int => FieldKind::Int,
            FieldType::Long => FieldKind::Long,
            FieldType::Float => FieldKind::Float,
            FieldType::Double => FieldKind::Double,
            FieldType::Object(_) | FieldType::Array(_) => FieldKind::Reference,
        }
    }

    pub fn category(&self) -> Category {
        self.kind().category()
    }

    /// Class name this type denotes when used as a class reference:
    /// `java/lang/String` for objects, the descriptor itself for arrays.
    pub fn class_name(&self) -> Option<String> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Object(name) => write!(f, "L{};", name),
            FieldType::Array(component) => write!(f, "[{}", component),
            other => match other.kind().descriptor_char() {
                Some(c) => write!(f, "{}", c),
                None => Ok(()),
            },
        }
    }
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `V`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let inner = descriptor
            .strip_prefix('(')
            .ok_or_else(|| DescriptorError::Invalid(descriptor.to_string()))?;
        let close = inner
            .find(')')
            .ok_or_else(|| DescriptorError::Invalid(descriptor.to_string()))?;
        let mut args = &inner[..close];
        let ret = &inner[close + 1..];

        let mut params = Vec::new();
        while !args.is_empty() {
            let (ty, rest) = FieldType::parse_prefix(args)?;
            params.push(ty);
            args = rest;
        }

        let ret = match ret {
            "V" => None,
            other => Some(FieldType::parse(other)?),
        };
        Ok(Self { params, ret })
    }

    /// Slots occupied by the declared parameters (receiver excluded).
    pub fn arg_slots(&self) -> usize {
        self.params.iter().map(|p| p.category().slots()).sum()
    }

    pub fn return_kind(&self) -> Option<FieldKind> {
        self.ret.as_ref().map(|t| t.kind())
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p)?;
        }
        write!(f, ")")?;
        match &self.ret {
            Some(t) => write!(f, "{}", t),
            None => write!(f, "V"),
        }
    }
}
