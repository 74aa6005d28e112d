use std::fmt;

use super::descriptor::FieldKind;
use super::heap::ObjectRef;

/// Width class of a runtime value.
///
/// Category-1 values occupy one local/stack slot, category-2 values
/// (long and double) occupy two consecutive slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    One,
    Two,
}

impl Category {
    /// Number of slots a value of this category occupies.
    pub fn slots(self) -> usize {
        match self {
            Category::One => 1,
            Category::Two => 2,
        }
    }
}

/// A tagged runtime value.
///
/// - Int: 32-bit signed integer (also carries boolean, byte, char, short)
/// - Long: 64-bit signed integer
/// - Float: 32-bit IEEE 754
/// - Double: 64-bit IEEE 754
/// - Ref: object reference, `None` is null
/// - ReturnAddress: instruction index pushed by `jsr`
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<ObjectRef>),
    ReturnAddress(usize),
}

impl Value {
    pub const NULL: Value = Value::Ref(None);

    pub fn category(&self) -> Category {
        match self {
            Value::Long(_) | Value::Double(_) => Category::Two,
            _ => Category::One,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.category() == Category::Two
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Ref(None))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(f) => Some(*f),
            _ => None,
        }
    }

    /// Reference payload. `Some(None)` is a null reference, `None` means
    /// the value is not a reference at all.
    pub fn as_reference(&self) -> Option<Option<ObjectRef>> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_return_address(&self) -> Option<usize> {
        match self {
            Value::ReturnAddress(pc) => Some(*pc),
            _ => None,
        }
    }

    /// The zero value a field or array element of `kind` starts with.
    pub fn default_for(kind: FieldKind) -> Value {
        match kind {
            FieldKind::Boolean
            | FieldKind::Byte
            | FieldKind::Char
            | FieldKind::Short
            | FieldKind::Int => Value::Int(0),
            FieldKind::Long => Value::Long(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Double => Value::Double(0.0),
            FieldKind::Reference => Value::NULL,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Ref(_) => "reference",
            Value::ReturnAddress(_) => "returnAddress",
        }
    }

    /// Whether this value can be stored in a slot of the given kind.
    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (
                Value::Int(_),
                FieldKind::Boolean
                    | FieldKind::Byte
                    | FieldKind::Char
                    | FieldKind::Short
                    | FieldKind::Int
            ) | (Value::Long(_), FieldKind::Long)
                | (Value::Float(_), FieldKind::Float)
                | (Value::Double(_), FieldKind::Double)
                | (Value::Ref(_), FieldKind::Reference)
        )
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Long(n) => write!(f, "Long({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::Double(n) => write!(f, "Double({})", n),
            Value::Ref(None) => write!(f, "Null"),
            Value::Ref(Some(r)) => write!(f, "Ref({})", r.index()),
            Value::ReturnAddress(pc) => write!(f, "ReturnAddress({})", pc),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Long(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Double(n) => write!(f, "{:?}", n),
            Value::Ref(None) => write!(f, "null"),
            Value::Ref(Some(r)) => write!(f, "@{}", r.index()),
            Value::ReturnAddress(pc) => write!(f, "ret:{}", pc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Value::Int(1).category(), Category::One);
        assert_eq!(Value::Float(1.0).category(), Category::One);
        assert_eq!(Value::NULL.category(), Category::One);
        assert_eq!(Value::ReturnAddress(3).category(), Category::One);
        assert_eq!(Value::Long(1).category(), Category::Two);
        assert_eq!(Value::Double(1.0).category(), Category::Two);
        assert_eq!(Category::Two.slots(), 2);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Int(42).as_long(), None);
        assert_eq!(Value::Long(-7).as_long(), Some(-7));
        assert_eq!(Value::NULL.as_reference(), Some(None));
        assert_eq!(Value::Int(0).as_reference(), None);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Value::default_for(FieldKind::Char), Value::Int(0));
        assert_eq!(Value::default_for(FieldKind::Long), Value::Long(0));
        assert!(Value::default_for(FieldKind::Reference).is_null());
    }

    #[test]
    fn test_fits() {
        assert!(Value::Int(1).fits(FieldKind::Byte));
        assert!(!Value::Int(1).fits(FieldKind::Long));
        assert!(Value::NULL.fits(FieldKind::Reference));
        assert!(!Value::Double(1.0).fits(FieldKind::Float));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(5).to_string(), "5");
        assert_eq!(Value::Double(1.0).to_string(), "1.0");
        assert_eq!(Value::NULL.to_string(), "null");
    }
}
