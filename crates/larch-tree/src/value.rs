//! Constant payloads and their equality/hash semantics.
//!
//! The constant pool deduplicates by (declared type, value), so equality
//! here is deliberately explicit instead of derived:
//! - floats compare by bit pattern (NaN == NaN, +0.0 != -0.0), so a pooled
//!   NaN is a single slot and signed zeros stay distinct;
//! - decimals compare after normalization (1.50 == 1.5);
//! - strings compare by content;
//! - struct values compare field-wise;
//! - object values compare by identity unless their type overrides
//!   equality, in which case the overriding key is compared instead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::Type;

/// Exact decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy)]
pub struct DecimalValue {
    pub mantissa: i128,
    pub scale: u8,
}

impl DecimalValue {
    pub fn new(mantissa: i128, scale: u8) -> Self {
        DecimalValue { mantissa, scale }.normalized()
    }

    /// Strip trailing zero digits so equal quantities compare equal.
    pub fn normalized(self) -> Self {
        let mut m = self.mantissa;
        let mut s = self.scale;
        while s > 0 && m != 0 && m % 10 == 0 {
            m /= 10;
            s -= 1;
        }
        DecimalValue { mantissa: m, scale: s }
    }
}

impl PartialEq for DecimalValue {
    fn eq(&self, other: &Self) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.mantissa == b.mantissa && a.scale == b.scale
    }
}

impl Eq for DecimalValue {}

impl Hash for DecimalValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let n = self.normalized();
        n.mantissa.hash(state);
        n.scale.hash(state);
    }
}

/// A reference-typed constant. `id` is the object's identity; `eq_key` is
/// present when the object's type overrides equality and carries whatever
/// the override compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjValue {
    pub id: u64,
    pub eq_key: Option<String>,
}

impl ObjValue {
    pub fn identity(id: u64) -> Self {
        ObjValue { id, eq_key: None }
    }

    pub fn keyed(id: u64, key: impl Into<String>) -> Self {
        ObjValue {
            id,
            eq_key: Some(key.into()),
        }
    }
}

/// Constant payload carried by a `Constant` node.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Signed integrals, sign-extended to 64 bits
    Int(i64),
    /// Unsigned integrals, zero-extended to 64 bits
    UInt(u64),
    Char(char),
    Float32(f32),
    Float64(f64),
    Decimal(DecimalValue),
    /// Ticks since an arbitrary epoch
    DateTime(i64),
    Str(String),
    EnumMember { ty: String, discriminant: i64 },
    /// Value-typed composite, compared field-wise
    StructVal { ty: String, fields: Vec<Value> },
    Obj(ObjValue),
    /// Realized array payload (switch dispatch tables)
    ArrayVal(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            // Bit-pattern equality: NaN matches NaN, +0.0 does not match -0.0
            (Float32(a), Float32(b)) => a.to_bits() == b.to_bits(),
            (Float64(a), Float64(b)) => a.to_bits() == b.to_bits(),
            (Decimal(a), Decimal(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (
                EnumMember { ty: ta, discriminant: da },
                EnumMember { ty: tb, discriminant: db },
            ) => ta == tb && da == db,
            (StructVal { ty: ta, fields: fa }, StructVal { ty: tb, fields: fb }) => {
                ta == tb && fa == fb
            }
            (Obj(a), Obj(b)) => match (&a.eq_key, &b.eq_key) {
                (Some(ka), Some(kb)) => ka == kb,
                (None, None) => a.id == b.id,
                _ => false,
            },
            (ArrayVal(a), ArrayVal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use Value::*;
        std::mem::discriminant(self).hash(state);
        match self {
            Null => {}
            Bool(b) => b.hash(state),
            Int(i) => i.hash(state),
            UInt(u) => u.hash(state),
            Char(c) => c.hash(state),
            Float32(f) => f.to_bits().hash(state),
            Float64(f) => f.to_bits().hash(state),
            Decimal(d) => d.hash(state),
            DateTime(t) => t.hash(state),
            Str(s) => s.hash(state),
            EnumMember { ty, discriminant } => {
                ty.hash(state);
                discriminant.hash(state);
            }
            StructVal { ty, fields } => {
                ty.hash(state);
                fields.hash(state);
            }
            Obj(o) => match &o.eq_key {
                Some(k) => k.hash(state),
                None => o.id.hash(state),
            },
            ArrayVal(items) => items.hash(state),
        }
    }
}

impl Value {
    /// The 64-bit hash used for switch dispatch tables. Integral and char
    /// values use a widened bit-reinterpretation (sign- or zero-extended);
    /// every other hashable kind uses its intrinsic hash. Returns `None`
    /// for kinds whose type rejects hash partitioning.
    pub fn switch_hash(&self) -> Option<u64> {
        use Value::*;
        match self {
            Int(i) => Some(*i as u64),
            UInt(u) => Some(*u),
            Char(c) => Some(*c as u64),
            EnumMember { discriminant, .. } => Some(*discriminant as u64),
            Str(_) | StructVal { .. } | Obj(_) => {
                let mut h = DefaultHasher::new();
                self.hash(&mut h);
                Some(h.finish())
            }
            Bool(_) | Float32(_) | Float64(_) | Decimal(_) | DateTime(_) | Null
            | ArrayVal(_) => None,
        }
    }

    /// The zero value of a type, used when member-initializing storage.
    pub fn default_of(ty: &Type) -> Value {
        match ty {
            Type::Bool => Value::Bool(false),
            Type::Int8 | Type::Int16 | Type::Int32 | Type::Int64 => Value::Int(0),
            Type::UInt8 | Type::UInt16 | Type::UInt32 | Type::UInt64 => Value::UInt(0),
            Type::Char => Value::Char('\0'),
            Type::Float32 => Value::Float32(0.0),
            Type::Float64 => Value::Float64(0.0),
            Type::Decimal => Value::Decimal(DecimalValue::new(0, 0)),
            Type::DateTime => Value::DateTime(0),
            Type::Enum { name, .. } => Value::EnumMember {
                ty: name.clone(),
                discriminant: 0,
            },
            Type::Struct { name, .. } => Value::StructVal {
                ty: name.clone(),
                fields: Vec::new(),
            },
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_bit_pattern_equality() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
        assert_eq!(Value::Float32(1.5), Value::Float32(1.5));
    }

    #[test]
    fn test_decimal_normalization() {
        // 1.50 == 1.5
        assert_eq!(
            Value::Decimal(DecimalValue::new(150, 2)),
            Value::Decimal(DecimalValue::new(15, 1))
        );
        assert_ne!(
            Value::Decimal(DecimalValue::new(15, 1)),
            Value::Decimal(DecimalValue::new(151, 2))
        );
    }

    #[test]
    fn test_object_identity_vs_custom_equality() {
        // No override: identity only
        assert_ne!(
            Value::Obj(ObjValue::identity(1)),
            Value::Obj(ObjValue::identity(2))
        );
        assert_eq!(
            Value::Obj(ObjValue::identity(7)),
            Value::Obj(ObjValue::identity(7))
        );
        // Override: distinct identities, equal keys
        assert_eq!(
            Value::Obj(ObjValue::keyed(1, "k")),
            Value::Obj(ObjValue::keyed(2, "k"))
        );
        assert_ne!(
            Value::Obj(ObjValue::keyed(1, "k")),
            Value::Obj(ObjValue::identity(1))
        );
    }

    #[test]
    fn test_struct_fieldwise_equality() {
        let a = Value::StructVal {
            ty: "Point".to_string(),
            fields: vec![Value::Int(1), Value::Int(2)],
        };
        let b = Value::StructVal {
            ty: "Point".to_string(),
            fields: vec![Value::Int(1), Value::Int(2)],
        };
        let c = Value::StructVal {
            ty: "Point".to_string(),
            fields: vec![Value::Int(1), Value::Int(3)],
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_switch_hash_widening() {
        // Sign extension: -1 as i64 reinterprets to all-ones
        assert_eq!(Value::Int(-1).switch_hash(), Some(u64::MAX));
        // Zero extension
        assert_eq!(Value::UInt(255).switch_hash(), Some(255));
        assert_eq!(Value::Char('A').switch_hash(), Some(65));
        // Rejected kinds
        assert_eq!(Value::Bool(true).switch_hash(), None);
        assert_eq!(Value::Float64(1.0).switch_hash(), None);
        assert_eq!(Value::DateTime(0).switch_hash(), None);
    }

    #[test]
    fn test_equal_strings_hash_equal() {
        let a = Value::Str("hello".to_string());
        let b = Value::Str("hello".to_string());
        assert_eq!(a.switch_hash(), b.switch_hash());
    }
}
