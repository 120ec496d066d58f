//! Declared-type model for expression trees.
//!
//! Types here describe what the original tree was checked against; the
//! lowering passes consult them for three things only: whether a constant
//! can be embedded directly by the emitter, whether a storage slot needs a
//! boxed cell (the type is not nameable from emitted code), and whether a
//! switch key type is safe to hash-partition.

/// Visibility of a named type relative to the emitting module.
///
/// Emitted code can only name `Public` types; a slot whose type is
/// `Internal` (or a generic closed over an `Internal` argument) must be
/// stored behind a boxed cell with a public shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Internal,
}

/// Core type representation for tree nodes and variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value (statement position)
    Void,
    /// Boolean type
    Bool,
    /// Signed integrals
    Int8,
    Int16,
    Int32,
    Int64,
    /// Unsigned integrals
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    /// UTF-16-ish character type
    Char,
    /// Floating point
    Float32,
    Float64,
    /// Exact decimal type (embedded by the emitter, never hash-partitioned)
    Decimal,
    /// Calendar instant (never hash-partitioned)
    DateTime,
    /// The database-null singleton type (never hash-partitioned)
    DbNull,
    /// String type
    Str,
    /// Named enum with an integral underlying type
    Enum {
        name: String,
        underlying: Box<Type>,
        visibility: Visibility,
    },
    /// Named value type with fields
    Struct { name: String, visibility: Visibility },
    /// Named reference type
    Object {
        name: String,
        visibility: Visibility,
        /// Whether the type overrides equality (constants of it are then
        /// deduplicated by value key instead of identity)
        overrides_equality: bool,
    },
    /// Array type with element type
    Array(Box<Type>),
    /// Callable type
    Func { params: Vec<Type>, ret: Box<Type> },
    /// Quoted-tree type: a value of this type is an inert expression tree
    /// describing a callable of the inner type
    Expression(Box<Type>),
    /// Instantiation of a pre-declared generic shape (tuple packs, cells)
    Generic { base: String, args: Vec<Type> },
    /// Lifted-nullable wrapper around a value type
    Nullable(Box<Type>),
}

impl Type {
    /// The opaque delegate type used for the reserved delegate-array slot.
    pub fn delegate() -> Type {
        Type::Object {
            name: "Delegate".to_string(),
            visibility: Visibility::Public,
            overrides_equality: false,
        }
    }

    /// True for the built-in scalar kinds the emitter can encode inline.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Int8
                | Type::Int16
                | Type::Int32
                | Type::Int64
                | Type::UInt8
                | Type::UInt16
                | Type::UInt32
                | Type::UInt64
                | Type::Char
                | Type::Float32
                | Type::Float64
        )
    }

    /// True when a constant of this type bypasses the constant pool:
    /// the emitter embeds primitives, enums, strings and decimals directly.
    pub fn is_embeddable(&self) -> bool {
        self.is_primitive()
            || matches!(self, Type::Str | Type::Decimal | Type::Enum { .. })
    }

    /// True for types with value semantics (copied on assignment).
    pub fn is_value_type(&self) -> bool {
        match self {
            Type::Bool
            | Type::Int8
            | Type::Int16
            | Type::Int32
            | Type::Int64
            | Type::UInt8
            | Type::UInt16
            | Type::UInt32
            | Type::UInt64
            | Type::Char
            | Type::Float32
            | Type::Float64
            | Type::Decimal
            | Type::DateTime
            | Type::Enum { .. }
            | Type::Struct { .. } => true,
            Type::Nullable(inner) => inner.is_value_type(),
            _ => false,
        }
    }

    /// True for signed/unsigned integral and char kinds (the widened
    /// bit-reinterpretation path of the switch hash).
    pub fn is_integral_or_char(&self) -> bool {
        matches!(
            self,
            Type::Int8
                | Type::Int16
                | Type::Int32
                | Type::Int64
                | Type::UInt8
                | Type::UInt16
                | Type::UInt32
                | Type::UInt64
                | Type::Char
        )
    }

    /// Whether a switch over keys of this type may be hash-partitioned.
    /// Floating point, bool, DateTime, decimal and DbNull are unsafe to
    /// partition exactly and always fall back to linear dispatch.
    pub fn is_switch_hashable(&self) -> bool {
        !matches!(
            self,
            Type::Float32
                | Type::Float64
                | Type::Bool
                | Type::DateTime
                | Type::Decimal
                | Type::DbNull
        )
    }

    /// Whether emitted code can name this type directly. Non-public named
    /// types, and any composite closed over one, need a boxed cell.
    pub fn is_module_visible(&self) -> bool {
        match self {
            Type::Enum { visibility, .. } | Type::Struct { visibility, .. } => {
                *visibility == Visibility::Public
            }
            Type::Object { visibility, .. } => *visibility == Visibility::Public,
            Type::Array(elem) => elem.is_module_visible(),
            Type::Expression(inner) | Type::Nullable(inner) => inner.is_module_visible(),
            Type::Func { params, ret } => {
                params.iter().all(Type::is_module_visible) && ret.is_module_visible()
            }
            Type::Generic { args, .. } => args.iter().all(Type::is_module_visible),
            _ => true,
        }
    }

    /// Deterministic short name used in generated field names.
    pub fn mangle(&self) -> String {
        match self {
            Type::Void => "void".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Int8 => "i8".to_string(),
            Type::Int16 => "i16".to_string(),
            Type::Int32 => "i32".to_string(),
            Type::Int64 => "i64".to_string(),
            Type::UInt8 => "u8".to_string(),
            Type::UInt16 => "u16".to_string(),
            Type::UInt32 => "u32".to_string(),
            Type::UInt64 => "u64".to_string(),
            Type::Char => "char".to_string(),
            Type::Float32 => "f32".to_string(),
            Type::Float64 => "f64".to_string(),
            Type::Decimal => "dec".to_string(),
            Type::DateTime => "dt".to_string(),
            Type::DbNull => "dbnull".to_string(),
            Type::Str => "str".to_string(),
            Type::Enum { name, .. } => format!("enum_{}", name),
            Type::Struct { name, .. } => format!("struct_{}", name),
            Type::Object { name, .. } => format!("obj_{}", name),
            Type::Array(elem) => format!("arr_{}", elem.mangle()),
            Type::Func { params, ret } => {
                let mut out = String::from("fn");
                for p in params {
                    out.push('_');
                    out.push_str(&p.mangle());
                }
                out.push_str("_to_");
                out.push_str(&ret.mangle());
                out
            }
            Type::Expression(inner) => format!("expr_{}", inner.mangle()),
            Type::Generic { base, args } => {
                let mut out = base.to_lowercase();
                for a in args {
                    out.push('_');
                    out.push_str(&a.mangle());
                }
                out
            }
            Type::Nullable(inner) => format!("opt_{}", inner.mangle()),
        }
    }
}
