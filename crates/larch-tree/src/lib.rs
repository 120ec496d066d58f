//! Typed lambda-expression tree model for the larch compiler.
//!
//! This crate defines the input contract of the lowering passes: declared
//! types with module visibility, constant values with explicit equality
//! semantics, and the closed expression node set.

pub mod expr;
pub mod types;
pub mod value;

pub use expr::{
    BinaryOp, CatchHandler, Expr, LabelId, LambdaExpr, SwitchCase, UnaryOp, VarId, VarInfo,
    Vars,
};
pub use types::{Type, Visibility};
pub use value::{DecimalValue, ObjValue, Value};
