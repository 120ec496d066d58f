//! Failure modes of the lowering passes.
//!
//! Everything here is fatal and fail-fast: lowering is a pure function of
//! the input tree, so nothing is retried and no partial output is produced.
//! Hash-partition failures on switches are not errors; they silently fall
//! back to linear dispatch.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    /// The tree contains a node kind neither pass can model.
    #[error("unsupported expression shape: {kind}")]
    UnsupportedExpressionShape { kind: &'static str },

    /// A boxed-cell shape lacks the single-argument constructor its
    /// wrapped type needs. Indicates an inconsistent cell catalog, not a
    /// user-facing condition.
    #[error("boxed cell `{cell}` has no single-argument constructor for `{ty}`")]
    MissingBoxingConstructor { cell: String, ty: String },

    /// Storage was accessed before `realize()` ran.
    #[error("slot storage used before it was realized")]
    StorageNotRealized,

    /// A slot was requested after `realize()` ran. Layout shape decisions
    /// depend on the total slot count, so late requests cannot be honored.
    #[error("slot requested after storage was realized")]
    StorageRealized,
}

pub type Result<T> = std::result::Result<T, LowerError>;
