//! Expression-tree node definitions.
//!
//! This is the closed node set the lowering passes understand. Variables
//! are identified by `VarId`, handed out by the `Vars` registry: identity,
//! not name, is what matters: two variables may share a name and type and
//! still be distinct.

use crate::types::Type;
use crate::value::Value;

/// Unique identifier for a declared variable (parameter, block local,
/// catch variable). Identity-carrying: never reused within one registry.
pub type VarId = u32;

/// Unique identifier for a goto/label target
pub type LabelId = u32;

/// Declaration record for one variable.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub ty: Type,
}

/// Append-only variable registry. Declaring returns a fresh `VarId`;
/// the id is the variable's identity for the whole compilation.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    infos: Vec<VarInfo>,
}

impl Vars {
    pub fn new() -> Self {
        Vars::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: Type) -> VarId {
        let id = self.infos.len() as VarId;
        self.infos.push(VarInfo {
            name: name.into(),
            ty,
        });
        id
    }

    pub fn info(&self, id: VarId) -> &VarInfo {
        &self.infos[id as usize]
    }

    pub fn ty(&self, id: VarId) -> &Type {
        &self.infos[id as usize].ty
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Unary operators. Checked variants trap on overflow; the lowering passes
/// carry them through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    NegateChecked,
    Not,
    OnesComplement,
    Convert,
    ConvertChecked,
    ArrayLength,
}

/// Binary operators, checked variants included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    AddChecked,
    Sub,
    SubChecked,
    Mul,
    MulChecked,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    AndAlso,
    OrElse,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Coalesce,
}

/// A lambda: parameters plus body. `ty` is the callable type.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub params: Vec<VarId>,
    pub body: Box<Expr>,
    pub ty: Type,
}

/// One arm of a switch; a single body may be guarded by several test
/// expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub tests: Vec<Expr>,
    pub body: Expr,
}

/// One catch/filter handler of a try node.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchHandler {
    pub var: Option<VarId>,
    pub exception_ty: Type,
    pub filter: Option<Expr>,
    pub body: Expr,
}

/// Expression node. The set is closed: anything else the input could
/// contain is modeled by `RuntimeVariables`, which the planner rejects.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to a declared variable
    Parameter(VarId),
    /// Literal or quoted-tree constant
    Constant { ty: Type, value: Value },
    /// Unary operation; `lifted` marks the nullable-lifted variant
    Unary {
        op: UnaryOp,
        lifted: bool,
        operand: Box<Expr>,
        ty: Type,
    },
    /// Binary operation; `lifted` marks the nullable-lifted variant
    Binary {
        op: BinaryOp,
        lifted: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        ty: Type,
    },
    /// Field or property access; `object` is `None` for statics
    Member {
        object: Option<Box<Expr>>,
        name: String,
        ty: Type,
    },
    /// Method call; `target` is `None` for statics
    Call {
        target: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
        ty: Type,
    },
    /// Constructor invocation
    New { ty: Type, args: Vec<Expr> },
    /// Ternary conditional
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
        ty: Type,
    },
    /// Switch over a scrutinee with per-case test lists
    Switch {
        scrutinee: Box<Expr>,
        cases: Vec<SwitchCase>,
        default: Option<Box<Expr>>,
        ty: Type,
    },
    /// try/catch/fault/finally
    Try {
        body: Box<Expr>,
        handlers: Vec<CatchHandler>,
        fault: Option<Box<Expr>>,
        finally: Option<Box<Expr>>,
        ty: Type,
    },
    /// Scope with locals; evaluates to the last expression
    Block {
        vars: Vec<VarId>,
        exprs: Vec<Expr>,
        ty: Type,
    },
    /// Unconditional loop, exited by goto
    Loop {
        body: Box<Expr>,
        break_label: Option<LabelId>,
        continue_label: Option<LabelId>,
    },
    /// Jump to a label, optionally carrying a value
    Goto {
        label: LabelId,
        value: Option<Box<Expr>>,
    },
    /// Label target with a default value when reached by fallthrough
    LabelTarget {
        label: LabelId,
        default: Option<Box<Expr>>,
    },
    /// Nested lambda
    Lambda(LambdaExpr),
    /// Quoted lambda: inert tree data until reconstructed at runtime
    Quote(Box<Expr>),
    /// Assignment; `target` must be a parameter or member chain
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// Open-ended runtime variable access. Not modeled by the lowering
    /// passes; planning it is a hard failure.
    RuntimeVariables(Vec<VarId>),
}

impl Expr {
    /// Node-kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Parameter(_) => "parameter",
            Expr::Constant { .. } => "constant",
            Expr::Unary { .. } => "unary",
            Expr::Binary { .. } => "binary",
            Expr::Member { .. } => "member",
            Expr::Call { .. } => "call",
            Expr::New { .. } => "new",
            Expr::Conditional { .. } => "conditional",
            Expr::Switch { .. } => "switch",
            Expr::Try { .. } => "try",
            Expr::Block { .. } => "block",
            Expr::Loop { .. } => "loop",
            Expr::Goto { .. } => "goto",
            Expr::LabelTarget { .. } => "label",
            Expr::Lambda(_) => "lambda",
            Expr::Quote(_) => "quote",
            Expr::Assign { .. } => "assign",
            Expr::RuntimeVariables(_) => "runtime-variables",
        }
    }

    /// Instance member access, the building block of slot access paths.
    pub fn member(object: Expr, name: impl Into<String>, ty: Type) -> Expr {
        Expr::Member {
            object: Some(Box::new(object)),
            name: name.into(),
            ty,
        }
    }

    pub fn constant(ty: Type, value: Value) -> Expr {
        Expr::Constant { ty, value }
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        Expr::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }
}
