//! Closure and constant lowering for larch lambda trees.
//!
//! Compiling a lambda tree down to emitted code needs three things the
//! tree itself does not have: externalized storage for variables captured
//! across lambda boundaries, deduplicated storage for constants the
//! emitter cannot embed, and dispatch tables for constant-keyed switches.
//! This crate runs the two-pass algorithm that produces all three:
//!
//! 1. [`planner::Planner`] walks the tree once, discovering captures,
//!    poolable constants, nested lambdas and eligible switches, and
//!    requesting slots from a [`layout::SlotLayout`] and a
//!    [`pool::ConstantPool`];
//! 2. the layout realizes concrete field paths, possible only now that
//!    the total slot count is known;
//! 3. [`resolver::Resolver`] walks the tree a second time, rewriting every
//!    capture, pooled constant and quote against the finalized slots.
//!
//! The result is a [`plan::LoweringOutput`]: the rewritten tree plus the
//! storage metadata the external bytecode emitter consumes.

pub mod error;
pub mod layout;
pub mod plan;
pub mod planner;
pub mod pool;
pub mod report;
pub mod resolver;
pub mod switch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use larch_tree::{LambdaExpr, Vars};
use log::debug;

pub use error::{LowerError, Result};
pub use layout::{CellCatalog, LayoutKind, SlotId, SlotLayout, SlotStorage};
pub use plan::{CapturedVariable, LoweringOutput, LoweringPlan, PoolValue, SwitchTableInfo};
pub use planner::Planner;
pub use pool::{ConstantPool, PoolEntry};
pub use report::PlanReport;
pub use resolver::Resolver;
pub use switch::{SwitchDispatchTable, SwitchTableBuilder};

/// Source of unique generated-type names.
///
/// Two concurrent compilations generating colliding type names would
/// corrupt the shared code-generation namespace, so the counter is atomic
/// and meant to be shared across every compilation of one process. It is
/// injected through [`LowerOptions`] rather than being a process global,
/// so tests can supply a fresh deterministic source.
#[derive(Debug, Clone)]
pub struct NameSource {
    counter: Arc<AtomicU64>,
    prefix: String,
}

impl NameSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        NameSource {
            counter: Arc::new(AtomicU64::new(0)),
            prefix: prefix.into(),
        }
    }

    /// A fresh name, unique across every clone of this source.
    pub fn fresh(&self, tag: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}${}", self.prefix, tag, n)
    }
}

impl Default for NameSource {
    fn default() -> Self {
        NameSource::new("larch$")
    }
}

/// How value-typed variables captured into nested lambdas behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// One mutable cell per variable; every occurrence, declaring scope
    /// included, reads and writes the cell, so all observers see live
    /// updates. This is the default.
    SharedCell,
    /// One slot per (capturing lambda, variable); each lambda occurrence
    /// publishes the current value into its own slots first, so every
    /// created lambda observes an independent snapshot.
    SnapshotPerLambda,
}

/// Per-compilation configuration.
#[derive(Debug, Clone)]
pub struct LowerOptions {
    pub layout: LayoutKind,
    pub capture_policy: CapturePolicy,
    pub names: NameSource,
    pub cells: CellCatalog,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions {
            layout: LayoutKind::Dynamic,
            capture_policy: CapturePolicy::SharedCell,
            names: NameSource::default(),
            cells: CellCatalog::default(),
        }
    }
}

/// Lower one lambda: plan, realize storage, resolve.
///
/// The phases are strictly sequential: the shared layout's packing
/// decisions depend on the total slot count, so nothing is realized until
/// the planner has seen the entire tree, nested lambdas included.
pub fn lower_lambda(
    root: &LambdaExpr,
    vars: &mut Vars,
    options: &LowerOptions,
) -> Result<LoweringOutput> {
    let (plan, mut layout, mut pool) = Planner::new(vars, options).plan(root)?;
    layout.realize()?;
    pool.realize()?;

    let closure_root = if layout.slot_count() > 0 {
        Some(vars.declare("$closure", layout.realized()?.ty.clone()))
    } else {
        None
    };
    let constants_root = if !pool.is_empty() {
        Some(vars.declare("$constants", pool.layout().realized()?.ty.clone()))
    } else {
        None
    };

    let resolver = Resolver::new(vars, &plan, &layout, &pool, closure_root, constants_root);
    let (rewritten, quote_values) = resolver.resolve(root)?;

    let closure = match closure_root {
        Some(root_var) => Some(plan::ClosureInfo {
            root: root_var,
            storage: layout.realized()?.clone(),
            init: layout.init(root_var)?,
        }),
        None => None,
    };
    let constants = match constants_root {
        Some(root_var) => {
            let mut instance = Vec::with_capacity(pool.len());
            for (slot, entry) in pool.entries().iter().enumerate() {
                instance.push(match entry {
                    PoolEntry::Data { value, .. } => PoolValue::Data(value.clone()),
                    PoolEntry::Quoted { .. } => PoolValue::Quoted(
                        quote_values
                            .get(&(slot as SlotId))
                            .expect("quote recipe recorded during resolve")
                            .clone(),
                    ),
                    PoolEntry::TableValues { switch, .. } => PoolValue::TableValues(*switch),
                    PoolEntry::TableIndexes { switch } => PoolValue::TableIndexes(*switch),
                });
            }
            Some(plan::ConstantsInfo {
                root: root_var,
                storage: pool.layout().realized()?.clone(),
                init: pool.layout().init(root_var)?,
                instance,
            })
        }
        None => None,
    };

    debug!(
        "lowering complete: {} captures, {} constants, {} tables",
        plan.captures.len(),
        pool.len(),
        plan.tables.len()
    );
    Ok(LoweringOutput {
        rewritten,
        closure,
        constants,
        captures: plan.captures,
        switch_tables: plan.table_info,
        tables: plan.tables,
        has_nested_lambdas: plan.has_nested_lambdas,
        delegate_array_slot: plan.delegate_array_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_tree::{BinaryOp, Expr, LambdaExpr, SwitchCase, Type, Value, VarId, Visibility};

    fn options() -> LowerOptions {
        LowerOptions {
            names: NameSource::new("t$"),
            ..LowerOptions::default()
        }
    }

    fn func_ty(params: Vec<Type>, ret: Type) -> Type {
        Type::Func {
            params,
            ret: Box::new(ret),
        }
    }

    fn lambda(params: Vec<VarId>, param_tys: Vec<Type>, ret: Type, body: Expr) -> LambdaExpr {
        LambdaExpr {
            params,
            body: Box::new(body),
            ty: func_ty(param_tys, ret),
        }
    }

    fn point_const(x: i64, y: i64) -> Expr {
        Expr::constant(
            Type::Struct {
                name: "Point".to_string(),
                visibility: Visibility::Public,
            },
            Value::StructVal {
                ty: "Point".to_string(),
                fields: vec![Value::Int(x), Value::Int(y)],
            },
        )
    }

    fn int_const(n: i64) -> Expr {
        Expr::constant(Type::Int32, Value::Int(n))
    }

    #[test]
    fn test_embedded_constant_takes_no_slot() {
        // (a, b) => a + 2: the literal is embedded, nothing is captured
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Int32);
        let b = vars.declare("b", Type::Int32);
        let root = lambda(
            vec![a, b],
            vec![Type::Int32, Type::Int32],
            Type::Int32,
            Expr::Binary {
                op: BinaryOp::Add,
                lifted: false,
                lhs: Box::new(Expr::Parameter(a)),
                rhs: Box::new(int_const(2)),
                ty: Type::Int32,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();
        assert!(out.closure.is_none());
        assert!(out.constants.is_none());
        assert_eq!(out.rewritten, Expr::Lambda(root));
    }

    #[test]
    fn test_equal_constants_share_one_slot() {
        // The same struct literal twice routes both occurrences to one
        // storage field
        let mut vars = Vars::new();
        let root = lambda(
            vec![],
            vec![],
            Type::Void,
            Expr::Block {
                vars: vec![],
                exprs: vec![point_const(1, 2), point_const(1, 2)],
                ty: Type::Void,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();
        let constants = out.constants.expect("struct constants are pooled");
        assert_eq!(constants.instance.len(), 1);
        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { exprs, .. } => {
                    assert_eq!(exprs[0], exprs[1]);
                    assert_eq!(exprs[0].kind(), "member");
                }
                other => panic!("expected block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    fn sibling_capture_tree(vars: &mut Vars) -> (VarId, LambdaExpr) {
        // (a) => { var x; [() => x, () => x] }, modeled as a block whose
        // two expressions are the sibling lambdas
        let a = vars.declare("a", Type::Int32);
        let x = vars.declare("x", Type::Int32);
        let thunk_ty = func_ty(vec![], Type::Int32);
        let inner = |vars_used: VarId| {
            Expr::Lambda(LambdaExpr {
                params: vec![],
                body: Box::new(Expr::Parameter(vars_used)),
                ty: thunk_ty.clone(),
            })
        };
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Void,
            Expr::Block {
                vars: vec![x],
                exprs: vec![inner(x), inner(x)],
                ty: Type::Void,
            },
        );
        (x, root)
    }

    #[test]
    fn test_sibling_lambdas_share_capture_slot() {
        let mut vars = Vars::new();
        let (x, root) = sibling_capture_tree(&mut vars);
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();

        assert!(out.has_nested_lambdas);
        assert!(out.delegate_array_slot.is_some());
        let closure = out.closure.expect("x is captured");
        // One slot for x, one for the delegate array
        assert_eq!(closure.storage.slots.len(), 2);
        assert_eq!(vars.ty(x), &Type::Int32);

        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { vars: block_vars, exprs, .. } => {
                    // x is hoisted out of the block declaration
                    assert!(block_vars.is_empty());
                    let body_of = |e: &Expr| match e {
                        Expr::Lambda(inner) => inner.body.as_ref().clone(),
                        other => panic!("expected lambda, got {:?}", other.kind()),
                    };
                    // Same slot, same access path, in both siblings
                    assert_eq!(body_of(&exprs[0]), body_of(&exprs[1]));
                    assert_eq!(body_of(&exprs[0]).kind(), "member");
                }
                other => panic!("expected block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_snapshot_policy_gives_independent_slots() {
        let mut vars = Vars::new();
        let (_, root) = sibling_capture_tree(&mut vars);
        let opts = LowerOptions {
            capture_policy: CapturePolicy::SnapshotPerLambda,
            names: NameSource::new("t$"),
            ..LowerOptions::default()
        };
        let out = lower_lambda(&root, &mut vars, &opts).unwrap();

        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { vars: block_vars, exprs, .. } => {
                    // Not hoisted: x stays a block local
                    assert_eq!(block_vars.len(), 1);
                    // Each occurrence publishes into its own slot first
                    for e in exprs {
                        match e {
                            Expr::Block { exprs: inner, .. } => {
                                assert_eq!(inner[0].kind(), "assign");
                                assert_eq!(inner[1].kind(), "lambda");
                            }
                            other => panic!("expected publish block, got {:?}", other.kind()),
                        }
                    }
                    // Distinct slots: the two publish targets differ
                    assert_ne!(exprs[0], exprs[1]);
                }
                other => panic!("expected block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_captured_parameter_republished_on_entry() {
        // (a) => (b) => b + a: the root parameter is captured, so the
        // root body republishes it into storage on every invocation
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Int32);
        let b = vars.declare("b", Type::Int32);
        let inner = LambdaExpr {
            params: vec![b],
            body: Box::new(Expr::Binary {
                op: BinaryOp::Add,
                lifted: false,
                lhs: Box::new(Expr::Parameter(b)),
                rhs: Box::new(Expr::Parameter(a)),
                ty: Type::Int32,
            }),
            ty: func_ty(vec![Type::Int32], Type::Int32),
        };
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            inner.ty.clone(),
            Expr::Lambda(inner),
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();

        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { exprs, .. } => {
                    // First the republish assignment, then the inner lambda
                    match &exprs[0] {
                        Expr::Assign { value, .. } => {
                            assert_eq!(**value, Expr::Parameter(a));
                        }
                        other => panic!("expected assign, got {:?}", other.kind()),
                    }
                    assert_eq!(exprs[1].kind(), "lambda");
                }
                other => panic!("expected republish block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_catch_variable_scopes_and_captures() {
        // (a) => try { a } catch (e: Err) { e; () => e }
        let mut vars = Vars::new();
        let err_ty = Type::Object {
            name: "Err".to_string(),
            visibility: Visibility::Public,
            overrides_equality: false,
        };
        let a = vars.declare("a", Type::Int32);
        let e = vars.declare("e", err_ty.clone());
        let thunk_ty = func_ty(vec![], err_ty.clone());
        let handler = larch_tree::CatchHandler {
            var: Some(e),
            exception_ty: err_ty.clone(),
            filter: None,
            body: Expr::Block {
                vars: vec![],
                exprs: vec![
                    Expr::Parameter(e),
                    Expr::Lambda(LambdaExpr {
                        params: vec![],
                        body: Box::new(Expr::Parameter(e)),
                        ty: thunk_ty,
                    }),
                ],
                ty: Type::Void,
            },
        };
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Void,
            Expr::Try {
                body: Box::new(Expr::Parameter(a)),
                handlers: vec![handler],
                fault: None,
                finally: None,
                ty: Type::Void,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();

        // The escape into the nested thunk is the only capture of e
        assert_eq!(out.captures.len(), 1);
        assert_eq!(out.captures[0].var, e);
        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Try { handlers, .. } => match &handlers[0].body {
                    Expr::Block { exprs, .. } => {
                        // Direct handler-body reference stays a parameter
                        assert_eq!(exprs[0], Expr::Parameter(e));
                        // The thunk body reads e through its slot
                        match &exprs[1] {
                            Expr::Lambda(inner) => {
                                assert_eq!(inner.body.kind(), "member")
                            }
                            other => panic!("expected lambda, got {:?}", other.kind()),
                        }
                    }
                    other => panic!("expected block, got {:?}", other.kind()),
                },
                other => panic!("expected try, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_quote_observes_live_storage() {
        // Documented SharedCell policy: a quoted tree referencing an outer
        // capture rebuilds against the live cell, not a frozen snapshot;
        // its recipe uses the very same slot access as unquoted references.
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Int32);
        let x = vars.declare("x", Type::Int32);
        let thunk_ty = func_ty(vec![], Type::Int32);
        let quoted = Expr::Quote(Box::new(Expr::Lambda(LambdaExpr {
            params: vec![],
            body: Box::new(Expr::Parameter(x)),
            ty: thunk_ty.clone(),
        })));
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Void,
            Expr::Block {
                vars: vec![x],
                exprs: vec![quoted, Expr::Parameter(x)],
                ty: Type::Void,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();
        let constants = out.constants.expect("quote is pooled");

        let (quote_site, plain_access) = match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { exprs, .. } => (exprs[0].clone(), exprs[1].clone()),
                other => panic!("expected block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        };
        // The quote collapsed into a pool access
        assert_eq!(quote_site.kind(), "member");
        // Its recipe references the same live cell as the plain access
        let recipe = constants
            .instance
            .iter()
            .find_map(|v| match v {
                PoolValue::Quoted(tree) => Some(tree.clone()),
                _ => None,
            })
            .expect("quoted recipe present");
        match recipe {
            Expr::Lambda(inner) => assert_eq!(*inner.body, plain_access),
            other => panic!("expected lambda recipe, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_constant_switch_registers_table() {
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Int32);
        let keys = [0i64, 2, 5, 1_000_001, 7, 1_000_000];
        let cases = keys
            .iter()
            .map(|&k| SwitchCase {
                tests: vec![int_const(k)],
                body: int_const(k * 10),
            })
            .collect();
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Int32,
            Expr::Switch {
                scrutinee: Box::new(Expr::Parameter(a)),
                cases,
                default: Some(Box::new(int_const(-1))),
                ty: Type::Int32,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();

        assert_eq!(out.switch_tables.len(), 1);
        let info = out.switch_tables[&0];
        let table = &out.tables[&0];
        assert_eq!(info.len, table.len());
        assert_ne!(info.values_slot, info.indexes_slot);
        // Both table arrays are pool slots
        let constants = out.constants.expect("table arrays live in the pool");
        assert!(matches!(
            constants.instance[info.values_slot as usize],
            PoolValue::TableValues(0)
        ));
        assert!(matches!(
            constants.instance[info.indexes_slot as usize],
            PoolValue::TableIndexes(0)
        ));
        // The switch node itself survives, branches rewritten normally
        match &out.rewritten {
            Expr::Lambda(l) => assert_eq!(l.body.kind(), "switch"),
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_float_switch_falls_back_silently() {
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Float64);
        let root = lambda(
            vec![a],
            vec![Type::Float64],
            Type::Int32,
            Expr::Switch {
                scrutinee: Box::new(Expr::Parameter(a)),
                cases: vec![SwitchCase {
                    tests: vec![Expr::constant(Type::Float64, Value::Float64(1.0))],
                    body: int_const(1),
                }],
                default: Some(Box::new(int_const(0))),
                ty: Type::Int32,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();
        assert!(out.switch_tables.is_empty());
        assert!(out.constants.is_none());
    }

    #[test]
    fn test_runtime_variables_fail_fast() {
        let mut vars = Vars::new();
        let a = vars.declare("a", Type::Int32);
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Void,
            Expr::RuntimeVariables(vec![a]),
        );
        let err = lower_lambda(&root, &mut vars, &options()).unwrap_err();
        assert_eq!(
            err,
            LowerError::UnsupportedExpressionShape {
                kind: "runtime-variables"
            }
        );
    }

    #[test]
    fn test_internal_type_capture_is_boxed() {
        let mut vars = Vars::new();
        let hidden = Type::Struct {
            name: "Acc".to_string(),
            visibility: Visibility::Internal,
        };
        let a = vars.declare("a", Type::Int32);
        let s = vars.declare("s", hidden.clone());
        let thunk_ty = func_ty(vec![], hidden.clone());
        let root = lambda(
            vec![a],
            vec![Type::Int32],
            Type::Void,
            Expr::Block {
                vars: vec![s],
                exprs: vec![Expr::Lambda(LambdaExpr {
                    params: vec![],
                    body: Box::new(Expr::Parameter(s)),
                    ty: thunk_ty,
                })],
                ty: Type::Void,
            },
        );
        let out = lower_lambda(&root, &mut vars, &options()).unwrap();
        let closure = out.closure.expect("s is captured");
        let field = closure
            .storage
            .slots
            .iter()
            .find(|f| f.ty == hidden)
            .expect("slot for s");
        assert!(field.boxed);
        // Access unwraps through the cell transparently
        match &out.rewritten {
            Expr::Lambda(l) => match l.body.as_ref() {
                Expr::Block { exprs, .. } => match &exprs[0] {
                    Expr::Lambda(inner) => match inner.body.as_ref() {
                        Expr::Member { name, ty, .. } => {
                            assert_eq!(name, "value");
                            assert_eq!(*ty, hidden);
                        }
                        other => panic!("expected member, got {:?}", other.kind()),
                    },
                    other => panic!("expected lambda, got {:?}", other.kind()),
                },
                other => panic!("expected block, got {:?}", other.kind()),
            },
            other => panic!("expected lambda, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_shared_layout_end_to_end() {
        let mut vars = Vars::new();
        let (_, root) = sibling_capture_tree(&mut vars);
        let opts = LowerOptions {
            layout: LayoutKind::Shared,
            names: NameSource::new("t$"),
            ..LowerOptions::default()
        };
        let out = lower_lambda(&root, &mut vars, &opts).unwrap();
        let closure = out.closure.expect("x is captured");
        // Two slots (x + delegate array) pack into a Pack2 shape
        match &closure.storage.ty {
            Type::Generic { base, args } => {
                assert_eq!(base, "Pack2");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected pack instantiation, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_name_source_never_collides() {
        // One process-wide source handed to two compilations must give
        // each generated storage type a distinct name.
        let shared = LowerOptions {
            names: NameSource::new("t$"),
            ..LowerOptions::default()
        };
        let build = |opts: &LowerOptions| {
            let mut vars = Vars::new();
            let root = lambda(vec![], vec![], Type::Void, point_const(3, 4));
            lower_lambda(&root, &mut vars, opts).unwrap()
        };
        let a = build(&shared);
        let b = build(&shared.clone());
        let name_of = |out: &LoweringOutput| match &out.constants.as_ref().unwrap().storage.ty {
            Type::Object { name, .. } => name.clone(),
            other => panic!("expected generated object, got {:?}", other),
        };
        assert_ne!(name_of(&a), name_of(&b));
    }
}
