//! Pass two: rewrite the tree against the finalized layout.
//!
//! Runs only after the planner has completed and both storages are
//! realized. The resolver replays the planner's traversal order (switch,
//! quote and lambda ordinals are counted identically), so every slot
//! recorded in the plan lines up with the node being rewritten. No slot is
//! allocated here; an unmodeled node kind is a hard failure.

use std::collections::{BTreeMap, HashSet};

use larch_tree::{CatchHandler, Expr, LambdaExpr, SwitchCase, Type, VarId, Vars};
use log::debug;

use crate::error::{LowerError, Result};
use crate::layout::{SlotId, SlotLayout, SlotStorage};
use crate::plan::{CaptureKey, LoweringPlan};
use crate::pool::ConstantPool;

struct Frame {
    scopes: Vec<HashSet<VarId>>,
    ordinal: usize,
}

pub struct Resolver<'a> {
    #[allow(dead_code)]
    vars: &'a Vars,
    plan: &'a LoweringPlan,
    layout: &'a SlotLayout,
    pool: &'a ConstantPool,
    closure_root: Option<VarId>,
    constants_root: Option<VarId>,
    frames: Vec<Frame>,
    quote_depth: u32,
    next_switch: usize,
    next_quote: usize,
    next_lambda: usize,
    quote_values: BTreeMap<SlotId, Expr>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        vars: &'a Vars,
        plan: &'a LoweringPlan,
        layout: &'a SlotLayout,
        pool: &'a ConstantPool,
        closure_root: Option<VarId>,
        constants_root: Option<VarId>,
    ) -> Self {
        Resolver {
            vars,
            plan,
            layout,
            pool,
            closure_root,
            constants_root,
            frames: Vec::new(),
            quote_depth: 0,
            next_switch: 0,
            next_quote: 0,
            next_lambda: 0,
            quote_values: BTreeMap::new(),
        }
    }

    /// Rewrite the root lambda. Returns the rewritten tree and the
    /// substituted rebuild trees of pooled quote slots.
    pub fn resolve(mut self, root: &LambdaExpr) -> Result<(Expr, BTreeMap<SlotId, Expr>)> {
        let ordinal = self.enter_lambda(&root.params);
        debug_assert_eq!(ordinal, 0);
        let body = self.rewrite(&root.body)?;
        let body = self.apply_republish(&root.params, body, &root.ty)?;
        self.frames.pop();
        debug!("resolved tree, {} quote recipes", self.quote_values.len());
        let rewritten = Expr::Lambda(LambdaExpr {
            params: root.params.clone(),
            body: Box::new(body),
            ty: root.ty.clone(),
        });
        Ok((rewritten, self.quote_values))
    }

    fn enter_lambda(&mut self, params: &[VarId]) -> usize {
        let ordinal = self.next_lambda;
        self.next_lambda += 1;
        self.frames.push(Frame {
            scopes: vec![params.iter().copied().collect()],
            ordinal,
        });
        ordinal
    }

    fn current_ordinal(&self) -> usize {
        self.frames.last().map(|f| f.ordinal).unwrap_or(0)
    }

    fn bound_in_current_frame(&self, var: VarId) -> bool {
        self.frames
            .last()
            .map(|f| f.scopes.iter().any(|s| s.contains(&var)))
            .unwrap_or(false)
    }

    fn push_scope(&mut self, vars: impl IntoIterator<Item = VarId>) {
        self.frames
            .last_mut()
            .expect("scope outside any lambda")
            .scopes
            .push(vars.into_iter().collect());
    }

    fn pop_scope(&mut self) {
        self.frames
            .last_mut()
            .expect("scope outside any lambda")
            .scopes
            .pop();
    }

    fn closure_access(&self, slot: SlotId) -> Result<Expr> {
        let root = self
            .closure_root
            .expect("closure root exists whenever a capture slot does");
        self.layout.access(root, slot)
    }

    fn closure_assign(&self, slot: SlotId, value: Expr) -> Result<Expr> {
        let root = self
            .closure_root
            .expect("closure root exists whenever a capture slot does");
        self.layout.assign(root, slot, value)
    }

    fn pool_access(&self, slot: SlotId) -> Result<Expr> {
        let root = self
            .constants_root
            .expect("constants root exists whenever a pool slot does");
        self.pool.access(root, slot)
    }

    fn ret_ty(lambda_ty: &Type) -> Type {
        match lambda_ty {
            Type::Func { ret, .. } => (**ret).clone(),
            _ => Type::Void,
        }
    }

    /// Prepend one assignment per captured parameter, republishing the
    /// incoming argument into shared storage on every invocation.
    fn apply_republish(&self, params: &[VarId], body: Expr, lambda_ty: &Type) -> Result<Expr> {
        let mut exprs = Vec::new();
        for &p in params {
            if !self.plan.republish.contains(&p) {
                continue;
            }
            if let Some(&slot) = self.plan.capture_slots.get(&CaptureKey::Shared(p)) {
                exprs.push(self.closure_assign(slot, Expr::Parameter(p))?);
            }
        }
        if exprs.is_empty() {
            return Ok(body);
        }
        let ty = Self::ret_ty(lambda_ty);
        exprs.push(body);
        Ok(Expr::Block {
            vars: vec![],
            exprs,
            ty,
        })
    }

    fn rewrite(&mut self, expr: &Expr) -> Result<Expr> {
        match expr {
            Expr::Parameter(v) => {
                if self.plan.hoisted.contains(v) {
                    let slot = self
                        .plan
                        .capture_slot(*v, self.current_ordinal())
                        .expect("hoisted variable has a slot");
                    return self.closure_access(slot);
                }
                if !self.bound_in_current_frame(*v) {
                    if let Some(slot) = self.plan.capture_slot(*v, self.current_ordinal()) {
                        return self.closure_access(slot);
                    }
                }
                Ok(Expr::Parameter(*v))
            }
            Expr::Constant { ty, value } => {
                if let Some(slot) = self.pool.lookup(ty, value) {
                    return self.pool_access(slot);
                }
                Ok(expr.clone())
            }
            Expr::Unary {
                op,
                lifted,
                operand,
                ty,
            } => Ok(Expr::Unary {
                op: *op,
                lifted: *lifted,
                operand: Box::new(self.rewrite(operand)?),
                ty: ty.clone(),
            }),
            Expr::Binary {
                op,
                lifted,
                lhs,
                rhs,
                ty,
            } => Ok(Expr::Binary {
                op: *op,
                lifted: *lifted,
                lhs: Box::new(self.rewrite(lhs)?),
                rhs: Box::new(self.rewrite(rhs)?),
                ty: ty.clone(),
            }),
            Expr::Member { object, name, ty } => Ok(Expr::Member {
                object: match object {
                    Some(o) => Some(Box::new(self.rewrite(o)?)),
                    None => None,
                },
                name: name.clone(),
                ty: ty.clone(),
            }),
            Expr::Call {
                target,
                method,
                args,
                ty,
            } => Ok(Expr::Call {
                target: match target {
                    Some(t) => Some(Box::new(self.rewrite(t)?)),
                    None => None,
                },
                method: method.clone(),
                args: self.rewrite_all(args)?,
                ty: ty.clone(),
            }),
            Expr::New { ty, args } => Ok(Expr::New {
                ty: ty.clone(),
                args: self.rewrite_all(args)?,
            }),
            Expr::Conditional {
                cond,
                then,
                otherwise,
                ty,
            } => Ok(Expr::Conditional {
                cond: Box::new(self.rewrite(cond)?),
                then: Box::new(self.rewrite(then)?),
                otherwise: Box::new(self.rewrite(otherwise)?),
                ty: ty.clone(),
            }),
            Expr::Switch {
                scrutinee,
                cases,
                default,
                ty,
            } => self.rewrite_switch(scrutinee, cases, default.as_deref(), ty),
            Expr::Try {
                body,
                handlers,
                fault,
                finally,
                ty,
            } => {
                let body = Box::new(self.rewrite(body)?);
                let mut new_handlers = Vec::with_capacity(handlers.len());
                for h in handlers {
                    self.push_scope(h.var);
                    let filter = match &h.filter {
                        Some(f) => Some(self.rewrite(f)?),
                        None => None,
                    };
                    let hbody = self.rewrite(&h.body)?;
                    self.pop_scope();
                    new_handlers.push(CatchHandler {
                        var: h.var,
                        exception_ty: h.exception_ty.clone(),
                        filter,
                        body: hbody,
                    });
                }
                let fault = match fault {
                    Some(f) => Some(Box::new(self.rewrite(f)?)),
                    None => None,
                };
                let finally = match finally {
                    Some(f) => Some(Box::new(self.rewrite(f)?)),
                    None => None,
                };
                Ok(Expr::Try {
                    body,
                    handlers: new_handlers,
                    fault,
                    finally,
                    ty: ty.clone(),
                })
            }
            Expr::Block { vars, exprs, ty } => {
                self.push_scope(vars.iter().copied());
                let exprs = self.rewrite_all(exprs)?;
                self.pop_scope();
                // Hoisted locals live in storage now; drop their
                // declarations from the rewritten block.
                let vars = vars
                    .iter()
                    .copied()
                    .filter(|v| !self.plan.hoisted.contains(v))
                    .collect();
                Ok(Expr::Block {
                    vars,
                    exprs,
                    ty: ty.clone(),
                })
            }
            Expr::Loop {
                body,
                break_label,
                continue_label,
            } => Ok(Expr::Loop {
                body: Box::new(self.rewrite(body)?),
                break_label: *break_label,
                continue_label: *continue_label,
            }),
            Expr::Goto { label, value } => Ok(Expr::Goto {
                label: *label,
                value: match value {
                    Some(v) => Some(Box::new(self.rewrite(v)?)),
                    None => None,
                },
            }),
            Expr::LabelTarget { label, default } => Ok(Expr::LabelTarget {
                label: *label,
                default: match default {
                    Some(d) => Some(Box::new(self.rewrite(d)?)),
                    None => None,
                },
            }),
            Expr::Lambda(l) => self.rewrite_lambda(l),
            Expr::Quote(inner) => self.rewrite_quote(inner),
            Expr::Assign { target, value } => Ok(Expr::Assign {
                target: Box::new(self.rewrite(target)?),
                value: Box::new(self.rewrite(value)?),
            }),
            Expr::RuntimeVariables(_) => Err(LowerError::UnsupportedExpressionShape {
                kind: expr.kind(),
            }),
        }
    }

    fn rewrite_all(&mut self, exprs: &[Expr]) -> Result<Vec<Expr>> {
        let mut out = Vec::with_capacity(exprs.len());
        for e in exprs {
            out.push(self.rewrite(e)?);
        }
        Ok(out)
    }

    fn rewrite_lambda(&mut self, lambda: &LambdaExpr) -> Result<Expr> {
        let ordinal = self.next_lambda;
        self.next_lambda += 1;

        // Snapshot policy: publish current values into this lambda's own
        // slots before the lambda value is produced. The published values
        // are rewritten in the enclosing context.
        let mut publishes = Vec::new();
        for (var, slot) in self.plan.snapshot_slots(ordinal) {
            let value = self.rewrite(&Expr::Parameter(var))?;
            publishes.push(self.closure_assign(slot, value)?);
        }

        self.frames.push(Frame {
            scopes: vec![lambda.params.iter().copied().collect()],
            ordinal,
        });
        let body = self.rewrite(&lambda.body)?;
        let body = self.apply_republish(&lambda.params, body, &lambda.ty)?;
        self.frames.pop();

        let rewritten = Expr::Lambda(LambdaExpr {
            params: lambda.params.clone(),
            body: Box::new(body),
            ty: lambda.ty.clone(),
        });
        if publishes.is_empty() {
            Ok(rewritten)
        } else {
            let ty = lambda.ty.clone();
            publishes.push(rewritten);
            Ok(Expr::Block {
                vars: vec![],
                exprs: publishes,
                ty,
            })
        }
    }

    /// Rewrite a quoted subtree at its use site. Capture and constant
    /// references inside it are substituted against live storage, and the
    /// outermost quote collapses into its pool slot. The recorded recipe
    /// is what the generated initializer rebuilds per invocation.
    fn rewrite_quote(&mut self, inner: &Expr) -> Result<Expr> {
        let ordinal = self.next_quote;
        self.next_quote += 1;
        self.quote_depth += 1;
        let rewritten = self.rewrite(inner)?;
        self.quote_depth -= 1;
        if self.quote_depth == 0 {
            if let Some(slot) = self.pool.quote_slot(ordinal) {
                self.quote_values.insert(slot, rewritten);
                return self.pool_access(slot);
            }
        }
        Ok(Expr::Quote(Box::new(rewritten)))
    }

    fn rewrite_switch(
        &mut self,
        scrutinee: &Expr,
        cases: &[SwitchCase],
        default: Option<&Expr>,
        ty: &Type,
    ) -> Result<Expr> {
        let ordinal = self.next_switch;
        self.next_switch += 1;
        let scrutinee = Box::new(self.rewrite(scrutinee)?);
        // Tests before bodies, matching the planner's traversal order. A
        // table-registered switch keeps its constant tests verbatim; the
        // emitter dispatches through the table and the planner never
        // treated those constants as ordinary nodes.
        let registered = self.plan.tables.contains_key(&ordinal);
        let mut new_tests = Vec::with_capacity(cases.len());
        for case in cases {
            if registered {
                new_tests.push(case.tests.clone());
            } else {
                new_tests.push(self.rewrite_all(&case.tests)?);
            }
        }
        let mut new_cases = Vec::with_capacity(cases.len());
        for (case, tests) in cases.iter().zip(new_tests) {
            new_cases.push(SwitchCase {
                tests,
                body: self.rewrite(&case.body)?,
            });
        }
        let default = match default {
            Some(d) => Some(Box::new(self.rewrite(d)?)),
            None => None,
        };
        Ok(Expr::Switch {
            scrutinee,
            cases: new_cases,
            default,
            ty: ty.clone(),
        })
    }
}
