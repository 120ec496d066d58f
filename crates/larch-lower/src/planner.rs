//! Pass one: discover captures, poolable constants, nested lambdas and
//! switch dispatch tables.
//!
//! The planner walks the whole lambda once, depth-first, carrying a stack
//! of lambda frames; each frame stacks the block scopes of that lambda
//! (parameters, block locals, catch variables). Variable lookup searches
//! only the innermost frame; a reference declared in an outer lambda is a
//! capture and requests a slot. Slot requests are idempotent per capture
//! key, so the numbering is stable no matter how often a variable occurs.
//!
//! Nothing is rewritten here; the resolver runs later, against the
//! realized layout, and replays the same traversal order so that switch
//! and quote ordinals line up across the two passes.

use std::collections::HashSet;

use larch_tree::{CatchHandler, Expr, LambdaExpr, SwitchCase, Type, Value, VarId, Vars};
use log::{debug, trace};

use crate::error::{LowerError, Result};
use crate::layout::{needs_boxed_cell, SlotLayout, SlotStorage};
use crate::plan::{CaptureKey, CapturedVariable, LoweringPlan, SwitchTableInfo};
use crate::pool::ConstantPool;
use crate::switch::SwitchTableBuilder;
use crate::{CapturePolicy, LowerOptions};

struct Frame {
    scopes: Vec<HashSet<VarId>>,
    ordinal: usize,
}

pub struct Planner<'a> {
    vars: &'a Vars,
    options: &'a LowerOptions,
    layout: SlotLayout,
    pool: ConstantPool,
    plan: LoweringPlan,
    frames: Vec<Frame>,
    quote_depth: u32,
    next_switch: usize,
    next_quote: usize,
    next_lambda: usize,
}

impl<'a> Planner<'a> {
    pub fn new(vars: &'a Vars, options: &'a LowerOptions) -> Self {
        Planner {
            vars,
            options,
            layout: SlotLayout::new(options.layout, &options.names, &options.cells, "Closure"),
            pool: ConstantPool::new(options.layout, &options.names, &options.cells),
            plan: LoweringPlan::default(),
            frames: Vec::new(),
            quote_depth: 0,
            next_switch: 0,
            next_quote: 0,
            next_lambda: 0,
        }
    }

    /// Run the pass over the root lambda. Consumes the planner; the
    /// returned layout and pool still await realization.
    pub fn plan(
        mut self,
        root: &LambdaExpr,
    ) -> Result<(LoweringPlan, SlotLayout, ConstantPool)> {
        debug!("planning lambda with {} parameters", root.params.len());
        let ordinal = self.enter_lambda(&root.params);
        debug_assert_eq!(ordinal, 0);
        self.visit(&root.body)?;
        self.frames.pop();
        debug!(
            "planned: {} capture slots, {} pool slots, {} switch tables",
            self.plan.captures.len(),
            self.pool.len(),
            self.plan.tables.len()
        );
        Ok((self.plan, self.layout, self.pool))
    }

    fn enter_lambda(&mut self, params: &[VarId]) -> usize {
        let ordinal = self.next_lambda;
        self.next_lambda += 1;
        for &p in params {
            self.plan.param_owner.insert(p, ordinal);
        }
        self.frames.push(Frame {
            scopes: vec![params.iter().copied().collect()],
            ordinal,
        });
        ordinal
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

    /// Register an out-of-scope reference. Idempotent: the second request
    /// for the same capture key returns without allocating.
    fn capture(&mut self, var: VarId) -> Result<()> {
        let ty = self.vars.ty(var).clone();
        let lambda = self.frames.last().map(|f| f.ordinal).unwrap_or(0);
        let key = if self.options.capture_policy == CapturePolicy::SnapshotPerLambda
            && ty.is_value_type()
            && self.quote_depth == 0
            && lambda != 0
        {
            CaptureKey::PerLambda { var, lambda }
        } else {
            CaptureKey::Shared(var)
        };
        if !self.plan.capture_slots.contains_key(&key) {
            let slot = self.layout.define_slot(&ty)?;
            debug!(
                "captured {} (var {}) as slot {}",
                self.vars.info(var).name,
                var,
                slot
            );
            self.plan.captures.push(CapturedVariable {
                var,
                ty: ty.clone(),
                slot,
                needs_boxed_cell: needs_boxed_cell(&ty),
            });
            self.plan.capture_slots.insert(key, slot);
        }
        if self.options.capture_policy == CapturePolicy::SharedCell && ty.is_value_type() {
            // Every occurrence of an escaping value-typed variable goes
            // through the shared cell, declaring scope included.
            self.plan.hoisted.insert(var);
        }
        if self.plan.param_owner.contains_key(&var) {
            self.plan.republish.insert(var);
        }
        Ok(())
    }

    fn visit(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Parameter(v) => {
                if !self.bound_in_current_frame(*v) {
                    self.capture(*v)?;
                }
                Ok(())
            }
            Expr::Constant { ty, value } => {
                if ConstantPool::should_pool(ty, value) {
                    self.pool.intern(ty, value)?;
                }
                Ok(())
            }
            Expr::Unary { operand, .. } => self.visit(operand),
            Expr::Binary { lhs, rhs, .. } => {
                self.visit(lhs)?;
                self.visit(rhs)
            }
            Expr::Member { object, .. } => {
                if let Some(obj) = object {
                    self.visit(obj)?;
                }
                Ok(())
            }
            Expr::Call { target, args, .. } => {
                if let Some(t) = target {
                    self.visit(t)?;
                }
                for a in args {
                    self.visit(a)?;
                }
                Ok(())
            }
            Expr::New { args, .. } => {
                for a in args {
                    self.visit(a)?;
                }
                Ok(())
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
                ..
            } => {
                self.visit(cond)?;
                self.visit(then)?;
                self.visit(otherwise)
            }
            Expr::Switch {
                scrutinee,
                cases,
                default,
                ..
            } => self.visit_switch(scrutinee, cases, default.as_deref()),
            Expr::Try {
                body,
                handlers,
                fault,
                finally,
                ..
            } => {
                self.visit(body)?;
                for h in handlers {
                    self.visit_handler(h)?;
                }
                if let Some(f) = fault {
                    self.visit(f)?;
                }
                if let Some(f) = finally {
                    self.visit(f)?;
                }
                Ok(())
            }
            Expr::Block { vars, exprs, .. } => {
                self.push_scope(vars.iter().copied());
                for e in exprs {
                    self.visit(e)?;
                }
                self.pop_scope();
                Ok(())
            }
            Expr::Loop { body, .. } => self.visit(body),
            Expr::Goto { value, .. } => {
                if let Some(v) = value {
                    self.visit(v)?;
                }
                Ok(())
            }
            Expr::LabelTarget { default, .. } => {
                if let Some(d) = default {
                    self.visit(d)?;
                }
                Ok(())
            }
            Expr::Lambda(l) => self.visit_lambda(l),
            Expr::Quote(inner) => self.visit_quote(inner),
            Expr::Assign { target, value } => {
                self.visit(target)?;
                self.visit(value)
            }
            Expr::RuntimeVariables(_) => Err(LowerError::UnsupportedExpressionShape {
                kind: expr.kind(),
            }),
        }
    }

    fn visit_handler(&mut self, handler: &CatchHandler) -> Result<()> {
        self.push_scope(handler.var);
        if let Some(filter) = &handler.filter {
            self.visit(filter)?;
        }
        self.visit(&handler.body)?;
        self.pop_scope();
        Ok(())
    }

    fn visit_lambda(&mut self, lambda: &LambdaExpr) -> Result<()> {
        if self.quote_depth == 0 {
            self.plan.has_nested_lambdas = true;
            if self.plan.delegate_array_slot.is_none() {
                let ty = Type::Array(Box::new(Type::delegate()));
                self.plan.delegate_array_slot = Some(self.layout.define_slot(&ty)?);
                trace!("reserved delegate-array slot");
            }
        }
        self.enter_lambda(&lambda.params);
        self.visit(&lambda.body)?;
        self.frames.pop();
        Ok(())
    }

    /// Quoted subtrees are data, not call targets: captures and pooled
    /// constants inside them still register (the rebuild initializer
    /// substitutes them), but nested lambdas under a quote reserve no
    /// delegate slot. When the outermost quote closes, the whole subtree
    /// becomes one pooled Expression constant.
    fn visit_quote(&mut self, inner: &Expr) -> Result<()> {
        let ordinal = self.next_quote;
        self.next_quote += 1;
        self.quote_depth += 1;
        self.visit(inner)?;
        self.quote_depth -= 1;
        if self.quote_depth == 0 {
            let ty = match inner {
                Expr::Lambda(l) => Type::Expression(Box::new(l.ty.clone())),
                _ => Type::Expression(Box::new(Type::Void)),
            };
            self.pool.intern_quote(ordinal, &ty)?;
            trace!("pooled quote {}", ordinal);
        }
        Ok(())
    }

    fn visit_switch(
        &mut self,
        scrutinee: &Expr,
        cases: &[SwitchCase],
        default: Option<&Expr>,
    ) -> Result<()> {
        let ordinal = self.next_switch;
        self.next_switch += 1;
        self.visit(scrutinee)?;

        let mut keys: Vec<(&Type, &Value)> = Vec::new();
        let mut all_constant = !cases.is_empty();
        for case in cases {
            if case.tests.is_empty() {
                all_constant = false;
            }
            for test in &case.tests {
                match test {
                    Expr::Constant { ty, value } => keys.push((ty, value)),
                    _ => all_constant = false,
                }
            }
        }

        let mut registered = false;
        if all_constant && !keys.is_empty() {
            let elem_ty = keys[0].0;
            if keys.iter().all(|(ty, _)| *ty == elem_ty) {
                let values: Vec<Value> = keys.iter().map(|(_, v)| (*v).clone()).collect();
                if let Some(table) = SwitchTableBuilder::build(elem_ty, &values) {
                    let (values_slot, indexes_slot) = self.pool.add_table(ordinal, elem_ty)?;
                    let len = table.len();
                    self.plan.tables.insert(ordinal, table);
                    self.plan.table_info.insert(
                        ordinal,
                        SwitchTableInfo {
                            values_slot,
                            indexes_slot,
                            len,
                        },
                    );
                    registered = true;
                }
            }
        }
        if !registered {
            // Linear dispatch compares each test inline, so the tests are
            // ordinary nodes needing planning.
            for case in cases {
                for test in &case.tests {
                    self.visit(test)?;
                }
            }
        }
        for case in cases {
            self.visit(&case.body)?;
        }
        if let Some(d) = default {
            self.visit(d)?;
        }
        Ok(())
    }
}
