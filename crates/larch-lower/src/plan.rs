//! Plan aggregates: what the first pass discovered and what the whole
//! lowering hands to the bytecode emitter.

use std::collections::{BTreeMap, HashMap, HashSet};

use larch_tree::{Expr, Type, Value, VarId};
use serde::Serialize;

use crate::layout::{RealizedStorage, SlotId};
use crate::switch::SwitchDispatchTable;

/// One externalized variable.
#[derive(Debug, Clone)]
pub struct CapturedVariable {
    pub var: VarId,
    pub ty: Type,
    pub slot: SlotId,
    /// True when the declared type is not nameable from emitted code and
    /// the slot sits behind a boxed cell
    pub needs_boxed_cell: bool,
}

/// How a capture is keyed. Shared captures have one slot per variable
/// identity; under the snapshot policy, value-typed captures get one slot
/// per (capturing lambda, variable) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKey {
    Shared(VarId),
    PerLambda { var: VarId, lambda: usize },
}

/// Emitter-facing identity of one switch dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchTableInfo {
    pub values_slot: SlotId,
    pub indexes_slot: SlotId,
    pub len: usize,
}

/// Everything the first pass discovered. Slot ids recorded here are
/// stable until the resolve pass completes.
#[derive(Debug, Default)]
pub struct LoweringPlan {
    pub captures: Vec<CapturedVariable>,
    pub capture_slots: HashMap<CaptureKey, SlotId>,
    /// Value-typed captured variables routed through their slot at every
    /// occurrence, declaring scope included (shared-cell policy)
    pub hoisted: HashSet<VarId>,
    /// Lambda parameters that also appear as captures; their current
    /// argument value is republished into storage on every invocation
    pub republish: HashSet<VarId>,
    /// Owning lambda ordinal per parameter (root lambda is 0)
    pub param_owner: HashMap<VarId, usize>,
    pub has_nested_lambdas: bool,
    /// Slot reserved for the delegate array once a nested lambda is seen
    pub delegate_array_slot: Option<SlotId>,
    /// Dispatch tables keyed by the switch node's depth-first ordinal
    pub tables: BTreeMap<usize, SwitchDispatchTable>,
    pub table_info: BTreeMap<usize, SwitchTableInfo>,
}

impl LoweringPlan {
    /// Slot for a reference to `var` made inside lambda `lambda`, if the
    /// variable was captured. Per-lambda keys shadow the shared key.
    pub fn capture_slot(&self, var: VarId, lambda: usize) -> Option<SlotId> {
        self.capture_slots
            .get(&CaptureKey::PerLambda { var, lambda })
            .or_else(|| self.capture_slots.get(&CaptureKey::Shared(var)))
            .copied()
    }

    /// Snapshot slots owned by one lambda, in slot order.
    pub fn snapshot_slots(&self, lambda: usize) -> Vec<(VarId, SlotId)> {
        let mut out: Vec<(VarId, SlotId)> = self
            .capture_slots
            .iter()
            .filter_map(|(key, &slot)| match key {
                CaptureKey::PerLambda { var, lambda: l } if *l == lambda => Some((*var, slot)),
                _ => None,
            })
            .collect();
        out.sort_by_key(|&(_, slot)| slot);
        out
    }
}

/// Materialized payload of one constant-pool slot, in slot order.
#[derive(Debug, Clone)]
pub enum PoolValue {
    /// Raw data the emitter stores as-is
    Data(Value),
    /// Substituted rebuild tree for a quoted constant; the generated
    /// initializer reconstructs it per enclosing invocation
    Quoted(Expr),
    /// Realized bucket values of the dispatch table with this ordinal
    TableValues(usize),
    /// Realized bucket ordinals of the dispatch table with this ordinal
    TableIndexes(usize),
}

/// Realized closure storage handed to the emitter.
#[derive(Debug)]
pub struct ClosureInfo {
    pub root: VarId,
    pub storage: RealizedStorage,
    /// Construction expression the emitter runs before the rewritten body
    pub init: Expr,
}

/// Realized constant-pool storage plus its materialized instance.
#[derive(Debug)]
pub struct ConstantsInfo {
    pub root: VarId,
    pub storage: RealizedStorage,
    pub init: Expr,
    pub instance: Vec<PoolValue>,
}

/// The full output contract of a lowering.
#[derive(Debug)]
pub struct LoweringOutput {
    pub rewritten: Expr,
    pub closure: Option<ClosureInfo>,
    pub constants: Option<ConstantsInfo>,
    /// Every captured variable and the closure slot it landed in
    pub captures: Vec<CapturedVariable>,
    /// Per eligible switch node: values slot, indexes slot, modulus
    pub switch_tables: BTreeMap<usize, SwitchTableInfo>,
    /// The tables themselves, for the emitter to materialize
    pub tables: BTreeMap<usize, SwitchDispatchTable>,
    pub has_nested_lambdas: bool,
    pub delegate_array_slot: Option<SlotId>,
}
