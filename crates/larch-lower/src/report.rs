//! Serializable summary of a lowering, for tooling and logs.

use serde::Serialize;

use larch_tree::Vars;

use crate::layout::{LayoutKind, RealizedStorage};
use crate::plan::{LoweringOutput, PoolValue, SwitchTableInfo};

/// One captured variable as it appears in the report.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub name: String,
    pub ty: String,
    pub slot: u32,
    pub boxed: bool,
}

/// One storage object in the report.
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub ty: String,
    pub slots: usize,
    /// Longest member chain from the root to any slot
    pub max_access_depth: usize,
}

/// Breakdown of the constant pool by entry kind.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolBreakdown {
    pub data: usize,
    pub quoted: usize,
    pub table_arrays: usize,
}

/// Everything a caller might want to log or inspect about one lowering,
/// without keeping the trees themselves around.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub layout: LayoutKind,
    pub captures: Vec<CaptureReport>,
    pub closure: Option<StorageReport>,
    pub constants: Option<StorageReport>,
    pub pool: PoolBreakdown,
    pub switch_tables: Vec<SwitchTableInfo>,
    pub has_nested_lambdas: bool,
}

impl PlanReport {
    pub fn new(output: &LoweringOutput, vars: &Vars, layout: LayoutKind) -> Self {
        let storage_report = |storage: &RealizedStorage| StorageReport {
            ty: storage.ty.mangle(),
            slots: storage.slots.len(),
            max_access_depth: storage
                .slots
                .iter()
                .map(|f| f.segs.len())
                .max()
                .unwrap_or(0),
        };
        let captures = output
            .captures
            .iter()
            .map(|c| CaptureReport {
                name: vars.info(c.var).name.clone(),
                ty: c.ty.mangle(),
                slot: c.slot,
                boxed: c.needs_boxed_cell,
            })
            .collect();
        let mut pool = PoolBreakdown::default();
        if let Some(constants) = &output.constants {
            for value in &constants.instance {
                match value {
                    PoolValue::Data(_) => pool.data += 1,
                    PoolValue::Quoted(_) => pool.quoted += 1,
                    PoolValue::TableValues(_) | PoolValue::TableIndexes(_) => {
                        pool.table_arrays += 1
                    }
                }
            }
        }
        PlanReport {
            layout,
            captures,
            closure: output.closure.as_ref().map(|c| storage_report(&c.storage)),
            constants: output
                .constants
                .as_ref()
                .map(|c| storage_report(&c.storage)),
            pool,
            switch_tables: output.switch_tables.values().copied().collect(),
            has_nested_lambdas: output.has_nested_lambdas,
        }
    }

    /// Pretty JSON, for dumping into build logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
