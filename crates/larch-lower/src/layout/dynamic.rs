//! Dynamic layout: one generated storage type per compiled lambda, one
//! public field per slot. Simple and flat, but every compilation registers
//! a new type with the code-generation namespace, so the type name comes
//! from the injected cross-compilation `NameSource`.

use larch_tree::{Expr, Type, VarId};
use log::{debug, trace};

use crate::error::{LowerError, Result};
use crate::layout::{
    generated_object, needs_boxed_cell, CellCatalog, PathSeg, RealizedStorage, SlotDef,
    SlotField, SlotId, SlotStorage,
};
use crate::NameSource;

#[derive(Debug)]
pub struct DynamicLayout {
    slots: Vec<SlotDef>,
    names: NameSource,
    cells: CellCatalog,
    /// Name-source tag for the generated storage type
    tag: &'static str,
    realized: Option<RealizedStorage>,
}

impl DynamicLayout {
    pub fn new(names: NameSource, cells: CellCatalog, tag: &'static str) -> Self {
        DynamicLayout {
            slots: Vec::new(),
            names,
            cells,
            tag,
            realized: None,
        }
    }

    /// Deterministic field name from slot index and type.
    fn field_name(index: usize, ty: &Type) -> String {
        format!("v{}_{}", index, ty.mangle())
    }
}

impl SlotStorage for DynamicLayout {
    fn define_slot(&mut self, ty: &Type) -> Result<SlotId> {
        if self.realized.is_some() {
            return Err(LowerError::StorageRealized);
        }
        let id = self.slots.len() as SlotId;
        let boxed = needs_boxed_cell(ty);
        trace!("dynamic slot {} for {} (boxed: {})", id, ty.mangle(), boxed);
        self.slots.push(SlotDef {
            ty: ty.clone(),
            boxed,
        });
        Ok(id)
    }

    fn realize(&mut self) -> Result<()> {
        if self.realized.is_some() {
            return Err(LowerError::StorageRealized);
        }
        let name = self.names.fresh(self.tag);
        let mut fields = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let field_ty = if slot.boxed {
                self.cells.wrap(&slot.ty)?
            } else {
                slot.ty.clone()
            };
            fields.push(SlotField {
                segs: vec![PathSeg {
                    name: Self::field_name(i, &slot.ty),
                    ty: field_ty,
                }],
                ty: slot.ty.clone(),
                boxed: slot.boxed,
            });
        }
        debug!("realized dynamic storage {} with {} fields", name, fields.len());
        self.realized = Some(RealizedStorage {
            ty: generated_object(name),
            slots: fields,
        });
        Ok(())
    }

    fn realized(&self) -> Result<&RealizedStorage> {
        self.realized.as_ref().ok_or(LowerError::StorageNotRealized)
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn init(&self, root: VarId) -> Result<Expr> {
        let storage = self.realized()?;
        let mut exprs = vec![Expr::assign(
            Expr::Parameter(root),
            Expr::New {
                ty: storage.ty.clone(),
                args: vec![],
            },
        )];
        // Fresh objects come zeroed; only boxed fields need their cells
        // constructed up front.
        for (i, field) in storage.slots.iter().enumerate() {
            if field.boxed {
                let seg = &field.segs[0];
                let target =
                    Expr::member(Expr::Parameter(root), seg.name.clone(), seg.ty.clone());
                exprs.push(Expr::assign(target, self.cells.new_cell(&field.ty)?));
                trace!("init cell for dynamic slot {}", i);
            }
        }
        Ok(Expr::Block {
            vars: vec![],
            exprs,
            ty: Type::Void,
        })
    }
}
