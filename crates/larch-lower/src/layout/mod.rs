//! Slot storage layouts.
//!
//! A layout maps abstract slot ids onto concrete access paths from a root
//! parameter. Two strategies exist: `DynamicLayout` generates one fresh
//! storage type per compilation, `SharedLayout` packs slots onto reusable
//! bounded-arity tuple shapes. The strategy is a closed variant selected by
//! configuration, never by runtime type inspection. Both strategies box any
//! slot whose declared type is not nameable from emitted code; `access` and
//! `assign` unwrap and wrap through the cell so callers never see it.
//!
//! Lifecycle is strictly two-phase: all `define_slot` calls happen during
//! planning, `realize` runs exactly once, and only then are access paths
//! available. Layout shape decisions depend on the total slot count, so
//! the phases cannot interleave.

pub mod dynamic;
pub mod shared;

pub use dynamic::DynamicLayout;
pub use shared::SharedLayout;

use larch_tree::{Expr, Type, Value, VarId, Visibility};
use serde::Serialize;

use crate::error::{LowerError, Result};
use crate::NameSource;

/// Abstract storage location index, stable from assignment until the
/// resolve pass completes.
pub type SlotId = u32;

/// Member name of the single field of a boxed cell.
pub const CELL_VALUE_FIELD: &str = "value";

/// Which storage strategy a compilation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayoutKind {
    /// One generated storage type per compiled lambda
    Dynamic,
    /// Reusable tree of pre-declared tuple shapes
    Shared,
}

/// A slot as requested during planning.
#[derive(Debug, Clone)]
pub struct SlotDef {
    pub ty: Type,
    pub boxed: bool,
}

/// One member dereference on the way to a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSeg {
    pub name: String,
    pub ty: Type,
}

/// Final placement of one slot: the member chain from the root parameter,
/// the declared slot type, and whether a cell sits in between.
#[derive(Debug, Clone)]
pub struct SlotField {
    pub segs: Vec<PathSeg>,
    pub ty: Type,
    pub boxed: bool,
}

/// The realized storage: its concrete type and every slot's placement.
#[derive(Debug, Clone)]
pub struct RealizedStorage {
    pub ty: Type,
    pub slots: Vec<SlotField>,
}

/// The pre-declared boxed-cell shape. A cell is a public single-field
/// wrapper constructed from the wrapped value; a shape without that
/// constructor cannot box anything and is an internal inconsistency.
#[derive(Debug, Clone)]
pub struct CellShape {
    pub base: String,
    pub has_value_ctor: bool,
}

/// Catalog of cell shapes available to a compilation. Read-only once
/// built; safe to clone into concurrent compilations.
#[derive(Debug, Clone)]
pub struct CellCatalog {
    shape: CellShape,
}

impl Default for CellCatalog {
    fn default() -> Self {
        CellCatalog {
            shape: CellShape {
                base: "Cell".to_string(),
                has_value_ctor: true,
            },
        }
    }
}

impl CellCatalog {
    /// A catalog whose cell shape lacks its value constructor. Exists so
    /// the `MissingBoxingConstructor` path stays testable.
    pub fn without_value_ctor() -> Self {
        CellCatalog {
            shape: CellShape {
                base: "Cell".to_string(),
                has_value_ctor: false,
            },
        }
    }

    /// The cell type wrapping `ty`.
    pub fn wrap(&self, ty: &Type) -> Result<Type> {
        if !self.shape.has_value_ctor {
            return Err(LowerError::MissingBoxingConstructor {
                cell: self.shape.base.clone(),
                ty: ty.mangle(),
            });
        }
        Ok(Type::Generic {
            base: self.shape.base.clone(),
            args: vec![ty.clone()],
        })
    }

    /// Construction expression for a cell holding the default of `ty`.
    pub fn new_cell(&self, ty: &Type) -> Result<Expr> {
        let cell_ty = self.wrap(ty)?;
        Ok(Expr::New {
            ty: cell_ty,
            args: vec![Expr::constant(ty.clone(), Value::default_of(ty))],
        })
    }
}

/// Whether a slot of `ty` must live behind a boxed cell.
pub(crate) fn needs_boxed_cell(ty: &Type) -> bool {
    !ty.is_module_visible()
}

/// Common contract of both layout strategies.
pub trait SlotStorage {
    /// Request a slot for a value of `ty`. Planning phase only.
    fn define_slot(&mut self, ty: &Type) -> Result<SlotId>;

    /// Finalize field paths and the concrete storage type. Runs exactly
    /// once, after every slot request has been seen.
    fn realize(&mut self) -> Result<()>;

    /// The realized storage, available after `realize`.
    fn realized(&self) -> Result<&RealizedStorage>;

    fn slot_count(&self) -> usize;

    /// Construction expression assigning a fresh storage object to `root`.
    fn init(&self, root: VarId) -> Result<Expr>;

    /// Read access to a slot: the member chain from `root`, unwrapping
    /// through the cell for boxed slots.
    fn access(&self, root: VarId, slot: SlotId) -> Result<Expr> {
        let storage = self.realized()?;
        let field = &storage.slots[slot as usize];
        let mut expr = Expr::Parameter(root);
        for seg in &field.segs {
            expr = Expr::member(expr, seg.name.clone(), seg.ty.clone());
        }
        if field.boxed {
            expr = Expr::member(expr, CELL_VALUE_FIELD, field.ty.clone());
        }
        Ok(expr)
    }

    /// Write access to a slot, wrapping through the cell for boxed slots.
    fn assign(&self, root: VarId, slot: SlotId, value: Expr) -> Result<Expr> {
        Ok(Expr::assign(self.access(root, slot)?, value))
    }

    /// Number of member dereferences to reach a slot.
    fn path_depth(&self, slot: SlotId) -> Result<usize> {
        Ok(self.realized()?.slots[slot as usize].segs.len())
    }
}

/// The closed strategy variant used by one compilation.
#[derive(Debug)]
pub enum SlotLayout {
    Dynamic(DynamicLayout),
    Shared(SharedLayout),
}

impl SlotLayout {
    pub fn new(kind: LayoutKind, names: &NameSource, cells: &CellCatalog, tag: &'static str) -> Self {
        match kind {
            LayoutKind::Dynamic => {
                SlotLayout::Dynamic(DynamicLayout::new(names.clone(), cells.clone(), tag))
            }
            LayoutKind::Shared => SlotLayout::Shared(SharedLayout::new(cells.clone())),
        }
    }

    pub fn kind(&self) -> LayoutKind {
        match self {
            SlotLayout::Dynamic(_) => LayoutKind::Dynamic,
            SlotLayout::Shared(_) => LayoutKind::Shared,
        }
    }
}

impl SlotStorage for SlotLayout {
    fn define_slot(&mut self, ty: &Type) -> Result<SlotId> {
        match self {
            SlotLayout::Dynamic(l) => l.define_slot(ty),
            SlotLayout::Shared(l) => l.define_slot(ty),
        }
    }

    fn realize(&mut self) -> Result<()> {
        match self {
            SlotLayout::Dynamic(l) => l.realize(),
            SlotLayout::Shared(l) => l.realize(),
        }
    }

    fn realized(&self) -> Result<&RealizedStorage> {
        match self {
            SlotLayout::Dynamic(l) => l.realized(),
            SlotLayout::Shared(l) => l.realized(),
        }
    }

    fn slot_count(&self) -> usize {
        match self {
            SlotLayout::Dynamic(l) => l.slot_count(),
            SlotLayout::Shared(l) => l.slot_count(),
        }
    }

    fn init(&self, root: VarId) -> Result<Expr> {
        match self {
            SlotLayout::Dynamic(l) => l.init(root),
            SlotLayout::Shared(l) => l.init(root),
        }
    }
}

/// A public generated storage type named by the dynamic layout.
pub(crate) fn generated_object(name: String) -> Type {
    Type::Object {
        name,
        visibility: Visibility::Public,
        overrides_equality: false,
    }
}
