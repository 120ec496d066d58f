//! Shared layout: slots packed onto a balanced tree of bounded-arity
//! tuple-like shapes.
//!
//! The shapes (`Pack2`..`Pack8`) are pre-declared once for the whole
//! process and reused across arbitrarily many compilations, so no new type
//! is registered per lambda. The price is packing bookkeeping: each new
//! slot either joins an internal node with spare capacity or splits the
//! structurally lightest leaf, keeping access paths near-logarithmic in
//! the live slot count.
//!
//! The packing tree is an arena of nodes addressed by index; children
//! reference slots or other nodes by index, never by pointer.

use larch_tree::{Expr, Type, Value, VarId};
use log::{debug, trace};

use crate::error::{LowerError, Result};
use crate::layout::{
    needs_boxed_cell, CellCatalog, PathSeg, RealizedStorage, SlotDef, SlotField, SlotId,
    SlotStorage,
};

/// Smallest pre-declared tuple shape.
pub const MIN_PACK_ARITY: usize = 2;
/// Largest pre-declared tuple shape; the arity bound of internal nodes.
pub const MAX_PACK_ARITY: usize = 8;

/// Shape name for a given arity.
pub fn pack_base(arity: usize) -> String {
    debug_assert!((MIN_PACK_ARITY..=MAX_PACK_ARITY).contains(&arity));
    format!("Pack{}", arity)
}

/// Tuple member name for a child position.
fn item_name(position: usize) -> String {
    format!("item{}", position)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Leaf(SlotId),
    Node(usize),
}

#[derive(Debug)]
struct PackNode {
    children: Vec<Child>,
}

#[derive(Debug)]
pub struct SharedLayout {
    slots: Vec<SlotDef>,
    nodes: Vec<PackNode>,
    root: Option<Child>,
    cells: CellCatalog,
    realized: Option<RealizedStorage>,
}

impl SharedLayout {
    pub fn new(cells: CellCatalog) -> Self {
        SharedLayout {
            slots: Vec::new(),
            nodes: Vec::new(),
            root: None,
            cells,
            realized: None,
        }
    }

    fn leaf_count(&self, child: Child) -> usize {
        match child {
            Child::Leaf(_) => 1,
            Child::Node(n) => self.nodes[n]
                .children
                .iter()
                .map(|c| self.leaf_count(*c))
                .sum(),
        }
    }

    /// The internal node with spare capacity and the fewest children,
    /// ties broken by creation order.
    fn node_with_capacity(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.children.len() < MAX_PACK_ARITY)
            .min_by_key(|(i, n)| (n.children.len(), *i))
            .map(|(i, _)| i)
    }

    /// Split the structurally lightest leaf: descend through the child
    /// subtree with the fewest leaves, then convert the leaf reached into
    /// a fresh two-child node holding the old leaf and the new slot.
    fn split_lightest_leaf(&mut self, new_slot: SlotId) {
        match self.root {
            Some(Child::Leaf(old)) => {
                let node = self.push_node(old, new_slot);
                self.root = Some(Child::Node(node));
            }
            Some(Child::Node(mut at)) => {
                loop {
                    let pos = (0..self.nodes[at].children.len())
                        .min_by_key(|&j| self.leaf_count(self.nodes[at].children[j]))
                        .unwrap();
                    match self.nodes[at].children[pos] {
                        Child::Leaf(old) => {
                            let node = self.push_node(old, new_slot);
                            self.nodes[at].children[pos] = Child::Node(node);
                            break;
                        }
                        Child::Node(next) => at = next,
                    }
                }
            }
            None => unreachable!("split with empty tree"),
        }
    }

    fn push_node(&mut self, old: SlotId, new: SlotId) -> usize {
        self.nodes.push(PackNode {
            children: vec![Child::Leaf(old), Child::Leaf(new)],
        });
        self.nodes.len() - 1
    }

    /// The realized field type of one slot (cell-wrapped when boxed).
    fn leaf_ty(&self, slot: SlotId) -> Result<Type> {
        let def = &self.slots[slot as usize];
        if def.boxed {
            self.cells.wrap(&def.ty)
        } else {
            Ok(def.ty.clone())
        }
    }

    /// Instantiate shapes bottom-up into the concrete storage type.
    fn ty_of(&self, child: Child) -> Result<Type> {
        match child {
            Child::Leaf(s) => self.leaf_ty(s),
            Child::Node(n) => {
                let children = &self.nodes[n].children;
                let mut args = Vec::with_capacity(children.len());
                for c in children {
                    args.push(self.ty_of(*c)?);
                }
                Ok(Type::Generic {
                    base: pack_base(children.len()),
                    args,
                })
            }
        }
    }

    fn collect_paths(
        &self,
        child: Child,
        prefix: &[PathSeg],
        out: &mut Vec<Option<SlotField>>,
    ) -> Result<()> {
        match child {
            Child::Leaf(s) => {
                let def = &self.slots[s as usize];
                out[s as usize] = Some(SlotField {
                    segs: prefix.to_vec(),
                    ty: def.ty.clone(),
                    boxed: def.boxed,
                });
                Ok(())
            }
            Child::Node(n) => {
                for (j, c) in self.nodes[n].children.iter().enumerate() {
                    let mut segs = prefix.to_vec();
                    segs.push(PathSeg {
                        name: item_name(j),
                        ty: self.ty_of(*c)?,
                    });
                    self.collect_paths(*c, &segs, out)?;
                }
                Ok(())
            }
        }
    }

    /// Construction expression for a subtree: nested member-initialized
    /// packs, cells for boxed leaves, defaults for the rest.
    fn build_init(&self, child: Child) -> Result<Expr> {
        match child {
            Child::Leaf(s) => {
                let def = &self.slots[s as usize];
                if def.boxed {
                    self.cells.new_cell(&def.ty)
                } else {
                    Ok(Expr::constant(def.ty.clone(), Value::default_of(&def.ty)))
                }
            }
            Child::Node(n) => {
                let children = &self.nodes[n].children;
                let mut args = Vec::with_capacity(children.len());
                for c in children {
                    args.push(self.build_init(*c)?);
                }
                Ok(Expr::New {
                    ty: self.ty_of(child)?,
                    args,
                })
            }
        }
    }
}

impl SlotStorage for SharedLayout {
    fn define_slot(&mut self, ty: &Type) -> Result<SlotId> {
        if self.realized.is_some() {
            return Err(LowerError::StorageRealized);
        }
        let id = self.slots.len() as SlotId;
        self.slots.push(SlotDef {
            ty: ty.clone(),
            boxed: needs_boxed_cell(ty),
        });
        match self.root {
            None => self.root = Some(Child::Leaf(id)),
            Some(_) => match self.node_with_capacity() {
                Some(n) => self.nodes[n].children.push(Child::Leaf(id)),
                None => self.split_lightest_leaf(id),
            },
        }
        trace!("shared slot {} for {}", id, ty.mangle());
        Ok(id)
    }

    fn realize(&mut self) -> Result<()> {
        if self.realized.is_some() {
            return Err(LowerError::StorageRealized);
        }
        let storage = match self.root {
            None => RealizedStorage {
                ty: Type::Void,
                slots: Vec::new(),
            },
            Some(root) => {
                let ty = self.ty_of(root)?;
                let mut out = vec![None; self.slots.len()];
                self.collect_paths(root, &[], &mut out)?;
                RealizedStorage {
                    ty,
                    slots: out
                        .into_iter()
                        .map(|f| f.expect("every slot placed by collect_paths"))
                        .collect(),
                }
            }
        };
        debug!(
            "realized shared storage: {} slots, {} pack nodes",
            storage.slots.len(),
            self.nodes.len()
        );
        self.realized = Some(storage);
        Ok(())
    }

    fn realized(&self) -> Result<&RealizedStorage> {
        self.realized.as_ref().ok_or(LowerError::StorageNotRealized)
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn init(&self, root: VarId) -> Result<Expr> {
        self.realized()?;
        match self.root {
            None => Ok(Expr::Block {
                vars: vec![],
                exprs: vec![],
                ty: Type::Void,
            }),
            Some(tree) => Ok(Expr::assign(Expr::Parameter(root), self.build_init(tree)?)),
        }
    }
}
