//! The constant pool: deduplicated storage for non-embeddable constants.
//!
//! Keys are explicit `(declared type, value)` pairs with the equality
//! semantics of `larch_tree::Value`, never an identity hashtable relying
//! on incidental equality. Quoted-expression constants are kept apart from
//! ordinary data because their payload is materialized by generated
//! initializer code rather than embedded; the same goes for the realized
//! arrays of switch dispatch tables.

use std::collections::HashMap;

use larch_tree::{Expr, Type, Value, VarId};
use log::trace;

use crate::error::Result;
use crate::layout::{CellCatalog, LayoutKind, SlotId, SlotLayout, SlotStorage};
use crate::NameSource;

/// Dedup key for ordinary data constants. Type identity is part of the
/// key: the same payload under two declared types is two slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConstKey {
    ty: Type,
    value: Value,
}

/// What one pool slot holds.
#[derive(Debug, Clone)]
pub enum PoolEntry {
    /// Ordinary deduplicated constant data
    Data { ty: Type, value: Value },
    /// A quoted tree, identified by its quote ordinal; rebuilt at runtime
    /// by a generated initializer that re-applies capture substitution
    Quoted { quote: usize, ty: Type },
    /// Bucket values of one switch dispatch table
    TableValues { switch: usize, ty: Type },
    /// Bucket case ordinals of one switch dispatch table
    TableIndexes { switch: usize },
}

pub struct ConstantPool {
    layout: SlotLayout,
    entries: Vec<PoolEntry>,
    by_key: HashMap<ConstKey, SlotId>,
    by_quote: HashMap<usize, SlotId>,
}

impl ConstantPool {
    pub fn new(kind: LayoutKind, names: &NameSource, cells: &CellCatalog) -> Self {
        ConstantPool {
            layout: SlotLayout::new(kind, names, cells, "Constants"),
            entries: Vec::new(),
            by_key: HashMap::new(),
            by_quote: HashMap::new(),
        }
    }

    /// Whether a constant of `ty`/`value` belongs in the pool at all.
    /// Null, primitives, enums, strings and decimals are embedded directly
    /// by the emitter and never take a slot.
    pub fn should_pool(ty: &Type, value: &Value) -> bool {
        !matches!(value, Value::Null) && !ty.is_embeddable()
    }

    /// Slot for a data constant; an equal key returns the existing slot.
    pub fn intern(&mut self, ty: &Type, value: &Value) -> Result<SlotId> {
        debug_assert!(Self::should_pool(ty, value));
        let key = ConstKey {
            ty: ty.clone(),
            value: value.clone(),
        };
        if let Some(&slot) = self.by_key.get(&key) {
            trace!("pool hit for {} -> slot {}", ty.mangle(), slot);
            return Ok(slot);
        }
        let slot = self.layout.define_slot(ty)?;
        self.by_key.insert(key, slot);
        self.entries.push(PoolEntry::Data {
            ty: ty.clone(),
            value: value.clone(),
        });
        trace!("pooled {} as slot {}", ty.mangle(), slot);
        Ok(slot)
    }

    /// Slot for a quoted subtree. Quote identity is the quote's ordinal;
    /// distinct quote nodes never share a slot.
    pub fn intern_quote(&mut self, quote: usize, ty: &Type) -> Result<SlotId> {
        if let Some(&slot) = self.by_quote.get(&quote) {
            return Ok(slot);
        }
        let slot = self.layout.define_slot(ty)?;
        self.by_quote.insert(quote, slot);
        self.entries.push(PoolEntry::Quoted {
            quote,
            ty: ty.clone(),
        });
        Ok(slot)
    }

    /// Slots for the realized arrays of one switch dispatch table.
    pub fn add_table(&mut self, switch: usize, elem_ty: &Type) -> Result<(SlotId, SlotId)> {
        let values_ty = Type::Array(Box::new(elem_ty.clone()));
        let indexes_ty = Type::Array(Box::new(Type::Int32));
        let values_slot = self.layout.define_slot(&values_ty)?;
        self.entries.push(PoolEntry::TableValues {
            switch,
            ty: values_ty,
        });
        let indexes_slot = self.layout.define_slot(&indexes_ty)?;
        self.entries.push(PoolEntry::TableIndexes { switch });
        Ok((values_slot, indexes_slot))
    }

    /// Resolver-side lookup for a data constant.
    pub fn lookup(&self, ty: &Type, value: &Value) -> Option<SlotId> {
        self.by_key
            .get(&ConstKey {
                ty: ty.clone(),
                value: value.clone(),
            })
            .copied()
    }

    pub fn quote_slot(&self, quote: usize) -> Option<SlotId> {
        self.by_quote.get(&quote).copied()
    }

    pub fn realize(&mut self) -> Result<()> {
        self.layout.realize()
    }

    pub fn access(&self, root: VarId, slot: SlotId) -> Result<Expr> {
        self.layout.access(root, slot)
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_tree::{ObjValue, Visibility};

    fn pool() -> ConstantPool {
        ConstantPool::new(
            LayoutKind::Dynamic,
            &NameSource::new("t$"),
            &CellCatalog::default(),
        )
    }

    fn point(x: i64, y: i64) -> (Type, Value) {
        (
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

    #[test]
    fn test_equal_keys_share_one_slot() {
        let mut p = pool();
        let (ty, v) = point(1, 2);
        let a = p.intern(&ty, &v).unwrap();
        let b = p.intern(&ty, &v.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_distinct_values_get_distinct_slots() {
        let mut p = pool();
        let (ty, a) = point(1, 2);
        let (_, b) = point(1, 3);
        assert_ne!(p.intern(&ty, &a).unwrap(), p.intern(&ty, &b).unwrap());
    }

    #[test]
    fn test_type_identity_is_part_of_the_key() {
        let mut p = pool();
        let obj = Value::Obj(ObjValue::identity(42));
        let ty_a = Type::Object {
            name: "A".to_string(),
            visibility: Visibility::Public,
            overrides_equality: false,
        };
        let ty_b = Type::Object {
            name: "B".to_string(),
            visibility: Visibility::Public,
            overrides_equality: false,
        };
        assert_ne!(
            p.intern(&ty_a, &obj).unwrap(),
            p.intern(&ty_b, &obj).unwrap()
        );
    }

    #[test]
    fn test_embeddables_never_pool() {
        assert!(!ConstantPool::should_pool(&Type::Int32, &Value::Int(2)));
        assert!(!ConstantPool::should_pool(
            &Type::Str,
            &Value::Str("s".to_string())
        ));
        assert!(!ConstantPool::should_pool(
            &Type::Object {
                name: "O".to_string(),
                visibility: Visibility::Public,
                overrides_equality: false,
            },
            &Value::Null
        ));
        let (ty, v) = point(0, 0);
        assert!(ConstantPool::should_pool(&ty, &v));
    }

    #[test]
    fn test_quote_slots_distinct_per_quote() {
        let mut p = pool();
        let ty = Type::Expression(Box::new(Type::Func {
            params: vec![],
            ret: Box::new(Type::Int32),
        }));
        let a = p.intern_quote(0, &ty).unwrap();
        let b = p.intern_quote(1, &ty).unwrap();
        assert_ne!(a, b);
        assert_eq!(p.intern_quote(0, &ty).unwrap(), a);
    }

    #[test]
    fn test_table_arrays_take_two_slots() {
        let mut p = pool();
        let (values, indexes) = p.add_table(0, &Type::Int32).unwrap();
        assert_ne!(values, indexes);
        assert_eq!(p.len(), 2);
    }
}
