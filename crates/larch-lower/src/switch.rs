//! Perfect-hash dispatch tables for constant-keyed switches.
//!
//! Given the distinct constant case values of one type, find a table
//! length `L` such that `hash mod L` is collision-free over the key set.
//! The consumer indexes `values`/`indexes` at the runtime input's bucket
//! and only trusts the hit when the bucket's stored value equals the
//! input; anything else takes the default branch. That makes dispatch
//! behaviorally identical to a linear case scan for every possible input,
//! including inputs outside the original key set.
//!
//! Construction failure is never an error: the switch just falls back to
//! ordinary per-case dispatch.

use larch_tree::{Type, Value};
use log::{debug, trace};

/// Upper bound of the modulus search.
pub const MAX_TABLE_LEN: usize = 100_000;

/// An immutable perfect-hash dispatch table for one switch node.
#[derive(Debug, Clone)]
pub struct SwitchDispatchTable {
    pub elem_ty: Type,
    /// Bucket contents; empty buckets hold a filler never trusted by
    /// dispatch (their index entry is −1).
    pub values: Vec<Value>,
    /// Case ordinal per bucket, −1 for empty buckets.
    pub indexes: Vec<i32>,
}

impl SwitchDispatchTable {
    /// Table modulus.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reference dispatch discipline: the case ordinal for `input`, or
    /// `None` for the default branch. The emitter generates exactly this.
    pub fn dispatch(&self, input: &Value) -> Option<usize> {
        let hash = input.switch_hash()?;
        let bucket = (hash % self.len() as u64) as usize;
        if self.indexes[bucket] >= 0 && self.values[bucket] == *input {
            Some(self.indexes[bucket] as usize)
        } else {
            None
        }
    }
}

/// Builder for dispatch tables.
pub struct SwitchTableBuilder;

impl SwitchTableBuilder {
    /// Attempt construction for the given key set. `None` means fall back
    /// to linear dispatch: unhashable element type, duplicate or
    /// hash-colliding keys, or no modulus within bounds.
    pub fn build(elem_ty: &Type, keys: &[Value]) -> Option<SwitchDispatchTable> {
        if keys.is_empty() || !elem_ty.is_switch_hashable() {
            return None;
        }
        let mut hashes = Vec::with_capacity(keys.len());
        for key in keys {
            hashes.push(key.switch_hash()?);
        }
        // Two distinct keys hashing identically can never be separated by
        // any modulus; duplicate keys surface here too.
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                if hashes[i] == hashes[j] {
                    trace!("switch hash collision, falling back to linear dispatch");
                    return None;
                }
            }
        }
        let len = Self::find_modulus(&hashes)?;
        let mut values: Vec<Value> = (0..len)
            .map(|i| Self::filler(elem_ty, i))
            .collect();
        let mut indexes = vec![-1i32; len];
        for (ordinal, (key, hash)) in keys.iter().zip(&hashes).enumerate() {
            let bucket = (hash % len as u64) as usize;
            values[bucket] = key.clone();
            indexes[bucket] = ordinal as i32;
        }
        debug!("switch table: {} keys, modulus {}", keys.len(), len);
        Some(SwitchDispatchTable {
            elem_ty: elem_ty.clone(),
            values,
            indexes,
        })
    }

    /// Smallest `L >= keys.len()` (bounded) with pairwise-distinct
    /// `hash mod L`.
    fn find_modulus(hashes: &[u64]) -> Option<usize> {
        let mut seen = std::collections::HashSet::with_capacity(hashes.len());
        for len in hashes.len()..=MAX_TABLE_LEN {
            seen.clear();
            if hashes.iter().all(|h| seen.insert(h % len as u64)) {
                return Some(len);
            }
        }
        None
    }

    /// Filler for an empty bucket, derived from `index + 1` for integral
    /// kinds. Dispatch never trusts a bucket whose index entry is −1, so
    /// the filler only has to be *some* well-formed value; reference-ish
    /// kinds use null.
    fn filler(elem_ty: &Type, index: usize) -> Value {
        let n = (index + 1) as i64;
        match elem_ty {
            Type::Int8 | Type::Int16 | Type::Int32 | Type::Int64 => Value::Int(n),
            Type::UInt8 | Type::UInt16 | Type::UInt32 | Type::UInt64 => Value::UInt(n as u64),
            Type::Char => Value::Char(char::from_u32((n as u32) % 0xD800).unwrap_or('\0')),
            Type::Enum { name, .. } => Value::EnumMember {
                ty: name.clone(),
                discriminant: n,
            },
            _ => Value::Null,
        }
    }
}
