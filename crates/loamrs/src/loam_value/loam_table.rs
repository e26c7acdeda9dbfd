// Table implementation for the runtime core
// - Array part for integer keys [1..n]
// - Hash part using hashbrown with an ahash hasher
//
// Only the surface the collector and its tests depend on is implemented
// here; the full indexing fast paths belong to the interpreter layer.

use ahash::RandomState;

use super::LoamValue;

/// A Loam table.
/// - Array part stores values for integer keys [1..array.len()]
/// - Everything else lives in the hash part
/// - Nil-valued entries are never stored in the hash part: assigning nil
///   deletes, so traversals never see dead hash slots.
pub struct LoamTable {
    pub(crate) array: Vec<LoamValue>,
    pub(crate) hash: hashbrown::HashMap<LoamValue, LoamValue, RandomState>,
    /// Metatable - a table value that defines special behaviors
    metatable: Option<LoamValue>,
}

impl LoamTable {
    pub fn new() -> Self {
        LoamTable {
            array: Vec::new(),
            hash: hashbrown::HashMap::with_hasher(RandomState::new()),
            metatable: None,
        }
    }

    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        LoamTable {
            array: Vec::with_capacity(narr),
            hash: hashbrown::HashMap::with_capacity_and_hasher(nrec, RandomState::new()),
            metatable: None,
        }
    }

    #[inline]
    pub fn metatable(&self) -> Option<LoamValue> {
        self.metatable
    }

    /// Raw metatable write. Callers go through the VM entry point, which
    /// applies the write barrier and the finalizer check.
    #[inline]
    pub(crate) fn set_metatable_value(&mut self, mt: Option<LoamValue>) {
        self.metatable = mt;
    }

    /// Raw read, no metamethods. Returns nil for absent keys.
    pub fn raw_get(&self, key: &LoamValue) -> LoamValue {
        let key = key.normalize_key();
        if let LoamValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[(i - 1) as usize];
            }
        }
        self.hash.get(&key).copied().unwrap_or(LoamValue::Nil)
    }

    /// Raw write, no metamethods and no barrier (the VM entry point
    /// barriers). Assigning nil removes the key from the hash part.
    pub fn raw_set(&mut self, key: LoamValue, value: LoamValue) {
        let key = key.normalize_key();
        debug_assert!(!key.is_nil(), "table key cannot be nil");
        if let LoamValue::Int(i) = key {
            if i >= 1 {
                let idx = (i - 1) as usize;
                if idx < self.array.len() {
                    self.array[idx] = value;
                    return;
                }
                if idx == self.array.len() && !value.is_nil() {
                    self.array.push(value);
                    return;
                }
            }
        }
        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
    }

    /// Number of non-nil entries, both parts.
    pub fn len(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the hash part for the collector's collect-then-mark
    /// traversal pattern.
    pub(crate) fn hash_entries(&self) -> Vec<(LoamValue, LoamValue)> {
        self.hash.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub(crate) fn array_len(&self) -> usize {
        self.array.len()
    }
}

impl Default for LoamTable {
    fn default() -> Self {
        Self::new()
    }
}
