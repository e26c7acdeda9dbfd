// Weak tables and ephemeron convergence
//
// A table's weakness comes from the `__mode` string in its metatable:
// "v" keeps keys strong and values weak, "k" gives ephemeron semantics
// (the value survives only if the key is reachable on a strong path),
// "kv" keeps nothing alive. Weak tables stay gray; the atomic phase
// clears whatever remained unreachable.

use crate::gc::header::{GcRef, ObjectKind};
use crate::gc::GcState;
use crate::loam_value::LoamValue;
use crate::loam_vm::LoamVm;

impl LoamVm {
    /// (weak_keys, weak_values) per the metatable's `__mode` field.
    pub(crate) fn table_weak_mode(&self, r: GcRef) -> (bool, bool) {
        let Some(t) = self.pool.table(r) else {
            return (false, false);
        };
        let Some(LoamValue::Obj(mtr)) = t.metatable() else {
            return (false, false);
        };
        let Some(mt) = self.pool.table(mtr) else {
            return (false, false);
        };
        let mode = mt.raw_get(&self.tm_mode);
        match self.string_value(mode) {
            Some(s) => (s.contains('k'), s.contains('v')),
            None => (false, false),
        }
    }

    /// An entry side is cleared when it refers to an object that was not
    /// marked. Non-collectable values are never cleared, and strings are
    /// marked instead of cleared (they behave as values, not references).
    pub(crate) fn is_cleared(&mut self, v: LoamValue) -> bool {
        let Some(r) = v.as_obj() else {
            return false;
        };
        match self.pool.kind(r) {
            Some(ObjectKind::ShortStr) | Some(ObjectKind::LongStr) => {
                self.mark_object(r);
                false
            }
            _ => self.pool.is_white(r),
        }
    }

    #[inline]
    pub(crate) fn value_is_white(&self, v: LoamValue) -> bool {
        v.as_obj().map(|r| self.pool.is_white(r)).unwrap_or(false)
    }

    /// Weak-value table: mark keys only. During propagation the table is
    /// parked on grayagain for an atomic revisit; in the atomic phase it
    /// goes to the weak list when any value may need clearing.
    pub(crate) fn traverse_weak_value(&mut self, r: GcRef) {
        let (array_len, entries) = match self.pool.table(r) {
            Some(t) => (t.array_len(), t.hash_entries()),
            None => return,
        };
        // an array part is assumed to hold clearable values; not worth a
        // scan just to prove otherwise
        let mut has_clears = array_len > 0;
        for (k, v) in entries {
            self.mark_value(k);
            if !has_clears && self.is_cleared(v) {
                has_clears = true;
            }
        }
        if self.gc.state == GcState::Propagate {
            self.gc.grayagain.push(r);
        } else if has_clears {
            self.gc.weak.push(r);
        }
    }

    /// Ephemeron table: a value is marked only when its key already is.
    /// Returns true when this traversal marked something, which forces
    /// another convergence round. Entries still white on both sides keep
    /// the table on the ephemeron list; tables left only with white keys
    /// go to allweak for key clearing.
    pub(crate) fn traverse_ephemeron(&mut self, r: GcRef) -> bool {
        let (array, entries) = match self.pool.table(r) {
            Some(t) => (t.array.clone(), t.hash_entries()),
            None => return false,
        };
        let mut marked = false;
        let mut has_clears = false;
        let mut has_ww = false;
        // integer-keyed part: keys are not collectable, values are strong
        for v in array {
            if self.value_is_white(v) {
                marked = true;
                self.mark_value(v);
            }
        }
        for (k, v) in entries {
            if self.is_cleared(k) {
                has_clears = true;
                if self.value_is_white(v) {
                    has_ww = true;
                }
            } else if self.value_is_white(v) {
                marked = true;
                self.mark_value(v);
            }
        }
        if self.gc.state == GcState::Propagate {
            self.gc.grayagain.push(r);
        } else if has_ww {
            self.gc.ephemeron.push(r);
        } else if has_clears {
            self.gc.allweak.push(r);
        }
        marked
    }

    /// Re-run ephemeron traversal until a fixed point: a pass that
    /// marked anything may have made more keys reachable, so every such
    /// pass drains the gray list and goes again.
    pub(crate) fn converge_ephemerons(&mut self) {
        loop {
            let list = std::mem::take(&mut self.gc.ephemeron);
            let mut changed = false;
            for w in list {
                if self.traverse_ephemeron(w) {
                    self.propagate_all();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Nil out array slots and drop hash entries whose value was not
    /// marked. The hash map keeps its own probe integrity, so removal is
    /// the tombstone.
    pub(crate) fn clear_weak_values(&mut self, tables: &[GcRef]) {
        for &r in tables {
            let array_len = self.pool.table(r).map(|t| t.array_len()).unwrap_or(0);
            for i in 0..array_len {
                let v = match self.pool.table(r) {
                    Some(t) => t.array[i],
                    None => break,
                };
                if self.is_cleared(v) {
                    if let Some(t) = self.pool.table_mut(r) {
                        t.array[i] = LoamValue::Nil;
                    }
                }
            }
            let entries = match self.pool.table(r) {
                Some(t) => t.hash_entries(),
                None => continue,
            };
            for (k, v) in entries {
                if self.is_cleared(v) {
                    if let Some(t) = self.pool.table_mut(r) {
                        t.hash.remove(&k);
                    }
                }
            }
        }
    }

    /// Drop hash entries whose key was not marked. Only the hash part:
    /// array keys are integers and can never be collected.
    pub(crate) fn clear_weak_keys(&mut self, tables: &[GcRef]) {
        for &r in tables {
            let entries = match self.pool.table(r) {
                Some(t) => t.hash_entries(),
                None => continue,
            };
            for (k, _) in entries {
                if self.is_cleared(k) {
                    if let Some(t) = self.pool.table_mut(r) {
                        t.hash.remove(&k);
                    }
                }
            }
        }
    }
}


