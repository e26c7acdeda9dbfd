// String interning
//
// Short strings (len <= MAX_SHORT_LEN) are hash-consed: one chained hash
// table maps content to a single live object, so equality is reference
// identity. Long strings bypass the table entirely and hash lazily.
//
// The table doubles at load factor 1.0 and is halved at end-of-cycle
// when load drops below 1/4 (see check_sizes in the collector).

use smol_str::SmolStr;
use std::mem;

use super::header::{GcRef, ObjectKind, other_white};
use super::object_pool::{GcBody, GcObject, LongStr, ShortStr};
use crate::loam_value::LoamValue;
use crate::loam_vm::loam_limits::{HASH_SAMPLE_LOG, MAX_SHORT_LEN, STRCACHE_M, STRCACHE_N};
use crate::loam_vm::{LoamResult, LoamVm};

/// Hash-consing table: each bucket heads an intrusive list of short
/// strings chained by their own `hnext` field. Size is a power of two.
pub struct StringTable {
    pub(crate) buckets: Vec<Option<GcRef>>,
    pub(crate) nuse: usize,
}

impl StringTable {
    pub(crate) fn new() -> Self {
        StringTable {
            buckets: Vec::new(),
            nuse: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn nuse(&self) -> usize {
        self.nuse
    }
}

/// Seeded string hash. Strings longer than 2^HASH_SAMPLE_LOG bytes are
/// sampled with a proportional stride instead of folding every byte.
pub fn str_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (bytes.len() as u32);
    let step = (bytes.len() >> HASH_SAMPLE_LOG) + 1;
    let mut l = bytes.len();
    while l >= step {
        let b = bytes[l - 1] as u32;
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(b);
        l -= step;
    }
    h
}

impl LoamVm {
    /// Intern or allocate a string value, dispatching on length.
    pub fn create_string(&mut self, s: &str) -> LoamResult<LoamValue> {
        if s.len() <= MAX_SHORT_LEN {
            Ok(LoamValue::Obj(self.intern_short(s)?))
        } else {
            Ok(LoamValue::Obj(self.new_long_string(s)?))
        }
    }

    /// Hash-cons a short string. A hit on an object condemned by the
    /// in-progress sweep resurrects it by flipping it back to the
    /// current white.
    pub(crate) fn intern_short(&mut self, s: &str) -> LoamResult<GcRef> {
        debug_assert!(s.len() <= MAX_SHORT_LEN);
        debug_assert!(self.strings.size().is_power_of_two() && self.strings.size() > 0);
        let h = str_hash(s.as_bytes(), self.seed);

        let mut found = None;
        let mut cur = self.strings.buckets[(h as usize) & (self.strings.size() - 1)];
        while let Some(r) = cur {
            match self.pool.short_str(r) {
                Some(ss) => {
                    if ss.data.as_str() == s {
                        found = Some(r);
                        break;
                    }
                    cur = ss.hnext;
                }
                None => break,
            }
        }

        if let Some(r) = found {
            let ow = other_white(self.gc.current_white);
            if let Some(head) = self.pool.header_mut(r) {
                if head.is_dead(ow) {
                    head.change_white();
                }
            }
            return Ok(r);
        }

        if self.strings.nuse >= self.strings.size()
            && self.strings.size() <= (i32::MAX as usize) / 2
        {
            let doubled = self.strings.size() * 2;
            self.resize_string_table(doubled);
        }

        let size = mem::size_of::<GcObject>() + s.len();
        let body = GcBody::ShortStr(ShortStr {
            data: SmolStr::new(s),
            hash: h,
            hnext: None,
        });
        let r = self.alloc_object(body, size)?;

        // Allocation may have run a collector step that resized the
        // table; recompute the slot before chaining.
        let slot = (h as usize) & (self.strings.size() - 1);
        let head = self.strings.buckets[slot];
        if let Some(ss) = self.pool.short_str_mut(r) {
            ss.hnext = head;
        }
        self.strings.buckets[slot] = Some(r);
        self.strings.nuse += 1;
        Ok(r)
    }

    /// Allocate a long string. Never interned; the hash field starts at
    /// the table seed and is completed lazily by `long_string_hash`.
    pub fn new_long_string(&mut self, s: &str) -> LoamResult<GcRef> {
        let size = mem::size_of::<GcObject>() + s.len();
        let body = GcBody::LongStr(LongStr {
            data: s.into(),
            hash: self.seed,
            has_hash: false,
        });
        self.alloc_object(body, size)
    }

    /// Content hash of a long string, computed on first request.
    pub fn long_string_hash(&mut self, r: GcRef) -> u32 {
        match self.pool.long_str_mut(r) {
            Some(ls) => {
                if !ls.has_hash {
                    ls.hash = str_hash(ls.data.as_bytes(), ls.hash);
                    ls.has_hash = true;
                }
                ls.hash
            }
            None => 0,
        }
    }

    /// Intern a static literal through the address cache: the cache is
    /// keyed by the literal's address, short-circuiting re-interning of
    /// literals the host hands over repeatedly. Entries always reference
    /// live strings.
    pub fn intern_static(&mut self, s: &'static str) -> LoamResult<LoamValue> {
        let row = (s.as_ptr() as usize) % STRCACHE_N;
        for j in 0..STRCACHE_M {
            let r = self.strcache[row][j];
            if self.pool.str_data(r) == Some(s) {
                return Ok(LoamValue::Obj(r));
            }
        }
        let v = self.create_string(s)?;
        if let LoamValue::Obj(r) = v {
            if self.pool.kind(r) == Some(ObjectKind::ShortStr) {
                for j in (1..STRCACHE_M).rev() {
                    self.strcache[row][j] = self.strcache[row][j - 1];
                }
                self.strcache[row][0] = r;
            }
        }
        Ok(v)
    }

    /// Rehash every short string into a table of `new_size` buckets.
    /// Chains are effectively reversed into their new slots, which is
    /// fine because short-string hashes never change.
    pub(crate) fn resize_string_table(&mut self, new_size: usize) {
        let old_size = self.strings.size();
        if new_size == old_size {
            return; // guard against a gratuitous rehash
        }
        debug_assert!(new_size.is_power_of_two());
        let mut new_buckets: Vec<Option<GcRef>> = vec![None; new_size];
        let old_buckets = mem::take(&mut self.strings.buckets);
        for head in old_buckets {
            let mut cur = head;
            while let Some(r) = cur {
                let (h, next) = match self.pool.short_str(r) {
                    Some(ss) => (ss.hash, ss.hnext),
                    None => break,
                };
                let slot = (h as usize) & (new_size - 1);
                if let Some(ss) = self.pool.short_str_mut(r) {
                    ss.hnext = new_buckets[slot];
                }
                new_buckets[slot] = Some(r);
                cur = next;
            }
        }
        self.strings.buckets = new_buckets;
        // the bucket array itself counts toward the allocation debt
        let cell = mem::size_of::<Option<GcRef>>() as isize;
        self.gc.debt += (new_size as isize - old_size as isize) * cell;
    }

    /// Unchain a short string being collected. Only the sweeper calls
    /// this, via free_object.
    pub(crate) fn remove_short_string(&mut self, r: GcRef) {
        let (h, next) = match self.pool.short_str(r) {
            Some(ss) => (ss.hash, ss.hnext),
            None => return,
        };
        let slot = (h as usize) & (self.strings.size() - 1);
        let mut cur = self.strings.buckets[slot];
        if cur == Some(r) {
            self.strings.buckets[slot] = next;
            self.strings.nuse -= 1;
            return;
        }
        while let Some(p) = cur {
            let p_next = match self.pool.short_str(p) {
                Some(ss) => ss.hnext,
                None => return,
            };
            if p_next == Some(r) {
                if let Some(ss) = self.pool.short_str_mut(p) {
                    ss.hnext = next;
                }
                self.strings.nuse -= 1;
                return;
            }
            cur = p_next;
        }
        debug_assert!(false, "short string not found in its slot chain");
    }

    /// Run in the atomic phase: drop cache entries whose referent was
    /// not marked this cycle, replacing them with the permanent
    /// out-of-memory string so entries always reference live strings.
    pub(crate) fn clear_string_cache(&mut self) {
        for row in 0..STRCACHE_N {
            for j in 0..STRCACHE_M {
                let r = self.strcache[row][j];
                if self.pool.is_white(r) {
                    self.strcache[row][j] = self.memerr_str;
                }
            }
        }
    }

    /// String content of a value, if it is a string.
    pub fn string_value(&self, v: LoamValue) -> Option<&str> {
        self.pool.str_data(v.as_obj()?)
    }
}
