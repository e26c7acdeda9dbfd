// Marking and traversal
//
// The mark primitive turns white objects gray; scalar kinds (strings,
// userdata) are finished immediately, containers go through the gray
// worklist so no traversal ever recurses into the object graph. Each
// traverser blackens its subject and charges the object's accounting
// size to mem_trav, which the pacing layer converts into step work.
//
// Borrow discipline: traversers snapshot the outgoing references of the
// subject first, then mark them; marking needs &mut access to the pool.

use crate::gc::header::{GcRef, ObjectKind};
use crate::gc::GcState;
use crate::loam_value::{LoamUpvalue, LoamValue, UpvalRef};
use crate::loam_vm::LoamVm;

impl LoamVm {
    #[inline]
    pub(crate) fn mark_value(&mut self, v: LoamValue) {
        if let LoamValue::Obj(r) = v {
            self.mark_object(r);
        }
    }

    /// White -> gray. Strings go straight to black (no outgoing refs);
    /// userdata completes by tail iteration; containers are queued.
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        let Some(h) = self.pool.header(r) else { return };
        if !h.is_white() {
            return;
        }
        match h.kind {
            ObjectKind::ShortStr | ObjectKind::LongStr => {
                let size = h.size as isize;
                if let Some(h) = self.pool.header_mut(r) {
                    h.make_black();
                }
                self.gc.mem_trav += size;
            }
            ObjectKind::Userdata => self.mark_userdata(r),
            _ => {
                debug_assert!(h.kind.is_container());
                if let Some(h) = self.pool.header_mut(r) {
                    h.make_gray();
                }
                self.gc.gray.push(r);
            }
        }
    }

    /// Userdata chains through user values iteratively, bounding stack
    /// depth at O(1) however deep the chain goes.
    fn mark_userdata(&mut self, start: GcRef) {
        let mut r = start;
        loop {
            let (mt, uv, size) = match (self.pool.userdata(r), self.pool.header(r)) {
                (Some(u), Some(h)) => (u.metatable(), u.user_value(), h.size as isize),
                _ => return,
            };
            if let Some(h) = self.pool.header_mut(r) {
                h.make_black();
            }
            self.gc.mem_trav += size;
            if let Some(mtv) = mt {
                self.mark_value(mtv);
            }
            match uv {
                LoamValue::Obj(next)
                    if self.pool.kind(next) == Some(ObjectKind::Userdata)
                        && self.pool.is_white(next) =>
                {
                    r = next;
                }
                other => {
                    self.mark_value(other);
                    return;
                }
            }
        }
    }

    /// Pop and traverse one gray object.
    pub(crate) fn propagate_mark(&mut self) {
        if let Some(r) = self.gc.gray.pop() {
            self.traverse_object(r);
        }
    }

    pub(crate) fn propagate_all(&mut self) {
        while let Some(r) = self.gc.gray.pop() {
            self.traverse_object(r);
        }
    }

    fn traverse_object(&mut self, r: GcRef) {
        let Some(h) = self.pool.header(r) else { return };
        debug_assert!(h.is_gray());
        let kind = h.kind;
        let size = h.size as isize;
        if let Some(h) = self.pool.header_mut(r) {
            h.make_black();
        }
        self.gc.mem_trav += size;
        match kind {
            ObjectKind::Table => self.traverse_table(r),
            ObjectKind::Closure => self.traverse_closure(r),
            ObjectKind::NativeClosure => self.traverse_native_closure(r),
            ObjectKind::Proto => self.traverse_proto(r),
            ObjectKind::Thread => self.traverse_thread(r),
            _ => debug_assert!(false, "scalar kind on gray list"),
        }
    }

    // ==================== Per-kind traversers ====================

    fn traverse_table(&mut self, r: GcRef) {
        let mt = self.pool.table(r).and_then(|t| t.metatable());
        if let Some(mtv) = mt {
            self.mark_value(mtv);
        }
        let (weak_key, weak_value) = self.table_weak_mode(r);
        if weak_key || weak_value {
            // weak tables never turn black; route to the weak engine
            if let Some(h) = self.pool.header_mut(r) {
                h.make_gray();
            }
            if !weak_key {
                self.traverse_weak_value(r);
            } else if !weak_value {
                self.traverse_ephemeron(r);
            } else {
                self.gc.allweak.push(r);
            }
        } else {
            self.traverse_strong_table(r);
        }
    }

    fn traverse_strong_table(&mut self, r: GcRef) {
        let (array, entries) = match self.pool.table(r) {
            Some(t) => (t.array.clone(), t.hash_entries()),
            None => return,
        };
        for v in array {
            self.mark_value(v);
        }
        for (k, v) in entries {
            self.mark_value(k);
            self.mark_value(v);
        }
    }

    fn traverse_closure(&mut self, r: GcRef) {
        let (proto, upvals) = match self.pool.closure(r) {
            Some(c) => (c.proto, c.upvals.clone()),
            None => return,
        };
        self.mark_object(proto);
        let in_atomic = self.gc.state == GcState::Atomic;
        for uv in &upvals {
            // an open upvalue's slot may still be rewritten by its
            // thread; defer it to the atomic remark instead of marking a
            // value that can go stale
            let mark_now = {
                let mut b = uv.borrow_mut();
                match &mut *b {
                    LoamUpvalue::Open { touched, .. } if !in_atomic => {
                        *touched = true;
                        false
                    }
                    _ => true,
                }
            };
            if mark_now {
                let v = self.upvalue_value(uv);
                self.mark_value(v);
            }
        }
    }

    fn traverse_native_closure(&mut self, r: GcRef) {
        let upvals = match self.pool.native_closure(r) {
            Some(c) => c.upvals.clone(),
            None => return,
        };
        for v in upvals {
            self.mark_value(v);
        }
    }

    fn traverse_proto(&mut self, r: GcRef) {
        // the cached closure is disposable: let a white one die
        let cache_white = self
            .pool
            .proto(r)
            .and_then(|p| p.cache)
            .map(|c| self.pool.is_white(c))
            .unwrap_or(false);
        if cache_white {
            if let Some(p) = self.pool.proto_mut(r) {
                p.cache = None;
            }
        }
        let (source, constants, protos, upval_names, local_names) = match self.pool.proto(r) {
            Some(p) => (
                p.source,
                p.constants.clone(),
                p.protos.clone(),
                p.upval_names.clone(),
                p.local_names.clone(),
            ),
            None => return,
        };
        self.mark_value(source);
        for v in constants {
            self.mark_value(v);
        }
        for p in protos {
            self.mark_object(p);
        }
        for v in upval_names {
            self.mark_value(v);
        }
        for v in local_names {
            self.mark_value(v);
        }
    }

    fn traverse_thread(&mut self, r: GcRef) {
        // threads never stay black: every cycle revisits them in the
        // atomic phase
        if let Some(h) = self.pool.header_mut(r) {
            h.make_gray();
        }
        self.gc.grayagain.push(r);

        let live: Vec<LoamValue> = match self.pool.thread(r) {
            Some(th) => th.stack[..th.top].to_vec(),
            None => return,
        };
        for v in live {
            self.mark_value(v);
        }

        if self.gc.state == GcState::Atomic {
            let emergency = self.gc.emergency;
            let mut relink = false;
            if let Some(th) = self.pool.thread_mut(r) {
                // clear the dead part of the stack
                for slot in th.top..th.stack.len() {
                    th.stack[slot] = LoamValue::Nil;
                }
                if !emergency {
                    th.shrink_stack();
                }
                // the upvalue remark may have dropped this thread from
                // twups; put it back if it regained open upvalues
                if !th.in_twups && th.has_open_upvalues() {
                    th.in_twups = true;
                    relink = true;
                }
            }
            if relink {
                self.gc.twups.push(r);
            }
        }
    }

    // ==================== Roots & upvalues ====================

    /// Mark the per-type metatables.
    pub(crate) fn mark_mt(&mut self) {
        let mts = self.type_metatables;
        for mt in mts.into_iter().flatten() {
            self.mark_value(mt);
        }
    }

    /// Mark everything queued for finalization; those objects stay
    /// reachable until their finalizer has run.
    pub(crate) fn mark_beingfnz(&mut self) {
        let mut cur = self.gc.tobefnz;
        let mut refs = Vec::new();
        while let Some(r) = cur {
            refs.push(r);
            cur = self.pool.next_of(r);
        }
        for r in refs {
            self.mark_object(r);
        }
    }

    /// Atomic-phase walk of threads holding open upvalues: threads still
    /// gray with open upvalues stay listed; the rest are unlinked (and
    /// flagged out-of-list so upvalue creation re-inserts them) after
    /// re-marking any upvalue a closure traversal flagged as touched.
    pub(crate) fn remark_upvals(&mut self) {
        let twups = std::mem::take(&mut self.gc.twups);
        let mut keep = Vec::with_capacity(twups.len());
        for t in twups {
            let stays = match (self.pool.header(t), self.pool.thread(t)) {
                (Some(h), Some(th)) => {
                    debug_assert!(!h.is_black());
                    h.is_gray() && th.has_open_upvalues()
                }
                _ => false,
            };
            if stays {
                keep.push(t);
                continue;
            }
            let upvals = self
                .pool
                .thread(t)
                .map(|th| th.open_upvals.clone())
                .unwrap_or_default();
            if let Some(th) = self.pool.thread_mut(t) {
                th.in_twups = false;
            }
            for uv in &upvals {
                let touched = {
                    let mut b = uv.borrow_mut();
                    match &mut *b {
                        LoamUpvalue::Open { touched, .. } => std::mem::replace(touched, false),
                        LoamUpvalue::Closed(_) => false,
                    }
                };
                if touched {
                    let v = self.upvalue_value(uv);
                    self.mark_value(v);
                }
            }
        }
        self.gc.twups = keep;
    }

    /// Current value of an upvalue, reading through to the owning
    /// thread's stack while open.
    pub(crate) fn upvalue_value(&self, uv: &UpvalRef) -> LoamValue {
        match &*uv.borrow() {
            LoamUpvalue::Open { thread, slot, .. } => self
                .pool
                .thread(*thread)
                .and_then(|th| th.stack.get(*slot).copied())
                .unwrap_or(LoamValue::Nil),
            LoamUpvalue::Closed(v) => *v,
        }
    }
}


