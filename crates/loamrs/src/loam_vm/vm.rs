// Global runtime state (LoamVm) and the embedder-facing API
//
// One LoamVm owns everything: the object arena, the collector state, the
// string table, the registry, and the per-type metatables. There are no
// module-level singletons; every entry point takes the VM.
//
// Registry layout: [1] = main thread, [2] = globals table.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use crate::gc::{Gc, GcBody, GcHeader, GcObject, GcRef, ObjectKind, ObjectPool, StringTable};
use crate::loam_value::{
    LoamClosure, LoamProto, LoamTable, LoamThread, LoamUpvalue, LoamUserdata, LoamValue,
    LoamValueKind, NativeClosure, NativeFn, UpvalRef,
};
use crate::loam_vm::loam_limits::{
    MEMERR_MSG, MIN_STRTAB_SIZE, NUM_TYPE_TAGS, STRCACHE_M, STRCACHE_N,
};
use crate::loam_vm::{LoamError, LoamFullError, LoamResult};

const REGISTRY_MAIN_THREAD: i64 = 1;
const REGISTRY_GLOBALS: i64 = 2;

/// The global runtime state: arena, collector, string table, registry.
pub struct LoamVm {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: Gc,
    pub(crate) strings: StringTable,
    /// Address cache for static string literals (rows x LRU depth)
    pub(crate) strcache: [[GcRef; STRCACHE_M]; STRCACHE_N],
    /// Seed for the string hash, randomized per VM
    pub(crate) seed: u32,
    pub(crate) registry: LoamValue,
    pub(crate) main_thread: GcRef,
    /// The permanent out-of-memory string; fixed, never collected
    pub(crate) memerr_str: GcRef,
    /// Interned "__mode", fixed
    pub(crate) tm_mode: LoamValue,
    /// Interned "__gc", fixed
    pub(crate) tm_gc: LoamValue,
    /// Metatables of the basic (non-table, non-userdata) types
    pub(crate) type_metatables: [Option<LoamValue>; NUM_TYPE_TAGS],
    /// Host-imposed memory ceiling; models the embedder's fallible
    /// allocator. None = unlimited.
    pub(crate) mem_limit: Option<usize>,
    /// Debug hooks enabled (cleared around finalizer calls)
    pub(crate) allow_hook: bool,
    pub(crate) error_msg: String,
    /// VM fully constructed: emergency collection is allowed
    pub(crate) built: bool,
}

impl LoamVm {
    pub fn new() -> Self {
        let mut vm = LoamVm {
            pool: ObjectPool::new(),
            gc: Gc::new(),
            strings: StringTable::new(),
            strcache: [[GcRef(0); STRCACHE_M]; STRCACHE_N],
            seed: rand::random::<u32>(),
            registry: LoamValue::Nil,
            main_thread: GcRef(0),
            memerr_str: GcRef(0),
            tm_mode: LoamValue::Nil,
            tm_gc: LoamValue::Nil,
            type_metatables: [None; NUM_TYPE_TAGS],
            mem_limit: None,
            allow_hook: true,
            error_msg: String::new(),
            built: false,
        };
        vm.resize_string_table(MIN_STRTAB_SIZE);

        let main = vm.boot_alloc(
            GcBody::Thread(Box::new(LoamThread::new(true))),
            LoamVm::thread_size(),
        );
        vm.main_thread = main;
        vm.fix_object(main);

        let registry = vm.boot_alloc(
            GcBody::Table(Box::new(LoamTable::new())),
            LoamVm::table_size(0, 2),
        );
        vm.registry = LoamValue::Obj(registry);
        let globals = vm.boot_alloc(
            GcBody::Table(Box::new(LoamTable::new())),
            LoamVm::table_size(0, 8),
        );
        if let Some(t) = vm.pool.table_mut(registry) {
            t.raw_set(LoamValue::Int(REGISTRY_MAIN_THREAD), LoamValue::Obj(main));
            t.raw_set(LoamValue::Int(REGISTRY_GLOBALS), LoamValue::Obj(globals));
        }

        let memerr = match vm.intern_short(MEMERR_MSG) {
            Ok(r) => r,
            Err(_) => unreachable!("boot allocation cannot fail"),
        };
        vm.memerr_str = memerr;
        vm.fix_object(memerr);
        vm.strcache = [[memerr; STRCACHE_M]; STRCACHE_N];

        vm.tm_mode = LoamValue::Obj(vm.boot_intern_fixed("__mode"));
        vm.tm_gc = LoamValue::Obj(vm.boot_intern_fixed("__gc"));

        vm.built = true;
        vm.gc.running = true;
        vm.set_debt(0);
        vm
    }

    fn boot_alloc(&mut self, body: GcBody, size: usize) -> GcRef {
        match self.alloc_object(body, size) {
            Ok(r) => r,
            Err(_) => unreachable!("boot allocation cannot fail"),
        }
    }

    fn boot_intern_fixed(&mut self, s: &str) -> GcRef {
        let r = match self.intern_short(s) {
            Ok(r) => r,
            Err(_) => unreachable!("boot allocation cannot fail"),
        };
        self.fix_object(r);
        r
    }

    // ==================== Allocation ====================

    /// Every collectable allocation funnels through here: pay pending
    /// debt with a collector step first, check the memory gauge, then
    /// link the newborn (current-white) object at the head of allgc.
    pub(crate) fn alloc_object(&mut self, body: GcBody, size: usize) -> LoamResult<GcRef> {
        if self.built && self.gc.running && self.gc.debt > 0 {
            self.do_step()?;
        }
        self.reserve_memory(size)?;
        let mut header = GcHeader::new(body.kind(), self.gc.current_white, size as u32);
        header.next = self.gc.allgc;
        let r = self.pool.insert(GcObject { header, body });
        self.gc.allgc = Some(r);
        self.gc.debt += size as isize;
        Ok(r)
    }

    /// On gauge overflow with a fully constructed VM, run an emergency
    /// full collection and retry once before giving up.
    fn reserve_memory(&mut self, size: usize) -> LoamResult<()> {
        let Some(limit) = self.mem_limit else {
            return Ok(());
        };
        if self.count_bytes() + size <= limit {
            return Ok(());
        }
        if !self.built {
            return Err(LoamError::OutOfMemory);
        }
        self.full_gc(true)?;
        if self.count_bytes() + size <= limit {
            Ok(())
        } else {
            self.error_msg = MEMERR_MSG.to_string();
            Err(LoamError::OutOfMemory)
        }
    }

    // accounting size estimates, fixed at allocation time

    fn table_size(narr: usize, nrec: usize) -> usize {
        mem::size_of::<GcObject>() + mem::size_of::<LoamTable>() + narr * 17 + nrec * 24
    }

    fn thread_size() -> usize {
        mem::size_of::<GcObject>() + mem::size_of::<LoamThread>() + 16 * 40
    }

    // ==================== Tables ====================

    pub fn create_table(&mut self) -> LoamResult<LoamValue> {
        self.create_table_with(0, 0)
    }

    pub fn create_table_with(&mut self, narr: usize, nrec: usize) -> LoamResult<LoamValue> {
        let body = GcBody::Table(Box::new(LoamTable::with_capacity(narr, nrec)));
        let r = self.alloc_object(body, LoamVm::table_size(narr, nrec))?;
        Ok(LoamValue::Obj(r))
    }

    /// Raw table read through the VM (no metamethods).
    pub fn table_get(&mut self, t: LoamValue, key: LoamValue) -> LoamResult<LoamValue> {
        let r = self.check_table(t)?;
        Ok(self
            .pool
            .table(r)
            .map(|tb| tb.raw_get(&key))
            .unwrap_or(LoamValue::Nil))
    }

    /// Raw table write through the VM: applies the backward barrier when
    /// a black table gains a white key or value.
    pub fn table_set(&mut self, t: LoamValue, key: LoamValue, value: LoamValue) -> LoamResult<()> {
        let r = self.check_table(t)?;
        if key.is_nil() {
            self.error_msg = "table index is nil".to_string();
            return Err(LoamError::RuntimeError);
        }
        if let Some(tb) = self.pool.table_mut(r) {
            tb.raw_set(key, value);
        }
        if self.pool.is_black(r) && (self.value_is_white(key) || self.value_is_white(value)) {
            self.barrier_back(r);
        }
        Ok(())
    }

    pub fn table_len(&self, t: LoamValue) -> usize {
        t.as_obj()
            .and_then(|r| self.pool.table(r))
            .map(|tb| tb.len())
            .unwrap_or(0)
    }

    fn check_table(&mut self, t: LoamValue) -> LoamResult<GcRef> {
        match t.as_obj() {
            Some(r) if self.pool.kind(r) == Some(ObjectKind::Table) => Ok(r),
            _ => {
                self.error_msg = "attempt to index a non-table value".to_string();
                Err(LoamError::RuntimeError)
            }
        }
    }

    // ==================== Metatables & finalization ====================

    /// Set or clear an object's metatable. Setting a metatable whose
    /// `__gc` field is non-nil schedules the object for finalization.
    pub fn set_metatable(&mut self, obj: LoamValue, mt: LoamValue) -> LoamResult<()> {
        let Some(r) = obj.as_obj() else {
            self.error_msg = "cannot set a metatable on this value".to_string();
            return Err(LoamError::RuntimeError);
        };
        let mt_opt = match mt {
            LoamValue::Nil => None,
            LoamValue::Obj(m) if self.pool.kind(m) == Some(ObjectKind::Table) => Some(mt),
            _ => {
                self.error_msg = "metatable must be a table or nil".to_string();
                return Err(LoamError::RuntimeError);
            }
        };
        match self.pool.kind(r) {
            Some(ObjectKind::Table) => {
                if let Some(t) = self.pool.table_mut(r) {
                    t.set_metatable_value(mt_opt);
                }
            }
            Some(ObjectKind::Userdata) => {
                if let Some(u) = self.pool.userdata_mut(r) {
                    u.metatable = mt_opt;
                }
            }
            _ => {
                self.error_msg = "cannot set a metatable on this value".to_string();
                return Err(LoamError::RuntimeError);
            }
        }
        if let Some(mtv) = mt_opt {
            self.barrier_forward(r, mtv);
        }
        self.check_finalizer(r);
        Ok(())
    }

    /// The object's own metatable, or the basic-type metatable.
    pub fn get_metatable(&self, v: LoamValue) -> Option<LoamValue> {
        if let Some(r) = v.as_obj() {
            match self.pool.kind(r) {
                Some(ObjectKind::Table) => return self.pool.table(r).and_then(|t| t.metatable()),
                Some(ObjectKind::Userdata) => {
                    return self.pool.userdata(r).and_then(|u| u.metatable())
                }
                _ => {}
            }
        }
        self.type_metatables[self.value_kind(v) as usize]
    }

    pub(crate) fn get_metatable_of_ref(&self, r: GcRef) -> Option<LoamValue> {
        match self.pool.kind(r) {
            Some(ObjectKind::Table) => self.pool.table(r).and_then(|t| t.metatable()),
            Some(ObjectKind::Userdata) => self.pool.userdata(r).and_then(|u| u.metatable()),
            _ => None,
        }
    }

    /// Raw lookup of a field in a metatable value.
    pub(crate) fn metatable_field(&self, mt: LoamValue, key: LoamValue) -> LoamValue {
        mt.as_obj()
            .and_then(|r| self.pool.table(r))
            .map(|t| t.raw_get(&key))
            .unwrap_or(LoamValue::Nil)
    }

    pub fn set_type_metatable(&mut self, kind: LoamValueKind, mt: Option<LoamValue>) {
        self.type_metatables[kind as usize] = mt;
    }

    // ==================== Userdata ====================

    pub fn new_userdata(&mut self, data: Box<dyn Any>) -> LoamResult<LoamValue> {
        let size = mem::size_of::<GcObject>() + mem::size_of::<LoamUserdata>() + 64;
        let body = GcBody::Userdata(Box::new(LoamUserdata::new(data)));
        let r = self.alloc_object(body, size)?;
        Ok(LoamValue::Obj(r))
    }

    pub fn set_user_value(&mut self, u: LoamValue, v: LoamValue) -> LoamResult<()> {
        let Some(r) = u.as_obj().filter(|r| self.pool.kind(*r) == Some(ObjectKind::Userdata))
        else {
            self.error_msg = "attempt to set a user value on a non-userdata".to_string();
            return Err(LoamError::RuntimeError);
        };
        if let Some(ud) = self.pool.userdata_mut(r) {
            ud.user_value = v;
        }
        self.barrier_forward(r, v);
        Ok(())
    }

    pub fn user_value(&self, u: LoamValue) -> LoamValue {
        u.as_obj()
            .and_then(|r| self.pool.userdata(r))
            .map(|ud| ud.user_value())
            .unwrap_or(LoamValue::Nil)
    }

    // ==================== Functions ====================

    pub fn create_proto(&mut self, source: LoamValue) -> LoamResult<LoamValue> {
        let size = mem::size_of::<GcObject>() + mem::size_of::<LoamProto>() + 64;
        let body = GcBody::Proto(Box::new(LoamProto::new(source)));
        let r = self.alloc_object(body, size)?;
        Ok(LoamValue::Obj(r))
    }

    pub fn proto_add_constant(&mut self, proto: LoamValue, v: LoamValue) -> LoamResult<()> {
        let r = self.check_proto(proto)?;
        if let Some(p) = self.pool.proto_mut(r) {
            p.constants.push(v);
        }
        self.barrier_forward(r, v);
        Ok(())
    }

    pub fn proto_add_nested(&mut self, parent: LoamValue, child: LoamValue) -> LoamResult<()> {
        let pr = self.check_proto(parent)?;
        let cr = self.check_proto(child)?;
        if let Some(p) = self.pool.proto_mut(pr) {
            p.protos.push(cr);
        }
        self.barrier_forward(pr, child);
        Ok(())
    }

    fn check_proto(&mut self, p: LoamValue) -> LoamResult<GcRef> {
        match p.as_obj() {
            Some(r) if self.pool.kind(r) == Some(ObjectKind::Proto) => Ok(r),
            _ => {
                self.error_msg = "prototype expected".to_string();
                Err(LoamError::RuntimeError)
            }
        }
    }

    /// Build a scripted closure over a prototype. The prototype caches
    /// the result; the cache entry is dropped by the collector when the
    /// closure becomes garbage.
    pub fn create_closure(
        &mut self,
        proto: LoamValue,
        upvals: Vec<UpvalRef>,
    ) -> LoamResult<LoamValue> {
        let pr = self.check_proto(proto)?;
        let size = mem::size_of::<GcObject>() + mem::size_of::<LoamClosure>() + upvals.len() * 16;
        let body = GcBody::Closure(Box::new(LoamClosure { proto: pr, upvals }));
        let r = self.alloc_object(body, size)?;
        if let Some(p) = self.pool.proto_mut(pr) {
            p.cache = Some(r);
        }
        let clo = LoamValue::Obj(r);
        self.barrier_forward(pr, clo);
        Ok(clo)
    }

    /// The prototype's cached closure, if it is still alive.
    pub fn cached_closure(&mut self, proto: LoamValue) -> LoamResult<Option<LoamValue>> {
        let pr = self.check_proto(proto)?;
        Ok(self
            .pool
            .proto(pr)
            .and_then(|p| p.cache)
            .map(LoamValue::Obj))
    }

    pub fn create_native_closure(
        &mut self,
        func: NativeFn,
        upvals: Vec<LoamValue>,
    ) -> LoamResult<LoamValue> {
        let size =
            mem::size_of::<GcObject>() + mem::size_of::<NativeClosure>() + upvals.len() * 16;
        let body = GcBody::NativeClosure(Box::new(NativeClosure { func, upvals }));
        let r = self.alloc_object(body, size)?;
        Ok(LoamValue::Obj(r))
    }

    // ==================== Threads & upvalues ====================

    pub fn create_thread(&mut self) -> LoamResult<LoamValue> {
        let body = GcBody::Thread(Box::new(LoamThread::new(false)));
        let r = self.alloc_object(body, LoamVm::thread_size())?;
        Ok(LoamValue::Obj(r))
    }

    pub fn main_thread_value(&self) -> LoamValue {
        LoamValue::Obj(self.main_thread)
    }

    pub fn stack_push(&mut self, thread: LoamValue, v: LoamValue) -> LoamResult<()> {
        let r = self.check_thread(thread)?;
        if let Some(th) = self.pool.thread_mut(r) {
            th.push(v);
        }
        Ok(())
    }

    pub fn stack_pop(&mut self, thread: LoamValue) -> LoamResult<LoamValue> {
        let r = self.check_thread(thread)?;
        Ok(self
            .pool
            .thread_mut(r)
            .map(|th| th.pop())
            .unwrap_or(LoamValue::Nil))
    }

    pub fn stack_top(&self, thread: LoamValue) -> usize {
        thread
            .as_obj()
            .and_then(|r| self.pool.thread(r))
            .map(|th| th.top())
            .unwrap_or(0)
    }

    fn check_thread(&mut self, t: LoamValue) -> LoamResult<GcRef> {
        match t.as_obj() {
            Some(r) if self.pool.kind(r) == Some(ObjectKind::Thread) => Ok(r),
            _ => {
                self.error_msg = "thread expected".to_string();
                Err(LoamError::RuntimeError)
            }
        }
    }

    /// Find or create the open upvalue over a stack slot. Creating the
    /// first open upvalue links the thread into the twups list.
    pub fn find_upvalue(&mut self, thread: LoamValue, slot: usize) -> LoamResult<UpvalRef> {
        let r = self.check_thread(thread)?;
        if let Some(th) = self.pool.thread(r) {
            for uv in &th.open_upvals {
                if uv.borrow().slot() == Some(slot) {
                    return Ok(uv.clone());
                }
            }
        }
        let uv: UpvalRef = Rc::new(RefCell::new(LoamUpvalue::Open {
            thread: r,
            slot,
            touched: false,
        }));
        let mut link = false;
        if let Some(th) = self.pool.thread_mut(r) {
            let pos = th
                .open_upvals
                .iter()
                .position(|u| u.borrow().slot().unwrap_or(0) < slot)
                .unwrap_or(th.open_upvals.len());
            th.open_upvals.insert(pos, uv.clone());
            if !th.in_twups {
                th.in_twups = true;
                link = true;
            }
        }
        if link {
            self.gc.twups.push(r);
        }
        Ok(uv)
    }

    /// Close every open upvalue at or above `from`, copying the stack
    /// value into the upvalue.
    pub fn close_upvalues(&mut self, thread: LoamValue, from: usize) -> LoamResult<()> {
        let r = self.check_thread(thread)?;
        let mut closing = Vec::new();
        if let Some(th) = self.pool.thread_mut(r) {
            let mut kept = Vec::with_capacity(th.open_upvals.len());
            for uv in th.open_upvals.drain(..) {
                let s = uv.borrow().slot().unwrap_or(0);
                if s >= from {
                    closing.push(uv);
                } else {
                    kept.push(uv);
                }
            }
            th.open_upvals = kept;
        }
        for uv in closing {
            let v = self.upvalue_value(&uv);
            uv.borrow_mut().close(v);
            self.barrier_upvalue(&uv, v);
        }
        Ok(())
    }

    pub fn read_upvalue(&self, uv: &UpvalRef) -> LoamValue {
        self.upvalue_value(uv)
    }

    /// Write through an upvalue. Open upvalues write the owning thread's
    /// stack slot; closed ones store the value and fire the upvalue
    /// barrier.
    pub fn write_upvalue(&mut self, uv: &UpvalRef, v: LoamValue) {
        let open = match &*uv.borrow() {
            LoamUpvalue::Open { thread, slot, .. } => Some((*thread, *slot)),
            LoamUpvalue::Closed(_) => None,
        };
        match open {
            Some((t, slot)) => {
                if let Some(th) = self.pool.thread_mut(t) {
                    if slot < th.stack.len() {
                        th.stack[slot] = v;
                    }
                }
            }
            None => {
                *uv.borrow_mut() = LoamUpvalue::Closed(v);
                self.barrier_upvalue(uv, v);
            }
        }
    }

    // ==================== Globals & registry ====================

    pub fn registry(&self) -> LoamValue {
        self.registry
    }

    pub fn globals(&self) -> LoamValue {
        self.registry
            .as_obj()
            .and_then(|r| self.pool.table(r))
            .map(|t| t.raw_get(&LoamValue::Int(REGISTRY_GLOBALS)))
            .unwrap_or(LoamValue::Nil)
    }

    pub fn set_global(&mut self, name: &str, v: LoamValue) -> LoamResult<()> {
        let key = self.create_string(name)?;
        let globals = self.globals();
        self.table_set(globals, key, v)
    }

    pub fn get_global(&mut self, name: &str) -> LoamResult<LoamValue> {
        let key = self.create_string(name)?;
        let globals = self.globals();
        self.table_get(globals, key)
    }

    // ==================== Introspection ====================

    pub fn value_kind(&self, v: LoamValue) -> LoamValueKind {
        match v {
            LoamValue::Nil => LoamValueKind::Nil,
            LoamValue::Bool(_) => LoamValueKind::Bool,
            LoamValue::Int(_) => LoamValueKind::Int,
            LoamValue::Num(_) => LoamValueKind::Num,
            LoamValue::Obj(r) => match self.pool.kind(r) {
                Some(ObjectKind::ShortStr) | Some(ObjectKind::LongStr) => LoamValueKind::Str,
                Some(ObjectKind::Table) => LoamValueKind::Table,
                Some(ObjectKind::Userdata) => LoamValueKind::Userdata,
                Some(ObjectKind::Closure)
                | Some(ObjectKind::NativeClosure)
                | Some(ObjectKind::Proto) => LoamValueKind::Function,
                Some(ObjectKind::Thread) => LoamValueKind::Thread,
                None => LoamValueKind::Nil,
            },
        }
    }

    pub fn display_value(&self, v: LoamValue) -> String {
        match v {
            LoamValue::Nil => "nil".to_string(),
            LoamValue::Bool(b) => b.to_string(),
            LoamValue::Int(i) => {
                let mut buf = itoa::Buffer::new();
                buf.format(i).to_string()
            }
            LoamValue::Num(n) => format!("{n}"),
            LoamValue::Obj(r) => match self.pool.kind(r) {
                Some(ObjectKind::ShortStr) | Some(ObjectKind::LongStr) => {
                    self.pool.str_data(r).unwrap_or("").to_string()
                }
                Some(ObjectKind::Table) => format!("table: {:#010x}", r.0),
                Some(ObjectKind::Userdata) => format!("userdata: {:#010x}", r.0),
                Some(ObjectKind::Thread) => format!("thread: {:#010x}", r.0),
                Some(_) => format!("function: {:#010x}", r.0),
                None => "nil".to_string(),
            },
        }
    }

    pub fn object_count(&self) -> usize {
        self.pool.len()
    }

    // ==================== Control ====================

    pub fn gc_start(&mut self) {
        self.gc.running = true;
        self.set_debt(0);
    }

    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    /// Set the pause multiplier (percent); returns the previous value.
    pub fn set_gc_pause(&mut self, pause: i32) -> i32 {
        mem::replace(&mut self.gc.params[crate::gc::PAUSE], pause)
    }

    /// Set the step multiplier (percent); returns the previous value.
    pub fn set_gc_step_mul(&mut self, stepmul: i32) -> i32 {
        mem::replace(&mut self.gc.params[crate::gc::STEPMUL], stepmul)
    }

    /// Install or clear the host memory ceiling.
    pub fn set_mem_limit(&mut self, limit: Option<usize>) {
        self.mem_limit = limit;
    }

    /// Shutdown drain: queue every object that still owns a finalizer
    /// and run the handlers, swallowing their errors.
    pub fn close(&mut self) {
        self.separate_tobefnz(true);
        while self.gc.tobefnz.is_some() {
            // errors are discarded during the shutdown drain
            let _ = self.call_gc_tm(false);
        }
    }

    /// Attach the stored message to a caught error.
    pub fn into_full_error(&mut self, kind: LoamError) -> LoamFullError {
        LoamFullError {
            kind,
            message: mem::take(&mut self.error_msg),
        }
    }
}

impl Default for LoamVm {
    fn default() -> Self {
        Self::new()
    }
}


