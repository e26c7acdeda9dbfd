// Incremental tri-color mark-and-sweep garbage collector
//
// The collector runs interleaved with the mutator in bounded work units
// driven by allocation debt. One cycle walks the states
//
//   Pause -> Propagate -> Atomic -> SweepAllGc -> SweepFinObj
//         -> SweepToBeFnz -> SweepEnd -> CallFin -> Pause
//
// Invariant: outside the atomic phase no black object references a
// current-white object. Write barriers (bottom of this file) restore the
// invariant on mutator writes; sweep reclaims whatever still carries the
// previous cycle's white after the atomic phase flipped colors.

mod header;
mod object_pool;
mod string_table;
mod trace;
mod weak;

pub use header::{other_white, GcHeader, GcRef, ObjectKind};
pub use object_pool::{GcBody, GcObject, LongStr, ObjectPool, ShortStr};
pub use string_table::{str_hash, StringTable};

use crate::loam_value::{LoamValue, UpvalRef};
use crate::loam_vm::loam_limits::MIN_STRTAB_SIZE;
use crate::loam_vm::{LoamError, LoamResult, LoamVm};

// GC tuning parameters, indices into Gc::params
pub const PAUSE: usize = 0; // cycle start threshold (percent, default 200)
pub const STEPMUL: usize = 1; // collector speed vs. allocation (percent, default 200)
pub const GCPARAM_COUNT: usize = 2;

pub const DEFAULT_GCPAUSE: i32 = 200;
pub const DEFAULT_GCSTEPMUL: i32 = 200;

/// Divisor applied to raw debt before scaling by stepmul.
const STEPMULADJ: isize = 200;
/// Divisor applied to the estimate when computing the pause threshold.
const PAUSEADJ: isize = 100;
/// Objects swept per work unit.
const GCSWEEPMAX: usize = 100;
/// Work charged per swept object.
const GCSWEEPCOST: usize = 16;
/// Work charged per finalizer run.
const GCFINALIZECOST: usize = 64;
/// Allocation credit granted between steps.
pub const GCSTEPSIZE: isize = (100 * std::mem::size_of::<GcObject>()) as isize;

const MAX_MEM: isize = isize::MAX / 2;

/// Collector phase. Exactly one is active; ordering matters for
/// `keep_invariant` and `is_sweep`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Propagate = 0,
    Atomic = 1,
    SweepAllGc = 2,
    SweepFinObj = 3,
    SweepToBeFnz = 4,
    SweepEnd = 5,
    CallFin = 6,
    Pause = 7,
}

impl GcState {
    #[inline]
    pub fn is_sweep(self) -> bool {
        matches!(
            self,
            GcState::SweepAllGc | GcState::SweepFinObj | GcState::SweepToBeFnz | GcState::SweepEnd
        )
    }

    /// While marking is in progress the tri-color invariant must hold;
    /// afterwards (sweeping) barriers downgrade owners instead.
    #[inline]
    pub fn keep_invariant(self) -> bool {
        (self as u8) <= (GcState::Atomic as u8)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_collected: usize,
    pub bytes_freed: usize,
}

/// Collector state bag, owned by the VM. Ownership lists (`allgc`,
/// `finobj`, `tobefnz`, `fixedgc`) are intrusive through the object
/// headers; every collectable sits on exactly one of them. The gray and
/// weak worklists are transient and rebuilt each cycle.
pub struct Gc {
    pub(crate) state: GcState,
    /// Current white color index (0 or 1), flipped by the atomic phase
    pub(crate) current_white: u8,
    pub(crate) running: bool,
    pub(crate) emergency: bool,

    /// Bytes allocated but not yet paid for by collector work.
    /// Positive debt means a step is due.
    pub(crate) debt: isize,
    /// Live-accounted bytes, excluding debt
    pub(crate) total_bytes: isize,
    /// Bytes believed in use after the last atomic phase
    pub(crate) estimate: isize,
    /// Bytes traversed in the current work slice
    pub(crate) mem_trav: isize,

    pub(crate) params: [i32; GCPARAM_COUNT],
    /// Finalizers to run per CallFin slice; doubles on each re-entry
    pub(crate) gc_fin_num: usize,

    // ownership lists
    pub(crate) allgc: Option<GcRef>,
    pub(crate) finobj: Option<GcRef>,
    pub(crate) tobefnz: Option<GcRef>,
    pub(crate) fixedgc: Option<GcRef>,
    /// Sweep position: None = no sweep in progress, Some(None) = at the
    /// head of the current list, Some(Some(p)) = after survivor p
    pub(crate) sweep_cursor: Option<Option<GcRef>>,

    // transient worklists
    pub(crate) gray: Vec<GcRef>,
    pub(crate) grayagain: Vec<GcRef>,
    pub(crate) weak: Vec<GcRef>,
    pub(crate) ephemeron: Vec<GcRef>,
    pub(crate) allweak: Vec<GcRef>,
    /// Threads currently holding open upvalues
    pub(crate) twups: Vec<GcRef>,

    pub(crate) stats: GcStats,
}

impl Gc {
    pub(crate) fn new() -> Self {
        Gc {
            state: GcState::Pause,
            current_white: 0,
            running: false,
            emergency: false,
            debt: 0,
            total_bytes: 0,
            estimate: 0,
            mem_trav: 0,
            params: [DEFAULT_GCPAUSE, DEFAULT_GCSTEPMUL],
            gc_fin_num: 0,
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            sweep_cursor: None,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            twups: Vec::new(),
            stats: GcStats::default(),
        }
    }
}

impl LoamVm {
    // ==================== Debt & pacing ====================

    /// Total memory footprint: live-accounted bytes plus debt.
    #[inline]
    pub(crate) fn footprint(&self) -> isize {
        self.gc.total_bytes + self.gc.debt
    }

    /// Move `debt` between the two accounting fields, keeping the
    /// footprint constant.
    pub(crate) fn set_debt(&mut self, mut debt: isize) {
        let tb = self.footprint();
        if debt < tb - MAX_MEM {
            debt = tb - MAX_MEM;
        }
        self.gc.total_bytes = tb - debt;
        self.gc.debt = debt;
    }

    /// Debt converted to work units for one step, scaled by stepmul.
    fn scaled_debt(&self) -> isize {
        let debt = self.gc.debt;
        if debt <= 0 {
            return 0;
        }
        let stepmul = self.gc.params[STEPMUL].max(1) as isize;
        let debt = debt / STEPMULADJ + 1;
        if debt < MAX_MEM / stepmul {
            debt * stepmul
        } else {
            MAX_MEM
        }
    }

    /// Set the credit that delays the start of the next cycle:
    /// threshold = estimate/100 * pause.
    pub(crate) fn set_pause_debt(&mut self) {
        let estimate = (self.gc.estimate / PAUSEADJ).max(1);
        let pause = self.gc.params[PAUSE] as isize;
        let threshold = if pause < MAX_MEM / estimate {
            estimate * pause
        } else {
            MAX_MEM
        };
        let debt = self.footprint() - threshold;
        self.set_debt(debt);
    }

    /// One collector step: performs work units until enough debt is paid
    /// or the cycle finishes. Never raises except for a faulting
    /// finalizer run at the end of the slice.
    pub fn gc_step(&mut self) -> LoamResult<()> {
        if !self.gc.running {
            self.set_debt(-GCSTEPSIZE * 10);
            return Ok(());
        }
        self.do_step()
    }

    pub(crate) fn do_step(&mut self) -> LoamResult<()> {
        let mut debt = self.scaled_debt();
        loop {
            let work = self.single_step()?;
            debt -= work;
            if debt <= -GCSTEPSIZE || self.gc.state == GcState::Pause {
                break;
            }
        }
        if self.gc.state == GcState::Pause {
            self.set_pause_debt();
        } else {
            let stepmul = self.gc.params[STEPMUL].max(1) as isize;
            let debt = (debt / stepmul) * STEPMULADJ;
            self.set_debt(debt);
            self.run_a_few_finalizers(true)?;
        }
        Ok(())
    }

    // ==================== State machine ====================

    pub(crate) fn single_step(&mut self) -> LoamResult<isize> {
        match self.gc.state {
            GcState::Pause => {
                self.gc.mem_trav =
                    (self.strings.size() * std::mem::size_of::<Option<GcRef>>()) as isize;
                self.restart_collection();
                self.gc.state = GcState::Propagate;
                Ok(self.gc.mem_trav)
            }
            GcState::Propagate => {
                self.gc.mem_trav = 0;
                self.propagate_mark();
                if self.gc.gray.is_empty() {
                    self.gc.state = GcState::Atomic;
                }
                Ok(self.gc.mem_trav)
            }
            GcState::Atomic => {
                // barriers may have regrown the gray list
                self.propagate_all();
                let work = self.atomic();
                self.enter_sweep();
                self.gc.estimate = self.footprint();
                Ok(work)
            }
            GcState::SweepAllGc => {
                if self.sweep_list_step() {
                    self.gc.state = GcState::SweepFinObj;
                    self.gc.sweep_cursor = Some(None);
                }
                Ok((GCSWEEPMAX * GCSWEEPCOST) as isize)
            }
            GcState::SweepFinObj => {
                if self.sweep_list_step() {
                    self.gc.state = GcState::SweepToBeFnz;
                    self.gc.sweep_cursor = Some(None);
                }
                Ok((GCSWEEPMAX * GCSWEEPCOST) as isize)
            }
            GcState::SweepToBeFnz => {
                if self.sweep_list_step() {
                    self.gc.state = GcState::SweepEnd;
                }
                Ok((GCSWEEPMAX * GCSWEEPCOST) as isize)
            }
            GcState::SweepEnd => {
                let cw = self.gc.current_white;
                if let Some(h) = self.pool.header_mut(self.main_thread) {
                    h.make_white(cw);
                }
                self.check_sizes();
                self.gc.state = GcState::CallFin;
                Ok(0)
            }
            GcState::CallFin => {
                if self.gc.tobefnz.is_some() && !self.gc.emergency {
                    let n = self.run_a_few_finalizers(true)?;
                    Ok((n * GCFINALIZECOST) as isize)
                } else {
                    #[cfg(feature = "gc_logging")]
                    tracing::debug!(
                        cycle = self.gc.stats.cycles,
                        total_bytes = self.gc.total_bytes,
                        estimate = self.gc.estimate,
                        "gc cycle finished"
                    );
                    self.gc.state = GcState::Pause;
                    Ok(0)
                }
            }
        }
    }

    /// Reset the worklists and mark the root set: main thread, registry,
    /// per-type metatables, and any leftovers awaiting finalization.
    fn restart_collection(&mut self) {
        self.gc.stats.cycles += 1;
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        self.gc.ephemeron.clear();
        self.gc.allweak.clear();
        let main = self.main_thread;
        let registry = self.registry;
        self.mark_object(main);
        self.mark_value(registry);
        self.mark_mt();
        self.mark_beingfnz();
        #[cfg(feature = "gc_logging")]
        tracing::debug!(cycle = self.gc.stats.cycles, "gc cycle started");
    }

    /// The non-interruptible phase: re-mark the roots, settle open
    /// upvalues, drain every gray list, converge ephemerons, separate
    /// and resurrect objects to be finalized, clear weak entries, sweep
    /// the string cache, and flip the white.
    fn atomic(&mut self) -> isize {
        debug_assert!(self.gc.ephemeron.is_empty() && self.gc.weak.is_empty());
        debug_assert!(!self.pool.is_white(self.main_thread));
        self.gc.mem_trav = 0;

        let main = self.main_thread;
        let registry = self.registry;
        self.mark_object(main);
        // the registry and type metatables may have changed mid-cycle
        self.mark_value(registry);
        self.mark_mt();
        self.remark_upvals();
        self.propagate_all();
        let mut work = self.gc.mem_trav;

        // objects saved for atomic re-traversal: barriered blacks, weak
        // tables seen during propagation, threads
        let grayagain = std::mem::take(&mut self.gc.grayagain);
        self.gc.gray = grayagain;
        self.propagate_all();

        self.gc.mem_trav = 0;
        self.converge_ephemerons();
        // all strongly reachable objects are marked; clear weak values
        // before checking finalizers
        let weak_now = self.gc.weak.clone();
        self.clear_weak_values(&weak_now);
        let allweak_now = self.gc.allweak.clone();
        self.clear_weak_values(&allweak_now);
        let orig_weak = self.gc.weak.len();
        let orig_allweak = self.gc.allweak.len();
        work += self.gc.mem_trav;

        self.separate_tobefnz(false);
        self.gc.gc_fin_num = 1;
        // resurrection: queued objects (and what they reference) must
        // survive until their finalizer has run
        self.mark_beingfnz();
        self.propagate_all();
        self.gc.mem_trav = 0;
        self.converge_ephemerons();

        let eph = self.gc.ephemeron.clone();
        self.clear_weak_keys(&eph);
        let allweak_all = self.gc.allweak.clone();
        self.clear_weak_keys(&allweak_all);
        // clear values only from the portions added by resurrection
        let weak_tail = self.gc.weak[orig_weak..].to_vec();
        self.clear_weak_values(&weak_tail);
        let allweak_tail = self.gc.allweak[orig_allweak..].to_vec();
        self.clear_weak_values(&allweak_tail);

        self.clear_string_cache();
        self.gc.current_white = other_white(self.gc.current_white);
        work += self.gc.mem_trav;
        work
    }

    // ==================== Sweep ====================

    pub(crate) fn enter_sweep(&mut self) {
        self.gc.state = GcState::SweepAllGc;
        self.gc.sweep_cursor = Some(None);
    }

    fn sweep_list_head(&self) -> Option<GcRef> {
        match self.gc.state {
            GcState::SweepAllGc => self.gc.allgc,
            GcState::SweepFinObj => self.gc.finobj,
            GcState::SweepToBeFnz => self.gc.tobefnz,
            _ => None,
        }
    }

    fn set_sweep_list_head(&mut self, head: Option<GcRef>) {
        match self.gc.state {
            GcState::SweepAllGc => self.gc.allgc = head,
            GcState::SweepFinObj => self.gc.finobj = head,
            GcState::SweepToBeFnz => self.gc.tobefnz = head,
            _ => debug_assert!(false, "sweep outside a sweep state"),
        }
    }

    /// Sweep up to GCSWEEPMAX objects of the current list: free the dead
    /// (other-white) ones, recolor survivors to the current white.
    /// Returns true once the list is exhausted.
    fn sweep_list_step(&mut self) -> bool {
        let ow = other_white(self.gc.current_white);
        let cw = self.gc.current_white;
        let mut count = 0;
        while count < GCSWEEPMAX {
            let cur = match self.gc.sweep_cursor {
                Some(None) => self.sweep_list_head(),
                Some(Some(p)) => self.pool.next_of(p),
                None => None,
            };
            let Some(r) = cur else {
                self.gc.sweep_cursor = None;
                return true;
            };
            let dead = self
                .pool
                .header(r)
                .map(|h| {
                    debug_assert!(!h.is_fixed());
                    h.is_dead(ow)
                })
                .unwrap_or(false);
            if dead {
                let next = self.pool.next_of(r);
                match self.gc.sweep_cursor {
                    Some(None) => self.set_sweep_list_head(next),
                    Some(Some(p)) => {
                        if let Some(h) = self.pool.header_mut(p) {
                            h.next = next;
                        }
                    }
                    None => {}
                }
                self.free_object(r);
            } else {
                if let Some(h) = self.pool.header_mut(r) {
                    h.make_white(cw);
                }
                self.gc.sweep_cursor = Some(Some(r));
            }
            count += 1;
        }
        false
    }

    /// Release a dead object: unchain short strings from the string
    /// table, close a dead thread's open upvalues, then drop the body
    /// and refund its accounting size.
    fn free_object(&mut self, r: GcRef) {
        match self.pool.kind(r) {
            Some(ObjectKind::ShortStr) => self.remove_short_string(r),
            Some(ObjectKind::Thread) => {
                let upvals = self
                    .pool
                    .thread(r)
                    .map(|th| th.open_upvals.clone())
                    .unwrap_or_default();
                for uv in upvals {
                    let v = self.upvalue_value(&uv);
                    uv.borrow_mut().close(v);
                }
            }
            _ => {}
        }
        if let Some(obj) = self.pool.remove(r) {
            let size = obj.header.size as isize;
            self.gc.debt -= size;
            self.gc.stats.objects_collected += 1;
            self.gc.stats.bytes_freed += size as usize;
        }
    }

    /// End-of-cycle housekeeping: shrink an underloaded string table
    /// (skipped in emergency) and fold the shrink into the estimate.
    fn check_sizes(&mut self) {
        if self.gc.emergency {
            return;
        }
        let old_debt = self.gc.debt;
        if self.strings.nuse() < self.strings.size() / 4 && self.strings.size() > MIN_STRTAB_SIZE {
            let halved = self.strings.size() / 2;
            self.resize_string_table(halved);
        }
        self.gc.estimate += self.gc.debt - old_debt;
    }

    // ==================== Full collection ====================

    /// Two back-to-back half cycles: finish the current cycle through a
    /// fresh sweep (so a mid-mark heap is re-whitened, never trusted),
    /// then run one complete cycle including finalizers. Emergency mode
    /// suppresses finalizers and stack shrinking.
    pub fn full_gc(&mut self, emergency: bool) -> LoamResult<()> {
        let saved = self.gc.emergency;
        self.gc.emergency = emergency;
        if self.gc.state.keep_invariant() {
            self.enter_sweep();
        }
        self.run_until(GcState::Pause)?;
        self.run_until(GcState::CallFin)?;
        self.run_until(GcState::Pause)?;
        self.gc.emergency = saved;
        self.set_pause_debt();
        Ok(())
    }

    fn run_until(&mut self, target: GcState) -> LoamResult<()> {
        while self.gc.state != target {
            self.single_step()?;
        }
        Ok(())
    }

    // ==================== Finalization ====================

    /// Called when an object acquires a metatable: an unfinalized object
    /// whose new metatable declares `__gc` moves from allgc to finobj so
    /// the atomic phase can queue it once it becomes unreachable.
    pub(crate) fn check_finalizer(&mut self, r: GcRef) {
        let already = self
            .pool
            .header(r)
            .map(|h| h.to_finalize() || h.is_fixed())
            .unwrap_or(true);
        if already {
            return;
        }
        let has_gc = self
            .get_metatable_of_ref(r)
            .map(|mt| !self.metatable_field(mt, self.tm_gc).is_nil())
            .unwrap_or(false);
        if !has_gc {
            return;
        }
        if self.gc.state.is_sweep() {
            // pretend it was already swept, and keep the cursor off it
            let cw = self.gc.current_white;
            if let Some(h) = self.pool.header_mut(r) {
                h.make_white(cw);
            }
        }
        // unlink from allgc
        let mut prev: Option<GcRef> = None;
        let mut cur = self.gc.allgc;
        while let Some(c) = cur {
            if c == r {
                let next = self.pool.next_of(c);
                match prev {
                    None => self.gc.allgc = next,
                    Some(p) => {
                        if let Some(h) = self.pool.header_mut(p) {
                            h.next = next;
                        }
                    }
                }
                if self.gc.state == GcState::SweepAllGc && self.gc.sweep_cursor == Some(Some(r)) {
                    self.gc.sweep_cursor = Some(prev);
                }
                if let Some(h) = self.pool.header_mut(r) {
                    h.next = self.gc.finobj;
                    h.set_finalized();
                }
                self.gc.finobj = Some(r);
                return;
            }
            prev = Some(c);
            cur = self.pool.next_of(c);
        }
        debug_assert!(false, "object with new metatable not found in allgc");
    }

    /// Move members of finobj to the end of tobefnz: the white ones, or
    /// all of them during a shutdown drain. Declaration order is
    /// preserved.
    pub(crate) fn separate_tobefnz(&mut self, all: bool) {
        let mut tail = {
            let mut t = None;
            let mut cur = self.gc.tobefnz;
            while let Some(c) = cur {
                t = Some(c);
                cur = self.pool.next_of(c);
            }
            t
        };
        let mut prev: Option<GcRef> = None;
        let mut cur = self.gc.finobj;
        while let Some(c) = cur {
            debug_assert!(self.pool.header(c).map(|h| h.to_finalize()).unwrap_or(false));
            let next = self.pool.next_of(c);
            if !(all || self.pool.is_white(c)) {
                prev = Some(c);
                cur = next;
                continue;
            }
            match prev {
                None => self.gc.finobj = next,
                Some(p) => {
                    if let Some(h) = self.pool.header_mut(p) {
                        h.next = next;
                    }
                }
            }
            if let Some(h) = self.pool.header_mut(c) {
                h.next = None;
            }
            match tail {
                None => self.gc.tobefnz = Some(c),
                Some(t) => {
                    if let Some(h) = self.pool.header_mut(t) {
                        h.next = Some(c);
                    }
                }
            }
            tail = Some(c);
            cur = next;
        }
    }

    /// Run up to gc_fin_num finalizers, doubling the batch for the next
    /// slice while the queue is non-empty.
    pub(crate) fn run_a_few_finalizers(&mut self, propagate_errors: bool) -> LoamResult<usize> {
        let mut n = 0;
        while self.gc.tobefnz.is_some() && n < self.gc.gc_fin_num {
            self.call_gc_tm(propagate_errors)?;
            n += 1;
        }
        self.gc.gc_fin_num = if self.gc.tobefnz.is_none() {
            0
        } else {
            self.gc.gc_fin_num * 2
        };
        Ok(n)
    }

    /// Dequeue the head of tobefnz, resurrect it onto allgc, and invoke
    /// its `__gc` handler under a protected call with hooks and GC
    /// re-entry disabled. Errors are wrapped, and swallowed when
    /// `propagate_errors` is false (shutdown drain).
    pub(crate) fn call_gc_tm(&mut self, propagate_errors: bool) -> LoamResult<()> {
        let Some(r) = self.gc.tobefnz else {
            return Ok(());
        };
        self.gc.tobefnz = self.pool.next_of(r);
        let cw = self.gc.current_white;
        let sweeping = self.gc.state.is_sweep();
        if let Some(h) = self.pool.header_mut(r) {
            h.next = self.gc.allgc;
            h.clear_finalized();
            if sweeping {
                h.make_white(cw);
            }
        }
        self.gc.allgc = Some(r);

        let objv = LoamValue::Obj(r);
        let handler = self
            .get_metatable_of_ref(r)
            .map(|mt| self.metatable_field(mt, self.tm_gc))
            .unwrap_or(LoamValue::Nil);
        if handler.is_nil() {
            return Ok(());
        }

        let saved_hook = self.allow_hook;
        let saved_running = self.gc.running;
        self.allow_hook = false;
        self.gc.running = false;
        let result = self.call_finalizer_value(handler, objv);
        self.allow_hook = saved_hook;
        self.gc.running = saved_running;

        if let Err(inner) = result {
            if propagate_errors {
                self.error_msg = format!("error in finalizer ({inner})");
                #[cfg(feature = "gc_logging")]
                tracing::debug!(error = %inner, "finalizer faulted");
                return Err(LoamError::GcFinalizerError);
            }
        }
        Ok(())
    }

    fn call_finalizer_value(&mut self, handler: LoamValue, arg: LoamValue) -> LoamResult<()> {
        let Some(hr) = handler.as_obj() else {
            self.error_msg = "attempt to call a non-function finalizer".to_string();
            return Err(LoamError::RuntimeError);
        };
        match self.pool.kind(hr) {
            Some(ObjectKind::NativeClosure) => {
                let func = match self.pool.native_closure(hr) {
                    Some(c) => c.func,
                    None => return Ok(()),
                };
                func(self, arg)
            }
            Some(ObjectKind::Closure) => {
                // executing bytecode is the interpreter's job, which is
                // not part of this crate
                self.error_msg = "scripted finalizers require the interpreter".to_string();
                Err(LoamError::RuntimeError)
            }
            _ => {
                self.error_msg = "attempt to call a non-function finalizer".to_string();
                Err(LoamError::RuntimeError)
            }
        }
    }

    // ==================== Fixed objects ====================

    /// Exempt the most recently allocated object from collection. It
    /// must still be the head of allgc.
    pub(crate) fn fix_object(&mut self, r: GcRef) {
        debug_assert_eq!(self.gc.allgc, Some(r));
        let next = self.pool.next_of(r);
        self.gc.allgc = next;
        if let Some(h) = self.pool.header_mut(r) {
            h.make_gray();
            h.set_fixed();
            h.next = self.gc.fixedgc;
        }
        self.gc.fixedgc = Some(r);
    }

    // ==================== Write barriers ====================

    /// Forward barrier: a black owner gained a white child. While the
    /// invariant is being kept the child is marked now; during sweep the
    /// owner is downgraded to white so the write cannot re-trigger.
    pub fn barrier_forward(&mut self, owner: GcRef, child: LoamValue) {
        let Some(c) = child.as_obj() else { return };
        if !(self.pool.is_black(owner) && self.pool.is_white(c)) {
            return;
        }
        if self.gc.state.keep_invariant() {
            self.mark_object(c);
        } else {
            debug_assert!(self.gc.state.is_sweep());
            let cw = self.gc.current_white;
            if let Some(h) = self.pool.header_mut(owner) {
                h.make_white(cw);
            }
        }
    }

    /// Backward barrier: flip the owner back to gray and revisit it in
    /// the atomic phase. Cheaper for containers absorbing many writes.
    pub fn barrier_back(&mut self, owner: GcRef) {
        if !self.pool.is_black(owner) {
            return;
        }
        if let Some(h) = self.pool.header_mut(owner) {
            h.make_gray();
        }
        self.gc.grayagain.push(owner);
    }

    /// Barrier on writes through a closed upvalue. Upvalues are shared
    /// between closures of unknown colors, so the new value is marked
    /// conservatively while the invariant is being kept.
    pub fn barrier_upvalue(&mut self, uv: &UpvalRef, new_value: LoamValue) {
        debug_assert!(!uv.borrow().is_open());
        let Some(r) = new_value.as_obj() else { return };
        if self.gc.state.keep_invariant() && self.pool.is_white(r) {
            self.mark_object(r);
        }
    }

    // ==================== Introspection ====================

    pub fn gc_state(&self) -> GcState {
        self.gc.state
    }

    pub fn gc_debt(&self) -> isize {
        self.gc.debt
    }

    pub fn gc_estimate(&self) -> isize {
        self.gc.estimate
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc.running
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats.clone()
    }

    /// Total memory footprint in bytes.
    pub fn count_bytes(&self) -> usize {
        self.footprint().max(0) as usize
    }
}


