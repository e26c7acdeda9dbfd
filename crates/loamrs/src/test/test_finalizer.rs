// Finalization: exactly-once execution, resurrection, error wrapping,
// the shutdown drain, and emergency suppression.

use crate::loam_value::LoamValue;
use crate::loam_vm::{LoamError, LoamResult, LoamVm};

fn fin_record(vm: &mut LoamVm, obj: LoamValue) -> LoamResult<()> {
    let n = vm.get_global("fin_count")?.as_int().unwrap_or(0);
    vm.set_global("fin_count", LoamValue::Int(n + 1))?;
    vm.set_global("saved", obj)
}

fn fin_count_only(vm: &mut LoamVm, _obj: LoamValue) -> LoamResult<()> {
    let n = vm.get_global("fin_count")?.as_int().unwrap_or(0);
    vm.set_global("fin_count", LoamValue::Int(n + 1))
}

fn fin_fail(vm: &mut LoamVm, _obj: LoamValue) -> LoamResult<()> {
    vm.error_msg = "deliberate fault".to_string();
    Err(LoamError::RuntimeError)
}

/// Give `obj` a metatable whose `__gc` is `handler`.
fn register_finalizer(
    vm: &mut LoamVm,
    obj: LoamValue,
    handler: crate::loam_value::NativeFn,
) -> LoamResult<()> {
    let mt = vm.create_table()?;
    let gc_key = vm.create_string("__gc")?;
    let closure = vm.create_native_closure(handler, Vec::new())?;
    vm.table_set(mt, gc_key, closure)?;
    vm.set_metatable(obj, mt)
}

#[test]
fn test_finalizer_runs_once_on_collection() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    register_finalizer(&mut vm, x, fin_count_only).unwrap();
    vm.full_gc(false).unwrap();
    assert_eq!(
        vm.get_global("fin_count").unwrap(),
        LoamValue::Int(1)
    );
    // the object was resurrected for the call; the next cycle frees it
    // without running the finalizer again
    vm.full_gc(false).unwrap();
    vm.full_gc(false).unwrap();
    assert_eq!(
        vm.get_global("fin_count").unwrap(),
        LoamValue::Int(1)
    );
}

#[test]
fn test_finalizer_not_run_while_reachable() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    vm.set_global("x", x).unwrap();
    register_finalizer(&mut vm, x, fin_count_only).unwrap();
    vm.full_gc(false).unwrap();
    vm.full_gc(false).unwrap();
    assert!(vm.get_global("fin_count").unwrap().is_nil());
}

#[test]
fn test_finalizer_resurrection() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    let xref = x.as_obj();
    register_finalizer(&mut vm, x, fin_record).unwrap();

    // first collection: the finalizer runs and stores x in a global
    vm.full_gc(false).unwrap();
    assert_eq!(vm.get_global("fin_count").unwrap(), LoamValue::Int(1));
    assert_eq!(vm.get_global("saved").unwrap().as_obj(), xref);

    // second collection: the global still holds x; it survives and the
    // finalizer does not run again
    vm.full_gc(false).unwrap();
    assert_eq!(vm.get_global("fin_count").unwrap(), LoamValue::Int(1));
    assert_eq!(vm.get_global("saved").unwrap().as_obj(), xref);

    // clear the global: x is freed for good, still without a second
    // finalizer call
    vm.set_global("saved", LoamValue::Nil).unwrap();
    let before = vm.object_count();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), before - 1);
    assert_eq!(vm.get_global("fin_count").unwrap(), LoamValue::Int(1));
}

#[test]
fn test_finalizers_run_in_reverse_registration_order() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    // record the order finalized objects are seen in
    fn fin_order(vm: &mut LoamVm, obj: LoamValue) -> LoamResult<()> {
        let log = vm.get_global("order")?;
        let n = vm.table_len(log);
        let tag = vm.table_get(obj, LoamValue::Int(1))?;
        vm.table_set(log, LoamValue::Int(n as i64 + 1), tag)
    }
    let log = vm.create_table().unwrap();
    vm.set_global("order", log).unwrap();
    for i in 1..=3 {
        let x = vm.create_table().unwrap();
        vm.table_set(x, LoamValue::Int(1), LoamValue::Int(i)).unwrap();
        register_finalizer(&mut vm, x, fin_order).unwrap();
    }
    vm.full_gc(false).unwrap();
    // most recently registered first
    assert_eq!(vm.table_len(log), 3);
    assert_eq!(vm.table_get(log, LoamValue::Int(1)).unwrap(), LoamValue::Int(3));
    assert_eq!(vm.table_get(log, LoamValue::Int(2)).unwrap(), LoamValue::Int(2));
    assert_eq!(vm.table_get(log, LoamValue::Int(3)).unwrap(), LoamValue::Int(1));
}

#[test]
fn test_finalizer_error_is_wrapped() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    register_finalizer(&mut vm, x, fin_fail).unwrap();
    let err = vm.full_gc(false).unwrap_err();
    assert_eq!(err, LoamError::GcFinalizerError);
    let full = vm.into_full_error(err);
    assert!(full.message().contains("error in finalizer"));
}

#[test]
fn test_close_drains_finalizers_and_swallows_errors() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let good = vm.create_table().unwrap();
    vm.set_global("good", good).unwrap();
    register_finalizer(&mut vm, good, fin_count_only).unwrap();
    let bad = vm.create_table().unwrap();
    vm.set_global("bad", bad).unwrap();
    register_finalizer(&mut vm, bad, fin_fail).unwrap();
    // both objects are still reachable; close finalizes them anyway and
    // discards the fault from the bad one
    vm.close();
    assert_eq!(vm.get_global("fin_count").unwrap(), LoamValue::Int(1));
}

#[test]
fn test_emergency_collection_skips_finalizers() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    register_finalizer(&mut vm, x, fin_count_only).unwrap();
    vm.full_gc(true).unwrap();
    assert!(vm.get_global("fin_count").unwrap().is_nil());
    // a later normal collection runs the queued finalizer
    vm.full_gc(false).unwrap();
    assert_eq!(vm.get_global("fin_count").unwrap(), LoamValue::Int(1));
}

#[test]
fn test_finalizable_object_moves_between_lists() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let x = vm.create_table().unwrap();
    let xref = x.as_obj().unwrap();
    register_finalizer(&mut vm, x, fin_count_only).unwrap();
    // registration moved it from allgc to finobj
    assert!(crate::test::collect_list(&vm, vm.gc.finobj).contains(&xref));
    assert!(!crate::test::collect_list(&vm, vm.gc.allgc).contains(&xref));
    crate::test::assert_lists_disjoint(&vm);
    vm.full_gc(false).unwrap();
    // after finalization it is back on allgc (resurrected)
    assert!(crate::test::collect_list(&vm, vm.gc.allgc).contains(&xref));
    crate::test::assert_lists_disjoint(&vm);
}


