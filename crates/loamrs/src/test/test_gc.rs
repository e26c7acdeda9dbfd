// Core collector behavior: reachability, ownership lists, full-gc
// idempotence.

use crate::loam_value::LoamValue;
use crate::loam_vm::LoamVm;
use crate::test::assert_lists_disjoint;

#[test]
fn test_unrooted_objects_are_collected() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let before = vm.object_count();
    for _ in 0..10 {
        vm.create_table().unwrap();
    }
    assert_eq!(vm.object_count(), before + 10);
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), before);
}

#[test]
fn test_rooted_objects_survive() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let t = vm.create_table().unwrap();
    vm.set_global("keep", t).unwrap();
    vm.table_set(t, LoamValue::Int(1), LoamValue::Int(99)).unwrap();
    vm.full_gc(false).unwrap();
    vm.full_gc(false).unwrap();
    let back = vm.get_global("keep").unwrap();
    assert_eq!(back.as_obj(), t.as_obj());
    assert_eq!(
        vm.table_get(back, LoamValue::Int(1)).unwrap(),
        LoamValue::Int(99)
    );
}

#[test]
fn test_reachability_through_chains() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    // a -> b -> c, only a rooted
    let a = vm.create_table().unwrap();
    let b = vm.create_table().unwrap();
    let c = vm.create_table().unwrap();
    vm.table_set(b, LoamValue::Int(1), c).unwrap();
    vm.table_set(a, LoamValue::Int(1), b).unwrap();
    vm.set_global("a", a).unwrap();
    let count = vm.object_count();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), count);
    // cut the chain below a
    vm.table_set(a, LoamValue::Int(1), LoamValue::Nil).unwrap();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), count - 2);
}

#[test]
fn test_cycles_are_collected() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let before = vm.object_count();
    let a = vm.create_table().unwrap();
    let b = vm.create_table().unwrap();
    vm.table_set(a, LoamValue::Int(1), b).unwrap();
    vm.table_set(b, LoamValue::Int(1), a).unwrap();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), before);
}

#[test]
fn test_ownership_lists_disjoint() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    assert_lists_disjoint(&vm);
    for i in 0..20 {
        let t = vm.create_table().unwrap();
        if i % 2 == 0 {
            vm.set_global(&format!("t{i}"), t).unwrap();
        }
    }
    assert_lists_disjoint(&vm);
    vm.full_gc(false).unwrap();
    assert_lists_disjoint(&vm);
}

#[test]
fn test_full_gc_idempotent() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    for i in 0..16 {
        let t = vm.create_table().unwrap();
        vm.set_global(&format!("x{i}"), t).unwrap();
    }
    vm.full_gc(false).unwrap();
    let count = vm.object_count();
    let total = vm.gc.total_bytes;
    let estimate = vm.gc.estimate;
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), count);
    assert_eq!(vm.gc.total_bytes, total);
    assert_eq!(vm.gc.estimate, estimate);
}

#[test]
fn test_estimate_tracks_footprint_when_quiescent() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    for i in 0..8 {
        let t = vm.create_table().unwrap();
        vm.set_global(&format!("q{i}"), t).unwrap();
    }
    vm.full_gc(false).unwrap();
    vm.full_gc(false).unwrap();
    // with no garbage, the collector's estimate equals the footprint
    assert_eq!(vm.gc.estimate, vm.footprint());
}

#[test]
fn test_stop_parks_the_collector() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    assert!(!vm.gc_is_running());
    let cycles = vm.gc_stats().cycles;
    for _ in 0..200 {
        vm.create_table().unwrap();
    }
    // allocation debt accumulates but no step runs
    assert_eq!(vm.gc_stats().cycles, cycles);
    vm.gc_start();
    assert!(vm.gc_is_running());
}

#[test]
fn test_userdata_chain_traversal() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    // u1 -> u2 -> table, rooted through u1
    let u1 = vm.new_userdata(Box::new(1u32)).unwrap();
    let u2 = vm.new_userdata(Box::new(2u32)).unwrap();
    let t = vm.create_table().unwrap();
    vm.set_user_value(u2, t).unwrap();
    vm.set_user_value(u1, u2).unwrap();
    vm.set_global("u", u1).unwrap();
    let count = vm.object_count();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), count);
    assert_eq!(vm.user_value(vm.user_value(u1)).as_obj(), t.as_obj());
}

#[test]
fn test_proto_cache_is_collectable() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let src = vm.create_string("chunk").unwrap();
    let proto = vm.create_proto(src).unwrap();
    vm.set_global("p", proto).unwrap();
    let clo = vm.create_closure(proto, Vec::new()).unwrap();
    assert_eq!(vm.cached_closure(proto).unwrap(), Some(clo));
    // the closure is not rooted anywhere else: the traversal drops the
    // cache entry and the sweep frees the closure
    vm.full_gc(false).unwrap();
    assert_eq!(vm.cached_closure(proto).unwrap(), None);
}

#[test]
fn test_proto_constants_are_traversed() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let src = vm.create_string("chunk").unwrap();
    let proto = vm.create_proto(src).unwrap();
    vm.set_global("p", proto).unwrap();
    let k = vm.create_table().unwrap();
    vm.proto_add_constant(proto, k).unwrap();
    let count = vm.object_count();
    vm.full_gc(false).unwrap();
    assert_eq!(vm.object_count(), count);
}


