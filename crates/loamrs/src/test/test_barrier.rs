// Write barriers: a missed barrier loses a reachable object; each
// barrier variant restores the invariant its own way.

use crate::gc::GcState;
use crate::loam_value::LoamValue;
use crate::loam_vm::LoamVm;

/// Start a cycle and propagate until `r` has been traversed.
fn run_until_black(vm: &mut LoamVm, r: crate::gc::GcRef) {
    assert_eq!(vm.gc_state(), GcState::Pause);
    vm.single_step().unwrap();
    assert_eq!(vm.gc_state(), GcState::Propagate);
    let mut guard = 0;
    while !vm.pool.is_black(r) && vm.gc_state() == GcState::Propagate {
        vm.single_step().unwrap();
        guard += 1;
        assert!(guard < 1000, "object never turned black");
    }
    assert!(vm.pool.is_black(r));
    assert!(vm.gc_state().keep_invariant());
}

#[test]
fn test_missed_barrier_loses_a_reachable_object() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    run_until_black(&mut vm, owner_ref);

    // write a fresh white table into the black owner, bypassing the
    // barrier the runtime would normally emit
    let child = vm.create_table().unwrap();
    let child_ref = child.as_obj().unwrap();
    vm.pool
        .table_mut(owner_ref)
        .unwrap()
        .raw_set(LoamValue::Int(1), child);

    while vm.gc_state() != GcState::Pause {
        vm.single_step().unwrap();
    }
    // the collector never saw the edge: the child is gone
    assert!(!vm.pool.contains(child_ref));

    // drop the dangling edge before anything traverses it again
    vm.pool
        .table_mut(owner_ref)
        .unwrap()
        .raw_set(LoamValue::Int(1), LoamValue::Nil);
}

#[test]
fn test_backward_barrier_saves_the_object() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    run_until_black(&mut vm, owner_ref);

    // same write through the runtime entry point, which emits the
    // backward barrier for table stores
    let child = vm.create_table().unwrap();
    let child_ref = child.as_obj().unwrap();
    vm.table_set(owner, LoamValue::Int(1), child).unwrap();
    assert!(!vm.pool.is_black(owner_ref));

    while vm.gc_state() != GcState::Pause {
        vm.single_step().unwrap();
    }
    assert!(vm.pool.contains(child_ref));
    assert_eq!(
        vm.table_get(owner, LoamValue::Int(1)).unwrap().as_obj(),
        Some(child_ref)
    );
}

#[test]
fn test_forward_barrier_marks_the_child() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    run_until_black(&mut vm, owner_ref);

    let child = vm.create_table().unwrap();
    let child_ref = child.as_obj().unwrap();
    vm.pool
        .table_mut(owner_ref)
        .unwrap()
        .raw_set(LoamValue::Int(1), child);
    vm.barrier_forward(owner_ref, child);
    // forward variant marks the child instead of downgrading the owner
    assert!(vm.pool.is_black(owner_ref));
    assert!(!vm.pool.is_white(child_ref));

    while vm.gc_state() != GcState::Pause {
        vm.single_step().unwrap();
    }
    assert!(vm.pool.contains(child_ref));
}

#[test]
fn test_forward_barrier_downgrades_owner_during_sweep() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    // run the cycle to the brink of the sweep: owner is black, whites
    // have flipped
    while vm.gc_state() != GcState::SweepAllGc {
        vm.single_step().unwrap();
    }
    assert!(vm.pool.is_black(owner_ref));

    let child = vm.create_table().unwrap();
    vm.pool
        .table_mut(owner_ref)
        .unwrap()
        .raw_set(LoamValue::Int(1), child);
    vm.barrier_forward(owner_ref, child);
    // during sweep the owner is downgraded so the sweep revisits it
    assert!(vm.pool.is_white(owner_ref));

    while vm.gc_state() != GcState::Pause {
        vm.single_step().unwrap();
    }
    assert!(vm.pool.contains(child.as_obj().unwrap()));
}

#[test]
fn test_barrier_noop_when_owner_not_black() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    let child = vm.create_table().unwrap();
    // between cycles everything is white: the predicate filters the
    // call out and nothing changes color
    assert!(vm.pool.is_white(owner_ref));
    vm.barrier_forward(owner_ref, child);
    assert!(vm.pool.is_white(owner_ref));
    assert!(vm.pool.is_white(child.as_obj().unwrap()));
}

#[test]
fn test_new_objects_need_no_barrier() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let owner = vm.create_table().unwrap();
    vm.set_global("owner", owner).unwrap();
    let owner_ref = owner.as_obj().unwrap();
    run_until_black(&mut vm, owner_ref);
    // a fresh object is born current-white; storing the *owner* into
    // the fresh object needs no barrier in either direction
    let fresh = vm.create_table().unwrap();
    vm.table_set(fresh, LoamValue::Int(1), owner).unwrap();
    vm.set_global("fresh", fresh).unwrap();
    while vm.gc_state() != GcState::Pause {
        vm.single_step().unwrap();
    }
    assert!(vm.pool.contains(fresh.as_obj().unwrap()));
    assert!(vm.pool.contains(owner_ref));
}


