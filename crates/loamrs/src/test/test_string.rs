// String interning: identity, resurrection, table sizing, the static
// address cache, and long strings.

use crate::gc::GcState;
use crate::loam_vm::loam_limits::{MAX_SHORT_LEN, MIN_STRTAB_SIZE};
use crate::loam_vm::LoamVm;

#[test]
fn test_intern_identity() {
    let mut vm = LoamVm::new();
    let s1 = vm.create_string("foo").unwrap();
    let s2 = vm.create_string("foo").unwrap();
    assert_eq!(s1.as_obj(), s2.as_obj());
    let s3 = vm.create_string("bar").unwrap();
    assert_ne!(s1.as_obj(), s3.as_obj());
}

#[test]
fn test_intern_stability_across_collection() {
    let mut vm = LoamVm::new();
    let s1 = vm.create_string("foo").unwrap();
    vm.set_global("s", s1).unwrap();
    let s2 = vm.create_string("foo").unwrap();
    assert_eq!(s1.as_obj(), s2.as_obj());
    vm.full_gc(false).unwrap();
    let s3 = vm.create_string("foo").unwrap();
    assert_eq!(s1.as_obj(), s3.as_obj());
    assert_eq!(vm.string_value(s3), Some("foo"));
}

#[test]
fn test_dead_string_resurrected_during_sweep() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let s = vm.create_string("zombie").unwrap();
    let r = s.as_obj().unwrap();
    // run the cycle up to the moment the sweep is about to start: the
    // unrooted string now carries the condemned white
    while vm.gc_state() != GcState::SweepAllGc {
        vm.single_step().unwrap();
    }
    let s2 = vm.create_string("zombie").unwrap();
    // interning found the dead-but-unswept object and revived it
    assert_eq!(s2.as_obj(), Some(r));
    vm.full_gc(false).unwrap();
}

#[test]
fn test_long_strings_are_not_interned() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let long = "x".repeat(MAX_SHORT_LEN + 10);
    let a = vm.create_string(&long).unwrap();
    let b = vm.create_string(&long).unwrap();
    assert_ne!(a.as_obj(), b.as_obj());
    assert_eq!(vm.string_value(a), Some(long.as_str()));
    // content hash is computed lazily and is stable
    let ra = a.as_obj().unwrap();
    let h1 = vm.long_string_hash(ra);
    let h2 = vm.long_string_hash(ra);
    assert_eq!(h1, h2);
    // equal content hashes equal even across objects
    let rb = b.as_obj().unwrap();
    assert_eq!(vm.long_string_hash(rb), h1);
}

#[test]
fn test_string_table_grows_and_shrinks() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    assert_eq!(vm.strings.size(), MIN_STRTAB_SIZE);
    for i in 0..(MIN_STRTAB_SIZE * 2) {
        vm.create_string(&format!("str_{i}")).unwrap();
    }
    assert!(vm.strings.size() > MIN_STRTAB_SIZE);
    assert!(vm.strings.size().is_power_of_two());
    // drop everything; repeated cycles shrink the table back down
    for _ in 0..4 {
        vm.full_gc(false).unwrap();
    }
    assert_eq!(vm.strings.size(), MIN_STRTAB_SIZE);
}

#[test]
fn test_nuse_tracks_interned_strings() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let base = vm.strings.nuse();
    for i in 0..10 {
        vm.create_string(&format!("n_{i}")).unwrap();
    }
    assert_eq!(vm.strings.nuse(), base + 10);
    // re-interning does not grow the table
    for i in 0..10 {
        vm.create_string(&format!("n_{i}")).unwrap();
    }
    assert_eq!(vm.strings.nuse(), base + 10);
    vm.full_gc(false).unwrap();
    assert_eq!(vm.strings.nuse(), base);
}

#[test]
fn test_static_intern_cache_hits_by_address() {
    let mut vm = LoamVm::new();
    static LIT: &str = "a-static-literal";
    let a = vm.intern_static(LIT).unwrap();
    let b = vm.intern_static(LIT).unwrap();
    assert_eq!(a.as_obj(), b.as_obj());
    // and it agrees with plain interning
    let c = vm.create_string(LIT).unwrap();
    assert_eq!(a.as_obj(), c.as_obj());
}

#[test]
fn test_static_cache_entries_stay_live_across_collection() {
    let mut vm = LoamVm::new();
    static LIT: &str = "cached-but-unrooted";
    vm.intern_static(LIT).unwrap();
    // nothing roots the string, so the atomic phase evicts the cache
    // entry; a later lookup must re-intern, not touch a dead object
    vm.full_gc(false).unwrap();
    vm.full_gc(false).unwrap();
    let again = vm.intern_static(LIT).unwrap();
    assert_eq!(vm.string_value(again), Some(LIT));
}

#[test]
fn test_distinct_contents_never_collide() {
    let mut vm = LoamVm::new();
    vm.gc_stop();
    let mut refs = Vec::new();
    let names: Vec<String> = (0..200).map(|i| format!("k{i}")).collect();
    for n in &names {
        refs.push(vm.create_string(n).unwrap().as_obj().unwrap());
    }
    for (i, n) in names.iter().enumerate() {
        assert_eq!(vm.pool.str_data(refs[i]), Some(n.as_str()));
        for j in (i + 1)..names.len() {
            assert_ne!(refs[i], refs[j]);
        }
    }
}

#[test]
fn test_fixed_strings_survive_everything() {
    let mut vm = LoamVm::new();
    for _ in 0..3 {
        vm.full_gc(false).unwrap();
    }
    assert_eq!(vm.pool.str_data(vm.memerr_str), Some("not enough memory"));
    let mode = vm.create_string("__mode").unwrap();
    assert_eq!(mode.as_obj(), vm.tm_mode.as_obj());
}


