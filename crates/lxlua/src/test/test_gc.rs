// Collector behavior: reclamation, reachability, weak tables, finalizers,
// mode switching, the parameter surface.

use crate::gc::{GcKind, PAUSE};
use crate::lua_value::MultiValue;
use crate::lua_vm::TmKind;
use crate::test::helpers::*;
use crate::*;

#[test]
fn unreachable_tables_are_collected() {
    let mut vm = new_vm();
    let live = vm.alloc_table(0, 0);
    vm.set_global("keep", LuaValue::table(live));

    let before = vm.pool.tables.len();
    for _ in 0..100 {
        vm.alloc_table(4, 0); // dropped on the floor
    }
    assert!(vm.pool.tables.len() >= before + 100);

    vm.gc_collect();
    let after = vm.pool.tables.len();
    assert!(after < before + 100, "garbage survived: {} tables", after);

    // the rooted table is still there
    assert!(vm.pool.get_table(live).is_some());
    assert_eq!(vm.get_global("keep").as_table_id(), Some(live));
}

#[test]
fn reachable_graphs_survive_through_references() {
    let mut vm = new_vm();
    let outer = vm.alloc_table(0, 1);
    let inner = vm.alloc_table(0, 1);
    let key = vm.intern_str("inner");
    vm.raw_set(outer, key, LuaValue::table(inner)).unwrap();
    vm.set_global("root", LuaValue::table(outer));

    vm.gc_collect();
    vm.gc_collect();

    assert!(vm.pool.get_table(inner).is_some());
    let got = vm.raw_get(outer, &key);
    assert_eq!(got.as_table_id(), Some(inner));
}

#[test]
fn cycles_are_collected() {
    let mut vm = new_vm();
    let before = vm.pool.tables.len();
    {
        let a = vm.alloc_table(0, 1);
        let b = vm.alloc_table(0, 1);
        let ka = vm.intern_str("next");
        vm.raw_set(a, ka, LuaValue::table(b)).unwrap();
        vm.raw_set(b, ka, LuaValue::table(a)).unwrap();
        // no roots reference the pair
    }
    vm.gc_collect();
    assert_eq!(vm.pool.tables.len(), before);
}

#[test]
fn weak_values_drop_dead_entries() {
    let mut vm = new_vm();

    let mt = vm.alloc_table(0, 1);
    let mode_key = LuaValue::string(vm.tm_name(TmKind::Mode), false);
    let mode_v = vm.intern_str("v");
    vm.raw_set(mt, mode_key, mode_v).unwrap();

    let cache = vm.alloc_table(0, 2);
    vm.pool.get_table_mut(cache).unwrap().set_metatable(Some(mt));
    vm.set_global("cache", LuaValue::table(cache));

    // one strong entry, one garbage entry
    let strong = vm.alloc_table(0, 0);
    vm.set_global("strong", LuaValue::table(strong));
    let weak_only = vm.alloc_table(0, 0);
    vm.raw_set_int(cache, 1, LuaValue::table(strong));
    vm.raw_set_int(cache, 2, LuaValue::table(weak_only));

    vm.gc_collect();

    assert!(!vm.raw_get_int(cache, 1).is_nil());
    assert!(vm.raw_get_int(cache, 2).is_nil(), "weak value survived");
}

#[test]
fn finalizers_run_once_with_resurrection() {
    let mut vm = new_vm();

    fn cf_finalizer(s: &mut LuaState) -> LuaResult<MultiValue> {
        let vm = s.vm();
        let n = vm.get_global("finalized").as_integer().unwrap_or(0);
        vm.set_global("finalized", LuaValue::integer(n + 1));
        Ok(MultiValue::empty())
    }

    let mt = vm.alloc_table(0, 1);
    let gc_key = LuaValue::string(vm.tm_name(TmKind::Gc), false);
    vm.raw_set(mt, gc_key, LuaValue::cfunction(cf_finalizer)).unwrap();
    vm.set_global("mt", LuaValue::table(mt));

    {
        let doomed = vm.alloc_table(0, 0);
        vm.pool.get_table_mut(doomed).unwrap().set_metatable(Some(mt));
    }

    vm.gc_collect(); // queues + runs the finalizer
    assert_eq!(vm.get_global("finalized").as_integer(), Some(1));

    vm.gc_collect(); // the object dies for real, no second run
    vm.gc_collect();
    assert_eq!(vm.get_global("finalized").as_integer(), Some(1));
}

#[test]
fn gc_control_surface() {
    let mut vm = new_vm();
    vm.gc_stop();
    assert!(!vm.gc.is_running());
    vm.gc_restart();
    assert!(vm.gc.is_running());

    let count_before = vm.gc_count();
    vm.intern_str("some freshly allocated string for accounting");
    assert!(vm.gc_count() >= count_before);

    let old = vm.gc_set_param(PAUSE, 150);
    assert_eq!(vm.gc_set_param(PAUSE, old), 150);

    // stepping in small increments must terminate a cycle eventually
    vm.gc_set_kind(GcKind::Inc);
    for _ in 0..64 {
        vm.gc_step(1);
    }
}

#[test]
fn generational_mode_switches_at_runtime() {
    let mut vm = new_vm();
    vm.gc_set_kind(GcKind::Inc);
    for _ in 0..10 {
        vm.alloc_table(0, 0);
    }
    vm.gc_collect();
    vm.gc_set_kind(GcKind::GenMinor);
    for _ in 0..10 {
        vm.alloc_table(0, 0);
    }
    vm.gc_step(0);
    vm.gc_collect();
}

#[test]
fn open_upvalue_list_stays_ordered_and_unique() {
    let mut vm = new_vm();
    let s = vm.main_state();
    s.set(0, LuaValue::integer(1));
    s.set(1, LuaValue::integer(2));
    s.set(2, LuaValue::integer(3));
    s.set_top(3);

    let u2 = s.find_upvalue(2);
    let u0 = s.find_upvalue(0);
    let u1 = s.find_upvalue(1);
    // same level twice yields the same upvalue
    assert_eq!(s.find_upvalue(1), u1);

    let levels: Vec<usize> = s.open_upvalue_levels().iter().map(|&(l, _)| l).collect();
    assert_eq!(levels, vec![2, 1, 0]); // descending

    // closing at level 1 converts the top two, leaves level 0 open
    s.close_upvalues(1);
    let levels: Vec<usize> = s.open_upvalue_levels().iter().map(|&(l, _)| l).collect();
    assert_eq!(levels, vec![0]);

    let closed = s.vm().pool.get_upvalue(u1).unwrap().closed_value();
    assert_eq!(closed.and_then(|v| v.as_integer()), Some(2));
    let closed = s.vm().pool.get_upvalue(u2).unwrap().closed_value();
    assert_eq!(closed.and_then(|v| v.as_integer()), Some(3));
    assert!(s.vm().pool.get_upvalue(u0).unwrap().is_open());
}

#[test]
fn collection_during_execution_keeps_stack_roots() {
    let mut vm = new_vm();
    // build garbage in a loop while keeping a live accumulator table
    // t = {}; for i = 1, 200 do t[i] = i end; return t[200]
    let mut b = ProtoBuilder::new(0, 8);
    b.abc(OpCode::NewTable, 4, 0, 0); // R4 = {}
    b.asbx(OpCode::LoadI, 0, 1);
    b.asbx(OpCode::LoadI, 1, 200);
    b.asbx(OpCode::LoadI, 2, 1);
    b.abx(OpCode::ForPrep, 0, 2);
    b.abc(OpCode::NewTable, 5, 0, 0); // garbage every iteration
    b.abck(OpCode::SetTable, 4, 3, 3, false); // t[i] = i
    b.abx(OpCode::ForLoop, 0, 3);
    b.abck(OpCode::GetI, 5, 4, 200, false);
    b.abc(OpCode::Return1, 5, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(200));
}
