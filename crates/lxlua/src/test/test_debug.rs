// The debug controller: breakpoints, conditions, the step machine,
// tracebacks, hook registration.

use crate::debug as lxdebug;
use crate::lua_value::MultiValue;
use crate::test::helpers::*;
use crate::*;

/// Frontend used by condition tests: compiles any snippet into
/// `return x > 5` against the global `x` (conditions are the only source
/// text the controller ever loads here).
fn condition_frontend(vm: &mut LuaVM, _source: &str, _chunk: &str) -> LuaResult<std::rc::Rc<Proto>> {
    let mut b = ProtoBuilder::new(0, 2).with_env();
    let k_x = b.k_str(vm, "x");
    b.abck(OpCode::GetTabUp, 0, 0, k_x, false); // 0
    b.cmp_imm(OpCode::GtI, 0, 5, true); // 1: x > 5 ?
    b.sj(OpCode::Jmp, 1); // 2 -> 4 (true path)
    b.abc(OpCode::LFalseSkip, 0, 0, 0); // 3
    b.abc(OpCode::LoadTrue, 0, 0, 0); // 4
    b.abc(OpCode::Return1, 0, 0, 0); // 5
    Ok(b.build())
}

/// The looping function from the breakpoint scenario: x walks 1..10, a
/// statement on line 3 runs every iteration.
fn looping_proto(vm: &mut LuaVM) -> std::rc::Rc<Proto> {
    let mut b = ProtoBuilder::new(0, 7).with_env();
    let k_x = b.k_str(vm, "x");
    let k_y = b.k_str(vm, "y");
    b.asbx(OpCode::LoadI, 0, 1); // 0
    b.asbx(OpCode::LoadI, 1, 10); // 1
    b.asbx(OpCode::LoadI, 2, 1); // 2
    b.abx(OpCode::ForPrep, 0, 3); // 3
    b.abck(OpCode::SetTabUp, 0, k_x, 3, false); // 4: x = i      (line 2)
    b.abck(OpCode::GetTabUp, 4, 0, k_x, false); // 5: y = x     (line 3)
    b.abck(OpCode::SetTabUp, 0, k_y, 4, false); // 6:           (line 3)
    b.abx(OpCode::ForLoop, 0, 4); // 7
    b.abc(OpCode::Return0, 0, 0, 0); // 8
    b.lines(&[2, 2, 2, 2, 2, 3, 3, 2, 4]);
    b.source("@test.lua");
    b.build()
}

/// Output callback: append (event, source, line) to the global log table.
fn cf_record_stop(s: &mut LuaState) -> LuaResult<MultiValue> {
    cf_log_args(s)
}

fn read_log_triples(vm: &mut LuaVM) -> Vec<(String, String, i64)> {
    let log = vm.get_global("log");
    let tid = log.as_table_id().unwrap();
    let len = vm.pool.get_table(tid).unwrap().len();
    let mut out = Vec::new();
    let mut i = 1;
    while i + 2 <= len {
        let ev = vm.raw_get_int(tid, i);
        let src = vm.raw_get_int(tid, i + 1);
        let line = vm.raw_get_int(tid, i + 2);
        out.push((
            vm.display_value(&ev),
            vm.display_value(&src),
            line.as_integer().unwrap_or(0),
        ));
        i += 3;
    }
    out
}

#[test]
fn conditional_breakpoint_stops_five_times() {
    let mut vm = new_vm();
    vm.set_frontend(Box::new(condition_frontend));

    let log = vm.alloc_table(32, 0);
    vm.set_global("log", LuaValue::table(log));
    let callback = LuaValue::cfunction(cf_record_stop);
    lxdebug::set_output_callback(&mut vm, callback);

    let record = lxdebug::set_breakpoint(&mut vm, "test.lua", 3, Some("x > 5"));
    assert!(record.is_table());

    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();

    let stops = read_log_triples(&mut vm);
    assert_eq!(stops.len(), 5, "stops: {:?}", stops);
    for (event, source, line) in &stops {
        assert_eq!(event, "breakpoint");
        assert_eq!(source, "test.lua");
        assert_eq!(*line, 3);
    }
}

#[test]
fn unconditional_breakpoint_stops_once_per_hit() {
    let mut vm = new_vm();
    let log = vm.alloc_table(64, 0);
    vm.set_global("log", LuaValue::table(log));
    lxdebug::set_output_callback(&mut vm, LuaValue::cfunction(cf_record_stop));
    lxdebug::set_breakpoint(&mut vm, "test.lua", 3, None);

    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();

    let stops = read_log_triples(&mut vm);
    assert_eq!(stops.len(), 10); // one per loop iteration
}

#[test]
fn breakpoint_management_surface() {
    let mut vm = new_vm();
    lxdebug::set_breakpoint(&mut vm, "a.lua", 10, None);
    lxdebug::set_breakpoint(&mut vm, "b.lua", 20, Some("n == 3"));
    assert_eq!(lxdebug::list_breakpoints(&mut vm).len(), 2);

    // re-setting the same location flags prior existence
    let again = lxdebug::set_breakpoint(&mut vm, "a.lua", 10, None);
    let tid = again.as_table_id().unwrap();
    let k = vm.intern_str("exists");
    assert_eq!(vm.raw_get(tid, &k).as_boolean(), Some(true));

    assert!(lxdebug::enable_breakpoint(&mut vm, "a.lua", 10, false));
    assert!(!lxdebug::enable_breakpoint(&mut vm, "missing.lua", 1, true));

    assert!(lxdebug::remove_breakpoint(&mut vm, "a.lua", 10));
    assert!(!lxdebug::remove_breakpoint(&mut vm, "a.lua", 10));

    assert_eq!(lxdebug::clear_breakpoints(&mut vm), 1);
    assert!(lxdebug::list_breakpoints(&mut vm).is_empty());
}

#[test]
fn disabled_breakpoints_do_not_stop() {
    let mut vm = new_vm();
    let log = vm.alloc_table(8, 0);
    vm.set_global("log", LuaValue::table(log));
    lxdebug::set_output_callback(&mut vm, LuaValue::cfunction(cf_record_stop));
    lxdebug::set_breakpoint(&mut vm, "test.lua", 3, None);
    lxdebug::enable_breakpoint(&mut vm, "test.lua", 3, false);

    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();
    assert!(read_log_triples(&mut vm).is_empty());
}

#[test]
fn step_mode_stops_on_the_next_line() {
    let mut vm = new_vm();
    let log = vm.alloc_table(8, 0);
    vm.set_global("log", LuaValue::table(log));
    lxdebug::set_output_callback(&mut vm, LuaValue::cfunction(cf_record_stop));

    lxdebug::debug_step(&mut vm);
    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();

    let stops = read_log_triples(&mut vm);
    assert_eq!(stops.len(), 1); // step arms a single stop
    assert_eq!(stops[0].0, "step");
}

#[test]
fn continue_clears_the_mode() {
    let mut vm = new_vm();
    let log = vm.alloc_table(8, 0);
    vm.set_global("log", LuaValue::table(log));
    lxdebug::set_output_callback(&mut vm, LuaValue::cfunction(cf_record_stop));

    lxdebug::debug_step(&mut vm);
    lxdebug::debug_continue(&mut vm);
    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();
    assert!(read_log_triples(&mut vm).is_empty());
}

#[test]
fn sethook_relays_line_events() {
    let mut vm = new_vm();
    let log = vm.alloc_table(64, 0);
    vm.set_global("log", LuaValue::table(log));

    lxdebug::sethook(&mut vm, LuaValue::cfunction(cf_log_args), "l", 0);
    let f = {
        let p = looping_proto(&mut vm);
        vm.closure_from_proto(p)
    };
    vm.call_value(f, &[]).unwrap();

    // the hook saw ("line", <line>) pairs; at least lines 2, 3 and 4
    let tid = vm.get_global("log").as_table_id().unwrap();
    let len = vm.pool.get_table(tid).unwrap().len();
    assert!(len >= 6, "hook log too short: {}", len);
    let first = vm.raw_get_int(tid, 1);
    assert_eq!(vm.display_value(&first), "line");
}

#[test]
fn traceback_names_sources_and_lines() {
    let mut vm = new_vm();
    let plain = lxdebug::traceback(&mut vm, Some("boom happened"));
    assert!(plain.starts_with("boom happened"));
    assert!(plain.contains("stack traceback:"));
}

#[test]
fn function_info_reports_shape() {
    let mut vm = new_vm();
    let proto = build_factorial(&mut vm);
    let f = vm.closure_from_proto(proto);
    let info = lxdebug::function_info(&mut vm, &f).unwrap();
    assert_eq!(info.nparams, 1);
    assert_eq!(info.nups, 1);
    assert_eq!(info.what, "main");
    assert!(!info.is_hotfixed);

    let info = lxdebug::function_info(&mut vm, &LuaValue::cfunction(cf_boom)).unwrap();
    assert_eq!(info.what, "C");
}
