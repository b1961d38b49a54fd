// Hot-patch and function sleep/wake.

use crate::test::helpers::*;
use crate::*;

/// Closure with one upvalue `n`: increments and returns it.
fn counter_proto() -> std::rc::Rc<Proto> {
    let mut b = ProtoBuilder::new(0, 2).upvalue("n", false, 0);
    b.abc(OpCode::GetUpval, 0, 0, 0);
    b.abck(OpCode::AddI, 0, 0, 1 + 128, false);
    b.abc(OpCode::SetUpval, 0, 0, 0);
    b.abc(OpCode::Return1, 0, 0, 0);
    b.build()
}

/// Replacement body: increments n, returns n * 10.
fn counter_times_ten_proto() -> std::rc::Rc<Proto> {
    let mut b = ProtoBuilder::new(0, 3).upvalue("n", false, 0);
    b.abc(OpCode::GetUpval, 0, 0, 0);
    b.abck(OpCode::AddI, 0, 0, 1 + 128, false);
    b.abc(OpCode::SetUpval, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 10);
    b.abc(OpCode::Mul, 0, 0, 1);
    b.abc(OpCode::Return1, 0, 0, 0);
    b.build()
}

fn make_counter(vm: &mut LuaVM) -> LuaValue {
    let uv = vm.alloc_upvalue(crate::gc::UpvalueState::Closed(LuaValue::integer(0)));
    let fid = vm.alloc_lua_closure(counter_proto(), vec![uv]);
    vm.closure_value(fid)
}

#[test]
fn hotreplace_keeps_upvalues() {
    let mut vm = new_vm();
    let counter = make_counter(&mut vm);

    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(1));
    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(2));

    vm.hotreplace(counter, counter_times_ten_proto()).unwrap();
    assert!(vm.is_hotfixed(&counter));

    // new body, same upvalue: n goes 2 -> 3, result 30
    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(30));
}

#[test]
fn hotfix_by_global_name_returns_rollback() {
    let mut vm = new_vm();
    let counter = make_counter(&mut vm);
    vm.set_global("tick", counter);
    vm.call_value(counter, &[]).unwrap(); // n = 1

    let uv = vm.alloc_upvalue(crate::gc::UpvalueState::Closed(LuaValue::integer(0)));
    let new_fid = vm.alloc_lua_closure(counter_times_ten_proto(), vec![uv]);
    let new_fn = vm.closure_value(new_fid);

    let name = vm.intern_str("tick");
    let rollback = vm.hotfix(name, new_fn).unwrap();

    // the installed global now runs the new body over the old upvalue
    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(20)); // n: 1 -> 2, * 10

    // the rollback closure carries the displaced body and the same state
    let r = vm.call_value(rollback, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(3));
}

#[test]
fn hotfix_validates_upvalue_counts() {
    let mut vm = new_vm();
    let counter = make_counter(&mut vm);

    // replacement with zero upvalues must be rejected
    let mut b = ProtoBuilder::new(0, 2);
    b.asbx(OpCode::LoadI, 0, 1);
    b.abc(OpCode::Return1, 0, 0, 0);
    let plain = vm.closure_from_proto(b.build());

    let err = vm.hotfix(counter, plain).unwrap_err();
    assert_eq!(err, LuaError::InvalidOperand);
    assert!(vm.error_message().contains("upvalue count"));
}

#[test]
fn hotfix_requires_lua_functions() {
    let mut vm = new_vm();
    let c = LuaValue::cfunction(cf_boom);
    let counter = make_counter(&mut vm);
    let err = vm.hotfix(c, counter).unwrap_err();
    assert_eq!(err, LuaError::TypeError);
}

#[test]
fn sleeping_functions_queue_calls() {
    let mut vm = new_vm();
    // body: log(arg); return arg
    vm.set_global("append", LuaValue::cfunction(cf_log_args));
    let log = vm.alloc_table(8, 0);
    vm.set_global("log", LuaValue::table(log));

    let mut b = ProtoBuilder::new(1, 4).with_env();
    let k_append = b.k_str(&mut vm, "append");
    b.abck(OpCode::GetTabUp, 1, 0, k_append, false);
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 1, 2, 1);
    b.abc(OpCode::Return1, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());

    vm.function_sleep(f).unwrap();

    // calls while sleeping return the suspended marker and run nothing
    let r = vm.call_value(f, &[LuaValue::integer(1)]).unwrap();
    assert!(is_suspended_marker(&r.first()));
    let r = vm.call_value(f, &[LuaValue::integer(2)]).unwrap();
    assert!(is_suspended_marker(&r.first()));
    assert_eq!(vm.queued_call_count(&f), 2);
    assert_eq!(vm.pool.get_table(log).unwrap().len(), 0);

    // wake replays in insertion order
    let replayed = vm.function_wake(f).unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(vm.raw_get_int(log, 1).as_integer(), Some(1));
    assert_eq!(vm.raw_get_int(log, 2).as_integer(), Some(2));
    assert_eq!(vm.queued_call_count(&f), 0);

    // awake again: calls run immediately
    let r = vm.call_value(f, &[LuaValue::integer(3)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(3));
}

#[test]
fn sleeping_mark_shows_in_the_value_tag() {
    let mut vm = new_vm();
    let counter = make_counter(&mut vm);
    vm.function_sleep(counter).unwrap();

    let fid = counter.as_function_id().unwrap();
    let v = vm.closure_value(fid);
    assert!(v.is_sleeping_mark());

    vm.function_wake(counter).unwrap();
    let v = vm.closure_value(fid);
    assert!(!v.is_sleeping_mark());

    vm.hotreplace(counter, counter_times_ten_proto()).unwrap();
    let v = vm.closure_value(fid);
    assert!(v.is_hotfixed());
}
