// To-be-closed semantics: LIFO close order, error propagation into
// __close, close on thread reset.

use crate::lua_value::MultiValue;
use crate::lua_vm::TmKind;
use crate::test::helpers::*;
use crate::*;

/// __close handler: appends the closed value's "name" field and whether an
/// error object was passed, into the global "log" table.
fn cf_close_logger(s: &mut LuaState) -> LuaResult<MultiValue> {
    let obj = s.cf_arg(0);
    let err = s.cf_arg(1);
    let vm = s.vm();
    let name = if let Some(tid) = obj.as_table_id() {
        let key = vm.intern_str("name");
        vm.raw_get(tid, &key)
    } else {
        LuaValue::nil()
    };
    let log = vm.get_global("log");
    if let Some(tid) = log.as_table_id() {
        let len = vm.pool.get_table(tid).map(|t| t.len()).unwrap_or(0);
        vm.raw_set_int(tid, len + 1, name);
        vm.raw_set_int(tid, len + 2, LuaValue::boolean(!err.is_nil()));
    }
    Ok(MultiValue::empty())
}

fn make_closable(vm: &mut LuaVM, mt: crate::gc::TableId, name: &str) -> LuaValue {
    let t = vm.alloc_table(0, 1);
    let key = vm.intern_str("name");
    let val = vm.intern_str(name);
    vm.raw_set(t, key, val).unwrap();
    vm.pool.get_table_mut(t).unwrap().set_metatable(Some(mt));
    LuaValue::table(t)
}

fn setup(vm: &mut LuaVM) {
    let mt = vm.alloc_table(0, 1);
    let close_key = LuaValue::string(vm.tm_name(TmKind::Close), false);
    vm.raw_set(mt, close_key, LuaValue::cfunction(cf_close_logger))
        .unwrap();

    for name in ["A", "B", "C"] {
        let v = make_closable(vm, mt, name);
        vm.set_global(name, v);
    }
    let log = vm.alloc_table(8, 0);
    vm.set_global("log", LuaValue::table(log));
    vm.set_global("boom", LuaValue::cfunction(cf_boom));
}

fn read_log(vm: &mut LuaVM) -> Vec<String> {
    let log = vm.get_global("log");
    let tid = log.as_table_id().unwrap();
    let len = vm.pool.get_table(tid).unwrap().len();
    (1..=len)
        .map(|i| {
            let v = vm.raw_get_int(tid, i);
            vm.display_value(&v)
        })
        .collect()
}

/// Three TBC slots, an error mid-block: __close runs C, B, A, each seeing
/// the error object.
#[test]
fn close_order_is_lifo_on_error() {
    let mut vm = new_vm();
    setup(&mut vm);

    let mut b = ProtoBuilder::new(0, 6).with_env();
    let (ka, kb, kc) = (
        b.k_str(&mut vm, "A"),
        b.k_str(&mut vm, "B"),
        b.k_str(&mut vm, "C"),
    );
    let k_boom = b.k_str(&mut vm, "boom");
    b.abck(OpCode::GetTabUp, 0, 0, ka, false);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.abck(OpCode::GetTabUp, 1, 0, kb, false);
    b.abc(OpCode::Tbc, 1, 0, 0);
    b.abck(OpCode::GetTabUp, 2, 0, kc, false);
    b.abc(OpCode::Tbc, 2, 0, 0);
    b.abck(OpCode::GetTabUp, 3, 0, k_boom, false);
    b.abc(OpCode::Call, 3, 1, 1);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());

    let err = vm.pcall_value(f, &[]).unwrap_err();
    assert_eq!(err, LuaError::UserError);

    let log = read_log(&mut vm);
    assert_eq!(
        log,
        vec!["C", "true", "B", "true", "A", "true"]
    );
}

/// Same block without the error: still LIFO, no error object.
#[test]
fn close_order_is_lifo_on_normal_exit() {
    let mut vm = new_vm();
    setup(&mut vm);

    let mut b = ProtoBuilder::new(0, 6).with_env();
    let (ka, kb) = (b.k_str(&mut vm, "A"), b.k_str(&mut vm, "B"));
    b.abck(OpCode::GetTabUp, 0, 0, ka, false);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.abck(OpCode::GetTabUp, 1, 0, kb, false);
    b.abc(OpCode::Tbc, 1, 0, 0);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    vm.call_value(f, &[]).unwrap();

    let log = read_log(&mut vm);
    assert_eq!(log, vec!["B", "false", "A", "false"]);
}

/// Marking a non-closable, non-false value raises immediately.
#[test]
fn tbc_requires_a_close_metamethod() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 3);
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let err = vm.pcall_value(f, &[]).unwrap_err();
    assert_eq!(err, LuaError::TypeError);
    assert!(vm.error_message().contains("__close"));
}

/// closethread runs pending closes with an error status and kills the
/// coroutine.
#[test]
fn close_thread_drains_tbc_with_error_status() {
    let mut vm = new_vm();
    setup(&mut vm);

    // body: mark A as TBC, then yield forever
    let mut b = ProtoBuilder::new(0, 4).with_env();
    let ka = b.k_str(&mut vm, "A");
    let k_yield = b.k_str(&mut vm, "yield");
    b.abck(OpCode::GetTabUp, 0, 0, ka, false);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.abck(OpCode::GetTabUp, 1, 0, k_yield, false);
    b.abc(OpCode::Call, 1, 1, 1);
    b.abc(OpCode::Return0, 0, 0, 0);
    vm.set_global("yield", LuaValue::cfunction(cf_yield));
    let f = vm.closure_from_proto(b.build());

    let co = vm.new_thread(f).unwrap();
    match vm.resume(co, &[]).unwrap() {
        ResumeResult::Yielded(_) => {}
        other => panic!("expected a yield, got {:?}", other),
    }

    vm.close_thread(co).unwrap();
    assert_eq!(vm.thread_status(&co), Some(ThreadStatus::Dead));

    let log = read_log(&mut vm);
    assert_eq!(log, vec!["A", "true"]);
}
