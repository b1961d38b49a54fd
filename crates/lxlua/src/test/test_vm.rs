// Interpreter behavior: calls, loops, arithmetic semantics, error kinds.

use crate::lua_vm::execute::arith::{int_idiv, int_mod, int_shl, int_shr};
use crate::test::helpers::*;
use crate::*;

#[test]
fn factorial_by_recursion() {
    let mut vm = new_vm();
    let proto = build_factorial(&mut vm);
    let f = vm.closure_from_proto(proto);
    vm.set_global("fact", f);
    let result = vm.call_value(f, &[LuaValue::integer(10)]).unwrap();
    assert_eq!(result.first().as_integer(), Some(3628800));
}

#[test]
fn numeric_for_loop_sums() {
    let mut vm = new_vm();
    // sum = 0; for i = 1, 10 do sum = sum + i end; return sum
    let mut b = ProtoBuilder::new(0, 6);
    b.asbx(OpCode::LoadI, 4, 0); // 0: sum (kept above the loop regs)
    b.asbx(OpCode::LoadI, 0, 1); // 1
    b.asbx(OpCode::LoadI, 1, 10); // 2
    b.asbx(OpCode::LoadI, 2, 1); // 3
    b.abx(OpCode::ForPrep, 0, 1); // 4: body is one instruction
    b.abc(OpCode::Add, 4, 4, 3); // 5: sum += i
    b.abx(OpCode::ForLoop, 0, 2); // 6
    b.abc(OpCode::Return1, 4, 0, 0); // 7
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(55));
}

#[test]
fn for_loop_zero_step_raises() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 5);
    b.asbx(OpCode::LoadI, 0, 1);
    b.asbx(OpCode::LoadI, 1, 10);
    b.asbx(OpCode::LoadI, 2, 0); // step 0
    b.abx(OpCode::ForPrep, 0, 0);
    b.abx(OpCode::ForLoop, 0, 1);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let err = vm.pcall_value(f, &[]).unwrap_err();
    assert_eq!(err, LuaError::InvalidOperand);
}

#[test]
fn integer_arithmetic_wraps() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(1, 3);
    b.abck(OpCode::AddI, 0, 0, 1 + 128, false); // R0 = n + 1
    b.abc(OpCode::Return1, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[LuaValue::integer(i64::MAX)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(i64::MIN));
}

#[test]
fn division_semantics() {
    let mut vm = new_vm();
    // integer / integer is float
    let mut b = ProtoBuilder::new(2, 4);
    b.abc(OpCode::Div, 2, 0, 1);
    b.abc(OpCode::Return1, 2, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm
        .call_value(f, &[LuaValue::integer(7), LuaValue::integer(2)])
        .unwrap();
    assert_eq!(r.first().as_float(), Some(3.5));

    // integer // 0 raises; float / 0 is infinite
    let mut b = ProtoBuilder::new(2, 4);
    b.abc(OpCode::IDiv, 2, 0, 1);
    b.abc(OpCode::Return1, 2, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let err = vm
        .pcall_value(f, &[LuaValue::integer(1), LuaValue::integer(0)])
        .unwrap_err();
    assert_eq!(err, LuaError::ArithmeticError);

    let mut b = ProtoBuilder::new(2, 4);
    b.abc(OpCode::Div, 2, 0, 1);
    b.abc(OpCode::Return1, 2, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm
        .call_value(f, &[LuaValue::float(1.0), LuaValue::float(0.0)])
        .unwrap();
    assert_eq!(r.first().as_float(), Some(f64::INFINITY));
}

#[test]
fn floor_division_and_modulus_signs() {
    assert_eq!(int_idiv(7, 2), 3);
    assert_eq!(int_idiv(-7, 2), -4);
    assert_eq!(int_idiv(7, -2), -4);
    assert_eq!(int_mod(7, 3), 1);
    assert_eq!(int_mod(-7, 3), 2); // takes the divisor's sign
    assert_eq!(int_mod(7, -3), -2);
}

#[test]
fn shift_boundaries() {
    assert_eq!(int_shl(1, 63), i64::MIN);
    assert_eq!(int_shl(1, 64), 0);
    assert_eq!(int_shr(-1, 64), 0); // logical right zero-fills
    assert_eq!(int_shr(-1, 1), i64::MAX);
    assert_eq!(int_shl(8, -2), 2); // negative count reverses direction
    assert_eq!(int_shr(2, -2), 8);
}

#[test]
fn concat_folds_right_to_left() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 4);
    let k_a = b.k_str(&mut vm, "a=");
    b.abx(OpCode::LoadK, 0, k_a);
    b.asbx(OpCode::LoadI, 1, 42);
    b.abc(OpCode::Concat, 0, 2, 0);
    b.abc(OpCode::Return1, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[]).unwrap();
    let bytes = vm.value_str(&r.first()).unwrap().to_vec();
    assert_eq!(bytes, b"a=42");
}

#[test]
fn calling_a_non_function_is_a_type_error() {
    let mut vm = new_vm();
    let err = vm
        .pcall_value(LuaValue::integer(3), &[])
        .unwrap_err();
    assert_eq!(err, LuaError::TypeError);
    assert!(vm.error_message().contains("attempt to call"));
}

#[test]
fn runaway_recursion_overflows() {
    let mut opts = VmOptions::default();
    opts.max_call_depth = 40;
    let mut vm = LuaVM::new(opts);
    // f(n) = f(n) forever
    let mut b = ProtoBuilder::new(0, 3).with_env();
    let k_f = b.k_str(&mut vm, "f");
    b.abck(OpCode::GetTabUp, 0, 0, k_f, false);
    b.abc(OpCode::Call, 0, 1, 1);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    vm.set_global("f", f);
    let err = vm.pcall_value(f, &[]).unwrap_err();
    assert_eq!(err, LuaError::StackOverflow);
}

#[test]
fn tail_call_reuses_the_frame() {
    let mut opts = VmOptions::default();
    opts.max_call_depth = 30;
    let mut vm = LuaVM::new(opts);
    // g(n): if n == 0 then return 99 end; return g(n - 1)  -- as a tail call
    let mut b = ProtoBuilder::new(1, 4).with_env();
    let k_g = b.k_str(&mut vm, "g");
    b.cmp_imm(OpCode::EqI, 0, 0, true); // 0: n == 0 ?
    b.sj(OpCode::Jmp, 4); // 1 -> 6 (return 99)
    b.abck(OpCode::GetTabUp, 1, 0, k_g, false); // 2
    b.abck(OpCode::AddI, 2, 0, 127, false); // 3
    b.abc(OpCode::TailCall, 1, 2, 0); // 4
    b.abc(OpCode::Return0, 0, 0, 0); // 5 (unreachable)
    b.asbx(OpCode::LoadI, 1, 99); // 6
    b.abc(OpCode::Return1, 1, 0, 0); // 7
    let f = vm.closure_from_proto(b.build());
    vm.set_global("g", f);
    // depth 500 with a call-depth cap of 30 only works if frames are reused
    let r = vm.call_value(f, &[LuaValue::integer(500)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(99));
}

#[test]
fn varargs_collect_and_spread() {
    let mut vm = new_vm();
    // function(...) local a, b = ...; return a + b end
    let mut b = ProtoBuilder::new(0, 5).vararg();
    b.abc(OpCode::VarargPrep, 0, 0, 0); // 0
    b.abc(OpCode::Vararg, 0, 0, 3); // 1: R0, R1 = ...
    b.abc(OpCode::Add, 2, 0, 1); // 2
    b.abc(OpCode::Return1, 2, 0, 0); // 3
    let f = vm.closure_from_proto(b.build());
    let r = vm
        .call_value(f, &[LuaValue::integer(30), LuaValue::integer(12)])
        .unwrap();
    assert_eq!(r.first().as_integer(), Some(42));
}

#[test]
fn test_and_jump_opcodes() {
    let mut vm = new_vm();
    // return (a and 1) or 2   -- via TEST
    let mut b = ProtoBuilder::new(1, 3);
    b.abck(OpCode::Test, 0, 0, 0, true); // if truthy(R0) != true -> skip jmp
    b.sj(OpCode::Jmp, 2); // -> load 1
    b.asbx(OpCode::LoadI, 1, 2);
    b.abc(OpCode::Return1, 1, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.abc(OpCode::Return1, 1, 0, 0);
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[LuaValue::boolean(true)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(1));
    let r = vm.call_value(f, &[LuaValue::nil()]).unwrap();
    assert_eq!(r.first().as_integer(), Some(2));
}

#[test]
fn library_registry_installs_native_tables() {
    use crate::lib_registry::{LibEntry, LibraryRegistry};
    use crate::lua_value::MultiValue;

    fn cf_forty_two(_s: &mut LuaState) -> LuaResult<MultiValue> {
        Ok(MultiValue::single(LuaValue::integer(42)))
    }

    let mut vm = new_vm();
    let mut reg = LibraryRegistry::new();
    reg.add("answers", vec![LibEntry { name: "ultimate", func: cf_forty_two }]);
    reg.add("", vec![LibEntry { name: "direct", func: cf_forty_two }]);
    reg.install(&mut vm);

    let lib = vm.get_global("answers");
    let tid = lib.as_table_id().unwrap();
    let key = vm.intern_str("ultimate");
    let f = vm.raw_get(tid, &key);
    assert!(f.is_function());
    let r = vm.call_value(f, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(42));

    let f = vm.get_global("direct");
    assert!(f.is_cfunction());
}

#[test]
fn multiple_results_spread_into_caller() {
    let mut vm = new_vm();
    // callee: return 1, 2, 3
    let mut callee = ProtoBuilder::new(0, 4);
    callee.asbx(OpCode::LoadI, 0, 1);
    callee.asbx(OpCode::LoadI, 1, 2);
    callee.asbx(OpCode::LoadI, 2, 3);
    callee.abc(OpCode::Return, 0, 4, 0);
    let callee = callee.build();

    // caller: return f()  -- all results
    let mut b = ProtoBuilder::new(0, 3).with_env();
    let k_f = b.k_str(&mut vm, "three");
    b.abck(OpCode::GetTabUp, 0, 0, k_f, false);
    b.abc(OpCode::Call, 0, 1, 0); // MULTRET
    b.abc(OpCode::Return, 0, 0, 0); // return everything up to top
    let f = vm.closure_from_proto(b.build());
    let g = vm.closure_from_proto(callee);
    vm.set_global("three", g);
    let r = vm.call_value(f, &[]).unwrap();
    assert_eq!(ints(&r), vec![1, 2, 3]);
}
