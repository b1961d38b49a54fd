// The class / concept / namespace family and the extra operators.

use crate::lua_value::MultiValue;
use crate::lua_vm::execute::{class_ops, compare};
use crate::test::helpers::*;
use crate::*;

fn cf_point_init(s: &mut LuaState) -> LuaResult<MultiValue> {
    let obj = s.cf_arg(0);
    let x = s.cf_arg(1);
    let y = s.cf_arg(2);
    let vm = s.vm();
    if let Some(tid) = obj.as_table_id() {
        let kx = vm.intern_str("x");
        let ky = vm.intern_str("y");
        vm.raw_set(tid, kx, x)?;
        vm.raw_set(tid, ky, y)?;
    }
    Ok(MultiValue::empty())
}

fn cf_point_sum(s: &mut LuaState) -> LuaResult<MultiValue> {
    let obj = s.cf_arg(0);
    let vm = s.vm();
    let tid = obj.as_table_id().unwrap();
    let kx = vm.intern_str("x");
    let ky = vm.intern_str("y");
    let x = vm.raw_get(tid, &kx).as_integer().unwrap_or(0);
    let y = vm.raw_get(tid, &ky).as_integer().unwrap_or(0);
    Ok(MultiValue::single(LuaValue::integer(x + y)))
}

fn make_point_class(vm: &mut LuaVM) -> LuaValue {
    let s = vm.main_state();
    let name = s.vm().intern_str("Point");
    let class = class_ops::new_class(s, name).unwrap();
    let init_name = s.vm().intern_str("__init__");
    class_ops::set_method(s, class, init_name, LuaValue::cfunction(cf_point_init)).unwrap();
    let sum_name = s.vm().intern_str("sum");
    class_ops::set_method(s, class, sum_name, LuaValue::cfunction(cf_point_sum)).unwrap();
    class
}

#[test]
fn new_obj_runs_the_initializer() {
    let mut vm = new_vm();
    let class = make_point_class(&mut vm);
    let s = vm.main_state();
    let obj = class_ops::new_obj(s, class, &[LuaValue::integer(3), LuaValue::integer(4)]).unwrap();

    // fields written by __init__
    let name = s.vm().intern_str("x");
    let got = class_ops::get_prop(s, obj, name).unwrap();
    assert_eq!(got.as_integer(), Some(3));

    // methods resolve through the metatable chain
    let sum_name = s.vm().intern_str("sum");
    let sum = class_ops::get_prop(s, obj, sum_name).unwrap();
    assert!(sum.is_function());
    let r = s.vm().call_value(sum, &[obj]).unwrap();
    assert_eq!(r.first().as_integer(), Some(7));
}

#[test]
fn inheritance_and_instanceof() {
    let mut vm = new_vm();
    let base = make_point_class(&mut vm);
    let s = vm.main_state();

    let name = s.vm().intern_str("Point3");
    let derived = class_ops::new_class(s, name).unwrap();
    class_ops::inherit(s, derived, base).unwrap();

    let obj = class_ops::new_obj(s, derived, &[LuaValue::integer(1), LuaValue::integer(2)]).unwrap();

    // inherited method through the parent's method table
    let sum_name = s.vm().intern_str("sum");
    let sum = class_ops::get_prop(s, obj, sum_name).unwrap();
    assert!(sum.is_function());

    assert!(class_ops::instance_of(s, &obj, &derived).unwrap());
    assert!(class_ops::instance_of(s, &obj, &base).unwrap());

    let other_name = s.vm().intern_str("Other");
    let other = class_ops::new_class(s, other_name).unwrap();
    assert!(!class_ops::instance_of(s, &obj, &other).unwrap());

    // GETSUPER walks one level above the receiver's class
    let sup = class_ops::get_super(s, &obj).unwrap();
    assert_eq!(sup.as_table_id(), base.as_table_id());
}

#[test]
fn statics_live_on_the_class() {
    let mut vm = new_vm();
    let class = make_point_class(&mut vm);
    let s = vm.main_state();
    let name = s.vm().intern_str("origin_count");
    class_ops::set_static(s, class, name, LuaValue::integer(9)).unwrap();
    let got = class_ops::get_prop(s, class, name).unwrap();
    assert_eq!(got.as_integer(), Some(9));
}

#[test]
fn concepts_enforce_required_methods() {
    let mut vm = new_vm();
    let class = make_point_class(&mut vm);
    let s = vm.main_state();

    let cname = s.vm().intern_str("Summable");
    let concept = class_ops::new_concept(s, cname).unwrap();
    let req = s.vm().intern_str("sum");
    class_ops::set_method(s, concept, req, LuaValue::boolean(true)).unwrap();

    // Point has `sum`: implement succeeds
    class_ops::implement(s, class, concept).unwrap();

    // a concept demanding something missing is rejected
    let cname = s.vm().intern_str("Renderable");
    let concept2 = class_ops::new_concept(s, cname).unwrap();
    let req = s.vm().intern_str("render");
    class_ops::set_method(s, concept2, req, LuaValue::boolean(true)).unwrap();
    let err = class_ops::implement(s, class, concept2).unwrap_err();
    assert_eq!(err, LuaError::TypeError);
    assert!(s.vm().error_message().contains("render"));
}

#[test]
fn namespaces_link_by_name() {
    let mut vm = new_vm();
    let s = vm.main_state();
    let outer_name = s.vm().intern_str("core");
    let outer = class_ops::new_namespace(s, outer_name).unwrap();
    let inner_name = s.vm().intern_str("io");
    let inner = class_ops::new_namespace(s, inner_name).unwrap();
    class_ops::link_namespace(s, outer, inner).unwrap();

    let outer_tid = outer.as_table_id().unwrap();
    let got = s.vm().raw_get(outer_tid, &inner_name);
    assert_eq!(got.as_table_id(), inner.as_table_id());
    assert_eq!(got.kind(), LuaValueKind::Namespace);
}

#[test]
fn iface_flags_accumulate() {
    let mut vm = new_vm();
    let class = make_point_class(&mut vm);
    let s = vm.main_state();
    class_ops::set_iface_flag(s, class, 0).unwrap();
    class_ops::set_iface_flag(s, class, 3).unwrap();
    let tid = class.as_table_id().unwrap();
    let key = s.vm().intern_str("__iface_flags");
    let flags = s.vm().raw_get(tid, &key).as_integer().unwrap();
    assert_eq!(flags, 0b1001);
}

#[test]
fn spaceship_compares_three_ways() {
    let mut vm = new_vm();
    let s = vm.main_state();
    let r = compare::spaceship(s, &LuaValue::integer(1), &LuaValue::integer(2)).unwrap();
    assert_eq!(r.as_integer(), Some(-1));
    let r = compare::spaceship(s, &LuaValue::integer(2), &LuaValue::integer(2)).unwrap();
    assert_eq!(r.as_integer(), Some(0));
    let r = compare::spaceship(s, &LuaValue::float(2.5), &LuaValue::integer(2)).unwrap();
    assert_eq!(r.as_integer(), Some(1));
}

#[test]
fn membership_tests_keys_and_substrings() {
    let mut vm = new_vm();
    let t = vm.alloc_table(0, 2);
    let key = vm.intern_str("present");
    vm.raw_set(t, key, LuaValue::integer(1)).unwrap();

    let s = vm.main_state();
    assert!(compare::contains(s, &key, &LuaValue::table(t)).unwrap());
    let absent = s.vm().intern_str("absent");
    assert!(!compare::contains(s, &absent, &LuaValue::table(t)).unwrap());

    let hay = s.vm().intern_str("hello world");
    let needle = s.vm().intern_str("lo wo");
    assert!(compare::contains(s, &needle, &hay).unwrap());
    let missing = s.vm().intern_str("xyz");
    assert!(!compare::contains(s, &missing, &hay).unwrap());

    // membership on a number is a type error
    let err = compare::contains(s, &key, &LuaValue::integer(1)).unwrap_err();
    assert_eq!(err, LuaError::TypeError);
}

#[test]
fn is_testnil_errnnil_and_case_opcodes() {
    let mut vm = new_vm();
    // f(v): if v is "number" then return 1 end
    //       if v == nil then return 2 end
    //       return 3
    let mut b = ProtoBuilder::new(1, 4);
    let k_number = b.k_str(&mut vm, "number");
    b.abck(OpCode::Is, 1, 0, k_number, false); // 0: R1 = typename(v)=="number"
    b.abck(OpCode::Test, 1, 0, 0, true); // 1
    b.sj(OpCode::Jmp, 3); // 2 -> 6 (return 1)
    b.abck(OpCode::TestNil, 0, 0, 0, true); // 3: v == nil ?
    b.sj(OpCode::Jmp, 4); // 4 -> 9 (return 2)
    b.sj(OpCode::Jmp, 5); // 5 -> 11 (return 3)
    b.asbx(OpCode::LoadI, 1, 1); // 6
    b.abc(OpCode::Return1, 1, 0, 0); // 7
    b.abc(OpCode::Nop, 0, 0, 0); // 8
    b.asbx(OpCode::LoadI, 1, 2); // 9
    b.abc(OpCode::Return1, 1, 0, 0); // 10
    b.asbx(OpCode::LoadI, 1, 3); // 11
    b.abc(OpCode::Return1, 1, 0, 0); // 12
    let f = vm.closure_from_proto(b.build());

    let r = vm.call_value(f, &[LuaValue::integer(5)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(1));
    let r = vm.call_value(f, &[LuaValue::nil()]).unwrap();
    assert_eq!(r.first().as_integer(), Some(2));
    let s_arg = vm.intern_str("text");
    let r = vm.call_value(f, &[s_arg]).unwrap();
    assert_eq!(r.first().as_integer(), Some(3));

    // ERRNNIL raises on nil
    let mut b = ProtoBuilder::new(1, 2);
    b.abc(OpCode::ErrNNil, 0, 0, 0);
    b.abc(OpCode::Return0, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());
    assert!(vm.call_value(f, &[LuaValue::integer(1)]).is_ok());
    let err = vm.pcall_value(f, &[LuaValue::nil()]).unwrap_err();
    assert_eq!(err, LuaError::TypeError);

    // CASE matches a constant and takes its jump
    let mut b = ProtoBuilder::new(1, 3);
    let k2 = b.k(LuaValue::integer(2));
    b.abx(OpCode::Case, 0, k2); // 0: v == 2 ?
    b.sj(OpCode::Jmp, 2); // 1 -> 4 (matched)
    b.asbx(OpCode::LoadI, 1, 0); // 2
    b.abc(OpCode::Return1, 1, 0, 0); // 3
    b.asbx(OpCode::LoadI, 1, 1); // 4
    b.abc(OpCode::Return1, 1, 0, 0); // 5
    let f = vm.closure_from_proto(b.build());
    let r = vm.call_value(f, &[LuaValue::integer(2)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(1));
    let r = vm.call_value(f, &[LuaValue::integer(5)]).unwrap();
    assert_eq!(r.first().as_integer(), Some(0));
}
