// Value representation, interning, coercions.

use crate::lua_value::lua_value::*;
use crate::lua_vm::parse_number;
use crate::test::helpers::*;
use crate::*;

#[test]
fn value_is_sixteen_bytes() {
    assert_eq!(std::mem::size_of::<LuaValue>(), 16);
}

#[test]
fn tag_basics() {
    assert!(LuaValue::nil().is_nil());
    assert!(LuaValue::boolean(false).is_false());
    assert!(LuaValue::nil().is_false());
    assert!(LuaValue::boolean(true).is_truthy());
    assert!(LuaValue::integer(0).is_truthy()); // zero is truthy here
    assert_eq!(LuaValue::integer(7).as_integer(), Some(7));
    assert_eq!(LuaValue::float(1.5).as_float(), Some(1.5));
    assert_eq!(LuaValue::integer(7).type_name(), "number");
    assert_eq!(novariant(V_SLPCL), TAG_FUNCTION);
    assert_eq!(novariant(V_HFCL), TAG_FUNCTION);
}

#[test]
fn short_string_interning_is_pointer_equality() {
    let mut vm = new_vm();
    let a = vm.intern_str("hello");
    let b = vm.intern_str("hello");
    assert_eq!(a.as_string_id(), b.as_string_id());

    // long strings are not interned
    let long = "x".repeat(100);
    let c = vm.intern_str(&long);
    let d = vm.intern_str(&long);
    assert_ne!(c.as_string_id(), d.as_string_id());
}

#[test]
fn external_string_runs_destructor() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut vm = new_vm();
    let dropped = Rc::new(Cell::new(false));
    let flag = dropped.clone();
    let data: &'static [u8] = b"external bytes";
    let white = vm.gc.current_white();
    let id = vm.pool.new_external_string(
        data.as_ptr(),
        data.len(),
        Some(Box::new(move |_, _| flag.set(true))),
        white,
    );
    assert_eq!(vm.pool.string_bytes(id), b"external bytes");
    vm.pool.remove_string(id);
    assert!(dropped.get());
}

#[test]
fn number_parsing() {
    assert_eq!(parse_number("42").and_then(|v| v.as_integer()), Some(42));
    assert_eq!(parse_number("-7").and_then(|v| v.as_integer()), Some(-7));
    assert_eq!(parse_number("0x10").and_then(|v| v.as_integer()), Some(16));
    assert_eq!(parse_number("1.5").and_then(|v| v.as_float()), Some(1.5));
    assert!(parse_number("nope").is_none());
    assert!(parse_number("").is_none());
}

#[test]
fn integer_coercion_rules() {
    let mut vm = new_vm();
    assert_eq!(vm.coerce_integer(&LuaValue::float(3.0)), Some(3));
    assert_eq!(vm.coerce_integer(&LuaValue::float(3.5)), None);
    let s = vm.intern_str("12");
    assert_eq!(vm.coerce_integer(&s), Some(12));
}

#[test]
fn display_rendering() {
    let mut vm = new_vm();
    assert_eq!(vm.display_value(&LuaValue::nil()), "nil");
    assert_eq!(vm.display_value(&LuaValue::integer(10)), "10");
    assert_eq!(vm.display_value(&LuaValue::float(2.0)), "2.0");
    let s = vm.intern_str("text");
    assert_eq!(vm.display_value(&s), "text");
}
