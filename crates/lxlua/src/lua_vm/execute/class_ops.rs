// The class / concept / namespace opcode family.
//
// A class is a table carrying the well-known subtables __methods and
// __statics plus a __parent link. The method table doubles as the
// instance metatable (its __index points at itself, and inheritance links
// method tables through their metatables), so plain table reads resolve
// methods with no extra machinery.

use crate::gc::TableId;
use crate::lua_value::lua_value::{V_CONCEPT, V_NAMESPACE, V_STRUCT};
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::{metamethod, table_ops};
use crate::lua_vm::{LuaError, LuaResult, LuaState};

const F_NAME: &str = "__name";
const F_METHODS: &str = "__methods";
const F_STATICS: &str = "__statics";
const F_PARENT: &str = "__parent";
const F_CLASS: &str = "__class";
const F_REQUIRES: &str = "__requires";
const F_CONCEPTS: &str = "__concepts";
const F_IFACE_FLAGS: &str = "__iface_flags";
const F_INDEX: &str = "__index";
const F_INIT: &str = "__init__";

fn get_field(s: &mut LuaState, tid: TableId, name: &str) -> LuaValue {
    let key = s.vm().intern_str(name);
    s.vm().raw_get(tid, &key)
}

fn set_field(s: &mut LuaState, tid: TableId, name: &str, value: LuaValue) -> LuaResult<()> {
    let key = s.vm().intern_str(name);
    s.vm().raw_set(tid, key, value)
}

fn expect_table_id(s: &mut LuaState, v: &LuaValue, what: &str) -> LuaResult<TableId> {
    v.as_table_id().ok_or_else(|| {
        let msg = format!("{} expected, got {}", what, v.type_name());
        s.vm().raise_plain(LuaError::TypeError, msg)
    })
}

/// NEWCLASS: fresh class with its method table wired as a self-indexing
/// metatable.
pub fn new_class(s: &mut LuaState, name: LuaValue) -> LuaResult<LuaValue> {
    let class_tid = s.vm().alloc_table(0, 8);
    let methods_tid = s.vm().alloc_table(0, 8);
    let statics_tid = s.vm().alloc_table(0, 4);
    let class = LuaValue::table_tagged(class_tid, V_STRUCT);

    set_field(s, methods_tid, F_INDEX, LuaValue::table(methods_tid))?;
    set_field(s, methods_tid, F_CLASS, class)?;
    set_field(s, class_tid, F_NAME, name)?;
    set_field(s, class_tid, F_METHODS, LuaValue::table(methods_tid))?;
    set_field(s, class_tid, F_STATICS, LuaValue::table(statics_tid))?;
    set_field(s, class_tid, F_IFACE_FLAGS, LuaValue::integer(0))?;
    s.vm().maybe_gc(Some(&*s));
    Ok(class)
}

pub fn methods_of(s: &mut LuaState, class: &LuaValue) -> LuaResult<TableId> {
    let tid = expect_table_id(s, class, "class")?;
    let methods = get_field(s, tid, F_METHODS);
    expect_table_id(s, &methods, "class method table")
}

fn statics_of(s: &mut LuaState, class: &LuaValue) -> LuaResult<TableId> {
    let tid = expect_table_id(s, class, "class")?;
    let statics = get_field(s, tid, F_STATICS);
    expect_table_id(s, &statics, "class static table")
}

/// INHERIT: record the parent and chain the method tables so lookups fall
/// through.
pub fn inherit(s: &mut LuaState, class: LuaValue, parent: LuaValue) -> LuaResult<()> {
    if parent.base_tag() != class.base_tag() {
        let msg = format!("cannot inherit from a {} value", parent.type_name());
        return Err(s.vm().raise_plain(LuaError::TypeError, msg));
    }
    let class_tid = expect_table_id(s, &class, "class")?;
    set_field(s, class_tid, F_PARENT, parent)?;

    let methods = methods_of(s, &class)?;
    let parent_methods = methods_of(s, &parent)?;
    if let Some(t) = s.vm().pool.get_table_mut(methods) {
        t.set_metatable(Some(parent_methods));
    }
    Ok(())
}

/// SETMETHOD / ADDMETHOD target resolution: classes get the method table,
/// concepts record a requirement.
pub fn set_method(s: &mut LuaState, target: LuaValue, name: LuaValue, value: LuaValue) -> LuaResult<()> {
    match target.tag() {
        t if t == V_CONCEPT => {
            let tid = expect_table_id(s, &target, "concept")?;
            let requires = get_field(s, tid, F_REQUIRES);
            let req_tid = expect_table_id(s, &requires, "concept requirement table")?;
            s.vm().raw_set(req_tid, name, value)
        }
        _ => {
            let methods = methods_of(s, &target)?;
            s.vm().raw_set(methods, name, value)
        }
    }
}

/// ADDMETHOD: runtime extension of an already-built class.
pub fn add_method(s: &mut LuaState, target: LuaValue, name: LuaValue, value: LuaValue) -> LuaResult<()> {
    if target.tag() != V_STRUCT {
        let msg = format!("cannot add a method to a {} value", target.type_name());
        return Err(s.vm().raise_plain(LuaError::TypeError, msg));
    }
    let methods = methods_of(s, &target)?;
    s.vm().raw_set(methods, name, value)
}

pub fn set_static(s: &mut LuaState, class: LuaValue, name: LuaValue, value: LuaValue) -> LuaResult<()> {
    let statics = statics_of(s, &class)?;
    s.vm().raw_set(statics, name, value)
}

/// NEWOBJ: allocate the instance, install the method table as metatable,
/// then run __init__ with the construction arguments.
pub fn new_obj(s: &mut LuaState, class: LuaValue, args: &[LuaValue]) -> LuaResult<LuaValue> {
    let methods = methods_of(s, &class)?;
    let obj_tid = s.vm().alloc_table(0, 4);
    if let Some(t) = s.vm().pool.get_table_mut(obj_tid) {
        t.set_metatable(Some(methods));
    }
    let obj = LuaValue::table(obj_tid);

    let init_key = s.vm().intern_str(F_INIT);
    let init = metamethod::index_chain(s, LuaValue::table(methods), init_key)?;
    if !init.is_nil() {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(obj);
        call_args.extend_from_slice(args);
        metamethod::call_value_internal(s, init, &call_args, 0)?;
    }
    s.vm().maybe_gc(Some(&*s));
    Ok(obj)
}

/// Class of an instance, reached through its metatable's __class backlink.
pub fn class_of(s: &mut LuaState, obj: &LuaValue) -> Option<LuaValue> {
    if obj.tag() == V_STRUCT {
        return Some(*obj);
    }
    let mt = s.vm().metatable_of(obj)?;
    let class = get_field(s, mt, F_CLASS);
    if class.is_nil() { None } else { Some(class) }
}

/// GETPROP: instance reads go through the regular index chain; class reads
/// consult statics before methods, walking the parent chain.
pub fn get_prop(s: &mut LuaState, obj: LuaValue, name: LuaValue) -> LuaResult<LuaValue> {
    if obj.tag() == V_STRUCT {
        let mut cur = obj;
        loop {
            let statics = statics_of(s, &cur)?;
            let v = s.vm().raw_get(statics, &name);
            if !v.is_nil() {
                return Ok(v);
            }
            let methods = methods_of(s, &cur)?;
            let v = s.vm().raw_get(methods, &name);
            if !v.is_nil() {
                return Ok(v);
            }
            let tid = expect_table_id(s, &cur, "class")?;
            let parent = get_field(s, tid, F_PARENT);
            if parent.is_nil() {
                return Ok(LuaValue::nil());
            }
            cur = parent;
        }
    }
    table_ops::table_get(s, obj, name)
}

pub fn set_prop(s: &mut LuaState, obj: LuaValue, name: LuaValue, value: LuaValue) -> LuaResult<()> {
    if obj.tag() == V_STRUCT {
        let statics = statics_of(s, &obj)?;
        return s.vm().raw_set(statics, name, value);
    }
    table_ops::table_set(s, obj, name, value)
}

/// INSTANCEOF: walk the parent chain of the value's class.
pub fn instance_of(s: &mut LuaState, obj: &LuaValue, class: &LuaValue) -> LuaResult<bool> {
    let Some(mut cur) = class_of(s, obj) else {
        return Ok(false);
    };
    loop {
        if cur.is_table_like()
            && class.is_table_like()
            && cur.as_table_id() == class.as_table_id()
        {
            return Ok(true);
        }
        let tid = expect_table_id(s, &cur, "class")?;
        let parent = get_field(s, tid, F_PARENT);
        if parent.is_nil() {
            return Ok(false);
        }
        cur = parent;
    }
}

/// IMPLEMENT: verify every requirement the concept names resolves through
/// the class method chain, then record the concept.
pub fn implement(s: &mut LuaState, class: LuaValue, concept: LuaValue) -> LuaResult<()> {
    if concept.tag() != V_CONCEPT {
        let msg = format!("concept expected, got {}", concept.type_name());
        return Err(s.vm().raise_plain(LuaError::TypeError, msg));
    }
    let concept_tid = expect_table_id(s, &concept, "concept")?;
    let requires = get_field(s, concept_tid, F_REQUIRES);
    let req_tid = expect_table_id(s, &requires, "concept requirement table")?;

    let required: Vec<LuaValue> = s
        .vm()
        .pool
        .get_table(req_tid)
        .map(|t| t.iter_all().into_iter().map(|(k, _)| k).collect())
        .unwrap_or_default();

    let methods = methods_of(s, &class)?;
    for name in required {
        let found = metamethod::index_chain(s, LuaValue::table(methods), name)?;
        if found.is_nil() {
            let concept_name = {
                let n = get_field(s, concept_tid, F_NAME);
                s.vm().display_value(&n)
            };
            let missing = s.vm().display_value(&name);
            let msg = format!(
                "class does not satisfy concept '{}': missing '{}'",
                concept_name, missing
            );
            return Err(s.vm().raise_plain(LuaError::TypeError, msg));
        }
    }

    let class_tid = expect_table_id(s, &class, "class")?;
    let concepts = {
        let v = get_field(s, class_tid, F_CONCEPTS);
        if let Some(tid) = v.as_table_id() {
            tid
        } else {
            let tid = s.vm().alloc_table(2, 0);
            set_field(s, class_tid, F_CONCEPTS, LuaValue::table(tid))?;
            tid
        }
    };
    let n = s.vm().pool.get_table(concepts).map(|t| t.len()).unwrap_or(0);
    s.vm().raw_set_int(concepts, n + 1, concept);
    Ok(())
}

/// GETSUPER: the parent class of the receiver's class; the caller then
/// resolves methods against it, one level above the receiver.
pub fn get_super(s: &mut LuaState, obj: &LuaValue) -> LuaResult<LuaValue> {
    let Some(class) = class_of(s, obj) else {
        let msg = format!("attempt to take super of a {} value", obj.type_name());
        return Err(s.vm().raise_plain(LuaError::TypeError, msg));
    };
    let tid = expect_table_id(s, &class, "class")?;
    Ok(get_field(s, tid, F_PARENT))
}

pub fn new_concept(s: &mut LuaState, name: LuaValue) -> LuaResult<LuaValue> {
    let tid = s.vm().alloc_table(0, 4);
    let requires = s.vm().alloc_table(0, 4);
    set_field(s, tid, F_NAME, name)?;
    set_field(s, tid, F_REQUIRES, LuaValue::table(requires))?;
    set_field(s, tid, F_IFACE_FLAGS, LuaValue::integer(0))?;
    s.vm().maybe_gc(Some(&*s));
    Ok(LuaValue::table_tagged(tid, V_CONCEPT))
}

pub fn new_namespace(s: &mut LuaState, name: LuaValue) -> LuaResult<LuaValue> {
    let tid = s.vm().alloc_table(0, 8);
    set_field(s, tid, F_NAME, name)?;
    s.vm().maybe_gc(Some(&*s));
    Ok(LuaValue::table_tagged(tid, V_NAMESPACE))
}

/// LINKNAMESPACE: expose `child` under its own name inside `parent`.
pub fn link_namespace(s: &mut LuaState, parent: LuaValue, child: LuaValue) -> LuaResult<()> {
    if parent.tag() != V_NAMESPACE || child.tag() != V_NAMESPACE {
        return Err(s
            .vm()
            .raise_plain(LuaError::TypeError, "namespace expected in namespace link"));
    }
    let child_tid = expect_table_id(s, &child, "namespace")?;
    let name = get_field(s, child_tid, F_NAME);
    let parent_tid = expect_table_id(s, &parent, "namespace")?;
    s.vm().raw_set(parent_tid, name, child)
}

/// SETIFACEFLAG: or a flag bit into a class or concept.
pub fn set_iface_flag(s: &mut LuaState, target: LuaValue, bit: u32) -> LuaResult<()> {
    let tid = expect_table_id(s, &target, "class or concept")?;
    let cur = get_field(s, tid, F_IFACE_FLAGS);
    let flags = cur.as_integer().unwrap_or(0) | (1i64 << bit.min(62));
    set_field(s, tid, F_IFACE_FLAGS, LuaValue::integer(flags))
}
