// Metamethod dispatch. Every metamethod invocation is an ordinary call
// that returns to the interpreter; recursion is bounded by the VM's
// metamethod depth counter.

use crate::lua_value::{LuaValue, MultiValue};
use crate::lua_vm::execute::call;
use crate::lua_vm::{LuaError, LuaResult, LuaState, TmKind};

/// Call a function value with arguments, returning up to `want` results
/// (the first one for the common single-result metamethods).
pub fn call_value_internal(
    s: &mut LuaState,
    f: LuaValue,
    args: &[LuaValue],
    want: usize,
) -> LuaResult<MultiValue> {
    s.vm().enter_meta()?;
    s.mark_frame_no_yield();
    let result = call::do_call_on(s, f, args);
    s.clear_frame_no_yield();
    s.vm().leave_meta();
    let mv = result?;
    if want == 0 {
        return Ok(MultiValue::empty());
    }
    Ok(mv)
}

/// Binary metamethod protocol: try the left operand's handler, then the
/// right one.
pub fn try_bin_tm(
    s: &mut LuaState,
    a: &LuaValue,
    b: &LuaValue,
    tm: TmKind,
) -> LuaResult<Option<LuaValue>> {
    let vm = s.vm();
    let mut handler = vm.get_metamethod(a, tm);
    if handler.is_nil() {
        handler = vm.get_metamethod(b, tm);
    }
    if handler.is_nil() {
        return Ok(None);
    }
    let mv = call_value_internal(s, handler, &[*a, *b], 1)?;
    Ok(Some(mv.first()))
}

/// Binary metamethod that must exist; raises a typed operand error naming
/// the offending side otherwise.
pub fn bin_tm_or_error(
    s: &mut LuaState,
    a: &LuaValue,
    b: &LuaValue,
    tm: TmKind,
    what: &str,
) -> LuaResult<LuaValue> {
    if let Some(v) = try_bin_tm(s, a, b, tm)? {
        return Ok(v);
    }
    // name the operand that broke the operation (second if first is fine)
    let (bad, idx) = if a.is_number() || (what == "concatenate" && a.is_string()) {
        (b, 2)
    } else {
        (a, 1)
    };
    let msg = format!(
        "attempt to {} a {} value (operand {})",
        what,
        bad.type_name(),
        idx
    );
    Err(s.vm().raise_plain(LuaError::TypeError, msg))
}

/// `__index` chain: raw miss on a table (or any non-table) walks handlers
/// until a value is produced, a table is reached, or the depth cap breaks
/// a metatable cycle.
pub fn index_chain(s: &mut LuaState, obj: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
    let mut cur = obj;
    let max = s.vm().options.max_meta_depth;
    for _ in 0..max {
        if let Some(tid) = cur.as_table_id() {
            let raw = s.vm().raw_get(tid, &key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let handler = s.vm().get_metamethod(&cur, TmKind::Index);
            if handler.is_nil() {
                return Ok(LuaValue::nil());
            }
            if handler.is_function() {
                let mv = call_value_internal(s, handler, &[cur, key], 1)?;
                return Ok(mv.first());
            }
            cur = handler; // table (or indexable) handler: continue the chain
        } else {
            let handler = s.vm().get_metamethod(&cur, TmKind::Index);
            if handler.is_nil() {
                let msg = format!("attempt to index a {} value", cur.type_name());
                return Err(s.vm().raise_plain(LuaError::IndexError, msg));
            }
            if handler.is_function() {
                let mv = call_value_internal(s, handler, &[cur, key], 1)?;
                return Ok(mv.first());
            }
            cur = handler;
        }
    }
    Err(s
        .vm()
        .raise_plain(LuaError::TooManyCalls, "'__index' chain too long; possible loop"))
}

/// `__newindex` chain, mirroring index_chain.
pub fn newindex_chain(
    s: &mut LuaState,
    obj: LuaValue,
    key: LuaValue,
    value: LuaValue,
) -> LuaResult<()> {
    let mut cur = obj;
    let max = s.vm().options.max_meta_depth;
    for _ in 0..max {
        if let Some(tid) = cur.as_table_id() {
            let raw = s.vm().raw_get(tid, &key);
            if !raw.is_nil() {
                s.vm().raw_set(tid, key, value)?;
                return Ok(());
            }
            let handler = s.vm().get_metamethod(&cur, TmKind::NewIndex);
            if handler.is_nil() {
                s.vm().raw_set(tid, key, value)?;
                return Ok(());
            }
            if handler.is_function() {
                call_value_internal(s, handler, &[cur, key, value], 0)?;
                return Ok(());
            }
            cur = handler;
        } else {
            let handler = s.vm().get_metamethod(&cur, TmKind::NewIndex);
            if handler.is_nil() {
                let msg = format!("attempt to index a {} value", cur.type_name());
                return Err(s.vm().raise_plain(LuaError::IndexError, msg));
            }
            if handler.is_function() {
                call_value_internal(s, handler, &[cur, key, value], 0)?;
                return Ok(());
            }
            cur = handler;
        }
    }
    Err(s
        .vm()
        .raise_plain(LuaError::TooManyCalls, "'__newindex' chain too long; possible loop"))
}
