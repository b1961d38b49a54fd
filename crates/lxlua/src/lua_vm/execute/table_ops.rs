// Table access protocol: metamethod-aware reads and writes, length,
// concatenation, slices, and the access-log tap.

use crate::lua_value::{AccessOp, AccessRecord, LuaValue};
use crate::lua_vm::execute::metamethod;
use crate::lua_vm::{LuaError, LuaResult, LuaState, TmKind};

/// Emit an access-log record when the global log is on. Rendering only
/// happens on the enabled path.
pub fn log_access(s: &mut LuaState, op: AccessOp, key: &LuaValue, value: &LuaValue) {
    let vm = s.vm();
    if !vm.access_log.is_enabled() {
        return;
    }
    let key_repr = vm.display_value(key);
    let value_repr = vm.display_value(value);
    let source = s
        .current_frame()
        .and_then(|f| f.func.as_function_id())
        .and_then(|fid| s.vm().pool.get_function(fid).and_then(|g| g.proto().cloned()))
        .map(|p| p.short_source().to_string())
        .unwrap_or_else(|| "?".to_string());
    let record = AccessRecord {
        op,
        key: &key_repr,
        key_type: key.type_name(),
        key_int: key.as_integer(),
        value: &value_repr,
        value_type: value.type_name(),
        value_int: value.as_integer(),
        source: &source,
    };
    s.vm().access_log.record(record);
}

/// Read `obj[key]` through the full protocol.
pub fn table_get(s: &mut LuaState, obj: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
    let v = metamethod::index_chain(s, obj, key)?;
    log_access(s, AccessOp::Get, &key, &v);
    Ok(v)
}

/// Write `obj[key] = value` through the full protocol.
pub fn table_set(s: &mut LuaState, obj: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
    metamethod::newindex_chain(s, obj, key, value)?;
    log_access(s, AccessOp::Set, &key, &value);
    Ok(())
}

/// Length operator: strings by bytes, tables honor __len before the raw
/// border, everything else needs __len.
pub fn value_len(s: &mut LuaState, v: LuaValue) -> LuaResult<LuaValue> {
    if v.is_string() {
        let len = s.vm().raw_len(&v).unwrap_or(0);
        return Ok(LuaValue::integer(len));
    }
    if v.is_table_like() {
        let handler = s.vm().get_metamethod(&v, TmKind::Len);
        if !handler.is_nil() {
            let mv = metamethod::call_value_internal(s, handler, &[v], 1)?;
            return Ok(mv.first());
        }
        let len = s.vm().raw_len(&v).unwrap_or(0);
        return Ok(LuaValue::integer(len));
    }
    let handler = s.vm().get_metamethod(&v, TmKind::Len);
    if !handler.is_nil() {
        let mv = metamethod::call_value_internal(s, handler, &[v], 1)?;
        return Ok(mv.first());
    }
    let msg = format!("attempt to get length of a {} value", v.type_name());
    Err(s.vm().raise_plain(LuaError::TypeError, msg))
}

fn concat_two(s: &mut LuaState, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    let a_ok = a.is_string() || a.is_number();
    let b_ok = b.is_string() || b.is_number();
    if a_ok && b_ok {
        let mut bytes = Vec::new();
        append_value(s, &mut bytes, &a);
        append_value(s, &mut bytes, &b);
        return Ok(s.vm().intern(&bytes));
    }
    metamethod::bin_tm_or_error(s, &a, &b, TmKind::Concat, "concatenate")
}

fn append_value(s: &LuaState, out: &mut Vec<u8>, v: &LuaValue) {
    if let Some(bytes) = s.vm().value_str(v) {
        out.extend_from_slice(bytes);
    } else {
        out.extend_from_slice(s.vm().display_value(v).as_bytes());
    }
}

/// CONCAT: fold R[first..first+count-1] right to left so __concat sees the
/// same associativity the language defines.
pub fn concat_range(s: &mut LuaState, first: usize, count: usize) -> LuaResult<LuaValue> {
    debug_assert!(count >= 1);
    let mut acc = s.get(first + count - 1);
    let mut i = count - 1;
    while i > 0 {
        i -= 1;
        let lhs = s.get(first + i);
        acc = concat_two(s, lhs, acc)?;
    }
    Ok(acc)
}

/// SLICE: strings yield substrings, tables a fresh array of the range.
/// Bounds are 1-based inclusive; negative indices count from the end.
pub fn slice_value(s: &mut LuaState, obj: LuaValue, from: LuaValue, to: LuaValue) -> LuaResult<LuaValue> {
    let Some(mut i) = s.vm().coerce_integer(&from) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "slice bounds must be integers"));
    };
    let Some(mut j) = s.vm().coerce_integer(&to) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "slice bounds must be integers"));
    };

    if let Some(sid) = obj.as_string_id() {
        let bytes = s.vm().pool.string_bytes(sid).to_vec();
        let n = bytes.len() as i64;
        if i < 0 {
            i = (n + i + 1).max(1);
        } else if i == 0 {
            i = 1;
        }
        if j < 0 {
            j = n + j + 1;
        } else if j > n {
            j = n;
        }
        if i > j {
            return Ok(s.vm().intern(b""));
        }
        let out = bytes[(i - 1) as usize..j as usize].to_vec();
        return Ok(s.vm().intern(&out));
    }

    if let Some(tid) = obj.as_table_id() {
        let n = s.vm().pool.get_table(tid).map(|t| t.len()).unwrap_or(0);
        if i < 0 {
            i = (n + i + 1).max(1);
        } else if i == 0 {
            i = 1;
        }
        if j < 0 {
            j = n + j + 1;
        }
        let values = s
            .vm()
            .pool
            .get_table(tid)
            .map(|t| t.slice(i, j))
            .unwrap_or_default();
        let out = s.vm().alloc_table(values.len(), 0);
        for (off, v) in values.iter().enumerate() {
            s.vm().raw_set_int(out, off as i64 + 1, *v);
        }
        s.vm().maybe_gc(Some(&*s));
        return Ok(LuaValue::table(out));
    }

    let msg = format!("attempt to slice a {} value", obj.type_name());
    Err(s.vm().raise_plain(LuaError::TypeError, msg))
}
