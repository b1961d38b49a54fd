// Comparison semantics: equality with __eq, ordering with __lt/__le,
// the three-way compare, membership, and type tests.

use crate::lua_value::{LuaValue, LuaValueKind};
use crate::lua_vm::execute::metamethod;
use crate::lua_vm::{LuaError, LuaResult, LuaState, TmKind};

/// Numeric equality across the integer/float split.
fn num_eq(a: &LuaValue, b: &LuaValue) -> bool {
    match (a.as_integer(), b.as_integer()) {
        (Some(x), Some(y)) => x == y,
        _ => {
            let (Some(x), Some(y)) = (a.number_value(), b.number_value()) else {
                return false;
            };
            x == y
        }
    }
}

/// Raw equality: no metamethods. Interning makes short strings pointer
/// comparable; long strings compare by bytes.
pub fn raw_eq(s: &LuaState, a: &LuaValue, b: &LuaValue) -> bool {
    if a.is_number() && b.is_number() {
        return num_eq(a, b);
    }
    if a.base_tag() != b.base_tag() {
        return false;
    }
    if a.is_string() {
        let (ia, ib) = (a.as_string_id().unwrap(), b.as_string_id().unwrap());
        if ia == ib {
            return true;
        }
        if a.is_short_string() && b.is_short_string() {
            return false; // interned: same content implies same object
        }
        return s.vm().pool.string_bytes(ia) == s.vm().pool.string_bytes(ib);
    }
    a.raw_eq_bits(b)
}

/// Full equality: raw first, then __eq when both sides are tables or both
/// are userdata.
pub fn value_eq(s: &mut LuaState, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if raw_eq(s, a, b) {
        return Ok(true);
    }
    let both_tables = a.is_table_like() && b.is_table_like();
    let both_userdata = a.kind() == LuaValueKind::Userdata && b.kind() == LuaValueKind::Userdata;
    if !both_tables && !both_userdata {
        return Ok(false);
    }
    match metamethod::try_bin_tm(s, a, b, TmKind::Eq)? {
        Some(v) => Ok(v.is_truthy()),
        None => Ok(false),
    }
}

fn str_cmp(s: &LuaState, a: &LuaValue, b: &LuaValue) -> std::cmp::Ordering {
    let ba = s.vm().pool.string_bytes(a.as_string_id().unwrap());
    let bb = s.vm().pool.string_bytes(b.as_string_id().unwrap());
    ba.cmp(bb)
}

fn num_cmp(a: &LuaValue, b: &LuaValue) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
        return Some(x.cmp(&y));
    }
    let (x, y) = (a.number_value()?, b.number_value()?);
    x.partial_cmp(&y)
}

/// `a < b` with __lt fallback.
pub fn value_lt(s: &mut LuaState, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(matches!(num_cmp(a, b), Some(std::cmp::Ordering::Less)));
    }
    if a.is_string() && b.is_string() {
        return Ok(str_cmp(s, a, b) == std::cmp::Ordering::Less);
    }
    match metamethod::try_bin_tm(s, a, b, TmKind::Lt)? {
        Some(v) => Ok(v.is_truthy()),
        None => {
            let msg = format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            );
            Err(s.vm().raise_plain(LuaError::TypeError, msg))
        }
    }
}

/// `a <= b` with __le fallback.
pub fn value_le(s: &mut LuaState, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(matches!(
            num_cmp(a, b),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ));
    }
    if a.is_string() && b.is_string() {
        return Ok(str_cmp(s, a, b) != std::cmp::Ordering::Greater);
    }
    match metamethod::try_bin_tm(s, a, b, TmKind::Le)? {
        Some(v) => Ok(v.is_truthy()),
        None => {
            let msg = format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            );
            Err(s.vm().raise_plain(LuaError::TypeError, msg))
        }
    }
}

/// Three-way compare: -1, 0 or 1. Equality is decided first (with __eq),
/// then ordering through the __lt machinery.
pub fn spaceship(s: &mut LuaState, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
    if value_eq(s, a, b)? {
        return Ok(LuaValue::integer(0));
    }
    if value_lt(s, a, b)? {
        Ok(LuaValue::integer(-1))
    } else {
        Ok(LuaValue::integer(1))
    }
}

/// Membership test `a in b`: __contains wins, then raw containment (key
/// presence in tables, substring for strings).
pub fn contains(s: &mut LuaState, item: &LuaValue, container: &LuaValue) -> LuaResult<bool> {
    let handler = s.vm().get_metamethod(container, TmKind::Contains);
    if !handler.is_nil() {
        let mv = metamethod::call_value_internal(s, handler, &[*container, *item], 1)?;
        return Ok(mv.first().is_truthy());
    }
    if let Some(tid) = container.as_table_id() {
        return Ok(!s.vm().raw_get(tid, item).is_nil());
    }
    if container.is_string() && item.is_string() {
        let hay = s
            .vm()
            .pool
            .string_bytes(container.as_string_id().unwrap())
            .to_vec();
        let needle = s.vm().pool.string_bytes(item.as_string_id().unwrap());
        if needle.is_empty() {
            return Ok(true);
        }
        return Ok(hay.windows(needle.len()).any(|w| w == needle));
    }
    let msg = format!(
        "attempt to test membership in a {} value",
        container.type_name()
    );
    Err(s.vm().raise_plain(LuaError::TypeError, msg))
}
