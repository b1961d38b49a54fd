// Arithmetic and bitwise semantics.
//
// Integer ops wrap on overflow. Division is always float; integer division
// floors; modulus takes the divisor's sign. Shift counts work modulo the
// bit width: counts at or past 64 produce 0, negative counts shift the
// other way. Integer division and modulus by zero raise.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::metamethod;
use crate::lua_vm::{LuaError, LuaResult, LuaState, TmKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    pub fn tm(self) -> TmKind {
        match self {
            ArithOp::Add => TmKind::Add,
            ArithOp::Sub => TmKind::Sub,
            ArithOp::Mul => TmKind::Mul,
            ArithOp::Mod => TmKind::Mod,
            ArithOp::Pow => TmKind::Pow,
            ArithOp::Div => TmKind::Div,
            ArithOp::IDiv => TmKind::IDiv,
            ArithOp::BAnd => TmKind::BAnd,
            ArithOp::BOr => TmKind::BOr,
            ArithOp::BXor => TmKind::BXor,
            ArithOp::Shl => TmKind::Shl,
            ArithOp::Shr => TmKind::Shr,
            ArithOp::Unm => TmKind::Unm,
            ArithOp::BNot => TmKind::BNot,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
            | ArithOp::BNot => "perform bitwise operation on",
            _ => "perform arithmetic on",
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }
}

/// Floor division on integers; both operands already checked non-zero
/// divisor.
#[inline]
pub fn int_idiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// Modulus with the divisor's sign.
#[inline]
pub fn int_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        r.wrapping_add(b)
    } else {
        r
    }
}

#[inline]
pub fn flt_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

/// Left shift; negative counts shift right, counts >= 64 zero out.
#[inline]
pub fn int_shl(a: i64, n: i64) -> i64 {
    if n < 0 {
        int_shr(a, n.wrapping_neg())
    } else if n >= 64 {
        0
    } else {
        ((a as u64) << n) as i64
    }
}

/// Logical right shift (zero fill); negative counts shift left.
#[inline]
pub fn int_shr(a: i64, n: i64) -> i64 {
    if n < 0 {
        int_shl(a, n.wrapping_neg())
    } else if n >= 64 {
        0
    } else {
        ((a as u64) >> n) as i64
    }
}

/// Numeric fast path; None when either operand needs coercion or a
/// metamethod.
fn raw_arith(s: &mut LuaState, op: ArithOp, a: &LuaValue, b: &LuaValue) -> LuaResult<Option<LuaValue>> {
    if op.is_bitwise() {
        let (Some(ia), Some(ib)) = (s.vm().coerce_integer(a), s.vm().coerce_integer(b)) else {
            // distinguish "float with no integer representation" for a
            // better message
            if (a.is_float() && s.vm().coerce_integer(a).is_none())
                || (b.is_float() && s.vm().coerce_integer(b).is_none())
            {
                return Err(s
                    .vm()
                    .raise_plain(LuaError::Overflow, "number has no integer representation"));
            }
            return Ok(None);
        };
        let r = match op {
            ArithOp::BAnd => ia & ib,
            ArithOp::BOr => ia | ib,
            ArithOp::BXor => ia ^ ib,
            ArithOp::Shl => int_shl(ia, ib),
            ArithOp::Shr => int_shr(ia, ib),
            ArithOp::BNot => !ia,
            _ => unreachable!(),
        };
        return Ok(Some(LuaValue::integer(r)));
    }

    // integer-preserving where possible
    if let (Some(ia), Some(ib)) = (a.as_integer(), b.as_integer()) {
        let r = match op {
            ArithOp::Add => LuaValue::integer(ia.wrapping_add(ib)),
            ArithOp::Sub => LuaValue::integer(ia.wrapping_sub(ib)),
            ArithOp::Mul => LuaValue::integer(ia.wrapping_mul(ib)),
            ArithOp::IDiv => {
                if ib == 0 {
                    return Err(s
                        .vm()
                        .raise_plain(LuaError::ArithmeticError, "attempt to perform 'n//0'"));
                }
                LuaValue::integer(int_idiv(ia, ib))
            }
            ArithOp::Mod => {
                if ib == 0 {
                    return Err(s
                        .vm()
                        .raise_plain(LuaError::ArithmeticError, "attempt to perform 'n%%0'"));
                }
                LuaValue::integer(int_mod(ia, ib))
            }
            ArithOp::Div => LuaValue::float(ia as f64 / ib as f64),
            ArithOp::Pow => LuaValue::float((ia as f64).powf(ib as f64)),
            ArithOp::Unm => LuaValue::integer(ia.wrapping_neg()),
            _ => unreachable!(),
        };
        return Ok(Some(r));
    }

    let (Some(na), Some(nb)) = (coerce_num(s, a), coerce_num(s, b)) else {
        return Ok(None);
    };
    let (fa, fb) = (num_as_f64(&na), num_as_f64(&nb));
    // coercion may have produced two integers (string operands); keep the
    // integer-preserving semantics then
    if na.is_integer() && nb.is_integer() && !matches!(op, ArithOp::Div | ArithOp::Pow) {
        return raw_arith(s, op, &na, &nb);
    }
    let r = match op {
        ArithOp::Add => fa + fb,
        ArithOp::Sub => fa - fb,
        ArithOp::Mul => fa * fb,
        ArithOp::Div => fa / fb,
        ArithOp::IDiv => (fa / fb).floor(),
        ArithOp::Mod => flt_mod(fa, fb),
        ArithOp::Pow => fa.powf(fb),
        ArithOp::Unm => -fa,
        _ => unreachable!(),
    };
    Ok(Some(LuaValue::float(r)))
}

#[inline]
fn coerce_num(s: &mut LuaState, v: &LuaValue) -> Option<LuaValue> {
    s.vm().coerce_number(v)
}

#[inline]
fn num_as_f64(v: &LuaValue) -> f64 {
    v.number_value().unwrap_or(f64::NAN)
}

/// Full binary arithmetic: fast path, then the metamethod protocol.
pub fn arith(s: &mut LuaState, op: ArithOp, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    if let Some(v) = raw_arith(s, op, &a, &b)? {
        return Ok(v);
    }
    metamethod::bin_tm_or_error(s, &a, &b, op.tm(), op.describe())
}

/// Unary minus / bitwise not with metamethod fallback (the handler gets
/// the operand on both sides, the usual unary convention).
pub fn unary_arith(s: &mut LuaState, op: ArithOp, a: LuaValue) -> LuaResult<LuaValue> {
    debug_assert!(matches!(op, ArithOp::Unm | ArithOp::BNot));
    if let Some(v) = raw_arith(s, op, &a, &a)? {
        return Ok(v);
    }
    metamethod::bin_tm_or_error(s, &a, &a, op.tm(), op.describe())
}
