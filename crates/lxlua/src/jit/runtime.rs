// Runtime helpers called by emitted code.
//
// Generated code keeps a pointer to this context in a callee-saved
// register and calls back in for anything that can allocate, raise, or
// call metamethods. Helpers that may move the value stack refresh the
// cached register-window pointer before returning, so inline loads and
// stores after a helper call stay valid.
//
// Helper return protocol (u32):
//   1 = continue with the next instruction
//   2 = error raised (error_code holds the kind)
//   3 = frame returned (poscall already ran)
//   4 = comparison requested the skip (pc += 1 path)

use std::rc::Rc;

use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::execute::arith::{self, ArithOp};
use crate::lua_vm::execute::{call, compare, table_ops};
use crate::lua_vm::execute::call::PreCall;
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::{LuaResult, LuaState};

pub const RET_CONTINUE: u32 = 1;
pub const RET_ERROR: u32 = 2;
pub const RET_RETURNED: u32 = 3;
pub const RET_SKIP: u32 = 4;

/// Layout is part of the emitter ABI; field offsets are read by generated
/// code.
#[repr(C)]
pub struct JitContext {
    /// Current register window (stack base of the frame).
    pub regs: *mut LuaValue,
    /// Constant pool of the running prototype.
    pub consts: *const LuaValue,
    pub state: *mut LuaState,
    pub proto: *const Proto,
    pub depth: usize,
    pub base: usize,
    pub error_code: u32,
    _pad: u32,
}

pub const CTX_OFF_REGS: usize = 0;
pub const CTX_OFF_CONSTS: usize = 8;

impl JitContext {
    pub fn new(s: &mut LuaState, depth: usize, base: usize, proto: &Rc<Proto>) -> Self {
        // the window is guaranteed by precall to sit inside the stack
        let regs = unsafe { s.stack.as_mut_ptr().add(base) };
        JitContext {
            regs,
            consts: proto.constants.as_ptr(),
            state: s as *mut LuaState,
            proto: Rc::as_ptr(proto),
            depth,
            base,
            error_code: 0,
        _pad: 0,
        }
    }

    #[inline]
    fn state_mut(&mut self) -> &mut LuaState {
        unsafe { &mut *self.state }
    }

    /// Re-derive the window pointer after anything that may have grown the
    /// stack.
    #[inline]
    fn refresh_regs(&mut self) {
        let base = self.base;
        let s = self.state_mut();
        self.regs = unsafe { s.stack.as_mut_ptr().add(base) };
    }

    fn fail(&mut self, e: crate::lua_vm::LuaError) -> u32 {
        self.error_code = super::error_to_code(e);
        self.refresh_regs();
        RET_ERROR
    }

    fn finish(&mut self, r: LuaResult<u32>) -> u32 {
        match r {
            Ok(code) => {
                self.refresh_regs();
                code
            }
            Err(e) => self.fail(e),
        }
    }
}

#[inline]
unsafe fn ctx_mut<'a>(ctx: *mut JitContext) -> &'a mut JitContext {
    unsafe { &mut *ctx }
}

/// Record the resume point; emitted right before a barrier exit.
pub unsafe extern "C" fn jit_rt_barrier(ctx: *mut JitContext, pc: u32) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    ctx.state_mut().frame_mut(depth).pc = pc;
    RET_CONTINUE
}

/// Binary arithmetic. `packed` = op in the low byte, operand mode in the
/// next (0 = reg/reg, 1 = reg/const, 2 = reg/immediate-signed-C).
pub unsafe extern "C" fn jit_rt_arith(
    ctx: *mut JitContext,
    packed: u32,
    a: u32,
    b: u32,
    c: u32,
    next_pc: u32,
) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    let base = ctx.base;
    let op = arith_op_of(packed & 0xFF);
    let mode = (packed >> 8) & 0xFF;

    let r = (|| -> LuaResult<u32> {
        let s = unsafe { &mut *ctx.state };
        s.frame_mut(depth).pc = next_pc;
        let vb = s.get(base + b as usize);
        let vc = match mode {
            0 => s.get(base + c as usize),
            1 => unsafe { *ctx.consts.add(c as usize) },
            _ => LuaValue::integer(c as i32 as i64 - 128),
        };
        let out = match op {
            ArithOp::Unm | ArithOp::BNot => arith::unary_arith(s, op, vb)?,
            _ => arith::arith(s, op, vb, vc)?,
        };
        s.set(base + a as usize, out);
        Ok(RET_CONTINUE)
    })();
    ctx.finish(r)
}

fn arith_op_of(code: u32) -> ArithOp {
    match code {
        0 => ArithOp::Add,
        1 => ArithOp::Sub,
        2 => ArithOp::Mul,
        3 => ArithOp::Mod,
        4 => ArithOp::Pow,
        5 => ArithOp::Div,
        6 => ArithOp::IDiv,
        7 => ArithOp::BAnd,
        8 => ArithOp::BOr,
        9 => ArithOp::BXor,
        10 => ArithOp::Shl,
        11 => ArithOp::Shr,
        12 => ArithOp::Unm,
        _ => ArithOp::BNot,
    }
}

/// Comparison family. `packed`: low byte 0=EQ 1=LT 2=LE 3=TEST, bit 8 =
/// k flag, bit 9 = immediate-B mode, bit 10 = swap operands (GT/GE forms).
pub unsafe extern "C" fn jit_rt_compare(
    ctx: *mut JitContext,
    packed: u32,
    a: u32,
    b: u32,
    next_pc: u32,
) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    let base = ctx.base;
    let r = (|| -> LuaResult<u32> {
        let s = unsafe { &mut *ctx.state };
        s.frame_mut(depth).pc = next_pc;
        let kind = packed & 0xFF;
        let k = packed & 0x100 != 0;
        let imm = packed & 0x200 != 0;
        let swap = packed & 0x400 != 0;

        let va = s.get(base + a as usize);
        let cond = if kind == 3 {
            va.is_truthy()
        } else {
            let vb = if imm {
                LuaValue::integer(b as i32 as i64 - 128)
            } else {
                s.get(base + b as usize)
            };
            let (x, y) = if swap { (vb, va) } else { (va, vb) };
            match kind {
                0 => compare::value_eq(s, &x, &y)?,
                1 => compare::value_lt(s, &x, &y)?,
                _ => compare::value_le(s, &x, &y)?,
            }
        };
        Ok(if cond != k { RET_SKIP } else { RET_CONTINUE })
    })();
    ctx.finish(r)
}

/// Table reads and writes. `mode`: 0 GETTABLE, 1 GETI, 2 GETFIELD,
/// 3 SETTABLE, 4 SETI, 5 SETFIELD. `packed_ck` carries C in the low
/// 16 bits and the k flag in bit 16.
pub unsafe extern "C" fn jit_rt_table(
    ctx: *mut JitContext,
    mode: u32,
    a: u32,
    b: u32,
    packed_ck: u32,
    next_pc: u32,
) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    let base = ctx.base;
    let consts = ctx.consts;
    let r = (|| -> LuaResult<u32> {
        let s = unsafe { &mut *ctx.state };
        s.frame_mut(depth).pc = next_pc;
        let c = (packed_ck & 0xFFFF) as usize;
        let k = packed_ck & 0x1_0000 != 0;
        match mode {
            0 | 1 | 2 => {
                let t = s.get(base + b as usize);
                let key = match mode {
                    0 => s.get(base + c),
                    1 => LuaValue::integer(c as i64),
                    _ => unsafe { *consts.add(c) },
                };
                let v = table_ops::table_get(s, t, key)?;
                s.set(base + a as usize, v);
            }
            _ => {
                let t = s.get(base + a as usize);
                let key = match mode {
                    3 => s.get(base + b as usize),
                    4 => LuaValue::integer(b as i64),
                    _ => unsafe { *consts.add(b as usize) },
                };
                let v = if k {
                    unsafe { *consts.add(c) }
                } else {
                    s.get(base + c)
                };
                table_ops::table_set(s, t, key, v)?;
            }
        }
        Ok(RET_CONTINUE)
    })();
    ctx.finish(r)
}

/// Full CALL: runs the callee (interpreting Lua callees to completion) and
/// leaves results in place, exactly like the interpreter's CALL.
pub unsafe extern "C" fn jit_rt_call(
    ctx: *mut JitContext,
    a: u32,
    b: u32,
    c: u32,
    next_pc: u32,
) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    let base = ctx.base;
    let r = (|| -> LuaResult<u32> {
        let s = unsafe { &mut *ctx.state };
        s.frame_mut(depth).pc = next_pc;
        let func_pos = base + a as usize;
        if b != 0 {
            s.set_top(func_pos + b as usize);
        }
        let nresults = c as i32 - 1;
        match call::precall(s, func_pos, nresults)? {
            PreCall::Lua => {
                let target = s.call_depth() - 1;
                lua_execute(s, target)?;
            }
            PreCall::Done => {}
        }
        Ok(RET_CONTINUE)
    })();
    ctx.finish(r)
}

/// RETURN0 / RETURN1 / RETURN. `nret`: 0, 1, or u32::MAX for "B-encoded".
pub unsafe extern "C" fn jit_rt_return(
    ctx: *mut JitContext,
    a: u32,
    nret: u32,
    b: u32,
    next_pc: u32,
) -> u32 {
    let ctx = unsafe { ctx_mut(ctx) };
    let depth = ctx.depth;
    let base = ctx.base;
    let r = (|| -> LuaResult<u32> {
        let s = unsafe { &mut *ctx.state };
        s.frame_mut(depth).pc = next_pc;
        let proto = unsafe { &*ctx.proto };
        if proto.is_vararg {
            let f = s.frame_mut(depth);
            f.func_pos -= (f.nextraargs as usize) + proto.numparams as usize + 1;
        }
        let nres = if nret == u32::MAX {
            if b == 0 {
                s.top() - (base + a as usize)
            } else {
                (b - 1) as usize
            }
        } else {
            nret as usize
        };
        call::poscall(s, depth, base + a as usize, nres)?;
        Ok(RET_RETURNED)
    })();
    ctx.finish(r)
}
