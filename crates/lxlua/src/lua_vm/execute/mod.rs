// The bytecode interpreter.
//
// Single-loop design: function calls and returns update the frame chain
// and jump back to the context-switch point instead of recursing, so the
// Rust call stack stays flat across Lua-to-Lua calls. Metamethods and
// protected bodies re-enter lua_execute through their own call sites.

pub mod arith;
pub mod call;
pub mod class_ops;
pub mod compare;
pub mod coroutine;
pub mod metamethod;
pub mod table_ops;

use std::rc::Rc;

use crate::gc::{FunctionId, UpvalueId, UpvalueState, ClosureKind};
use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::call_info::call_status;
use crate::lua_vm::lua_state::hook_mask;
use crate::lua_vm::{HookEvent, LuaError, LuaResult, LuaState, TmKind};
use crate::{get_a, get_ax, get_b, get_bx, get_c, get_k, get_op, get_sb, get_sbx, get_sc, get_sj};

use arith::ArithOp;
use call::PreCall;

// ---- upvalue plumbing ----

pub(crate) fn closure_upvalue_id(s: &LuaState, fid: FunctionId, idx: usize) -> Option<UpvalueId> {
    s.vm()
        .pool
        .get_function(fid)
        .and_then(|f| f.lua_upvalues().get(idx).copied())
}

pub(crate) fn read_upvalue(s: &LuaState, id: UpvalueId) -> LuaValue {
    let state = s.vm().pool.get_upvalue(id).map(|u| u.state.clone());
    match state {
        Some(UpvalueState::Closed(v)) => v,
        Some(UpvalueState::Open { level, owner }) => {
            if owner == s.id {
                s.get(level)
            } else if let Some(tid) = owner {
                s.vm()
                    .pool
                    .get_thread(tid)
                    .map(|t| t.state.get(level))
                    .unwrap_or_else(LuaValue::nil)
            } else {
                s.vm().main.get(level)
            }
        }
        None => LuaValue::nil(),
    }
}

pub(crate) fn write_upvalue(s: &mut LuaState, id: UpvalueId, value: LuaValue) {
    let state = s.vm().pool.get_upvalue(id).map(|u| u.state.clone());
    match state {
        Some(UpvalueState::Closed(_)) => {
            if let Some(u) = s.vm().pool.get_upvalue_mut(id) {
                u.state = UpvalueState::Closed(value);
            }
            s.vm().gc_barrier_upvalue(id, &value);
        }
        Some(UpvalueState::Open { level, owner }) => {
            if owner == s.id {
                s.set(level, value);
            } else if let Some(tid) = owner {
                if let Some(t) = s.vm().pool.get_thread_mut(tid) {
                    t.state.set(level, value);
                }
            } else {
                s.vm().main.set(level, value);
            }
        }
        None => {}
    }
}

// ---- hooks ----

pub(crate) fn deliver_hook(s: &mut LuaState, depth: usize, event: HookEvent, line: u32) {
    let Some(hook) = s.vm().hook_fn else { return };
    s.in_hook = true;
    s.frame_mut(depth).call_status |= call_status::CIST_HOOKED;
    s.mark_frame_no_yield();
    hook(s, event, line);
    s.clear_frame_no_yield();
    s.frame_mut(depth).call_status &= !call_status::CIST_HOOKED;
    s.in_hook = false;
}

#[inline]
fn line_hook(s: &mut LuaState, proto: &Proto, pc: usize, depth: usize) {
    if s.in_hook || s.hook_mask & hook_mask::MASK_LINE == 0 {
        return;
    }
    let line = proto.line_at(pc) as i64;
    if line == 0 || line == s.last_hook_line {
        return;
    }
    s.last_hook_line = line;
    deliver_hook(s, depth, HookEvent::Line, line as u32);
}

#[inline]
fn count_hook(s: &mut LuaState, depth: usize) {
    if s.in_hook || s.hook_mask & hook_mask::MASK_COUNT == 0 {
        return;
    }
    s.hook_count -= 1;
    if s.hook_count <= 0 {
        s.hook_count = s.hook_base_count;
        deliver_hook(s, depth, HookEvent::Count, 0);
    }
}

/// Run the interpreter until the call depth drops back to `target_depth`.
pub fn lua_execute(s: &mut LuaState, target_depth: usize) -> LuaResult<()> {
    'startfunc: loop {
        if s.call_depth() <= target_depth {
            return Ok(());
        }
        let depth = s.call_depth() - 1;
        let entry_frame = *s.frame(depth);
        if entry_frame.is_c() {
            // C frames complete synchronously in precall
            return Ok(());
        }

        let fid = match entry_frame.func.as_function_id() {
            Some(fid) => fid,
            None => {
                return Err(s
                    .vm()
                    .raise_plain(LuaError::TypeError, "corrupt frame: not a function"));
            }
        };
        let proto: Rc<Proto> = match s.vm().pool.get_function(fid).map(|f| &f.kind) {
            Some(ClosureKind::Lua { proto, .. }) => proto.clone(),
            _ => {
                return Err(s
                    .vm()
                    .raise_plain(LuaError::TypeError, "corrupt frame: no prototype"));
            }
        };

        let fresh_entry = {
            let frame = s.frame_mut(depth);
            if frame.call_status & call_status::CIST_FRESH == 0 {
                frame.call_status |= call_status::CIST_FRESH;
                true
            } else {
                false
            }
        };
        if fresh_entry && s.hook_mask & hook_mask::MASK_CALL != 0 && !s.in_hook {
            let line = proto.line_at(0);
            deliver_hook(s, depth, HookEvent::Call, line);
        }

        // native code gets first shot at a fresh frame; a barrier drops us
        // back here with the saved pc pointing at the unhandled opcode
        if s.vm().options.jit_enabled && s.frame(depth).pc == 0 {
            match crate::jit::try_enter(s, depth, &proto)? {
                crate::jit::JitOutcome::Returned => continue 'startfunc,
                crate::jit::JitOutcome::Barrier | crate::jit::JitOutcome::NotCompiled => {}
            }
        }

        let mut base = s.frame(depth).base;
        let mut pc = s.frame(depth).pc as usize;

        macro_rules! protect {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(err) => {
                        s.frame_mut(depth).pc = pc as u32;
                        return Err(err);
                    }
                }
            };
        }

        macro_rules! reg {
            ($i:expr) => {
                s.get(base + $i)
            };
        }
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {
                s.set(base + $i, $v)
            };
        }
        macro_rules! kst {
            ($i:expr) => {
                proto.constants[$i]
            };
        }
        macro_rules! rk {
            ($i:expr, $k:expr) => {
                if $k { kst!($i) } else { reg!($i) }
            };
        }

        loop {
            if s.hook_mask != 0 {
                line_hook(s, &proto, pc, depth);
                count_hook(s, depth);
            }

            let inst = proto.code[pc];
            pc += 1;

            match get_op!(inst) {
                // ---- moves and loads ----
                crate::lua_vm::OpCode::Move => {
                    let v = reg!(get_b!(inst));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::LoadI => {
                    set_reg!(get_a!(inst), LuaValue::integer(get_sbx!(inst) as i64));
                }
                crate::lua_vm::OpCode::LoadF => {
                    set_reg!(get_a!(inst), LuaValue::float(get_sbx!(inst) as f64));
                }
                crate::lua_vm::OpCode::LoadK => {
                    set_reg!(get_a!(inst), kst!(get_bx!(inst)));
                }
                crate::lua_vm::OpCode::LoadKX => {
                    let extra = get_ax!(proto.code[pc]);
                    pc += 1;
                    set_reg!(get_a!(inst), kst!(extra));
                }
                crate::lua_vm::OpCode::LoadFalse => {
                    set_reg!(get_a!(inst), LuaValue::boolean(false));
                }
                crate::lua_vm::OpCode::LFalseSkip => {
                    set_reg!(get_a!(inst), LuaValue::boolean(false));
                    pc += 1;
                }
                crate::lua_vm::OpCode::LoadTrue => {
                    set_reg!(get_a!(inst), LuaValue::boolean(true));
                }
                crate::lua_vm::OpCode::LoadNil => {
                    let a = get_a!(inst);
                    for i in 0..=get_b!(inst) {
                        set_reg!(a + i, LuaValue::nil());
                    }
                }

                // ---- upvalues ----
                crate::lua_vm::OpCode::GetUpval => {
                    let v = match closure_upvalue_id(s, fid, get_b!(inst)) {
                        Some(id) => read_upvalue(s, id),
                        None => LuaValue::nil(),
                    };
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::SetUpval => {
                    let v = reg!(get_a!(inst));
                    if let Some(id) = closure_upvalue_id(s, fid, get_b!(inst)) {
                        write_upvalue(s, id, v);
                    }
                }
                crate::lua_vm::OpCode::GetTabUp => {
                    let t = match closure_upvalue_id(s, fid, get_b!(inst)) {
                        Some(id) => read_upvalue(s, id),
                        None => LuaValue::nil(),
                    };
                    let key = kst!(get_c!(inst));
                    let v = protect!(table_ops::table_get(s, t, key));
                    set_reg!(get_a!(inst), v);
                }

                // ---- table access ----
                crate::lua_vm::OpCode::GetTable => {
                    let t = reg!(get_b!(inst));
                    let key = reg!(get_c!(inst));
                    let v = protect!(table_ops::table_get(s, t, key));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::GetI => {
                    let t = reg!(get_b!(inst));
                    let key = LuaValue::integer(get_c!(inst) as i64);
                    let v = protect!(table_ops::table_get(s, t, key));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::GetField => {
                    let t = reg!(get_b!(inst));
                    let key = kst!(get_c!(inst));
                    let v = protect!(table_ops::table_get(s, t, key));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::SetTabUp => {
                    let t = match closure_upvalue_id(s, fid, get_a!(inst)) {
                        Some(id) => read_upvalue(s, id),
                        None => LuaValue::nil(),
                    };
                    let key = kst!(get_b!(inst));
                    let v = rk!(get_c!(inst), get_k!(inst));
                    protect!(table_ops::table_set(s, t, key, v));
                }
                crate::lua_vm::OpCode::SetTable => {
                    let t = reg!(get_a!(inst));
                    let key = reg!(get_b!(inst));
                    let v = rk!(get_c!(inst), get_k!(inst));
                    protect!(table_ops::table_set(s, t, key, v));
                }
                crate::lua_vm::OpCode::SetI => {
                    let t = reg!(get_a!(inst));
                    let key = LuaValue::integer(get_b!(inst) as i64);
                    let v = rk!(get_c!(inst), get_k!(inst));
                    protect!(table_ops::table_set(s, t, key, v));
                }
                crate::lua_vm::OpCode::SetField => {
                    let t = reg!(get_a!(inst));
                    let key = kst!(get_b!(inst));
                    let v = rk!(get_c!(inst), get_k!(inst));
                    protect!(table_ops::table_set(s, t, key, v));
                }
                crate::lua_vm::OpCode::NewTable => {
                    let a = get_a!(inst);
                    let hash_hint = {
                        let b = get_b!(inst);
                        if b > 0 { 1usize << (b - 1) } else { 0 }
                    };
                    let mut array_hint = get_c!(inst);
                    // a trailing EXTRAARG widens the array hint
                    if pc < proto.code.len()
                        && get_op!(proto.code[pc]) == crate::lua_vm::OpCode::ExtraArg
                    {
                        array_hint += get_ax!(proto.code[pc]) * 256;
                        pc += 1;
                    }
                    let tid = s.vm().alloc_table(array_hint, hash_hint);
                    set_reg!(a, LuaValue::table(tid));
                    s.vm().maybe_gc(Some(&*s));
                }
                crate::lua_vm::OpCode::Self_ => {
                    let a = get_a!(inst);
                    let obj = reg!(get_b!(inst));
                    let key = rk!(get_c!(inst), get_k!(inst));
                    set_reg!(a + 1, obj);
                    let method = protect!(table_ops::table_get(s, obj, key));
                    set_reg!(a, method);
                }

                // ---- arithmetic ----
                crate::lua_vm::OpCode::AddI => {
                    let b = reg!(get_b!(inst));
                    let imm = LuaValue::integer(get_sc!(inst) as i64);
                    let v = protect!(arith::arith(s, ArithOp::Add, b, imm));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::AddK
                | crate::lua_vm::OpCode::SubK
                | crate::lua_vm::OpCode::MulK
                | crate::lua_vm::OpCode::ModK
                | crate::lua_vm::OpCode::PowK
                | crate::lua_vm::OpCode::DivK
                | crate::lua_vm::OpCode::IDivK
                | crate::lua_vm::OpCode::BAndK
                | crate::lua_vm::OpCode::BOrK
                | crate::lua_vm::OpCode::BXorK => {
                    let op = match get_op!(inst) {
                        crate::lua_vm::OpCode::AddK => ArithOp::Add,
                        crate::lua_vm::OpCode::SubK => ArithOp::Sub,
                        crate::lua_vm::OpCode::MulK => ArithOp::Mul,
                        crate::lua_vm::OpCode::ModK => ArithOp::Mod,
                        crate::lua_vm::OpCode::PowK => ArithOp::Pow,
                        crate::lua_vm::OpCode::DivK => ArithOp::Div,
                        crate::lua_vm::OpCode::IDivK => ArithOp::IDiv,
                        crate::lua_vm::OpCode::BAndK => ArithOp::BAnd,
                        crate::lua_vm::OpCode::BOrK => ArithOp::BOr,
                        _ => ArithOp::BXor,
                    };
                    let b = reg!(get_b!(inst));
                    let c = kst!(get_c!(inst));
                    let v = protect!(arith::arith(s, op, b, c));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::ShrI => {
                    let b = reg!(get_b!(inst));
                    let imm = LuaValue::integer(get_sc!(inst) as i64);
                    let v = protect!(arith::arith(s, ArithOp::Shr, b, imm));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::ShlI => {
                    let imm = LuaValue::integer(get_sc!(inst) as i64);
                    let b = reg!(get_b!(inst));
                    let v = protect!(arith::arith(s, ArithOp::Shl, imm, b));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::Add
                | crate::lua_vm::OpCode::Sub
                | crate::lua_vm::OpCode::Mul
                | crate::lua_vm::OpCode::Mod
                | crate::lua_vm::OpCode::Pow
                | crate::lua_vm::OpCode::Div
                | crate::lua_vm::OpCode::IDiv
                | crate::lua_vm::OpCode::BAnd
                | crate::lua_vm::OpCode::BOr
                | crate::lua_vm::OpCode::BXor
                | crate::lua_vm::OpCode::Shl
                | crate::lua_vm::OpCode::Shr => {
                    let op = match get_op!(inst) {
                        crate::lua_vm::OpCode::Add => ArithOp::Add,
                        crate::lua_vm::OpCode::Sub => ArithOp::Sub,
                        crate::lua_vm::OpCode::Mul => ArithOp::Mul,
                        crate::lua_vm::OpCode::Mod => ArithOp::Mod,
                        crate::lua_vm::OpCode::Pow => ArithOp::Pow,
                        crate::lua_vm::OpCode::Div => ArithOp::Div,
                        crate::lua_vm::OpCode::IDiv => ArithOp::IDiv,
                        crate::lua_vm::OpCode::BAnd => ArithOp::BAnd,
                        crate::lua_vm::OpCode::BOr => ArithOp::BOr,
                        crate::lua_vm::OpCode::BXor => ArithOp::BXor,
                        crate::lua_vm::OpCode::Shl => ArithOp::Shl,
                        _ => ArithOp::Shr,
                    };
                    let b = reg!(get_b!(inst));
                    let c = reg!(get_c!(inst));
                    let v = protect!(arith::arith(s, op, b, c));
                    set_reg!(get_a!(inst), v);
                }

                // ---- unary ----
                crate::lua_vm::OpCode::Unm => {
                    let b = reg!(get_b!(inst));
                    let v = protect!(arith::unary_arith(s, ArithOp::Unm, b));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::BNot => {
                    let b = reg!(get_b!(inst));
                    let v = protect!(arith::unary_arith(s, ArithOp::BNot, b));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::Not => {
                    let b = reg!(get_b!(inst));
                    set_reg!(get_a!(inst), LuaValue::boolean(b.is_false()));
                }
                crate::lua_vm::OpCode::Len => {
                    let b = reg!(get_b!(inst));
                    let v = protect!(table_ops::value_len(s, b));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::Concat => {
                    let a = get_a!(inst);
                    let count = get_b!(inst);
                    let v = protect!(table_ops::concat_range(s, base + a, count));
                    set_reg!(a, v);
                    s.vm().maybe_gc(Some(&*s));
                }

                // ---- scope exits ----
                crate::lua_vm::OpCode::Close => {
                    let a = get_a!(inst);
                    protect!(call::close_scopes(s, base + a, None));
                }
                crate::lua_vm::OpCode::Tbc => {
                    let a = get_a!(inst);
                    let v = reg!(a);
                    if !v.is_nil() && v.as_boolean() != Some(false) {
                        let close_fn = s.vm().get_metamethod(&v, TmKind::Close);
                        if close_fn.is_nil() {
                            let msg = format!(
                                "variable of type {} has no '__close' metamethod",
                                v.type_name()
                            );
                            let e = s.vm().raise_plain(LuaError::TypeError, msg);
                            s.frame_mut(depth).pc = pc as u32;
                            return Err(e);
                        }
                        protect!(s.tbc_push(base + a));
                    }
                }

                // ---- control flow ----
                crate::lua_vm::OpCode::Jmp => {
                    pc = (pc as i64 + get_sj!(inst) as i64) as usize;
                }
                crate::lua_vm::OpCode::Eq => {
                    let (a, b) = (reg!(get_a!(inst)), reg!(get_b!(inst)));
                    let cond = protect!(compare::value_eq(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::Lt => {
                    let (a, b) = (reg!(get_a!(inst)), reg!(get_b!(inst)));
                    let cond = protect!(compare::value_lt(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::Le => {
                    let (a, b) = (reg!(get_a!(inst)), reg!(get_b!(inst)));
                    let cond = protect!(compare::value_le(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::EqK => {
                    let a = reg!(get_a!(inst));
                    let b = kst!(get_b!(inst));
                    let cond = compare::raw_eq(s, &a, &b);
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::EqI => {
                    let a = reg!(get_a!(inst));
                    let b = LuaValue::integer(get_sb!(inst) as i64);
                    let cond = protect!(compare::value_eq(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::LtI => {
                    let a = reg!(get_a!(inst));
                    let b = LuaValue::integer(get_sb!(inst) as i64);
                    let cond = protect!(compare::value_lt(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::LeI => {
                    let a = reg!(get_a!(inst));
                    let b = LuaValue::integer(get_sb!(inst) as i64);
                    let cond = protect!(compare::value_le(s, &a, &b));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::GtI => {
                    let a = reg!(get_a!(inst));
                    let b = LuaValue::integer(get_sb!(inst) as i64);
                    let cond = protect!(compare::value_lt(s, &b, &a));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::GeI => {
                    let a = reg!(get_a!(inst));
                    let b = LuaValue::integer(get_sb!(inst) as i64);
                    let cond = protect!(compare::value_le(s, &b, &a));
                    if cond != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::Test => {
                    let a = reg!(get_a!(inst));
                    if a.is_truthy() != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::TestSet => {
                    let b = reg!(get_b!(inst));
                    if b.is_truthy() == get_k!(inst) {
                        set_reg!(get_a!(inst), b);
                    } else {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::TestNil => {
                    let a = reg!(get_a!(inst));
                    if a.is_nil() != get_k!(inst) {
                        pc += 1;
                    }
                }
                crate::lua_vm::OpCode::Case => {
                    let a = reg!(get_a!(inst));
                    let k = kst!(get_bx!(inst));
                    if !compare::raw_eq(s, &a, &k) {
                        pc += 1;
                    }
                }

                // ---- calls ----
                crate::lua_vm::OpCode::Call => {
                    let a = get_a!(inst);
                    let b = get_b!(inst);
                    let c = get_c!(inst);
                    let func_pos = base + a;
                    if b != 0 {
                        s.set_top(func_pos + b);
                    }
                    let nresults = c as i32 - 1;
                    s.frame_mut(depth).pc = pc as u32;
                    match protect!(call::precall(s, func_pos, nresults)) {
                        PreCall::Lua => continue 'startfunc,
                        PreCall::Done => {}
                    }
                }
                crate::lua_vm::OpCode::TailCall => {
                    let a = get_a!(inst);
                    let b = get_b!(inst);
                    let func_pos = base + a;
                    if b != 0 {
                        s.set_top(func_pos + b);
                    }
                    let nargs = s.top() - func_pos - 1;

                    protect!(call::close_scopes(s, base, None));

                    // reuse the caller's frame slot: move callee + args down
                    let mut dest = s.frame(depth).func_pos;
                    if proto.is_vararg {
                        let f = s.frame(depth);
                        dest = f.func_pos
                            - (f.nextraargs as usize)
                            - proto.numparams as usize
                            - 1;
                    }
                    for i in 0..=nargs {
                        let v = s.get(func_pos + i);
                        s.set(dest + i, v);
                    }
                    s.set_top(dest + nargs + 1);
                    let nresults = s.frame(depth).nresults;
                    s.pop_frame();
                    match protect!(call::precall(s, dest, nresults)) {
                        PreCall::Lua => {
                            if let Some(f) = s.current_frame_mut() {
                                f.call_status |= call_status::CIST_TAIL;
                            }
                            continue 'startfunc;
                        }
                        PreCall::Done => continue 'startfunc,
                    }
                }
                crate::lua_vm::OpCode::Return => {
                    let a = get_a!(inst);
                    let b = get_b!(inst);
                    let nres = if b == 0 {
                        s.top() - (base + a)
                    } else {
                        b - 1
                    };
                    if proto.is_vararg {
                        let f = s.frame_mut(depth);
                        f.func_pos -=
                            (f.nextraargs as usize) + proto.numparams as usize + 1;
                    }
                    protect!(call::poscall(s, depth, base + a, nres));
                    continue 'startfunc;
                }
                crate::lua_vm::OpCode::Return0 => {
                    if proto.is_vararg {
                        let f = s.frame_mut(depth);
                        f.func_pos -=
                            (f.nextraargs as usize) + proto.numparams as usize + 1;
                    }
                    protect!(call::poscall(s, depth, base, 0));
                    continue 'startfunc;
                }
                crate::lua_vm::OpCode::Return1 => {
                    let a = get_a!(inst);
                    if proto.is_vararg {
                        let f = s.frame_mut(depth);
                        f.func_pos -=
                            (f.nextraargs as usize) + proto.numparams as usize + 1;
                    }
                    protect!(call::poscall(s, depth, base + a, 1));
                    continue 'startfunc;
                }

                // ---- loops ----
                crate::lua_vm::OpCode::ForPrep => {
                    let a = get_a!(inst);
                    let bx = get_bx!(inst);
                    match protect!(for_prep(s, base + a)) {
                        true => {}            // loop body runs
                        false => pc += bx + 1, // zero-trip: skip body and FORLOOP
                    }
                }
                crate::lua_vm::OpCode::ForLoop => {
                    let a = get_a!(inst);
                    let bx = get_bx!(inst);
                    if protect!(for_loop(s, base + a)) {
                        pc -= bx;
                    }
                }
                crate::lua_vm::OpCode::TForPrep => {
                    let a = get_a!(inst);
                    let bx = get_bx!(inst);
                    // the closing value participates in scope exit
                    let closing = reg!(a + 3);
                    if !closing.is_nil() && closing.as_boolean() != Some(false) {
                        protect!(s.tbc_push(base + a + 3));
                    }
                    pc += bx;
                }
                crate::lua_vm::OpCode::TForCall => {
                    let a = get_a!(inst);
                    let c = get_c!(inst);
                    let f = reg!(a);
                    let state_v = reg!(a + 1);
                    let control = reg!(a + 2);
                    let mv = protect!(metamethod::call_value_internal(
                        s,
                        f,
                        &[state_v, control],
                        c.max(1)
                    ));
                    for i in 0..c {
                        set_reg!(a + 4 + i, mv.get(i));
                    }
                }
                crate::lua_vm::OpCode::TForLoop => {
                    let a = get_a!(inst);
                    let bx = get_bx!(inst);
                    let first = reg!(a + 4);
                    if !first.is_nil() {
                        set_reg!(a + 2, first);
                        pc -= bx;
                    }
                }

                // ---- closures and varargs ----
                crate::lua_vm::OpCode::SetList => {
                    let a = get_a!(inst);
                    let b = get_b!(inst);
                    let mut start = get_c!(inst) as i64;
                    if get_k!(inst)
                        && pc < proto.code.len()
                        && get_op!(proto.code[pc]) == crate::lua_vm::OpCode::ExtraArg
                    {
                        start += get_ax!(proto.code[pc]) as i64 * 256;
                        pc += 1;
                    }
                    let n = if b == 0 {
                        s.top() - (base + a) - 1
                    } else {
                        b
                    };
                    let t = reg!(a);
                    let Some(tid) = t.as_table_id() else {
                        let e = s
                            .vm()
                            .raise_plain(LuaError::TypeError, "SETLIST target is not a table");
                        s.frame_mut(depth).pc = pc as u32;
                        return Err(e);
                    };
                    for i in 1..=n {
                        let v = reg!(a + i);
                        s.vm().raw_set_int(tid, start + i as i64, v);
                    }
                }
                crate::lua_vm::OpCode::Closure => {
                    let a = get_a!(inst);
                    let bx = get_bx!(inst);
                    let child = proto.protos[bx].clone();
                    let mut upvals = Vec::with_capacity(child.upvalue_descs.len());
                    for desc in &child.upvalue_descs {
                        if desc.instack {
                            upvals.push(s.find_upvalue(base + desc.idx as usize));
                        } else {
                            match closure_upvalue_id(s, fid, desc.idx as usize) {
                                Some(id) => upvals.push(id),
                                None => {
                                    let id = s
                                        .vm()
                                        .alloc_upvalue(UpvalueState::Closed(LuaValue::nil()));
                                    upvals.push(id);
                                }
                            }
                        }
                    }
                    let new_fid = s.vm().alloc_lua_closure(child, upvals);
                    let v = s.vm().closure_value(new_fid);
                    set_reg!(a, v);
                    s.vm().maybe_gc(Some(&*s));
                }
                crate::lua_vm::OpCode::Vararg => {
                    let a = get_a!(inst);
                    let c = get_c!(inst);
                    let frame = *s.frame(depth);
                    let nextra = frame.nextraargs as usize;
                    let vararg_base = frame.func_pos - nextra;
                    if c == 0 {
                        protect!(s.ensure_stack(base + a + nextra + 1));
                        for i in 0..nextra {
                            let v = s.get(vararg_base + i);
                            s.set(base + a + i, v);
                        }
                        s.set_top(base + a + nextra);
                    } else {
                        let want = c - 1;
                        for i in 0..want {
                            let v = if i < nextra {
                                s.get(vararg_base + i)
                            } else {
                                LuaValue::nil()
                            };
                            set_reg!(a + i, v);
                        }
                    }
                }
                crate::lua_vm::OpCode::VarargPrep => {
                    let numparams = get_a!(inst);
                    let frame = *s.frame(depth);
                    let actual = s.top() - frame.base;
                    let nextra = actual.saturating_sub(numparams);
                    let new_func = frame.base + actual;
                    protect!(s.ensure_stack(new_func + 1 + proto.maxstacksize as usize));
                    s.set(new_func, frame.func);
                    for i in 0..numparams {
                        let v = s.get(frame.base + i);
                        s.set(new_func + 1 + i, v);
                        s.set(frame.base + i, LuaValue::nil());
                    }
                    let f = s.frame_mut(depth);
                    f.func_pos = new_func;
                    f.base = new_func + 1;
                    f.top = f.base + proto.maxstacksize as usize;
                    f.nextraargs = nextra as i32;
                    base = new_func + 1;
                    s.set_top(base + proto.maxstacksize as usize);
                }
                crate::lua_vm::OpCode::ExtraArg => {
                    // operand of a preceding instruction; nothing on its own
                }

                // ---- class family ----
                crate::lua_vm::OpCode::NewClass => {
                    let name = kst!(get_b!(inst));
                    let v = protect!(class_ops::new_class(s, name));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::Inherit => {
                    let class = reg!(get_a!(inst));
                    let parent = reg!(get_b!(inst));
                    protect!(class_ops::inherit(s, class, parent));
                }
                crate::lua_vm::OpCode::SetMethod => {
                    let target = reg!(get_a!(inst));
                    let name = kst!(get_b!(inst));
                    let v = reg!(get_c!(inst));
                    protect!(class_ops::set_method(s, target, name, v));
                }
                crate::lua_vm::OpCode::SetStatic => {
                    let target = reg!(get_a!(inst));
                    let name = kst!(get_b!(inst));
                    let v = reg!(get_c!(inst));
                    protect!(class_ops::set_static(s, target, name, v));
                }
                crate::lua_vm::OpCode::NewObj => {
                    let a = get_a!(inst);
                    let class = reg!(get_b!(inst));
                    let nargs = get_c!(inst);
                    let args: Vec<LuaValue> =
                        (0..nargs).map(|i| reg!(get_b!(inst) + 1 + i)).collect();
                    let obj = protect!(class_ops::new_obj(s, class, &args));
                    set_reg!(a, obj);
                }
                crate::lua_vm::OpCode::GetProp => {
                    let obj = reg!(get_b!(inst));
                    let name = kst!(get_c!(inst));
                    let v = protect!(class_ops::get_prop(s, obj, name));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::SetProp => {
                    let obj = reg!(get_a!(inst));
                    let name = kst!(get_b!(inst));
                    let v = reg!(get_c!(inst));
                    protect!(class_ops::set_prop(s, obj, name, v));
                }
                crate::lua_vm::OpCode::InstanceOf => {
                    let obj = reg!(get_b!(inst));
                    let class = reg!(get_c!(inst));
                    let r = protect!(class_ops::instance_of(s, &obj, &class));
                    set_reg!(get_a!(inst), LuaValue::boolean(r));
                }
                crate::lua_vm::OpCode::Implement => {
                    let class = reg!(get_a!(inst));
                    let concept = reg!(get_b!(inst));
                    protect!(class_ops::implement(s, class, concept));
                }
                crate::lua_vm::OpCode::GetSuper => {
                    let obj = reg!(get_b!(inst));
                    let v = protect!(class_ops::get_super(s, &obj));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::AddMethod => {
                    let target = reg!(get_a!(inst));
                    let name = kst!(get_b!(inst));
                    let v = reg!(get_c!(inst));
                    protect!(class_ops::add_method(s, target, name, v));
                }
                crate::lua_vm::OpCode::NewConcept => {
                    let name = kst!(get_b!(inst));
                    let v = protect!(class_ops::new_concept(s, name));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::NewNamespace => {
                    let name = kst!(get_b!(inst));
                    let v = protect!(class_ops::new_namespace(s, name));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::LinkNamespace => {
                    let parent = reg!(get_a!(inst));
                    let child = reg!(get_b!(inst));
                    protect!(class_ops::link_namespace(s, parent, child));
                }
                crate::lua_vm::OpCode::SetIfaceFlag => {
                    let target = reg!(get_a!(inst));
                    let bit = get_b!(inst) as u32;
                    protect!(class_ops::set_iface_flag(s, target, bit));
                }

                // ---- extras ----
                crate::lua_vm::OpCode::Spaceship => {
                    let (b, c) = (reg!(get_b!(inst)), reg!(get_c!(inst)));
                    let v = protect!(compare::spaceship(s, &b, &c));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::In => {
                    let (b, c) = (reg!(get_b!(inst)), reg!(get_c!(inst)));
                    let r = protect!(compare::contains(s, &b, &c));
                    set_reg!(get_a!(inst), LuaValue::boolean(r));
                }
                crate::lua_vm::OpCode::Slice => {
                    let obj = reg!(get_b!(inst));
                    let c = get_c!(inst);
                    let from = reg!(c);
                    let to = reg!(c + 1);
                    let v = protect!(table_ops::slice_value(s, obj, from, to));
                    set_reg!(get_a!(inst), v);
                }
                crate::lua_vm::OpCode::Is => {
                    let b = reg!(get_b!(inst));
                    let name = kst!(get_c!(inst));
                    let matches = s
                        .vm()
                        .value_str(&name)
                        .map(|n| n == b.type_name().as_bytes())
                        .unwrap_or(false);
                    set_reg!(get_a!(inst), LuaValue::boolean(matches));
                }
                crate::lua_vm::OpCode::ErrNNil => {
                    let a = reg!(get_a!(inst));
                    if a.is_nil() {
                        let e = s
                            .vm()
                            .raise_plain(LuaError::TypeError, "value must not be nil");
                        s.frame_mut(depth).pc = pc as u32;
                        return Err(e);
                    }
                }
                crate::lua_vm::OpCode::Nop => {}
            }
        }
    }
}

/// Numeric for-loop setup. Returns false when the loop runs zero times.
fn for_prep(s: &mut LuaState, a: usize) -> LuaResult<bool> {
    let init = s.get(a);
    let limit = s.get(a + 1);
    let step = s.get(a + 2);

    if let (Some(i0), Some(l), Some(st)) =
        (init.as_integer(), limit.as_integer(), step.as_integer())
    {
        if st == 0 {
            return Err(s
                .vm()
                .raise_plain(LuaError::InvalidOperand, "'for' step is zero"));
        }
        if (st > 0 && i0 > l) || (st < 0 && i0 < l) {
            return Ok(false);
        }
        s.set(a + 3, LuaValue::integer(i0));
        return Ok(true);
    }

    // float loop; reject non-numbers
    let Some(fi) = s.vm().coerce_number(&init).and_then(|v| v.number_value()) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "'for' initial value must be a number"));
    };
    let Some(fl) = s.vm().coerce_number(&limit).and_then(|v| v.number_value()) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "'for' limit must be a number"));
    };
    let Some(fs) = s.vm().coerce_number(&step).and_then(|v| v.number_value()) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "'for' step must be a number"));
    };
    if fs == 0.0 {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "'for' step is zero"));
    }
    if (fs > 0.0 && fi > fl) || (fs < 0.0 && fi < fl) {
        return Ok(false);
    }
    s.set(a, LuaValue::float(fi));
    s.set(a + 1, LuaValue::float(fl));
    s.set(a + 2, LuaValue::float(fs));
    s.set(a + 3, LuaValue::float(fi));
    Ok(true)
}

/// Numeric for-loop step. Returns true to run another iteration.
fn for_loop(s: &mut LuaState, a: usize) -> LuaResult<bool> {
    let counter = s.get(a);
    let limit = s.get(a + 1);
    let step = s.get(a + 2);

    if let (Some(c), Some(l), Some(st)) =
        (counter.as_integer(), limit.as_integer(), step.as_integer())
    {
        let Some(next) = c.checked_add(st) else {
            return Ok(false); // counter would wrap past the limit
        };
        if (st > 0 && next > l) || (st < 0 && next < l) {
            return Ok(false);
        }
        s.set(a, LuaValue::integer(next));
        s.set(a + 3, LuaValue::integer(next));
        return Ok(true);
    }

    let (Some(c), Some(l), Some(st)) = (
        counter.number_value(),
        limit.number_value(),
        step.number_value(),
    ) else {
        return Err(s
            .vm()
            .raise_plain(LuaError::InvalidOperand, "'for' loop became non-numeric"));
    };
    let next = c + st;
    if (st > 0.0 && next > l) || (st < 0.0 && next < l) {
        return Ok(false);
    }
    s.set(a, LuaValue::float(next));
    s.set(a + 3, LuaValue::float(next));
    Ok(true)
}
