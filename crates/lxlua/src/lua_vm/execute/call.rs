// Call and return paths: frame preparation for Lua and C callees, result
// copy-back, protected calls, tail calls, and scope closing (open upvalues
// plus the to-be-closed list).

use crate::lua_value::{LuaValue, MultiValue};
use crate::lua_vm::call_info::{CallInfo, call_status};
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::execute::metamethod;
use crate::lua_vm::lua_state::EXTRA_STACK;
use crate::lua_vm::{LuaError, LuaResult, LuaState, LuaVM, TmKind, suspended_marker};
use crate::gc::ClosureKind;

pub const MULTRET: i32 = -1;

/// What precall decided to do with the callee.
pub enum PreCall {
    /// A Lua frame was pushed; the interpreter should enter it.
    Lua,
    /// The call completed in place (C function, queued sleeping call, or
    /// __call chain that ended in one).
    Done,
}

/// Resolve `__call` chains: a non-function callee with a __call metamethod
/// is re-invoked with itself inserted as first argument.
fn resolve_callable(s: &mut LuaState, func_pos: usize) -> LuaResult<()> {
    let mut hops = 0;
    while !s.get(func_pos).is_function() {
        let callee = s.get(func_pos);
        let vm = s.vm();
        let tm = vm.get_metamethod(&callee, TmKind::Call);
        if tm.is_nil() {
            let msg = format!("attempt to call a {} value", callee.type_name());
            return Err(s.vm().raise_plain(LuaError::TypeError, msg));
        }
        hops += 1;
        if hops > 8 {
            return Err(s.vm().raise_plain(LuaError::TooManyCalls, "'__call' chain too long"));
        }
        // shift arguments up one slot and insert the metamethod
        let top = s.top();
        s.ensure_stack(top + 1)?;
        let mut i = top;
        while i > func_pos {
            let v = s.get(i - 1);
            s.set(i, v);
            i -= 1;
        }
        s.set(func_pos, tm);
        s.set_top(top + 1);
    }
    Ok(())
}

/// Prepare a call to the value at `func_pos` with `nargs` arguments right
/// above it. Returns whether a Lua frame was entered.
pub fn precall(s: &mut LuaState, func_pos: usize, nresults: i32) -> LuaResult<PreCall> {
    resolve_callable(s, func_pos)?;
    let func = s.get(func_pos);

    if let Some(fid) = func.as_function_id() {
        let vm = s.vm();
        let Some(gcf) = vm.pool.get_function(fid) else {
            return Err(s.vm().raise_plain(LuaError::TypeError, "dead function object"));
        };
        match &gcf.kind {
            ClosureKind::Lua { proto, .. } => {
                let proto = proto.clone();

                // sleeping prototypes queue the call and return the marker
                if proto.is_sleeping() {
                    let nargs = s.top() - func_pos - 1;
                    let args: Vec<LuaValue> =
                        (0..nargs).map(|i| s.get(func_pos + 1 + i)).collect();
                    proto.queue_call(args);
                    s.set(func_pos, suspended_marker());
                    finish_transfer(s, func_pos, 1, nresults);
                    return Ok(PreCall::Done);
                }

                let nargs = s.top() - func_pos - 1;
                let numparams = proto.numparams as usize;
                let base = func_pos + 1;

                // missing parameters read as nil
                s.ensure_stack(base + proto.maxstacksize as usize + EXTRA_STACK)?;
                for i in nargs..numparams {
                    s.set(base + i, LuaValue::nil());
                }
                if !proto.is_vararg {
                    s.set_top(base + proto.maxstacksize as usize);
                    // extra arguments beyond numparams are simply ignored by
                    // the register window
                } else {
                    s.set_top(base + nargs.max(numparams));
                }

                let frame = CallInfo {
                    func,
                    func_pos,
                    base,
                    top: base + proto.maxstacksize as usize,
                    pc: 0,
                    nresults,
                    call_status: call_status::CIST_LUA,
                    nextraargs: 0,
                    transfer_start: 0,
                    transfer_count: nargs as u32,
                };
                s.push_frame(frame)?;
                Ok(PreCall::Lua)
            }
            ClosureKind::C { f, .. } => {
                let f = *f;
                call_c_function(s, f, func, func_pos, nresults)?;
                Ok(PreCall::Done)
            }
        }
    } else if let Some(f) = func.as_cfunction() {
        call_c_function(s, f, func, func_pos, nresults)?;
        Ok(PreCall::Done)
    } else {
        let msg = format!("attempt to call a {} value", func.type_name());
        Err(s.vm().raise_plain(LuaError::TypeError, msg))
    }
}

fn call_c_function(
    s: &mut LuaState,
    f: crate::lua_vm::CFunction,
    func: LuaValue,
    func_pos: usize,
    nresults: i32,
) -> LuaResult<()> {
    s.enter_c_call()?;
    let nargs = s.top() - func_pos - 1;
    let frame = CallInfo {
        func,
        func_pos,
        base: func_pos + 1,
        top: s.top(),
        pc: 0,
        nresults,
        call_status: call_status::CIST_C,
        nextraargs: 0,
        transfer_start: 0,
        transfer_count: nargs as u32,
    };
    s.push_frame(frame)?;
    let result = f(s);
    s.pop_frame();
    s.leave_c_call();
    let mv = match result {
        Ok(mv) => mv,
        Err(LuaError::Yield) => {
            // the next resume writes its arguments where this call's
            // results belong
            s.yield_result_pos = func_pos;
            s.yield_nresults = nresults;
            return Err(LuaError::Yield);
        }
        Err(e) => return Err(e),
    };

    // copy results down over the function slot
    let n = mv.len();
    s.ensure_stack(func_pos + n + EXTRA_STACK)?;
    for i in 0..n {
        s.set(func_pos + i, mv.get(i));
    }
    finish_transfer(s, func_pos, n, nresults);
    Ok(())
}

/// Adjust the stack after a call completed with `n` results sitting at
/// `func_pos..`.
pub fn finish_transfer(s: &mut LuaState, func_pos: usize, n: usize, nresults: i32) {
    if nresults == MULTRET {
        s.set_top(func_pos + n);
    } else {
        let want = nresults as usize;
        for i in n..want {
            s.set(func_pos + i, LuaValue::nil());
        }
        s.set_top(func_pos + want);
    }
}

/// Return from the Lua frame at `depth`: close scopes, move results down,
/// pop the frame. `first` is the stack index of the first result and
/// `nres` how many there are.
pub fn poscall(s: &mut LuaState, depth: usize, first: usize, nres: usize) -> LuaResult<()> {
    let frame = *s.frame(depth);

    if s.hook_mask & crate::lua_vm::hook_mask::MASK_RET != 0 && !s.in_hook {
        super::deliver_hook(s, depth, crate::lua_vm::HookEvent::Return, 0);
    }

    // scope exits, error-free path
    close_scopes(s, frame.base, None)?;

    let func_pos = frame.func_pos;
    for i in 0..nres {
        let v = s.get(first + i);
        s.set(func_pos + i, v);
    }
    finish_transfer(s, func_pos, nres, frame.nresults);
    s.pop_frame();
    Ok(())
}

/// Close upvalues and run pending `__close` handlers for every slot at or
/// above `level`. `error_object` is Some on the error path and is passed
/// as the second argument to each `__close`.
pub fn close_scopes(s: &mut LuaState, level: usize, error_object: Option<LuaValue>) -> LuaResult<()> {
    s.close_upvalues(level);

    // TBC entries leave in LIFO order, error paths included
    while let Some(slot) = s.tbc_pop_above(level) {
        let value = s.get(slot);
        if value.is_nil() || value.as_boolean() == Some(false) {
            continue;
        }
        let vm = s.vm();
        let close_fn = vm.get_metamethod(&value, TmKind::Close);
        if close_fn.is_nil() {
            let msg = format!("variable of type {} has no '__close' metamethod", value.type_name());
            return Err(vm.raise_plain(LuaError::TypeError, msg));
        }
        let err_arg = error_object.unwrap_or_else(LuaValue::nil);
        // a __close that errors replaces the original error
        metamethod::call_value_internal(s, close_fn, &[value, err_arg], 1)?;
    }
    Ok(())
}

/// Entry point for unprotected calls from the embedding surface. Errors
/// reach the panic handler, then the stack is put back in order so the
/// state stays usable.
pub fn vm_call(vm: &mut LuaVM, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
    let s: *mut LuaState = &mut *vm.main as *mut LuaState;
    let s = unsafe { &mut *s };
    let saved_top = s.top();
    let saved_depth = s.call_depth();
    match do_call_on(s, f, args) {
        Ok(mv) => Ok(mv),
        Err(e) => {
            if !e.is_control_flow() {
                s.vm().panic();
                let err_obj = s.vm().error_object();
                let _ = close_scopes(s, saved_top, Some(err_obj));
                while s.call_depth() > saved_depth {
                    s.pop_frame();
                }
                s.set_top(saved_top);
            }
            Err(e)
        }
    }
}

/// Push f + args on this state's stack, run to completion, collect results.
pub fn do_call_on(s: &mut LuaState, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
    let func_pos = s.top();
    s.push(f)?;
    for &a in args {
        s.push(a)?;
    }
    let depth = s.call_depth();
    match precall(s, func_pos, MULTRET)? {
        PreCall::Lua => lua_execute(s, depth)?,
        PreCall::Done => {}
    }
    let n = s.top().saturating_sub(func_pos);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(s.get(func_pos + i));
    }
    s.set_top(func_pos);
    Ok(MultiValue::from_vec(out))
}

/// Protected call from the embedding surface: captures runtime errors,
/// restores the stack window, and leaves the error retrievable on the VM.
pub fn vm_pcall(vm: &mut LuaVM, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
    let s: *mut LuaState = &mut *vm.main as *mut LuaState;
    let s = unsafe { &mut *s };
    pcall_on(s, f, args)
}

pub fn pcall_on(s: &mut LuaState, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
    let saved_top = s.top();
    let saved_depth = s.call_depth();
    if let Some(frame) = s.current_frame_mut() {
        frame.call_status |= call_status::CIST_PROTECTED;
    }
    s.mark_frame_no_yield();
    let result = do_call_on(s, f, args);
    s.clear_frame_no_yield();
    match result {
        Ok(mv) => Ok(mv),
        Err(e) if e.is_control_flow() => Err(e),
        Err(e) => {
            // unwind: close traversed scopes with the error object, then
            // restore the frame chain and stack window
            let err_obj = s.vm().error_object();
            let close_result = close_scopes(s, saved_top, Some(err_obj));
            while s.call_depth() > saved_depth {
                s.pop_frame();
            }
            s.set_top(saved_top);
            match close_result {
                // an erroring __close replaces the original error
                Err(close_err) => Err(close_err),
                Ok(()) => Err(e),
            }
        }
    }
}
