// Coroutines: cooperative transfer between thread states.
//
// A yield unwinds the interpreter with the Yield control kind; the
// thread's frame chain stays intact, so the next resume re-enters the
// interpreter at the saved program counters. Yields may not cross a
// non-yieldable reentry (metamethods, protected calls, hooks) and raise
// CoroutineError there instead.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::call::{self, MULTRET, PreCall};
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::{
    LuaError, LuaResult, LuaState, LuaVM, ResumeResult, ThreadStatus,
};

/// Resume `thread` with `args`. Returns the values the coroutine yielded
/// or returned; errors inside the coroutine surface as `(Err, dead)`.
pub fn vm_resume(vm: &mut LuaVM, thread: LuaValue, args: &[LuaValue]) -> LuaResult<ResumeResult> {
    let Some(tid) = thread.as_thread_id() else {
        return Err(vm.raise_plain(LuaError::TypeError, "cannot resume a non-thread value"));
    };

    let Some(status) = vm.pool.get_thread(tid).map(|t| t.state.status) else {
        return Err(vm.raise_plain(LuaError::CoroutineError, "cannot resume dead coroutine"));
    };
    match status {
        ThreadStatus::Dead => {
            return Err(vm.raise_plain(LuaError::CoroutineError, "cannot resume dead coroutine"));
        }
        ThreadStatus::Running | ThreadStatus::Normal => {
            return Err(vm.raise_plain(
                LuaError::CoroutineError,
                "cannot resume non-suspended coroutine",
            ));
        }
        ThreadStatus::Suspended => {}
    }

    let vm_ptr = vm as *mut LuaVM;
    let Some(state_ptr) = vm.pool.thread_state_ptr(tid) else {
        return Err(vm.raise_plain(LuaError::CoroutineError, "cannot resume dead coroutine"));
    };
    let s = unsafe { &mut *state_ptr };
    s.set_vm(vm_ptr);

    // the resumer goes Normal until this thread comes back
    if let Some(&outer) = vm.thread_chain.last() {
        if let Some(t) = vm.pool.threads.get_mut(outer.0) {
            t.state.status = ThreadStatus::Normal;
        }
    } else {
        vm.main.status = ThreadStatus::Normal;
    }
    vm.thread_chain.push(tid);
    s.status = ThreadStatus::Running;

    let first_resume = !s.started;
    s.started = true;
    let run = |s: &mut LuaState| -> LuaResult<()> {
        if first_resume {
            // slot 0 holds the coroutine body
            for (i, &a) in args.iter().enumerate() {
                s.set(1 + i, a);
            }
            s.set_top(1 + args.len());
            match call::precall(s, 0, MULTRET)? {
                PreCall::Lua => lua_execute(s, 0),
                PreCall::Done => Ok(()),
            }
        } else {
            // deliver the resume arguments as the results of the yield call
            let pos = s.yield_result_pos;
            let nresults = s.yield_nresults;
            s.ensure_stack(pos + args.len() + 1)?;
            for (i, &a) in args.iter().enumerate() {
                s.set(pos + i, a);
            }
            call::finish_transfer(s, pos, args.len(), nresults);
            lua_execute(s, 0)
        }
    };

    let result = run(s);

    // restore the chain
    vm.thread_chain.pop();
    if let Some(&outer) = vm.thread_chain.last() {
        if let Some(t) = vm.pool.threads.get_mut(outer.0) {
            t.state.status = ThreadStatus::Running;
        }
    } else {
        vm.main.status = ThreadStatus::Running;
    }

    match result {
        Ok(()) => {
            // finished: collect what the body left on the stack
            let out: Vec<LuaValue> = (0..s.top()).map(|i| s.get(i)).collect();
            s.reset();
            Ok(ResumeResult::Returned(out))
        }
        Err(LuaError::Yield) => {
            s.status = ThreadStatus::Suspended;
            let values = std::mem::take(&mut s.transfer_values);
            Ok(ResumeResult::Yielded(values))
        }
        Err(e) => {
            // the body died; pending scopes close with the error in hand
            let err_obj = vm.error_object();
            let _ = call::close_scopes(s, 0, Some(err_obj));
            s.reset();
            Err(e)
        }
    }
}

/// Yield from a C function running on the current thread. The caller must
/// return the resulting error straight to the interpreter.
pub fn do_yield(s: &mut LuaState, values: Vec<LuaValue>) -> LuaError {
    if s.is_main {
        return s
            .vm()
            .raise_plain(LuaError::CoroutineError, "attempt to yield from outside a coroutine");
    }
    if !s.is_yieldable() {
        return s.vm().raise_plain(
            LuaError::CoroutineError,
            "attempt to yield across a non-yieldable boundary",
        );
    }
    s.transfer_values = values;
    LuaError::Yield
}

/// Reset a coroutine: run its pending __close handlers with an error
/// status, reclaim the stack, mark it dead.
pub fn vm_close_thread(vm: &mut LuaVM, thread: LuaValue) -> LuaResult<()> {
    let Some(tid) = thread.as_thread_id() else {
        return Err(vm.raise_plain(LuaError::TypeError, "cannot close a non-thread value"));
    };
    if vm.thread_chain.contains(&tid) {
        return Err(vm.raise_plain(LuaError::CoroutineError, "cannot close a running coroutine"));
    }
    let vm_ptr = vm as *mut LuaVM;
    let Some(state_ptr) = vm.pool.thread_state_ptr(tid) else {
        return Ok(());
    };
    let s = unsafe { &mut *state_ptr };
    s.set_vm(vm_ptr);

    let err_obj = vm.intern_str("coroutine closed");
    let close_result = call::close_scopes(s, 0, Some(err_obj));
    s.reset();
    close_result
}
