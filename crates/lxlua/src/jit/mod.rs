// Per-prototype native-code backend.
//
// On function entry the dispatcher consults the prototype's code slot; if
// native code exists, it takes over until it returns or hits a barrier (an
// opcode it does not emit), at which point the saved pc in the CallInfo
// names the instruction the interpreter resumes from.
//
// Three sibling backends, selected by target architecture: x86-64
// (System V), arm64 (AAPCS64), and a stub that compiles nothing. Emission
// failure is never fatal: the slot stays empty and the interpreter runs.

pub mod runtime;

#[cfg(all(target_arch = "x86_64", unix))]
mod emit_x64;
#[cfg(all(target_arch = "aarch64", unix))]
mod emit_arm64;
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix)))]
mod emit_stub;

#[cfg(all(target_arch = "x86_64", unix))]
use emit_x64 as emitter;
#[cfg(all(target_arch = "aarch64", unix))]
use emit_arm64 as emitter;
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix)))]
use emit_stub as emitter;

use std::rc::Rc;

use crate::lua_value::{JitSlot, Proto};
use crate::lua_vm::{LuaError, LuaResult, LuaState};
use runtime::JitContext;

pub const JIT_PAGE_SIZE: usize = 4096;

/// Outcome of a native-code attempt on a fresh frame.
pub enum JitOutcome {
    /// No native code for this prototype (and none could be emitted).
    NotCompiled,
    /// Native code ran the whole frame; it has been popped.
    Returned,
    /// Native code bailed out; the saved pc points at the next opcode.
    Barrier,
}

/// Native entry signature: receives the context, returns 0 = barrier,
/// 1 = frame returned, 2 = error raised.
pub type JitEntry = unsafe extern "C" fn(*mut JitContext) -> u32;

// ---- executable memory ----

#[cfg(unix)]
pub fn alloc_exec(size: usize) -> Option<JitSlot> {
    let size = size.max(JIT_PAGE_SIZE).next_multiple_of(JIT_PAGE_SIZE);
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    Some(JitSlot { code: ptr as *mut u8, size })
}

#[cfg(not(unix))]
pub fn alloc_exec(_size: usize) -> Option<JitSlot> {
    None
}

/// Release a prototype's pages; called from `Proto::drop`.
#[cfg(unix)]
pub fn free_exec(slot: JitSlot) {
    if slot.is_set() {
        unsafe {
            libc::munmap(slot.code as *mut libc::c_void, slot.size);
        }
    }
}

#[cfg(not(unix))]
pub fn free_exec(_slot: JitSlot) {}

// ---- compilation ----

/// Compile `proto` if the backend can, filling its code slot. Safe to call
/// repeatedly; already-compiled and uncompilable prototypes are cheap
/// no-ops.
pub fn compile(proto: &Rc<Proto>) {
    if proto.jit.get().is_set() || proto.code.is_empty() {
        return;
    }
    let Some(buf) = emitter::emit(proto) else {
        return;
    };
    let Some(slot) = alloc_exec(buf.len()) else {
        return; // no executable memory: interpreter handles everything
    };
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), slot.code, buf.len());
    }
    proto.jit.set(slot);
}

/// Dispatcher hook: run the frame at `depth` natively when possible. A
/// native error comes back as the Err it would have been under the
/// interpreter.
pub fn try_enter(s: &mut LuaState, depth: usize, proto: &Rc<Proto>) -> LuaResult<JitOutcome> {
    compile(proto);
    let slot = proto.jit.get();
    if !slot.is_set() {
        return Ok(JitOutcome::NotCompiled);
    }

    let base = s.frame(depth).base;
    let mut ctx = JitContext::new(s, depth, base, proto);
    let entry: JitEntry = unsafe { std::mem::transmute(slot.code) };
    let code = unsafe { entry(&mut ctx) };
    match code {
        1 => Ok(JitOutcome::Returned),
        2 => Err(code_to_error(ctx.error_code)),
        _ => Ok(JitOutcome::Barrier),
    }
}

/// Map error kinds across the C ABI boundary.
pub(crate) fn error_to_code(e: LuaError) -> u32 {
    e as u32 + 1
}

pub(crate) fn code_to_error(c: u32) -> LuaError {
    use LuaError::*;
    const ALL: &[LuaError] = &[
        TypeError,
        ArithmeticError,
        Overflow,
        InvalidOperand,
        IndexError,
        StackOverflow,
        TooManyCalls,
        OutOfMemory,
        SyntaxError,
        DumpError,
        IOError,
        PatternError,
        CoroutineError,
        AssertFailure,
        UserError,
        Yield,
        CloseThread,
    ];
    ALL.get((c as usize).wrapping_sub(1))
        .copied()
        .unwrap_or(LuaError::TypeError)
}

