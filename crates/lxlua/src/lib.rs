// LXLUA runtime core
// Register-based bytecode VM with incremental/generational GC, a native
// code backend, a protected dump format, hot-patching, and a line-hook
// debug controller.

#[cfg(test)]
mod test;

pub mod auxlib;
pub mod debug;
pub mod dump;
pub mod gc;
pub mod jit;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;

pub use auxlib::{FileReader, LuaBuffer, StringReader};
pub use dump::{DumpOptions, ObfFlags};
pub use gc::{GcKind, ObjectPool};
pub use lib_registry::{LibEntry, LibraryRegistry};
pub use lua_value::{LuaStr, LuaTable, LuaValue, LuaValueKind, MultiValue, Proto};
pub use lua_vm::{
    CFunction, Instruction, LuaError, LuaResult, LuaRuntimeError, LuaState, LuaVM, OpCode,
    ResumeResult, ThreadStatus, VmOptions, is_suspended_marker, suspended_marker,
};

use std::rc::Rc;

/// Run an already-loaded dump blob on a fresh VM: the quickest way from
/// bytes to a result.
pub fn execute_dump(blob: &[u8]) -> LuaResult<MultiValue> {
    let mut vm = LuaVM::new(VmOptions::default());
    let f = vm.load_bytes(blob, "=chunk")?;
    vm.call_value(f, &[])
}

/// Wrap a prototype into a runnable closure on the given VM and call it.
pub fn execute_proto(vm: &mut LuaVM, proto: Rc<Proto>, args: &[LuaValue]) -> LuaResult<MultiValue> {
    let f = vm.closure_from_proto(proto);
    vm.call_value(f, args)
}
