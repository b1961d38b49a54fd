// Hot-patch and function sleep/wake.
//
// hotreplace swaps the prototype of a live closure while keeping its
// upvalue array, so captured state survives the patch; callers see the new
// body on their next invocation and in-flight frames keep the prototype
// they already hold (each frame owns an Rc).
//
// A sleeping prototype queues arriving calls instead of running them; the
// wake side replays the queue in insertion order.

use std::rc::Rc;

use crate::gc::{ClosureKind, FunctionId, GcId};
use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    fn lua_closure_id(&mut self, v: &LuaValue) -> LuaResult<FunctionId> {
        let Some(fid) = v.as_function_id() else {
            return Err(self.raise_plain(LuaError::TypeError, "function expected"));
        };
        match self.pool.get_function(fid).map(|f| &f.kind) {
            Some(ClosureKind::Lua { .. }) => Ok(fid),
            _ => Err(self.raise_plain(LuaError::TypeError, "only Lua functions can be patched")),
        }
    }

    /// Swap the prototype of `closure` in place, keeping upvalues, and set
    /// its hotfixed mark.
    pub fn hotreplace(&mut self, closure: LuaValue, new_proto: Rc<Proto>) -> LuaResult<()> {
        let fid = self.lua_closure_id(&closure)?;
        if let Some(f) = self.pool.get_function_mut(fid) {
            if let ClosureKind::Lua { proto, is_hotfixed, .. } = &mut f.kind {
                *proto = new_proto;
                *is_hotfixed = true;
            }
        }
        // the closure now references a fresh constant pool
        self.gc.barrier_back(GcId::Function(fid), &mut self.pool);
        Ok(())
    }

    /// Patch by function value or global name. Validates that upvalue
    /// counts match, installs the new prototype, and returns a rollback
    /// closure wrapping the displaced body over the same upvalues.
    pub fn hotfix(&mut self, target: LuaValue, new_fn: LuaValue) -> LuaResult<LuaValue> {
        let old = if target.is_string() {
            let name = String::from_utf8_lossy(
                self.value_str(&target).unwrap_or_default(),
            )
            .into_owned();
            let v = self.get_global(&name);
            if v.is_nil() {
                let msg = format!("hotfix: no global function named '{}'", name);
                return Err(self.raise_plain(LuaError::TypeError, msg));
            }
            v
        } else {
            target
        };

        let old_fid = self.lua_closure_id(&old)?;
        let new_fid = self.lua_closure_id(&new_fn)?;

        let (old_proto, old_upvals) = match self.pool.get_function(old_fid).map(|f| &f.kind) {
            Some(ClosureKind::Lua { proto, upvalues, .. }) => (proto.clone(), upvalues.clone()),
            _ => unreachable!(),
        };
        let new_proto = match self.pool.get_function(new_fid).map(|f| &f.kind) {
            Some(ClosureKind::Lua { proto, .. }) => proto.clone(),
            _ => unreachable!(),
        };

        if old_proto.upvalue_descs.len() != new_proto.upvalue_descs.len() {
            let msg = format!(
                "hotfix: upvalue count mismatch ({} vs {})",
                old_proto.upvalue_descs.len(),
                new_proto.upvalue_descs.len()
            );
            return Err(self.raise_plain(LuaError::InvalidOperand, msg));
        }

        self.hotreplace(old, new_proto)?;

        // rollback handle: the displaced body over the same upvalue array
        let rollback = self.alloc_lua_closure(old_proto, old_upvals);
        Ok(self.closure_value(rollback))
    }

    /// Whether a closure carries the hotfixed mark.
    pub fn is_hotfixed(&mut self, v: &LuaValue) -> bool {
        v.as_function_id()
            .and_then(|fid| self.pool.get_function(fid))
            .map(|f| f.is_hotfixed())
            .unwrap_or(false)
    }

    fn proto_of(&mut self, f: &LuaValue) -> LuaResult<Rc<Proto>> {
        let fid = self.lua_closure_id(f)?;
        match self.pool.get_function(fid).map(|g| &g.kind) {
            Some(ClosureKind::Lua { proto, .. }) => Ok(proto.clone()),
            _ => unreachable!(),
        }
    }

    /// Put a function's prototype to sleep: further calls are queued.
    pub fn function_sleep(&mut self, f: LuaValue) -> LuaResult<()> {
        let proto = self.proto_of(&f)?;
        proto.is_sleeping.set(true);
        Ok(())
    }

    /// Wake a prototype and replay every queued call in insertion order.
    /// Returns how many calls were replayed.
    pub fn function_wake(&mut self, f: LuaValue) -> LuaResult<usize> {
        let proto = self.proto_of(&f)?;
        proto.is_sleeping.set(false);

        let mut replayed = 0;
        loop {
            let node = proto.call_queue.borrow_mut().as_mut().and_then(|q| q.pop());
            let Some(node) = node else { break };
            self.call_value(f, &node.args)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Queue length of a sleeping function.
    pub fn queued_call_count(&mut self, f: &LuaValue) -> usize {
        self.proto_of(f).map(|p| p.queued_calls()).unwrap_or(0)
    }
}
