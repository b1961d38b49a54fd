// Per-thread execution state: the value stack, the frame chain, open
// upvalues, the to-be-closed list, and coroutine bookkeeping.
//
// One LuaState exists per thread (the main state is owned by the VM,
// coroutine states live boxed in the pool). States reach the shared VM
// through a raw pointer that every public entry point refreshes, the same
// single-threaded contract the C structure this models has.

use crate::gc::{UpvalueId, UpvalueState, ThreadId};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::{CallInfo, call_status};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Reserved slots above a frame's top so metamethod calls never re-check.
pub const EXTRA_STACK: usize = 5;
/// Initial stack allocation.
const BASIC_STACK_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started or yielded.
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting on it.
    Normal,
    Dead,
}

impl ThreadStatus {
    pub fn name(self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

pub struct LuaState {
    vm: *mut LuaVM,
    /// Pool identity; None for the main state.
    pub(crate) id: Option<ThreadId>,

    pub(crate) stack: Vec<LuaValue>,
    /// First free slot.
    pub(crate) stack_top: usize,

    pub(crate) call_stack: Vec<CallInfo>,
    /// Active depth; the frame stack itself never shrinks.
    call_depth: usize,
    /// Nesting of C-level reentries (metamethods, pcall bodies, hooks).
    c_call_depth: usize,

    /// Open upvalues ordered by descending stack level.
    open_upvalues: Vec<(usize, UpvalueId)>,

    /// To-be-closed slots, delta-compressed: entry i stores the distance
    /// from the previous entry's level.
    tbc_deltas: Vec<u32>,
    tbc_top_level: usize,

    pub(crate) status: ThreadStatus,
    /// Whether the coroutine body has been entered at least once.
    pub(crate) started: bool,
    /// Values passed out by yield / in by resume.
    pub(crate) transfer_values: Vec<LuaValue>,
    /// Where the next resume's arguments land (the yield call's result
    /// slot) and how many results that call expects.
    pub(crate) yield_result_pos: usize,
    pub(crate) yield_nresults: i32,
    /// Frames that forbid yielding below them.
    pub(crate) nonyieldable: usize,

    // debug hook bookkeeping
    pub(crate) hook_mask: u8,
    pub(crate) hook_count: i32,
    pub(crate) hook_base_count: i32,
    pub(crate) last_hook_line: i64,
    pub(crate) in_hook: bool,

    pub(crate) is_main: bool,
}

pub mod hook_mask {
    pub const MASK_CALL: u8 = 1 << 0;
    pub const MASK_RET: u8 = 1 << 1;
    pub const MASK_LINE: u8 = 1 << 2;
    pub const MASK_COUNT: u8 = 1 << 3;
}

impl LuaState {
    pub fn new(is_main: bool) -> Self {
        LuaState {
            vm: std::ptr::null_mut(),
            id: None,
            stack: Vec::with_capacity(BASIC_STACK_SIZE),
            stack_top: 0,
            call_stack: Vec::with_capacity(8),
            call_depth: 0,
            c_call_depth: 0,
            open_upvalues: Vec::new(),
            tbc_deltas: Vec::new(),
            tbc_top_level: 0,
            status: if is_main { ThreadStatus::Running } else { ThreadStatus::Suspended },
            started: false,
            transfer_values: Vec::new(),
            yield_result_pos: 0,
            yield_nresults: 0,
            nonyieldable: 0,
            hook_mask: 0,
            hook_count: 0,
            hook_base_count: 0,
            last_hook_line: -1,
            in_hook: false,
            is_main,
        }
    }

    #[inline(always)]
    pub(crate) fn set_vm(&mut self, vm: *mut LuaVM) {
        self.vm = vm;
    }

    /// Shared VM access. Sound under the single-threaded execution model:
    /// exactly one state is running at a time and the VM outlives it.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn vm(&self) -> &mut LuaVM {
        debug_assert!(!self.vm.is_null());
        unsafe { &mut *self.vm }
    }

    // ---- stack management ----

    /// Grow the physical stack so `needed` slots exist above base zero.
    /// Absolute indices survive growth, so frames, open upvalues and the
    /// TBC list need no relocation fix-up.
    pub fn ensure_stack(&mut self, needed: usize) -> LuaResult<()> {
        let limit = self.vm().options.max_stack_size;
        if needed > limit {
            return Err(self.vm().raise_plain(LuaError::StackOverflow, "stack overflow"));
        }
        if self.stack.len() < needed + EXTRA_STACK {
            self.stack.resize(needed + EXTRA_STACK, LuaValue::nil());
        }
        Ok(())
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.stack_top
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: usize) {
        if top > self.stack.len() {
            self.stack.resize(top + EXTRA_STACK, LuaValue::nil());
        }
        // clear abandoned slots so stale references do not pin objects
        for i in top..self.stack_top.min(self.stack.len()) {
            self.stack[i] = LuaValue::nil();
        }
        self.stack_top = top;
    }

    #[inline(always)]
    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.ensure_stack(self.stack_top + 1)?;
        self.stack[self.stack_top] = v;
        self.stack_top += 1;
        Ok(())
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> LuaValue {
        self.stack.get(idx).copied().unwrap_or_else(LuaValue::nil)
    }

    #[inline(always)]
    pub fn set(&mut self, idx: usize, v: LuaValue) {
        if idx >= self.stack.len() {
            self.stack.resize(idx + 1 + EXTRA_STACK, LuaValue::nil());
        }
        self.stack[idx] = v;
        if idx >= self.stack_top {
            self.stack_top = idx + 1;
        }
    }

    // ---- frames ----

    #[inline(always)]
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    #[inline(always)]
    pub fn c_call_depth(&self) -> usize {
        self.c_call_depth
    }

    pub(crate) fn enter_c_call(&mut self) -> LuaResult<()> {
        if self.c_call_depth >= self.vm().options.max_c_depth {
            return Err(self.vm().raise_plain(LuaError::TooManyCalls, "C stack overflow"));
        }
        self.c_call_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_c_call(&mut self) {
        debug_assert!(self.c_call_depth > 0);
        self.c_call_depth -= 1;
    }

    #[inline(always)]
    pub fn current_frame(&self) -> Option<&CallInfo> {
        self.call_depth
            .checked_sub(1)
            .and_then(|i| self.call_stack.get(i))
    }

    #[inline(always)]
    pub fn current_frame_mut(&mut self) -> Option<&mut CallInfo> {
        self.call_depth
            .checked_sub(1)
            .and_then(move |i| self.call_stack.get_mut(i))
    }

    #[inline(always)]
    pub fn frame(&self, depth: usize) -> &CallInfo {
        &self.call_stack[depth]
    }

    #[inline(always)]
    pub fn frame_mut(&mut self, depth: usize) -> &mut CallInfo {
        &mut self.call_stack[depth]
    }

    /// Install a frame at the current depth, reusing slots when possible.
    pub(crate) fn push_frame(&mut self, frame: CallInfo) -> LuaResult<usize> {
        if self.call_depth >= self.vm().options.max_call_depth {
            return Err(self
                .vm()
                .raise_plain(LuaError::StackOverflow, "too many nested calls"));
        }
        if self.call_depth < self.call_stack.len() {
            self.call_stack[self.call_depth] = frame;
        } else {
            self.call_stack.push(frame);
        }
        self.call_depth += 1;
        Ok(self.call_depth - 1)
    }

    #[inline(always)]
    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(self.call_depth > 0);
        self.call_depth -= 1;
    }

    // ---- open upvalues ----

    /// Find the open upvalue for `level`, or create one, keeping the list
    /// ordered by descending level. No two entries share a level.
    pub fn find_upvalue(&mut self, level: usize) -> UpvalueId {
        match self
            .open_upvalues
            .binary_search_by(|(l, _)| level.cmp(l))
        {
            Ok(pos) => self.open_upvalues[pos].1,
            Err(pos) => {
                let owner = self.id;
                let vm = self.vm();
                let id = vm.alloc_upvalue(UpvalueState::Open { level, owner });
                self.open_upvalues.insert(pos, (level, id));
                id
            }
        }
    }

    /// Close every open upvalue at or above `level`: copy the stack value
    /// into the upvalue and detach it from the list.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&(l, id)) = self.open_upvalues.first() {
            if l < level {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.get(l);
            let vm = self.vm();
            if let Some(uv) = vm.pool.get_upvalue_mut(id) {
                uv.state = UpvalueState::Closed(value);
            }
            vm.gc_barrier_upvalue(id, &value);
        }
    }

    pub fn open_upvalue_ids(&self) -> Vec<UpvalueId> {
        self.open_upvalues.iter().map(|&(_, id)| id).collect()
    }

    pub(crate) fn open_upvalue_levels(&self) -> &[(usize, UpvalueId)] {
        &self.open_upvalues
    }

    // ---- to-be-closed list ----

    /// Mark a stack slot for close-on-scope-exit. Levels arrive in
    /// ascending order, so the delta encoding stays non-negative.
    pub fn tbc_push(&mut self, level: usize) -> LuaResult<()> {
        let value = self.get(level);
        if value.is_nil() || value.as_boolean() == Some(false) {
            return Ok(()); // false and nil need no close
        }
        let delta = if self.tbc_deltas.is_empty() {
            level
        } else {
            level - self.tbc_top_level
        };
        self.tbc_deltas.push(delta as u32);
        self.tbc_top_level = level;
        Ok(())
    }

    /// Pop the topmost TBC level, if any at or above `floor`.
    pub(crate) fn tbc_pop_above(&mut self, floor: usize) -> Option<usize> {
        if self.tbc_deltas.is_empty() || self.tbc_top_level < floor {
            return None;
        }
        let level = self.tbc_top_level;
        let delta = self.tbc_deltas.pop().unwrap() as usize;
        self.tbc_top_level = if self.tbc_deltas.is_empty() {
            0
        } else {
            level - delta
        };
        Some(level)
    }

    pub fn tbc_len(&self) -> usize {
        self.tbc_deltas.len()
    }

    // ---- coroutine support ----

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn is_yieldable(&self) -> bool {
        self.nonyieldable == 0 && !self.is_main
    }

    /// Copy one stack slot over another, the raw stack-surface primitive.
    pub fn copy_slot(&mut self, from: usize, to: usize) {
        let v = self.get(from);
        self.set(to, v);
    }

    /// Rotate the `n` topmost slots starting at `idx` by one position
    /// toward the top (negative `steps` rotates the other way).
    pub fn rotate(&mut self, idx: usize, steps: i32) {
        if idx >= self.stack_top {
            return;
        }
        let window = &mut self.stack[idx..self.stack_top];
        if window.len() < 2 {
            return;
        }
        let n = window.len();
        let k = steps.rem_euclid(n as i32) as usize;
        window.rotate_right(k);
    }

    // ---- native-function argument access ----

    /// Argument count of the running C function's frame.
    pub fn cf_nargs(&self) -> usize {
        match self.current_frame() {
            Some(f) if f.is_c() => self.stack_top.saturating_sub(f.base),
            _ => 0,
        }
    }

    /// Argument `i` (0-based) of the running C function's frame.
    pub fn cf_arg(&self, i: usize) -> LuaValue {
        match self.current_frame() {
            Some(f) if f.is_c() => self.get(f.base + i),
            _ => LuaValue::nil(),
        }
    }

    /// Yield from a C function: stash the values and return the resulting
    /// control kind as this call's error.
    pub fn do_yield(&mut self, values: Vec<LuaValue>) -> LuaError {
        crate::lua_vm::execute::coroutine::do_yield(self, values)
    }

    // ---- GC interface ----

    /// Every value this thread keeps alive, plus its open upvalues.
    pub fn gc_refs(&self) -> (Vec<LuaValue>, Vec<UpvalueId>) {
        let mut values: Vec<LuaValue> =
            self.stack[..self.stack_top.min(self.stack.len())].to_vec();
        for i in 0..self.call_depth {
            values.push(self.call_stack[i].func);
        }
        values.extend_from_slice(&self.transfer_values);
        (values, self.open_upvalue_ids())
    }

    /// Drop everything back to a pristine stack; pending TBC slots have
    /// already been closed by the caller.
    pub(crate) fn reset(&mut self) {
        self.stack.clear();
        self.stack_top = 0;
        self.call_depth = 0;
        self.c_call_depth = 0;
        self.open_upvalues.clear();
        self.tbc_deltas.clear();
        self.tbc_top_level = 0;
        self.transfer_values.clear();
        self.nonyieldable = 0;
        self.status = ThreadStatus::Dead;
    }

    /// Base of the currently running frame; 0 when idle.
    #[inline]
    pub fn current_base(&self) -> usize {
        self.current_frame().map(|f| f.base).unwrap_or(0)
    }

    /// Stack level for the debug controller: frames currently active.
    #[inline]
    pub fn stack_level(&self) -> usize {
        self.call_depth
    }

    pub(crate) fn mark_frame_no_yield(&mut self) {
        self.nonyieldable += 1;
        if let Some(f) = self.current_frame_mut() {
            f.call_status |= call_status::CIST_NOYIELD;
        }
    }

    pub(crate) fn clear_frame_no_yield(&mut self) {
        debug_assert!(self.nonyieldable > 0);
        self.nonyieldable -= 1;
    }
}

impl Default for LuaState {
    fn default() -> Self {
        LuaState::new(false)
    }
}
