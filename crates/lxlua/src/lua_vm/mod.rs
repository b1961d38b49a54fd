// Global VM state: object pool + collector + registry + the embedding
// surface. Per-thread execution lives in LuaState; the interpreter itself
// is under execute/.

pub mod call_info;
pub mod execute;
pub mod hotpatch;
pub mod lua_error;
pub mod lua_state;
pub mod opcode;

pub use call_info::{CallInfo, call_status};
pub use lua_error::{LuaError, LuaResult, LuaRuntimeError};
pub use lua_state::{EXTRA_STACK, LuaState, ThreadStatus, hook_mask};
pub use opcode::{Instruction, OpCode};

use std::rc::Rc;

use crate::gc::{
    FunctionId, GC, GcId, GcKind, ObjectPool, RootSet, StringId, TableId, ThreadId, UpvalueId,
    UpvalueState,
};
use crate::lua_value::{AccessLog, LuaTable, LuaValue, MultiValue, Proto};
use crate::lua_value::lua_table::TableKey;

/// Native function callable from the VM. Arguments are the current frame's
/// registers; results come back as a MultiValue.
pub type CFunction = fn(&mut LuaState) -> LuaResult<MultiValue>;

/// Debug hook: (state, event, line).
pub type HookFn = fn(&mut LuaState, HookEvent, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line,
    Count,
    TailCall,
}

impl HookEvent {
    pub fn name(self) -> &'static str {
        match self {
            HookEvent::Call => "call",
            HookEvent::Return => "return",
            HookEvent::Line => "line",
            HookEvent::Count => "count",
            HookEvent::TailCall => "tail call",
        }
    }
}

/// Frontend seam: compiles source text into a prototype. The runtime ships
/// without one; embedders register theirs.
pub type Frontend = Box<dyn Fn(&mut LuaVM, &str, &str) -> LuaResult<Rc<Proto>>>;

/// Metamethod events. The first eight participate in the per-table
/// absent-flag cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Call,
    Close,
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
    Lt,
    Le,
    Concat,
    ToString,
    Contains,
    Init,
    Name,
}

pub const TM_NAMES: &[&str] = &[
    "__index",
    "__newindex",
    "__gc",
    "__mode",
    "__len",
    "__eq",
    "__call",
    "__close",
    "__add",
    "__sub",
    "__mul",
    "__mod",
    "__pow",
    "__div",
    "__idiv",
    "__band",
    "__bor",
    "__bxor",
    "__shl",
    "__shr",
    "__unm",
    "__bnot",
    "__lt",
    "__le",
    "__concat",
    "__tostring",
    "__contains",
    "__init__",
    "__name",
];

/// Runtime tunables. No configuration is read from disk; embedders pass
/// what they want changed.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub max_call_depth: usize,
    pub max_c_depth: usize,
    pub max_stack_size: usize,
    /// Bound on metamethod / __index chain recursion.
    pub max_meta_depth: usize,
    pub jit_enabled: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_call_depth: 200,
            max_c_depth: 200,
            max_stack_size: 1_000_000,
            max_meta_depth: 100,
            jit_enabled: false,
        }
    }
}

// Registry keys for the debug controller tables.
pub const BREAKPOINT_KEY: &str = "_BREAKPOINTKEY";
pub const DEBUG_STATE_KEY: &str = "_DEBUGSTATEKEY";
pub const HOOK_KEY: &str = "_HOOKKEY";
pub const DEBUG_OUTPUT_KEY: &str = "_DEBUGOUTPUTKEY";

/// Sentinel address behind the suspended-call marker value.
static SLEEP_SENTINEL: u8 = 0;

/// The marker returned by calls that were queued on a sleeping prototype.
pub fn suspended_marker() -> LuaValue {
    LuaValue::light_userdata(&SLEEP_SENTINEL as *const u8 as *mut std::ffi::c_void)
}

pub fn is_suspended_marker(v: &LuaValue) -> bool {
    v.as_light_userdata() == Some(&SLEEP_SENTINEL as *const u8 as usize)
}

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: GC,
    pub(crate) main: Box<LuaState>,

    registry: TableId,
    globals: TableId,

    /// Interned metamethod names, index = TmKind.
    tm_names: Vec<StringId>,

    pub options: VmOptions,
    pub(crate) access_log: AccessLog,

    // error state (kept off the Result path)
    pub(crate) error_object: LuaValue,
    pub(crate) error_message: String,

    /// Metamethod recursion depth.
    pub(crate) meta_depth: usize,

    /// Resume nesting, innermost last.
    pub(crate) thread_chain: Vec<ThreadId>,

    frontend: Option<Frontend>,
    pub(crate) hook_fn: Option<HookFn>,
    panic_fn: Option<fn(&mut LuaVM)>,
}

impl LuaVM {
    pub fn new(options: VmOptions) -> Box<LuaVM> {
        let mut pool = ObjectPool::new();
        let mut gc = GC::new();

        let registry = pool.new_table(0, 8, gc.current_white());
        let globals = pool.new_table(0, 32, gc.current_white());
        gc.fix_object(GcId::Table(registry), &mut pool);
        gc.fix_object(GcId::Table(globals), &mut pool);

        let mut tm_names = Vec::with_capacity(TM_NAMES.len());
        for name in TM_NAMES {
            let (id, _) = pool.new_string(name.as_bytes(), gc.current_white());
            gc.fix_object(GcId::Str(id), &mut pool);
            tm_names.push(id);
        }
        gc.mode_key = Some(tm_names[TmKind::Mode as usize]);
        gc.gc_key = Some(tm_names[TmKind::Gc as usize]);

        let mut vm = Box::new(LuaVM {
            pool,
            gc,
            main: Box::new(LuaState::new(true)),
            registry,
            globals,
            tm_names,
            options,
            access_log: AccessLog::new(),
            error_object: LuaValue::nil(),
            error_message: String::new(),
            meta_depth: 0,
            thread_chain: Vec::new(),
            frontend: None,
            hook_fn: None,
            panic_fn: None,
        });
        vm.refresh_state_ptrs();
        vm
    }

    /// Entry points call this so every reachable state sees the current VM
    /// address.
    pub(crate) fn refresh_state_ptrs(&mut self) {
        let vm_ptr = self as *mut LuaVM;
        self.main.set_vm(vm_ptr);
        let ids: Vec<u32> = self.pool.threads.ids();
        for id in ids {
            if let Some(t) = self.pool.threads.get_mut(id) {
                t.state.set_vm(vm_ptr);
            }
        }
    }

    #[inline]
    pub fn main_state(&mut self) -> &mut LuaState {
        self.refresh_state_ptrs();
        &mut self.main
    }

    // ---- registry & globals ----

    #[inline]
    pub fn registry(&self) -> TableId {
        self.registry
    }

    #[inline]
    pub fn globals_table(&self) -> TableId {
        self.globals
    }

    /// Fetch-or-create a named subtable of the registry.
    pub fn registry_subtable(&mut self, key: &str) -> TableId {
        let key_val = self.intern(key.as_bytes());
        let key_id = key_val.as_string_id().unwrap();
        let existing = self
            .pool
            .get_table(self.registry)
            .map(|t| t.get_str(key_id))
            .unwrap_or_else(LuaValue::nil);
        if let Some(tid) = existing.as_table_id() {
            return tid;
        }
        let tid = self.alloc_table(0, 8);
        let registry = self.registry;
        if let Some(t) = self.pool.get_table_mut(registry) {
            t.set_str(key_id, key_val, LuaValue::table(tid));
        }
        tid
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.intern(name.as_bytes());
        let key_id = key.as_string_id().unwrap();
        let globals = self.globals;
        if let Some(t) = self.pool.get_table_mut(globals) {
            t.set_str(key_id, key, value);
        }
        self.gc_barrier_table(globals, &value);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.intern(name.as_bytes());
        let key_id = key.as_string_id().unwrap();
        self.pool
            .get_table(self.globals)
            .map(|t| t.get_str(key_id))
            .map(|v| if v.is_nil() { LuaValue::nil() } else { v })
            .unwrap_or_else(LuaValue::nil)
    }

    // ---- allocation wrappers (all GC-tracked) ----

    pub fn intern(&mut self, bytes: &[u8]) -> LuaValue {
        let white = self.gc.current_white();
        let (id, long) = self.pool.new_string(bytes, white);
        let size = self
            .pool
            .strings
            .get(id.0)
            .map(|o| o.header.size as usize)
            .unwrap_or(0);
        self.gc.track_allocation(size);
        LuaValue::string(id, long)
    }

    pub fn intern_str(&mut self, s: &str) -> LuaValue {
        self.intern(s.as_bytes())
    }

    pub fn alloc_table(&mut self, narr: usize, nrec: usize) -> TableId {
        let white = self.gc.current_white();
        let id = self.pool.new_table(narr, nrec, white);
        let size = self
            .pool
            .tables
            .get(id.0)
            .map(|o| o.header.size as usize)
            .unwrap_or(0);
        self.gc.track_allocation(size);
        id
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> UpvalueId {
        let white = self.gc.current_white();
        let id = self.pool.new_upvalue(state, white);
        self.gc.track_allocation(std::mem::size_of::<UpvalueState>() + 16);
        id
    }

    pub fn alloc_lua_closure(&mut self, proto: Rc<Proto>, upvalues: Vec<UpvalueId>) -> FunctionId {
        let white = self.gc.current_white();
        let id = self.pool.new_lua_closure(proto, upvalues, white);
        let size = self
            .pool
            .functions
            .get(id.0)
            .map(|o| o.header.size as usize)
            .unwrap_or(0);
        self.gc.track_allocation(size);
        id
    }

    pub fn alloc_c_closure(&mut self, f: CFunction, upvalues: Vec<LuaValue>) -> FunctionId {
        let white = self.gc.current_white();
        let id = self.pool.new_c_closure(f, upvalues, white);
        let size = self
            .pool
            .functions
            .get(id.0)
            .map(|o| o.header.size as usize)
            .unwrap_or(0);
        self.gc.track_allocation(size);
        id
    }

    /// Closure value with the variant tag matching the object's marks
    /// (hotfixed / sleeping).
    pub fn closure_value(&self, id: FunctionId) -> LuaValue {
        use crate::lua_value::lua_value::{V_HFCL, V_LCL, V_SLPCL};
        let Some(f) = self.pool.get_function(id) else {
            return LuaValue::function(id);
        };
        let tag = match &f.kind {
            crate::gc::ClosureKind::Lua { proto, is_hotfixed, .. } => {
                if proto.is_sleeping() {
                    V_SLPCL
                } else if *is_hotfixed {
                    V_HFCL
                } else {
                    V_LCL
                }
            }
            crate::gc::ClosureKind::C { .. } => {
                return LuaValue::function_tagged(id, crate::lua_value::lua_value::V_CCL);
            }
        };
        LuaValue::function_tagged(id, tag)
    }

    /// Wrap a prototype into a main-chunk closure: the first upvalue binds
    /// to the globals table (the `_ENV` convention, which survives
    /// stripped dumps), the rest start nil.
    pub fn closure_from_proto(&mut self, proto: Rc<Proto>) -> LuaValue {
        let globals = LuaValue::table(self.globals);
        let mut upvals = Vec::with_capacity(proto.upvalue_descs.len());
        for (i, _desc) in proto.upvalue_descs.iter().enumerate() {
            let init = if i == 0 { globals } else { LuaValue::nil() };
            upvals.push(self.alloc_upvalue(UpvalueState::Closed(init)));
        }
        let fid = self.alloc_lua_closure(proto, upvals);
        self.closure_value(fid)
    }

    /// New coroutine running `f`.
    pub fn new_thread(&mut self, f: LuaValue) -> LuaResult<LuaValue> {
        if !f.is_function() {
            return Err(self.raise_plain(LuaError::TypeError, "cannot create thread: not a function"));
        }
        let white = self.gc.current_white();
        let mut state = Box::new(LuaState::new(false));
        state.set_vm(self as *mut LuaVM);
        // slot 0 holds the body until the first resume
        state.set(0, f);
        state.set_top(1);
        let id = self.pool.new_thread(state, white);
        if let Some(t) = self.pool.threads.get_mut(id.0) {
            t.state.id = Some(id);
        }
        self.gc.track_allocation(2048);
        Ok(LuaValue::thread(id))
    }

    // ---- error machinery ----

    /// Raise with a plain message; the error object becomes an interned
    /// string (message interning may allocate, which is fine here).
    pub fn raise_plain(&mut self, kind: LuaError, msg: impl Into<String>) -> LuaError {
        let msg = msg.into();
        self.error_object = self.intern(msg.as_bytes());
        self.error_message = msg;
        kind
    }

    /// Raise carrying an arbitrary error value.
    pub fn raise_value(&mut self, kind: LuaError, value: LuaValue) -> LuaError {
        self.error_object = value;
        self.error_message = self.display_value(&value);
        kind
    }

    pub fn error_object(&self) -> LuaValue {
        self.error_object
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Consume the stored error state into a reportable error.
    pub fn take_error(&mut self, kind: LuaError) -> LuaRuntimeError {
        let message = std::mem::take(&mut self.error_message);
        self.error_object = LuaValue::nil();
        LuaRuntimeError { kind, message }
    }

    pub fn set_panic(&mut self, f: fn(&mut LuaVM)) {
        self.panic_fn = Some(f);
    }

    /// Last resort for unprotected errors.
    pub(crate) fn panic(&mut self) {
        if let Some(f) = self.panic_fn {
            f(self);
        }
    }

    // ---- frontend seam ----

    pub fn set_frontend(&mut self, f: Frontend) {
        self.frontend = Some(f);
    }

    pub(crate) fn compile_source(&mut self, source: &str, chunkname: &str) -> LuaResult<Rc<Proto>> {
        let frontend = match self.frontend.take() {
            Some(f) => f,
            None => {
                return Err(self.raise_plain(
                    LuaError::SyntaxError,
                    "no frontend registered: cannot load source text",
                ));
            }
        };
        let result = frontend(self, source, chunkname);
        self.frontend = Some(frontend);
        result
    }

    // ---- metamethod support ----

    #[inline]
    pub fn tm_name(&self, tm: TmKind) -> StringId {
        self.tm_names[tm as usize]
    }

    /// Metatable of any value: tables and userdata carry their own.
    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        if let Some(tid) = v.as_table_id() {
            self.pool.get_table(tid).and_then(|t| t.metatable())
        } else if let Some(uid) = v.as_userdata_id() {
            self.pool.get_userdata(uid).and_then(|u| u.data.metatable)
        } else {
            None
        }
    }

    /// Look up metamethod `tm` for value `v`, consulting and maintaining
    /// the absent-flag cache for cacheable events on tables.
    pub fn get_metamethod(&mut self, v: &LuaValue, tm: TmKind) -> LuaValue {
        let event_bit = tm as u8;
        if let Some(tid) = v.as_table_id() {
            if event_bit < 8 {
                if let Some(t) = self.pool.get_table(tid) {
                    if t.tm_known_absent(event_bit) {
                        return LuaValue::nil();
                    }
                }
            }
        }
        let mt = match self.metatable_of(v) {
            Some(mt) => mt,
            None => return LuaValue::nil(),
        };
        let name = self.tm_names[tm as usize];
        let result = self
            .pool
            .get_table(mt)
            .map(|t| t.get_str(name))
            .unwrap_or_else(LuaValue::nil);
        if result.is_nil() {
            if event_bit < 8 {
                if let Some(tid) = v.as_table_id() {
                    if let Some(t) = self.pool.get_table_mut(tid) {
                        t.mark_tm_absent(event_bit);
                    }
                }
            }
            LuaValue::nil()
        } else {
            result
        }
    }

    pub(crate) fn enter_meta(&mut self) -> LuaResult<()> {
        if self.meta_depth >= self.options.max_meta_depth {
            return Err(self.raise_plain(LuaError::TooManyCalls, "metamethod chain too deep"));
        }
        self.meta_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_meta(&mut self) {
        debug_assert!(self.meta_depth > 0);
        self.meta_depth -= 1;
    }

    // ---- raw table access (normalized keys) ----

    /// Canonical key for a string value: long strings used as keys map to
    /// one representative id so key equality is id equality.
    pub(crate) fn normalize_key(&mut self, key: &LuaValue) -> Option<TableKey> {
        if key.is_string() && !key.is_short_string() {
            let id = key.as_string_id().unwrap();
            let bytes = self.pool.string_bytes(id).to_vec();
            let white = self.gc.current_white();
            let (canon, created) = self.pool.canonical_key_string(&bytes, white);
            if created {
                self.gc.track_allocation(bytes.len() + 64);
            }
            return Some(TableKey::Str(canon));
        }
        TableKey::from_value(key)
    }

    /// The value form of a normalized key; for canonicalized strings this
    /// is the representative, so the table entry roots it.
    fn key_value_of(&self, k: &TableKey, original: LuaValue) -> LuaValue {
        if let TableKey::Str(id) = k {
            let long = self.pool.get_string(*id).map(|s| !s.is_short()).unwrap_or(false);
            return LuaValue::string(*id, long);
        }
        original
    }

    pub fn raw_get(&mut self, tid: TableId, key: &LuaValue) -> LuaValue {
        let Some(k) = self.normalize_key(key) else {
            return LuaValue::nil();
        };
        let v = self
            .pool
            .get_table(tid)
            .map(|t| t.get_key(&k))
            .unwrap_or_else(LuaValue::nil);
        if v.is_empty_slot() { LuaValue::nil() } else { v }
    }

    pub fn raw_set(&mut self, tid: TableId, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let Some(k) = self.normalize_key(&key) else {
            let msg = if key.is_nil() { "table index is nil" } else { "table index is NaN" };
            return Err(self.raise_plain(LuaError::IndexError, msg));
        };
        let key_value = self.key_value_of(&k, key);
        if let Some(t) = self.pool.get_table_mut(tid) {
            t.set_key(k, key_value, value);
        }
        self.gc_barrier_table(tid, &value);
        self.gc_barrier_table(tid, &key_value);
        Ok(())
    }

    pub fn raw_get_int(&self, tid: TableId, i: i64) -> LuaValue {
        let v = self
            .pool
            .get_table(tid)
            .map(|t| t.get_int(i))
            .unwrap_or_else(LuaValue::nil);
        if v.is_empty_slot() { LuaValue::nil() } else { v }
    }

    pub fn raw_set_int(&mut self, tid: TableId, i: i64, value: LuaValue) {
        if let Some(t) = self.pool.get_table_mut(tid) {
            t.set_int(i, value);
        }
        self.gc_barrier_table(tid, &value);
    }

    pub fn raw_len(&self, v: &LuaValue) -> Option<i64> {
        if let Some(id) = v.as_string_id() {
            Some(self.pool.string_bytes(id).len() as i64)
        } else if let Some(tid) = v.as_table_id() {
            self.pool.get_table(tid).map(|t| t.len())
        } else {
            None
        }
    }

    // ---- GC driving ----

    /// Write barrier: table `tid` gained a reference to `child`.
    pub(crate) fn gc_barrier_table(&mut self, tid: TableId, child: &LuaValue) {
        if !child.is_collectable() {
            return;
        }
        self.gc.barrier_back(GcId::Table(tid), &mut self.pool);
    }

    pub(crate) fn gc_barrier_upvalue(&mut self, id: UpvalueId, child: &LuaValue) {
        if !child.is_collectable() {
            return;
        }
        if let Some(child_id) = value_gc_id(child) {
            self.gc.barrier(GcId::Upvalue(id), child_id, &mut self.pool);
        }
    }

    pub(crate) fn collect_roots(&mut self, current: Option<&LuaState>) -> RootSet {
        let mut roots = RootSet::new();
        roots.values.push(LuaValue::table(self.registry));
        roots.values.push(LuaValue::table(self.globals));
        roots.values.push(self.error_object);
        let (vals, upvals) = self.main.gc_refs();
        roots.values.extend(vals);
        roots.upvalues.extend(upvals);
        if let Some(s) = current {
            if !s.is_main {
                let (vals, upvals) = s.gc_refs();
                roots.values.extend(vals);
                roots.upvalues.extend(upvals);
            }
        }
        for &tid in &self.thread_chain {
            roots.values.push(LuaValue::thread(tid));
        }
        roots
    }

    /// Allocation sites call this; runs a GC step when debt is due, then
    /// any queued finalizers.
    pub fn maybe_gc(&mut self, current: Option<&LuaState>) {
        if !self.gc.should_collect() {
            return;
        }
        let roots = self.collect_roots(current);
        self.gc.step(&roots, &mut self.pool);
        self.run_pending_finalizers();
    }

    pub fn gc_collect(&mut self) {
        let roots = self.collect_roots(None);
        self.gc.full_collection(&roots, &mut self.pool);
        self.run_pending_finalizers();
    }

    pub fn gc_step(&mut self, n: usize) {
        let roots = self.collect_roots(None);
        if n == 0 {
            self.gc.step_internal(&roots, &mut self.pool, true);
        } else {
            for _ in 0..n {
                self.gc.step_internal(&roots, &mut self.pool, true);
            }
        }
        self.run_pending_finalizers();
    }

    pub fn gc_stop(&mut self) {
        self.gc.stop();
    }

    pub fn gc_restart(&mut self) {
        self.gc.restart();
    }

    /// Live bytes, the `count` operation.
    pub fn gc_count(&self) -> usize {
        self.gc.count_bytes()
    }

    pub fn gc_set_kind(&mut self, kind: GcKind) {
        self.gc.set_kind(kind);
    }

    pub fn gc_set_param(&mut self, idx: usize, value: i32) -> i32 {
        self.gc.set_param(idx, value)
    }

    /// Run queued `__gc` finalizers; the object is alive for the call and
    /// dies in a later cycle.
    pub(crate) fn run_pending_finalizers(&mut self) {
        if self.gc.pending_finalizers.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.gc.pending_finalizers);
        for id in pending {
            let obj = match id {
                GcId::Table(t) => LuaValue::table(t),
                GcId::Userdata(u) => LuaValue::userdata(u),
                _ => continue,
            };
            let gc_fn = self.get_metamethod(&obj, TmKind::Gc);
            if gc_fn.is_nil() {
                continue;
            }
            // finalizer errors are reported, never propagated
            match self.pcall_value(gc_fn, &[obj]) {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        target: "lxlua::gc",
                        error = %self.error_message,
                        "error in __gc finalizer"
                    );
                    self.error_message.clear();
                    self.error_object = LuaValue::nil();
                }
            }
        }
    }

    // ---- value rendering & coercions ----

    pub fn display_value(&self, v: &LuaValue) -> String {
        use crate::lua_value::LuaValueKind as K;
        match v.kind() {
            K::Nil => "nil".to_string(),
            K::Boolean => if v.is_truthy() { "true" } else { "false" }.to_string(),
            K::Number => {
                if let Some(i) = v.as_integer() {
                    let mut buf = itoa::Buffer::new();
                    buf.format(i).to_string()
                } else {
                    let n = v.fltvalue();
                    if n == n.floor() && n.is_finite() && n.abs() < 1e15 {
                        format!("{:.1}", n)
                    } else {
                        format!("{}", n)
                    }
                }
            }
            K::String => {
                let id = v.as_string_id().unwrap();
                self.pool
                    .get_string(id)
                    .map(|s| s.display().into_owned())
                    .unwrap_or_default()
            }
            _ => format!("{}: 0x{:08x}", v.type_name(), v.gc_payload_or_ptr()),
        }
    }

    /// String content of a string value.
    pub fn value_str(&self, v: &LuaValue) -> Option<&[u8]> {
        v.as_string_id().map(|id| self.pool.string_bytes(id))
    }

    /// Number coercion: numbers pass through, strings parse.
    pub fn coerce_number(&self, v: &LuaValue) -> Option<LuaValue> {
        if v.is_number() {
            return Some(*v);
        }
        let bytes = self.value_str(v)?;
        let text = std::str::from_utf8(bytes).ok()?.trim();
        parse_number(text)
    }

    /// Integer coercion with the strict precedence: integers pass, floats
    /// with integral value convert, strings parse then convert.
    pub fn coerce_integer(&self, v: &LuaValue) -> Option<i64> {
        let n = self.coerce_number(v)?;
        if let Some(i) = n.as_integer() {
            return Some(i);
        }
        let f = n.fltvalue();
        if f == f.floor() && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
            Some(f as i64)
        } else {
            None
        }
    }

    // ---- entry points (defined in execute/) ----

    /// Call a function value with arguments, unprotected.
    pub fn call_value(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
        self.refresh_state_ptrs();
        execute::call::vm_call(self, f, args)
    }

    /// Protected call: traps errors, restores the stack, reports
    /// `(false, error)` through the Result.
    pub fn pcall_value(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<MultiValue> {
        self.refresh_state_ptrs();
        execute::call::vm_pcall(self, f, args)
    }

    pub fn resume(&mut self, thread: LuaValue, args: &[LuaValue]) -> LuaResult<ResumeResult> {
        self.refresh_state_ptrs();
        execute::coroutine::vm_resume(self, thread, args)
    }

    /// Reset a coroutine: close pending TBC slots (error status), mark dead.
    pub fn close_thread(&mut self, thread: LuaValue) -> LuaResult<()> {
        self.refresh_state_ptrs();
        execute::coroutine::vm_close_thread(self, thread)
    }

    pub fn thread_status(&mut self, thread: &LuaValue) -> Option<ThreadStatus> {
        let id = thread.as_thread_id()?;
        self.pool.get_thread(id).map(|t| t.state.status)
    }
}

/// Outcome of a resume.
#[derive(Debug, Clone)]
pub enum ResumeResult {
    Yielded(Vec<LuaValue>),
    Returned(Vec<LuaValue>),
}

pub(crate) fn value_gc_id(v: &LuaValue) -> Option<GcId> {
    use crate::lua_value::LuaValueKind as K;
    if !v.is_collectable() {
        return None;
    }
    let id = v.gc_payload();
    match v.kind() {
        K::String => Some(GcId::Str(StringId(id))),
        K::Table | K::Struct | K::Concept | K::Namespace | K::Superstruct => {
            Some(GcId::Table(TableId(id)))
        }
        K::Function => Some(GcId::Function(FunctionId(id))),
        K::Userdata => Some(GcId::Userdata(crate::gc::UserdataId(id))),
        K::Thread => Some(GcId::Thread(ThreadId(id))),
        _ => None,
    }
}

/// Parse a numeral the way the runtime does everywhere: decimal integers
/// stay integers, hex with `0x`, everything else goes through float
/// parsing.
pub fn parse_number(text: &str) -> Option<LuaValue> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if let Ok(u) = u64::from_str_radix(hex, 16) {
            let i = u as i64;
            return Some(LuaValue::integer(if neg { i.wrapping_neg() } else { i }));
        }
        return None;
    }
    if let Ok(i) = body.parse::<i64>() {
        return Some(LuaValue::integer(if neg { i.wrapping_neg() } else { i }));
    }
    if let Ok(f) = body.parse::<f64>() {
        return Some(LuaValue::float(if neg { -f } else { f }));
    }
    None
}

impl LuaValue {
    pub(crate) fn gc_payload_or_ptr(&self) -> usize {
        if self.is_collectable() {
            self.gc_payload() as usize
        } else {
            self.as_light_userdata()
                .or_else(|| self.as_pointer())
                .unwrap_or(0)
        }
    }
}
