// Garbage collector.
//
// Two runtime-switchable modes:
// - incremental tri-color mark-sweep with debt-based pacing
// - generational: minor collections over the young set, with periodic
//   majors falling back to the incremental machinery
//
// The atomic phase re-marks roots, drains the gray lists, clears weak
// tables, and queues unreachable finalizable objects (resurrecting them
// until their __gc has run). Sweeping walks the arenas and frees objects
// still wearing the previous cycle's white.

mod gc_id;
mod gc_object;
mod object_pool;

pub use gc_id::*;
pub use gc_object::*;
pub use object_pool::*;

use std::rc::Rc;

use crate::lua_value::{LuaValue, Proto};

// Parameter indices.
pub const PAUSE: usize = 0;
pub const STEPMUL: usize = 1;
pub const STEPSIZE: usize = 2;
pub const MINORMUL: usize = 3;
pub const MINORMAJOR: usize = 4;
pub const MAJORMINOR: usize = 5;
pub const GCPARAM_COUNT: usize = 6;

const DEFAULT_PAUSE: i32 = 200;
const DEFAULT_STEPMUL: i32 = 200;
const DEFAULT_STEPSIZE: i32 = 13; // KB
const DEFAULT_MINORMUL: i32 = 20;
const DEFAULT_MINORMAJOR: i32 = 100;
const DEFAULT_MAJORMINOR: i32 = 100;

const SWEEP_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Inc,
    GenMinor,
    GenMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Propagate,
    EnterAtomic,
    Atomic,
    SwpAllGc,
    SwpEnd,
    CallFin,
    Pause,
}

impl GcState {
    pub fn is_sweep_phase(self) -> bool {
        matches!(self, GcState::SwpAllGc | GcState::SwpEnd)
    }

    /// During marking, black must never point at white.
    pub fn keep_invariant(self) -> bool {
        matches!(self, GcState::Propagate | GcState::EnterAtomic | GcState::Atomic)
    }
}

/// Everything the collector needs from the VM besides the pool: live
/// values on non-pool stacks, open upvalues of the running chain, and the
/// interned keys it must read from metatables.
pub struct RootSet {
    pub values: Vec<LuaValue>,
    pub upvalues: Vec<UpvalueId>,
}

impl RootSet {
    pub fn new() -> Self {
        RootSet { values: Vec::new(), upvalues: Vec::new() }
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collection_count: usize,
    pub minor_collections: usize,
    pub objects_collected: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub finalizers_queued: usize,
}

pub struct GC {
    /// Bytes allocated but not yet paid for; positive debt triggers work.
    pub gc_debt: isize,
    pub total_bytes: isize,
    gc_marked: isize,
    gc_majorminor: isize,

    pub gc_state: GcState,
    pub gc_kind: GcKind,
    current_white: u8,
    gc_stopem: bool,
    gc_stopped: bool,

    pub gc_params: [i32; GCPARAM_COUNT],

    gray: Vec<GcId>,
    grayagain: Vec<GcId>,

    /// Weak tables found during marking, processed in the atomic phase.
    weak_tables: Vec<TableId>,
    /// Dead-but-finalizable objects resurrected until their __gc runs.
    pub pending_finalizers: Vec<GcId>,

    /// Interned keys, pinned by the VM at startup.
    pub mode_key: Option<StringId>,
    pub gc_key: Option<StringId>,

    sweep_cursor: usize,
    pub stats: GcStats,
}

impl GC {
    pub fn new() -> Self {
        GC {
            gc_debt: 0,
            total_bytes: 0,
            gc_marked: 0,
            gc_majorminor: 0,
            gc_state: GcState::Pause,
            gc_kind: GcKind::GenMinor,
            current_white: 0,
            gc_stopem: false,
            gc_stopped: false,
            gc_params: [
                DEFAULT_PAUSE,
                DEFAULT_STEPMUL,
                DEFAULT_STEPSIZE,
                DEFAULT_MINORMUL,
                DEFAULT_MINORMAJOR,
                DEFAULT_MAJORMINOR,
            ],
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak_tables: Vec::new(),
            pending_finalizers: Vec::new(),
            mode_key: None,
            gc_key: None,
            sweep_cursor: 0,
            stats: GcStats::default(),
        }
    }

    #[inline(always)]
    pub fn current_white(&self) -> u8 {
        self.current_white
    }

    pub fn stop(&mut self) {
        self.gc_stopped = true;
    }

    pub fn restart(&mut self) {
        self.gc_stopped = false;
    }

    pub fn is_running(&self) -> bool {
        !self.gc_stopped
    }

    /// Runtime mode switch.
    pub fn set_kind(&mut self, kind: GcKind) {
        if self.gc_kind == kind {
            return;
        }
        self.gc_majorminor = self.gc_marked;
        self.gc_kind = kind;
        self.gc_state = GcState::Pause;
    }

    /// Approximate live bytes.
    pub fn count_bytes(&self) -> usize {
        (self.total_bytes - self.gc_debt).max(0) as usize
    }

    // ---- accounting ----

    /// Account a fresh allocation; the object was created in current white.
    #[inline]
    pub fn track_allocation(&mut self, size: usize) {
        let sz = size as isize;
        self.total_bytes += sz * 2;
        self.gc_debt += sz;
        self.stats.bytes_allocated += size;
    }

    #[inline]
    pub fn record_deallocation(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size as isize);
        self.stats.bytes_freed += size;
    }

    #[inline(always)]
    pub fn should_collect(&self) -> bool {
        !self.gc_stopped && self.gc_debt > 0
    }

    pub fn set_debt(&mut self, debt: isize) {
        const MAX_DEBT: isize = isize::MAX / 2;
        let real = self.total_bytes - self.gc_debt;
        let debt = debt.min(MAX_DEBT - real);
        self.total_bytes = real + debt;
        self.gc_debt = debt;
    }

    fn apply_param(&self, idx: usize, value: isize) -> isize {
        let p = self.gc_params[idx];
        if p >= 0 {
            value * p as isize / 100
        } else {
            value * 100 / (-p) as isize
        }
    }

    pub fn set_param(&mut self, idx: usize, value: i32) -> i32 {
        let old = self.gc_params[idx];
        self.gc_params[idx] = value;
        old
    }

    // ---- step driver ----

    pub fn step(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        self.step_internal(roots, pool, false)
    }

    pub fn step_internal(&mut self, roots: &RootSet, pool: &mut ObjectPool, force: bool) {
        if !force && (self.gc_stopped || self.gc_debt <= 0) {
            return;
        }
        match self.gc_kind {
            GcKind::Inc | GcKind::GenMajor => self.inc_step(roots, pool),
            GcKind::GenMinor => {
                self.young_collection(roots, pool);
                self.set_minor_debt();
            }
        }
    }

    /// Full stop-the-world cycle.
    pub fn full_collection(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        self.gc_state = GcState::Pause;
        self.restart_collection(roots, pool);
        while !self.gray.is_empty() {
            self.propagate_mark(pool);
        }
        self.atomic(roots, pool);
        self.sweep_all(pool);
        self.gc_state = GcState::Pause;
        self.set_pause();
    }

    fn inc_step(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        let stepsize = self.apply_param(STEPSIZE, 100) * 1024;
        let stepmul = self.apply_param(STEPMUL, 200);
        let mut work2do = self.gc_debt * stepmul / 100;
        let fast = work2do == 0;

        loop {
            let w = self.single_step(roots, pool, fast);
            match w {
                StepResult::Pause => break,
                StepResult::Atomic => {
                    if !fast {
                        break;
                    }
                }
                StepResult::Work(n) => {
                    work2do -= n;
                }
            }
            if !fast && work2do <= 0 {
                break;
            }
        }

        if self.gc_state == GcState::Pause {
            self.set_pause();
        } else {
            self.set_debt(-stepsize);
        }
    }

    fn single_step(&mut self, roots: &RootSet, pool: &mut ObjectPool, fast: bool) -> StepResult {
        if self.gc_stopem {
            return StepResult::Work(0);
        }
        self.gc_stopem = true;

        let result = match self.gc_state {
            GcState::Pause => {
                self.restart_collection(roots, pool);
                self.gc_state = GcState::Propagate;
                StepResult::Work(1)
            }
            GcState::Propagate => {
                if fast || self.gray.is_empty() {
                    self.gc_state = GcState::EnterAtomic;
                    StepResult::Work(1)
                } else {
                    StepResult::Work(self.propagate_mark(pool))
                }
            }
            GcState::EnterAtomic => {
                self.atomic(roots, pool);
                self.gc_state = GcState::SwpAllGc;
                self.sweep_cursor = 0;
                StepResult::Atomic
            }
            GcState::SwpAllGc => {
                let done = self.sweep_step(pool, fast);
                if done {
                    self.gc_state = GcState::SwpEnd;
                }
                StepResult::Work(SWEEP_MAX as isize)
            }
            GcState::SwpEnd => {
                self.gc_state = GcState::CallFin;
                StepResult::Work(1)
            }
            GcState::CallFin => {
                // finalizer bodies run at the VM layer; here the cycle ends
                self.gc_state = GcState::Pause;
                StepResult::Pause
            }
            GcState::Atomic => StepResult::Work(0),
        };

        self.gc_stopem = false;
        result
    }

    // ---- marking ----

    fn restart_collection(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        self.stats.collection_count += 1;
        self.gray.clear();
        self.grayagain.clear();
        self.weak_tables.clear();
        self.gc_marked = 0;
        self.make_all_white(pool);
        self.mark_roots(roots, pool);
    }

    fn mark_roots(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        let vals: Vec<LuaValue> = roots.values.clone();
        for v in &vals {
            self.mark_value(v, pool);
        }
        for &uv in &roots.upvalues {
            self.mark_upvalue_id(uv, pool);
        }
        // queued finalizables stay alive until their __gc has run
        let pending: Vec<GcId> = self.pending_finalizers.clone();
        for id in pending {
            self.mark_id(id, pool);
        }
    }

    fn make_all_white(&mut self, pool: &mut ObjectPool) {
        let white = self.current_white;
        for (_, o) in pool.tables.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
        for (_, o) in pool.functions.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
        for (_, o) in pool.upvalues.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
        for (_, o) in pool.strings.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
        for (_, o) in pool.userdata.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
        for (_, o) in pool.threads.iter_mut() {
            if !o.header.is_fixed() {
                o.header.make_white(white);
            }
        }
    }

    pub fn mark_value(&mut self, value: &LuaValue, pool: &mut ObjectPool) {
        if !value.is_collectable() {
            return;
        }
        let id = value.gc_payload();
        use crate::lua_value::LuaValueKind as K;
        match value.kind() {
            K::String => {
                if let Some(s) = pool.strings.get_mut(id) {
                    if s.header.is_white() {
                        s.header.make_black(); // strings are leaves
                    }
                }
            }
            K::Table | K::Struct | K::Concept | K::Namespace | K::Superstruct => {
                self.mark_table_id(TableId(id), pool);
            }
            K::Function => {
                if let Some(f) = pool.functions.get_mut(id) {
                    if f.header.is_white() {
                        f.header.make_gray();
                        self.gray.push(GcId::Function(FunctionId(id)));
                    }
                }
            }
            K::Userdata => {
                if let Some(u) = pool.userdata.get_mut(id) {
                    if u.header.is_white() {
                        u.header.make_gray();
                        self.gray.push(GcId::Userdata(UserdataId(id)));
                    }
                }
            }
            K::Thread => {
                if let Some(t) = pool.threads.get_mut(id) {
                    if t.header.is_white() {
                        t.header.make_gray();
                        self.gray.push(GcId::Thread(ThreadId(id)));
                    }
                }
            }
            _ => {}
        }
    }

    pub fn mark_table_id(&mut self, id: TableId, pool: &mut ObjectPool) {
        if let Some(t) = pool.tables.get_mut(id.0) {
            if t.header.is_white() {
                t.header.make_gray();
                self.gray.push(GcId::Table(id));
            }
        }
    }

    fn mark_upvalue_id(&mut self, id: UpvalueId, pool: &mut ObjectPool) {
        if let Some(u) = pool.upvalues.get_mut(id.0) {
            if u.header.is_white() {
                u.header.make_gray();
                self.gray.push(GcId::Upvalue(id));
            }
        }
    }

    fn mark_id(&mut self, id: GcId, pool: &mut ObjectPool) {
        match id {
            GcId::Str(s) => {
                if let Some(o) = pool.strings.get_mut(s.0) {
                    o.header.make_black();
                }
            }
            GcId::Table(t) => self.mark_table_id(t, pool),
            GcId::Function(f) => {
                if let Some(o) = pool.functions.get_mut(f.0) {
                    if o.header.is_white() {
                        o.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Upvalue(u) => self.mark_upvalue_id(u, pool),
            GcId::Userdata(u) => {
                if let Some(o) = pool.userdata.get_mut(u.0) {
                    if o.header.is_white() {
                        o.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Thread(t) => {
                if let Some(o) = pool.threads.get_mut(t.0) {
                    if o.header.is_white() {
                        o.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
        }
    }

    fn propagate_mark(&mut self, pool: &mut ObjectPool) -> isize {
        if let Some(id) = self.gray.pop() {
            self.traverse_one(id, pool);
            let size = self.object_size(id, pool);
            self.gc_marked += size;
            size
        } else {
            0
        }
    }

    fn object_size(&self, id: GcId, pool: &ObjectPool) -> isize {
        let header = match id {
            GcId::Str(s) => pool.strings.get(s.0).map(|o| o.header),
            GcId::Table(t) => pool.tables.get(t.0).map(|o| o.header),
            GcId::Function(f) => pool.functions.get(f.0).map(|o| o.header),
            GcId::Upvalue(u) => pool.upvalues.get(u.0).map(|o| o.header),
            GcId::Userdata(u) => pool.userdata.get(u.0).map(|o| o.header),
            GcId::Thread(t) => pool.threads.get(t.0).map(|o| o.header),
        };
        header.map(|h| h.size as isize).unwrap_or(64)
    }

    fn traverse_one(&mut self, id: GcId, pool: &mut ObjectPool) {
        match id {
            GcId::Str(s) => {
                if let Some(o) = pool.strings.get_mut(s.0) {
                    o.header.make_black();
                }
            }
            GcId::Table(tid) => {
                let (entries, metatable) = match pool.tables.get_mut(tid.0) {
                    Some(t) => {
                        t.header.make_black();
                        (t.data.iter_all(), t.data.metatable())
                    }
                    None => return,
                };
                // weakness is read off the metatable's __mode field; weak
                // sides are not traced here, the atomic phase decides which
                // entries survive
                let (wk, wv) = self.table_is_weak(metatable, pool);
                if wk || wv {
                    self.weak_tables.push(tid);
                }
                for (k, v) in &entries {
                    if !wk {
                        self.mark_value(k, pool);
                    }
                    if !wv {
                        self.mark_value(v, pool);
                    }
                }
                if let Some(mt) = metatable {
                    self.mark_table_id(mt, pool);
                }
            }
            GcId::Function(fid) => {
                enum Body {
                    Lua(Vec<UpvalueId>, Rc<Proto>),
                    C(Vec<LuaValue>),
                }
                let body = match pool.functions.get_mut(fid.0) {
                    Some(f) => {
                        f.header.make_black();
                        match &f.kind {
                            ClosureKind::Lua { proto, upvalues, .. } => {
                                Body::Lua(upvalues.clone(), proto.clone())
                            }
                            ClosureKind::C { upvalues, .. } => Body::C(upvalues.clone()),
                        }
                    }
                    None => return,
                };
                match body {
                    Body::Lua(upvals, proto) => {
                        for uv in upvals {
                            self.mark_upvalue_id(uv, pool);
                        }
                        self.mark_proto(&proto, pool);
                    }
                    Body::C(upvals) => {
                        for v in &upvals {
                            self.mark_value(v, pool);
                        }
                    }
                }
            }
            GcId::Upvalue(uid) => {
                let closed = match pool.upvalues.get_mut(uid.0) {
                    Some(u) => {
                        u.header.make_black();
                        u.closed_value()
                    }
                    None => return,
                };
                if let Some(v) = closed {
                    self.mark_value(&v, pool);
                }
            }
            GcId::Userdata(uid) => {
                let (mt, uvals) = match pool.userdata.get_mut(uid.0) {
                    Some(u) => {
                        u.header.make_black();
                        (u.data.metatable, u.data.user_values.clone())
                    }
                    None => return,
                };
                if let Some(mt) = mt {
                    self.mark_table_id(mt, pool);
                }
                for v in &uvals {
                    self.mark_value(v, pool);
                }
            }
            GcId::Thread(tid) => {
                let (values, upvals) = match pool.threads.get_mut(tid.0) {
                    Some(t) => {
                        t.header.make_black();
                        t.state.gc_refs()
                    }
                    None => return,
                };
                for v in &values {
                    self.mark_value(v, pool);
                }
                for uv in upvals {
                    self.mark_upvalue_id(uv, pool);
                }
            }
        }
    }

    /// Constants, nested prototypes and queued sleeping calls.
    fn mark_proto(&mut self, proto: &Rc<Proto>, pool: &mut ObjectPool) {
        for k in &proto.constants {
            self.mark_value(k, pool);
        }
        if let Some(q) = proto.call_queue.borrow().as_ref() {
            for node in q.iter() {
                for v in &node.args {
                    self.mark_value(v, pool);
                }
            }
        }
        for child in &proto.protos {
            self.mark_proto(child, pool);
        }
    }

    fn table_is_weak(&self, metatable: Option<TableId>, pool: &ObjectPool) -> (bool, bool) {
        let Some(mt) = metatable else { return (false, false) };
        let Some(mode_key) = self.mode_key else { return (false, false) };
        let Some(t) = pool.get_table(mt) else { return (false, false) };
        let mode = t.get_str(mode_key);
        let Some(sid) = mode.as_string_id() else { return (false, false) };
        let bytes = pool.string_bytes(sid);
        (bytes.contains(&b'k'), bytes.contains(&b'v'))
    }

    // ---- atomic phase ----

    fn atomic(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        self.gc_state = GcState::Atomic;

        self.mark_roots(roots, pool);
        while !self.gray.is_empty() {
            self.propagate_mark(pool);
        }

        let grayagain = std::mem::take(&mut self.grayagain);
        for id in grayagain {
            self.traverse_one(id, pool);
        }
        while !self.gray.is_empty() {
            self.propagate_mark(pool);
        }

        self.queue_finalizables(pool);
        while !self.gray.is_empty() {
            self.propagate_mark(pool);
        }

        self.clear_weak_tables(pool);

        self.current_white ^= 1;
    }

    /// White objects with a __gc metamethod get resurrected and queued;
    /// their finalizer runs at the VM layer, then they die for real.
    fn queue_finalizables(&mut self, pool: &mut ObjectPool) {
        let Some(gc_key) = self.gc_key else { return };

        let mut found: Vec<GcId> = Vec::new();
        let table_ids = pool.tables.ids();
        for id in table_ids {
            let Some(t) = pool.tables.get(id) else { continue };
            if !t.header.is_white() || t.header.to_finalize() {
                continue;
            }
            let Some(mt) = t.data.metatable() else { continue };
            let has_gc = pool
                .get_table(mt)
                .map(|m| !m.get_str(gc_key).is_nil())
                .unwrap_or(false);
            if has_gc {
                found.push(GcId::Table(TableId(id)));
            }
        }
        let ud_ids = pool.userdata.ids();
        for id in ud_ids {
            let Some(u) = pool.userdata.get(id) else { continue };
            if !u.header.is_white() || u.header.to_finalize() {
                continue;
            }
            let Some(mt) = u.data.metatable else { continue };
            let has_gc = pool
                .get_table(mt)
                .map(|m| !m.get_str(gc_key).is_nil())
                .unwrap_or(false);
            if has_gc {
                found.push(GcId::Userdata(UserdataId(id)));
            }
        }

        for id in found {
            match id {
                GcId::Table(t) => {
                    if let Some(o) = pool.tables.get_mut(t.0) {
                        o.header.set_finalized();
                    }
                }
                GcId::Userdata(u) => {
                    if let Some(o) = pool.userdata.get_mut(u.0) {
                        o.header.set_finalized();
                    }
                }
                _ => {}
            }
            self.mark_id(id, pool);
            self.pending_finalizers.push(id);
            self.stats.finalizers_queued += 1;
        }
    }

    /// Drop weak entries whose key or value died this cycle.
    fn clear_weak_tables(&mut self, pool: &mut ObjectPool) {
        let weak = std::mem::take(&mut self.weak_tables);
        for tid in weak {
            let mt = match pool.tables.get(tid.0) {
                Some(t) => t.data.metatable(),
                None => continue,
            };
            let (wk, wv) = self.table_is_weak(mt, pool);
            if !wk && !wv {
                continue;
            }
            // decide liveness before borrowing the table mutably
            let entries = match pool.tables.get(tid.0) {
                Some(t) => t.data.iter_all(),
                None => continue,
            };
            let mut keep_flags: Vec<bool> = Vec::with_capacity(entries.len());
            for (k, v) in &entries {
                let k_alive = !wk || self.value_alive(k, pool);
                let v_alive = !wv || self.value_alive(v, pool);
                keep_flags.push(k_alive && v_alive);
            }
            let mut idx = 0;
            if let Some(t) = pool.tables.get_mut(tid.0) {
                t.data.retain_pairs(|_, _| {
                    let keep = keep_flags.get(idx).copied().unwrap_or(true);
                    idx += 1;
                    keep
                });
            }
        }
    }

    fn value_alive(&self, v: &LuaValue, pool: &ObjectPool) -> bool {
        if !v.is_collectable() {
            return true;
        }
        let id = v.gc_payload();
        use crate::lua_value::LuaValueKind as K;
        let header = match v.kind() {
            K::String => pool.strings.get(id).map(|o| o.header),
            K::Table | K::Struct | K::Concept | K::Namespace | K::Superstruct => {
                pool.tables.get(id).map(|o| o.header)
            }
            K::Function => pool.functions.get(id).map(|o| o.header),
            K::Userdata => pool.userdata.get(id).map(|o| o.header),
            K::Thread => pool.threads.get(id).map(|o| o.header),
            _ => None,
        };
        header.map(|h| !h.is_white()).unwrap_or(false)
    }

    // ---- sweeping ----

    fn sweep_step(&mut self, pool: &mut ObjectPool, fast: bool) -> bool {
        #[derive(Clone, Copy)]
        enum ArenaKind {
            Tables,
            Functions,
            Upvalues,
            Strings,
            Userdata,
            Threads,
        }
        const ORDER: [ArenaKind; 6] = [
            ArenaKind::Tables,
            ArenaKind::Functions,
            ArenaKind::Upvalues,
            ArenaKind::Strings,
            ArenaKind::Userdata,
            ArenaKind::Threads,
        ];

        let max = if fast { usize::MAX } else { SWEEP_MAX };
        let other_white = 1 - self.current_white;
        let mut swept = 0usize;

        for kind in ORDER {
            if swept >= max {
                break;
            }
            let budget = max - swept;
            let dead: Vec<(u32, usize)> = match kind {
                ArenaKind::Tables => pool
                    .tables
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
                ArenaKind::Functions => pool
                    .functions
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
                ArenaKind::Upvalues => pool
                    .upvalues
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
                ArenaKind::Strings => pool
                    .strings
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
                ArenaKind::Userdata => pool
                    .userdata
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
                ArenaKind::Threads => pool
                    .threads
                    .iter()
                    .filter(|(_, o)| !o.header.is_fixed() && o.header.is_dead(other_white))
                    .map(|(id, o)| (id, o.header.size as usize))
                    .take(budget)
                    .collect(),
            };
            for (id, size) in dead {
                match kind {
                    ArenaKind::Tables => {
                        pool.tables.free(id);
                    }
                    ArenaKind::Functions => {
                        pool.functions.free(id);
                    }
                    ArenaKind::Upvalues => {
                        pool.upvalues.free(id);
                    }
                    ArenaKind::Strings => pool.remove_string(StringId(id)),
                    ArenaKind::Userdata => {
                        pool.userdata.free(id);
                    }
                    ArenaKind::Threads => {
                        pool.threads.free(id);
                    }
                }
                self.record_deallocation(size);
                self.stats.objects_collected += 1;
                swept += 1;
            }
        }

        swept < max
    }

    fn sweep_all(&mut self, pool: &mut ObjectPool) {
        while !self.sweep_step(pool, true) {}
    }

    fn set_pause(&mut self) {
        let threshold = self.apply_param(PAUSE, self.gc_marked);
        let debt = threshold - self.total_bytes;
        self.set_debt(debt);
    }

    fn set_minor_debt(&mut self) {
        let base = if self.gc_majorminor > 0 {
            self.gc_majorminor
        } else {
            self.gc_marked.max(1024 * 1024)
        };
        let debt = self.apply_param(MINORMUL, base);
        self.set_debt(-debt);
    }

    /// Minor collection: a compact full mark over the young set. Survivors
    /// age; enough old growth shifts the next collection to major.
    fn young_collection(&mut self, roots: &RootSet, pool: &mut ObjectPool) {
        self.stats.minor_collections += 1;
        self.restart_collection(roots, pool);
        while !self.gray.is_empty() {
            self.propagate_mark(pool);
        }
        self.atomic(roots, pool);
        self.age_survivors(pool);
        self.sweep_all(pool);
        self.gc_state = GcState::Pause;

        // shift to a major collection when the marked set outgrew the
        // last major baseline by MINORMAJOR percent
        if self.gc_majorminor > 0 {
            let limit = self.apply_param(MINORMAJOR, self.gc_majorminor);
            if self.gc_marked > self.gc_majorminor + limit {
                self.gc_kind = GcKind::GenMajor;
            }
        } else {
            self.gc_majorminor = self.gc_marked;
        }
    }

    fn age_survivors(&mut self, pool: &mut ObjectPool) {
        macro_rules! age_arena {
            ($arena:ident) => {
                for (_, o) in pool.$arena.iter_mut() {
                    if o.header.is_fixed() || o.header.is_white() {
                        continue;
                    }
                    let age = o.header.age();
                    let next = match age {
                        G_NEW => G_SURVIVAL,
                        G_SURVIVAL => G_OLD1,
                        G_OLD1 => G_OLD,
                        G_OLD0 => G_OLD1,
                        G_TOUCHED1 => G_TOUCHED2,
                        G_TOUCHED2 => G_OLD,
                        other => other,
                    };
                    o.header.set_age(next);
                }
            };
        }
        age_arena!(tables);
        age_arena!(functions);
        age_arena!(upvalues);
        age_arena!(strings);
        age_arena!(userdata);
        age_arena!(threads);
    }

    // ---- write barriers ----

    /// Forward barrier: black object gained a reference to white child;
    /// mark the child now (or whiten the parent during sweep).
    pub fn barrier(&mut self, parent: GcId, child: GcId, pool: &mut ObjectPool) {
        let p_black = self.header_of(parent, pool).map(|h| h.is_black()).unwrap_or(false);
        let p_old = self.header_of(parent, pool).map(|h| h.is_old()).unwrap_or(false);
        let c_white = self.header_of(child, pool).map(|h| h.is_white()).unwrap_or(false);
        if !p_black || !c_white {
            return;
        }
        if self.gc_state.keep_invariant() {
            self.mark_id(child, pool);
            if p_old {
                if let Some(h) = self.header_of_mut(child, pool) {
                    h.make_old0();
                }
            }
        } else if self.gc_state.is_sweep_phase() && self.gc_kind != GcKind::GenMinor {
            let white = self.current_white;
            if let Some(h) = self.header_of_mut(parent, pool) {
                h.make_white(white);
            }
        }
    }

    /// Backward barrier: re-gray a mutated black container so the atomic
    /// phase revisits it.
    pub fn barrier_back(&mut self, obj: GcId, pool: &mut ObjectPool) {
        let (is_black, age) = match self.header_of(obj, pool) {
            Some(h) => (h.is_black(), h.age()),
            None => return,
        };
        if !is_black {
            return;
        }
        if self.gc_kind == GcKind::GenMinor {
            if age < G_OLD0 || age == G_TOUCHED1 {
                return;
            }
        }
        if age == G_TOUCHED2 {
            if let Some(h) = self.header_of_mut(obj, pool) {
                h.make_gray();
            }
        } else {
            if !self.grayagain.contains(&obj) {
                self.grayagain.push(obj);
            }
            if let Some(h) = self.header_of_mut(obj, pool) {
                h.make_gray();
            }
        }
        if age >= G_OLD0 {
            if let Some(h) = self.header_of_mut(obj, pool) {
                h.make_touched1();
            }
        }
    }

    fn header_of(&self, id: GcId, pool: &ObjectPool) -> Option<GcHeader> {
        match id {
            GcId::Str(s) => pool.strings.get(s.0).map(|o| o.header),
            GcId::Table(t) => pool.tables.get(t.0).map(|o| o.header),
            GcId::Function(f) => pool.functions.get(f.0).map(|o| o.header),
            GcId::Upvalue(u) => pool.upvalues.get(u.0).map(|o| o.header),
            GcId::Userdata(u) => pool.userdata.get(u.0).map(|o| o.header),
            GcId::Thread(t) => pool.threads.get(t.0).map(|o| o.header),
        }
    }

    fn header_of_mut<'a>(&self, id: GcId, pool: &'a mut ObjectPool) -> Option<&'a mut GcHeader> {
        match id {
            GcId::Str(s) => pool.strings.get_mut(s.0).map(|o| &mut o.header),
            GcId::Table(t) => pool.tables.get_mut(t.0).map(|o| &mut o.header),
            GcId::Function(f) => pool.functions.get_mut(f.0).map(|o| &mut o.header),
            GcId::Upvalue(u) => pool.upvalues.get_mut(u.0).map(|o| &mut o.header),
            GcId::Userdata(u) => pool.userdata.get_mut(u.0).map(|o| &mut o.header),
            GcId::Thread(t) => pool.threads.get_mut(t.0).map(|o| &mut o.header),
        }
    }

    /// Pin an object forever (registry, metamethod names).
    pub fn fix_object(&mut self, id: GcId, pool: &mut ObjectPool) {
        if let Some(h) = self.header_of_mut(id, pool) {
            h.set_fixed();
        }
    }
}

enum StepResult {
    Work(isize),
    Pause,
    Atomic,
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}
