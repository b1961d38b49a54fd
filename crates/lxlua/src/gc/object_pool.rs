// Per-kind arena storage for all collectable objects.
//
// Values carry ids, never pointers: arenas are Vec<Option<T>> with a free
// list, so slots may be reused but never move (threads are boxed so their
// execution state keeps a stable address across arena growth).

use std::collections::HashMap;
use std::rc::Rc;

use ahash::RandomState;

use crate::gc::{GcHeader, StringId, TableId, FunctionId, UpvalueId, UserdataId, ThreadId};
use crate::lua_value::{LuaStr, LuaTable, LuaUserdata, LuaValue, Proto};
use crate::lua_vm::{CFunction, LuaState};

/// Longest byte length that still goes through the intern table.
pub const MAX_SHORT_LEN: usize = 40;

// ============ Arena ============

pub struct Arena<T> {
    storage: Vec<Option<T>>,
    free_list: Vec<u32>,
    count: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena { storage: Vec::new(), free_list: Vec::new(), count: 0 }
    }

    #[inline]
    pub fn alloc(&mut self, value: T) -> u32 {
        self.count += 1;
        if let Some(id) = self.free_list.pop() {
            self.storage[id as usize] = Some(value);
            id
        } else {
            let id = self.storage.len() as u32;
            self.storage.push(Some(value));
            id
        }
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.storage.get(id as usize).and_then(|s| s.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.storage.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    #[inline]
    pub fn free(&mut self, id: u32) -> Option<T> {
        let slot = self.storage.get_mut(id as usize)?;
        let value = slot.take()?;
        self.free_list.push(id);
        self.count -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.storage
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.storage
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u32, v)))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.storage
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Stored object shapes ============

pub struct GcString {
    pub header: GcHeader,
    pub data: LuaStr,
}

/// Open upvalues address a live stack slot by absolute index (owner None =
/// the main state); closing moves the value into the upvalue itself. The
/// transition happens exactly once.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open { level: usize, owner: Option<ThreadId> },
    Closed(LuaValue),
}

pub struct GcUpvalue {
    pub header: GcHeader,
    pub state: UpvalueState,
}

impl GcUpvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }

    #[inline]
    pub fn open_level(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { level, .. } => Some(level),
            UpvalueState::Closed(_) => None,
        }
    }

    #[inline]
    pub fn closed_value(&self) -> Option<LuaValue> {
        match self.state {
            UpvalueState::Closed(v) => Some(v),
            UpvalueState::Open { .. } => None,
        }
    }
}

/// Closure body: a Lua prototype with captured upvalues, or a C function
/// with value upvalues.
pub enum ClosureKind {
    Lua {
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
        is_hotfixed: bool,
    },
    C {
        f: CFunction,
        upvalues: Vec<LuaValue>,
    },
}

pub struct GcFunction {
    pub header: GcHeader,
    pub kind: ClosureKind,
}

impl GcFunction {
    #[inline]
    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match &self.kind {
            ClosureKind::Lua { proto, .. } => Some(proto),
            ClosureKind::C { .. } => None,
        }
    }

    #[inline]
    pub fn lua_upvalues(&self) -> &[UpvalueId] {
        match &self.kind {
            ClosureKind::Lua { upvalues, .. } => upvalues,
            ClosureKind::C { .. } => &[],
        }
    }

    #[inline]
    pub fn is_hotfixed(&self) -> bool {
        matches!(self.kind, ClosureKind::Lua { is_hotfixed: true, .. })
    }
}

pub struct GcTable {
    pub header: GcHeader,
    pub data: LuaTable,
}

pub struct GcUserdata {
    pub header: GcHeader,
    pub data: LuaUserdata,
}

pub struct GcThread {
    pub header: GcHeader,
    /// Boxed so raw state pointers stay valid while the arena grows.
    pub state: Box<LuaState>,
}

// ============ The pool ============

pub struct ObjectPool {
    pub strings: Arena<GcString>,
    pub tables: Arena<GcTable>,
    pub functions: Arena<GcFunction>,
    pub upvalues: Arena<GcUpvalue>,
    pub userdata: Arena<GcUserdata>,
    pub threads: Arena<GcThread>,

    /// Process-wide intern table for short strings.
    intern: HashMap<Box<[u8]>, StringId, RandomState>,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Arena::new(),
            tables: Arena::new(),
            functions: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            intern: HashMap::with_hasher(RandomState::new()),
        }
    }

    // ---- strings ----

    /// Intern-or-create. Short strings are unique per byte content; long
    /// strings always allocate.
    pub fn new_string(&mut self, bytes: &[u8], white: u8) -> (StringId, bool) {
        if bytes.len() <= MAX_SHORT_LEN {
            if let Some(&id) = self.intern.get(bytes) {
                return (id, false);
            }
            let s = LuaStr::short(bytes);
            let size = (std::mem::size_of::<GcString>() + bytes.len()) as u32;
            let id = StringId(self.strings.alloc(GcString {
                header: GcHeader::with_white(white, size),
                data: s,
            }));
            self.intern.insert(bytes.into(), id);
            (id, false)
        } else {
            let s = LuaStr::long(bytes);
            let size = (std::mem::size_of::<GcString>() + bytes.len()) as u32;
            let id = StringId(self.strings.alloc(GcString {
                header: GcHeader::with_white(white, size),
                data: s,
            }));
            (id, true)
        }
    }

    /// External string: the bytes stay caller-owned, only the header is
    /// collectable. The destructor runs when the header is reclaimed.
    pub fn new_external_string(
        &mut self,
        ptr: *const u8,
        len: usize,
        dtor: Option<Box<dyn FnOnce(*const u8, usize)>>,
        white: u8,
    ) -> StringId {
        let s = LuaStr::external(ptr, len, dtor);
        let size = std::mem::size_of::<GcString>() as u32;
        StringId(self.strings.alloc(GcString {
            header: GcHeader::with_white(white, size),
            data: s,
        }))
    }

    #[inline(always)]
    pub fn get_string(&self, id: StringId) -> Option<&LuaStr> {
        self.strings.get(id.0).map(|s| &s.data)
    }

    #[inline(always)]
    pub fn string_bytes(&self, id: StringId) -> &[u8] {
        self.strings.get(id.0).map(|s| s.data.as_bytes()).unwrap_or(&[])
    }

    pub fn remove_string(&mut self, id: StringId) {
        if let Some(dead) = self.strings.free(id.0) {
            // drop the intern entry only when it names this exact object
            // (long strings may sit in the map as canonical table keys)
            if self.intern.get(dead.data.as_bytes()) == Some(&id) {
                self.intern.remove(dead.data.as_bytes());
            }
            // LuaStr::drop runs the external destructor if any
        }
    }

    /// Canonical id for table-key use: equal bytes map to one id whatever
    /// the length. Ordinary long strings stay un-interned; only their key
    /// representative enters the map.
    pub fn canonical_key_string(&mut self, bytes: &[u8], white: u8) -> (StringId, bool) {
        if let Some(&id) = self.intern.get(bytes) {
            return (id, false);
        }
        let s = if bytes.len() <= MAX_SHORT_LEN {
            LuaStr::short(bytes)
        } else {
            LuaStr::long(bytes)
        };
        let size = (std::mem::size_of::<GcString>() + bytes.len()) as u32;
        let id = StringId(self.strings.alloc(GcString {
            header: GcHeader::with_white(white, size),
            data: s,
        }));
        self.intern.insert(bytes.into(), id);
        (id, true)
    }

    // ---- tables ----

    pub fn new_table(&mut self, narr: usize, nrec: usize, white: u8) -> TableId {
        let size = (std::mem::size_of::<GcTable>() + narr * 16 + nrec * 32) as u32;
        TableId(self.tables.alloc(GcTable {
            header: GcHeader::with_white(white, size),
            data: LuaTable::with_capacity(narr, nrec),
        }))
    }

    #[inline(always)]
    pub fn get_table(&self, id: TableId) -> Option<&LuaTable> {
        self.tables.get(id.0).map(|t| &t.data)
    }

    #[inline(always)]
    pub fn get_table_mut(&mut self, id: TableId) -> Option<&mut LuaTable> {
        self.tables.get_mut(id.0).map(|t| &mut t.data)
    }

    // ---- functions ----

    pub fn new_lua_closure(&mut self, proto: Rc<Proto>, upvalues: Vec<UpvalueId>, white: u8) -> FunctionId {
        let size = (std::mem::size_of::<GcFunction>() + upvalues.len() * 8) as u32;
        FunctionId(self.functions.alloc(GcFunction {
            header: GcHeader::with_white(white, size),
            kind: ClosureKind::Lua { proto, upvalues, is_hotfixed: false },
        }))
    }

    pub fn new_c_closure(&mut self, f: CFunction, upvalues: Vec<LuaValue>, white: u8) -> FunctionId {
        let size = (std::mem::size_of::<GcFunction>() + upvalues.len() * 16) as u32;
        FunctionId(self.functions.alloc(GcFunction {
            header: GcHeader::with_white(white, size),
            kind: ClosureKind::C { f, upvalues },
        }))
    }

    #[inline(always)]
    pub fn get_function(&self, id: FunctionId) -> Option<&GcFunction> {
        self.functions.get(id.0)
    }

    #[inline(always)]
    pub fn get_function_mut(&mut self, id: FunctionId) -> Option<&mut GcFunction> {
        self.functions.get_mut(id.0)
    }

    // ---- upvalues ----

    pub fn new_upvalue(&mut self, state: UpvalueState, white: u8) -> UpvalueId {
        let size = std::mem::size_of::<GcUpvalue>() as u32;
        UpvalueId(self.upvalues.alloc(GcUpvalue {
            header: GcHeader::with_white(white, size),
            state,
        }))
    }

    #[inline(always)]
    pub fn get_upvalue(&self, id: UpvalueId) -> Option<&GcUpvalue> {
        self.upvalues.get(id.0)
    }

    #[inline(always)]
    pub fn get_upvalue_mut(&mut self, id: UpvalueId) -> Option<&mut GcUpvalue> {
        self.upvalues.get_mut(id.0)
    }

    // ---- userdata ----

    pub fn new_userdata(&mut self, data: LuaUserdata, white: u8) -> UserdataId {
        let size = std::mem::size_of::<GcUserdata>() as u32;
        UserdataId(self.userdata.alloc(GcUserdata {
            header: GcHeader::with_white(white, size),
            data,
        }))
    }

    #[inline(always)]
    pub fn get_userdata(&self, id: UserdataId) -> Option<&GcUserdata> {
        self.userdata.get(id.0)
    }

    #[inline(always)]
    pub fn get_userdata_mut(&mut self, id: UserdataId) -> Option<&mut GcUserdata> {
        self.userdata.get_mut(id.0)
    }

    // ---- threads ----

    pub fn new_thread(&mut self, state: Box<LuaState>, white: u8) -> ThreadId {
        let size = 2048;
        ThreadId(self.threads.alloc(GcThread {
            header: GcHeader::with_white(white, size),
            state,
        }))
    }

    #[inline(always)]
    pub fn get_thread(&self, id: ThreadId) -> Option<&GcThread> {
        self.threads.get(id.0)
    }

    #[inline(always)]
    pub fn get_thread_mut(&mut self, id: ThreadId) -> Option<&mut GcThread> {
        self.threads.get_mut(id.0)
    }

    /// Stable pointer to a thread's execution state.
    pub fn thread_state_ptr(&mut self, id: ThreadId) -> Option<*mut LuaState> {
        self.threads
            .get_mut(id.0)
            .map(|t| &mut *t.state as *mut LuaState)
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
