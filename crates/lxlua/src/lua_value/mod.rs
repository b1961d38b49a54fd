// Value-layer data model: tagged values, strings, tables, prototypes.

pub mod access_log;
pub mod lua_table;
pub mod lua_value;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub use access_log::{AccessLog, AccessLogFilter, AccessOp, AccessRecord};
pub use lua_table::{LuaTable, TableKey};
pub use lua_value::*;

use crate::lua_vm::LuaResult;

/// Fixed seeds so cached string hashes stay comparable across the process.
const STR_SEED: (u64, u64, u64, u64) = (
    0x9e3779b97f4a7c15,
    0xbf58476d1ce4e5b9,
    0x94d049bb133111eb,
    0x2545f4914f6cdd1d,
);

fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    let state = ahash::RandomState::with_seeds(STR_SEED.0, STR_SEED.1, STR_SEED.2, STR_SEED.3);
    let mut h = state.build_hasher();
    h.write(bytes);
    h.finish()
}

// ============ Strings ============

enum StrPayload {
    Owned { bytes: Box<[u8]>, short: bool },
    External {
        ptr: *const u8,
        len: usize,
        dtor: Option<Box<dyn FnOnce(*const u8, usize)>>,
    },
}

/// Immutable byte string with a cached hash. Short strings are interned by
/// the pool; long strings are not; external strings borrow caller-owned
/// bytes and run a destructor when the header is reclaimed.
pub struct LuaStr {
    hash: u64,
    payload: StrPayload,
}

impl LuaStr {
    pub fn short(bytes: &[u8]) -> Self {
        LuaStr {
            hash: hash_bytes(bytes),
            payload: StrPayload::Owned { bytes: bytes.into(), short: true },
        }
    }

    pub fn long(bytes: &[u8]) -> Self {
        LuaStr {
            hash: hash_bytes(bytes),
            payload: StrPayload::Owned { bytes: bytes.into(), short: false },
        }
    }

    pub fn external(ptr: *const u8, len: usize, dtor: Option<Box<dyn FnOnce(*const u8, usize)>>) -> Self {
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        LuaStr {
            hash: hash_bytes(bytes),
            payload: StrPayload::External { ptr, len, dtor },
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.payload {
            StrPayload::Owned { bytes, .. } => bytes,
            StrPayload::External { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_short(&self) -> bool {
        matches!(self.payload, StrPayload::Owned { short: true, .. })
    }

    #[inline]
    pub fn cached_hash(&self) -> u64 {
        self.hash
    }
}

impl Drop for LuaStr {
    fn drop(&mut self) {
        if let StrPayload::External { ptr, len, dtor } = &mut self.payload {
            if let Some(d) = dtor.take() {
                d(*ptr, *len);
            }
        }
    }
}

impl PartialEq for LuaStr {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for LuaStr {}

// ============ Multi-value returns ============

/// Return-value bundle with inline storage for the common 0..2 case.
#[derive(Debug, Clone)]
pub struct MultiValue {
    inline: [LuaValue; 2],
    inline_count: u8,
    overflow: Option<Vec<LuaValue>>,
}

impl MultiValue {
    #[inline(always)]
    pub fn empty() -> Self {
        MultiValue { inline: [LuaValue::nil(); 2], inline_count: 0, overflow: None }
    }

    #[inline(always)]
    pub fn single(value: LuaValue) -> Self {
        MultiValue { inline: [value, LuaValue::nil()], inline_count: 1, overflow: None }
    }

    #[inline(always)]
    pub fn pair(a: LuaValue, b: LuaValue) -> Self {
        MultiValue { inline: [a, b], inline_count: 2, overflow: None }
    }

    pub fn from_vec(values: Vec<LuaValue>) -> Self {
        match values.len() {
            0 => Self::empty(),
            1 => Self::single(values[0]),
            2 => Self::pair(values[0], values[1]),
            _ => MultiValue { inline: [LuaValue::nil(); 2], inline_count: 0, overflow: Some(values) },
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        match &self.overflow {
            Some(v) => v.len(),
            None => self.inline_count as usize,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> LuaValue {
        match &self.overflow {
            Some(v) => v.get(i).copied().unwrap_or_else(LuaValue::nil),
            None => {
                if i < self.inline_count as usize {
                    self.inline[i]
                } else {
                    LuaValue::nil()
                }
            }
        }
    }

    #[inline]
    pub fn first(&self) -> LuaValue {
        self.get(0)
    }

    pub fn values(&self) -> Vec<LuaValue> {
        match &self.overflow {
            Some(v) => v.clone(),
            None => self.inline[..self.inline_count as usize].to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = LuaValue> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

// ============ Prototype metadata ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub name: Option<String>,
    /// Captured from the enclosing function's stack (true) or from its
    /// upvalue array (false).
    pub instack: bool,
    pub idx: u8,
    pub kind: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: String,
    pub startpc: u32,
    pub endpc: u32,
}

/// Sparse anchor for the delta-encoded line info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// Marker inside the dense delta stream: consult the anchors instead.
pub const ABS_LINE_MARK: i8 = i8::MIN;
/// Maximum instructions between anchors.
const LINES_PER_ANCHOR: u32 = 128;

// ============ Call queue (function sleep/wake) ============

#[derive(Debug, Clone)]
pub struct CallNode {
    pub args: Vec<LuaValue>,
}

/// FIFO of calls that arrived while the prototype was sleeping.
#[derive(Debug, Default)]
pub struct CallQueue {
    nodes: VecDeque<CallNode>,
}

impl CallQueue {
    pub fn new() -> Self {
        CallQueue { nodes: VecDeque::new() }
    }

    pub fn push(&mut self, args: Vec<LuaValue>) {
        self.nodes.push_back(CallNode { args });
    }

    pub fn pop(&mut self) -> Option<CallNode> {
        self.nodes.pop_front()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallNode> {
        self.nodes.iter()
    }
}

// ============ Prototype ============

/// Native-code slot attached to a prototype. The pages live exactly as long
/// as the owning prototype; `Proto::drop` releases them.
#[derive(Debug, Clone, Copy)]
pub struct JitSlot {
    pub code: *mut u8,
    pub size: usize,
}

impl JitSlot {
    pub const fn empty() -> Self {
        JitSlot { code: std::ptr::null_mut(), size: 0 }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        !self.code.is_null()
    }
}

/// Compiled function body. Immutable once built, shared by closures via Rc.
#[derive(Debug)]
pub struct Proto {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub locvars: Vec<LocVar>,

    /// Dense per-instruction line deltas; `ABS_LINE_MARK` entries defer to
    /// the anchors.
    pub line_info: Vec<i8>,
    pub abs_line_info: Vec<AbsLineInfo>,

    pub source: Option<String>,
    pub linedefined: u32,
    pub lastlinedefined: u32,

    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,

    /// Frontend hints carried through dumps.
    pub nodiscard: bool,
    pub difierline_mode: u8,
    pub difierline_magicnum: u32,
    pub difierline_data: u32,

    pub jit: Cell<JitSlot>,
    pub is_sleeping: Cell<bool>,
    pub call_queue: RefCell<Option<CallQueue>>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalue_descs: Vec::new(),
            locvars: Vec::new(),
            line_info: Vec::new(),
            abs_line_info: Vec::new(),
            source: None,
            linedefined: 0,
            lastlinedefined: 0,
            numparams: 0,
            is_vararg: false,
            maxstacksize: 2,
            nodiscard: false,
            difierline_mode: 0,
            difierline_magicnum: 0,
            difierline_data: 0,
            jit: Cell::new(JitSlot::empty()),
            is_sleeping: Cell::new(false),
            call_queue: RefCell::new(None),
        }
    }

    /// Short source for messages: file name without directories, or `?`.
    pub fn short_source(&self) -> &str {
        let src = self.source.as_deref().unwrap_or("?");
        let src = src.strip_prefix('@').unwrap_or(src);
        src.rsplit('/').next().unwrap_or(src)
    }

    /// Line of the instruction at `pc`, resolved from the nearest anchor
    /// plus the dense deltas.
    pub fn line_at(&self, pc: usize) -> u32 {
        if self.line_info.is_empty() {
            return 0;
        }
        let pc = pc.min(self.line_info.len() - 1);
        // last anchor at or before pc; entries after it up to pc are plain deltas
        let mut base_pc = 0usize;
        let mut line: i64 = self.linedefined as i64;
        for a in &self.abs_line_info {
            if a.pc as usize <= pc {
                base_pc = a.pc as usize;
                line = a.line as i64;
            } else {
                break;
            }
        }
        for i in (base_pc + 1)..=pc {
            debug_assert!(self.line_info[i] != ABS_LINE_MARK);
            line += self.line_info[i] as i64;
        }
        line.max(0) as u32
    }

    /// Build the dense-delta + anchor encoding from absolute lines.
    pub fn set_lines(&mut self, lines: &[u32]) {
        self.line_info.clear();
        self.abs_line_info.clear();
        let mut prev: i64 = self.linedefined as i64;
        let mut since_anchor = LINES_PER_ANCHOR; // force an anchor at pc 0
        for (pc, &line) in lines.iter().enumerate() {
            let delta = line as i64 - prev;
            if since_anchor >= LINES_PER_ANCHOR || delta.abs() >= ABS_LINE_MARK.unsigned_abs() as i64 {
                self.abs_line_info.push(AbsLineInfo { pc: pc as u32, line });
                self.line_info.push(ABS_LINE_MARK);
                since_anchor = 0;
            } else {
                self.line_info.push(delta as i8);
                since_anchor += 1;
            }
            prev = line as i64;
        }
    }

    /// Name of the local in slot `local_number` (1-based) active at `pc`.
    pub fn local_name(&self, local_number: usize, pc: u32) -> Option<&str> {
        let mut n = local_number;
        for lv in &self.locvars {
            if lv.startpc > pc {
                break;
            }
            if pc < lv.endpc {
                n -= 1;
                if n == 0 {
                    return Some(&lv.name);
                }
            }
        }
        None
    }

    pub fn is_sleeping(&self) -> bool {
        self.is_sleeping.get()
    }

    /// Queue a call's arguments for later replay; used while sleeping.
    pub fn queue_call(&self, args: Vec<LuaValue>) {
        let mut q = self.call_queue.borrow_mut();
        q.get_or_insert_with(CallQueue::new).push(args);
    }

    pub fn queued_calls(&self) -> usize {
        self.call_queue.borrow().as_ref().map_or(0, |q| q.len())
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Proto {
    fn drop(&mut self) {
        let slot = self.jit.get();
        if slot.is_set() {
            crate::jit::free_exec(slot);
        }
    }
}

// ============ Userdata ============

/// Full userdata: an owned Rust payload with a metatable and user values.
pub struct LuaUserdata {
    pub data: Box<dyn std::any::Any>,
    pub metatable: Option<crate::gc::TableId>,
    pub user_values: Vec<LuaValue>,
}

impl LuaUserdata {
    pub fn new(data: Box<dyn std::any::Any>, nuvalues: usize) -> Self {
        LuaUserdata {
            data,
            metatable: None,
            user_values: vec![LuaValue::nil(); nuvalues],
        }
    }
}

/// Reader callback used by the loaders: yields chunks of bytes until None.
pub trait Reader {
    fn read(&mut self) -> LuaResult<Option<Vec<u8>>>;
}
