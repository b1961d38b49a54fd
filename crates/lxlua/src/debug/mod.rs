// Debug controller: breakpoints, the step state machine, the line hook,
// and traceback formatting.
//
// Breakpoint records live in the registry under BREAKPOINT_KEY, keyed
// "shortsrc:line". The step machine is a record under DEBUG_STATE_KEY
// with {mode, target_level, break_level}; modes are 0 run, 1 step,
// 2 next, 3 finish. A stop reports through the registered output callback
// or falls back to standard error.

use crate::gc::{ClosureKind, TableId};
use crate::lua_value::LuaValue;
use crate::lua_vm::{
    BREAKPOINT_KEY, DEBUG_OUTPUT_KEY, DEBUG_STATE_KEY, HOOK_KEY, HookEvent, LuaError, LuaResult,
    LuaState, LuaVM, TmKind, hook_mask,
};

const MODE_RUN: i64 = 0;
const MODE_STEP: i64 = 1;
const MODE_NEXT: i64 = 2;
const MODE_FINISH: i64 = 3;

/// File-name part of a source path, the way breakpoint keys spell it.
pub fn short_filename(source: &str) -> &str {
    let s = source.strip_prefix('@').unwrap_or(source);
    s.rsplit(['/', '\\']).next().unwrap_or(s)
}

fn bp_key(source: &str, line: u32) -> String {
    format!("{}:{}", short_filename(source), line)
}

fn get_field(vm: &mut LuaVM, tid: TableId, name: &str) -> LuaValue {
    let key = vm.intern_str(name);
    vm.raw_get(tid, &key)
}

fn set_field(vm: &mut LuaVM, tid: TableId, name: &str, value: LuaValue) {
    let key = vm.intern_str(name);
    let _ = vm.raw_set(tid, key, value);
}

fn ensure_debug_state(vm: &mut LuaVM) -> TableId {
    let tid = vm.registry_subtable(DEBUG_STATE_KEY);
    if get_field(vm, tid, "mode").is_nil() {
        set_field(vm, tid, "mode", LuaValue::integer(MODE_RUN));
        set_field(vm, tid, "target_level", LuaValue::integer(0));
        set_field(vm, tid, "break_level", LuaValue::integer(0));
    }
    tid
}

fn install_line_hook(vm: &mut LuaVM) {
    if vm.hook_fn.is_none() {
        vm.hook_fn = Some(debug_hook);
    }
    vm.main.hook_mask |= hook_mask::MASK_LINE;
}

// ---- breakpoint management ----

/// Set (or replace) a breakpoint; installs the line hook on first use.
/// Returns the record table.
pub fn set_breakpoint(
    vm: &mut LuaVM,
    source: &str,
    line: u32,
    condition: Option<&str>,
) -> LuaValue {
    install_line_hook(vm);
    ensure_debug_state(vm);
    let table = vm.registry_subtable(BREAKPOINT_KEY);
    let key = bp_key(source, line);
    let key_val = vm.intern_str(&key);

    let existed = !vm.raw_get(table, &key_val).is_nil();

    let record = vm.alloc_table(0, 5);
    let src_val = vm.intern_str(short_filename(source));
    set_field(vm, record, "source", src_val);
    set_field(vm, record, "line", LuaValue::integer(line as i64));
    set_field(vm, record, "enabled", LuaValue::boolean(true));
    if let Some(cond) = condition {
        let cond_val = vm.intern_str(cond);
        set_field(vm, record, "condition", cond_val);
    }
    set_field(vm, record, "exists", LuaValue::boolean(existed));

    let _ = vm.raw_set(table, key_val, LuaValue::table(record));
    LuaValue::table(record)
}

pub fn remove_breakpoint(vm: &mut LuaVM, source: &str, line: u32) -> bool {
    let table = vm.registry_subtable(BREAKPOINT_KEY);
    let key_val = vm.intern_str(&bp_key(source, line));
    let existed = !vm.raw_get(table, &key_val).is_nil();
    if existed {
        let _ = vm.raw_set(table, key_val, LuaValue::nil());
    }
    existed
}

pub fn enable_breakpoint(vm: &mut LuaVM, source: &str, line: u32, enable: bool) -> bool {
    let table = vm.registry_subtable(BREAKPOINT_KEY);
    let key_val = vm.intern_str(&bp_key(source, line));
    let record = vm.raw_get(table, &key_val);
    match record.as_table_id() {
        Some(tid) => {
            set_field(vm, tid, "enabled", LuaValue::boolean(enable));
            true
        }
        None => false,
    }
}

/// All breakpoint records, in table order.
pub fn list_breakpoints(vm: &mut LuaVM) -> Vec<LuaValue> {
    let table = vm.registry_subtable(BREAKPOINT_KEY);
    vm.pool
        .get_table(table)
        .map(|t| t.iter_all().into_iter().map(|(_, v)| v).collect())
        .unwrap_or_default()
}

/// Drop every breakpoint; returns how many were cleared.
pub fn clear_breakpoints(vm: &mut LuaVM) -> usize {
    let table = vm.registry_subtable(BREAKPOINT_KEY);
    let count = vm
        .pool
        .get_table(table)
        .map(|t| t.iter_all().len())
        .unwrap_or(0);
    let fresh = vm.alloc_table(0, 8);
    let key = vm.intern_str(BREAKPOINT_KEY);
    let registry = vm.registry();
    let _ = vm.raw_set(registry, key, LuaValue::table(fresh));
    count
}

// ---- step machine ----

pub fn debug_continue(vm: &mut LuaVM) {
    let tid = ensure_debug_state(vm);
    set_field(vm, tid, "mode", LuaValue::integer(MODE_RUN));
}

pub fn debug_step(vm: &mut LuaVM) {
    install_line_hook(vm);
    let tid = ensure_debug_state(vm);
    set_field(vm, tid, "mode", LuaValue::integer(MODE_STEP));
}

pub fn debug_next(vm: &mut LuaVM) {
    install_line_hook(vm);
    let tid = ensure_debug_state(vm);
    set_field(vm, tid, "mode", LuaValue::integer(MODE_NEXT));
    let mut level = get_field(vm, tid, "break_level").as_integer().unwrap_or(0);
    if level == 0 {
        level = vm.main.stack_level() as i64 - 1;
    }
    set_field(vm, tid, "target_level", LuaValue::integer(level));
}

pub fn debug_finish(vm: &mut LuaVM) {
    install_line_hook(vm);
    let tid = ensure_debug_state(vm);
    set_field(vm, tid, "mode", LuaValue::integer(MODE_FINISH));
    let mut level = get_field(vm, tid, "break_level").as_integer().unwrap_or(0);
    if level == 0 {
        level = vm.main.stack_level() as i64 - 1;
    }
    set_field(vm, tid, "target_level", LuaValue::integer(level - 1));
}

/// Single-assignment output callback; returns the previous one.
pub fn set_output_callback(vm: &mut LuaVM, callback: LuaValue) -> LuaValue {
    let registry = vm.registry();
    let key = vm.intern_str(DEBUG_OUTPUT_KEY);
    let old = vm.raw_get(registry, &key);
    let stored = if callback.is_function() {
        callback
    } else {
        LuaValue::nil()
    };
    let _ = vm.raw_set(registry, key, stored);
    old
}

pub fn get_output_callback(vm: &mut LuaVM) -> LuaValue {
    let registry = vm.registry();
    let key = vm.intern_str(DEBUG_OUTPUT_KEY);
    vm.raw_get(registry, &key)
}

// ---- hook mask surface ----

/// Register a hook with a "crl"-style mask and an instruction count. Hook
/// values live in a weak-keyed registry table so dead threads release
/// them.
pub fn sethook(vm: &mut LuaVM, hook: LuaValue, mask: &str, count: i32) {
    let hooks = vm.registry_subtable(HOOK_KEY);
    // weak keys: dead threads drop their hook entries
    if vm.pool.get_table(hooks).and_then(|t| t.metatable()).is_none() {
        let mt = vm.alloc_table(0, 1);
        let mode_key = vm.tm_name(TmKind::Mode);
        let mode_val = vm.intern_str("k");
        if let Some(t) = vm.pool.get_table_mut(mt) {
            let key_val = LuaValue::string(mode_key, false);
            t.set_str(mode_key, key_val, mode_val);
        }
        if let Some(t) = vm.pool.get_table_mut(hooks) {
            t.set_metatable(Some(mt));
        }
    }
    let thread_key = vm.intern_str("main");
    let _ = vm.raw_set(hooks, thread_key, hook);

    let mut m = 0u8;
    if mask.contains('c') {
        m |= hook_mask::MASK_CALL;
    }
    if mask.contains('r') {
        m |= hook_mask::MASK_RET;
    }
    if mask.contains('l') {
        m |= hook_mask::MASK_LINE;
    }
    if count > 0 {
        m |= hook_mask::MASK_COUNT;
    }
    vm.main.hook_mask = m;
    vm.main.hook_count = count;
    vm.main.hook_base_count = count;
    if vm.hook_fn.is_none() {
        vm.hook_fn = Some(debug_hook);
    }
}

// ---- the line hook ----

fn current_source(s: &LuaState) -> String {
    let Some(frame) = s.current_frame() else {
        return "?".to_string();
    };
    let Some(fid) = frame.func.as_function_id() else {
        return "?".to_string();
    };
    match s.vm().pool.get_function(fid).map(|f| &f.kind) {
        Some(ClosureKind::Lua { proto, .. }) => proto.short_source().to_string(),
        _ => "[C]".to_string(),
    }
}

fn eval_condition(s: &mut LuaState, cond: &str) -> bool {
    let snippet = if cond.trim_start().starts_with("return ") {
        cond.to_string()
    } else {
        format!("return {}", cond)
    };
    let vm = s.vm();
    let proto = match vm.compile_source(&snippet, "=breakpoint") {
        Ok(p) => p,
        Err(_) => {
            vm.error_message.clear();
            return false;
        }
    };
    let f = vm.closure_from_proto(proto);
    match vm.pcall_value(f, &[]) {
        Ok(mv) => mv.first().is_truthy(),
        Err(_) => {
            let vm = s.vm();
            vm.error_message.clear();
            false
        }
    }
}

/// The installed hook. On every line event: breakpoints first, then the
/// step machine; a stop records the break level and reports.
pub fn debug_hook(s: &mut LuaState, event: HookEvent, line: u32) {
    if event != HookEvent::Line {
        deliver_user_hook(s, event, line);
        return;
    }

    let source = current_source(s);
    let mut should_stop = false;
    let mut stop_event = "breakpoint";

    // 1. breakpoints
    {
        let vm = s.vm();
        let table = vm.registry_subtable(BREAKPOINT_KEY);
        let key_val = vm.intern_str(&bp_key(&source, line));
        let record = vm.raw_get(table, &key_val);
        if let Some(tid) = record.as_table_id() {
            if get_field(vm, tid, "enabled").is_truthy() {
                let cond = get_field(vm, tid, "condition");
                if let Some(cond_id) = cond.as_string_id() {
                    let text = String::from_utf8_lossy(vm.pool.string_bytes(cond_id)).into_owned();
                    should_stop = eval_condition(s, &text);
                } else {
                    should_stop = true;
                }
            }
        }
    }

    // 2. step machine
    if !should_stop {
        let vm = s.vm();
        let tid = ensure_debug_state(vm);
        let mode = get_field(vm, tid, "mode").as_integer().unwrap_or(MODE_RUN);
        if mode != MODE_RUN {
            let stop_by_mode = if mode == MODE_STEP {
                true
            } else {
                let target = get_field(vm, tid, "target_level").as_integer().unwrap_or(0);
                (s.stack_level() as i64) <= target
            };
            if stop_by_mode {
                should_stop = true;
                stop_event = match mode {
                    MODE_STEP => "step",
                    MODE_NEXT => "next",
                    _ => "finish",
                };
                set_field(vm, tid, "mode", LuaValue::integer(MODE_RUN));
            }
        }
    }

    if should_stop {
        let level = s.stack_level() as i64;
        let vm = s.vm();
        let tid = ensure_debug_state(vm);
        set_field(vm, tid, "break_level", LuaValue::integer(level));

        tracing::debug!(
            target: "lxlua::debug",
            event = stop_event,
            source = source.as_str(),
            line,
            "debugger stop"
        );

        let callback = get_output_callback(vm);
        if callback.is_function() {
            let ev = vm.intern_str(stop_event);
            let src = vm.intern_str(&source);
            let _ = vm.pcall_value(callback, &[ev, src, LuaValue::integer(line as i64)]);
        } else {
            eprintln!("Breakpoint ({}) at {}:{}", stop_event, source, line);
        }
    }

    deliver_user_hook(s, event, line);
}

/// Relay to a user hook registered through `sethook`, if any.
fn deliver_user_hook(s: &mut LuaState, event: HookEvent, line: u32) {
    let vm = s.vm();
    let hooks = vm.registry_subtable(HOOK_KEY);
    let thread_key = vm.intern_str("main");
    let hook = vm.raw_get(hooks, &thread_key);
    if hook.is_function() {
        let ev = vm.intern_str(event.name());
        let line_arg = if line > 0 {
            LuaValue::integer(line as i64)
        } else {
            LuaValue::nil()
        };
        let _ = vm.pcall_value(hook, &[ev, line_arg]);
    }
}

// ---- traceback ----

/// Format the call chain of a state, innermost frame first.
pub fn traceback(vm: &mut LuaVM, msg: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(m) = msg {
        out.push_str(m);
        out.push('\n');
    }
    out.push_str("stack traceback:");
    let depth = vm.main.call_depth();
    for level in (0..depth).rev() {
        let frame = *vm.main.frame(level);
        out.push_str("\n\t");
        if frame.is_c() {
            out.push_str("[C]: in ?");
            continue;
        }
        match frame
            .func
            .as_function_id()
            .and_then(|fid| vm.pool.get_function(fid))
            .map(|f| &f.kind)
        {
            Some(ClosureKind::Lua { proto, .. }) => {
                let line = proto.line_at(frame.pc.saturating_sub(1) as usize);
                let src = proto.short_source();
                if proto.linedefined == 0 {
                    out.push_str(&format!("{}:{}: in main chunk", src, line));
                } else {
                    out.push_str(&format!(
                        "{}:{}: in function <{}:{}>",
                        src, line, src, proto.linedefined
                    ));
                }
            }
            _ => out.push_str("[C]: in ?"),
        }
    }
    out
}

/// Structured info about a function value, the introspection side of the
/// controller.
pub struct FunctionInfo {
    pub source: String,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub what: &'static str,
    pub nparams: u8,
    pub is_vararg: bool,
    pub nups: usize,
    pub is_hotfixed: bool,
}

pub fn function_info(vm: &mut LuaVM, f: &LuaValue) -> LuaResult<FunctionInfo> {
    let Some(fid) = f.as_function_id() else {
        if f.is_cfunction() {
            return Ok(FunctionInfo {
                source: "=[C]".to_string(),
                linedefined: 0,
                lastlinedefined: 0,
                what: "C",
                nparams: 0,
                is_vararg: true,
                nups: 0,
                is_hotfixed: false,
            });
        }
        return Err(vm.raise_plain(LuaError::TypeError, "function expected"));
    };
    let info = match vm.pool.get_function(fid).map(|g| &g.kind) {
        Some(ClosureKind::Lua { proto, upvalues, is_hotfixed }) => FunctionInfo {
            source: proto.source.clone().unwrap_or_else(|| "?".to_string()),
            linedefined: proto.linedefined,
            lastlinedefined: proto.lastlinedefined,
            what: if proto.linedefined == 0 { "main" } else { "Lua" },
            nparams: proto.numparams,
            is_vararg: proto.is_vararg,
            nups: upvalues.len(),
            is_hotfixed: *is_hotfixed,
        },
        Some(ClosureKind::C { upvalues, .. }) => FunctionInfo {
            source: "=[C]".to_string(),
            linedefined: 0,
            lastlinedefined: 0,
            what: "C",
            nparams: 0,
            is_vararg: true,
            nups: upvalues.len(),
            is_hotfixed: false,
        },
        None => return Err(vm.raise_plain(LuaError::TypeError, "function expected")),
    };
    Ok(info)
}
