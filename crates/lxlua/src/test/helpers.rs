// Shared test scaffolding: a prototype assembler and a few stock native
// functions. The frontend is an external collaborator, so tests build
// instruction streams directly.

use std::rc::Rc;

use crate::lua_value::{LuaValue, MultiValue, Proto, UpvalueDesc};
use crate::lua_vm::{Instruction, LuaResult, LuaState, LuaVM, OpCode, VmOptions};

pub fn new_vm() -> Box<LuaVM> {
    LuaVM::new(VmOptions::default())
}

pub struct ProtoBuilder {
    p: Proto,
}

impl ProtoBuilder {
    pub fn new(nparams: u8, maxstack: u8) -> Self {
        let mut p = Proto::new();
        p.numparams = nparams;
        p.maxstacksize = maxstack;
        p.source = Some("@test.lua".to_string());
        ProtoBuilder { p }
    }

    /// Declare an `_ENV` upvalue; `LuaVM::closure_from_proto` binds it to
    /// the globals table.
    pub fn with_env(mut self) -> Self {
        self.p.upvalue_descs.push(UpvalueDesc {
            name: Some("_ENV".to_string()),
            instack: false,
            idx: 0,
            kind: 0,
        });
        self
    }

    pub fn vararg(mut self) -> Self {
        self.p.is_vararg = true;
        self
    }

    pub fn upvalue(mut self, name: &str, instack: bool, idx: u8) -> Self {
        self.p.upvalue_descs.push(UpvalueDesc {
            name: Some(name.to_string()),
            instack,
            idx,
            kind: 0,
        });
        self
    }

    pub fn k(&mut self, v: LuaValue) -> u32 {
        self.p.constants.push(v);
        (self.p.constants.len() - 1) as u32
    }

    pub fn k_str(&mut self, vm: &mut LuaVM, s: &str) -> u32 {
        let v = vm.intern_str(s);
        self.k(v)
    }

    pub fn child(&mut self, c: Rc<Proto>) -> u32 {
        self.p.protos.push(c);
        (self.p.protos.len() - 1) as u32
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.p.code.push(Instruction::abc(op, a, b, c));
        self
    }

    pub fn abck(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> &mut Self {
        self.p.code.push(Instruction::abck(op, a, b, c, k));
        self
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> &mut Self {
        self.p.code.push(Instruction::abx(op, a, bx));
        self
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> &mut Self {
        self.p.code.push(Instruction::asbx(op, a, sbx));
        self
    }

    pub fn sj(&mut self, op: OpCode, sj: i32) -> &mut Self {
        self.p.code.push(Instruction::sj(op, sj));
        self
    }

    /// Comparison with a signed immediate operand.
    pub fn cmp_imm(&mut self, op: OpCode, a: u32, sb: i32, k: bool) -> &mut Self {
        self.p.code.push(Instruction::absck(op, a, sb, 0, k));
        self
    }

    pub fn lines(&mut self, lines: &[u32]) -> &mut Self {
        self.p.linedefined = 0;
        self.p.set_lines(lines);
        self
    }

    pub fn source(&mut self, src: &str) -> &mut Self {
        self.p.source = Some(src.to_string());
        self
    }

    pub fn build(mut self) -> Rc<Proto> {
        if self.p.line_info.is_empty() && !self.p.code.is_empty() {
            let lines: Vec<u32> = (0..self.p.code.len()).map(|_| 1).collect();
            self.p.set_lines(&lines);
        }
        Rc::new(self.p)
    }
}

/// `fact(n)`: the recursion scenario everyone starts from. Resolves
/// itself through the global named `fact`.
pub fn build_factorial(vm: &mut LuaVM) -> Rc<Proto> {
    let mut b = ProtoBuilder::new(1, 4).with_env();
    let k_fact = b.k_str(vm, "fact");
    // if n <= 1 then return 1 end
    b.cmp_imm(OpCode::LeI, 0, 1, true); // 0
    b.sj(OpCode::Jmp, 5); // 1 -> 7 (return 1)
    b.abck(OpCode::GetTabUp, 1, 0, k_fact, false); // 2: R1 = fact
    b.abck(OpCode::AddI, 2, 0, (-1 + 128) as u32, false); // 3: R2 = n - 1
    b.abc(OpCode::Call, 1, 2, 2); // 4: R1 = fact(R2)
    b.abc(OpCode::Mul, 1, 0, 1); // 5: R1 = n * R1
    b.abc(OpCode::Return1, 1, 0, 0); // 6
    b.asbx(OpCode::LoadI, 1, 1); // 7
    b.abc(OpCode::Return1, 1, 0, 0); // 8
    b.build()
}

// ---- stock native functions ----

/// Append every argument to the global table named `log`.
pub fn cf_log_args(s: &mut LuaState) -> LuaResult<MultiValue> {
    let n = s.cf_nargs();
    let args: Vec<LuaValue> = (0..n).map(|i| s.cf_arg(i)).collect();
    let vm = s.vm();
    let log = vm.get_global("log");
    if let Some(tid) = log.as_table_id() {
        let len = vm.pool.get_table(tid).map(|t| t.len()).unwrap_or(0);
        for (i, a) in args.iter().enumerate() {
            vm.raw_set_int(tid, len + 1 + i as i64, *a);
        }
    }
    Ok(MultiValue::empty())
}

/// Raise a user error carrying the string "boom".
pub fn cf_boom(s: &mut LuaState) -> LuaResult<MultiValue> {
    let vm = s.vm();
    Err(vm.raise_plain(crate::lua_vm::LuaError::UserError, "boom"))
}

/// Yield all arguments.
pub fn cf_yield(s: &mut LuaState) -> LuaResult<MultiValue> {
    let n = s.cf_nargs();
    let args: Vec<LuaValue> = (0..n).map(|i| s.cf_arg(i)).collect();
    Err(s.do_yield(args))
}

/// Read the values a call produced back out of a MultiValue.
pub fn ints(mv: &MultiValue) -> Vec<i64> {
    mv.iter().filter_map(|v| v.as_integer()).collect()
}
