// x86-64 (System V) backend.
//
// Register plan: rbx holds the JitContext pointer for the whole function;
// rax/rcx/rdx are scratch for inline data moves; helper calls use the
// standard argument registers. The context pointer is the only value that
// survives helper calls.
//
// Every bytecode instruction gets a code offset; branch targets are
// patched once emission finishes, and nothing is touched after that.

use std::rc::Rc;

use crate::lua_value::lua_value::{V_FALSE, V_INT, V_FLOAT, V_NIL, V_TRUE};
use crate::lua_value::Proto;
use crate::lua_vm::OpCode;
use crate::{get_a, get_b, get_bx, get_c, get_k, get_op, get_sb, get_sbx, get_sc, get_sj};

use super::runtime::{
    self, CTX_OFF_CONSTS, CTX_OFF_REGS, RET_ERROR, RET_SKIP,
};

const VALUE_SIZE: i32 = 16;

enum FixKind {
    /// je rel32 patched to a bytecode target.
    TargetPc(usize),
    /// jmp/je rel32 patched to the shared error exit.
    ErrExit,
    /// jmp rel32 patched to the epilogue.
    Epilogue,
}

struct Fix {
    at: usize,
    kind: FixKind,
}

struct Emitter {
    buf: Vec<u8>,
    fixes: Vec<Fix>,
}

impl Emitter {
    fn new() -> Self {
        Emitter { buf: Vec::with_capacity(1024), fixes: Vec::new() }
    }

    #[inline]
    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.buf.extend_from_slice(bs);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    // mov rax, [rbx + disp]
    fn load_ctx_field(&mut self, disp: i32) {
        self.bytes(&[0x48, 0x8B, 0x83]);
        self.u32(disp as u32);
    }

    // mov rcx/rdx, [rax + disp] ; mov [rax + disp], rcx/rdx
    fn load_rax_disp(&mut self, reg: u8, disp: i32) {
        // reg: 1 = rcx, 2 = rdx
        self.bytes(&[0x48, 0x8B, 0x80 | (reg << 3)]);
        self.u32(disp as u32);
    }

    fn store_rax_disp(&mut self, reg: u8, disp: i32) {
        self.bytes(&[0x48, 0x89, 0x80 | (reg << 3)]);
        self.u32(disp as u32);
    }

    // movabs rcx, imm64
    fn movabs_rcx(&mut self, v: u64) {
        self.bytes(&[0x48, 0xB9]);
        self.u64(v);
    }

    fn movabs_rdx(&mut self, v: u64) {
        self.bytes(&[0x48, 0xBA]);
        self.u64(v);
    }

    fn prologue(&mut self) {
        // push rbp; mov rbp, rsp; push rbx; push r12
        self.bytes(&[0x55, 0x48, 0x89, 0xE5, 0x53, 0x41, 0x54]);
        // mov rbx, rdi (context pointer lives in rbx)
        self.bytes(&[0x48, 0x89, 0xFB]);
    }

    fn epilogue_at(&mut self) -> usize {
        let at = self.buf.len();
        // pop r12; pop rbx; pop rbp; ret
        self.bytes(&[0x41, 0x5C, 0x5B, 0x5D, 0xC3]);
        at
    }

    /// Helper call with up to five u32 arguments after the context.
    fn call_helper(&mut self, addr: usize, args: &[u32]) {
        // mov rdi, rbx
        self.bytes(&[0x48, 0x89, 0xDF]);
        const SETTERS: [&[u8]; 5] = [
            &[0xBE],       // mov esi, imm32
            &[0xBA],       // mov edx, imm32
            &[0xB9],       // mov ecx, imm32
            &[0x41, 0xB8], // mov r8d, imm32
            &[0x41, 0xB9], // mov r9d, imm32
        ];
        for (i, &a) in args.iter().enumerate() {
            self.bytes(SETTERS[i]);
            self.u32(a);
        }
        // movabs rax, addr; call rax
        self.bytes(&[0x48, 0xB8]);
        self.u64(addr as u64);
        self.bytes(&[0xFF, 0xD0]);
    }

    /// cmp eax, imm8 ; je <fix>
    fn je_on(&mut self, imm: u8, kind: FixKind) {
        self.bytes(&[0x83, 0xF8, imm, 0x0F, 0x84]);
        self.fixes.push(Fix { at: self.buf.len(), kind });
        self.u32(0);
    }

    fn jmp(&mut self, kind: FixKind) {
        self.byte(0xE9);
        self.fixes.push(Fix { at: self.buf.len(), kind });
        self.u32(0);
    }

    // mov eax, imm32
    fn mov_eax(&mut self, v: u32) {
        self.byte(0xB8);
        self.u32(v);
    }

    /// Copy a 16-byte value: rax must hold the source array base.
    fn copy_value_rax(&mut self, src_disp: i32, dst_disp: i32) {
        self.load_rax_disp(1, src_disp);
        self.load_rax_disp(2, src_disp + 8);
        self.store_rax_disp(1, dst_disp);
        self.store_rax_disp(2, dst_disp + 8);
    }

    /// Store an immediate (payload, tag) into regs[a]; clobbers rax/rcx/rdx.
    fn store_imm_value(&mut self, a: usize, payload: u64, tag: u8) {
        self.load_ctx_field(CTX_OFF_REGS as i32);
        self.movabs_rcx(payload);
        self.movabs_rdx(tag as u64);
        self.store_rax_disp(1, a as i32 * VALUE_SIZE);
        self.store_rax_disp(2, a as i32 * VALUE_SIZE + 8);
    }
}

fn arith_code(op: OpCode) -> Option<(u32, u32)> {
    // (op code for the helper, operand mode)
    use OpCode::*;
    let code = |c: u32, m: u32| Some((c, m));
    match op {
        Add => code(0, 0),
        Sub => code(1, 0),
        Mul => code(2, 0),
        Mod => code(3, 0),
        Pow => code(4, 0),
        Div => code(5, 0),
        IDiv => code(6, 0),
        BAnd => code(7, 0),
        BOr => code(8, 0),
        BXor => code(9, 0),
        Shl => code(10, 0),
        Shr => code(11, 0),
        AddK => code(0, 1),
        SubK => code(1, 1),
        MulK => code(2, 1),
        ModK => code(3, 1),
        PowK => code(4, 1),
        DivK => code(5, 1),
        IDivK => code(6, 1),
        BAndK => code(7, 1),
        BOrK => code(8, 1),
        BXorK => code(9, 1),
        AddI => code(0, 2),
        ShrI => code(11, 2),
        Unm => code(12, 0),
        BNot => code(13, 0),
        _ => None,
    }
}

fn compare_packed(op: OpCode, k: bool) -> Option<u32> {
    use OpCode::*;
    let base = match op {
        Eq => 0u32,
        Lt => 1,
        Le => 2,
        Test => 3,
        EqI => 0x200,
        LtI => 0x200 | 1,
        LeI => 0x200 | 2,
        GtI => 0x200 | 0x400 | 1,
        GeI => 0x200 | 0x400 | 2,
        _ => return None,
    };
    Some(base | if k { 0x100 } else { 0 })
}

pub fn emit(proto: &Rc<Proto>) -> Option<Vec<u8>> {
    let mut e = Emitter::new();
    e.prologue();

    let n = proto.code.len();
    let mut offsets = vec![usize::MAX; n];

    for pc in 0..n {
        offsets[pc] = e.buf.len();
        let inst = proto.code[pc];
        let op = get_op!(inst);
        let a = get_a!(inst);
        let next_pc = (pc + 1) as u32;

        match op {
            OpCode::Move => {
                e.load_ctx_field(CTX_OFF_REGS as i32);
                e.copy_value_rax(
                    get_b!(inst) as i32 * VALUE_SIZE,
                    a as i32 * VALUE_SIZE,
                );
            }
            OpCode::LoadI => {
                e.store_imm_value(a, get_sbx!(inst) as i64 as u64, V_INT);
            }
            OpCode::LoadF => {
                e.store_imm_value(a, (get_sbx!(inst) as f64).to_bits(), V_FLOAT);
            }
            OpCode::LoadK => {
                let bx = get_bx!(inst) as i32;
                e.load_ctx_field(CTX_OFF_CONSTS as i32);
                e.load_rax_disp(1, bx * VALUE_SIZE);
                e.load_rax_disp(2, bx * VALUE_SIZE + 8);
                e.load_ctx_field(CTX_OFF_REGS as i32);
                e.store_rax_disp(1, a as i32 * VALUE_SIZE);
                e.store_rax_disp(2, a as i32 * VALUE_SIZE + 8);
            }
            OpCode::LoadNil => {
                for i in 0..=get_b!(inst) {
                    e.store_imm_value(a + i, 0, V_NIL);
                }
            }
            OpCode::LoadTrue => e.store_imm_value(a, 0, V_TRUE),
            OpCode::LoadFalse => e.store_imm_value(a, 0, V_FALSE),
            OpCode::LFalseSkip => {
                e.store_imm_value(a, 0, V_FALSE);
                e.jmp(FixKind::TargetPc(pc + 2));
            }
            OpCode::Jmp => {
                let target = (pc as i64 + 1 + get_sj!(inst) as i64) as usize;
                e.jmp(FixKind::TargetPc(target));
            }
            OpCode::Nop | OpCode::ExtraArg => {}

            _ if arith_code(op).is_some() => {
                let (code, mode) = arith_code(op).unwrap();
                let (b, c) = if op == OpCode::AddI || op == OpCode::ShrI {
                    (get_b!(inst) as u32, (get_sc!(inst) + 128) as u32)
                } else {
                    (get_b!(inst) as u32, get_c!(inst) as u32)
                };
                e.call_helper(
                    runtime::jit_rt_arith as usize,
                    &[code | (mode << 8), a as u32, b, c, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
            }

            _ if compare_packed(op, get_k!(inst)).is_some() => {
                let packed = compare_packed(op, get_k!(inst)).unwrap();
                let b = if packed & 0x200 != 0 {
                    (get_sb!(inst) + 128) as u32
                } else {
                    get_b!(inst) as u32
                };
                e.call_helper(
                    runtime::jit_rt_compare as usize,
                    &[packed, a as u32, b, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
                // skip path jumps over the following JMP
                e.je_on(RET_SKIP as u8, FixKind::TargetPc(pc + 2));
            }

            OpCode::GetTable | OpCode::GetI | OpCode::GetField => {
                let mode = match op {
                    OpCode::GetTable => 0,
                    OpCode::GetI => 1,
                    _ => 2,
                };
                e.call_helper(
                    runtime::jit_rt_table as usize,
                    &[mode, a as u32, get_b!(inst) as u32, get_c!(inst) as u32, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
            }
            OpCode::SetTable | OpCode::SetI | OpCode::SetField => {
                let mode = match op {
                    OpCode::SetTable => 3,
                    OpCode::SetI => 4,
                    _ => 5,
                };
                let ck = get_c!(inst) as u32 | if get_k!(inst) { 0x1_0000 } else { 0 };
                e.call_helper(
                    runtime::jit_rt_table as usize,
                    &[mode, a as u32, get_b!(inst) as u32, ck, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
            }

            OpCode::Call => {
                e.call_helper(
                    runtime::jit_rt_call as usize,
                    &[a as u32, get_b!(inst) as u32, get_c!(inst) as u32, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
            }
            OpCode::Return0 => {
                e.call_helper(runtime::jit_rt_return as usize, &[0, 0, 0, next_pc]);
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
                e.mov_eax(1);
                e.jmp(FixKind::Epilogue);
            }
            OpCode::Return1 => {
                e.call_helper(runtime::jit_rt_return as usize, &[a as u32, 1, 0, next_pc]);
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
                e.mov_eax(1);
                e.jmp(FixKind::Epilogue);
            }
            OpCode::Return => {
                e.call_helper(
                    runtime::jit_rt_return as usize,
                    &[a as u32, u32::MAX, get_b!(inst) as u32, next_pc],
                );
                e.je_on(RET_ERROR as u8, FixKind::ErrExit);
                e.mov_eax(1);
                e.jmp(FixKind::Epilogue);
            }

            // anything else re-enters the interpreter at this opcode
            _ => {
                e.call_helper(runtime::jit_rt_barrier as usize, &[pc as u32]);
                e.mov_eax(0);
                e.jmp(FixKind::Epilogue);
            }
        }
    }

    // falling off the end means a malformed stream; treat as a barrier at
    // the last instruction
    e.call_helper(runtime::jit_rt_barrier as usize, &[(n.saturating_sub(1)) as u32]);
    e.mov_eax(0);
    e.jmp(FixKind::Epilogue);

    // shared error exit: eax already holds the error return code
    let err_at = e.buf.len();
    e.mov_eax(2);
    let epilogue_at = e.epilogue_at();

    // patch branches
    for fix in std::mem::take(&mut e.fixes) {
        let target = match fix.kind {
            FixKind::TargetPc(pcx) => {
                if pcx >= offsets.len() || offsets[pcx] == usize::MAX {
                    return None; // jump into unemitted territory
                }
                offsets[pcx]
            }
            FixKind::ErrExit => err_at,
            FixKind::Epilogue => epilogue_at,
        };
        let rel = target as i64 - (fix.at as i64 + 4);
        e.buf[fix.at..fix.at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    Some(e.buf)
}
