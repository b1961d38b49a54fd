// arm64 (AAPCS64) backend, the sibling of emit_x64.
//
// Register plan: x19 holds the JitContext pointer; x9/x10/x11 are scratch
// for inline data moves; helper arguments go in x0/w1..w5. Branch targets
// are patched as word offsets once emission finishes.

use std::rc::Rc;

use crate::lua_value::lua_value::{V_FALSE, V_INT, V_FLOAT, V_NIL, V_TRUE};
use crate::lua_value::Proto;
use crate::lua_vm::OpCode;
use crate::{get_a, get_b, get_bx, get_c, get_k, get_op, get_sb, get_sbx, get_sc, get_sj};

use super::runtime::{self, CTX_OFF_CONSTS, CTX_OFF_REGS, RET_ERROR, RET_SKIP};

const VALUE_SIZE: u32 = 16;

enum FixKind {
    TargetPc(usize),
    ErrExit,
    Epilogue,
}

struct Fix {
    /// Word index of the branch instruction.
    word: usize,
    cond: bool,
    kind: FixKind,
}

struct Emitter {
    words: Vec<u32>,
    fixes: Vec<Fix>,
}

impl Emitter {
    fn new() -> Self {
        Emitter { words: Vec::with_capacity(256), fixes: Vec::new() }
    }

    #[inline]
    fn word(&mut self, w: u32) {
        self.words.push(w);
    }

    /// movz/movk sequence loading a 64-bit immediate into x<rd>.
    fn mov_imm64(&mut self, rd: u32, v: u64) {
        self.word(0xD2800000 | ((v & 0xFFFF) as u32) << 5 | rd);
        for hw in 1..4u32 {
            let part = ((v >> (16 * hw)) & 0xFFFF) as u32;
            if part != 0 {
                self.word(0xF2800000 | hw << 21 | part << 5 | rd);
            }
        }
    }

    /// movz/movk loading a 32-bit immediate into w<rd>.
    fn mov_imm32(&mut self, rd: u32, v: u32) {
        self.word(0x52800000 | (v & 0xFFFF) << 5 | rd);
        let hi = v >> 16;
        if hi != 0 {
            self.word(0x72A00000 | hi << 5 | rd);
        }
    }

    /// ldr x<rt>, [x<rn>, #off] (off a multiple of 8).
    fn ldr(&mut self, rt: u32, rn: u32, off: u32) {
        debug_assert!(off % 8 == 0 && off / 8 < 4096);
        self.word(0xF9400000 | (off / 8) << 10 | rn << 5 | rt);
    }

    /// str x<rt>, [x<rn>, #off].
    fn str(&mut self, rt: u32, rn: u32, off: u32) {
        debug_assert!(off % 8 == 0 && off / 8 < 4096);
        self.word(0xF9000000 | (off / 8) << 10 | rn << 5 | rt);
    }

    fn prologue(&mut self) {
        self.word(0xA9BF7BFD); // stp x29, x30, [sp, #-16]!
        self.word(0x910003FD); // mov x29, sp
        self.word(0xF81F0FF3); // str x19, [sp, #-16]!
        self.word(0xAA0003F3); // mov x19, x0
    }

    fn epilogue_at(&mut self) -> usize {
        let at = self.words.len();
        self.word(0xF84107F3); // ldr x19, [sp], #16
        self.word(0xA8C17BFD); // ldp x29, x30, [sp], #16
        self.word(0xD65F03C0); // ret
        at
    }

    fn call_helper(&mut self, addr: usize, args: &[u32]) {
        self.word(0xAA1303E0); // mov x0, x19
        for (i, &a) in args.iter().enumerate() {
            self.mov_imm32(1 + i as u32, a);
        }
        self.mov_imm64(9, addr as u64);
        self.word(0xD63F0120); // blr x9
    }

    /// cmp w0, #imm ; b.eq <fix>
    fn beq_on(&mut self, imm: u32, kind: FixKind) {
        self.word(0x7100001F | (imm & 0xFFF) << 10); // cmp w0, #imm
        self.fixes.push(Fix { word: self.words.len(), cond: true, kind });
        self.word(0x54000000); // b.eq, offset patched
    }

    fn b(&mut self, kind: FixKind) {
        self.fixes.push(Fix { word: self.words.len(), cond: false, kind });
        self.word(0x14000000); // b, offset patched
    }

    fn mov_w0(&mut self, v: u32) {
        self.mov_imm32(0, v);
    }

    /// regs base into x9.
    fn load_regs(&mut self) {
        self.ldr(9, 19, CTX_OFF_REGS as u32);
    }

    fn load_consts(&mut self) {
        self.ldr(9, 19, CTX_OFF_CONSTS as u32);
    }

    /// Store an immediate (payload, tag) into regs[a]; clobbers x9-x11.
    fn store_imm_value(&mut self, a: usize, payload: u64, tag: u8) {
        self.load_regs();
        self.mov_imm64(10, payload);
        self.mov_imm64(11, tag as u64);
        self.str(10, 9, a as u32 * VALUE_SIZE);
        self.str(11, 9, a as u32 * VALUE_SIZE + 8);
    }
}

fn arith_code(op: OpCode) -> Option<(u32, u32)> {
    use OpCode::*;
    match op {
        Add => Some((0, 0)),
        Sub => Some((1, 0)),
        Mul => Some((2, 0)),
        Mod => Some((3, 0)),
        Pow => Some((4, 0)),
        Div => Some((5, 0)),
        IDiv => Some((6, 0)),
        BAnd => Some((7, 0)),
        BOr => Some((8, 0)),
        BXor => Some((9, 0)),
        Shl => Some((10, 0)),
        Shr => Some((11, 0)),
        AddK => Some((0, 1)),
        SubK => Some((1, 1)),
        MulK => Some((2, 1)),
        ModK => Some((3, 1)),
        PowK => Some((4, 1)),
        DivK => Some((5, 1)),
        IDivK => Some((6, 1)),
        BAndK => Some((7, 1)),
        BOrK => Some((8, 1)),
        BXorK => Some((9, 1)),
        AddI => Some((0, 2)),
        ShrI => Some((11, 2)),
        Unm => Some((12, 0)),
        BNot => Some((13, 0)),
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
        offsets[pc] = e.words.len();
        let inst = proto.code[pc];
        let op = get_op!(inst);
        let a = get_a!(inst);
        let next_pc = (pc + 1) as u32;

        match op {
            OpCode::Move => {
                e.load_regs();
                let b = get_b!(inst) as u32;
                e.ldr(10, 9, b * VALUE_SIZE);
                e.ldr(11, 9, b * VALUE_SIZE + 8);
                e.str(10, 9, a as u32 * VALUE_SIZE);
                e.str(11, 9, a as u32 * VALUE_SIZE + 8);
            }
            OpCode::LoadI => e.store_imm_value(a, get_sbx!(inst) as i64 as u64, V_INT),
            OpCode::LoadF => e.store_imm_value(a, (get_sbx!(inst) as f64).to_bits(), V_FLOAT),
            OpCode::LoadK => {
                let bx = get_bx!(inst) as u32;
                e.load_consts();
                e.ldr(10, 9, bx * VALUE_SIZE);
                e.ldr(11, 9, bx * VALUE_SIZE + 8);
                e.load_regs();
                e.str(10, 9, a as u32 * VALUE_SIZE);
                e.str(11, 9, a as u32 * VALUE_SIZE + 8);
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
                e.b(FixKind::TargetPc(pc + 2));
            }
            OpCode::Jmp => {
                let target = (pc as i64 + 1 + get_sj!(inst) as i64) as usize;
                e.b(FixKind::TargetPc(target));
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
                e.beq_on(RET_ERROR, FixKind::ErrExit);
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
                e.beq_on(RET_ERROR, FixKind::ErrExit);
                e.beq_on(RET_SKIP, FixKind::TargetPc(pc + 2));
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
                e.beq_on(RET_ERROR, FixKind::ErrExit);
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
                e.beq_on(RET_ERROR, FixKind::ErrExit);
            }

            OpCode::Call => {
                e.call_helper(
                    runtime::jit_rt_call as usize,
                    &[a as u32, get_b!(inst) as u32, get_c!(inst) as u32, next_pc],
                );
                e.beq_on(RET_ERROR, FixKind::ErrExit);
            }
            OpCode::Return0 | OpCode::Return1 | OpCode::Return => {
                let (nret, b) = match op {
                    OpCode::Return0 => (0, 0),
                    OpCode::Return1 => (1, 0),
                    _ => (u32::MAX, get_b!(inst) as u32),
                };
                e.call_helper(
                    runtime::jit_rt_return as usize,
                    &[a as u32, nret, b, next_pc],
                );
                e.beq_on(RET_ERROR, FixKind::ErrExit);
                e.mov_w0(1);
                e.b(FixKind::Epilogue);
            }

            _ => {
                e.call_helper(runtime::jit_rt_barrier as usize, &[pc as u32]);
                e.mov_w0(0);
                e.b(FixKind::Epilogue);
            }
        }
    }

    e.call_helper(runtime::jit_rt_barrier as usize, &[(n.saturating_sub(1)) as u32]);
    e.mov_w0(0);
    e.b(FixKind::Epilogue);

    let err_at = e.words.len();
    e.mov_w0(2);
    let epilogue_at = e.epilogue_at();

    for fix in std::mem::take(&mut e.fixes) {
        let target = match fix.kind {
            FixKind::TargetPc(pcx) => {
                if pcx >= offsets.len() || offsets[pcx] == usize::MAX {
                    return None;
                }
                offsets[pcx]
            }
            FixKind::ErrExit => err_at,
            FixKind::Epilogue => epilogue_at,
        };
        let delta = target as i64 - fix.word as i64;
        if fix.cond {
            let imm19 = (delta as u32) & 0x7FFFF;
            e.words[fix.word] |= imm19 << 5;
        } else {
            let imm26 = (delta as u32) & 0x03FF_FFFF;
            e.words[fix.word] |= imm26;
        }
    }

    let mut out = Vec::with_capacity(e.words.len() * 4);
    for w in &e.words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    Some(out)
}
