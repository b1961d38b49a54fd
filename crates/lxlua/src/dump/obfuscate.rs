// Obfuscation passes over the instruction stream. Composable, each
// semantics-preserving:
//
//   CFF      - control-flow flattening through a state-variable dispatcher
//   SHUFFLE  - seeded reordering of basic blocks
//   BOGUS    - unreachable blocks that survive peephole inspection
//   STATE_ENC- reversible encoding of integer constants (applied by the
//              serializer, undone by the reader)
//
// The passes work on a basic-block graph. Comparison instructions stay
// glued to their companion JMP, LFALSESKIP to the instruction it skips,
// and EXTRAARG to its owner. Numeric/generic loop opcodes carry embedded
// relative offsets; those are recomputed after layout, and a permutation
// that cannot express them (a distance with the wrong sign) is retried
// with fresh randomness before giving up on the pass.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::lua_value::{JitSlot, LuaValue, Proto};
use crate::lua_vm::opcode::Instruction;
use crate::lua_vm::OpCode;
use crate::{get_a, get_bx, get_op, get_sj};

/// Pass selection flags, matching the dump option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfFlags(pub u32);

impl ObfFlags {
    pub const CFF: u32 = 1;
    pub const SHUFFLE: u32 = 2;
    pub const BOGUS: u32 = 4;
    pub const STATE_ENC: u32 = 8;

    pub fn empty() -> Self {
        ObfFlags(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        ObfFlags(bits & 0xF)
    }

    pub fn cff(self) -> bool {
        self.0 & Self::CFF != 0
    }

    pub fn shuffle(self) -> bool {
        self.0 & Self::SHUFFLE != 0
    }

    pub fn bogus(self) -> bool {
        self.0 & Self::BOGUS != 0
    }

    pub fn state_encoding(self) -> bool {
        self.0 & Self::STATE_ENC != 0
    }

    /// Any pass that rewrites the instruction stream.
    pub fn has_code_passes(self) -> bool {
        self.0 & (Self::CFF | Self::SHUFFLE | Self::BOGUS) != 0
    }
}

// ---- state encoding ----

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

pub fn derive_enc_key(seed: u64) -> u64 {
    splitmix64(seed ^ 0x4C58_4C55_4100_0000)
}

pub fn encode_int(v: i64, key: u64) -> i64 {
    ((v as u64 ^ key).rotate_left(17)) as i64
}

pub fn decode_int(v: i64, key: u64) -> i64 {
    ((v as u64).rotate_right(17) ^ key) as i64
}

// ---- proto cloning ----

/// Deep copy of a prototype tree. Runtime-only state (native code, the
/// call queue) starts fresh on the copy.
pub fn clone_proto(p: &Proto) -> Proto {
    Proto {
        code: p.code.clone(),
        constants: p.constants.clone(),
        protos: p.protos.iter().map(|c| Rc::new(clone_proto(c))).collect(),
        upvalue_descs: p.upvalue_descs.clone(),
        locvars: p.locvars.clone(),
        line_info: p.line_info.clone(),
        abs_line_info: p.abs_line_info.clone(),
        source: p.source.clone(),
        linedefined: p.linedefined,
        lastlinedefined: p.lastlinedefined,
        numparams: p.numparams,
        is_vararg: p.is_vararg,
        maxstacksize: p.maxstacksize,
        nodiscard: p.nodiscard,
        difierline_mode: p.difierline_mode,
        difierline_magicnum: p.difierline_magicnum,
        difierline_data: p.difierline_data,
        jit: Cell::new(JitSlot::empty()),
        is_sleeping: Cell::new(false),
        call_queue: RefCell::new(None),
    }
}

/// Entry point: run the requested code passes over a prototype tree.
pub fn apply(proto: &Proto, flags: ObfFlags, seed: u64) -> Proto {
    let mut p = clone_proto(proto);
    apply_in_place(&mut p, flags, seed);
    p
}

fn apply_in_place(p: &mut Proto, flags: ObfFlags, seed: u64) {
    let mut rng = StdRng::seed_from_u64(splitmix64(seed ^ p.code.len() as u64));

    if flags.cff() {
        flatten(p);
    }
    if flags.shuffle() {
        shuffle_blocks(p, &mut rng);
    }
    if flags.bogus() {
        insert_bogus_blocks(p, &mut rng);
    }

    // the passes rewrite positions; debug line info no longer lines up
    if flags.has_code_passes() && !p.code.is_empty() {
        let line = p.linedefined.max(1);
        let lines: Vec<u32> = std::iter::repeat(line).take(p.code.len()).collect();
        p.set_lines(&lines);
    }

    let children = std::mem::take(&mut p.protos);
    p.protos = children
        .into_iter()
        .map(|c| {
            let mut child = clone_proto(&c);
            apply_in_place(&mut child, flags, splitmix64(seed));
            Rc::new(child)
        })
        .collect();
}

// ---- block graph ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    ForPrep,
    ForLoop,
    TForPrep,
    TForLoop,
}

#[derive(Debug, Clone)]
enum Term {
    /// Ends in RETURN/TAILCALL; nothing follows.
    Return,
    /// Explicit jump to a block.
    Jump(usize),
    /// Falls through to a block (an explicit JMP is synthesized on
    /// re-emission).
    Fall(usize),
    /// Comparison pair: the cmp stays in `insts`, both exits are blocks.
    Cond { taken: usize, fall: usize },
    /// Loop opcode with an embedded relative target; `fall` is the block
    /// that must follow (None for TFORPREP, which only jumps).
    Loop { kind: LoopKind, inst: u32, target: usize, fall: Option<usize> },
}

#[derive(Debug, Clone)]
struct Block {
    insts: Vec<u32>,
    term: Term,
}

fn is_loop_op(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::ForPrep | OpCode::ForLoop | OpCode::TForPrep | OpCode::TForLoop
    )
}

fn loop_target(op: OpCode, pc: usize, inst: u32) -> usize {
    let bx = get_bx!(inst);
    match op {
        OpCode::ForPrep => pc + bx + 2,
        OpCode::ForLoop => pc + 1 - bx,
        OpCode::TForPrep => pc + 1 + bx,
        _ => pc + 1 - bx, // TForLoop
    }
}

/// Split the code into glued units: (start_pc, len, kind).
fn unit_spans(code: &[u32]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let op = get_op!(code[pc]);
        let mut len = 1;
        if op.is_comparison() {
            len = 2; // the companion JMP
        } else if op == OpCode::LFalseSkip {
            len = 2; // skips the next instruction, keep it adjacent
        } else if pc + 1 < code.len() && get_op!(code[pc + 1]) == OpCode::ExtraArg {
            len = 2;
        }
        let len = len.min(code.len() - pc);
        spans.push((pc, len));
        pc += len;
    }
    spans
}

fn build_blocks(code: &[u32]) -> Option<Vec<Block>> {
    if code.is_empty() {
        return None;
    }
    let spans = unit_spans(code);
    let span_of_pc = {
        let mut map = vec![usize::MAX; code.len()];
        for (i, &(start, len)) in spans.iter().enumerate() {
            for pc in start..start + len {
                map[pc] = i;
            }
        }
        map
    };

    // leaders: entry, every branch target, every unit after a terminator
    let mut leader = vec![false; spans.len()];
    leader[0] = true;
    let mut mark_pc = |pc: usize, leader: &mut Vec<bool>| -> bool {
        if pc >= span_of_pc.len() || span_of_pc[pc] == usize::MAX {
            return false;
        }
        leader[span_of_pc[pc]] = true;
        true
    };

    for (i, &(start, len)) in spans.iter().enumerate() {
        let op = get_op!(code[start]);
        let next_pc = start + len;
        if op.is_comparison() && len == 2 {
            let jmp = code[start + 1];
            if get_op!(jmp) != OpCode::Jmp {
                return None; // malformed pair
            }
            let target = (start as i64 + 2 + get_sj!(jmp) as i64) as usize;
            if !mark_pc(target, &mut leader) {
                return None;
            }
            if next_pc < code.len() {
                mark_pc(next_pc, &mut leader);
            }
        } else if op == OpCode::Jmp {
            let target = (start as i64 + 1 + get_sj!(code[start]) as i64) as usize;
            if !mark_pc(target, &mut leader) {
                return None;
            }
            if next_pc < code.len() {
                mark_pc(next_pc, &mut leader);
            }
        } else if op.is_return() {
            if next_pc < code.len() {
                mark_pc(next_pc, &mut leader);
            }
        } else if is_loop_op(op) {
            let target = loop_target(op, start, code[start]);
            if !mark_pc(target, &mut leader) {
                return None;
            }
            if next_pc < code.len() {
                mark_pc(next_pc, &mut leader);
            }
        }
        let _ = i;
    }

    // group spans into blocks
    let mut block_of_span = vec![0usize; spans.len()];
    let mut nblocks = 0;
    for (i, is_leader) in leader.iter().enumerate() {
        if *is_leader && i > 0 {
            nblocks += 1;
        }
        block_of_span[i] = nblocks;
    }
    nblocks += 1;

    let block_of_pc = |pc: usize| -> Option<usize> {
        span_of_pc
            .get(pc)
            .copied()
            .filter(|&s| s != usize::MAX)
            .map(|s| block_of_span[s])
    };

    let mut blocks: Vec<Block> = Vec::with_capacity(nblocks);
    let mut current: Vec<u32> = Vec::new();
    let mut term: Option<Term> = None;

    let flush =
        |blocks: &mut Vec<Block>, current: &mut Vec<u32>, term: Option<Term>, next: Option<usize>| {
            let term = term.unwrap_or_else(|| match next {
                Some(b) => Term::Fall(b),
                None => Term::Return,
            });
            blocks.push(Block { insts: std::mem::take(current), term });
        };

    for (i, &(start, len)) in spans.iter().enumerate() {
        let op = get_op!(code[start]);
        let next_pc = start + len;
        let last_in_block = i + 1 >= spans.len() || leader[i + 1];

        if op.is_comparison() && len == 2 {
            let target = (start as i64 + 2 + get_sj!(code[start + 1]) as i64) as usize;
            current.push(code[start]);
            if last_in_block {
                let taken = block_of_pc(target)?;
                let fall = block_of_pc(next_pc)?;
                term = Some(Term::Cond { taken, fall });
            } else {
                return None; // pair must terminate its block
            }
        } else if op == OpCode::Jmp {
            let target = (start as i64 + 1 + get_sj!(code[start]) as i64) as usize;
            if !last_in_block {
                return None;
            }
            term = Some(Term::Jump(block_of_pc(target)?));
        } else if op.is_return() {
            for k in 0..len {
                current.push(code[start + k]);
            }
            if last_in_block {
                term = Some(Term::Return);
            }
        } else if is_loop_op(op) {
            let target = loop_target(op, start, code[start]);
            if !last_in_block {
                return None;
            }
            let fall = if op == OpCode::TForPrep {
                None
            } else if next_pc < code.len() {
                Some(block_of_pc(next_pc)?)
            } else {
                None
            };
            term = Some(Term::Loop {
                kind: match op {
                    OpCode::ForPrep => LoopKind::ForPrep,
                    OpCode::ForLoop => LoopKind::ForLoop,
                    OpCode::TForPrep => LoopKind::TForPrep,
                    _ => LoopKind::TForLoop,
                },
                inst: code[start],
                target: block_of_pc(target)?,
                fall,
            });
        } else {
            for k in 0..len {
                current.push(code[start + k]);
            }
        }

        if last_in_block {
            let next_block = if next_pc < code.len() {
                block_of_pc(next_pc)
            } else {
                None
            };
            flush(&mut blocks, &mut current, term.take(), next_block);
        }
    }

    debug_assert_eq!(blocks.len(), nblocks);
    Some(blocks)
}

/// Lay blocks out in `order` (a permutation with order[0] = 0) and rebuild
/// a flat instruction stream. Fails when a loop offset cannot be encoded.
fn layout(blocks: &[Block], order: &[usize]) -> Option<Vec<u32>> {
    // sizes per block in the chosen order
    let size_of = |b: &Block| -> usize {
        b.insts.len()
            + match b.term {
                Term::Return => 0,
                Term::Jump(_) | Term::Fall(_) => 1,
                Term::Cond { .. } => 2,
                Term::Loop { .. } => 1,
            }
    };

    let mut start_of = vec![0usize; blocks.len()];
    let mut at = 0usize;
    for &b in order {
        start_of[b] = at;
        at += size_of(&blocks[b]);
    }

    let mut code: Vec<u32> = Vec::with_capacity(at);
    for (pos, &bi) in order.iter().enumerate() {
        let b = &blocks[bi];
        debug_assert_eq!(code.len(), start_of[bi]);
        code.extend_from_slice(&b.insts);
        match &b.term {
            Term::Return => {}
            Term::Jump(t) | Term::Fall(t) => {
                let jmp_pc = code.len();
                let sj = start_of[*t] as i64 - (jmp_pc as i64 + 1);
                code.push(Instruction::sj(OpCode::Jmp, sj as i32));
            }
            Term::Cond { taken, fall } => {
                // cmp is the last pushed inst; emit [jmp taken][jmp fall]
                let jmp_pc = code.len();
                let sj_t = start_of[*taken] as i64 - (jmp_pc as i64 + 1);
                code.push(Instruction::sj(OpCode::Jmp, sj_t as i32));
                let sj_f = start_of[*fall] as i64 - (jmp_pc as i64 + 2);
                code.push(Instruction::sj(OpCode::Jmp, sj_f as i32));
            }
            Term::Loop { kind, inst, target, fall } => {
                // the loop's fall-through block must come right after it
                if let Some(f) = fall {
                    let next_in_order = order.get(pos + 1).copied();
                    if next_in_order != Some(*f) {
                        return None;
                    }
                }
                let p = code.len() as i64;
                let t = start_of[*target] as i64;
                let bx = match kind {
                    LoopKind::ForPrep => t - p - 2,
                    LoopKind::ForLoop => p + 1 - t,
                    LoopKind::TForPrep => t - p - 1,
                    LoopKind::TForLoop => p + 1 - t,
                };
                if bx < 0 || bx > Instruction::MAX_BX as i64 {
                    return None;
                }
                let mut w = *inst;
                w = (w & 0x7FFF) | ((bx as u32) << Instruction::POS_BX);
                code.push(w);
            }
        }
    }
    Some(code)
}

// ---- shuffle pass ----

fn shuffle_blocks(p: &mut Proto, rng: &mut StdRng) {
    let Some(blocks) = build_blocks(&p.code) else { return };
    if blocks.len() < 3 {
        return;
    }

    for _ in 0..8 {
        let mut rest: Vec<usize> = (1..blocks.len()).collect();
        rest.shuffle(rng);
        let mut order = Vec::with_capacity(blocks.len());
        order.push(0);
        order.extend(rest);
        if let Some(code) = layout(&blocks, &order) {
            p.code = code;
            return;
        }
    }
    // no permutation satisfied the loop-offset constraints; keep the
    // original stream
}

// ---- bogus blocks ----

fn insert_bogus_blocks(p: &mut Proto, rng: &mut StdRng) {
    let Some(blocks) = build_blocks(&p.code) else { return };
    if p.maxstacksize == u8::MAX {
        return;
    }
    let scratch = p.maxstacksize as u32;
    p.maxstacksize += 1;

    let mut extended = blocks;
    let count = 1 + rng.gen_range(0..2usize);
    let mut order: Vec<usize> = (0..extended.len()).collect();
    for _ in 0..count {
        let jump_to = rng.gen_range(0..extended.len());
        let junk = rng.gen_range(-65000..65000i32);
        extended.push(Block {
            insts: vec![Instruction::asbx(OpCode::LoadI, scratch, junk)],
            term: Term::Jump(jump_to),
        });
        // wedge the unreachable block between two real ones
        let pos = 1 + rng.gen_range(0..order.len());
        order.insert(pos.min(order.len()), extended.len() - 1);
    }

    for _ in 0..8 {
        if let Some(code) = layout(&extended, &order) {
            p.code = code;
            return;
        }
        // adjacency constraint broke: move the bogus blocks to the end
        order.retain(|&b| b < extended.len() - count);
        for i in 0..count {
            order.push(extended.len() - count + i);
        }
    }
}

// ---- control-flow flattening ----

fn flatten(p: &mut Proto) {
    let Some(blocks) = build_blocks(&p.code) else { return };
    if blocks.len() < 2 {
        return;
    }
    // loop opcodes keep implicit fall-through; those regions stay rolled
    if blocks.iter().any(|b| matches!(b.term, Term::Loop { .. })) {
        return;
    }
    if p.maxstacksize == u8::MAX || blocks.len() > 2000 {
        return;
    }
    let state_reg = p.maxstacksize as u32;
    p.maxstacksize += 1;

    // one integer constant per block id
    let kbase = p.constants.len();
    for i in 0..blocks.len() {
        p.constants.push(LuaValue::integer(i as i64));
    }

    // [LOADI state, 0] [dispatcher: CASE/JMP per block] [blocks...]
    let mut code: Vec<u32> = Vec::new();
    code.push(Instruction::asbx(OpCode::LoadI, state_reg, 0));
    let disp_at = code.len();
    let disp_len = blocks.len() * 2;
    for _ in 0..disp_len {
        code.push(Instruction::abc(OpCode::Nop, 0, 0, 0)); // patched below
    }

    // emit every block; record offsets
    let mut start_of = vec![0usize; blocks.len()];
    for (i, b) in blocks.iter().enumerate() {
        start_of[i] = code.len();
        code.extend_from_slice(&b.insts);
        let jmp_disp = |from: usize| -> u32 {
            Instruction::sj(OpCode::Jmp, disp_at as i32 - (from as i32 + 1))
        };
        match &b.term {
            Term::Return => {}
            Term::Jump(t) | Term::Fall(t) => {
                code.push(Instruction::asbx(OpCode::LoadI, state_reg, *t as i32));
                let at = code.len();
                code.push(jmp_disp(at));
            }
            Term::Cond { taken, fall } => {
                // cmp; jmp +2 (to the taken stub); fall stub; taken stub
                let at = code.len();
                code.push(Instruction::sj(OpCode::Jmp, 2));
                code.push(Instruction::asbx(OpCode::LoadI, state_reg, *fall as i32));
                let at2 = code.len();
                code.push(jmp_disp(at2));
                code.push(Instruction::asbx(OpCode::LoadI, state_reg, *taken as i32));
                let at3 = code.len();
                code.push(jmp_disp(at3));
                let _ = at;
            }
            Term::Loop { .. } => unreachable!(),
        }
    }

    // patch the dispatcher: CASE state, K[id]; JMP block
    for i in 0..blocks.len() {
        let case_pc = disp_at + i * 2;
        code[case_pc] = Instruction::abx(OpCode::Case, state_reg, (kbase + i) as u32);
        let jmp_pc = case_pc + 1;
        let sj = start_of[i] as i64 - (jmp_pc as i64 + 1);
        code[jmp_pc] = Instruction::sj(OpCode::Jmp, sj as i32);
    }

    p.code = code;
}
