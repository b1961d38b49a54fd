// Obfuscation passes: every flag combination must keep observable
// behavior identical across a dump/load cycle.

use crate::dump::{self, DumpOptions, ObfFlags};
use crate::test::helpers::*;
use crate::*;

fn opts(bits: u32, seed: u64) -> DumpOptions {
    DumpOptions {
        strip: false,
        obfuscate: ObfFlags::from_bits(bits),
        seed,
        envelop: false,
    }
}

/// Branchy function: abs(n) + 7, via comparisons and jumps.
fn branchy_proto(_vm: &mut LuaVM) -> std::rc::Rc<Proto> {
    let mut b = ProtoBuilder::new(1, 4);
    let k7 = b.k(LuaValue::integer(7));
    b.cmp_imm(OpCode::LtI, 0, 0, true); // 0: n < 0 ?
    b.sj(OpCode::Jmp, 2); // 1 -> 4 (negate)
    b.abc(OpCode::Move, 1, 0, 0); // 2
    b.sj(OpCode::Jmp, 1); // 3 -> 5
    b.abc(OpCode::Unm, 1, 0, 0); // 4
    b.abck(OpCode::AddK, 1, 1, k7, false); // 5
    b.abc(OpCode::Return1, 1, 0, 0); // 6
    b.build()
}

/// fact(n), loop-free recursion: safe for every pass including CFF.
fn run_fact(vm: &mut LuaVM, blob: &[u8], n: i64) -> i64 {
    let loaded = vm.load_bytes(blob, "=obf").unwrap();
    vm.set_global("fact", loaded);
    let r = vm.call_value(loaded, &[LuaValue::integer(n)]).unwrap();
    r.first().as_integer().unwrap()
}

#[test]
fn each_pass_preserves_factorial() {
    for bits in [
        ObfFlags::CFF,
        ObfFlags::SHUFFLE,
        ObfFlags::BOGUS,
        ObfFlags::STATE_ENC,
        ObfFlags::CFF | ObfFlags::SHUFFLE | ObfFlags::BOGUS | ObfFlags::STATE_ENC,
    ] {
        let mut vm = new_vm();
        let proto = build_factorial(&mut vm);
        let f = vm.closure_from_proto(proto);
        let blob = vm.dump_function(f, &opts(bits, 12345)).unwrap();
        assert_eq!(run_fact(&mut vm, &blob, 10), 3628800, "flags {:#x}", bits);
        assert_eq!(run_fact(&mut vm, &blob, 1), 1, "flags {:#x}", bits);
    }
}

#[test]
fn passes_preserve_loops() {
    // sum 1..100 with a numeric for loop; CFF skips loop bodies, shuffle
    // and bogus blocks must still recompute the loop offsets
    for bits in [ObfFlags::SHUFFLE, ObfFlags::BOGUS, ObfFlags::CFF, 0xF] {
        let mut vm = new_vm();
        let mut b = ProtoBuilder::new(0, 6);
        b.asbx(OpCode::LoadI, 4, 0);
        b.asbx(OpCode::LoadI, 0, 1);
        b.asbx(OpCode::LoadI, 1, 100);
        b.asbx(OpCode::LoadI, 2, 1);
        b.abx(OpCode::ForPrep, 0, 1);
        b.abc(OpCode::Add, 4, 4, 3);
        b.abx(OpCode::ForLoop, 0, 2);
        b.abc(OpCode::Return1, 4, 0, 0);
        let f = vm.closure_from_proto(b.build());
        let blob = vm.dump_function(f, &opts(bits, 999)).unwrap();
        let loaded = vm.load_bytes(&blob, "=loop").unwrap();
        let r = vm.call_value(loaded, &[]).unwrap();
        assert_eq!(r.first().as_integer(), Some(5050), "flags {:#x}", bits);
    }
}

#[test]
fn shuffle_actually_reorders_with_enough_blocks() {
    let mut vm = new_vm();
    let proto = build_factorial(&mut vm);
    let obf = dump::obfuscate::apply(&proto, ObfFlags::from_bits(ObfFlags::SHUFFLE), 7);
    // same instruction multiset is not guaranteed (jumps are rewritten)
    // but the stream should differ when there are blocks to move
    assert_ne!(obf.code, proto.code);
}

#[test]
fn cff_introduces_a_dispatcher() {
    let mut vm = new_vm();
    let proto = build_factorial(&mut vm);
    let obf = dump::obfuscate::apply(&proto, ObfFlags::from_bits(ObfFlags::CFF), 7);
    // flattening grows the stream and burns one register for the state
    assert!(obf.code.len() > proto.code.len());
    assert_eq!(obf.maxstacksize, proto.maxstacksize + 1);
    // block-id constants were appended
    assert!(obf.constants.len() > proto.constants.len());
}

#[test]
fn state_encoding_hides_integer_constants_in_the_dump() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 2);
    let k = b.k(LuaValue::integer(0x1122334455667788));
    b.abx(OpCode::LoadK, 0, k);
    b.abc(OpCode::Return1, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());

    let plain = vm.dump_function(f, &opts(0, 1)).unwrap();
    let encoded = vm.dump_function(f, &opts(ObfFlags::STATE_ENC, 1)).unwrap();

    let needle = 0x1122334455667788u64.to_le_bytes();
    assert!(plain.windows(8).any(|w| w == needle));
    assert!(!encoded.windows(8).any(|w| w == needle));

    // and it decodes back on load
    let loaded = vm.load_bytes(&encoded, "=enc").unwrap();
    let r = vm.call_value(loaded, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(0x1122334455667788));
}

#[test]
fn encode_decode_ints_are_inverse() {
    let key = dump::obfuscate::derive_enc_key(42);
    for v in [0i64, 1, -1, i64::MAX, i64::MIN, 123456789] {
        assert_eq!(dump::obfuscate::decode_int(dump::obfuscate::encode_int(v, key), key), v);
    }
}

#[test]
fn bogus_blocks_grow_the_stream_without_changing_results() {
    let mut vm = new_vm();
    let proto = branchy_proto(&mut vm);
    let obf = dump::obfuscate::apply(&proto, ObfFlags::from_bits(ObfFlags::BOGUS), 3);
    assert!(obf.code.len() > proto.code.len());

    let f_plain = vm.closure_from_proto(proto);
    let f_obf = vm.closure_from_proto(std::rc::Rc::new(obf));
    for n in [-5i64, 0, 9] {
        let a = vm.call_value(f_plain, &[LuaValue::integer(n)]).unwrap();
        let b = vm.call_value(f_obf, &[LuaValue::integer(n)]).unwrap();
        assert_eq!(a.first().as_integer(), b.first().as_integer());
    }
}
