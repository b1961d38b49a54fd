// The Nirithy envelope: marker, key derivation, encryption round trips.

use crate::dump::envelope::{self, ENVELOPE_MARKER};
use crate::dump::DumpOptions;
use crate::test::helpers::*;
use crate::*;

use sha2::{Digest, Sha256};

#[test]
fn sha256_matches_published_vectors() {
    let digest = Sha256::digest(b"abc");
    assert_eq!(
        format!("{:x}", digest),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    let digest = Sha256::digest(b"");
    assert_eq!(
        format!("{:x}", digest),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn key_derivation_is_deterministic() {
    let k1 = envelope::derive_key(1700000000);
    let k2 = envelope::derive_key(1700000000);
    assert_eq!(k1, k2);
    let k3 = envelope::derive_key(1700000001);
    assert_ne!(k1, k3);
}

#[test]
fn envelope_round_trip_with_pinned_parameters() {
    let mut vm = new_vm();
    let payload = b"arbitrary bytes \x00\x01\x02 with zeros".to_vec();
    let wrapped = envelope::envelop_with(&payload, 1700000000, [0u8; 16]);

    assert!(wrapped.starts_with(ENVELOPE_MARKER));
    // everything after the marker stays within the custom alphabet
    const ALPHABET: &[u8] =
        b"9876543210zyxwvutsrqponmlkjihgfedcbaZYXWVUTSRQPONMLKJIHGFEDCBA-_=";
    assert!(
        wrapped[ENVELOPE_MARKER.len()..]
            .iter()
            .all(|b| ALPHABET.contains(b))
    );

    let back = envelope::unenvelop(&mut vm, &wrapped).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn envelope_is_random_per_wrap_but_always_reversible() {
    let mut vm = new_vm();
    let payload = b"same payload".to_vec();
    let a = envelope::envelop(&payload);
    let b = envelope::envelop(&payload);
    assert_ne!(a, b); // fresh IV every time
    assert_eq!(envelope::unenvelop(&mut vm, &a).unwrap(), payload);
    assert_eq!(envelope::unenvelop(&mut vm, &b).unwrap(), payload);
}

#[test]
fn corrupted_envelopes_report_invalid_dump() {
    let mut vm = new_vm();
    let err = envelope::unenvelop(&mut vm, b"NoMarkerHere").unwrap_err();
    assert_eq!(err, LuaError::DumpError);

    let mut bad = Vec::new();
    bad.extend_from_slice(ENVELOPE_MARKER);
    bad.extend_from_slice(b"!!!! not base64 !!!!");
    let err = envelope::unenvelop(&mut vm, &bad).unwrap_err();
    assert_eq!(err, LuaError::DumpError);

    // valid encoding but too short for timestamp + IV
    let short = envelope::envelop_with(b"", 1, [0u8; 16]);
    let truncated = &short[..ENVELOPE_MARKER.len() + 8];
    let err = envelope::unenvelop(&mut vm, truncated).unwrap_err();
    assert_eq!(err, LuaError::DumpError);
}

/// Dump a trivial function returning 42, wrap, load, run.
#[test]
fn enveloped_dump_executes_after_loading() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 2);
    b.asbx(OpCode::LoadI, 0, 42);
    b.abc(OpCode::Return1, 0, 0, 0);
    let f = vm.closure_from_proto(b.build());

    // envelop defaults to on
    let blob = vm.dump_function(f, &DumpOptions::default()).unwrap();
    assert!(blob.starts_with(ENVELOPE_MARKER));

    let loaded = vm.load_bytes(&blob, "=wrapped").unwrap();
    let r = vm.call_value(loaded, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(42));

    // and with the envelope turned off the raw dump loads the same way
    let opts = DumpOptions { envelop: false, ..DumpOptions::default() };
    let raw = vm.dump_function(f, &opts).unwrap();
    assert!(crate::dump::is_dump(&raw));
    let loaded = vm.load_bytes(&raw, "=raw").unwrap();
    let r = vm.call_value(loaded, &[]).unwrap();
    assert_eq!(r.first().as_integer(), Some(42));
}
