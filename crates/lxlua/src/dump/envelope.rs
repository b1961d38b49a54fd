// The Nirithy envelope: an outer wrapping for dump blobs.
//
// Layout before encoding: timestamp_le64 ‖ iv_16 ‖ aes128_ctr(payload),
// key = SHA-256(timestamp_le64 ‖ "NirithySalt")[0..16]. The whole blob is
// base64-encoded with a non-standard alphabet and prefixed with the
// literal marker.

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine;
use base64::alphabet::Alphabet;
use base64::engine::general_purpose::PAD;
use sha2::{Digest, Sha256};

use crate::lua_vm::{LuaError, LuaResult, LuaVM};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const ENVELOPE_MARKER: &[u8] = b"Nirithy==";
const SALT: &[u8] = b"NirithySalt";
const ALPHABET: &str = "9876543210zyxwvutsrqponmlkjihgfedcbaZYXWVUTSRQPONMLKJIHGFEDCBA-_";

fn engine() -> base64::engine::GeneralPurpose {
    let alphabet = Alphabet::new(ALPHABET).expect("static alphabet is valid");
    base64::engine::GeneralPurpose::new(&alphabet, PAD)
}

/// AES-128 key for a given timestamp.
pub fn derive_key(timestamp: u64) -> [u8; 16] {
    let mut input = Vec::with_capacity(8 + SALT.len());
    input.extend_from_slice(&timestamp.to_le_bytes());
    input.extend_from_slice(SALT);
    let digest = Sha256::digest(&input);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Wrap `payload` with an explicit timestamp and IV (tests pin both).
pub fn envelop_with(payload: &[u8], timestamp: u64, iv: [u8; 16]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(24 + payload.len());
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(payload);

    let key = derive_key(timestamp);
    let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut blob[24..]);

    let mut out = Vec::with_capacity(ENVELOPE_MARKER.len() + blob.len() * 4 / 3 + 4);
    out.extend_from_slice(ENVELOPE_MARKER);
    out.extend_from_slice(engine().encode(&blob).as_bytes());
    out
}

/// Wrap `payload` with the current time and a random IV.
pub fn envelop(payload: &[u8]) -> Vec<u8> {
    use rand::RngCore;
    let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    envelop_with(payload, timestamp, iv)
}

pub fn is_enveloped(blob: &[u8]) -> bool {
    blob.starts_with(ENVELOPE_MARKER)
}

/// Strip the marker, decode, and decrypt. Any malformed step reports an
/// invalid dump.
pub fn unenvelop(vm: &mut LuaVM, blob: &[u8]) -> LuaResult<Vec<u8>> {
    let Some(encoded) = blob.strip_prefix(ENVELOPE_MARKER) else {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: missing envelope marker"));
    };
    let decoded = engine()
        .decode(encoded)
        .map_err(|_| vm.raise_plain(LuaError::DumpError, "invalid dump: bad envelope encoding"))?;
    if decoded.len() < 24 {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: truncated envelope"));
    }

    let timestamp = u64::from_le_bytes(decoded[..8].try_into().unwrap());
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&decoded[8..24]);

    let key = derive_key(timestamp);
    let mut payload = decoded[24..].to_vec();
    let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut payload);
    Ok(payload)
}
