// Test module organization
pub mod helpers;

pub mod test_class;
pub mod test_debug;
pub mod test_envelope;
pub mod test_gc;
pub mod test_hotpatch;
pub mod test_jit;
pub mod test_obfuscate;
pub mod test_tbc;
pub mod test_value;
pub mod test_vm;
