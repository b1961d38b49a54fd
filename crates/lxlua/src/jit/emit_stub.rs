// Stub backend for targets without an emitter: compiles nothing, so every
// prototype runs interpreted.

use std::rc::Rc;

use crate::lua_value::Proto;

pub fn emit(_proto: &Rc<Proto>) -> Option<Vec<u8>> {
    None
}
