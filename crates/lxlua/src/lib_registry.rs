// Library registration glue: batches of named native functions installed
// into a table (usually the globals or a library table).

use crate::lua_value::LuaValue;
use crate::lua_vm::{CFunction, LuaVM};

pub struct LibEntry {
    pub name: &'static str,
    pub func: CFunction,
}

/// Collects function tables and installs them under library names.
pub struct LibraryRegistry {
    libs: Vec<(&'static str, Vec<LibEntry>)>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        LibraryRegistry { libs: Vec::new() }
    }

    pub fn add(&mut self, name: &'static str, entries: Vec<LibEntry>) -> &mut Self {
        self.libs.push((name, entries));
        self
    }

    /// Install every registered library. An empty library name installs
    /// directly into globals.
    pub fn install(self, vm: &mut LuaVM) {
        for (lib_name, entries) in self.libs {
            if lib_name.is_empty() {
                for e in entries {
                    vm.set_global(e.name, LuaValue::cfunction(e.func));
                }
            } else {
                let tid = vm.alloc_table(0, entries.len());
                for e in entries {
                    let key = vm.intern_str(e.name);
                    let _ = vm.raw_set(tid, key, LuaValue::cfunction(e.func));
                }
                vm.set_global(lib_name, LuaValue::table(tid));
            }
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
