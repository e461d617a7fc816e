// Builtin host functions. The full standard library lives outside the
// core; these are the functions the VM's own semantics lean on
// (protected calls, iteration, coroutines) plus the small conveniences
// every chunk assumes.

pub mod basic;
pub mod coroutine;

use crate::lib_registry::LibraryRegistry;
use crate::lua_vm::{LuaResult, LuaVM};

pub fn open_libs(vm: &mut LuaVM) -> LuaResult<()> {
    let mut registry = LibraryRegistry::new();
    registry.register(basic::create_basic_lib());
    registry.register(coroutine::create_coroutine_lib());
    registry.load_all(vm)
}
