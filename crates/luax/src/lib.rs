// Lua 5.2 runtime core: register VM, coroutines, and an in-process
// debugger that cooperates with the interpreter through instruction
// patching. The source compiler is an external collaborator; the VM
// consumes compiled prototypes (see `lua_value::chunk_io`).

#[cfg(test)]
mod test;

pub mod debug;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use debug::{DebugEvent, DebugHub, LineBreakpointSpec, ResumeAction, StepOverMode, VarScope};
pub use lib_registry::LibraryRegistry;
pub use lua_value::{
    Arity, Constant, LocalVar, LuaClosure, LuaString, LuaTable, LuaThread, LuaValue, Prototype,
    ThreadId, ThreadStatus, UpvalueDesc,
};
pub use lua_vm::{
    Instruction, LuaError, LuaFullError, LuaResult, LuaVM, OpCode, VmLimits,
};

use std::sync::Arc;

/// Run a compiled chunk on a fresh VM with the builtin libraries loaded.
pub fn execute(proto: Arc<Prototype>) -> Result<Vec<LuaValue>, LuaFullError> {
    let mut vm = LuaVM::new();
    if let Err(e) = stdlib::open_libs(&mut vm) {
        return Err(vm.into_full_error(e));
    }
    let main = vm.load_main(proto);
    vm.run_main(main).map_err(|e| vm.into_full_error(e))
}

/// Run a compiled chunk on a caller-provided VM (debugger hosts attach
/// their hub and sinks first).
pub fn execute_with_vm(
    vm: &mut LuaVM,
    proto: Arc<Prototype>,
) -> Result<Vec<LuaValue>, LuaFullError> {
    let main = vm.load_main(proto);
    vm.run_main(main).map_err(|e| vm.into_full_error(e))
}
