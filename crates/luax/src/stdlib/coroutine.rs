// Coroutine library: create, resume, yield, status, running, wrap,
// isyieldable.

use crate::lib_registry::LibraryModule;
use crate::lua_value::{Arity, LuaValue, ThreadStatus};
use crate::lua_vm::{LuaResult, LuaVM};

pub fn create_coroutine_lib() -> LibraryModule {
    crate::lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "yield" => coroutine_yield,
        "status" => coroutine_status,
        "running" => coroutine_running,
        "wrap" => coroutine_wrap,
        "isyieldable" => coroutine_isyieldable,
    })
}

fn coroutine_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let func = match vm.get_arg(1) {
        Some(f) if f.is_function() => f,
        _ => {
            return Err(vm.error("bad argument #1 to 'create' (function expected)".to_string()))
        }
    };
    let thread = vm.create_thread(func);
    vm.push_value(thread)?;
    Ok(1)
}

fn coroutine_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let id = match vm.get_arg(1).and_then(|v| v.as_thread_id()) {
        Some(id) => id,
        None => {
            return Err(vm.error("bad argument #1 to 'resume' (coroutine expected)".to_string()))
        }
    };
    let all_args = vm.get_args();
    let args = all_args[1..].to_vec();
    match vm.resume_thread(id, args) {
        Ok((_finished, results)) => {
            vm.push_value(LuaValue::Boolean(true))?;
            let count = results.len();
            for v in results {
                vm.push_value(v)?;
            }
            Ok(1 + count)
        }
        Err(e) if e.is_error() => {
            let message = vm.take_error_value(e);
            vm.push_value(LuaValue::Boolean(false))?;
            vm.push_value(message)?;
            Ok(2)
        }
        Err(e) => Err(e),
    }
}

fn coroutine_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    Err(vm.do_yield(args))
}

fn coroutine_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let id = match vm.get_arg(1).and_then(|v| v.as_thread_id()) {
        Some(id) => id,
        None => {
            return Err(vm.error("bad argument #1 to 'status' (coroutine expected)".to_string()))
        }
    };
    let status = if id == vm.current_thread_id() {
        "running"
    } else {
        match vm.thread_by_id(id).status {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    };
    let value = vm.create_string(status);
    vm.push_value(value)?;
    Ok(1)
}

fn coroutine_running(vm: &mut LuaVM) -> LuaResult<usize> {
    let id = vm.current_thread_id();
    vm.push_value(LuaValue::Thread(id))?;
    vm.push_value(LuaValue::Boolean(id.is_main()))?;
    Ok(2)
}

/// The callable returned by `coroutine.wrap`: resumes the bound thread
/// and re-raises its errors.
fn wrap_call(vm: &mut LuaVM) -> LuaResult<usize> {
    let id = match vm.current_bound().as_thread_id() {
        Some(id) => id,
        None => return Err(vm.error("wrapped coroutine is gone".to_string())),
    };
    let args = vm.get_args();
    let (_finished, results) = vm.resume_thread(id, args)?;
    let count = results.len();
    for v in results {
        vm.push_value(v)?;
    }
    Ok(count)
}

fn coroutine_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    let func = match vm.get_arg(1) {
        Some(f) if f.is_function() => f,
        _ => return Err(vm.error("bad argument #1 to 'wrap' (function expected)".to_string())),
    };
    let thread = vm.create_thread(func);
    let wrapped = vm.make_bound_host_fn("wrap", Arity::at_least(0), wrap_call, thread);
    vm.push_value(wrapped)?;
    Ok(1)
}

fn coroutine_isyieldable(vm: &mut LuaVM) -> LuaResult<usize> {
    let yieldable = !vm.current_thread_id().is_main();
    vm.push_value(LuaValue::Boolean(yieldable))?;
    Ok(1)
}
