// Call machinery: __call resolution, host calls, frame setup, and the
// nested-call entry used by metamethods and library code.

use super::metamethod::TmKind;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Resolve the `__call` chain at `func_idx`: each round inserts the
/// callable-to-be in front of the arguments and retries, bounded like
/// the metamethod chains.
fn resolve_call_chain(
    vm: &mut LuaVM,
    func_idx: usize,
    nargs: usize,
) -> LuaResult<usize> {
    let mut nargs = nargs;
    for _ in 0..vm.limits.max_meta_chain {
        let func = vm.stack_get(func_idx);
        if func.is_function() {
            return Ok(nargs);
        }
        let handler = vm.get_metamethod(&func, TmKind::Call);
        if handler.is_nil() {
            let msg = format!("attempt to call a {} value", func.type_name());
            return Err(vm.error_kind(LuaError::Call, msg));
        }
        // Shift func + args up one slot, put the handler in front
        let thread = vm.thread_mut();
        thread.ensure_stack(func_idx + nargs + 2);
        for i in (0..=nargs).rev() {
            thread.stack[func_idx + 1 + i] = thread.stack[func_idx + i].clone();
        }
        thread.stack[func_idx] = handler;
        if thread.stack_top < func_idx + nargs + 2 {
            thread.stack_top = func_idx + nargs + 2;
        }
        nargs += 1;
    }
    Err(vm.error_kind(
        LuaError::Call,
        "'__call' chain too long; possible loop".to_string(),
    ))
}

/// Prepare a call at `func_idx` with `nargs` arguments. Returns true if
/// a Lua frame was pushed (the dispatch loop must re-enter), false if a
/// host call completed in place.
pub fn precall(
    vm: &mut LuaVM,
    func_idx: usize,
    nargs: usize,
    nresults: i32,
) -> LuaResult<bool> {
    let nargs = resolve_call_chain(vm, func_idx, nargs)?;
    let func = vm.stack_get(func_idx);
    match &func {
        LuaValue::Function(closure) => {
            let closure = closure.clone();
            vm.push_frame_lua(func.clone(), &closure, func_idx, nargs)?;
            if let Some(frame) = vm.thread_mut().current_frame_mut() {
                frame.nresults = nresults;
            }
            Ok(true)
        }
        LuaValue::HostFunction(_) => {
            call_host(vm, func_idx, nargs, nresults)?;
            Ok(false)
        }
        _ => {
            let msg = format!("attempt to call a {} value", func.type_name());
            Err(vm.error_kind(LuaError::Call, msg))
        }
    }
}

/// Run a host function at `func_idx`. On success its results replace
/// the function and arguments. On Yield/Await the frame is left in
/// place for the resume/poll path; real errors unwind through the
/// caller's protection.
pub fn call_host(
    vm: &mut LuaVM,
    func_idx: usize,
    nargs: usize,
    nresults: i32,
) -> LuaResult<()> {
    let func = vm.stack_get(func_idx);
    let host = match func.as_host_fn() {
        Some(h) => h.clone(),
        None => {
            let msg = format!("attempt to call a {} value", func.type_name());
            return Err(vm.error_kind(LuaError::Call, msg));
        }
    };
    if nargs < host.arity.min as usize {
        let msg = format!(
            "bad argument #{} to '{}' (value expected)",
            nargs + 1,
            host.name
        );
        return Err(vm.error(msg));
    }
    vm.push_frame_host(func, func_idx, nargs)?;
    if let Some(frame) = vm.thread_mut().current_frame_mut() {
        frame.nresults = nresults;
    }
    let n = (host.func)(vm)?;
    finish_host_results(vm, func_idx, n, nresults);
    vm.pop_frame();
    Ok(())
}

/// Move the host function's `n` pushed results down over the function
/// slot and adjust to the requested count.
pub fn finish_host_results(vm: &mut LuaVM, func_idx: usize, n: usize, nresults: i32) {
    let top = vm.thread().stack_top;
    let n = n.min(top.saturating_sub(func_idx));
    let src = top - n;
    if src != func_idx {
        let thread = vm.thread_mut();
        for i in 0..n {
            thread.stack[func_idx + i] = thread.stack[src + i].clone();
        }
    }
    adjust_results(vm, func_idx, n, nresults);
}

/// Results sit at `dst..dst+actual`; pad with nil or truncate so the
/// caller sees `wanted` values (-1 keeps all), and fix the logical top.
pub fn adjust_results(vm: &mut LuaVM, dst: usize, actual: usize, wanted: i32) {
    let thread = vm.thread_mut();
    if wanted < 0 {
        thread.set_top(dst + actual);
        return;
    }
    let wanted = wanted as usize;
    if actual < wanted {
        thread.ensure_stack(dst + wanted);
        for i in actual..wanted {
            thread.stack[dst + i] = LuaValue::Nil;
        }
    }
    thread.set_top(dst + wanted);
}

/// Nested call entry: used by `call_function`, so metamethods, iterator
/// calls, and protected calls all share one path. Runs the callee to
/// completion (the Rust stack nests with the Lua one here).
pub fn do_call(
    vm: &mut LuaVM,
    func_idx: usize,
    nargs: usize,
    nresults: i32,
    entry_depth: usize,
) -> LuaResult<()> {
    if precall(vm, func_idx, nargs, nresults)? {
        super::lua_execute(vm, entry_depth)?;
    }
    Ok(())
}
