// RETURN: copy results into the caller's return range, close upvalues
// at the frame base, pop the frame. Tail frames propagate through here
// without extra hops because a tail call reuses its caller's slot.

use crate::lua_vm::{LuaResult, LuaVM};

pub fn do_return(vm: &mut LuaVM, base: usize, a: u32, b: u32) -> LuaResult<()> {
    let (ret_base, nresults) = match vm.thread().current_frame() {
        Some(frame) => (frame.ret_base, frame.nresults),
        None => return Ok(()),
    };
    vm.thread_mut().close_upvalues(base);

    let first = base + a as usize;
    let n = if b > 0 {
        (b - 1) as usize
    } else {
        vm.thread().stack_top.saturating_sub(first)
    };
    if first != ret_base {
        let thread = vm.thread_mut();
        thread.ensure_stack(first + n);
        for i in 0..n {
            thread.stack[ret_base + i] = thread.stack[first + i].clone();
        }
    }
    super::call::adjust_results(vm, ret_base, n, nresults);
    vm.pop_frame();
    Ok(())
}
