// Numeric and generic for-loops.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// FORPREP A sBx: coerce the three control values, bias the index by
/// -step, jump to the loop tail.
pub fn handle_forprep(
    vm: &mut LuaVM,
    base: usize,
    a: u32,
    sbx: i32,
    pc: &mut usize,
) -> LuaResult<()> {
    let a = a as usize;
    let init = coerce_for(vm, base + a, "initial")?;
    let limit = coerce_for(vm, base + a + 1, "limit")?;
    let step = coerce_for(vm, base + a + 2, "step")?;
    vm.stack_set(base + a, LuaValue::Number(init - step))?;
    vm.stack_set(base + a + 1, LuaValue::Number(limit))?;
    vm.stack_set(base + a + 2, LuaValue::Number(step))?;
    *pc = (*pc as i64 + sbx as i64) as usize;
    Ok(())
}

fn coerce_for(vm: &mut LuaVM, slot: usize, what: &str) -> LuaResult<f64> {
    match vm.stack_get(slot).coerce_number() {
        Some(n) => Ok(n),
        None => {
            let msg = format!("'for' {} value must be a number", what);
            Err(vm.error_kind(LuaError::Arith, msg))
        }
    }
}

/// FORLOOP A sBx: advance the index; while (step>0 ? v <= limit
/// : v >= limit) holds, publish the loop variable and jump back.
pub fn handle_forloop(vm: &mut LuaVM, base: usize, a: u32, sbx: i32, pc: &mut usize) {
    let a = a as usize;
    let index = match vm.stack_get(base + a) {
        LuaValue::Number(n) => n,
        _ => return,
    };
    let limit = match vm.stack_get(base + a + 1) {
        LuaValue::Number(n) => n,
        _ => return,
    };
    let step = match vm.stack_get(base + a + 2) {
        LuaValue::Number(n) => n,
        _ => return,
    };
    let next = index + step;
    let continues = if step > 0.0 { next <= limit } else { next >= limit };
    if continues {
        let thread = vm.thread_mut();
        thread.stack_set(base + a, LuaValue::Number(next));
        thread.stack_set(base + a + 3, LuaValue::Number(next));
        *pc = (*pc as i64 + sbx as i64) as usize;
    }
}

/// TFORCALL A C: call the iterator with (state, control), placing C
/// results at R(A+3)..
pub fn handle_tforcall(vm: &mut LuaVM, base: usize, a: u32, c: u32) -> LuaResult<()> {
    let a = a as usize;
    let func = vm.stack_get(base + a);
    let state = vm.stack_get(base + a + 1);
    let control = vm.stack_get(base + a + 2);
    let results = vm.call_function(func, &[state, control])?;
    for i in 0..c as usize {
        let v = results.get(i).cloned().unwrap_or(LuaValue::Nil);
        vm.stack_set(base + a + 3 + i, v)?;
    }
    Ok(())
}
