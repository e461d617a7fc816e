// CLOSURE and VARARG.

use crate::lua_value::{LuaClosure, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};
use std::rc::Rc;

/// CLOSURE A Bx: build a closure from the Bx-th child prototype.
/// Upvalue descriptors resolve either to a local of the current frame
/// (creating or sharing an open upvalue) or to an upvalue of the
/// enclosing closure.
pub fn handle_closure(
    vm: &mut LuaVM,
    enclosing: &Rc<LuaClosure>,
    base: usize,
    a: u32,
    bx: u32,
) -> LuaResult<()> {
    let proto = match enclosing.proto.protos.get(bx as usize) {
        Some(p) => p.clone(),
        None => {
            return Err(vm.error_kind(
                LuaError::Runtime,
                format!("closure refers to missing child prototype {}", bx),
            ))
        }
    };
    let mut upvalues = Vec::with_capacity(proto.upvalues.len());
    for desc in &proto.upvalues {
        if desc.in_stack {
            let slot = base + desc.index as usize;
            upvalues.push(vm.thread_mut().get_or_add_upvalue(slot));
        } else {
            match enclosing.upvalues.get(desc.index as usize) {
                Some(upval) => upvalues.push(upval.clone()),
                None => {
                    return Err(vm.error_kind(
                        LuaError::Runtime,
                        format!("closure refers to missing upvalue {}", desc.index),
                    ))
                }
            }
        }
    }
    let closure = vm.create_closure(proto, upvalues);
    vm.stack_set(base + a as usize, closure)
}

/// VARARG A B: copy B-1 variable arguments (or all, when B == 0) into
/// R(A)... The extras live between the function slot and the frame base
/// after the vararg rotation, so slot i is `base - n_varargs + i`.
pub fn handle_vararg(vm: &mut LuaVM, base: usize, a: u32, b: u32) -> LuaResult<()> {
    let n_varargs = match vm.thread().current_frame() {
        Some(frame) => frame.n_varargs,
        None => 0,
    };
    let wanted = if b == 0 { n_varargs } else { (b - 1) as usize };
    let dst = base + a as usize;
    for i in 0..wanted {
        let v = if i < n_varargs {
            vm.stack_get(base - n_varargs + i)
        } else {
            LuaValue::Nil
        };
        vm.stack_set(dst + i, v)?;
    }
    if b == 0 {
        vm.thread_mut().set_top(dst + wanted);
    }
    Ok(())
}
