/*----------------------------------------------------------------------
  VM execution engine.

  Single-loop structure: 'startfunc is the function context switching
  point; pushing or popping a Lua frame re-enters it to reload the frame
  context (closure, base, pc). Host calls and metamethod fallbacks run
  nested on the Rust stack instead.

  The loop runs until the call depth returns to `target_depth`, which is
  how protected calls and nested metamethod invocations execute only
  their own frames.
----------------------------------------------------------------------*/

pub mod call;
mod closure_vararg_ops;
mod concat;
mod loop_instructions;
pub mod metamethod;
mod return_handler;
pub mod table_ops;

pub use metamethod::TmKind;

use crate::lua_value::{lua_table::fb2int, LuaTable, LuaValue};
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaVM, OpCode};
use std::cell::RefCell;
use std::rc::Rc;

/// Fields per SETLIST flush (LFIELDS_PER_FLUSH)
const FIELDS_PER_FLUSH: i64 = 50;

fn arith_apply(op: OpCode, x: f64, y: f64) -> f64 {
    match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Div => x / y, // true division
        OpCode::Mod => x - (x / y).floor() * y,
        OpCode::Pow => x.powf(y),
        _ => f64::NAN,
    }
}

/// Execute the current thread until its call depth drops back to
/// `target_depth`.
pub fn lua_execute(vm: &mut LuaVM, target_depth: usize) -> LuaResult<()> {
    let mut check_counter: u32 = 0;

    'startfunc: loop {
        let depth = vm.thread().call_depth;
        if depth <= target_depth {
            return Ok(());
        }
        let frame_idx = depth - 1;

        // ===== Load frame context =====
        let (func, mut pc, base, frame_top, awaiting, is_host) = {
            let ci = &vm.thread().call_stack[frame_idx];
            (
                ci.func.clone(),
                ci.pc as usize,
                ci.base,
                ci.top,
                ci.is_awaiting(),
                ci.is_host(),
            )
        };
        if awaiting {
            // A host call suspended here; the driver polls it to
            // completion before re-entering
            return Err(LuaError::Await);
        }
        if is_host {
            return Err(vm.error_kind(
                LuaError::Debugger,
                "host frame left on the call stack".to_string(),
            ));
        }
        let closure = match func.as_closure() {
            Some(c) => c.clone(),
            None => {
                return Err(vm.error_kind(
                    LuaError::Debugger,
                    "frame without a Lua closure".to_string(),
                ))
            }
        };
        let proto = closure.proto.clone();

        // Nil stale slots between the logical top and this frame's
        // register extent; registers must never expose a previous
        // frame's values
        {
            let thread = vm.thread_mut();
            let top = thread.stack_top;
            if top < frame_top {
                thread.ensure_stack(frame_top);
                for i in top..frame_top {
                    thread.stack[i] = LuaValue::Nil;
                }
            }
        }

        macro_rules! save_pc {
            () => {
                vm.thread_mut().call_stack[frame_idx].pc = pc as u32;
            };
        }
        macro_rules! reg {
            ($i:expr) => {
                vm.stack_get(base + ($i) as usize)
            };
        }
        macro_rules! rk {
            ($x:expr) => {{
                let x: u32 = $x;
                if Instruction::is_k(x) {
                    closure
                        .constants
                        .get(Instruction::rk_index(x) as usize)
                        .cloned()
                        .unwrap_or(LuaValue::Nil)
                } else {
                    vm.stack_get(base + x as usize)
                }
            }};
        }

        // ===== Main dispatch loop =====
        loop {
            check_counter += 1;
            if check_counter >= vm.limits.check_interval {
                check_counter = 0;
                if vm.cancelled() {
                    return Err(vm.error_kind(
                        LuaError::Cancelled,
                        "execution cancelled".to_string(),
                    ));
                }
                if let Some(hub) = vm.debug_hub().cloned() {
                    hub.drain_desired(vm);
                }
            }

            if pc >= proto.code_len() {
                return Err(vm.error_kind(
                    LuaError::Debugger,
                    "program counter ran past the end of the chunk".to_string(),
                ));
            }
            let mut instr = proto.fetch(pc);
            pc += 1;
            save_pc!();
            let mut op = Instruction::get_opcode(instr);
            if op == OpCode::DebugTrap {
                // Control enters the overlay; on resume it hands back
                // the recovered original instruction to execute
                instr = crate::debug::overlay::handle_trap(vm, frame_idx, (pc - 1) as u32, &proto)?;
                op = Instruction::get_opcode(instr);
            }
            let a = Instruction::get_a(instr);
            let b = Instruction::get_b(instr);
            let c = Instruction::get_c(instr);

            match op {
                OpCode::Move => {
                    let v = reg!(b);
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::LoadK => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let v = closure.constants.get(bx).cloned().unwrap_or(LuaValue::Nil);
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::LoadKx => {
                    if pc >= proto.code_len() {
                        return Err(vm.error_kind(
                            LuaError::Debugger,
                            "LOADKX without its extra argument".to_string(),
                        ));
                    }
                    let extra = proto.fetch(pc);
                    pc += 1;
                    let idx = Instruction::get_ax(extra) as usize;
                    let v = closure.constants.get(idx).cloned().unwrap_or(LuaValue::Nil);
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::LoadBool => {
                    vm.stack_set(base + a as usize, LuaValue::Boolean(b != 0))?;
                    if c != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for i in 0..=b as usize {
                        vm.stack_set(base + a as usize + i, LuaValue::Nil)?;
                    }
                }
                OpCode::GetUpval => {
                    let v = match closure.upvalues.get(b as usize) {
                        Some(upval) => vm.upvalue_get(upval),
                        None => {
                            return Err(vm.error_kind(
                                LuaError::Debugger,
                                format!("missing upvalue {}", b),
                            ))
                        }
                    };
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::SetUpval => {
                    let v = reg!(a);
                    match closure.upvalues.get(b as usize) {
                        Some(upval) => {
                            let upval = upval.clone();
                            vm.upvalue_set(&upval, v);
                        }
                        None => {
                            return Err(vm.error_kind(
                                LuaError::Debugger,
                                format!("missing upvalue {}", b),
                            ))
                        }
                    }
                }
                OpCode::GetTabUp => {
                    let table = match closure.upvalues.get(b as usize) {
                        Some(upval) => vm.upvalue_get(upval),
                        None => LuaValue::Nil,
                    };
                    let key = rk!(c);
                    let v = table_ops::index_value(vm, &table, &key)?;
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::GetTable => {
                    let table = reg!(b);
                    let key = rk!(c);
                    let v = table_ops::index_value(vm, &table, &key)?;
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::SetTabUp => {
                    let table = match closure.upvalues.get(a as usize) {
                        Some(upval) => vm.upvalue_get(upval),
                        None => LuaValue::Nil,
                    };
                    let key = rk!(b);
                    let value = rk!(c);
                    table_ops::set_index_value(vm, &table, &key, value)?;
                }
                OpCode::SetTable => {
                    let table = reg!(a);
                    let key = rk!(b);
                    let value = rk!(c);
                    table_ops::set_index_value(vm, &table, &key, value)?;
                }
                OpCode::NewTable => {
                    let table = LuaTable::with_capacity(fb2int(b), fb2int(c));
                    vm.stack_set(base + a as usize, LuaValue::Table(Rc::new(RefCell::new(table))))?;
                }
                OpCode::Self_ => {
                    let obj = reg!(b);
                    vm.stack_set(base + a as usize + 1, obj.clone())?;
                    let key = rk!(c);
                    let method = table_ops::index_value(vm, &obj, &key)?;
                    vm.stack_set(base + a as usize, method)?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    let lhs = rk!(b);
                    let rhs = rk!(c);
                    let v = match (lhs.coerce_number(), rhs.coerce_number()) {
                        (Some(x), Some(y)) => LuaValue::Number(arith_apply(op, x, y)),
                        _ => metamethod::arith_tm(vm, metamethod::arith_event(op), &lhs, &rhs)?,
                    };
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::Unm => {
                    let operand = reg!(b);
                    let v = match operand.coerce_number() {
                        Some(x) => LuaValue::Number(-x),
                        None => metamethod::arith_tm(vm, TmKind::Unm, &operand, &operand)?,
                    };
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::Not => {
                    let v = LuaValue::Boolean(reg!(b).is_falsy());
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::Len => {
                    let operand = reg!(b);
                    let v = match &operand {
                        LuaValue::String(s) => LuaValue::Number(s.len() as f64),
                        LuaValue::Table(t) => {
                            let mm = vm.get_metamethod(&operand, TmKind::Len);
                            if mm.is_nil() {
                                LuaValue::Number(t.borrow().length() as f64)
                            } else {
                                metamethod::call_tm_res(vm, mm, operand.clone(), operand.clone())?
                            }
                        }
                        _ => {
                            let mm = vm.get_metamethod(&operand, TmKind::Len);
                            if mm.is_nil() {
                                return Err(vm.type_error("get length of", &operand));
                            }
                            metamethod::call_tm_res(vm, mm, operand.clone(), operand.clone())?
                        }
                    };
                    vm.stack_set(base + a as usize, v)?;
                }
                OpCode::Concat => {
                    concat::handle_concat(vm, base, a, b, c)?;
                }
                OpCode::Jmp => {
                    if a > 0 {
                        vm.thread_mut().close_upvalues(base + a as usize - 1);
                    }
                    let sbx = Instruction::get_sbx(instr);
                    pc = (pc as i64 + sbx as i64) as usize;
                }
                OpCode::Eq => {
                    let lhs = rk!(b);
                    let rhs = rk!(c);
                    let r = metamethod::value_eq(vm, &lhs, &rhs)?;
                    if r != (a != 0) {
                        pc += 1;
                    }
                }
                OpCode::Lt => {
                    let lhs = rk!(b);
                    let rhs = rk!(c);
                    let r = metamethod::compare_lt(vm, &lhs, &rhs)?;
                    if r != (a != 0) {
                        pc += 1;
                    }
                }
                OpCode::Le => {
                    let lhs = rk!(b);
                    let rhs = rk!(c);
                    let r = metamethod::compare_le(vm, &lhs, &rhs)?;
                    if r != (a != 0) {
                        pc += 1;
                    }
                }
                OpCode::Test => {
                    if reg!(a).is_truthy() != (c != 0) {
                        pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let v = reg!(b);
                    if v.is_truthy() == (c != 0) {
                        vm.stack_set(base + a as usize, v)?;
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Call => {
                    save_pc!();
                    let func_idx = base + a as usize;
                    let nargs = if b == 0 {
                        vm.thread().stack_top.saturating_sub(func_idx + 1)
                    } else {
                        (b - 1) as usize
                    };
                    if b != 0 {
                        vm.thread_mut().set_top(func_idx + b as usize);
                    }
                    let nresults = c as i32 - 1;
                    if call::precall(vm, func_idx, nargs, nresults)? {
                        crate::debug::overlay::on_lua_frame_push(vm);
                        continue 'startfunc;
                    }
                }
                OpCode::TailCall => {
                    save_pc!();
                    let src = base + a as usize;
                    let nargs = if b == 0 {
                        vm.thread().stack_top.saturating_sub(src + 1)
                    } else {
                        (b - 1) as usize
                    };
                    // Close this frame's upvalues before its registers
                    // are recycled
                    vm.thread_mut().close_upvalues(base);
                    let (dst, nresults) = {
                        let ci = &vm.thread().call_stack[frame_idx];
                        (ci.func_idx, ci.nresults)
                    };
                    {
                        let thread = vm.thread_mut();
                        thread.ensure_stack(dst + nargs + 1);
                        for i in 0..=nargs {
                            thread.stack[dst + i] = thread.stack[src + i].clone();
                        }
                        thread.set_top(dst + nargs + 1);
                    }
                    // Reuse this frame's slot: Return then propagates
                    // straight to the original caller
                    vm.pop_frame();
                    if call::precall(vm, dst, nargs, nresults)? {
                        if let Some(frame) = vm.thread_mut().current_frame_mut() {
                            frame.set_tail();
                        }
                        crate::debug::overlay::on_lua_frame_push(vm);
                    }
                    continue 'startfunc;
                }
                OpCode::Return => {
                    crate::debug::overlay::on_frame_return(vm, frame_idx);
                    return_handler::do_return(vm, base, a, b)?;
                    continue 'startfunc;
                }
                OpCode::ForLoop => {
                    let sbx = Instruction::get_sbx(instr);
                    loop_instructions::handle_forloop(vm, base, a, sbx, &mut pc);
                }
                OpCode::ForPrep => {
                    let sbx = Instruction::get_sbx(instr);
                    loop_instructions::handle_forprep(vm, base, a, sbx, &mut pc)?;
                }
                OpCode::TForCall => {
                    save_pc!();
                    loop_instructions::handle_tforcall(vm, base, a, c)?;
                }
                OpCode::TForLoop => {
                    let control = reg!(a + 1);
                    if !control.is_nil() {
                        vm.stack_set(base + a as usize, control)?;
                        let sbx = Instruction::get_sbx(instr);
                        pc = (pc as i64 + sbx as i64) as usize;
                    }
                }
                OpCode::SetList => {
                    let n = if b == 0 {
                        vm.thread().stack_top.saturating_sub(base + a as usize + 1)
                    } else {
                        b as usize
                    };
                    let c_val = if c == 0 {
                        if pc >= proto.code_len() {
                            return Err(vm.error_kind(
                                LuaError::Debugger,
                                "SETLIST without its extra argument".to_string(),
                            ));
                        }
                        let extra = proto.fetch(pc);
                        pc += 1;
                        Instruction::get_ax(extra)
                    } else {
                        c
                    };
                    let table = reg!(a);
                    match table.as_table() {
                        Some(t) => {
                            let start = (c_val as i64 - 1) * FIELDS_PER_FLUSH;
                            for i in 1..=n {
                                let v = vm.stack_get(base + a as usize + i);
                                t.borrow_mut().set_int(start + i as i64, v);
                            }
                        }
                        None => {
                            return Err(vm.error_kind(
                                LuaError::Debugger,
                                "SETLIST target is not a table".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Closure => {
                    save_pc!();
                    let bx = Instruction::get_bx(instr);
                    closure_vararg_ops::handle_closure(vm, &closure, base, a, bx)?;
                }
                OpCode::VarArg => {
                    closure_vararg_ops::handle_vararg(vm, base, a, b)?;
                }
                OpCode::ExtraArg => {
                    // Consumed by the preceding instruction; standalone
                    // execution is a no-op
                }
                OpCode::DebugTrap => {
                    // The overlay recovered another trap: the stored
                    // original was lost, which is an internal invariant
                    // violation
                    return Err(vm.error_kind(
                        LuaError::Debugger,
                        "debug trap recovered a trap instruction".to_string(),
                    ));
                }
            }
        }
    }
}
