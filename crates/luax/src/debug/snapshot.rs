// Stopped-context capture. Everything captured here is plain data
// (strings and numbers) so the controller thread can read it without
// touching VM values.

use super::HubState;
use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::{Instruction, LuaVM, OpCode};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct VarEntry {
    pub name: String,
    pub value: String,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// 0 = innermost
    pub id: usize,
    pub chunk: String,
    pub file: String,
    pub line: u32,
    pub pc: u32,
    pub proto_key: usize,
    pub what: String,
    pub is_tail: bool,
    pub locals: Vec<VarEntry>,
    pub upvalues: Vec<VarEntry>,
}

/// The consistent snapshot the controller observes while the VM is
/// paused: everything refers to the instant just before the paused
/// instruction executes.
#[derive(Debug, Clone)]
pub struct PausedContext {
    pub reason: &'static str,
    pub thread_id: usize,
    pub chunk: String,
    pub file: String,
    pub line: u32,
    pub pc: u32,
    proto_key: usize,
    pub frames: Vec<FrameSnapshot>,
    pub globals: Vec<VarEntry>,
}

impl PausedContext {
    pub(crate) fn proto_key(&self) -> usize {
        self.proto_key
    }
}

/// Cap on the globals dump; everything beyond is summarized
const MAX_GLOBALS: usize = 500;

fn var_entry(vm: &LuaVM, name: String, value: &LuaValue) -> VarEntry {
    VarEntry {
        name,
        value: vm.display_value(value),
        type_name: value.type_name().to_string(),
    }
}

fn strip_chunk(chunk: &str) -> String {
    chunk.strip_prefix('@').unwrap_or(chunk).to_string()
}

/// Capture the stopped context. Snapshot failures are collected as
/// warnings and surfaced as stderr output events, never silently
/// dropped.
pub(crate) fn capture(
    vm: &LuaVM,
    reason: &'static str,
    trap_frame_idx: usize,
    trap_pc: u32,
    trap_proto: &Arc<Prototype>,
) -> (PausedContext, Vec<String>) {
    let mut warnings = Vec::new();
    let thread = vm.thread();
    let depth = thread.call_depth;
    let mut frames = Vec::with_capacity(depth);

    for (id, frame_idx) in (0..depth).rev().enumerate() {
        let ci = &thread.call_stack[frame_idx];
        match ci.func.as_closure() {
            Some(closure) => {
                let proto = &closure.proto;
                let pc = if frame_idx == trap_frame_idx {
                    trap_pc
                } else {
                    ci.pc.saturating_sub(1)
                };
                let line = proto.line_of(pc as usize);
                let mut locals = Vec::new();
                for (reg, var) in proto.active_locals(pc) {
                    let slot = ci.base + reg;
                    if slot >= thread.stack.len() {
                        warnings.push(format!(
                            "local '{}' refers past the stack (register {})",
                            var.name, reg
                        ));
                        continue;
                    }
                    locals.push(var_entry(
                        vm,
                        var.name.to_string(),
                        &thread.stack[slot],
                    ));
                }
                let mut upvalues = Vec::new();
                for (i, desc) in proto.upvalues.iter().enumerate() {
                    match closure.upvalues.get(i) {
                        Some(upval) => {
                            let value = vm.upvalue_get(upval);
                            upvalues.push(var_entry(vm, desc.name.to_string(), &value));
                        }
                        None => warnings.push(format!(
                            "upvalue '{}' missing from closure",
                            desc.name
                        )),
                    }
                }
                frames.push(FrameSnapshot {
                    id,
                    chunk: proto.chunk_name.to_string(),
                    file: strip_chunk(&proto.chunk_name),
                    line,
                    pc,
                    proto_key: proto.key(),
                    what: if proto.line_defined == 0 {
                        "main".to_string()
                    } else {
                        "Lua".to_string()
                    },
                    is_tail: ci.is_tail(),
                    locals,
                    upvalues,
                });
            }
            None => {
                let name = ci
                    .func
                    .as_host_fn()
                    .map(|f| f.name.to_string())
                    .unwrap_or_else(|| "?".to_string());
                frames.push(FrameSnapshot {
                    id,
                    chunk: format!("[host {}]", name),
                    file: "[host]".to_string(),
                    line: 0,
                    pc: 0,
                    proto_key: 0,
                    what: "host".to_string(),
                    is_tail: false,
                    locals: Vec::new(),
                    upvalues: Vec::new(),
                });
            }
        }
    }

    let mut globals = Vec::new();
    if let LuaValue::Table(t) = vm.globals() {
        let table = t.borrow();
        let mut key = LuaValue::Nil;
        while let Some((k, v)) = table.next(&key) {
            if globals.len() >= MAX_GLOBALS {
                warnings.push(format!("globals truncated at {} entries", MAX_GLOBALS));
                break;
            }
            globals.push(var_entry(vm, k.to_string(), &v));
            key = k;
        }
    }

    let line = trap_proto.line_of(trap_pc as usize);
    let context = PausedContext {
        reason,
        thread_id: vm.current_thread_id().0,
        chunk: trap_proto.chunk_name.to_string(),
        file: strip_chunk(&trap_proto.chunk_name),
        line,
        pc: trap_pc,
        proto_key: trap_proto.key(),
        frames,
        globals,
    };
    (context, warnings)
}

/// Name resolution against a paused frame: locals, then upvalues, then
/// globals. Used by breakpoint conditions and log templates.
pub(crate) struct FrameResolver<'a> {
    vm: &'a LuaVM,
    frame_idx: usize,
    pc: u32,
}

impl<'a> FrameResolver<'a> {
    pub fn new(vm: &'a LuaVM, frame_idx: usize, pc: u32) -> Self {
        FrameResolver { vm, frame_idx, pc }
    }

    pub fn resolve(&self, name: &str) -> Option<LuaValue> {
        let thread = self.vm.thread();
        let ci = thread.call_stack.get(self.frame_idx)?;
        if let Some(closure) = ci.func.as_closure() {
            for (reg, var) in closure.proto.active_locals(self.pc) {
                if var.name == name {
                    return Some(thread.stack_get(ci.base + reg));
                }
            }
            for (i, desc) in closure.proto.upvalues.iter().enumerate() {
                if desc.name == name {
                    return closure.upvalues.get(i).map(|u| self.vm.upvalue_get(u));
                }
            }
        }
        if let LuaValue::Table(t) = self.vm.globals() {
            let key = LuaValue::String(std::rc::Rc::new(crate::lua_value::LuaString::new(name)));
            let v = t.borrow().get(&key);
            if !v.is_nil() {
                return Some(v);
            }
        }
        None
    }
}

// ===== Bytecode views =====

#[derive(Debug, Clone)]
pub struct BytecodeInstr {
    pub index: u32,
    pub line: u32,
    pub text: String,
    pub child_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BytecodeSnapshot {
    pub chunk: String,
    pub pc: Option<u32>,
    pub instructions: Vec<BytecodeInstr>,
    pub constants: Vec<String>,
    pub locals: Vec<String>,
    pub upvalues: Vec<String>,
}

/// Disassemble a prototype, substituting stored originals at patched
/// sites so the controller always sees the real instruction stream.
pub(crate) fn bytecode_of(
    st: &HubState,
    proto: &Arc<Prototype>,
    pc: Option<u32>,
) -> BytecodeSnapshot {
    let len = proto.code_len() as u32;
    let mut instructions = Vec::with_capacity(len as usize);
    for index in 0..len {
        let instr = super::DebugHub::original_at(st, proto, index);
        let child_index = match Instruction::get_opcode(instr) {
            OpCode::Closure => Some(Instruction::get_bx(instr)),
            _ => None,
        };
        instructions.push(BytecodeInstr {
            index,
            line: proto.line_of(index as usize),
            text: Instruction::disassemble(instr, proto),
            child_index,
        });
    }
    BytecodeSnapshot {
        chunk: proto.chunk_name.to_string(),
        pc,
        instructions,
        constants: proto.constants.iter().map(|k| k.to_string()).collect(),
        locals: proto.locals.iter().map(|l| l.name.to_string()).collect(),
        upvalues: proto.upvalues.iter().map(|u| u.name.to_string()).collect(),
    }
}
