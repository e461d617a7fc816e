// Instruction patching and the DebugTrap handler.
//
// The overlay is the only mutator of the instruction stream once the VM
// is running. Patching replaces the opcode bits of the live instruction
// with DebugTrap and stores the original word; clearing restores it
// byte-for-byte. The pause handshake blocks the VM thread on a one-shot
// channel; the hub lock is released around that wait.

use super::eval;
use super::snapshot;
use super::{
    BreakpointOptions, BreakpointSite, DebugEvent, DebugHub, HubState, LineBreakpointSpec,
    PausedState, PendingVarSet, ResumeAction, SiteKey, SiteKind, StepBreak, StepMode,
    StepOverMode, VarScope,
};
use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaVM, OpCode};
use std::sync::mpsc;
use std::sync::Arc;

/// Install a trap at (proto, index). Idempotent: an already-patched site
/// keeps its stored original; only the options are refreshed.
pub(crate) fn install_site(
    st: &mut HubState,
    proto: &Arc<Prototype>,
    index: u32,
    options: BreakpointOptions,
    kind: SiteKind,
) -> bool {
    if index as usize >= proto.code_len() {
        return false;
    }
    let key = (proto.key(), index);
    if st.active.contains_key(&key) {
        st.options.insert(key, options);
        return true;
    }
    let current = proto.fetch(index as usize);
    let original = if Instruction::get_opcode(current) != OpCode::DebugTrap {
        proto.patch(index as usize, Instruction::with_opcode(current, OpCode::DebugTrap));
        current
    } else if let Some(sb) = st.step_break.as_mut().filter(|sb| {
        sb.proto.key() == key.0 && sb.index == index
    }) {
        // The step trap owned this patch; the user breakpoint takes the
        // original over so neither record double-restores
        match sb.original.take() {
            Some(orig) => orig,
            None => return false,
        }
    } else if let Some(paused) = st.paused.as_ref().filter(|p| p.site == Some(key)) {
        paused.original
    } else {
        // Trapped with no owner on record: refuse rather than storing a
        // trap as "original"
        return false;
    };
    st.active.insert(
        key,
        BreakpointSite {
            proto: proto.clone(),
            index,
            original,
            kind,
        },
    );
    st.options.insert(key, options);
    st.hit_counts.insert(key, 0);
    true
}

/// Clear a site, restoring the saved instruction - except at the site
/// the VM is currently paused on (restoring there would let the
/// interpreter reinterpret it without a stop; the resume path restores
/// it instead).
pub(crate) fn clear_site(st: &mut HubState, key: SiteKey) {
    let Some(site) = st.active.remove(&key) else {
        return;
    };
    st.options.remove(&key);
    st.hit_counts.remove(&key);
    let paused_here = st
        .paused
        .as_ref()
        .map(|p| p.site == Some(key))
        .unwrap_or(false);
    if paused_here {
        return;
    }
    if let Some(sb) = st.step_break.as_mut().filter(|sb| {
        sb.proto.key() == key.0 && sb.index == key.1 && sb.original.is_none()
    }) {
        // A step trap still wants this site: hand the original over
        // instead of restoring
        sb.original = Some(site.original);
        return;
    }
    site.proto.patch(site.index as usize, site.original);
}

/// Install a line breakpoint: first instruction in the prototype tree
/// (children preferred, depth-first) whose line matches.
pub(crate) fn install_line_breakpoint(
    st: &mut HubState,
    root: &Arc<Prototype>,
    spec: &LineBreakpointSpec,
) -> bool {
    let Some((proto, index)) = root.find_line_instruction(spec.line) else {
        return false;
    };
    install_site(
        st,
        &proto,
        index,
        BreakpointOptions {
            condition: spec.condition.clone(),
            hit_condition: spec.hit_condition.clone(),
            log_message: spec.log_message.clone(),
        },
        SiteKind::Line,
    )
}

/// Clear-then-reinstall the line breakpoints of one chunk
pub(crate) fn apply_line_snapshot(
    st: &mut HubState,
    root: &Arc<Prototype>,
    specs: &[LineBreakpointSpec],
) {
    let chunk = root.chunk_name.clone();
    let stale: Vec<SiteKey> = st
        .active
        .iter()
        .filter(|(_, site)| site.kind == SiteKind::Line && site.proto.chunk_name == chunk)
        .map(|(key, _)| *key)
        .collect();
    for key in stale {
        clear_site(st, key);
    }
    for spec in specs {
        install_line_breakpoint(st, root, spec);
    }
}

/// Apply every desired snapshot whose chunk is registered
pub(crate) fn drain_desired_locked(st: &mut HubState) {
    let ready: Vec<(Arc<Prototype>, Vec<LineBreakpointSpec>)> = st
        .desired
        .iter()
        .filter_map(|(chunk, specs)| {
            st.registered
                .get(chunk)
                .map(|root| (root.clone(), specs.clone()))
        })
        .collect();
    for (root, specs) in &ready {
        st.desired.remove(&root.chunk_name);
        apply_line_snapshot(st, root, specs);
    }
}

/// Frame-push hook: realizes Step In by arming a trap at pc 0 of the
/// callee prototype.
pub fn on_lua_frame_push(vm: &mut LuaVM) {
    let Some(hub) = vm.debug_hub().cloned() else {
        return;
    };
    if hub.step_mode() != StepMode::In {
        return;
    }
    let (proto, depth) = {
        let thread = vm.thread();
        let Some(frame) = thread.current_frame() else {
            return;
        };
        let Some(closure) = frame.func.as_closure() else {
            return;
        };
        (closure.proto.clone(), thread.call_depth)
    };
    if !hub.take_step_mode(StepMode::In) {
        return;
    }
    let mut st = hub.lock();
    arm_step_at(&mut *st, &proto, 0, depth, vm.current_thread_id().0);
}

/// Frame-pop hook: realizes Step Out by arming a trap at the
/// instruction after the call-site in the caller prototype. Called
/// before the frame at `frame_idx` is popped.
pub fn on_frame_return(vm: &mut LuaVM, frame_idx: usize) {
    let Some(hub) = vm.debug_hub().cloned() else {
        return;
    };
    if hub.step_mode() != StepMode::Out {
        return;
    }
    if frame_idx == 0 {
        hub.take_step_mode(StepMode::Out);
        return;
    }
    let (proto, pc) = {
        let thread = vm.thread();
        let caller = &thread.call_stack[frame_idx - 1];
        if !caller.is_lua() {
            return;
        }
        let Some(closure) = caller.func.as_closure() else {
            return;
        };
        (closure.proto.clone(), caller.pc)
    };
    if !hub.take_step_mode(StepMode::Out) {
        return;
    }
    let mut st = hub.lock();
    arm_step_at(&mut *st, &proto, pc, frame_idx, vm.current_thread_id().0);
}

/// Arm the single step trap at (proto, index). A site that already
/// holds a user breakpoint is not re-patched and the step record does
/// not take its original.
pub(crate) fn arm_step_at(
    st: &mut HubState,
    proto: &Arc<Prototype>,
    index: u32,
    depth: usize,
    thread: usize,
) {
    if index as usize >= proto.code_len() {
        return;
    }
    // Disarm a previous step trap first
    disarm_step(st);
    let key = (proto.key(), index);
    let original = if st.active.contains_key(&key) {
        None
    } else {
        let current = proto.fetch(index as usize);
        if Instruction::get_opcode(current) == OpCode::DebugTrap {
            // Paused exactly here; the trap is already present
            None
        } else {
            proto.patch(
                index as usize,
                Instruction::with_opcode(current, OpCode::DebugTrap),
            );
            Some(current)
        }
    };
    st.step_break = Some(StepBreak {
        proto: proto.clone(),
        index,
        original,
        depth,
        thread,
    });
}

pub(crate) fn disarm_step(st: &mut HubState) {
    if let Some(sb) = st.step_break.take() {
        if let Some(original) = sb.original {
            sb.proto.patch(sb.index as usize, original);
        }
    }
}

/// Control-flow successor of the instruction at `index`, using current
/// register state for the data-dependent loop opcodes. `None` means the
/// walk ends (Return).
fn successor(vm: &LuaVM, base: usize, instr: u32, index: u32) -> Option<u32> {
    let next = index as i64 + 1;
    let jump = |target: i64| if target >= 0 { Some(target as u32) } else { None };
    match Instruction::get_opcode(instr) {
        OpCode::Return => None,
        OpCode::Jmp | OpCode::ForPrep => jump(next + Instruction::get_sbx(instr) as i64),
        OpCode::ForLoop => {
            let a = Instruction::get_a(instr) as usize;
            let index_v = vm.stack_get(base + a).as_number().unwrap_or(0.0);
            let limit = vm.stack_get(base + a + 1).as_number().unwrap_or(0.0);
            let step = vm.stack_get(base + a + 2).as_number().unwrap_or(0.0);
            let v = index_v + step;
            let continues = if step > 0.0 { v <= limit } else { v >= limit };
            if continues {
                jump(next + Instruction::get_sbx(instr) as i64)
            } else {
                jump(next)
            }
        }
        OpCode::TForLoop => {
            let a = Instruction::get_a(instr) as usize;
            if !vm.stack_get(base + a + 1).is_nil() {
                jump(next + Instruction::get_sbx(instr) as i64)
            } else {
                jump(next)
            }
        }
        _ => jump(next),
    }
}

/// First instruction of the next source line reachable from the pause
/// site, following control flow per the step-over contract.
fn next_line_target(
    st: &HubState,
    vm: &LuaVM,
    proto: &Arc<Prototype>,
    base: usize,
    start: u32,
    start_instr: u32,
    mode: StepOverMode,
) -> Option<u32> {
    let start_line = proto.line_of(start as usize);
    let code_len = proto.code_len() as u32;
    let mut instr = start_instr;
    let mut index = start;
    // Bounded walk: a cyclic path that never changes line gives up
    for _ in 0..proto.code_len().max(1) * 2 {
        let next = successor(vm, base, instr, index)?;
        if next >= code_len {
            return None;
        }
        if mode == StepOverMode::Instruction {
            return Some(next);
        }
        if proto.line_of(next as usize) != start_line {
            return Some(next);
        }
        index = next;
        instr = DebugHub::original_at(st, proto, index);
    }
    None
}

/// Arm Step Over from the pause site
fn arm_step_over(
    hub: &Arc<DebugHub>,
    vm: &LuaVM,
    proto: &Arc<Prototype>,
    base: usize,
    trap_pc: u32,
    original: u32,
    depth: usize,
) {
    let mut st = hub.lock();
    let mode = st.step_over_mode;
    let target = next_line_target(&*st, vm, proto, base, trap_pc, original, mode);
    if let Some(target) = target {
        arm_step_at(&mut *st, proto, target, depth, vm.current_thread_id().0);
    }
}

/// Parse `true/false`, a number, or a (possibly quoted) string
pub(crate) fn parse_set_value(vm: &mut LuaVM, text: &str) -> LuaValue {
    let trimmed = text.trim();
    match trimmed {
        "true" => return LuaValue::Boolean(true),
        "false" => return LuaValue::Boolean(false),
        "nil" => return LuaValue::Nil,
        _ => {}
    }
    if let Some(n) = crate::lua_value::parse_lua_number(trimmed) {
        return LuaValue::Number(n);
    }
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed);
    vm.create_string(unquoted)
}

/// Apply queued variable mutations on the VM thread. Failures surface
/// as stderr output events and never stop execution.
fn apply_pending_sets(vm: &mut LuaVM, hub: &Arc<DebugHub>, sets: Vec<PendingVarSet>) {
    for set in sets {
        let depth = vm.thread().call_depth;
        if set.frame_id >= depth {
            hub.emit(DebugEvent::Output {
                category: "stderr",
                output: format!("set {}: no frame {}", set.name, set.frame_id),
            });
            continue;
        }
        let frame_idx = depth - 1 - set.frame_id;
        let (closure, base, pc) = {
            let ci = &vm.thread().call_stack[frame_idx];
            match ci.func.as_closure() {
                Some(c) => (c.clone(), ci.base, ci.pc.saturating_sub(1)),
                None => {
                    hub.emit(DebugEvent::Output {
                        category: "stderr",
                        output: format!("set {}: frame {} is not a Lua frame", set.name, set.frame_id),
                    });
                    continue;
                }
            }
        };
        let value = parse_set_value(vm, &set.value);
        let applied = match set.scope {
            VarScope::Local => {
                let reg = closure
                    .proto
                    .active_locals(pc)
                    .into_iter()
                    .find(|(_, var)| var.name == set.name.as_str())
                    .map(|(reg, _)| reg);
                match reg {
                    Some(reg) => vm.stack_set(base + reg, value).is_ok(),
                    None => false,
                }
            }
            VarScope::Upvalue => {
                let idx = closure
                    .proto
                    .upvalues
                    .iter()
                    .position(|u| u.name == set.name.as_str());
                match idx {
                    Some(idx) => match closure.upvalues.get(idx) {
                        Some(upval) => {
                            let upval = upval.clone();
                            vm.upvalue_set(&upval, value);
                            true
                        }
                        None => false,
                    },
                    None => false,
                }
            }
        };
        if !applied {
            hub.emit(DebugEvent::Output {
                category: "stderr",
                output: format!("set {}: no such variable in frame {}", set.name, set.frame_id),
            });
        }
    }
}

/// The DebugTrap handler. Entered by the interpreter when it fetches a
/// trap at (proto, trap_pc); returns the recovered original instruction
/// for the interpreter to execute on resume.
pub fn handle_trap(
    vm: &mut LuaVM,
    frame_idx: usize,
    trap_pc: u32,
    proto: &Arc<Prototype>,
) -> LuaResult<u32> {
    let Some(hub) = vm.debug_hub().cloned() else {
        return Err(vm.error_kind(
            LuaError::Debugger,
            "debug trap fired without a debugger attached".to_string(),
        ));
    };
    let key: SiteKey = (proto.key(), trap_pc);
    let depth_now = vm.thread().call_depth;
    let thread_now = vm.current_thread_id().0;

    let mut reason: &'static str = "breakpoint";
    let original: u32;
    {
        let mut st = hub.lock();

        // 1. Step trap?
        let step_hit = st
            .step_break
            .as_ref()
            .map(|sb| sb.proto.key() == key.0 && sb.index == trap_pc)
            .unwrap_or(false);
        if step_hit {
            let armed = st.step_break.as_ref().map(|sb| (sb.depth, sb.thread));
            if let Some((armed_depth, armed_thread)) = armed {
                if thread_now == armed_thread && depth_now > armed_depth {
                    // Depth grew since arming (recursion through the
                    // same site): pass through, keep the trap armed
                    let orig = DebugHub::original_at(&*st, proto, trap_pc);
                    if Instruction::get_opcode(orig) == OpCode::DebugTrap {
                        drop(st);
                        return Err(vm.error_kind(
                            LuaError::Debugger,
                            "step trap lost its original instruction".to_string(),
                        ));
                    }
                    return Ok(orig);
                }
            }
            let Some(sb) = st.step_break.take() else {
                drop(st);
                return Err(vm.error_kind(
                    LuaError::Debugger,
                    "step trap record disappeared".to_string(),
                ));
            };
            reason = "step";
            match sb.original {
                Some(orig) => {
                    // Restore and clear: the step trap is one-shot
                    proto.patch(trap_pc as usize, orig);
                    original = orig;
                }
                None => {
                    // The site carries a user breakpoint that owns the
                    // patch; never double-restore
                    match st.active.get(&key) {
                        Some(site) => original = site.original,
                        None => {
                            drop(st);
                            return Err(vm.error_kind(
                                LuaError::Debugger,
                                "step trap site lost its breakpoint".to_string(),
                            ));
                        }
                    }
                }
            }
        } else {
            // 2. Must be an active breakpoint
            match st.active.get(&key) {
                Some(site) => original = site.original,
                None => {
                    drop(st);
                    return Err(vm.error_kind(
                        LuaError::Debugger,
                        "debug trap fired without a registered original instruction".to_string(),
                    ));
                }
            }

            // 3. Apply any pending desired snapshot from the controller
            drain_desired_locked(&mut *st);
            if !st.active.contains_key(&key) {
                // The snapshot just removed this breakpoint (and
                // restored the site); resume without pausing
                return Ok(original);
            }

            // 4-6. Hit condition, condition, log point
            let count = {
                let entry = st.hit_counts.entry(key).or_insert(0);
                *entry += 1;
                *entry
            };
            let options = st.options.get(&key).cloned().unwrap_or_default();
            if let Some(hit_text) = &options.hit_condition {
                match eval::eval_hit_condition(hit_text, count) {
                    Ok(true) => {}
                    Ok(false) => return Ok(original),
                    Err(msg) => {
                        drop(st);
                        hub.emit(DebugEvent::Output {
                            category: "stderr",
                            output: format!("hit condition error: {}", msg),
                        });
                        return Ok(original);
                    }
                }
            }
            if let Some(cond) = &options.condition {
                let outcome = {
                    let resolver = snapshot::FrameResolver::new(vm, frame_idx, trap_pc);
                    eval::eval_condition(cond, &|name| resolver.resolve(name))
                };
                match outcome {
                    Ok(true) => {}
                    Ok(false) => return Ok(original),
                    Err(msg) => {
                        drop(st);
                        hub.emit(DebugEvent::Output {
                            category: "stderr",
                            output: format!("breakpoint condition error: {}", msg),
                        });
                        return Ok(original);
                    }
                }
            }
            if let Some(template) = &options.log_message {
                let rendered = {
                    let resolver = snapshot::FrameResolver::new(vm, frame_idx, trap_pc);
                    eval::render_log_template(template, &|name| resolver.resolve(name))
                };
                drop(st);
                hub.emit(DebugEvent::Output {
                    category: "console",
                    output: rendered,
                });
                return Ok(original);
            }
        }

        // 7. Capture the stopped context and publish
        let (context, warnings) = snapshot::capture(vm, reason, frame_idx, trap_pc, proto);
        let (tx, rx) = mpsc::channel::<ResumeAction>();
        let stopped = DebugEvent::Stopped {
            reason,
            thread_id: thread_now,
            file: context.file.clone(),
            line: context.line,
        };
        st.paused = Some(PausedState {
            context,
            resume_tx: tx,
            site: if reason == "step" { None } else { Some(key) },
            original,
        });
        st.last_thread = thread_now;
        drop(st);
        for warning in warnings {
            hub.emit(DebugEvent::Output {
                category: "stderr",
                output: warning,
            });
        }
        hub.emit(stopped);

        // Block the executing thread until the controller resumes.
        // The hub lock is NOT held here.
        let action = rx.recv().unwrap_or(ResumeAction::Continue);

        // Resume: drain queued work, re-arm steps, then execute the
        // recovered original instruction
        let (sets, site_cleared) = {
            let mut st = hub.lock();
            st.paused = None;
            let sets = std::mem::take(&mut st.pending_sets);
            drain_desired_locked(&mut *st);
            let site_cleared = reason != "step" && !st.active.contains_key(&key);
            (sets, site_cleared)
        };
        if site_cleared {
            // The breakpoint was cleared while paused; restore the site
            // now that we hold the original
            proto.patch(trap_pc as usize, original);
        }
        apply_pending_sets(vm, &hub, sets);

        let base = vm.thread().call_stack[frame_idx].base;
        match action {
            ResumeAction::Continue => {}
            ResumeAction::StepOver => {
                arm_step_over(&hub, vm, proto, base, trap_pc, original, depth_now);
            }
            ResumeAction::StepIn => {
                let op = Instruction::get_opcode(original);
                let is_call = matches!(op, OpCode::Call | OpCode::TailCall);
                let callee_is_lua = if is_call {
                    let a = Instruction::get_a(original) as usize;
                    vm.stack_get(base + a).as_closure().is_some()
                } else {
                    false
                };
                if callee_is_lua {
                    hub.set_step_mode(StepMode::In);
                } else {
                    arm_step_over(&hub, vm, proto, base, trap_pc, original, depth_now);
                }
            }
            ResumeAction::StepOut => {
                hub.set_step_mode(StepMode::Out);
            }
        }
        hub.emit(DebugEvent::Continued);
    }
    Ok(original)
}
