// Overlay behavior: patch transparency, trap exactness, breakpoint
// options, determinism with the overlay installed.

use super::helpers::controller;
use super::helpers::{new_vm, run, ProtoBuilder};
use crate::debug::{DebugHub, LineBreakpointSpec};
use crate::lua_value::Constant;
use crate::lua_vm::{Instruction as I, OpCode as Op};
use crate::{LuaValue, Prototype};
use std::sync::Arc;

fn k(index: u32) -> u32 {
    I::rk_as_k(index)
}

/// for i = 1, 10 do x = i end
/// Line 2 is the loop body; locals follow the compiler's layout with
/// the three internal loop-control registers before `i`.
fn loop_proto() -> Arc<Prototype> {
    ProtoBuilder::new("test", 6)
        .env_upvalue()
        .constant(Constant::Number(1.0))
        .constant(Constant::Number(10.0))
        .constant(Constant::String("x".to_string()))
        .op(1, I::create_abx(Op::LoadK, 0, 0))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abx(Op::LoadK, 2, 0))
        .op(1, I::create_asbx(Op::ForPrep, 0, 1))
        .op(2, I::create_abc(Op::SetTabUp, 0, k(2), 3))
        .op(1, I::create_asbx(Op::ForLoop, 0, -2))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .local("(for index)", 3, 6)
        .local("(for limit)", 3, 6)
        .local("(for step)", 3, 6)
        .local("i", 4, 5)
        .build()
}

fn bp(line: u32) -> LineBreakpointSpec {
    LineBreakpointSpec {
        line,
        ..Default::default()
    }
}

#[test]
fn test_patch_transparency_and_idempotence() {
    let hub = DebugHub::new();
    let proto = loop_proto();
    hub.register_prototype(&proto);
    let pristine = proto.code_snapshot();

    assert!(hub.set_instr_breakpoint("test", 4, true));
    let patched = proto.code_snapshot();
    assert_eq!(I::get_opcode(patched[4]), Op::DebugTrap);
    // Operands survive the patch; everything else is untouched
    for (i, (a, b)) in pristine.iter().zip(patched.iter()).enumerate() {
        if i != 4 {
            assert_eq!(a, b, "instruction {} changed", i);
        }
    }

    // Installing twice keeps the stored original unchanged
    assert!(hub.set_instr_breakpoint("test", 4, true));
    assert!(hub.set_instr_breakpoint("test", 4, false));
    assert_eq!(proto.code_snapshot(), pristine, "clear must restore byte-for-byte");
}

#[test]
fn test_deferred_instruction_breakpoint() {
    let hub = DebugHub::new();
    // Requested before the chunk is seen: deferred via instr_pending
    assert!(!hub.set_instr_breakpoint("test", 4, true));
    assert_eq!(hub.instr_breakpoints("test"), vec![4]);

    let proto = loop_proto();
    hub.register_prototype(&proto);
    assert_eq!(I::get_opcode(proto.fetch(4)), Op::DebugTrap);
    assert_eq!(hub.instr_breakpoints("test"), vec![4]);
}

#[test]
fn test_trap_exactness() {
    // A breakpoint in a body that runs 10 times fires exactly 10 times
    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints("test", vec![bp(2)]);

    let mut vm = new_vm();
    vm.attach_debugger(hub.clone());
    run(&mut vm, loop_proto()).expect("run");
    let (stops, _) = script.finish(&hub);
    assert_eq!(stops.len(), 10);
    assert!(stops.iter().all(|s| s.reason == "breakpoint" && s.line == 2));
    assert_eq!(vm.get_global("x"), LuaValue::Number(10.0));
}

#[test]
fn test_conditional_breakpoint_pauses_once() {
    // Condition "i == 7": six trap entries pass, the seventh pauses
    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints(
        "test",
        vec![LineBreakpointSpec {
            line: 2,
            condition: Some("i == 7".to_string()),
            ..Default::default()
        }],
    );

    let mut vm = new_vm();
    vm.attach_debugger(hub.clone());
    run(&mut vm, loop_proto()).expect("run");
    let (stops, _) = script.finish(&hub);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].reason, "breakpoint");
    assert_eq!(stops[0].line, 2);
    let frame = &stops[0].context.frames[0];
    let i = frame
        .locals
        .iter()
        .find(|v| v.name == "i")
        .expect("local i in snapshot");
    assert_eq!(i.value, "7");
    assert_eq!(vm.get_global("x"), LuaValue::Number(10.0));
}

#[test]
fn test_hit_condition() {
    // "% 3": pause on every third hit
    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints(
        "test",
        vec![LineBreakpointSpec {
            line: 2,
            hit_condition: Some("% 3".to_string()),
            ..Default::default()
        }],
    );

    let mut vm = new_vm();
    vm.attach_debugger(hub.clone());
    run(&mut vm, loop_proto()).expect("run");
    let (stops, _) = script.finish(&hub);
    assert_eq!(stops.len(), 3);
}

#[test]
fn test_log_point_never_pauses() {
    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints(
        "test",
        vec![LineBreakpointSpec {
            line: 2,
            log_message: Some("i is {i}".to_string()),
            ..Default::default()
        }],
    );

    let mut vm = new_vm();
    vm.attach_debugger(hub.clone());
    run(&mut vm, loop_proto()).expect("run");
    let (stops, outputs) = script.finish(&hub);
    assert!(stops.is_empty());
    let logs: Vec<&(String, String)> =
        outputs.iter().filter(|(c, _)| c == "console").collect();
    assert_eq!(logs.len(), 10);
    assert_eq!(logs[0].1, "i is 1");
    assert_eq!(logs[6].1, "i is 7");
}

#[test]
fn test_condition_error_skips_and_reports() {
    // A broken condition surfaces on stderr and the breakpoint is
    // treated as skip
    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints(
        "test",
        vec![LineBreakpointSpec {
            line: 2,
            condition: Some("i < \"oops\"".to_string()),
            ..Default::default()
        }],
    );

    let mut vm = new_vm();
    vm.attach_debugger(hub.clone());
    run(&mut vm, loop_proto()).expect("run");
    let (stops, outputs) = script.finish(&hub);
    assert!(stops.is_empty());
    assert!(outputs.iter().any(|(c, o)| c == "stderr" && o.contains("condition")));
    assert_eq!(vm.get_global("x"), LuaValue::Number(10.0));
}

#[test]
fn test_determinism_with_overlay_installed() {
    // Same side effects with and without the overlay, as long as no
    // breakpoint pauses or mutates state
    let mut plain_vm = new_vm();
    run(&mut plain_vm, loop_proto()).expect("plain run");
    let plain_x = plain_vm.get_global("x");

    let hub = DebugHub::new();
    let script = controller::spawn(hub.clone(), vec![]);
    hub.set_desired_breakpoints(
        "test",
        vec![LineBreakpointSpec {
            line: 2,
            condition: Some("i == 99".to_string()),
            ..Default::default()
        }],
    );
    let mut debug_vm = new_vm();
    debug_vm.attach_debugger(hub.clone());
    run(&mut debug_vm, loop_proto()).expect("debug run");
    let (stops, _) = script.finish(&hub);
    assert!(stops.is_empty());
    assert_eq!(plain_x, debug_vm.get_global("x"));
}

#[test]
fn test_bytecode_snapshot_shows_original_text() {
    let hub = DebugHub::new();
    let proto = loop_proto();
    hub.register_prototype(&proto);
    hub.set_instr_breakpoint("test", 4, true);
    let snapshot = hub.bytecode_snapshot(&proto, None);
    assert_eq!(snapshot.instructions.len(), proto.code_len());
    // The patched site still disassembles as its original instruction
    assert!(
        snapshot.instructions[4].text.starts_with("SETTABUP"),
        "{}",
        snapshot.instructions[4].text
    );
    assert!(!snapshot.instructions[4].text.contains("DEBUGTRAP"));
    assert_eq!(snapshot.instructions[4].line, 2);
}

#[test]
fn test_breakpoint_verification() {
    let hub = DebugHub::new();
    // Unregistered chunk: requested lines stay unverified
    let verification = hub.set_desired_breakpoints("test", vec![bp(2)]);
    assert_eq!(verification, vec![(2, false)]);

    let proto = loop_proto();
    hub.register_prototype(&proto);
    let verification = hub.set_desired_breakpoints("test", vec![bp(2), bp(99)]);
    assert_eq!(verification, vec![(2, true), (99, false)]);
}
