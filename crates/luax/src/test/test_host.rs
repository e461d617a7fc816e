// Host function registration, suspension (Awaiting frames), and
// cancellation.

use super::helpers::{new_vm, num, run, ProtoBuilder};
use crate::lua_value::Constant;
use crate::lua_vm::{Instruction as I, OpCode as Op};
use crate::{Arity, LuaResult, LuaValue, LuaVM};

fn k(index: u32) -> u32 {
    I::rk_as_k(index)
}

fn double_host(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.get_arg(1).and_then(|v| v.as_number()).unwrap_or(0.0);
    vm.push_value(LuaValue::Number(n * 2.0))?;
    Ok(1)
}

#[test]
fn test_register_host_function() {
    // return double(21)
    let mut vm = new_vm();
    vm.register_host_fn("double", Arity::exact(1), double_host);
    let proto = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("double".to_string()))
        .constant(Constant::Number(21.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abc(Op::Call, 0, 2, 2))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(num(&results, 0), 42.0);
}

#[test]
fn test_arity_descriptor_enforced() {
    // double() with no arguments violates the arity descriptor
    let mut vm = new_vm();
    vm.register_host_fn("double", Arity::exact(1), double_host);
    let proto = ProtoBuilder::new("test", 2)
        .env_upvalue()
        .constant(Constant::String("double".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::Call, 0, 1, 2))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let err = run(&mut vm, proto).expect_err("arity");
    assert!(err.contains("bad argument"), "{}", err);
}

fn slow_seven(vm: &mut LuaVM) -> LuaResult<usize> {
    // Suspends; completes with 7 after three polls
    let mut remaining = 3u32;
    Err(vm.park_poll(Box::new(move |vm| {
        remaining -= 1;
        if remaining == 0 {
            vm.push_value(LuaValue::Number(7.0))?;
            Ok(Some(1))
        } else {
            Ok(None)
        }
    })))
}

#[test]
fn test_host_suspension_resumes_at_call_site() {
    // return slow() + 1: the dispatch loop drives the parked poll and
    // the call completes in place
    let mut vm = new_vm();
    vm.register_host_fn("slow", Arity::at_least(0), slow_seven);
    let proto = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("slow".to_string()))
        .constant(Constant::Number(1.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::Call, 0, 1, 2))
        .op(1, I::create_abc(Op::Add, 0, 0, k(1)))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(num(&results, 0), 8.0);
}

#[test]
fn test_host_suspension_inside_coroutine() {
    let mut vm = new_vm();
    vm.register_host_fn("slow", Arity::at_least(0), slow_seven);
    let body = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("slow".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::Call, 0, 1, 2))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let closure = vm.load_main(body);
    let co = vm.create_thread(closure);
    let id = co.as_thread_id().expect("thread id");
    let (finished, values) = vm.resume_thread(id, vec![]).expect("resume");
    assert!(finished);
    assert_eq!(num(&values, 0), 7.0);
}

#[test]
fn test_cancellation_breaks_infinite_loop() {
    let proto = ProtoBuilder::new("test", 2)
        .op(1, I::create_asbx(Op::Jmp, 0, -1))
        .op(1, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let token = vm.cancel_token();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.store(true, std::sync::atomic::Ordering::Relaxed);
    });
    let err = run(&mut vm, proto).expect_err("cancelled");
    handle.join().ok();
    assert!(err.contains("cancelled"), "{}", err);
}

#[test]
fn test_print_goes_through_sink() {
    use std::cell::RefCell;
    use std::rc::Rc;
    // print("hi", 2)
    let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink_ref = captured.clone();
    let mut vm = new_vm();
    vm.set_print_sink(Box::new(move |line| {
        sink_ref.borrow_mut().push(line.to_string());
    }));
    let proto = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("print".to_string()))
        .constant(Constant::String("hi".to_string()))
        .constant(Constant::Number(2.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abx(Op::LoadK, 2, 2))
        .op(1, I::create_abc(Op::Call, 0, 3, 1))
        .op(1, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    run(&mut vm, proto).expect("run");
    assert_eq!(captured.borrow().as_slice(), ["hi\t2"]);
}
