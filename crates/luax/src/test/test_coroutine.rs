// Coroutine status machine, resume/yield value plumbing.

use super::helpers::{new_vm, num, ProtoBuilder};
use crate::lua_value::Constant;
use crate::lua_vm::{Instruction as I, OpCode as Op};
use crate::{LuaValue, ThreadStatus};

fn k(index: u32) -> u32 {
    I::rk_as_k(index)
}

/// function(x) yield(x + 1); yield(x + 2) end
fn yielding_body() -> std::sync::Arc<crate::Prototype> {
    ProtoBuilder::new("test", 4)
        .params(1)
        .env_upvalue()
        .constant(Constant::String("yield".to_string()))
        .constant(Constant::Number(1.0))
        .constant(Constant::Number(2.0))
        .op(1, I::create_abc(Op::GetTabUp, 1, 0, k(0)))
        .op(1, I::create_abc(Op::Add, 2, 0, k(1)))
        .op(1, I::create_abc(Op::Call, 1, 2, 1))
        .op(2, I::create_abc(Op::GetTabUp, 1, 0, k(0)))
        .op(2, I::create_abc(Op::Add, 2, 0, k(2)))
        .op(2, I::create_abc(Op::Call, 1, 2, 1))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .local("x", 0, 7)
        .build()
}

#[test]
fn test_resume_yield_sequence() {
    let mut vm = new_vm();
    // Publish coroutine.yield as a plain global for the body
    let coroutine_table = vm.get_global("coroutine");
    let yield_key = vm.create_string("yield");
    let yield_fn = match &coroutine_table {
        LuaValue::Table(t) => t.borrow().get(&yield_key),
        _ => panic!("coroutine table missing"),
    };
    vm.set_global("yield", yield_fn);

    let body = vm.load_main(yielding_body());
    let co = vm.create_thread(body);
    let id = co.as_thread_id().expect("thread id");
    assert_eq!(vm.thread_by_id(id).status, ThreadStatus::Suspended);

    let (finished, values) = vm.resume_thread(id, vec![LuaValue::Number(10.0)]).expect("resume 1");
    assert!(!finished);
    assert_eq!(num(&values, 0), 11.0);
    assert_eq!(vm.thread_by_id(id).status, ThreadStatus::Suspended);

    let (finished, values) = vm.resume_thread(id, vec![]).expect("resume 2");
    assert!(!finished);
    assert_eq!(num(&values, 0), 12.0);

    let (finished, values) = vm.resume_thread(id, vec![]).expect("resume 3");
    assert!(finished);
    assert!(values.is_empty());
    assert_eq!(vm.thread_by_id(id).status, ThreadStatus::Dead);

    // Fourth resume: dead coroutine
    let err = vm.resume_thread(id, vec![]).expect_err("resume 4");
    let msg = vm.get_error_msg(err);
    assert!(msg.contains("cannot resume dead coroutine"), "{}", msg);
}

#[test]
fn test_yield_values_round_trip_through_resume() {
    // function() local got = yield(1); yield(got) end
    let body = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("yield".to_string()))
        .constant(Constant::Number(1.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abc(Op::Call, 0, 2, 2)) // got = yield(1)
        .op(2, I::create_abc(Op::GetTabUp, 1, 0, k(0)))
        .op(2, I::create_abc(Op::Move, 2, 0, 0))
        .op(2, I::create_abc(Op::Call, 1, 2, 1)) // yield(got)
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let coroutine_table = vm.get_global("coroutine");
    let yield_key = vm.create_string("yield");
    if let LuaValue::Table(t) = &coroutine_table {
        let y = t.borrow().get(&yield_key);
        vm.set_global("yield", y);
    }
    let closure = vm.load_main(body);
    let co = vm.create_thread(closure);
    let id = co.as_thread_id().expect("thread id");

    let (_, values) = vm.resume_thread(id, vec![]).expect("resume 1");
    assert_eq!(num(&values, 0), 1.0);
    // The value passed to this resume becomes yield's return value
    let (_, values) = vm
        .resume_thread(id, vec![LuaValue::Number(77.0)])
        .expect("resume 2");
    assert_eq!(num(&values, 0), 77.0);
}

#[test]
fn test_yield_from_main_thread_is_an_error() {
    let mut vm = new_vm();
    let err = vm.do_yield(vec![]);
    let msg = vm.get_error_msg(err);
    assert!(msg.contains("outside a coroutine"), "{}", msg);
}

#[test]
fn test_resume_running_coroutine_is_an_error() {
    let mut vm = new_vm();
    let main_id = vm.current_thread_id();
    let err = vm.resume_thread(main_id, vec![]).expect_err("self resume");
    let msg = vm.get_error_msg(err);
    assert!(msg.contains("non-suspended"), "{}", msg);
}

#[test]
fn test_error_inside_coroutine_kills_it() {
    // body indexes nil; the coroutine dies and the error surfaces
    let body = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("nosuch".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::GetTable, 1, 0, k(0)))
        .op(1, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let closure = vm.load_main(body);
    let co = vm.create_thread(closure);
    let id = co.as_thread_id().expect("thread id");
    let err = vm.resume_thread(id, vec![]).expect_err("body error");
    let msg = vm.get_error_msg(err);
    assert!(msg.contains("attempt to index"), "{}", msg);
    assert_eq!(vm.thread_by_id(id).status, ThreadStatus::Dead);
}
