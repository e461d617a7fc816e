// Calls, closures, upvalues, varargs, tail calls, protected calls.

use super::helpers::{new_vm, num, run, ProtoBuilder};
use crate::lua_value::Constant;
use crate::lua_vm::{Instruction as I, OpCode as Op};
use crate::{Arity, LuaResult, LuaValue, LuaVM};

fn k(index: u32) -> u32 {
    I::rk_as_k(index)
}

#[test]
fn test_upvalue_sharing_open_and_closed() {
    // local x = 10
    // set = function(v) x = v end
    // get = function() return x end
    // set(5); return get(), set, get
    let setter = ProtoBuilder::new("test", 2)
        .params(1)
        .upvalue("x", true, 0)
        .op(1, I::create_abc(Op::SetUpval, 0, 0, 0))
        .op(1, I::create_abc(Op::Return, 0, 1, 0))
        .local("v", 0, 2)
        .build();
    let getter = ProtoBuilder::new("test", 2)
        .upvalue("x", true, 0)
        .op(2, I::create_abc(Op::GetUpval, 0, 0, 0))
        .op(2, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let main = ProtoBuilder::new("test", 8)
        .constant(Constant::Number(10.0))
        .constant(Constant::Number(5.0))
        .child(setter)
        .child(getter)
        .op(1, I::create_abx(Op::LoadK, 0, 0)) // x = 10
        .op(2, I::create_abx(Op::Closure, 1, 0)) // set
        .op(3, I::create_abx(Op::Closure, 2, 1)) // get
        .op(4, I::create_abc(Op::Move, 3, 1, 0))
        .op(4, I::create_abx(Op::LoadK, 4, 1))
        .op(4, I::create_abc(Op::Call, 3, 2, 1)) // set(5)
        .op(5, I::create_abc(Op::Move, 3, 2, 0))
        .op(5, I::create_abc(Op::Call, 3, 1, 2)) // get() -> R3
        .op(6, I::create_abc(Op::Move, 4, 1, 0))
        .op(6, I::create_abc(Op::Move, 5, 2, 0))
        .op(6, I::create_abc(Op::Return, 3, 4, 0))
        .local("x", 1, 11)
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, main).expect("run");
    // Open upvalues: both closures observed set(5) while main was live
    assert_eq!(num(&results, 0), 5.0);
    // Closed upvalues: the shared cell outlives the frame
    let set = results[1].clone();
    let get = results[2].clone();
    vm.call_function(set, &[LuaValue::Number(99.0)]).expect("set");
    let got = vm.call_function(get, &[]).expect("get");
    assert_eq!(got, vec![LuaValue::Number(99.0)]);
}

#[test]
fn test_tail_call_constant_space() {
    // f = function(n) if n <= 0 then return 0 end; return f(n - 1) end
    // return f(10000)
    let f = ProtoBuilder::new("test", 4)
        .params(1)
        .env_upvalue()
        .constant(Constant::Number(0.0))
        .constant(Constant::String("f".to_string()))
        .constant(Constant::Number(1.0))
        .op(1, I::create_abc(Op::Le, 0, 0, k(0))) // n <= 0: skip jump
        .op(1, I::create_asbx(Op::Jmp, 0, 2))
        .op(2, I::create_abx(Op::LoadK, 1, 0))
        .op(2, I::create_abc(Op::Return, 1, 2, 0))
        .op(3, I::create_abc(Op::GetTabUp, 1, 0, k(1)))
        .op(3, I::create_abc(Op::Sub, 2, 0, k(2)))
        .op(3, I::create_abc(Op::TailCall, 1, 2, 0))
        .op(3, I::create_abc(Op::Return, 1, 0, 0))
        .local("n", 0, 8)
        .build();
    let main = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("f".to_string()))
        .constant(Constant::Number(10000.0))
        .child(f)
        .op(1, I::create_abx(Op::Closure, 0, 0))
        .op(1, I::create_abc(Op::SetTabUp, 0, k(0), 0))
        .op(2, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(2, I::create_abx(Op::LoadK, 1, 1))
        .op(2, I::create_abc(Op::Call, 0, 2, 2))
        .op(3, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, main).expect("run");
    assert_eq!(num(&results, 0), 0.0);
    // 10000 tail calls must not grow the physical call stack
    assert!(
        vm.thread_by_id(crate::ThreadId::MAIN).call_stack.len() < 8,
        "tail calls grew the call stack to {}",
        vm.thread_by_id(crate::ThreadId::MAIN).call_stack.len()
    );
}

#[test]
fn test_vararg_forwarding() {
    // f = function(...) return ... end; return f(1, 2, 3)
    let f = ProtoBuilder::new("test", 4)
        .vararg()
        .op(1, I::create_abc(Op::VarArg, 0, 0, 0))
        .op(1, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let main = ProtoBuilder::new("test", 6)
        .constant(Constant::Number(1.0))
        .constant(Constant::Number(2.0))
        .constant(Constant::Number(3.0))
        .child(f)
        .op(1, I::create_abx(Op::Closure, 0, 0))
        .op(2, I::create_abx(Op::LoadK, 1, 0))
        .op(2, I::create_abx(Op::LoadK, 2, 1))
        .op(2, I::create_abx(Op::LoadK, 3, 2))
        .op(2, I::create_abc(Op::Call, 0, 4, 0))
        .op(2, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, main).expect("run");
    assert_eq!(results.len(), 3);
    assert_eq!(num(&results, 0), 1.0);
    assert_eq!(num(&results, 1), 2.0);
    assert_eq!(num(&results, 2), 3.0);
}

#[test]
fn test_vararg_fixed_params_and_extras() {
    // f = function(a, ...) return a, ... end; return f(7, 8, 9)
    let f = ProtoBuilder::new("test", 6)
        .params(1)
        .vararg()
        .op(1, I::create_abc(Op::Move, 1, 0, 0))
        .op(1, I::create_abc(Op::VarArg, 2, 0, 0))
        .op(1, I::create_abc(Op::Return, 1, 0, 0))
        .local("a", 0, 3)
        .build();
    let main = ProtoBuilder::new("test", 6)
        .constant(Constant::Number(7.0))
        .constant(Constant::Number(8.0))
        .constant(Constant::Number(9.0))
        .child(f)
        .op(1, I::create_abx(Op::Closure, 0, 0))
        .op(2, I::create_abx(Op::LoadK, 1, 0))
        .op(2, I::create_abx(Op::LoadK, 2, 1))
        .op(2, I::create_abx(Op::LoadK, 3, 2))
        .op(2, I::create_abc(Op::Call, 0, 4, 0))
        .op(2, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, main).expect("run");
    assert_eq!(results.len(), 3);
    assert_eq!(num(&results, 0), 7.0);
    assert_eq!(num(&results, 1), 8.0);
    assert_eq!(num(&results, 2), 9.0);
}

fn failing_host(vm: &mut LuaVM) -> LuaResult<usize> {
    Err(vm.error("boom".to_string()))
}

#[test]
fn test_pcall_catches_host_error() {
    // return pcall(fail)
    let mut vm = new_vm();
    let fail = vm.make_host_fn("fail", Arity::at_least(0), failing_host);
    vm.set_global("fail", fail);
    let proto = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("pcall".to_string()))
        .constant(Constant::String("fail".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::GetTabUp, 1, 0, k(1)))
        .op(1, I::create_abc(Op::Call, 0, 2, 0))
        .op(1, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(results[0], LuaValue::Boolean(false));
    let msg = match &results[1] {
        LuaValue::String(s) => s.as_str().to_string(),
        other => panic!("expected message, got {:?}", other),
    };
    assert!(msg.contains("boom"), "{}", msg);
}

#[test]
fn test_error_unwinds_and_pcall_boundary() {
    // pcall(function() error("inner") end) leaves the VM usable
    let body = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("error".to_string()))
        .constant(Constant::String("inner".to_string()))
        .op(5, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(5, I::create_abx(Op::LoadK, 1, 1))
        .op(5, I::create_abc(Op::Call, 0, 2, 1))
        .op(5, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let main = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("pcall".to_string()))
        .child(body)
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abx(Op::Closure, 1, 0))
        .op(1, I::create_abc(Op::Call, 0, 2, 0))
        .op(1, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, main).expect("run");
    assert_eq!(results[0], LuaValue::Boolean(false));
    let msg = match &results[1] {
        LuaValue::String(s) => s.as_str().to_string(),
        other => panic!("expected message, got {:?}", other),
    };
    // error() prefixes the source location
    assert!(msg.contains("test:5"), "{}", msg);
    assert!(msg.contains("inner"), "{}", msg);
    assert_eq!(vm.thread_by_id(crate::ThreadId::MAIN).call_depth, 0);
}

#[test]
fn test_tail_call_traceback_marks_elided_frame() {
    // g errors at line 2; f tail-calls g from line 5; main calls f at 12.
    // The traceback shows g and main, with the tail marker for f.
    let g = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("nosuch".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(2, I::create_abc(Op::GetTable, 1, 0, k(0)))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let f = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("g".to_string()))
        .op(5, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(5, I::create_abc(Op::TailCall, 0, 1, 0))
        .op(5, I::create_abc(Op::Return, 0, 0, 0))
        .build();
    let main = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("f".to_string()))
        .constant(Constant::String("g".to_string()))
        .child(f)
        .child(g)
        .op(10, I::create_abx(Op::Closure, 0, 1))
        .op(10, I::create_abc(Op::SetTabUp, 0, k(1), 0))
        .op(11, I::create_abx(Op::Closure, 0, 0))
        .op(11, I::create_abc(Op::SetTabUp, 0, k(0), 0))
        .op(12, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(12, I::create_abc(Op::Call, 0, 1, 1))
        .op(13, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let err = run(&mut vm, main).expect_err("should fail");
    assert!(err.contains("attempt to index a nil value"), "{}", err);
    assert!(err.contains("test:2"), "{}", err);
    assert!(err.contains("(...tail calls...)"), "{}", err);
    assert!(err.contains("test:12"), "{}", err);
}

fn callable_host(vm: &mut LuaVM) -> LuaResult<usize> {
    // __call(self, arg): return arg * 2
    let arg = vm.get_arg(2).and_then(|v| v.as_number()).unwrap_or(0.0);
    vm.push_value(LuaValue::Number(arg * 2.0))?;
    Ok(1)
}

#[test]
fn test_call_metamethod() {
    // t is a table with __call; return t(21)
    let mut vm = new_vm();
    let t = LuaValue::new_table();
    let mt = LuaValue::new_table();
    let call = vm.make_host_fn("__call", Arity::at_least(1), callable_host);
    let key = vm.create_string("__call");
    if let LuaValue::Table(m) = &mt {
        m.borrow_mut().set(key, call).unwrap();
    }
    if let LuaValue::Table(table) = &t {
        table.borrow_mut().set_metatable(mt);
    }
    vm.set_global("t", t);
    let proto = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("t".to_string()))
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
fn test_call_error_on_non_callable() {
    let proto = ProtoBuilder::new("test", 2)
        .constant(Constant::Number(3.0))
        .op(1, I::create_abx(Op::LoadK, 0, 0))
        .op(1, I::create_abc(Op::Call, 0, 1, 1))
        .op(1, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let err = run(&mut vm, proto).expect_err("should fail");
    assert!(err.contains("attempt to call a number value"), "{}", err);
}

#[test]
fn test_stack_overflow_on_runaway_recursion() {
    // f = function() return 1 + f() end  (not a tail call)
    let f = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("f".to_string()))
        .constant(Constant::Number(1.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::Call, 0, 1, 2))
        .op(1, I::create_abc(Op::Add, 0, k(1), 0))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let main = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("f".to_string()))
        .child(f)
        .op(1, I::create_abx(Op::Closure, 0, 0))
        .op(1, I::create_abc(Op::SetTabUp, 0, k(0), 0))
        .op(2, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(2, I::create_abc(Op::Call, 0, 1, 1))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    let mut vm = new_vm();
    let err = run(&mut vm, main).expect_err("should overflow");
    assert!(err.contains("stack overflow"), "{}", err);
}
