// Core interpreter semantics on hand-assembled chunks.

use super::helpers::{new_vm, num, run, text, ProtoBuilder};
use crate::lua_value::Constant;
use crate::lua_vm::{Instruction as I, OpCode as Op};
use crate::{Arity, LuaResult, LuaValue, LuaVM};

fn k(index: u32) -> u32 {
    I::rk_as_k(index)
}

#[test]
fn test_arithmetic_string_coercion() {
    // return "3" + 4
    let proto = ProtoBuilder::new("test", 2)
        .constant(Constant::String("3".to_string()))
        .constant(Constant::Number(4.0))
        .op(1, I::create_abc(Op::Add, 0, k(0), k(1)))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(results.len(), 1);
    assert_eq!(num(&results, 0), 7.0);
}

#[test]
fn test_arithmetic_division_and_modulus() {
    // return 7 / 2, 7 % 2, -7 % 2
    let proto = ProtoBuilder::new("test", 4)
        .constant(Constant::Number(7.0))
        .constant(Constant::Number(2.0))
        .constant(Constant::Number(-7.0))
        .op(1, I::create_abc(Op::Div, 0, k(0), k(1)))
        .op(1, I::create_abc(Op::Mod, 1, k(0), k(1)))
        .op(1, I::create_abc(Op::Mod, 2, k(2), k(1)))
        .op(1, I::create_abc(Op::Return, 0, 4, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(num(&results, 0), 3.5);
    assert_eq!(num(&results, 1), 1.0);
    // Lua modulus: a - floor(a/b)*b, so -7 % 2 == 1
    assert_eq!(num(&results, 2), 1.0);
}

#[test]
fn test_modulus_by_zero_is_nan() {
    let proto = ProtoBuilder::new("test", 2)
        .constant(Constant::Number(5.0))
        .constant(Constant::Number(0.0))
        .op(1, I::create_abc(Op::Mod, 0, k(0), k(1)))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, proto).expect("run");
    assert!(num(&results, 0).is_nan());
}

fn add_returns_42(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_value(LuaValue::Number(42.0))?;
    Ok(1)
}

#[test]
fn test_metamethod_add() {
    // t with metatable {__add = function() return 42 end}; return t + t
    let mut vm = new_vm();
    let t = LuaValue::new_table();
    let mt = LuaValue::new_table();
    let mm = vm.make_host_fn("__add", Arity::at_least(0), add_returns_42);
    let key = vm.create_string("__add");
    if let LuaValue::Table(m) = &mt {
        m.borrow_mut().set(key, mm).unwrap();
    }
    if let LuaValue::Table(table) = &t {
        table.borrow_mut().set_metatable(mt);
    }
    vm.set_global("t", t);

    let proto = ProtoBuilder::new("test", 3)
        .env_upvalue()
        .constant(Constant::String("t".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::GetTabUp, 1, 0, k(0)))
        .op(1, I::create_abc(Op::Add, 0, 0, 1))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(num(&results, 0), 42.0);
}

#[test]
fn test_concat() {
    // return "a" .. "b" .. 1
    let proto = ProtoBuilder::new("test", 4)
        .constant(Constant::String("a".to_string()))
        .constant(Constant::String("b".to_string()))
        .constant(Constant::Number(1.0))
        .op(1, I::create_abx(Op::LoadK, 0, 0))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abx(Op::LoadK, 2, 2))
        .op(1, I::create_abc(Op::Concat, 0, 0, 2))
        .op(1, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(text(&results, 0), "ab1");
}

#[test]
fn test_newtable_setlist_len() {
    // return #{10, 20, 30}
    let proto = ProtoBuilder::new("test", 5)
        .constant(Constant::Number(10.0))
        .constant(Constant::Number(20.0))
        .constant(Constant::Number(30.0))
        .op(1, I::create_abc(Op::NewTable, 0, 3, 0))
        .op(1, I::create_abx(Op::LoadK, 1, 0))
        .op(1, I::create_abx(Op::LoadK, 2, 1))
        .op(1, I::create_abx(Op::LoadK, 3, 2))
        .op(1, I::create_abc(Op::SetList, 0, 3, 1))
        .op(1, I::create_abc(Op::Len, 1, 0, 0))
        .op(1, I::create_abc(Op::Return, 1, 2, 0))
        .build();
    let mut vm = new_vm();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(num(&results, 0), 3.0);
}

#[test]
fn test_numeric_for_loop() {
    // total = 0; for i = 1, 10 do total = total + i end; return total
    let mut vm = new_vm();
    vm.set_global("total", LuaValue::Number(0.0));
    let proto = ProtoBuilder::new("test", 6)
        .env_upvalue()
        .constant(Constant::Number(1.0))
        .constant(Constant::Number(10.0))
        .constant(Constant::String("total".to_string()))
        .op(1, I::create_abx(Op::LoadK, 0, 0)) // index init 1
        .op(1, I::create_abx(Op::LoadK, 1, 1)) // limit 10
        .op(1, I::create_abx(Op::LoadK, 2, 0)) // step 1
        .op(1, I::create_asbx(Op::ForPrep, 0, 3)) // to the ForLoop
        .op(2, I::create_abc(Op::GetTabUp, 4, 0, k(2)))
        .op(2, I::create_abc(Op::Add, 4, 4, 3))
        .op(2, I::create_abc(Op::SetTabUp, 0, k(2), 4))
        .op(1, I::create_asbx(Op::ForLoop, 0, -4))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .local("i", 4, 8)
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert!(results.is_empty());
    assert_eq!(vm.get_global("total"), LuaValue::Number(55.0));
}

#[test]
fn test_for_loop_negative_step() {
    // total = 0; for i = 3, 1, -1 do total = total + i end
    let mut vm = new_vm();
    vm.set_global("total", LuaValue::Number(0.0));
    let proto = ProtoBuilder::new("test", 6)
        .env_upvalue()
        .constant(Constant::Number(3.0))
        .constant(Constant::Number(1.0))
        .constant(Constant::Number(-1.0))
        .constant(Constant::String("total".to_string()))
        .op(1, I::create_abx(Op::LoadK, 0, 0))
        .op(1, I::create_abx(Op::LoadK, 1, 1))
        .op(1, I::create_abx(Op::LoadK, 2, 2))
        .op(1, I::create_asbx(Op::ForPrep, 0, 3))
        .op(2, I::create_abc(Op::GetTabUp, 4, 0, k(3)))
        .op(2, I::create_abc(Op::Add, 4, 4, 3))
        .op(2, I::create_abc(Op::SetTabUp, 0, k(3), 4))
        .op(1, I::create_asbx(Op::ForLoop, 0, -4))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    run(&mut vm, proto).expect("run");
    assert_eq!(vm.get_global("total"), LuaValue::Number(6.0));
}

#[test]
fn test_generic_for_with_next() {
    // total = 0; for k, v in next, t, nil do total = total + v end
    let mut vm = new_vm();
    vm.set_global("total", LuaValue::Number(0.0));
    let t = LuaValue::new_table();
    if let LuaValue::Table(table) = &t {
        for (i, v) in [5.0, 6.0, 7.0].iter().enumerate() {
            table.borrow_mut().set_int(i as i64 + 1, LuaValue::Number(*v));
        }
    }
    vm.set_global("t", t);
    let proto = ProtoBuilder::new("test", 8)
        .env_upvalue()
        .constant(Constant::String("next".to_string()))
        .constant(Constant::String("t".to_string()))
        .constant(Constant::String("total".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::GetTabUp, 1, 0, k(1)))
        .op(1, I::create_abc(Op::LoadNil, 2, 0, 0))
        .op(1, I::create_asbx(Op::Jmp, 0, 3))
        .op(2, I::create_abc(Op::GetTabUp, 5, 0, k(2)))
        .op(2, I::create_abc(Op::Add, 5, 5, 4))
        .op(2, I::create_abc(Op::SetTabUp, 0, k(2), 5))
        .op(1, I::create_abc(Op::TForCall, 0, 0, 2))
        .op(1, I::create_asbx(Op::TForLoop, 2, -5))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    run(&mut vm, proto).expect("run");
    assert_eq!(vm.get_global("total"), LuaValue::Number(18.0));
}

fn record_lt(vm: &mut LuaVM) -> LuaResult<usize> {
    // __lt comparing the "v" field; records call order in a global
    let a = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let b = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    let field = vm.create_string("v");
    let av = match &a {
        LuaValue::Table(t) => t.borrow().get(&field),
        _ => LuaValue::Nil,
    };
    let bv = match &b {
        LuaValue::Table(t) => t.borrow().get(&field),
        _ => LuaValue::Nil,
    };
    let call_count = vm.get_global("lt_calls").as_number().unwrap_or(0.0);
    vm.set_global("lt_calls", LuaValue::Number(call_count + 1.0));
    let result = match (av.as_number(), bv.as_number()) {
        (Some(x), Some(y)) => x < y,
        _ => false,
    };
    vm.push_value(LuaValue::Boolean(result))?;
    Ok(1)
}

/// With only `__lt` defined, `a <= b` is computed as `not (b < a)` and
/// yields the same jump decision as a direct `__le`.
#[test]
fn test_le_through_reversed_lt() {
    let mut vm = new_vm();
    let mt = LuaValue::new_table();
    let lt = vm.make_host_fn("__lt", Arity::at_least(2), record_lt);
    let key = vm.create_string("__lt");
    if let LuaValue::Table(m) = &mt {
        m.borrow_mut().set(key, lt).unwrap();
    }
    let field = vm.create_string("v");
    for (name, value) in [("t1", 1.0), ("t2", 2.0)] {
        let t = LuaValue::new_table();
        if let LuaValue::Table(table) = &t {
            table.borrow_mut().set(field.clone(), LuaValue::Number(value)).unwrap();
            table.borrow_mut().set_metatable(mt.clone());
        }
        vm.set_global(name, t);
    }
    vm.set_global("lt_calls", LuaValue::Number(0.0));

    // return t1 <= t2, t2 <= t1
    let proto = ProtoBuilder::new("test", 4)
        .env_upvalue()
        .constant(Constant::String("t1".to_string()))
        .constant(Constant::String("t2".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::GetTabUp, 1, 0, k(1)))
        .op(1, I::create_abc(Op::Le, 1, 0, 1))
        .op(1, I::create_asbx(Op::Jmp, 0, 1))
        .op(1, I::create_abc(Op::LoadBool, 2, 0, 1))
        .op(1, I::create_abc(Op::LoadBool, 2, 1, 0))
        .op(2, I::create_abc(Op::Le, 1, 1, 0))
        .op(2, I::create_asbx(Op::Jmp, 0, 1))
        .op(2, I::create_abc(Op::LoadBool, 3, 0, 1))
        .op(2, I::create_abc(Op::LoadBool, 3, 1, 0))
        .op(3, I::create_abc(Op::Return, 2, 3, 0))
        .build();
    let results = run(&mut vm, proto).expect("run");
    assert_eq!(results[0], LuaValue::Boolean(true)); // not (2 < 1)
    assert_eq!(results[1], LuaValue::Boolean(false)); // not (1 < 2)
    assert_eq!(vm.get_global("lt_calls"), LuaValue::Number(2.0));
}

#[test]
fn test_index_error_message() {
    // return missing.field  -> attempt to index a nil value
    let proto = ProtoBuilder::new("test", 2)
        .env_upvalue()
        .constant(Constant::String("missing".to_string()))
        .constant(Constant::String("field".to_string()))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(2, I::create_abc(Op::GetTable, 0, 0, k(1)))
        .op(2, I::create_abc(Op::Return, 0, 2, 0))
        .build();
    let mut vm = new_vm();
    let err = run(&mut vm, proto).expect_err("should fail");
    assert!(err.contains("attempt to index a nil value"), "{}", err);
    assert!(err.contains("test:2"), "{}", err);
}

#[test]
fn test_newindex_bypassed_on_existing_key() {
    // A raw hit on an existing non-nil key must not consult __newindex
    let mut vm = new_vm();
    let t = LuaValue::new_table();
    let mt = LuaValue::new_table();
    let flag_fn = vm.make_host_fn("__newindex", Arity::at_least(3), |vm| {
        vm.set_global("newindex_called", LuaValue::Boolean(true));
        Ok(0)
    });
    let key = vm.create_string("__newindex");
    if let LuaValue::Table(m) = &mt {
        m.borrow_mut().set(key, flag_fn).unwrap();
    }
    let existing = vm.create_string("x");
    if let LuaValue::Table(table) = &t {
        table.borrow_mut().set(existing, LuaValue::Number(1.0)).unwrap();
        table.borrow_mut().set_metatable(mt);
    }
    vm.set_global("t", t.clone());
    vm.set_global("newindex_called", LuaValue::Boolean(false));

    // t.x = 2 (existing key: raw write); t.y = 3 (new key: __newindex)
    let proto = ProtoBuilder::new("test", 2)
        .env_upvalue()
        .constant(Constant::String("t".to_string()))
        .constant(Constant::String("x".to_string()))
        .constant(Constant::Number(2.0))
        .constant(Constant::String("y".to_string()))
        .constant(Constant::Number(3.0))
        .op(1, I::create_abc(Op::GetTabUp, 0, 0, k(0)))
        .op(1, I::create_abc(Op::SetTable, 0, k(1), k(2)))
        .op(2, I::create_abc(Op::SetTable, 0, k(3), k(4)))
        .op(3, I::create_abc(Op::Return, 0, 1, 0))
        .build();
    run(&mut vm, proto).expect("run");
    let x_key = vm.create_string("x");
    let y_key = vm.create_string("y");
    if let LuaValue::Table(table) = &t {
        assert_eq!(table.borrow().get(&x_key), LuaValue::Number(2.0));
        // __newindex intercepted the fresh key, so no raw y
        assert_eq!(table.borrow().get(&y_key), LuaValue::Nil);
    }
    assert_eq!(vm.get_global("newindex_called"), LuaValue::Boolean(true));
}
