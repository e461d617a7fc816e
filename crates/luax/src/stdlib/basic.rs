// Basic library: the `_G` entries.

use crate::lib_registry::LibraryModule;
use crate::lua_value::{Arity, LuaValue};
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub fn create_basic_lib() -> LibraryModule {
    crate::lib_module!("_G", {
        "print" => lua_print,
        "type" => lua_type,
        "tostring" => lua_tostring,
        "tonumber" => lua_tonumber,
        "pairs" => lua_pairs,
        "ipairs" => lua_ipairs,
        "next" => lua_next,
        "select" => lua_select,
        "rawget" => lua_rawget,
        "rawset" => lua_rawset,
        "rawequal" => lua_rawequal,
        "rawlen" => lua_rawlen,
        "error" => lua_error,
        "assert" => lua_assert,
        "pcall" => lua_pcall,
        "xpcall" => lua_xpcall,
        "setmetatable" => lua_setmetatable,
        "getmetatable" => lua_getmetatable,
    })
}

fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    let mut pieces = Vec::with_capacity(args.len());
    for arg in &args {
        pieces.push(vm.tostring_value(arg)?);
    }
    vm.print_line(&pieces.join("\t"));
    Ok(0)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = match vm.get_arg(1) {
        Some(v) => v,
        None => return Err(vm.error("bad argument #1 to 'type' (value expected)".to_string())),
    };
    let name = vm.create_string(value.type_name());
    vm.push_value(name)?;
    Ok(1)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let text = vm.tostring_value(&value)?;
    let result = vm.create_string(&text);
    vm.push_value(result)?;
    Ok(1)
}

fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let base = vm.get_arg(2).and_then(|b| b.as_number());
    let result = match base {
        None => match value.coerce_number() {
            Some(n) => LuaValue::Number(n),
            None => LuaValue::Nil,
        },
        Some(base) => {
            let base = base as u32;
            if !(2..=36).contains(&base) {
                return Err(vm.error("bad argument #2 to 'tonumber' (base out of range)".to_string()));
            }
            match value.as_str() {
                Some(s) => match i64::from_str_radix(s.trim(), base) {
                    Ok(n) => LuaValue::Number(n as f64),
                    Err(_) => LuaValue::Nil,
                },
                None => LuaValue::Nil,
            }
        }
    };
    vm.push_value(result)?;
    Ok(1)
}

fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let table = match vm.get_arg(1) {
        Some(LuaValue::Table(t)) => t,
        other => {
            let v = other.unwrap_or(LuaValue::Nil);
            return Err(vm.error(format!(
                "bad argument #1 to 'next' (table expected, got {})",
                v.type_name()
            )));
        }
    };
    let key = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    let next = table.borrow().next(&key);
    match next {
        Some((k, v)) => {
            vm.push_value(k)?;
            vm.push_value(v)?;
            Ok(2)
        }
        None => {
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let mm = vm.get_metamethod(&value, TmKind::Pairs);
    if !mm.is_nil() {
        let results = vm.call_function(mm, &[value])?;
        let mut count = 0;
        for v in results.into_iter().take(3) {
            vm.push_value(v)?;
            count += 1;
        }
        return Ok(count);
    }
    if !matches!(value, LuaValue::Table(_)) {
        return Err(vm.error(format!(
            "bad argument #1 to 'pairs' (table expected, got {})",
            value.type_name()
        )));
    }
    let iter = vm.make_host_fn("next", Arity::at_least(1), lua_next);
    vm.push_value(iter)?;
    vm.push_value(value)?;
    vm.push_value(LuaValue::Nil)?;
    Ok(3)
}

fn ipairs_aux(vm: &mut LuaVM) -> LuaResult<usize> {
    let table = match vm.get_arg(1) {
        Some(LuaValue::Table(t)) => t,
        _ => return Err(vm.error("bad argument #1 to 'ipairs' iterator".to_string())),
    };
    let i = vm.get_arg(2).and_then(|v| v.as_number()).unwrap_or(0.0) as i64 + 1;
    let value = table.borrow().get_int(i);
    if value.is_nil() {
        vm.push_value(LuaValue::Nil)?;
        Ok(1)
    } else {
        vm.push_value(LuaValue::Number(i as f64))?;
        vm.push_value(value)?;
        Ok(2)
    }
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    if !matches!(value, LuaValue::Table(_)) {
        return Err(vm.error(format!(
            "bad argument #1 to 'ipairs' (table expected, got {})",
            value.type_name()
        )));
    }
    let iter = vm.make_host_fn("ipairs_aux", Arity::at_least(2), ipairs_aux);
    vm.push_value(iter)?;
    vm.push_value(value)?;
    vm.push_value(LuaValue::Number(0.0))?;
    Ok(3)
}

fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    let selector = args.first().cloned().unwrap_or(LuaValue::Nil);
    if selector.as_str() == Some("#") {
        vm.push_value(LuaValue::Number((args.len() as f64) - 1.0))?;
        return Ok(1);
    }
    let n = match selector.as_number() {
        Some(n) if n != 0.0 => n as i64,
        _ => {
            return Err(vm.error("bad argument #1 to 'select' (number expected)".to_string()))
        }
    };
    let rest = &args[1..];
    let start = if n < 0 {
        let back = (-n) as usize;
        if back > rest.len() {
            return Err(vm.error("bad argument #1 to 'select' (index out of range)".to_string()));
        }
        rest.len() - back
    } else {
        (n as usize - 1).min(rest.len())
    };
    let mut count = 0;
    for v in rest[start..].iter().cloned() {
        vm.push_value(v)?;
        count += 1;
    }
    Ok(count)
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let table = match vm.get_arg(1) {
        Some(LuaValue::Table(t)) => t,
        _ => return Err(vm.error("bad argument #1 to 'rawget' (table expected)".to_string())),
    };
    let key = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    let value = table.borrow().get(&key);
    vm.push_value(value)?;
    Ok(1)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let table_value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let table = match &table_value {
        LuaValue::Table(t) => t.clone(),
        _ => return Err(vm.error("bad argument #1 to 'rawset' (table expected)".to_string())),
    };
    let key = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    let value = vm.get_arg(3).unwrap_or(LuaValue::Nil);
    if let Err(e) = table.borrow_mut().set(key, value) {
        let msg = match e {
            crate::lua_value::lua_table::TableKeyError::Nil => "table index is nil",
            crate::lua_value::lua_table::TableKeyError::NaN => "table index is NaN",
        };
        return Err(vm.error_kind(LuaError::Index, msg.to_string()));
    }
    vm.push_value(table_value)?;
    Ok(1)
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let b = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    vm.push_value(LuaValue::Boolean(a.raw_equal(&b)))?;
    Ok(1)
}

fn lua_rawlen(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let len = match &value {
        LuaValue::Table(t) => t.borrow().length() as f64,
        LuaValue::String(s) => s.len() as f64,
        _ => {
            return Err(vm.error("table or string expected".to_string()));
        }
    };
    vm.push_value(LuaValue::Number(len))?;
    Ok(1)
}

fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    Err(vm.error_with_value(value))
}

fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    match args.first() {
        Some(v) if v.is_truthy() => {
            let count = args.len();
            for v in args {
                vm.push_value(v)?;
            }
            Ok(count)
        }
        _ => match args.get(1) {
            Some(msg) => Err(vm.error_with_value(msg.clone())),
            None => Err(vm.error("assertion failed!".to_string())),
        },
    }
}

fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    let func = match args.first() {
        Some(f) => f.clone(),
        None => return Err(vm.error("bad argument #1 to 'pcall' (value expected)".to_string())),
    };
    let (ok, results) = vm.pcall_values(func, &args[1..])?;
    vm.push_value(LuaValue::Boolean(ok))?;
    let count = results.len();
    for v in results {
        vm.push_value(v)?;
    }
    Ok(1 + count)
}

fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.get_args();
    let func = match args.first() {
        Some(f) => f.clone(),
        None => return Err(vm.error("bad argument #1 to 'xpcall' (value expected)".to_string())),
    };
    let handler = match args.get(1) {
        Some(h) => h.clone(),
        None => return Err(vm.error("bad argument #2 to 'xpcall' (value expected)".to_string())),
    };
    let (ok, results) = vm.xpcall_values(func, handler, &args[2..])?;
    vm.push_value(LuaValue::Boolean(ok))?;
    let count = results.len();
    for v in results {
        vm.push_value(v)?;
    }
    Ok(1 + count)
}

fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let table_value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let table = match &table_value {
        LuaValue::Table(t) => t.clone(),
        _ => {
            return Err(vm.error(format!(
                "bad argument #1 to 'setmetatable' (table expected, got {})",
                table_value.type_name()
            )))
        }
    };
    let mt = vm.get_arg(2).unwrap_or(LuaValue::Nil);
    if !matches!(mt, LuaValue::Nil | LuaValue::Table(_)) {
        return Err(vm.error("bad argument #2 to 'setmetatable' (nil or table expected)".to_string()));
    }
    // A metatable carrying __metatable is protected
    let current = table.borrow().get_metatable();
    if let LuaValue::Table(cur) = &current {
        let key = vm.create_string("__metatable");
        if !cur.borrow().get(&key).is_nil() {
            return Err(vm.error("cannot change a protected metatable".to_string()));
        }
    }
    table.borrow_mut().set_metatable(mt);
    vm.push_value(table_value)?;
    Ok(1)
}

fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let value = vm.get_arg(1).unwrap_or(LuaValue::Nil);
    let mt = vm.get_metatable(&value);
    let result = if let LuaValue::Table(m) = &mt {
        let key = vm.create_string("__metatable");
        let protected = m.borrow().get(&key);
        if protected.is_nil() { mt.clone() } else { protected }
    } else {
        LuaValue::Nil
    };
    vm.push_value(result)?;
    Ok(1)
}
