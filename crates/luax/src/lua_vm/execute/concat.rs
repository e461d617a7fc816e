// CONCAT: fold R(B)..R(C) right-to-left, strings/numbers directly,
// anything else through `__concat`.

use super::metamethod::{call_tm_res, TmKind};
use crate::lua_value::{number_to_string, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM};

fn concat_segment(value: &LuaValue) -> Option<String> {
    match value {
        LuaValue::String(s) => Some(s.as_str().to_string()),
        LuaValue::Number(n) => Some(number_to_string(*n)),
        _ => None,
    }
}

fn concat_pair(vm: &mut LuaVM, left: LuaValue, right: LuaValue) -> LuaResult<LuaValue> {
    if let (Some(l), Some(r)) = (concat_segment(&left), concat_segment(&right)) {
        let mut s = l;
        s.push_str(&r);
        return Ok(vm.create_string(&s));
    }
    let mut tm = vm.get_metamethod(&left, TmKind::Concat);
    if tm.is_nil() {
        tm = vm.get_metamethod(&right, TmKind::Concat);
    }
    if tm.is_nil() {
        let culprit = if concat_segment(&left).is_none() { left } else { right };
        return Err(vm.type_error("concatenate", &culprit));
    }
    call_tm_res(vm, tm, left, right)
}

pub fn handle_concat(vm: &mut LuaVM, base: usize, a: u32, b: u32, c: u32) -> LuaResult<()> {
    let mut acc = vm.stack_get(base + c as usize);
    let mut i = c as i64 - 1;
    while i >= b as i64 {
        let left = vm.stack_get(base + i as usize);
        acc = concat_pair(vm, left, acc)?;
        i -= 1;
    }
    vm.stack_set(base + a as usize, acc)
}
