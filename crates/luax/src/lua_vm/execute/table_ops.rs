// Indexing with metamethod chains. Both chains are bounded so a cyclic
// `__index` graph surfaces as an error instead of a hang.

use super::metamethod::TmKind;
use crate::lua_value::lua_table::TableKeyError;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

fn key_error(vm: &mut LuaVM, e: TableKeyError) -> LuaError {
    let msg = match e {
        TableKeyError::Nil => "table index is nil",
        TableKeyError::NaN => "table index is NaN",
    };
    vm.error_kind(LuaError::Index, msg.to_string())
}

/// `obj[key]` with the `__index` chain: raw probe first, then follow
/// metamethods through tables or invoke a handler function.
pub fn index_value(vm: &mut LuaVM, obj: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
    let mut current = obj.clone();
    for _ in 0..vm.limits.max_meta_chain {
        if let LuaValue::Table(t) = &current {
            let raw = t.borrow().get(key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let handler = vm.get_metamethod(&current, TmKind::Index);
            if handler.is_nil() {
                return Ok(LuaValue::Nil);
            }
            if handler.is_function() {
                let results = vm.call_function(handler, &[current.clone(), key.clone()])?;
                return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
            }
            current = handler;
        } else {
            let handler = vm.get_metamethod(&current, TmKind::Index);
            if handler.is_nil() {
                return Err(vm.type_error("index", &current));
            }
            if handler.is_function() {
                let results = vm.call_function(handler, &[current.clone(), key.clone()])?;
                return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
            }
            current = handler;
        }
    }
    Err(vm.error_kind(
        LuaError::Index,
        "'__index' chain too long; possible loop".to_string(),
    ))
}

/// `obj[key] = value` with the `__newindex` chain. A raw hit on an
/// existing non-nil key bypasses `__newindex`.
pub fn set_index_value(
    vm: &mut LuaVM,
    obj: &LuaValue,
    key: &LuaValue,
    value: LuaValue,
) -> LuaResult<()> {
    let mut current = obj.clone();
    for _ in 0..vm.limits.max_meta_chain {
        if let LuaValue::Table(t) = &current {
            let existing = t.borrow().get(key);
            if !existing.is_nil() {
                if let Err(e) = t.borrow_mut().set(key.clone(), value) {
                    return Err(key_error(vm, e));
                }
                return Ok(());
            }
            let handler = vm.get_metamethod(&current, TmKind::NewIndex);
            if handler.is_nil() {
                if let Err(e) = t.borrow_mut().set(key.clone(), value) {
                    return Err(key_error(vm, e));
                }
                return Ok(());
            }
            if handler.is_function() {
                vm.call_function(handler, &[current.clone(), key.clone(), value])?;
                return Ok(());
            }
            current = handler;
        } else {
            let handler = vm.get_metamethod(&current, TmKind::NewIndex);
            if handler.is_nil() {
                return Err(vm.type_error("index", &current));
            }
            if handler.is_function() {
                vm.call_function(handler, &[current.clone(), key.clone(), value])?;
                return Ok(());
            }
            current = handler;
        }
    }
    Err(vm.error_kind(
        LuaError::Index,
        "'__newindex' chain too long; possible loop".to_string(),
    ))
}
