// Metamethod events and fallback dispatch.

use crate::lua_value::LuaValue;
use crate::lua_vm::{call_status, LuaError, LuaResult, LuaVM, OpCode};

/// Metamethod event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmKind {
    Index,
    NewIndex,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
    Call,
    ToString,
    Pairs,
}

impl TmKind {
    pub fn event_name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Len => "__len",
            TmKind::Concat => "__concat",
            TmKind::Eq => "__eq",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Call => "__call",
            TmKind::ToString => "__tostring",
            TmKind::Pairs => "__pairs",
        }
    }
}

/// Arithmetic opcode -> metamethod event
pub fn arith_event(op: OpCode) -> TmKind {
    match op {
        OpCode::Add => TmKind::Add,
        OpCode::Sub => TmKind::Sub,
        OpCode::Mul => TmKind::Mul,
        OpCode::Div => TmKind::Div,
        OpCode::Mod => TmKind::Mod,
        OpCode::Pow => TmKind::Pow,
        _ => TmKind::Unm,
    }
}

/// Call a metamethod with two operands and take its first result
pub fn call_tm_res(
    vm: &mut LuaVM,
    tm: LuaValue,
    a: LuaValue,
    b: LuaValue,
) -> LuaResult<LuaValue> {
    let results = vm.call_function(tm, &[a, b])?;
    Ok(results.into_iter().next().unwrap_or(LuaValue::Nil))
}

/// Metamethod fallback for a binary arithmetic opcode: look on the left
/// operand first, then the right.
pub fn arith_tm(
    vm: &mut LuaVM,
    event: TmKind,
    lhs: &LuaValue,
    rhs: &LuaValue,
) -> LuaResult<LuaValue> {
    let mut tm = vm.get_metamethod(lhs, event);
    if tm.is_nil() {
        tm = vm.get_metamethod(rhs, event);
    }
    if tm.is_nil() {
        // Blame the operand that is not coercible to a number
        let culprit = if lhs.coerce_number().is_none() { lhs } else { rhs };
        let msg = format!(
            "attempt to perform arithmetic on a {} value",
            culprit.type_name()
        );
        return Err(vm.error_kind(LuaError::Arith, msg));
    }
    call_tm_res(vm, tm, lhs.clone(), rhs.clone())
}

/// Equality with `__eq`: only consulted when both operands are tables or
/// both are userdata and raw equality fails.
pub fn value_eq(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.raw_equal(b) {
        return Ok(true);
    }
    let comparable = matches!(
        (a, b),
        (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::UserData(_), LuaValue::UserData(_))
    );
    if !comparable {
        return Ok(false);
    }
    let mut tm = vm.get_metamethod(a, TmKind::Eq);
    if tm.is_nil() {
        tm = vm.get_metamethod(b, TmKind::Eq);
    }
    if tm.is_nil() {
        return Ok(false);
    }
    Ok(call_tm_res(vm, tm, a.clone(), b.clone())?.is_truthy())
}

fn compare_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaError {
    let (t1, t2) = (a.type_name(), b.type_name());
    let msg = if t1 == t2 {
        format!("attempt to compare two {} values", t1)
    } else {
        format!("attempt to compare {} with {}", t1, t2)
    };
    vm.error_kind(LuaError::Type, msg)
}

/// `a < b`: numeric fast path, byte-ordinal string fast path, `__lt`
pub fn compare_lt(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    match (a, b) {
        (LuaValue::Number(x), LuaValue::Number(y)) => return Ok(x < y),
        (LuaValue::String(x), LuaValue::String(y)) => {
            return Ok(x.as_str().as_bytes() < y.as_str().as_bytes())
        }
        _ => {}
    }
    let mut tm = vm.get_metamethod(a, TmKind::Lt);
    if tm.is_nil() {
        tm = vm.get_metamethod(b, TmKind::Lt);
    }
    if tm.is_nil() {
        return Err(compare_error(vm, a, b));
    }
    Ok(call_tm_res(vm, tm, a.clone(), b.clone())?.is_truthy())
}

/// `a <= b`: tries `__le` first; without one, computes `not (b < a)`
/// through `__lt` with the frame's reversed-le flag set, inverting the
/// result before the caller acts on the jump.
pub fn compare_le(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    match (a, b) {
        (LuaValue::Number(x), LuaValue::Number(y)) => return Ok(x <= y),
        (LuaValue::String(x), LuaValue::String(y)) => {
            return Ok(x.as_str().as_bytes() <= y.as_str().as_bytes())
        }
        _ => {}
    }
    let mut tm = vm.get_metamethod(a, TmKind::Le);
    if tm.is_nil() {
        tm = vm.get_metamethod(b, TmKind::Le);
    }
    if !tm.is_nil() {
        return Ok(call_tm_res(vm, tm, a.clone(), b.clone())?.is_truthy());
    }
    // Reversed fallback: a <= b  ==  not (b < a)
    let mut tm_lt = vm.get_metamethod(a, TmKind::Lt);
    if tm_lt.is_nil() {
        tm_lt = vm.get_metamethod(b, TmKind::Lt);
    }
    if tm_lt.is_nil() {
        return Err(compare_error(vm, a, b));
    }
    if let Some(frame) = vm.thread_mut().current_frame_mut() {
        frame.call_status |= call_status::CIST_LEREV;
    }
    let reversed = call_tm_res(vm, tm_lt, b.clone(), a.clone());
    if let Some(frame) = vm.thread_mut().current_frame_mut() {
        frame.call_status &= !call_status::CIST_LEREV;
    }
    Ok(!reversed?.is_truthy())
}
