// CallInfo - one activation record on the call stack

use crate::lua_value::LuaValue;

/// Call status flags
pub mod call_status {
    /// Lua function (has bytecode)
    pub const CIST_LUA: u32 = 1 << 0;
    /// Host function
    pub const CIST_HOST: u32 = 1 << 1;
    /// Frame was reused by a tail call
    pub const CIST_TAIL: u32 = 1 << 2;
    /// `__le` is being computed through a reversed `__lt`; the result
    /// must be inverted before acting on the jump
    pub const CIST_LEREV: u32 = 1 << 3;
    /// Frame is inside a debugger hook (condition/log evaluation)
    pub const CIST_HOOK: u32 = 1 << 4;
    /// A host call in this frame suspended; its poll closure is parked
    /// on the VM (frame state "Awaiting")
    pub const CIST_AWAIT: u32 = 1 << 5;
}

/// One function activation. `base` addresses register 0 of the callee;
/// `ret_base` is where Return copies results (the slot that held the
/// function value); `n_varargs` extra arguments sit between `func_idx`
/// and `base` for vararg callees.
#[derive(Clone)]
pub struct CallInfo {
    pub func: LuaValue,
    /// Absolute stack index of the function value
    pub func_idx: usize,
    /// Absolute stack index of register 0
    pub base: usize,
    /// Absolute stack index where results are copied on return
    pub ret_base: usize,
    /// First stack slot past this frame's registers
    pub top: usize,
    /// Next instruction to execute (saved across calls: the caller
    /// instruction index plus one)
    pub pc: u32,
    /// Results requested by the caller; -1 means all
    pub nresults: i32,
    /// Extra (variable) arguments available to VarArg
    pub n_varargs: usize,
    pub call_status: u32,
    /// Parked poll slot on the VM while CIST_AWAIT is set, else -1
    pub poll_slot: i32,
}

impl CallInfo {
    pub fn new_lua(func: LuaValue, func_idx: usize, base: usize, top: usize) -> Self {
        CallInfo {
            func,
            func_idx,
            base,
            ret_base: func_idx,
            top,
            pc: 0,
            nresults: -1,
            n_varargs: 0,
            call_status: call_status::CIST_LUA,
            poll_slot: -1,
        }
    }

    pub fn new_host(func: LuaValue, func_idx: usize, base: usize, top: usize) -> Self {
        CallInfo {
            func,
            func_idx,
            base,
            ret_base: func_idx,
            top,
            pc: 0,
            nresults: -1,
            n_varargs: 0,
            call_status: call_status::CIST_HOST,
            poll_slot: -1,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_host(&self) -> bool {
        self.call_status & call_status::CIST_HOST != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn set_tail(&mut self) {
        self.call_status |= call_status::CIST_TAIL;
    }

    #[inline(always)]
    pub fn is_awaiting(&self) -> bool {
        self.call_status & call_status::CIST_AWAIT != 0
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo {
            func: LuaValue::Nil,
            func_idx: 0,
            base: 0,
            ret_base: 0,
            top: 0,
            pc: 0,
            nresults: -1,
            n_varargs: 0,
            call_status: 0,
            poll_slot: -1,
        }
    }
}
