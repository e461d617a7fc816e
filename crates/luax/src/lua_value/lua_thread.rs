// Lua thread (main thread or coroutine): owns a value stack, a call
// stack, and the open-upvalue bookkeeping for that stack.

use super::{LuaUpvalue, LuaValue, ThreadId, UpvalueRef};
use crate::lua_vm::CallInfo;
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Coroutine status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created or yielded (can be resumed)
    Suspended,
    /// Currently executing
    Running,
    /// Resumed another coroutine (not directly resumable)
    Normal,
    /// Finished or encountered an error
    Dead,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

pub struct LuaThread {
    pub id: ThreadId,
    pub status: ThreadStatus,

    /// Data stack: registers, temporaries, function arguments.
    /// Physical storage only grows; `stack_top` is the logical top.
    pub stack: Vec<LuaValue>,
    pub stack_top: usize,

    /// Call stack. Slots above `call_depth` are reusable garbage,
    /// never shrunk (frames are recycled on push).
    pub call_stack: Vec<CallInfo>,
    pub call_depth: usize,

    /// Open upvalues pointing into this thread's stack.
    /// Map for O(1) lookup by stack index; list kept sorted by stack
    /// index descending so closing scans a prefix.
    open_upvalues_map: AHashMap<usize, UpvalueRef>,
    open_upvalues_list: Vec<UpvalueRef>,

    /// The body function of a coroutine before its first resume
    pub body: Option<LuaValue>,
    /// Values carried out by the pending yield
    pub yield_values: Vec<LuaValue>,
}

impl LuaThread {
    const BASIC_STACK_SIZE: usize = 40;

    pub fn new(id: ThreadId) -> Self {
        LuaThread {
            id,
            status: ThreadStatus::Suspended,
            stack: Vec::with_capacity(Self::BASIC_STACK_SIZE),
            stack_top: 0,
            call_stack: Vec::new(),
            call_depth: 0,
            open_upvalues_map: AHashMap::new(),
            open_upvalues_list: Vec::new(),
            body: None,
            yield_values: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn current_frame(&self) -> Option<&CallInfo> {
        if self.call_depth > 0 {
            self.call_stack.get(self.call_depth - 1)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn current_frame_mut(&mut self) -> Option<&mut CallInfo> {
        if self.call_depth > 0 {
            self.call_stack.get_mut(self.call_depth - 1)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn stack_get(&self, index: usize) -> LuaValue {
        self.stack.get(index).cloned().unwrap_or(LuaValue::Nil)
    }

    /// Write at an absolute index, growing the physical stack as needed.
    /// The caller is responsible for the max-size check (see
    /// `LuaVM::stack_set`).
    pub fn stack_set(&mut self, index: usize, value: LuaValue) {
        if index >= self.stack.len() {
            self.stack.resize(index + 1, LuaValue::Nil);
        }
        self.stack[index] = value;
        if self.stack_top <= index {
            self.stack_top = index + 1;
        }
    }

    pub fn ensure_stack(&mut self, size: usize) {
        if self.stack.len() < size {
            self.stack.resize(size, LuaValue::Nil);
        }
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: usize) {
        self.ensure_stack(top);
        self.stack_top = top;
    }

    pub fn push_value(&mut self, value: LuaValue) {
        let top = self.stack_top;
        self.stack_set(top, value);
    }

    /// Existing open upvalue for a stack slot, if any
    pub fn find_upvalue(&self, stack_index: usize) -> Option<UpvalueRef> {
        self.open_upvalues_map.get(&stack_index).cloned()
    }

    /// Find or create the open upvalue for a stack slot. Every open
    /// upvalue is uniquely identified by (thread, register index).
    pub fn get_or_add_upvalue(&mut self, stack_index: usize) -> UpvalueRef {
        if let Some(existing) = self.open_upvalues_map.get(&stack_index) {
            return Rc::clone(existing);
        }
        let upval: UpvalueRef = Rc::new(RefCell::new(LuaUpvalue::Open {
            thread: self.id,
            index: stack_index,
        }));
        self.open_upvalues_map.insert(stack_index, Rc::clone(&upval));
        let pos = self
            .open_upvalues_list
            .iter()
            .position(|u| match u.borrow().stack_index() {
                Some(idx) => idx < stack_index,
                None => true,
            })
            .unwrap_or(self.open_upvalues_list.len());
        self.open_upvalues_list.insert(pos, upval.clone());
        upval
    }

    /// Close every open upvalue at register >= `level`, copying the
    /// captured stack value into the cell. Runs on Return, on
    /// Jmp-with-close, and when a frame unwinds due to error.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut count = 0;
        while count < self.open_upvalues_list.len() {
            let keep_scanning = match self.open_upvalues_list[count].borrow().stack_index() {
                Some(idx) => idx >= level,
                None => true, // stale closed entry, drop it
            };
            if !keep_scanning {
                break;
            }
            count += 1;
        }
        if count == 0 {
            return;
        }
        for upval in self.open_upvalues_list.drain(0..count) {
            let stack_index = upval.borrow().stack_index();
            if let Some(idx) = stack_index {
                self.open_upvalues_map.remove(&idx);
                let value = self.stack.get(idx).cloned().unwrap_or(LuaValue::Nil);
                upval.borrow_mut().close(value);
            }
        }
    }

    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues_list.len()
    }
}
