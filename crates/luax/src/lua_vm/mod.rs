// LuaVM - global execution state: threads, globals, string pool, limits,
// the debugger hub, and the host-suspension machinery. One VM is owned by
// exactly one OS thread; coroutines multiplex on it cooperatively.

pub mod call_info;
pub mod execute;
mod lua_error;
mod lua_limits;
pub mod opcode;

pub use call_info::{call_status, CallInfo};
pub use lua_error::{LuaError, LuaFullError, LuaResult};
pub use lua_limits::VmLimits;
pub use opcode::{Instruction, OpCode, OpMode};

use crate::debug::DebugHub;
use crate::lua_value::{
    Arity, Constant, HostFn, HostFunction, LuaClosure, LuaThread, LuaUpvalue, LuaValue,
    Prototype, StringPool, ThreadId, ThreadStatus, UpvalueRef,
};
use crate::lua_vm::execute::metamethod::TmKind;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A parked host suspension: polled by the dispatch loop until it
/// produces a result count.
pub type HostPoll = Box<dyn FnMut(&mut LuaVM) -> LuaResult<Option<usize>>>;

/// Where `print`-style output goes (the debug host redirects it into
/// `output` events because stdout is the wire)
pub type OutputSink = Box<dyn FnMut(&str)>;

pub struct LuaVM {
    pub(crate) threads: Vec<LuaThread>,
    pub(crate) current: ThreadId,
    globals: LuaValue,
    string_pool: StringPool,
    pub limits: VmLimits,

    /// Error message side channel (kept out of `LuaError` so Results
    /// stay one byte)
    pub(crate) error_msg: String,
    /// Non-string value raised through `error()`
    pub(crate) error_value: Option<LuaValue>,

    /// Nested-call boundaries since the last resume. Yield and host
    /// suspension are rejected while this is non-zero: the Rust frames
    /// of a nested dispatch cannot be captured.
    pub(crate) c_boundary: usize,

    /// Parked host polls, indexed by CallInfo::poll_slot
    pending_polls: Vec<Option<HostPoll>>,

    debug: Option<Arc<DebugHub>>,
    cancel: Arc<AtomicBool>,
    print_sink: Option<OutputSink>,
}

impl LuaVM {
    pub fn new() -> Self {
        Self::with_limits(VmLimits::default())
    }

    pub fn with_limits(limits: VmLimits) -> Self {
        let mut main = LuaThread::new(ThreadId::MAIN);
        main.status = ThreadStatus::Running;
        LuaVM {
            threads: vec![main],
            current: ThreadId::MAIN,
            globals: LuaValue::new_table(),
            string_pool: StringPool::new(),
            limits,
            error_msg: String::new(),
            error_value: None,
            c_boundary: 0,
            pending_polls: Vec::new(),
            debug: None,
            cancel: Arc::new(AtomicBool::new(false)),
            print_sink: None,
        }
    }

    // ===== Debugger / cancellation wiring =====

    pub fn attach_debugger(&mut self, hub: Arc<DebugHub>) {
        self.debug = Some(hub);
    }

    #[inline(always)]
    pub fn debug_hub(&self) -> Option<&Arc<DebugHub>> {
        self.debug.as_ref()
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[inline(always)]
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn set_print_sink(&mut self, sink: OutputSink) {
        self.print_sink = Some(sink);
    }

    pub fn print_line(&mut self, text: &str) {
        match &mut self.print_sink {
            Some(sink) => sink(text),
            None => println!("{}", text),
        }
    }

    // ===== Threads =====

    #[inline(always)]
    pub fn thread(&self) -> &LuaThread {
        &self.threads[self.current.0]
    }

    #[inline(always)]
    pub fn thread_mut(&mut self) -> &mut LuaThread {
        let idx = self.current.0;
        &mut self.threads[idx]
    }

    #[inline(always)]
    pub fn thread_by_id(&self, id: ThreadId) -> &LuaThread {
        &self.threads[id.0]
    }

    #[inline(always)]
    pub fn thread_by_id_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        &mut self.threads[id.0]
    }

    #[inline(always)]
    pub fn current_thread_id(&self) -> ThreadId {
        self.current
    }

    /// Allocate a coroutine with its own stacks, suspended on `body`
    pub fn create_thread(&mut self, body: LuaValue) -> LuaValue {
        let id = ThreadId(self.threads.len());
        let mut thread = LuaThread::new(id);
        thread.body = Some(body);
        self.threads.push(thread);
        LuaValue::Thread(id)
    }

    // ===== Values =====

    pub fn create_string(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.string_pool.intern(s))
    }

    pub fn globals(&self) -> LuaValue {
        self.globals.clone()
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.create_string(name);
        match &self.globals {
            LuaValue::Table(t) => t.borrow().get(&key),
            _ => LuaValue::Nil,
        }
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.create_string(name);
        if let LuaValue::Table(t) = &self.globals {
            // Globals table keys are never nil/NaN
            let _ = t.borrow_mut().set(key, value);
        }
    }

    pub fn constant_to_value(&mut self, k: &Constant) -> LuaValue {
        match k {
            Constant::Nil => LuaValue::Nil,
            Constant::Boolean(b) => LuaValue::Boolean(*b),
            Constant::Number(n) => LuaValue::Number(*n),
            Constant::String(s) => self.create_string(s),
        }
    }

    /// Build a closure over `proto`, materializing its constant table and
    /// announcing the chunk to the debugger overlay.
    pub fn create_closure(
        &mut self,
        proto: Arc<Prototype>,
        upvalues: Vec<UpvalueRef>,
    ) -> LuaValue {
        let constants = proto
            .constants
            .iter()
            .map(|k| self.constant_to_value(k))
            .collect();
        if let Some(hub) = self.debug.clone() {
            hub.register_prototype(&proto);
        }
        LuaValue::Function(Rc::new(LuaClosure {
            proto,
            upvalues,
            constants,
        }))
    }

    /// Wrap a root prototype as the main closure. If the prototype
    /// declares upvalues, the first is bound to the globals table (the
    /// `_ENV` convention of the external compiler).
    pub fn load_main(&mut self, proto: Arc<Prototype>) -> LuaValue {
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for (i, _) in proto.upvalues.iter().enumerate() {
            let cell = if i == 0 {
                LuaUpvalue::Closed(self.globals())
            } else {
                LuaUpvalue::Closed(LuaValue::Nil)
            };
            upvalues.push(Rc::new(RefCell::new(cell)));
        }
        self.create_closure(proto, upvalues)
    }

    /// Register a host function (name, arity descriptor, callable) and
    /// publish it as a global.
    pub fn register_host_fn(
        &mut self,
        name: &str,
        arity: Arity,
        func: HostFn,
    ) -> LuaValue {
        let value = self.make_host_fn(name, arity, func);
        self.set_global(name, value.clone());
        value
    }

    /// Create a host-function value without publishing it
    pub fn make_host_fn(&mut self, name: &str, arity: Arity, func: HostFn) -> LuaValue {
        LuaValue::HostFunction(Rc::new(HostFunction {
            name: SmolStr::new(name),
            arity,
            func,
            bound: None,
        }))
    }

    /// Host function with a bound payload (a single C-closure upvalue)
    pub fn make_bound_host_fn(
        &mut self,
        name: &str,
        arity: Arity,
        func: HostFn,
        bound: LuaValue,
    ) -> LuaValue {
        LuaValue::HostFunction(Rc::new(HostFunction {
            name: SmolStr::new(name),
            arity,
            func,
            bound: Some(bound),
        }))
    }

    /// The bound payload of the currently executing host function
    pub fn current_bound(&self) -> LuaValue {
        self.thread()
            .current_frame()
            .and_then(|ci| ci.func.as_host_fn())
            .and_then(|h| h.bound.clone())
            .unwrap_or(LuaValue::Nil)
    }

    // ===== Upvalues =====

    pub fn upvalue_get(&self, upval: &UpvalueRef) -> LuaValue {
        match &*upval.borrow() {
            LuaUpvalue::Open { thread, index } => self.threads[thread.0].stack_get(*index),
            LuaUpvalue::Closed(v) => v.clone(),
        }
    }

    pub fn upvalue_set(&mut self, upval: &UpvalueRef, value: LuaValue) {
        let target = match &*upval.borrow() {
            LuaUpvalue::Open { thread, index } => Some((*thread, *index)),
            LuaUpvalue::Closed(_) => None,
        };
        match target {
            Some((thread, index)) => self.threads[thread.0].stack_set(index, value),
            None => *upval.borrow_mut() = LuaUpvalue::Closed(value),
        }
    }

    // ===== Stack access (current thread) =====

    #[inline(always)]
    pub fn stack_get(&self, index: usize) -> LuaValue {
        self.thread().stack_get(index)
    }

    pub fn stack_set(&mut self, index: usize, value: LuaValue) -> LuaResult<()> {
        if index >= self.limits.max_stack_size {
            return Err(self.error_kind(
                LuaError::StackOverflow,
                format!("stack overflow (register {})", index),
            ));
        }
        self.thread_mut().stack_set(index, value);
        Ok(())
    }

    /// Push onto the current thread's logical top
    pub fn push_value(&mut self, value: LuaValue) -> LuaResult<()> {
        let top = self.thread().stack_top;
        if top >= self.limits.max_stack_size {
            return Err(self.error_kind(
                LuaError::StackOverflow,
                "stack overflow".to_string(),
            ));
        }
        self.thread_mut().push_value(value);
        Ok(())
    }

    // ===== Host-function argument access =====

    /// Argument `index` (1-based) of the current host call
    pub fn get_arg(&self, index: usize) -> Option<LuaValue> {
        let frame = self.thread().current_frame()?;
        if index == 0 {
            return None;
        }
        let slot = frame.base + index - 1;
        if slot < frame.top {
            Some(self.thread().stack_get(slot))
        } else {
            None
        }
    }

    pub fn arg_count(&self) -> usize {
        match self.thread().current_frame() {
            Some(frame) if frame.top > frame.base => frame.top - frame.base,
            _ => 0,
        }
    }

    pub fn get_args(&self) -> Vec<LuaValue> {
        let count = self.arg_count();
        let mut args = Vec::with_capacity(count);
        for i in 1..=count {
            args.push(self.get_arg(i).unwrap_or(LuaValue::Nil));
        }
        args
    }

    // ===== Frame management =====

    /// Push a frame for a Lua closure whose function value sits at
    /// `func_idx` with `nargs` arguments above it. Performs the Lua 5.2
    /// vararg rotation: for vararg callees the fixed parameters move
    /// above the supplied arguments and `base` lands there.
    pub(crate) fn push_frame_lua(
        &mut self,
        func: LuaValue,
        closure: &Rc<LuaClosure>,
        func_idx: usize,
        nargs: usize,
    ) -> LuaResult<()> {
        if self.thread().call_depth >= self.limits.max_call_depth {
            return Err(self.error_kind(
                LuaError::StackOverflow,
                format!("stack overflow (call depth {})", self.thread().call_depth),
            ));
        }
        let proto = &closure.proto;
        let nparams = proto.param_count;
        let (base, n_varargs) = if proto.is_vararg && nargs > nparams {
            // Rotate: fixed params move above the arguments, extras stay
            // between the function slot and the new base
            let base = func_idx + 1 + nargs;
            let needed = base + proto.max_stack_size;
            if needed >= self.limits.max_stack_size {
                return Err(self.error_kind(
                    LuaError::StackOverflow,
                    "stack overflow".to_string(),
                ));
            }
            let thread = self.thread_mut();
            thread.ensure_stack(needed);
            for i in 0..nparams {
                thread.stack[base + i] = thread.stack[func_idx + 1 + i].clone();
                thread.stack[func_idx + 1 + i] = LuaValue::Nil;
            }
            (base, nargs - nparams)
        } else {
            let base = func_idx + 1;
            let needed = base + proto.max_stack_size;
            if needed >= self.limits.max_stack_size {
                return Err(self.error_kind(
                    LuaError::StackOverflow,
                    "stack overflow".to_string(),
                ));
            }
            self.thread_mut().ensure_stack(needed);
            (base, 0)
        };
        // Missing parameters read as nil
        {
            let thread = self.thread_mut();
            for i in nargs.min(nparams)..nparams {
                thread.stack[base + i] = LuaValue::Nil;
            }
        }
        let top = base + proto.max_stack_size;
        let mut ci = CallInfo::new_lua(func, func_idx, base, top);
        ci.n_varargs = n_varargs;
        self.push_call_info(ci);
        self.thread_mut().set_top(top);
        Ok(())
    }

    pub(crate) fn push_frame_host(
        &mut self,
        func: LuaValue,
        func_idx: usize,
        nargs: usize,
    ) -> LuaResult<()> {
        if self.thread().call_depth >= self.limits.max_call_depth {
            return Err(self.error_kind(
                LuaError::StackOverflow,
                format!("stack overflow (call depth {})", self.thread().call_depth),
            ));
        }
        let base = func_idx + 1;
        let top = base + nargs;
        self.thread_mut().ensure_stack(top);
        let ci = CallInfo::new_host(func, func_idx, base, top);
        self.push_call_info(ci);
        self.thread_mut().set_top(top);
        Ok(())
    }

    fn push_call_info(&mut self, ci: CallInfo) {
        let thread = self.thread_mut();
        let depth = thread.call_depth;
        if depth < thread.call_stack.len() {
            thread.call_stack[depth] = ci;
        } else {
            thread.call_stack.push(ci);
        }
        thread.call_depth += 1;
    }

    pub(crate) fn pop_frame(&mut self) {
        let thread = self.thread_mut();
        if thread.call_depth > 0 {
            thread.call_depth -= 1;
        }
    }

    // ===== Errors =====

    /// Source location of the current instruction ("chunk:line: ").
    /// Host frames have no lines, so the innermost Lua frame supplies
    /// the position (the call site, for errors raised by host code).
    fn current_location(&self) -> String {
        let thread = self.thread();
        for ci in thread.call_stack[..thread.call_depth].iter().rev() {
            if !ci.is_lua() {
                continue;
            }
            let Some(closure) = ci.func.as_closure() else {
                continue;
            };
            let proto = &closure.proto;
            let source = proto.chunk_name.as_str();
            let display = source.strip_prefix('@').unwrap_or(source);
            let pc = if ci.pc > 0 { ci.pc - 1 } else { 0 };
            let line = proto.line_of(pc as usize);
            return if line > 0 {
                format!("{}:{}: ", display, line)
            } else {
                format!("{}: ", display)
            };
        }
        String::new()
    }

    /// Record a runtime error message (with source location) and return
    /// the error kind to raise.
    pub fn error_kind(&mut self, kind: LuaError, msg: String) -> LuaError {
        self.error_msg = format!("{}{}", self.current_location(), msg);
        self.error_value = None;
        kind
    }

    pub fn error(&mut self, msg: String) -> LuaError {
        self.error_kind(LuaError::Runtime, msg)
    }

    /// Raise an arbitrary error value (the `error()` builtin)
    pub fn error_with_value(&mut self, value: LuaValue) -> LuaError {
        match &value {
            LuaValue::String(s) => {
                let msg = s.as_str().to_string();
                let kind = self.error_kind(LuaError::Runtime, msg);
                let located = self.error_msg.clone();
                self.error_value = Some(self.create_string(&located));
                kind
            }
            _ => {
                self.error_msg.clear();
                self.error_value = Some(value);
                LuaError::Runtime
            }
        }
    }

    pub fn type_error(&mut self, op: &str, value: &LuaValue) -> LuaError {
        let msg = format!("attempt to {} a {} value", op, value.type_name());
        self.error_kind(LuaError::Type, msg)
    }

    pub fn get_error_msg(&mut self, e: LuaError) -> String {
        match e {
            LuaError::Cancelled => "execution cancelled".to_string(),
            _ => std::mem::take(&mut self.error_msg),
        }
    }

    /// The value a protected call reports: the raised error value if one
    /// was set, otherwise the message as a string.
    pub fn take_error_value(&mut self, e: LuaError) -> LuaValue {
        if let Some(v) = self.error_value.take() {
            return v;
        }
        let msg = self.get_error_msg(e);
        self.create_string(&msg)
    }

    pub fn into_full_error(&mut self, e: LuaError) -> LuaFullError {
        LuaFullError {
            kind: e,
            message: std::mem::take(&mut self.error_msg),
        }
    }

    /// Lua-style stack traceback of the current thread. Tail frames are
    /// marked so elided callers are visible.
    pub fn generate_traceback(&self) -> String {
        let mut result = String::from("stack traceback:\n");
        let thread = self.thread();
        let frames = &thread.call_stack[..thread.call_depth];
        for (level, ci) in frames.iter().rev().enumerate() {
            if level >= 20 {
                result.push_str("\t...\n");
                break;
            }
            if ci.is_lua() {
                if let Some(closure) = ci.func.as_closure() {
                    let proto = &closure.proto;
                    let source = proto.chunk_name.as_str();
                    let display = source.strip_prefix('@').unwrap_or(source);
                    let pc = if ci.pc > 0 { ci.pc - 1 } else { 0 };
                    let line = proto.line_of(pc as usize);
                    let what = if proto.line_defined == 0 {
                        "main chunk".to_string()
                    } else {
                        format!("function <{}:{}>", display, proto.line_defined)
                    };
                    if line > 0 {
                        result.push_str(&format!("\t{}:{}: in {}\n", display, line, what));
                    } else {
                        result.push_str(&format!("\t{}: in {}\n", display, what));
                    }
                    if ci.is_tail() {
                        result.push_str("\t(...tail calls...)\n");
                    }
                    continue;
                }
            }
            if ci.is_host() {
                let name = ci
                    .func
                    .as_host_fn()
                    .map(|f| f.name.to_string())
                    .unwrap_or_default();
                if name.is_empty() {
                    result.push_str("\t[host]: in ?\n");
                } else {
                    result.push_str(&format!("\t[host]: in function '{}'\n", name));
                }
            }
        }
        result
    }

    // ===== Metatables =====

    pub fn get_metatable(&self, value: &LuaValue) -> LuaValue {
        match value {
            LuaValue::Table(t) => t.borrow().get_metatable(),
            LuaValue::UserData(u) => u.metatable.borrow().clone(),
            _ => LuaValue::Nil,
        }
    }

    /// Metamethod lookup on a value's metatable
    pub fn get_metamethod(&mut self, value: &LuaValue, tm: TmKind) -> LuaValue {
        let mt = self.get_metatable(value);
        match mt {
            LuaValue::Table(t) => {
                let key = self.create_string(tm.event_name());
                t.borrow().get(&key)
            }
            _ => LuaValue::Nil,
        }
    }

    // ===== Calls =====

    /// Call any callable with `args`, returning its results. This is the
    /// nested entry used by metamethods, iterators and library code; the
    /// flat Call/TailCall opcodes go through the dispatch loop instead.
    pub fn call_function(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<Vec<LuaValue>> {
        let entry_depth = self.thread().call_depth;
        let func_idx = self.thread().stack_top;
        self.push_value(func)?;
        for arg in args {
            self.push_value(arg.clone())?;
        }
        let nargs = args.len();
        self.c_boundary += 1;
        let result = execute::call::do_call(self, func_idx, nargs, -1, entry_depth);
        self.c_boundary -= 1;
        match result {
            Ok(()) => {
                let top = self.thread().stack_top;
                let mut results = Vec::with_capacity(top.saturating_sub(func_idx));
                for i in func_idx..top {
                    results.push(self.stack_get(i));
                }
                self.thread_mut().set_top(func_idx);
                Ok(results)
            }
            Err(e) => {
                self.unwind_to(entry_depth);
                self.thread_mut().set_top(func_idx);
                Err(e)
            }
        }
    }

    /// Protected call (pcall semantics): real errors are caught and
    /// returned as values, control-flow variants pass through.
    pub fn pcall_values(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        match self.call_function(func, args) {
            Ok(results) => Ok((true, results)),
            Err(e) if !e.is_error() => Err(e),
            Err(LuaError::Cancelled) => Err(LuaError::Cancelled),
            Err(e) => {
                let value = self.take_error_value(e);
                Ok((false, vec![value]))
            }
        }
    }

    /// xpcall: like pcall, but routes the error value through `handler`
    /// inside the same protection.
    pub fn xpcall_values(
        &mut self,
        func: LuaValue,
        handler: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        match self.call_function(func, args) {
            Ok(results) => Ok((true, results)),
            Err(e) if !e.is_error() => Err(e),
            Err(LuaError::Cancelled) => Err(LuaError::Cancelled),
            Err(e) => {
                let err_value = self.take_error_value(e);
                match self.call_function(handler, &[err_value.clone()]) {
                    Ok(mut handled) => {
                        if handled.is_empty() {
                            handled.push(err_value);
                        }
                        Ok((false, handled))
                    }
                    Err(he) if !he.is_error() => Err(he),
                    Err(_) => {
                        let msg = self.create_string("error in error handling");
                        Ok((false, vec![msg]))
                    }
                }
            }
        }
    }

    /// Unwind frames above `target_depth`, closing upvalues at each
    /// unwound base.
    pub(crate) fn unwind_to(&mut self, target_depth: usize) {
        while self.thread().call_depth > target_depth {
            let depth = self.thread().call_depth;
            let base = self.thread().call_stack[depth - 1].base;
            self.thread_mut().close_upvalues(base);
            self.pop_frame();
        }
    }

    // ===== Host suspension =====

    /// Park a poll closure for the current host call and signal
    /// suspension. Rejected inside nested dispatch (a metamethod or
    /// protected boundary), where the Rust frames cannot be captured.
    pub fn park_poll(&mut self, poll: HostPoll) -> LuaError {
        if self.c_boundary > 0 {
            return self.error_kind(
                LuaError::Runtime,
                "attempt to suspend across a call boundary".to_string(),
            );
        }
        let slot = self
            .pending_polls
            .iter()
            .position(|p| p.is_none())
            .unwrap_or_else(|| {
                self.pending_polls.push(None);
                self.pending_polls.len() - 1
            });
        self.pending_polls[slot] = Some(poll);
        match self.thread_mut().current_frame_mut() {
            Some(frame) => {
                frame.call_status |= call_status::CIST_AWAIT;
                frame.poll_slot = slot as i32;
                LuaError::Await
            }
            None => {
                self.pending_polls[slot] = None;
                self.error_kind(
                    LuaError::Runtime,
                    "attempt to suspend outside a call".to_string(),
                )
            }
        }
    }

    /// Drive the parked poll of the current (awaiting) frame to
    /// completion, then finish the host call it belongs to.
    pub fn poll_awaiting(&mut self) -> LuaResult<()> {
        loop {
            if self.cancelled() {
                return Err(LuaError::Cancelled);
            }
            let (slot, func_idx, nresults) = {
                let frame = match self.thread().current_frame() {
                    Some(f) if f.is_awaiting() => f,
                    _ => {
                        return Err(self.error_kind(
                            LuaError::Debugger,
                            "no awaiting frame to poll".to_string(),
                        ))
                    }
                };
                (frame.poll_slot as usize, frame.func_idx, frame.nresults)
            };
            let mut poll = match self.pending_polls[slot].take() {
                Some(p) => p,
                None => {
                    return Err(self.error_kind(
                        LuaError::Debugger,
                        "awaiting frame lost its poll".to_string(),
                    ))
                }
            };
            match poll(self)? {
                Some(n) => {
                    if let Some(frame) = self.thread_mut().current_frame_mut() {
                        frame.call_status &= !call_status::CIST_AWAIT;
                        frame.poll_slot = -1;
                    }
                    execute::call::finish_host_results(self, func_idx, n, nresults);
                    self.pop_frame();
                    return Ok(());
                }
                None => {
                    self.pending_polls[slot] = Some(poll);
                    std::thread::yield_now();
                }
            }
        }
    }

    // ===== Coroutines =====

    /// Yield `values` to the resumer of the current coroutine
    pub fn do_yield(&mut self, values: Vec<LuaValue>) -> LuaError {
        if self.current.is_main() {
            return self.error_kind(
                LuaError::Coroutine,
                "attempt to yield from outside a coroutine".to_string(),
            );
        }
        if self.c_boundary > 0 {
            return self.error_kind(
                LuaError::Coroutine,
                "attempt to yield across a call boundary".to_string(),
            );
        }
        self.thread_mut().yield_values = values;
        LuaError::Yield
    }

    /// Resume a coroutine with `args`. Returns (finished, results):
    /// finished=false means it yielded. Errors inside the coroutine
    /// surface as `Err` with the message set (the coroutine library
    /// converts them to `(false, message)` pairs).
    pub fn resume_thread(
        &mut self,
        id: ThreadId,
        args: Vec<LuaValue>,
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        if id == self.current {
            return Err(self.error_kind(
                LuaError::Coroutine,
                "cannot resume non-suspended coroutine".to_string(),
            ));
        }
        match self.threads[id.0].status {
            ThreadStatus::Suspended => {}
            ThreadStatus::Dead => {
                return Err(self.error_kind(
                    LuaError::Coroutine,
                    "cannot resume dead coroutine".to_string(),
                ))
            }
            _ => {
                return Err(self.error_kind(
                    LuaError::Coroutine,
                    "cannot resume non-suspended coroutine".to_string(),
                ))
            }
        }

        let caller = self.current;
        self.threads[caller.0].status = ThreadStatus::Normal;
        self.threads[id.0].status = ThreadStatus::Running;
        self.current = id;
        let saved_boundary = std::mem::take(&mut self.c_boundary);

        let outcome = self.resume_inner(id, args);

        self.c_boundary = saved_boundary;
        self.current = caller;
        self.threads[caller.0].status = ThreadStatus::Running;
        match &outcome {
            Ok((finished, _)) => {
                self.threads[id.0].status = if *finished {
                    ThreadStatus::Dead
                } else {
                    ThreadStatus::Suspended
                };
            }
            Err(_) => self.threads[id.0].status = ThreadStatus::Dead,
        }
        outcome
    }

    fn resume_inner(
        &mut self,
        id: ThreadId,
        args: Vec<LuaValue>,
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        let body = self.threads[id.0].body.take();
        if let Some(func) = body {
            // First resume: stack is [body, args...], frame base at 1
            let thread = self.thread_mut();
            thread.stack.clear();
            thread.stack_top = 0;
            thread.push_value(func.clone());
            for arg in args {
                thread.push_value(arg);
            }
            let nargs = self.thread().stack_top - 1;
            execute::call::precall(self, 0, nargs, -1)?;
        } else {
            if self.thread().call_depth == 0 {
                return Err(self.error_kind(
                    LuaError::Coroutine,
                    "cannot resume dead coroutine".to_string(),
                ));
            }
            // Returning from a yield: the yield host frame is still on
            // top. Its results are the resume arguments.
            let (func_idx, nresults) = match self.thread().current_frame() {
                Some(frame) => (frame.func_idx, frame.nresults),
                None => {
                    return Err(self.error_kind(
                        LuaError::Coroutine,
                        "cannot resume dead coroutine".to_string(),
                    ))
                }
            };
            self.pop_frame();
            let n = args.len();
            for (i, arg) in args.into_iter().enumerate() {
                self.stack_set(func_idx + i, arg)?;
            }
            execute::call::adjust_results(self, func_idx, n, nresults);
        }

        loop {
            match execute::lua_execute(self, 0) {
                Ok(()) => {
                    let top = self.thread().stack_top;
                    let mut results = Vec::new();
                    for i in 0..top {
                        results.push(self.stack_get(i));
                    }
                    return Ok((true, results));
                }
                Err(LuaError::Yield) => {
                    let values = std::mem::take(&mut self.thread_mut().yield_values);
                    return Ok((false, values));
                }
                Err(LuaError::Await) => self.poll_awaiting()?,
                Err(e) => return Err(e),
            }
        }
    }

    // ===== Top-level execution =====

    /// Run a main closure to completion on the main thread, driving any
    /// host suspensions. On error the stack is unwound (closing
    /// upvalues) and the message is extended with a traceback.
    pub fn run_main(&mut self, main: LuaValue) -> LuaResult<Vec<LuaValue>> {
        let entry_depth = self.thread().call_depth;
        let func_idx = self.thread().stack_top;
        self.push_value(main)?;
        execute::call::precall(self, func_idx, 0, -1)?;
        loop {
            match execute::lua_execute(self, entry_depth) {
                Ok(()) => {
                    let top = self.thread().stack_top;
                    let mut results = Vec::new();
                    for i in func_idx..top {
                        results.push(self.stack_get(i));
                    }
                    self.thread_mut().set_top(func_idx);
                    return Ok(results);
                }
                Err(LuaError::Await) => self.poll_awaiting()?,
                Err(LuaError::Yield) => {
                    return Err(self.error_kind(
                        LuaError::Coroutine,
                        "attempt to yield from outside a coroutine".to_string(),
                    ))
                }
                Err(e) => {
                    let traceback = self.generate_traceback();
                    self.unwind_to(entry_depth);
                    self.thread_mut().set_top(func_idx);
                    if !self.error_msg.is_empty() {
                        self.error_msg = format!("{}\n{}", self.error_msg, traceback);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Value rendering that never runs Lua code; used for variable
    /// snapshots and log points.
    pub fn display_value(&self, value: &LuaValue) -> String {
        value.to_string()
    }

    /// `tostring` semantics: honors `__tostring`
    pub fn tostring_value(&mut self, value: &LuaValue) -> LuaResult<String> {
        let mm = self.get_metamethod(value, TmKind::ToString);
        if !mm.is_nil() {
            let results = self.call_function(mm, &[value.clone()])?;
            match results.first() {
                Some(LuaValue::String(s)) => return Ok(s.as_str().to_string()),
                Some(other) => return Ok(other.to_string()),
                None => {
                    return Err(self.error("'__tostring' must return a value".to_string()))
                }
            }
        }
        Ok(value.to_string())
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        Self::new()
    }
}
