/// Lightweight error enum - only 1 byte.
/// The actual error message (and a non-string error value raised through
/// `error()`) are stored on the VM to keep `Result` small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Generic runtime error raised by `error()` or library code
    Runtime,
    /// Operation attempted on a value whose tag forbids it and no
    /// metamethod supplied ("attempt to X a Y value")
    Type,
    /// Operand not coercible to number for an arithmetic opcode
    Arith,
    /// Nil/NaN key, or an `__index`/`__newindex` chain exceeded its bound
    Index,
    /// Callee is not a function and has no `__call`
    Call,
    /// Call depth or register pressure exceeded the configured limits
    StackOverflow,
    /// Yield outside a coroutine, resume of a non-suspended thread
    Coroutine,
    /// Debugger overlay invariant violation (trap without a registered
    /// original instruction)
    Debugger,
    /// Coroutine yield - values stored in the thread's yield buffer.
    /// Control flow, never user-visible.
    Yield,
    /// A host function suspended; its poll closure is parked on the VM.
    /// Control flow, never user-visible.
    Await,
    /// Execution cancelled through the external cancellation token
    Cancelled,
}

pub type LuaResult<T> = Result<T, LuaError>;

impl LuaError {
    /// Does this variant represent a real error (as opposed to the
    /// control-flow variants that pass through protected calls)?
    #[inline]
    pub fn is_error(self) -> bool {
        !matches!(self, LuaError::Yield | LuaError::Await)
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Runtime => write!(f, "runtime error"),
            LuaError::Type => write!(f, "type error"),
            LuaError::Arith => write!(f, "arithmetic error"),
            LuaError::Index => write!(f, "index error"),
            LuaError::Call => write!(f, "call error"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::Coroutine => write!(f, "coroutine error"),
            LuaError::Debugger => write!(f, "debugger error"),
            LuaError::Yield => write!(f, "coroutine yield"),
            LuaError::Await => write!(f, "host suspension"),
            LuaError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for LuaError {}

/// Rich error type combining [`LuaError`] kind with the actual message.
///
/// Created via [`LuaVM::into_full_error`](super::LuaVM::into_full_error)
/// after catching a `LuaError`; integrates with `?` in embedders.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    /// Human-readable message with source location and traceback
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}

impl LuaFullError {
    #[inline]
    pub fn kind(&self) -> LuaError {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}
