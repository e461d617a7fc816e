/// Fixed execution limits, checked by the interpreter and the call
/// machinery. One instance per VM; adjust before running untrusted code.
#[derive(Debug, Clone, Copy)]
pub struct VmLimits {
    /// Maximum Lua call-stack depth
    pub max_call_depth: usize,
    /// Maximum value-stack size (registers + temporaries), per thread
    pub max_stack_size: usize,
    /// Bound on `__index`/`__newindex` metamethod chains
    pub max_meta_chain: usize,
    /// How many instructions run between cancellation / desired-breakpoint
    /// checks in the dispatch loop
    pub check_interval: u32,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 200,
            max_stack_size: 1_000_000,
            max_meta_chain: 100,
            check_interval: 1024,
        }
    }
}
