// Compiled function prototypes, produced by the external compiler and
// consumed by the VM. A prototype is immutable except for its code
// array: the debugger overlay patches instructions in place, so the code
// lives in its own mutable container ("code array + everything else").

use smol_str::SmolStr;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Compile-time constant. Prototype constants never reference runtime
/// objects, which keeps prototypes shareable with the debugger thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{}", b),
            Constant::Number(n) => write!(f, "{}", super::number_to_string(*n)),
            Constant::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// Upvalue descriptor: where the enclosing context finds the captured
/// cell when a closure of this prototype is built.
#[derive(Debug, Clone)]
pub struct UpvalueDesc {
    pub name: SmolStr,
    /// true: capture a local of the enclosing frame (open upvalue);
    /// false: share an upvalue of the enclosing closure
    pub in_stack: bool,
    pub index: u32,
}

/// Local-variable debug record: which register holds `name` over which
/// pc range.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Compiled function: code, line map, constants, child prototypes,
/// upvalue descriptors, local debug records.
pub struct Prototype {
    /// Chunk name; a leading `@` denotes a file-backed source
    pub chunk_name: SmolStr,
    /// Instruction stream. Mutable only through [`Prototype::patch`],
    /// which only the debugger overlay calls, under its own lock.
    code: Mutex<Vec<u32>>,
    /// One source line per code index
    pub line_info: Vec<u32>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub locals: Vec<LocalVar>,
    pub param_count: usize,
    pub is_vararg: bool,
    pub max_stack_size: usize,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl Prototype {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunk_name: impl Into<SmolStr>,
        code: Vec<u32>,
        line_info: Vec<u32>,
        constants: Vec<Constant>,
        protos: Vec<Arc<Prototype>>,
        upvalues: Vec<UpvalueDesc>,
        locals: Vec<LocalVar>,
        param_count: usize,
        is_vararg: bool,
        max_stack_size: usize,
    ) -> Self {
        Prototype {
            chunk_name: chunk_name.into(),
            code: Mutex::new(code),
            line_info,
            constants,
            protos,
            upvalues,
            locals,
            param_count,
            is_vararg,
            max_stack_size,
            line_defined: 0,
            last_line_defined: 0,
        }
    }

    fn code_guard(&self) -> MutexGuard<'_, Vec<u32>> {
        self.code.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy out the instruction at `pc`. The guard is scoped to this
    /// call so no reference into the code array outlives it.
    #[inline]
    pub fn fetch(&self, pc: usize) -> u32 {
        self.code_guard()[pc]
    }

    #[inline]
    pub fn code_len(&self) -> usize {
        self.code_guard().len()
    }

    /// Overwrite the instruction at `pc`. Debugger overlay only.
    pub fn patch(&self, pc: usize, instr: u32) {
        self.code_guard()[pc] = instr;
    }

    pub fn code_snapshot(&self) -> Vec<u32> {
        self.code_guard().clone()
    }

    /// Source line of the instruction at `pc` (0 when out of range)
    #[inline]
    pub fn line_of(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Identity key for debugger maps. Valid while the `Arc` is alive;
    /// the overlay keeps the `Arc` alongside every key it stores.
    #[inline]
    pub fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Registers holding named locals at `pc`, in register order.
    /// Follows the luaF_getlocalname convention: records are ordered by
    /// start pc, and the n-th active record names register n.
    pub fn active_locals(&self, pc: u32) -> Vec<(usize, &LocalVar)> {
        let mut out: Vec<(usize, &LocalVar)> = Vec::new();
        for var in &self.locals {
            if var.start_pc > pc {
                break;
            }
            if pc < var.end_pc {
                let reg = out.len();
                out.push((reg, var));
            }
        }
        out
    }

    /// First instruction index in this prototype tree whose line equals
    /// `line`, searching depth-first with children preferred.
    pub fn find_line_instruction(self: &Arc<Self>, line: u32) -> Option<(Arc<Prototype>, u32)> {
        for child in &self.protos {
            if let Some(hit) = child.find_line_instruction(line) {
                return Some(hit);
            }
        }
        self.line_info
            .iter()
            .position(|&l| l == line)
            .map(|pc| (Arc::clone(self), pc as u32))
    }

    /// Smallest prototype in this tree whose defined-line span covers
    /// `line`; used by the controller's findPrototype request.
    pub fn find_enclosing(self: &Arc<Self>, line: u32) -> Option<Arc<Prototype>> {
        for child in &self.protos {
            if let Some(hit) = child.find_enclosing(line) {
                return Some(hit);
            }
        }
        let lo = self.line_defined;
        let hi = self.last_line_defined;
        let covers = (lo == 0 && hi == 0) || (lo <= line && line <= hi)
            || self.line_info.iter().any(|&l| l == line);
        if covers { Some(Arc::clone(self)) } else { None }
    }
}

impl fmt::Debug for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prototype")
            .field("chunk_name", &self.chunk_name)
            .field("code_len", &self.code_len())
            .field("param_count", &self.param_count)
            .field("is_vararg", &self.is_vararg)
            .field("max_stack_size", &self.max_stack_size)
            .field("protos", &self.protos.len())
            .finish()
    }
}
