mod instruction;

pub use instruction::Instruction;

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// Complete Lua 5.2 opcode set (40 opcodes) plus the debugger trap.
///
/// Operand conventions below follow lopcodes.h:
/// - `R(x)`  register x (relative to the frame base)
/// - `K(x)`  constant x
/// - `RK(x)` register if x < 256, else constant x & 255
/// - `U[x]`  upvalue x of the running closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0, // R(A) := R(B)
    LoadK,    // R(A) := K(Bx)
    LoadKx,   // R(A) := K(extra arg)
    LoadBool, // R(A) := (bool)B; if C then pc++
    LoadNil,  // R(A), R(A+1), ..., R(A+B) := nil
    GetUpval, // R(A) := U[B]
    GetTabUp, // R(A) := U[B][RK(C)]
    GetTable, // R(A) := R(B)[RK(C)]
    SetTabUp, // U[A][RK(B)] := RK(C)
    SetUpval, // U[B] := R(A)
    SetTable, // R(A)[RK(B)] := RK(C)
    NewTable, // R(A) := {} (array hint B, hash hint C)
    Self_,    // R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,      // R(A) := RK(B) + RK(C)
    Sub,      // R(A) := RK(B) - RK(C)
    Mul,      // R(A) := RK(B) * RK(C)
    Div,      // R(A) := RK(B) / RK(C)
    Mod,      // R(A) := RK(B) % RK(C)
    Pow,      // R(A) := RK(B) ^ RK(C)
    Unm,      // R(A) := -R(B)
    Not,      // R(A) := not R(B)
    Len,      // R(A) := #R(B)
    Concat,   // R(A) := R(B) .. ... .. R(C)
    Jmp,      // pc += sBx; if A then close upvalues >= A-1
    Eq,       // if ((RK(B) == RK(C)) != A) then pc++
    Lt,       // if ((RK(B) <  RK(C)) != A) then pc++
    Le,       // if ((RK(B) <= RK(C)) != A) then pc++
    Test,     // if (bool(R(A)) != C) then pc++
    TestSet,  // if (bool(R(B)) == C) then R(A) := R(B) else pc++
    Call,     // R(A), ... := R(A)(R(A+1), ..., R(A+B-1)); C-1 results
    TailCall, // return R(A)(R(A+1), ..., R(A+B-1))
    Return,   // return R(A), ..., R(A+B-2)
    ForLoop,  // R(A) += R(A+2); if loop continues { pc += sBx; R(A+3) := R(A) }
    ForPrep,  // R(A) -= R(A+2); pc += sBx
    TForCall, // R(A+3), ..., R(A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop, // if R(A+1) != nil { R(A) := R(A+1); pc += sBx }
    SetList,  // R(A)[(C-1)*50 + i] := R(A+i), 1 <= i <= B
    Closure,  // R(A) := closure(proto[Bx])
    VarArg,   // R(A), ..., R(A+B-2) := vararg
    ExtraArg, // extra (larger) argument for the previous opcode
    DebugTrap, // reserved: transfers control to the debugger overlay
}

pub const DEBUG_TRAP_OPCODE: u8 = OpCode::DebugTrap as u8;

impl OpCode {
    #[inline(always)]
    pub fn from_u8(v: u8) -> OpCode {
        debug_assert!(v <= OpCode::DebugTrap as u8, "invalid opcode {}", v);
        // Safety of the transmute-free path: match keeps this total.
        match v {
            0 => OpCode::Move,
            1 => OpCode::LoadK,
            2 => OpCode::LoadKx,
            3 => OpCode::LoadBool,
            4 => OpCode::LoadNil,
            5 => OpCode::GetUpval,
            6 => OpCode::GetTabUp,
            7 => OpCode::GetTable,
            8 => OpCode::SetTabUp,
            9 => OpCode::SetUpval,
            10 => OpCode::SetTable,
            11 => OpCode::NewTable,
            12 => OpCode::Self_,
            13 => OpCode::Add,
            14 => OpCode::Sub,
            15 => OpCode::Mul,
            16 => OpCode::Div,
            17 => OpCode::Mod,
            18 => OpCode::Pow,
            19 => OpCode::Unm,
            20 => OpCode::Not,
            21 => OpCode::Len,
            22 => OpCode::Concat,
            23 => OpCode::Jmp,
            24 => OpCode::Eq,
            25 => OpCode::Lt,
            26 => OpCode::Le,
            27 => OpCode::Test,
            28 => OpCode::TestSet,
            29 => OpCode::Call,
            30 => OpCode::TailCall,
            31 => OpCode::Return,
            32 => OpCode::ForLoop,
            33 => OpCode::ForPrep,
            34 => OpCode::TForCall,
            35 => OpCode::TForLoop,
            36 => OpCode::SetList,
            37 => OpCode::Closure,
            38 => OpCode::VarArg,
            39 => OpCode::ExtraArg,
            _ => OpCode::DebugTrap,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadKx => "LOADKX",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetTabUp => "GETTABUP",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTabUp => "SETTABUP",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::Self_ => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::ExtraArg => "EXTRAARG",
            OpCode::DebugTrap => "DEBUGTRAP",
        }
    }

    pub fn get_mode(self) -> OpMode {
        match self {
            OpCode::LoadK | OpCode::LoadKx | OpCode::Closure => OpMode::IABx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop => OpMode::IAsBx,
            OpCode::ExtraArg => OpMode::IAx,
            _ => OpMode::IABC,
        }
    }
}
