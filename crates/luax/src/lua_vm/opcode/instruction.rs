/*----------------------------------------------------------------------
  Lua 5.2 instruction encoding.

  Instruction format (32-bit):
  - iABC:  [Op(6) | A(8) | C(9) | B(9)]
  - iABx:  [Op(6) | A(8) | Bx(18)]
  - iAsBx: [Op(6) | A(8) | sBx(signed 18, excess-131071)]
  - iAx:   [Op(6) | Ax(26)]

  B and C operands of RK instructions select a constant when bit 8
  (BITRK) is set.
----------------------------------------------------------------------*/

use super::{OpCode, OpMode};
use crate::lua_value::Prototype;

pub struct Instruction;

impl Instruction {
    // Size of each field
    pub const SIZE_OP: u32 = 6;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_B: u32 = 9;
    pub const SIZE_C: u32 = 9;
    pub const SIZE_BX: u32 = Self::SIZE_B + Self::SIZE_C; // 18
    pub const SIZE_AX: u32 = Self::SIZE_BX + Self::SIZE_A; // 26

    // Position of each field
    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    pub const POS_C: u32 = Self::POS_A + Self::SIZE_A;
    pub const POS_B: u32 = Self::POS_C + Self::SIZE_C;
    pub const POS_BX: u32 = Self::POS_C;
    pub const POS_AX: u32 = Self::POS_A;

    // Maximum values
    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAX_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAX_AX: u32 = (1 << Self::SIZE_AX) - 1;

    /// Offset for the signed Bx field
    pub const OFFSET_SBX: i32 = (Self::MAX_BX >> 1) as i32;

    /// Constant-select bit for RK operands
    pub const BITRK: u32 = 1 << (Self::SIZE_B - 1);

    #[inline(always)]
    fn mask1(n: u32, p: u32) -> u32 {
        (!(!0u32 << n)) << p
    }

    #[inline(always)]
    fn get_arg(i: u32, pos: u32, size: u32) -> u32 {
        (i >> pos) & Self::mask1(size, 0)
    }

    #[inline(always)]
    pub fn get_opcode(i: u32) -> OpCode {
        OpCode::from_u8((i & Self::mask1(Self::SIZE_OP, 0)) as u8)
    }

    #[inline(always)]
    pub fn raw_opcode(i: u32) -> u8 {
        (i & Self::mask1(Self::SIZE_OP, 0)) as u8
    }

    /// Replace only the opcode bits, preserving operands.
    /// This is what the debugger overlay uses to patch a site with
    /// `DebugTrap` while keeping the original operands in place.
    #[inline(always)]
    pub fn with_opcode(i: u32, op: OpCode) -> u32 {
        (i & !Self::mask1(Self::SIZE_OP, Self::POS_OP)) | (op as u32)
    }

    #[inline(always)]
    pub fn get_a(i: u32) -> u32 {
        Self::get_arg(i, Self::POS_A, Self::SIZE_A)
    }

    #[inline(always)]
    pub fn get_b(i: u32) -> u32 {
        Self::get_arg(i, Self::POS_B, Self::SIZE_B)
    }

    #[inline(always)]
    pub fn get_c(i: u32) -> u32 {
        Self::get_arg(i, Self::POS_C, Self::SIZE_C)
    }

    #[inline(always)]
    pub fn get_bx(i: u32) -> u32 {
        Self::get_arg(i, Self::POS_BX, Self::SIZE_BX)
    }

    #[inline(always)]
    pub fn get_sbx(i: u32) -> i32 {
        Self::get_bx(i) as i32 - Self::OFFSET_SBX
    }

    #[inline(always)]
    pub fn get_ax(i: u32) -> u32 {
        Self::get_arg(i, Self::POS_AX, Self::SIZE_AX)
    }

    /// Does this RK operand select a constant?
    #[inline(always)]
    pub fn is_k(x: u32) -> bool {
        x & Self::BITRK != 0
    }

    /// Constant index of an RK operand
    #[inline(always)]
    pub fn rk_index(x: u32) -> u32 {
        x & !Self::BITRK
    }

    /// Encode a register index as an RK constant operand
    #[inline(always)]
    pub fn rk_as_k(x: u32) -> u32 {
        x | Self::BITRK
    }

    // Instruction creation

    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
        ((op as u32) << Self::POS_OP)
            | (a << Self::POS_A)
            | (b << Self::POS_B)
            | (c << Self::POS_C)
    }

    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> u32 {
        ((op as u32) << Self::POS_OP) | (a << Self::POS_A) | (bx << Self::POS_BX)
    }

    pub fn create_asbx(op: OpCode, a: u32, sbx: i32) -> u32 {
        Self::create_abx(op, a, (sbx + Self::OFFSET_SBX) as u32)
    }

    pub fn create_ax(op: OpCode, ax: u32) -> u32 {
        ((op as u32) << Self::POS_OP) | (ax << Self::POS_AX)
    }

    /// Render one instruction the way `luac -l` would, annotating RK
    /// constants from the prototype's constant table.
    pub fn disassemble(i: u32, proto: &Prototype) -> String {
        let op = Self::get_opcode(i);
        let a = Self::get_a(i);
        let b = Self::get_b(i);
        let c = Self::get_c(i);
        let mut text = match op.get_mode() {
            OpMode::IABC => format!("{:<9} {} {} {}", op.name(), a, b, c),
            OpMode::IABx => format!("{:<9} {} {}", op.name(), a, Self::get_bx(i)),
            OpMode::IAsBx => format!("{:<9} {} {}", op.name(), a, Self::get_sbx(i)),
            OpMode::IAx => format!("{:<9} {}", op.name(), Self::get_ax(i)),
        };
        let mut notes = Vec::new();
        if op == OpCode::LoadK {
            if let Some(k) = proto.constants.get(Self::get_bx(i) as usize) {
                notes.push(k.to_string());
            }
        }
        if matches!(op.get_mode(), OpMode::IABC) {
            for operand in [b, c] {
                if Self::is_k(operand) {
                    if let Some(k) = proto.constants.get(Self::rk_index(operand) as usize) {
                        notes.push(k.to_string());
                    }
                }
            }
        }
        if !notes.is_empty() {
            text.push_str("\t; ");
            text.push_str(&notes.join(" "));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_abc() {
        let instr = Instruction::create_abc(OpCode::Move, 1, 2, 3);
        assert_eq!(Instruction::get_opcode(instr), OpCode::Move);
        assert_eq!(Instruction::get_a(instr), 1);
        assert_eq!(Instruction::get_b(instr), 2);
        assert_eq!(Instruction::get_c(instr), 3);
    }

    #[test]
    fn test_instruction_abx() {
        let instr = Instruction::create_abx(OpCode::LoadK, 3, 100);
        assert_eq!(Instruction::get_opcode(instr), OpCode::LoadK);
        assert_eq!(Instruction::get_a(instr), 3);
        assert_eq!(Instruction::get_bx(instr), 100);
    }

    #[test]
    fn test_instruction_asbx() {
        let neg = Instruction::create_asbx(OpCode::ForLoop, 2, -50);
        assert_eq!(Instruction::get_opcode(neg), OpCode::ForLoop);
        assert_eq!(Instruction::get_a(neg), 2);
        assert_eq!(Instruction::get_sbx(neg), -50);

        let pos = Instruction::create_asbx(OpCode::Jmp, 0, 100);
        assert_eq!(Instruction::get_sbx(pos), 100);
    }

    #[test]
    fn test_instruction_ax() {
        let instr = Instruction::create_ax(OpCode::ExtraArg, 0xFFFF);
        assert_eq!(Instruction::get_opcode(instr), OpCode::ExtraArg);
        assert_eq!(Instruction::get_ax(instr), 0xFFFF);
    }

    #[test]
    fn test_bit_layout() {
        // Lua 5.2: op bits 0-5, A bits 6-13, C bits 14-22, B bits 23-31
        let instr = Instruction::create_abc(OpCode::Add, 10, 20, 30);
        assert_eq!(instr & 0x3F, OpCode::Add as u32);
        assert_eq!((instr >> 6) & 0xFF, 10);
        assert_eq!((instr >> 14) & 0x1FF, 30);
        assert_eq!((instr >> 23) & 0x1FF, 20);
    }

    #[test]
    fn test_rk_encoding() {
        assert!(!Instruction::is_k(255));
        assert!(Instruction::is_k(256));
        assert_eq!(Instruction::rk_index(Instruction::rk_as_k(7)), 7);
        assert_eq!(Instruction::BITRK, 256);
    }

    #[test]
    fn test_patch_opcode_preserves_operands() {
        let instr = Instruction::create_abc(OpCode::Call, 3, 2, 1);
        let patched = Instruction::with_opcode(instr, OpCode::DebugTrap);
        assert_eq!(Instruction::get_opcode(patched), OpCode::DebugTrap);
        assert_eq!(Instruction::get_a(patched), 3);
        assert_eq!(Instruction::get_b(patched), 2);
        assert_eq!(Instruction::get_c(patched), 1);
        let restored = Instruction::with_opcode(patched, OpCode::Call);
        assert_eq!(restored, instr);
    }

    #[test]
    fn test_offset_constants() {
        assert_eq!(Instruction::SIZE_BX, 18);
        assert_eq!(Instruction::OFFSET_SBX, 131071);
        assert_eq!(Instruction::MAX_A, 255);
        assert_eq!(Instruction::MAX_B, 511);
    }
}
