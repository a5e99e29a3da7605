// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Reference decoder for a small subset of x86.
//!
//! Only the handful of encodings needed to drive the orchestrator are understood. Anything
//! else decodes to [`Instruction::Unknown`], which the processor turns into #UD.

use crate::cpu::ProcessorMode;
use crate::memory::PhysicalMemory;
use crate::SimResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    MovAlImm(u8),   // B0 ib
    MovEaxImm(u32), // B8 iw/id
    MovEspImm(u32), // BC iw/id
    IncEax,         // 40
    DecEax,         // 48
    PushEax,        // 50
    PopEax,         // 58
    Jmp(i8),        // EB cb
    Jnz(i8),        // 75 cb
    InAl(u8),       // E4 ib
    OutAl(u8),      // E6 ib
    Cli,
    Sti,
    Hlt,
    Int(u8), // CD ib
    Iret,
    MovCr0Eax, // 0F 22 C0
    Unknown(u8),
}

impl Instruction {
    /// Control transfers and anything that may change mode terminate a basic block.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::Jmp(_)
                | Instruction::Jnz(_)
                | Instruction::Hlt
                | Instruction::Int(_)
                | Instruction::Iret
                | Instruction::MovCr0Eax
                | Instruction::Unknown(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub instruction: Instruction,
    pub len: u8,
}

impl Decoded {
    fn new(instruction: Instruction, len: u8) -> Self {
        Self { instruction, len }
    }
}

/// Decodes the instruction at `eip`.
pub fn decode(mode: ProcessorMode, memory: &PhysicalMemory, eip: u32) -> SimResult<Decoded> {
    let opcode = memory.read_u8(eip)?;
    let imm8 = |offset: u32| memory.read_u8(eip.wrapping_add(offset));
    // Operand-size prefixes are not modelled; 16-bit modes take 16-bit immediates.
    let imm_v = |offset: u32| -> SimResult<(u32, u8)> {
        if mode.is_16bit() {
            Ok((memory.read_u16(eip.wrapping_add(offset))? as u32, 2))
        } else {
            Ok((memory.read_u32(eip.wrapping_add(offset))?, 4))
        }
    };

    let decoded = match opcode {
        0x90 => Decoded::new(Instruction::Nop, 1),
        0xB0 => Decoded::new(Instruction::MovAlImm(imm8(1)?), 2),
        0xB8 => {
            let (imm, size) = imm_v(1)?;
            Decoded::new(Instruction::MovEaxImm(imm), 1 + size)
        }
        0xBC => {
            let (imm, size) = imm_v(1)?;
            Decoded::new(Instruction::MovEspImm(imm), 1 + size)
        }
        0x40 => Decoded::new(Instruction::IncEax, 1),
        0x48 => Decoded::new(Instruction::DecEax, 1),
        0x50 => Decoded::new(Instruction::PushEax, 1),
        0x58 => Decoded::new(Instruction::PopEax, 1),
        0xEB => Decoded::new(Instruction::Jmp(imm8(1)? as i8), 2),
        0x75 => Decoded::new(Instruction::Jnz(imm8(1)? as i8), 2),
        0xE4 => Decoded::new(Instruction::InAl(imm8(1)?), 2),
        0xE6 => Decoded::new(Instruction::OutAl(imm8(1)?), 2),
        0xFA => Decoded::new(Instruction::Cli, 1),
        0xFB => Decoded::new(Instruction::Sti, 1),
        0xF4 => Decoded::new(Instruction::Hlt, 1),
        0xCD => Decoded::new(Instruction::Int(imm8(1)?), 2),
        0xCF => Decoded::new(Instruction::Iret, 1),
        0x0F if imm8(1)? == 0x22 && imm8(2)? == 0xC0 => Decoded::new(Instruction::MovCr0Eax, 3),
        other => Decoded::new(Instruction::Unknown(other), 1),
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(bytes: &[u8]) -> PhysicalMemory {
        let mut mem = PhysicalMemory::new(0x100);
        mem.write_bytes(0, bytes).unwrap();
        mem
    }

    #[test]
    fn test_decode_mov_eax_follows_mode_width() {
        let mem = memory_with(&[0xB8, 0x34, 0x12, 0x78, 0x56]);
        let real = decode(ProcessorMode::Real, &mem, 0).unwrap();
        assert_eq!(real, Decoded::new(Instruction::MovEaxImm(0x1234), 3));

        let prot = decode(ProcessorMode::Protected, &mem, 0).unwrap();
        assert_eq!(prot, Decoded::new(Instruction::MovEaxImm(0x5678_1234), 5));
    }

    #[test]
    fn test_decode_branches_sign_extend() {
        let mem = memory_with(&[0xEB, 0xFE, 0x75, 0x04]);
        assert_eq!(
            decode(ProcessorMode::Real, &mem, 0).unwrap().instruction,
            Instruction::Jmp(-2)
        );
        assert_eq!(
            decode(ProcessorMode::Real, &mem, 2).unwrap().instruction,
            Instruction::Jnz(4)
        );
    }

    #[test]
    fn test_decode_mov_cr0() {
        let mem = memory_with(&[0x0F, 0x22, 0xC0, 0x0F, 0x0B]);
        let d = decode(ProcessorMode::Real, &mem, 0).unwrap();
        assert_eq!(d, Decoded::new(Instruction::MovCr0Eax, 3));
        assert!(d.instruction.ends_block());

        // UD2 is not part of the subset.
        let d = decode(ProcessorMode::Real, &mem, 3).unwrap();
        assert_eq!(d.instruction, Instruction::Unknown(0x0F));
    }

    #[test]
    fn test_decode_past_end_of_memory() {
        let mem = PhysicalMemory::new(0x10);
        assert!(decode(ProcessorMode::Real, &mem, 0x10).is_err());
    }
}
