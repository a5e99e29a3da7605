// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::{Cr0, Delivery, EFlags, Processor, ProcessorFault, ProcessorMode, Step};
use crate::component::Component;
use crate::decoder::{Decoded, Instruction};
use crate::memory::PhysicalMemory;
use crate::SimResult;

const CODE_SELECTOR: u32 = 0x08;
const GATE_PRESENT: u8 = 0x80;

impl Processor {
    /// Execute one decoded instruction at EIP.
    ///
    /// A faulting instruction leaves EIP untouched so the handler sees the faulting address.
    pub fn execute(
        &mut self,
        mode: ProcessorMode,
        mem: &mut PhysicalMemory,
        decoded: &Decoded,
    ) -> SimResult<Step> {
        let next = self.eip.wrapping_add(u32::from(decoded.len));
        let narrow = mode.is_16bit();
        let vm86 = mode == ProcessorMode::Virtual8086;

        tracing::trace!("{:?} EIP={:#x} {:?}", mode, self.eip, decoded.instruction);

        let step = match decoded.instruction {
            Instruction::Nop => Step::Next,
            Instruction::MovAlImm(imm) => {
                self.eax = (self.eax & !0xFF) | u32::from(imm);
                Step::Next
            }
            Instruction::MovEaxImm(imm) => {
                self.eax = Self::merge(self.eax, imm, narrow);
                Step::Next
            }
            Instruction::MovEspImm(imm) => {
                self.esp = Self::merge(self.esp, imm, narrow);
                Step::Next
            }
            Instruction::IncEax | Instruction::DecEax => {
                let delta = if decoded.instruction == Instruction::IncEax {
                    1u32
                } else {
                    u32::MAX
                };
                let result = if narrow {
                    u32::from((self.eax as u16).wrapping_add(delta as u16))
                } else {
                    self.eax.wrapping_add(delta)
                };
                self.eax = Self::merge(self.eax, result, narrow);
                self.eflags.set(EFlags::ZF, result == 0);
                Step::Next
            }
            Instruction::PushEax => {
                self.push(mode, mem, self.eax)?;
                Step::Next
            }
            Instruction::PopEax => {
                let value = self.pop(mode, mem)?;
                self.eax = Self::merge(self.eax, value, narrow);
                Step::Next
            }
            Instruction::Jmp(rel) => {
                self.eip = next.wrapping_add(rel as i32 as u32);
                return Ok(Step::EndBlock);
            }
            Instruction::Jnz(rel) => {
                self.eip = if self.eflags.contains(EFlags::ZF) {
                    next
                } else {
                    next.wrapping_add(rel as i32 as u32)
                };
                return Ok(Step::EndBlock);
            }
            Instruction::InAl(port) => {
                let value = self.io_read(u16::from(port));
                self.eax = (self.eax & !0xFF) | u32::from(value);
                Step::Next
            }
            Instruction::OutAl(port) => {
                self.io_write(u16::from(port), self.eax as u8);
                Step::Next
            }
            Instruction::Cli | Instruction::Sti | Instruction::Hlt if vm86 => {
                return Ok(Step::Fault(ProcessorFault::GeneralProtection));
            }
            Instruction::Int(_) | Instruction::Iret | Instruction::MovCr0Eax if vm86 => {
                return Ok(Step::Fault(ProcessorFault::GeneralProtection));
            }
            Instruction::Cli => {
                self.eflags.remove(EFlags::IF);
                Step::Next
            }
            Instruction::Sti => {
                self.eflags.insert(EFlags::IF);
                Step::Next
            }
            Instruction::Hlt => {
                self.eip = next;
                self.halted = true;
                return Ok(Step::Halt);
            }
            Instruction::Int(vector) => {
                self.eip = next;
                return Ok(match self.deliver(mode, vector, mem)? {
                    Delivery::Halted { .. } => Step::Halt,
                    _ => Step::EndBlock,
                });
            }
            Instruction::Iret => {
                self.interrupt_return(mode, mem)?;
                let now = self.mode();
                return Ok(if now != mode {
                    Step::ModeSwitch(now)
                } else {
                    Step::EndBlock
                });
            }
            Instruction::MovCr0Eax => {
                self.cr0 = Cr0::from_bits_retain(self.eax) | Cr0::ET;
                self.eip = next;
                let now = self.mode();
                return Ok(if now != mode {
                    tracing::debug!("MOV CR0 switched {:?} -> {:?}", mode, now);
                    Step::ModeSwitch(now)
                } else {
                    Step::EndBlock
                });
            }
            Instruction::Unknown(opcode) => {
                return Ok(Step::Fault(ProcessorFault::InvalidOpcode { opcode }));
            }
        };

        self.eip = next;
        Ok(step)
    }

    fn merge(old: u32, value: u32, narrow: bool) -> u32 {
        if narrow {
            (old & 0xFFFF_0000) | (value & 0xFFFF)
        } else {
            value
        }
    }

    fn push(&mut self, mode: ProcessorMode, mem: &mut PhysicalMemory, value: u32) -> SimResult<()> {
        if mode.is_16bit() {
            self.esp = self.esp.wrapping_sub(2) & 0xFFFF;
            mem.write_u16(self.esp, value as u16)
        } else {
            self.esp = self.esp.wrapping_sub(4);
            mem.write_u32(self.esp, value)
        }
    }

    fn pop(&mut self, mode: ProcessorMode, mem: &PhysicalMemory) -> SimResult<u32> {
        if mode.is_16bit() {
            let value = u32::from(mem.read_u16(self.esp)?);
            self.esp = self.esp.wrapping_add(2) & 0xFFFF;
            Ok(value)
        } else {
            let value = mem.read_u32(self.esp)?;
            self.esp = self.esp.wrapping_add(4);
            Ok(value)
        }
    }

    fn interrupt_return(&mut self, mode: ProcessorMode, mem: &PhysicalMemory) -> SimResult<()> {
        let eip = self.pop(mode, mem)?;
        let _cs = self.pop(mode, mem)?;
        let flags = self.pop(mode, mem)?;
        self.eip = eip;
        self.eflags = if mode.is_16bit() {
            EFlags::from_bits_retain((self.eflags.bits() & 0xFFFF_0000) | flags)
        } else {
            EFlags::from_bits_retain(flags)
        } | EFlags::RESERVED;
        Ok(())
    }

    /// Present IDT gate target for `vector`, if any.
    fn idt_gate(&self, vector: u8, mem: &PhysicalMemory) -> SimResult<Option<u32>> {
        let offset = u32::from(vector) * 8;
        if offset + 7 > u32::from(self.idtr_limit) {
            return Ok(None);
        }
        let gate = self.idtr_base.wrapping_add(offset);
        if mem.read_u8(gate.wrapping_add(5))? & GATE_PRESENT == 0 {
            return Ok(None);
        }
        let low = u32::from(mem.read_u16(gate)?);
        let high = u32::from(mem.read_u16(gate.wrapping_add(6))?);
        Ok(Some(low | (high << 16)))
    }

    /// Transfer control to the handler for `vector`.
    pub(crate) fn deliver(
        &mut self,
        mode: ProcessorMode,
        vector: u8,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        let target = match mode {
            ProcessorMode::Real => {
                let entry = u32::from(vector) * 4;
                let offset = u32::from(mem.read_u16(entry)?);
                let segment = u32::from(mem.read_u16(entry + 2)?);
                (offset != 0 || segment != 0).then_some((segment << 4) + offset)
            }
            ProcessorMode::Protected | ProcessorMode::Virtual8086 => self.idt_gate(vector, mem)?,
        };
        let Some(target) = target else {
            tracing::warn!("No handler for vector {:#04x} in {:?} mode; halting", vector, mode);
            self.halted = true;
            return Ok(Delivery::Halted { vector });
        };

        // Gates are 32-bit, so a Virtual8086 guest lands on a protected-mode frame.
        let frame_mode = if mode == ProcessorMode::Real {
            ProcessorMode::Real
        } else {
            ProcessorMode::Protected
        };
        let cs = if frame_mode == ProcessorMode::Real {
            0
        } else {
            CODE_SELECTOR
        };
        self.push(frame_mode, mem, self.eflags.bits())?;
        self.push(frame_mode, mem, cs)?;
        self.push(frame_mode, mem, self.eip)?;
        self.eflags.remove(EFlags::IF | EFlags::TF | EFlags::VM);
        self.eip = target;
        self.halted = false;

        tracing::debug!("Delivered vector {:#04x} -> {:#x}", vector, target);
        if mode == ProcessorMode::Virtual8086 {
            Ok(Delivery::ModeSwitch {
                vector,
                to: ProcessorMode::Protected,
            })
        } else {
            Ok(Delivery::Delivered { vector })
        }
    }

    fn service_interrupts(
        &mut self,
        mode: ProcessorMode,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        if self.reset_line.replace(false) {
            tracing::info!("Reset line raised; resetting processor");
            self.reset();
            return Ok(Delivery::Reset);
        }
        if let Some(timer) = &self.timer {
            timer.borrow_mut().advance(instructions);
        }
        if !self.eflags.contains(EFlags::IF) {
            return Ok(Delivery::Idle);
        }
        let vector = match &self.pic {
            Some(pic) => pic.borrow_mut().acknowledge(),
            None => None,
        };
        match vector {
            Some(vector) => self.deliver(mode, vector, mem),
            None => Ok(Delivery::Idle),
        }
    }

    fn handle_fault(
        &mut self,
        mode: ProcessorMode,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.fault_count += 1;
        self.last_fault = Some(fault);
        tracing::warn!("{} at EIP={:#x} in {:?} mode", fault, self.eip, mode);
        self.deliver(mode, fault.vector(), mem)
    }

    /// Advance device time by `instructions` and deliver one pending interrupt through the IVT.
    pub fn process_real_mode_interrupts(
        &mut self,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.service_interrupts(ProcessorMode::Real, instructions, mem)
    }

    /// Advance device time by `instructions` and deliver one pending interrupt through the IDT.
    pub fn process_protected_mode_interrupts(
        &mut self,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.service_interrupts(ProcessorMode::Protected, instructions, mem)
    }

    /// Like the protected-mode variant, but delivery leaves Virtual8086 mode.
    pub fn process_vm86_mode_interrupts(
        &mut self,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.service_interrupts(ProcessorMode::Virtual8086, instructions, mem)
    }

    pub fn handle_real_mode_fault(
        &mut self,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.handle_fault(ProcessorMode::Real, fault, mem)
    }

    pub fn handle_protected_mode_fault(
        &mut self,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.handle_fault(ProcessorMode::Protected, fault, mem)
    }

    pub fn handle_vm86_mode_fault(
        &mut self,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        self.handle_fault(ProcessorMode::Virtual8086, fault, mem)
    }
}
