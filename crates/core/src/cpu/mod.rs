// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

mod exec;

use crate::bus::IoPortHandler;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer};
use crate::peripherals::pic::InterruptController;
use crate::peripherals::pit::IntervalTimer;
use crate::{SimResult, SimulationError};
use bitflags::bitflags;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;
        const RESERVED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
    }
}

/// Execution state of the processor, derived from CR0.PE and EFLAGS.VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorMode {
    Real,
    Protected,
    Virtual8086,
}

impl ProcessorMode {
    pub fn from_state(cr0: Cr0, eflags: EFlags) -> Self {
        if !cr0.contains(Cr0::PE) {
            ProcessorMode::Real
        } else if eflags.contains(EFlags::VM) {
            ProcessorMode::Virtual8086
        } else {
            ProcessorMode::Protected
        }
    }

    /// Real and Virtual8086 modes use 16-bit operands and stack slots.
    pub fn is_16bit(self) -> bool {
        !matches!(self, ProcessorMode::Protected)
    }
}

/// Guest-visible exceptions raised by instruction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorFault {
    #[error("#UD: invalid opcode {opcode:#04x}")]
    InvalidOpcode { opcode: u8 },
    #[error("#GP: general protection")]
    GeneralProtection,
}

impl ProcessorFault {
    pub fn vector(&self) -> u8 {
        match self {
            ProcessorFault::InvalidOpcode { .. } => 6,
            ProcessorFault::GeneralProtection => 13,
        }
    }
}

/// Result of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    EndBlock,
    Halt,
    ModeSwitch(ProcessorMode),
    Fault(ProcessorFault),
}

/// Why a basic block stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    Continue,
    Halted,
    ModeSwitch(ProcessorMode),
    Fault(ProcessorFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Instructions that completed, including one that switched mode.
    pub retired: u64,
    pub exit: BlockExit,
}

/// What interrupt servicing or fault handling did to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing was pending, or interrupts are disabled.
    Idle,
    Delivered { vector: u8 },
    /// Delivery left Virtual8086 mode.
    ModeSwitch { vector: u8, to: ProcessorMode },
    /// No handler installed for the vector; the guest stream is terminated.
    Halted { vector: u8 },
    Reset,
}

const RELINK_PIC: u8 = 1 << 0;
const RELINK_TIMER: u8 = 1 << 1;
const RELINK_IOPORTS: u8 = 1 << 2;
const RELINK_ALL: u8 = RELINK_PIC | RELINK_TIMER | RELINK_IOPORTS;

/// The x86 processor component.
///
/// Code and stack segments are fixed at zero, so EIP and ESP are linear addresses.
#[derive(Debug)]
pub struct Processor {
    pub eax: u32,
    pub esp: u32,
    pub eip: u32,
    pub cr0: Cr0,
    pub eflags: EFlags,
    pub idtr_base: u32,
    pub idtr_limit: u16,
    reset_eip: u32,
    halted: bool,
    fault_count: u64,
    last_fault: Option<ProcessorFault>,
    reset_line: Rc<Cell<bool>>,
    pic: Option<Rc<RefCell<InterruptController>>>,
    timer: Option<Rc<RefCell<IntervalTimer>>>,
    ioports: Option<Rc<RefCell<IoPortHandler>>>,
    relinked: u8,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    pub fn new() -> Self {
        let mut cpu = Self {
            eax: 0,
            esp: 0,
            eip: 0,
            cr0: Cr0::ET,
            eflags: EFlags::RESERVED,
            idtr_base: 0,
            idtr_limit: 0x3FF,
            reset_eip: 0,
            halted: false,
            fault_count: 0,
            last_fault: None,
            reset_line: Rc::new(Cell::new(false)),
            pic: None,
            timer: None,
            ioports: None,
            relinked: RELINK_ALL,
        };
        cpu.reset();
        cpu
    }

    pub fn mode(&self) -> ProcessorMode {
        ProcessorMode::from_state(self.cr0, self.eflags)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Halted with interrupts disabled: nothing short of a reset will wake it.
    pub fn is_stopped(&self) -> bool {
        self.halted && !self.eflags.contains(EFlags::IF)
    }

    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    pub fn last_fault(&self) -> Option<ProcessorFault> {
        self.last_fault
    }

    /// Where EIP points after a reset.
    pub fn set_reset_vector(&mut self, eip: u32) {
        self.reset_eip = eip;
    }

    pub fn set_idt(&mut self, base: u32, limit: u16) {
        self.idtr_base = base;
        self.idtr_limit = limit;
    }

    /// Shared reset request line. Raising it resets the processor at the next interrupt check.
    pub fn reset_line(&self) -> Rc<Cell<bool>> {
        self.reset_line.clone()
    }

    pub(crate) fn io_read(&self, port: u16) -> u8 {
        match &self.ioports {
            Some(ioports) => ioports.borrow().read(port),
            None => 0xFF,
        }
    }

    pub(crate) fn io_write(&self, port: u16, value: u8) {
        if let Some(ioports) = &self.ioports {
            ioports.borrow().write(port, value);
        }
    }

    fn capture(&mut self, offer: &Offer<'_>) {
        if let Some(pic) = offer.get_ready::<InterruptController>() {
            self.pic = Some(pic);
            self.relinked |= RELINK_PIC;
        }
        if let Some(timer) = offer.get_ready::<IntervalTimer>() {
            self.timer = Some(timer);
            self.relinked |= RELINK_TIMER;
        }
        if let Some(ioports) = offer.get_ready::<IoPortHandler>() {
            self.ioports = Some(ioports);
            self.relinked |= RELINK_IOPORTS;
        }
    }
}

impl Component for Processor {
    fn reset(&mut self) {
        self.eax = 0;
        self.esp = 0;
        self.eip = self.reset_eip;
        self.cr0 = Cr0::ET;
        self.eflags = EFlags::RESERVED;
        self.idtr_base = 0;
        self.idtr_limit = 0x3FF;
        self.halted = false;
        self.last_fault = None;
        self.reset_line.set(false);
    }

    fn accept(&mut self, offer: &Offer<'_>) {
        self.capture(offer);
    }

    fn is_wired(&self) -> bool {
        self.pic.is_some() && self.timer.is_some() && self.ioports.is_some()
    }

    fn relink(&mut self, offer: &Offer<'_>) {
        self.capture(offer);
    }

    fn is_relinked(&self) -> bool {
        self.is_wired() && self.relinked == RELINK_ALL
    }

    fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
        out.write_u32_le(self.eax)?;
        out.write_u32_le(self.esp)?;
        out.write_u32_le(self.eip)?;
        out.write_u32_le(self.cr0.bits())?;
        out.write_u32_le(self.eflags.bits())?;
        out.write_u32_le(self.idtr_base)?;
        out.write_u16_le(self.idtr_limit)?;
        out.write_u32_le(self.reset_eip)?;
        out.write_bool(self.halted)?;
        out.write_u64_le(self.fault_count)?;
        Ok(())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        self.eax = input.read_u32_le()?;
        self.esp = input.read_u32_le()?;
        self.eip = input.read_u32_le()?;
        self.cr0 = Cr0::from_bits_retain(input.read_u32_le()?);
        self.eflags = EFlags::from_bits_retain(input.read_u32_le()?);
        self.idtr_base = input.read_u32_le()?;
        self.idtr_limit = input.read_u16_le()?;
        self.reset_eip = input.read_u32_le()?;
        self.halted = input.read_bool()?;
        self.fault_count = input.read_u64_le()?;
        if !self.cr0.contains(Cr0::PE) && self.eflags.contains(EFlags::VM) {
            return Err(SimulationError::CorruptState("VM flag set outside protected mode"));
        }
        self.last_fault = None;
        self.relinked = 0;
        Ok(())
    }
}

impl ComponentType for Processor {
    const TYPE_NAME: &'static str = "machina.cpu.Processor";
}
