// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::IoPortCapable;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer};
use crate::{SimResult, SimulationError};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const CASCADE_LINE: u8 = 2;

const ICW1_INIT: u8 = 0x10;
const ICW1_IC4: u8 = 0x01;
const ICW1_SINGLE: u8 = 0x02;
const OCW3_SELECT: u8 = 0x08;
const OCW3_READ_REG: u8 = 0x02;
const OCW3_READ_ISR: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;
const OCW2_SPECIFIC: u8 = 0x40;

/// One 8259 chip.
#[derive(Debug, Clone, Default)]
struct Pic8259 {
    irr: u8,
    imr: u8,
    isr: u8,
    vector_base: u8,
    /// 0 when ready for OCWs, otherwise the next ICW expected (2..=4).
    init_step: u8,
    expect_icw4: bool,
    single: bool,
    read_isr: bool,
    line_levels: u8,
}

impl Pic8259 {
    fn new(vector_base: u8) -> Self {
        Self {
            vector_base,
            ..Self::default()
        }
    }

    fn set_line(&mut self, pin: u8, level: bool) {
        let bit = 1 << pin;
        if level {
            if self.line_levels & bit == 0 {
                self.irr |= bit;
            }
            self.line_levels |= bit;
        } else {
            self.line_levels &= !bit;
        }
    }

    /// Highest-priority requested pin not blocked by the mask or an in-service line.
    fn pending(&self, extra_irr: u8) -> Option<u8> {
        let requested = (self.irr | extra_irr) & !self.imr;
        if requested == 0 {
            return None;
        }
        let pin = requested.trailing_zeros() as u8;
        let in_service = if self.isr == 0 {
            8
        } else {
            self.isr.trailing_zeros() as u8
        };
        (pin < in_service).then_some(pin)
    }

    fn start_service(&mut self, pin: u8) -> u8 {
        let bit = 1 << pin;
        self.irr &= !bit;
        self.isr |= bit;
        self.vector_base.wrapping_add(pin)
    }

    fn write_command(&mut self, value: u8) {
        if value & ICW1_INIT != 0 {
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.read_isr = false;
            self.expect_icw4 = value & ICW1_IC4 != 0;
            self.single = value & ICW1_SINGLE != 0;
            self.init_step = 2;
        } else if value & OCW3_SELECT != 0 {
            if value & OCW3_READ_REG != 0 {
                self.read_isr = value & OCW3_READ_ISR != 0;
            }
        } else if value & OCW2_EOI != 0 {
            let pin = if value & OCW2_SPECIFIC != 0 {
                Some(value & 0x07)
            } else if self.isr != 0 {
                Some(self.isr.trailing_zeros() as u8)
            } else {
                None
            };
            if let Some(pin) = pin {
                self.isr &= !(1 << pin);
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        self.init_step = match self.init_step {
            0 => {
                self.imr = value;
                0
            }
            2 => {
                self.vector_base = value & 0xF8;
                match (self.single, self.expect_icw4) {
                    (false, _) => 3,
                    (true, true) => 4,
                    (true, false) => 0,
                }
            }
            3 => {
                if self.expect_icw4 {
                    4
                } else {
                    0
                }
            }
            _ => 0,
        };
    }

    fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn save(&self, out: &mut dyn Write) -> SimResult<()> {
        for byte in [
            self.irr,
            self.imr,
            self.isr,
            self.vector_base,
            self.init_step,
            self.line_levels,
        ] {
            out.write_u8(byte)?;
        }
        out.write_bool(self.expect_icw4)?;
        out.write_bool(self.single)?;
        out.write_bool(self.read_isr)?;
        Ok(())
    }

    fn load(&mut self, input: &mut dyn Read) -> SimResult<()> {
        self.irr = input.read_u8()?;
        self.imr = input.read_u8()?;
        self.isr = input.read_u8()?;
        self.vector_base = input.read_u8()?;
        self.init_step = input.read_u8()?;
        self.line_levels = input.read_u8()?;
        self.expect_icw4 = input.read_bool()?;
        self.single = input.read_bool()?;
        self.read_isr = input.read_bool()?;
        if self.init_step > 4 || self.init_step == 1 {
            return Err(SimulationError::CorruptState("8259 init step out of range"));
        }
        Ok(())
    }
}

/// Cascaded pair of 8259 controllers providing 16 edge-triggered lines.
#[derive(Debug, Clone)]
pub struct InterruptController {
    master: Pic8259,
    slave: Pic8259,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            master: Pic8259::new(0x08),
            slave: Pic8259::new(0x70),
        }
    }

    /// Drive line `irq` (0..16). A low to high transition latches a request.
    pub fn set_irq(&mut self, irq: u8, level: bool) {
        match irq {
            0..=7 => self.master.set_line(irq, level),
            8..=15 => self.slave.set_line(irq - 8, level),
            _ => tracing::warn!("Ignoring out of range IRQ {}", irq),
        }
    }

    /// Raise then lower `irq`, latching exactly one request.
    pub fn pulse_irq(&mut self, irq: u8) {
        self.set_irq(irq, true);
        self.set_irq(irq, false);
    }

    fn cascade_request(&self) -> u8 {
        if self.slave.pending(0).is_some() {
            1 << CASCADE_LINE
        } else {
            0
        }
    }

    pub fn has_pending(&self) -> bool {
        self.master.pending(self.cascade_request()).is_some()
    }

    /// Interrupt acknowledge cycle: move the best request in service and return its vector.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let cascade = self.cascade_request();
        let pin = self.master.pending(cascade)?;
        if pin == CASCADE_LINE && cascade != 0 {
            let slave_pin = self.slave.pending(0)?;
            self.master.isr |= 1 << CASCADE_LINE;
            self.master.irr &= !(1 << CASCADE_LINE);
            let vector = self.slave.start_service(slave_pin);
            tracing::debug!("PIC: acknowledged IRQ{} -> vector {:#04x}", slave_pin + 8, vector);
            return Some(vector);
        }
        let vector = self.master.start_service(pin);
        tracing::debug!("PIC: acknowledged IRQ{} -> vector {:#04x}", pin, vector);
        Some(vector)
    }

    pub fn mask(&self) -> u16 {
        u16::from(self.master.imr) | (u16::from(self.slave.imr) << 8)
    }

    pub fn in_service(&self) -> u16 {
        u16::from(self.master.isr) | (u16::from(self.slave.isr) << 8)
    }

    pub fn requested(&self) -> u16 {
        u16::from(self.master.irr) | (u16::from(self.slave.irr) << 8)
    }
}

impl IoPortCapable for InterruptController {
    fn io_ports(&self) -> Vec<u16> {
        vec![MASTER_COMMAND, MASTER_DATA, SLAVE_COMMAND, SLAVE_DATA]
    }

    fn io_read(&mut self, port: u16) -> u8 {
        match port {
            MASTER_COMMAND => self.master.read_command(),
            MASTER_DATA => self.master.imr,
            SLAVE_COMMAND => self.slave.read_command(),
            SLAVE_DATA => self.slave.imr,
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        match port {
            MASTER_COMMAND => self.master.write_command(value),
            MASTER_DATA => self.master.write_data(value),
            SLAVE_COMMAND => self.slave.write_command(value),
            SLAVE_DATA => self.slave.write_data(value),
            _ => {}
        }
    }
}

impl Component for InterruptController {
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn accept(&mut self, _offer: &Offer<'_>) {}

    fn is_wired(&self) -> bool {
        true
    }

    fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
        self.master.save(out)?;
        self.slave.save(out)
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        let mut master = Pic8259::default();
        let mut slave = Pic8259::default();
        master.load(input)?;
        slave.load(input)?;
        self.master = master;
        self.slave = slave;
        Ok(())
    }
}

impl ComponentType for InterruptController {
    const TYPE_NAME: &'static str = "machina.peripherals.InterruptController";

    fn io_port_capable(this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn IoPortCapable>>> {
        Some(this.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_triggered_request() {
        let mut pic = InterruptController::new();
        pic.set_irq(1, true);
        pic.set_irq(1, true);
        assert_eq!(pic.acknowledge(), Some(0x09));
        // Still high: no new edge.
        pic.set_irq(1, true);
        assert_eq!(pic.acknowledge(), None);
    }

    #[test]
    fn test_priority_and_eoi() {
        let mut pic = InterruptController::new();
        pic.pulse_irq(3);
        pic.pulse_irq(0);
        assert_eq!(pic.acknowledge(), Some(0x08));
        // IRQ3 is lower priority than the in-service IRQ0.
        assert_eq!(pic.acknowledge(), None);
        pic.io_write(MASTER_COMMAND, OCW2_EOI);
        assert_eq!(pic.acknowledge(), Some(0x0B));
    }

    #[test]
    fn test_slave_lines_cascade_through_irq2() {
        let mut pic = InterruptController::new();
        pic.pulse_irq(9);
        assert!(pic.has_pending());
        assert_eq!(pic.acknowledge(), Some(0x71));
        assert_eq!(pic.in_service(), 0x0204);
    }

    #[test]
    fn test_init_sequence_sets_vector_base() {
        let mut pic = InterruptController::new();
        pic.io_write(MASTER_COMMAND, 0x11);
        pic.io_write(MASTER_DATA, 0x20);
        pic.io_write(MASTER_DATA, 0x04);
        pic.io_write(MASTER_DATA, 0x01);
        pic.io_write(MASTER_DATA, 0xFE);
        assert_eq!(pic.mask() & 0xFF, 0xFE);

        pic.pulse_irq(0);
        assert_eq!(pic.acknowledge(), None);
        pic.pulse_irq(1);
        assert_eq!(pic.acknowledge(), Some(0x21));
    }

    #[test]
    fn test_ocw3_selects_isr_read() {
        let mut pic = InterruptController::new();
        pic.pulse_irq(4);
        assert_eq!(pic.io_read(MASTER_COMMAND), 0x10);
        pic.acknowledge();
        pic.io_write(MASTER_COMMAND, OCW3_SELECT | OCW3_READ_REG | OCW3_READ_ISR);
        assert_eq!(pic.io_read(MASTER_COMMAND), 0x10);
        assert_eq!(pic.requested(), 0);
    }
}
