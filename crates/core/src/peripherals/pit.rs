// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::IoPortCapable;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer};
use crate::peripherals::pic::InterruptController;
use crate::{SimResult, SimulationError};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

const CHANNEL0_DATA: u16 = 0x40;
const CONTROL: u16 = 0x43;
const TIMER_IRQ: u8 = 0;

/// Access mode selected by the control word's RW bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Latch,
    LowOnly,
    HighOnly,
    LowHigh,
}

impl Access {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Access::Latch,
            1 => Access::LowOnly,
            2 => Access::HighOnly,
            _ => Access::LowHigh,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Access::Latch => 0,
            Access::LowOnly => 1,
            Access::HighOnly => 2,
            Access::LowHigh => 3,
        }
    }
}

/// Channel 0 of an 8253/8254 interval timer, clocked by retired instructions.
#[derive(Debug)]
pub struct IntervalTimer {
    reload: u16,
    counter: u32,
    armed: bool,
    access: Access,
    operating_mode: u8,
    write_high_next: bool,
    read_high_next: bool,
    latched: Option<u16>,
    expirations: u64,
    pic: Option<Rc<RefCell<InterruptController>>>,
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalTimer {
    pub fn new() -> Self {
        Self {
            reload: 0,
            counter: 0,
            armed: false,
            access: Access::LowHigh,
            operating_mode: 2,
            write_high_next: false,
            read_high_next: false,
            latched: None,
            expirations: 0,
            pic: None,
        }
    }

    /// Reload of zero counts 65536, as on real hardware.
    fn period(&self) -> u32 {
        if self.reload == 0 {
            0x1_0000
        } else {
            u32::from(self.reload)
        }
    }

    /// Program the reload value and start counting.
    pub fn set_reload(&mut self, reload: u16) {
        self.reload = reload;
        self.counter = self.period();
        self.armed = true;
    }

    pub fn expirations(&self) -> u64 {
        self.expirations
    }

    pub fn current_count(&self) -> u16 {
        (self.counter & 0xFFFF) as u16
    }

    /// Count down by `ticks`. Expirations within one call coalesce into a single IRQ0 edge.
    pub fn advance(&mut self, ticks: u64) {
        if !self.armed || ticks == 0 {
            return;
        }
        let counter = u64::from(self.counter);
        if ticks < counter {
            self.counter -= ticks as u32;
            return;
        }
        let period = u64::from(self.period());
        let over = ticks - counter;
        let fired = 1 + over / period;
        self.counter = (period - over % period) as u32;
        self.expirations += fired;
        tracing::debug!("PIT: {} expirations", fired);
        if let Some(pic) = &self.pic {
            pic.borrow_mut().pulse_irq(TIMER_IRQ);
        }
    }

    fn write_control(&mut self, value: u8) {
        if value >> 6 != 0 {
            // Channels 1 and 2 are not modelled.
            return;
        }
        let access = Access::from_bits(value >> 4);
        if access == Access::Latch {
            self.latched = Some(self.current_count());
            return;
        }
        self.access = access;
        self.operating_mode = (value >> 1) & 0x7;
        self.write_high_next = false;
        self.read_high_next = false;
    }

    fn write_data(&mut self, value: u8) {
        match self.access {
            Access::LowOnly => self.set_reload(u16::from(value)),
            Access::HighOnly => self.set_reload(u16::from(value) << 8),
            Access::LowHigh if !self.write_high_next => {
                self.reload = (self.reload & 0xFF00) | u16::from(value);
                self.write_high_next = true;
            }
            Access::LowHigh => {
                self.write_high_next = false;
                self.set_reload((self.reload & 0x00FF) | (u16::from(value) << 8));
            }
            Access::Latch => {}
        }
    }

    fn read_data(&mut self) -> u8 {
        let count = self.latched.unwrap_or_else(|| self.current_count());
        let byte = match self.access {
            Access::HighOnly => (count >> 8) as u8,
            Access::LowHigh if self.read_high_next => (count >> 8) as u8,
            _ => count as u8,
        };
        let finished = match self.access {
            Access::LowHigh => {
                self.read_high_next = !self.read_high_next;
                !self.read_high_next
            }
            _ => true,
        };
        if finished {
            self.latched = None;
        }
        byte
    }
}

impl IoPortCapable for IntervalTimer {
    fn io_ports(&self) -> Vec<u16> {
        vec![CHANNEL0_DATA, CONTROL]
    }

    fn io_read(&mut self, port: u16) -> u8 {
        match port {
            CHANNEL0_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        match port {
            CHANNEL0_DATA => self.write_data(value),
            CONTROL => self.write_control(value),
            _ => {}
        }
    }
}

impl Component for IntervalTimer {
    fn reset(&mut self) {
        let pic = self.pic.take();
        *self = Self::new();
        self.pic = pic;
    }

    fn accept(&mut self, offer: &Offer<'_>) {
        if let Some(pic) = offer.get_ready::<InterruptController>() {
            self.pic = Some(pic);
        }
    }

    fn is_wired(&self) -> bool {
        self.pic.is_some()
    }

    fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
        out.write_u16_le(self.reload)?;
        out.write_u32_le(self.counter)?;
        out.write_bool(self.armed)?;
        out.write_u8(self.access.bits())?;
        out.write_u8(self.operating_mode)?;
        out.write_bool(self.write_high_next)?;
        out.write_bool(self.read_high_next)?;
        out.write_u64_le(self.expirations)?;
        Ok(())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        self.reload = input.read_u16_le()?;
        self.counter = input.read_u32_le()?;
        self.armed = input.read_bool()?;
        self.access = Access::from_bits(input.read_u8()?);
        self.operating_mode = input.read_u8()?;
        self.write_high_next = input.read_bool()?;
        self.read_high_next = input.read_bool()?;
        self.expirations = input.read_u64_le()?;
        self.latched = None;
        if self.armed && (self.counter == 0 || self.counter > self.period()) {
            return Err(SimulationError::CorruptState("PIT counter outside its period"));
        }
        Ok(())
    }
}

impl ComponentType for IntervalTimer {
    const TYPE_NAME: &'static str = "machina.peripherals.IntervalTimer";

    fn io_port_capable(this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn IoPortCapable>>> {
        Some(this.clone())
    }
}
