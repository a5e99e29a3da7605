// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! 8042 keyboard controller. The auxiliary (mouse) channel is not modelled.

use crate::bus::IoPortCapable;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer};
use crate::cpu::Processor;
use crate::memory::AddressSpace;
use crate::peripherals::pic::InterruptController;
use crate::{SimResult, SimulationError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const KEYBOARD_IRQ: u8 = 1;
const QUEUE_SIZE: usize = 256;

// Controller commands (port 0x64).
const CCMD_READ_MODE: u8 = 0x20;
const CCMD_WRITE_MODE: u8 = 0x60;
const CCMD_SELF_TEST: u8 = 0xAA;
const CCMD_KBD_TEST: u8 = 0xAB;
const CCMD_KBD_DISABLE: u8 = 0xAD;
const CCMD_KBD_ENABLE: u8 = 0xAE;
const CCMD_READ_INPORT: u8 = 0xC0;
const CCMD_READ_OUTPORT: u8 = 0xD0;
const CCMD_WRITE_OUTPORT: u8 = 0xD1;
const CCMD_WRITE_OBUF: u8 = 0xD2;
const CCMD_DISABLE_A20: u8 = 0xDD;
const CCMD_ENABLE_A20: u8 = 0xDF;
const CCMD_RESET: u8 = 0xFE;

// Keyboard commands (port 0x60).
const CMD_SET_LEDS: u8 = 0xED;
const CMD_ECHO: u8 = 0xEE;
const CMD_GET_ID: u8 = 0xF2;
const CMD_SET_RATE: u8 = 0xF3;
const CMD_ENABLE: u8 = 0xF4;
const CMD_RESET_DISABLE: u8 = 0xF5;
const CMD_RESET_ENABLE: u8 = 0xF6;
const CMD_RESET: u8 = 0xFF;

const REPLY_POR: u8 = 0xAA;
const REPLY_ACK: u8 = 0xFA;
const REPLY_RESEND: u8 = 0xFE;

const STAT_OBF: u8 = 0x01;
const STAT_SELFTEST: u8 = 0x04;
const STAT_CMD: u8 = 0x08;
const STAT_UNLOCKED: u8 = 0x10;

const MODE_KBD_INT: u8 = 0x01;
const MODE_DISABLE_KBD: u8 = 0x10;

const SCANCODE_EXTENDED: u8 = 0xE0;

#[derive(Debug)]
pub struct Keyboard {
    status: u8,
    mode: u8,
    /// Controller command awaiting its data byte, or 0.
    pending_command: u8,
    /// Keyboard command awaiting its argument byte, or 0.
    pending_keyboard_command: u8,
    scan_enabled: bool,
    leds: u8,
    queue: VecDeque<u8>,
    pic: Option<Rc<RefCell<InterruptController>>>,
    a20: Option<Rc<Cell<bool>>>,
    reset_line: Option<Rc<Cell<bool>>>,
    fresh: bool,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            status: STAT_CMD | STAT_UNLOCKED,
            mode: MODE_KBD_INT,
            pending_command: 0,
            pending_keyboard_command: 0,
            scan_enabled: false,
            leds: 0,
            queue: VecDeque::with_capacity(QUEUE_SIZE),
            pic: None,
            a20: None,
            reset_line: None,
            fresh: true,
        }
    }

    /// Host key down. Scancodes with the top bit set are sent with the E0 prefix.
    pub fn key_pressed(&mut self, scancode: u8) {
        if scancode & 0x80 != 0 {
            self.push(SCANCODE_EXTENDED);
        }
        self.push(scancode & 0x7F);
    }

    pub fn key_released(&mut self, scancode: u8) {
        if scancode & 0x80 != 0 {
            self.push(SCANCODE_EXTENDED);
        }
        self.push(scancode | 0x80);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    fn push(&mut self, byte: u8) {
        if self.queue.len() >= QUEUE_SIZE {
            tracing::debug!("Keyboard queue full; dropping {:#04x}", byte);
            return;
        }
        self.queue.push_back(byte);
        self.update_irq();
    }

    fn update_irq(&mut self) {
        self.status &= !STAT_OBF;
        let mut level = false;
        if !self.queue.is_empty() {
            self.status |= STAT_OBF;
            level = self.mode & MODE_KBD_INT != 0 && self.mode & MODE_DISABLE_KBD == 0;
        }
        if let Some(pic) = &self.pic {
            pic.borrow_mut().set_irq(KEYBOARD_IRQ, level);
        }
    }

    fn read_data(&mut self) -> u8 {
        let value = self.queue.pop_front();
        // Lower the line so the next byte produces a fresh edge.
        if let Some(pic) = &self.pic {
            pic.borrow_mut().set_irq(KEYBOARD_IRQ, false);
        }
        self.update_irq();
        value.unwrap_or(0)
    }

    fn set_a20(&self, enabled: bool) {
        if let Some(a20) = &self.a20 {
            tracing::debug!("Keyboard controller: A20 {}", if enabled { "on" } else { "off" });
            a20.set(enabled);
        }
    }

    fn request_reset(&self) {
        if let Some(line) = &self.reset_line {
            tracing::info!("Keyboard controller pulsed the reset line");
            line.set(true);
        }
    }

    fn write_command(&mut self, command: u8) {
        match command {
            CCMD_READ_MODE => self.push(self.mode),
            CCMD_WRITE_MODE | CCMD_WRITE_OBUF | CCMD_WRITE_OUTPORT => {
                self.pending_command = command;
            }
            CCMD_SELF_TEST => {
                self.status |= STAT_SELFTEST;
                self.push(0x55);
            }
            CCMD_KBD_TEST | CCMD_READ_INPORT => self.push(0x00),
            CCMD_KBD_DISABLE => {
                self.mode |= MODE_DISABLE_KBD;
                self.update_irq();
            }
            CCMD_KBD_ENABLE => {
                self.mode &= !MODE_DISABLE_KBD;
                self.update_irq();
            }
            CCMD_READ_OUTPORT => {
                let a20 = self.a20.as_ref().is_some_and(|a20| a20.get());
                let mut port = 0x01 | if a20 { 0x02 } else { 0x00 };
                if self.status & STAT_OBF != 0 {
                    port |= 0x10;
                }
                self.push(port);
            }
            CCMD_ENABLE_A20 => self.set_a20(true),
            CCMD_DISABLE_A20 => self.set_a20(false),
            CCMD_RESET => self.request_reset(),
            0xFF => {}
            other => tracing::info!("Unsupported keyboard controller command {:#04x}", other),
        }
    }

    fn write_data(&mut self, value: u8) {
        match std::mem::take(&mut self.pending_command) {
            0 => self.write_keyboard(value),
            CCMD_WRITE_MODE => {
                self.mode = value;
                self.update_irq();
            }
            CCMD_WRITE_OBUF => self.push(value),
            CCMD_WRITE_OUTPORT => {
                self.set_a20(value & 0x02 != 0);
                if value & 0x01 == 0 {
                    self.request_reset();
                }
            }
            _ => {}
        }
    }

    fn write_keyboard(&mut self, value: u8) {
        match std::mem::take(&mut self.pending_keyboard_command) {
            CMD_SET_LEDS => {
                self.leds = value;
                self.push(REPLY_ACK);
            }
            CMD_SET_RATE => self.push(REPLY_ACK),
            _ => match value {
                0x00 => self.push(REPLY_ACK),
                0x05 => self.push(REPLY_RESEND),
                CMD_GET_ID => {
                    self.push(REPLY_ACK);
                    self.push(0xAB);
                    self.push(0x83);
                }
                CMD_ECHO => self.push(CMD_ECHO),
                CMD_ENABLE => {
                    self.scan_enabled = true;
                    self.push(REPLY_ACK);
                }
                CMD_SET_LEDS | CMD_SET_RATE => {
                    self.pending_keyboard_command = value;
                    self.push(REPLY_ACK);
                }
                CMD_RESET_DISABLE => {
                    self.scan_enabled = false;
                    self.push(REPLY_ACK);
                }
                CMD_RESET_ENABLE => {
                    self.scan_enabled = true;
                    self.push(REPLY_ACK);
                }
                CMD_RESET => {
                    self.scan_enabled = true;
                    self.push(REPLY_ACK);
                    self.push(REPLY_POR);
                }
                _ => self.push(REPLY_ACK),
            },
        }
    }

    fn capture(&mut self, offer: &Offer<'_>) {
        if let Some(pic) = offer.get_ready::<InterruptController>() {
            self.pic = Some(pic);
        }
        if let Some(cpu) = offer.get_ready::<Processor>() {
            self.reset_line = Some(cpu.borrow().reset_line());
        }
        if let Some(space) = offer.get::<AddressSpace>() {
            self.a20 = Some(space.borrow().a20_line());
        }
    }
}

impl IoPortCapable for Keyboard {
    fn io_ports(&self) -> Vec<u16> {
        vec![DATA_PORT, STATUS_PORT]
    }

    fn io_read(&mut self, port: u16) -> u8 {
        match port {
            DATA_PORT => self.read_data(),
            STATUS_PORT => self.status,
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        match port {
            DATA_PORT => self.write_data(value),
            STATUS_PORT => self.write_command(value),
            _ => {}
        }
    }
}

impl Component for Keyboard {
    fn reset(&mut self) {
        self.status = STAT_CMD | STAT_UNLOCKED;
        self.mode = MODE_KBD_INT;
        self.pending_command = 0;
        self.pending_keyboard_command = 0;
        self.scan_enabled = false;
        self.leds = 0;
        self.queue.clear();
    }

    fn accept(&mut self, offer: &Offer<'_>) {
        self.capture(offer);
    }

    fn is_wired(&self) -> bool {
        self.pic.is_some() && self.a20.is_some() && self.reset_line.is_some()
    }

    fn relink(&mut self, offer: &Offer<'_>) {
        self.capture(offer);
        self.fresh = true;
    }

    fn is_relinked(&self) -> bool {
        self.fresh && self.is_wired()
    }

    fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
        out.write_u8(self.status)?;
        out.write_u8(self.mode)?;
        out.write_u8(self.pending_command)?;
        out.write_u8(self.pending_keyboard_command)?;
        out.write_bool(self.scan_enabled)?;
        out.write_u8(self.leds)?;
        let queue: Vec<u8> = self.queue.iter().copied().collect();
        out.write_len_prefixed_bytes_u32(&queue)?;
        Ok(())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        self.status = input.read_u8()?;
        self.mode = input.read_u8()?;
        self.pending_command = input.read_u8()?;
        self.pending_keyboard_command = input.read_u8()?;
        self.scan_enabled = input.read_bool()?;
        self.leds = input.read_u8()?;
        let queue = input.read_len_prefixed_bytes_u32(QUEUE_SIZE)?;
        if queue.is_empty() == (self.status & STAT_OBF != 0) {
            return Err(SimulationError::CorruptState("keyboard OBF disagrees with queue"));
        }
        self.queue = queue.into();
        self.fresh = false;
        Ok(())
    }
}

impl ComponentType for Keyboard {
    const TYPE_NAME: &'static str = "machina.peripherals.Keyboard";

    fn io_port_capable(this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn IoPortCapable>>> {
        Some(this.clone())
    }
}
