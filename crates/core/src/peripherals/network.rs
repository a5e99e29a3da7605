// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::IoPortCapable;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer, Pollable};
use crate::peripherals::pic::InterruptController;
use crate::{SimResult, SimulationError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;

pub const DEFAULT_IO_BASE: u16 = 0x300;
pub const DEFAULT_IRQ: u8 = 9;

const REG_STATUS: u16 = 0;
const REG_DATA: u16 = 1;
const REG_ACK: u16 = 2;
const REG_TX_BYTE: u16 = 3;
const REG_TX_COMMIT: u16 = 4;

const STATUS_RX_READY: u8 = 0x01;
const STATUS_TX_PENDING: u8 = 0x02;

const MAX_RX_FRAMES: usize = 64;
const MAX_FRAME_LEN: usize = 1518;
const TX_QUEUE_DEPTH: usize = 64;

/// Host side of a [`NetworkCard`]: inject received frames, collect transmitted ones.
#[derive(Debug, Clone)]
pub struct NetworkHost {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
}

impl NetworkHost {
    /// Queue a frame for the guest. Never blocks.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.inbound.send(frame).is_ok()
    }

    /// Next frame the guest transmitted, if any.
    pub fn try_recv_frame(&self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

/// Minimal frame-oriented network adapter driven by host channels.
#[derive(Debug)]
pub struct NetworkCard {
    io_base: u16,
    irq: u8,
    mac: [u8; 6],
    rx: VecDeque<Vec<u8>>,
    rx_cursor: usize,
    tx: Vec<u8>,
    frames_received: u64,
    frames_sent: u64,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    pic: Option<Rc<RefCell<InterruptController>>>,
}

impl NetworkCard {
    pub fn new(io_base: u16, irq: u8, mac: [u8; 6]) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = bounded(TX_QUEUE_DEPTH);
        Self {
            io_base,
            irq,
            mac,
            rx: VecDeque::new(),
            rx_cursor: 0,
            tx: Vec::new(),
            frames_received: 0,
            frames_sent: 0,
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            pic: None,
        }
    }

    pub fn host(&self) -> NetworkHost {
        NetworkHost {
            inbound: self.inbound_tx.clone(),
            outbound: self.outbound_rx.clone(),
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn pending_frames(&self) -> usize {
        self.rx.len()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    fn raise_irq(&self) {
        if let Some(pic) = &self.pic {
            pic.borrow_mut().pulse_irq(self.irq);
        }
    }

    fn status(&self) -> u8 {
        let mut status = 0;
        if !self.rx.is_empty() {
            status |= STATUS_RX_READY;
        }
        if !self.tx.is_empty() {
            status |= STATUS_TX_PENDING;
        }
        status
    }

    fn read_data(&mut self) -> u8 {
        let Some(frame) = self.rx.front() else {
            return 0;
        };
        match frame.get(self.rx_cursor) {
            Some(&byte) => {
                self.rx_cursor += 1;
                byte
            }
            None => 0,
        }
    }

    fn acknowledge(&mut self) {
        if self.rx.pop_front().is_some() {
            self.rx_cursor = 0;
            if !self.rx.is_empty() {
                self.raise_irq();
            }
        }
    }

    fn commit(&mut self) {
        if self.tx.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.tx);
        match self.outbound_tx.try_send(frame) {
            Ok(()) => self.frames_sent += 1,
            Err(TrySendError::Full(_)) => tracing::warn!("Network transmit queue full; frame dropped"),
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("Network host gone; frame dropped")
            }
        }
    }
}

impl Pollable for NetworkCard {
    fn poll(&mut self) -> usize {
        let was_empty = self.rx.is_empty();
        let mut surfaced = 0;
        while self.rx.len() < MAX_RX_FRAMES {
            match self.inbound_rx.try_recv() {
                Ok(mut frame) => {
                    frame.truncate(MAX_FRAME_LEN);
                    self.rx.push_back(frame);
                    self.frames_received += 1;
                    surfaced += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if surfaced > 0 {
            tracing::debug!("Network: {} frames received", surfaced);
            if was_empty {
                self.raise_irq();
            }
        }
        surfaced
    }
}

impl IoPortCapable for NetworkCard {
    fn io_ports(&self) -> Vec<u16> {
        (REG_STATUS..=REG_TX_COMMIT)
            .map(|reg| self.io_base + reg)
            .collect()
    }

    fn io_read(&mut self, port: u16) -> u8 {
        match port.wrapping_sub(self.io_base) {
            REG_STATUS => self.status(),
            REG_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        match port.wrapping_sub(self.io_base) {
            REG_ACK => self.acknowledge(),
            REG_TX_BYTE if self.tx.len() < MAX_FRAME_LEN => self.tx.push(value),
            REG_TX_BYTE => tracing::debug!("Network transmit buffer full"),
            REG_TX_COMMIT => self.commit(),
            _ => {}
        }
    }
}

impl Component for NetworkCard {
    fn reset(&mut self) {
        self.rx.clear();
        self.rx_cursor = 0;
        self.tx.clear();
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
        out.write_u16_le(self.io_base)?;
        out.write_u8(self.irq)?;
        out.write_all(&self.mac)?;
        out.write_u32_le(self.rx.len() as u32)?;
        for frame in &self.rx {
            out.write_len_prefixed_bytes_u32(frame)?;
        }
        out.write_u32_le(self.rx_cursor as u32)?;
        out.write_len_prefixed_bytes_u32(&self.tx)?;
        out.write_u64_le(self.frames_received)?;
        out.write_u64_le(self.frames_sent)?;
        Ok(())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        let io_base = input.read_u16_le()?;
        let irq = input.read_u8()?;
        if io_base != self.io_base || irq != self.irq {
            return Err(SimulationError::CorruptState("network card resources differ"));
        }
        let mut mac = [0u8; 6];
        input.read_exact(&mut mac)?;
        let count = input.read_u32_le()? as usize;
        if count > MAX_RX_FRAMES {
            return Err(SimulationError::CorruptState("too many queued frames"));
        }
        let mut rx = VecDeque::with_capacity(count);
        for _ in 0..count {
            rx.push_back(input.read_len_prefixed_bytes_u32(MAX_FRAME_LEN)?);
        }
        let rx_cursor = input.read_u32_le()? as usize;
        if rx.front().map_or(rx_cursor != 0, |f| rx_cursor > f.len()) {
            return Err(SimulationError::CorruptState("receive cursor out of range"));
        }
        self.tx = input.read_len_prefixed_bytes_u32(MAX_FRAME_LEN)?;
        self.frames_received = input.read_u64_le()?;
        self.frames_sent = input.read_u64_le()?;
        self.mac = mac;
        self.rx = rx;
        self.rx_cursor = rx_cursor;
        Ok(())
    }
}

impl ComponentType for NetworkCard {
    const TYPE_NAME: &'static str = "machina.peripherals.NetworkCard";

    fn io_port_capable(this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn IoPortCapable>>> {
        Some(this.clone())
    }

    fn pollable(this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn Pollable>>> {
        Some(this.clone())
    }
}
