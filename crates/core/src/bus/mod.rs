// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::component::{Component, ComponentRef, ComponentType, Offer};
use crate::SimResult;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

/// A device reachable through x86 port I/O.
pub trait IoPortCapable {
    fn io_ports(&self) -> Vec<u16>;
    fn io_read(&mut self, port: u16) -> u8;
    fn io_write(&mut self, port: u16, value: u8);
}

/// Port number -> device dispatch table.
///
/// Devices are registered by the handler itself while it is offered the registry, and
/// again by the snapshot codec after a restore.
#[derive(Default)]
pub struct IoPortHandler {
    ports: HashMap<u16, Rc<RefCell<dyn IoPortCapable>>>,
}

impl std::fmt::Debug for IoPortHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ports: Vec<_> = self.ports.keys().collect();
        ports.sort();
        f.debug_struct("IoPortHandler").field("ports", &ports).finish()
    }
}

impl IoPortHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every port `device` asks for. Later registrations win.
    pub fn register(&mut self, device: Rc<RefCell<dyn IoPortCapable>>) {
        let ports = device.borrow().io_ports();
        for port in ports {
            if let Some(previous) = self.ports.insert(port, device.clone()) {
                if !Rc::ptr_eq(&previous, &device) {
                    tracing::warn!("I/O port {:#x} claimed by a second device", port);
                }
            }
            tracing::debug!("Registered I/O port {:#x}", port);
        }
    }

    /// Register `component` if it exposes ports. Returns whether it did.
    pub fn register_component(&mut self, component: &ComponentRef) -> bool {
        match component.io_port_capable() {
            Some(device) => {
                self.register(device.clone());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn claimed_ports(&self) -> usize {
        self.ports.len()
    }

    /// Unclaimed ports float high.
    pub fn read(&self, port: u16) -> u8 {
        match self.ports.get(&port) {
            Some(device) => device.borrow_mut().io_read(port),
            None => {
                tracing::debug!("Read from unclaimed I/O port {:#x}", port);
                0xFF
            }
        }
    }

    pub fn write(&self, port: u16, value: u8) {
        match self.ports.get(&port) {
            Some(device) => device.borrow_mut().io_write(port, value),
            None => tracing::debug!("Write {:#04x} to unclaimed I/O port {:#x}", value, port),
        }
    }
}

impl Component for IoPortHandler {
    fn reset(&mut self) {}

    fn accept(&mut self, offer: &Offer<'_>) {
        self.register_component(offer.component());
    }

    fn is_wired(&self) -> bool {
        true
    }

    // Restored devices are re-registered by the snapshot codec.
    fn relink(&mut self, _offer: &Offer<'_>) {}

    fn is_relinked(&self) -> bool {
        true
    }

    fn save_state(&self, _out: &mut dyn Write) -> SimResult<()> {
        Ok(())
    }

    fn load_state(&mut self, _input: &mut dyn Read) -> SimResult<()> {
        self.clear();
        Ok(())
    }
}

impl ComponentType for IoPortHandler {
    const TYPE_NAME: &'static str = "machina.bus.IoPortHandler";
}
