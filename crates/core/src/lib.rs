// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod codec;
pub mod component;
pub mod cpu;
pub mod decoder;
pub mod dispatch;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod registry;
pub mod snapshot;
pub mod wiring;

mod tests;

pub use component::{Component, ComponentRef, ComponentType, Linkage, Offer, Pollable};
pub use registry::ComponentRegistry;

use crate::bus::IoPortHandler;
use crate::cpu::{Delivery, Processor, ProcessorFault, ProcessorMode};
use crate::dispatch::{DispatchEnd, Dispatcher};
use crate::memory::{AddressSpace, ProgramImage};
use crate::peripherals::keyboard::Keyboard;
use crate::peripherals::network::NetworkCard;
use crate::peripherals::pic::InterruptController;
use crate::peripherals::pit::IntervalTimer;
use crate::snapshot::{RestoreReport, RestoreTable, SnapshotError};
use crate::wiring::WiringError;
use machina_config::{ExecutionConfig, MachineConfig, WiringConfig};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::Arc;

const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("Component state I/O error: {0}")]
    StateIo(#[from] std::io::Error),
    #[error("Corrupt component state: {0}")]
    CorruptState(&'static str),
    #[error("Machine has no {0} component")]
    MissingComponent(&'static str),
    #[error("Machine is invalid and refuses to execute")]
    MachineInvalid,
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error("Invalid machine configuration: {0}")]
    Config(String),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing simulation events in a modular way.
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_simulation_start(&self) {}
    fn on_simulation_stop(&self) {}
    fn on_dispatch_start(&self, _mode: ProcessorMode) {}
    fn on_block(&self, _mode: ProcessorMode, _retired: u64) {}
    fn on_interrupt_check(&self, _delivery: Delivery) {}
    fn on_fault(&self, _fault: ProcessorFault) {}
    fn on_mode_switch(&self, _from: ProcessorMode, _to: ProcessorMode) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Ready,
    /// A restore could not be undone; the machine refuses to execute.
    Invalid,
}

/// A wired set of components plus the dispatcher that drives them.
#[derive(Debug)]
pub struct Machine {
    registry: ComponentRegistry,
    restore_table: RestoreTable,
    dispatcher: Dispatcher,
    observers: Vec<Arc<dyn SimulationObserver>>,
    wiring: WiringConfig,
    wiring_rounds: u32,
    state: MachineState,
}

impl Machine {
    /// Wire `registry` and build a dispatcher over its processor and address space.
    pub fn new(
        mut registry: ComponentRegistry,
        execution: &ExecutionConfig,
        limits: &WiringConfig,
    ) -> SimResult<Self> {
        let report = wiring::wire(&mut registry, limits.max_rounds)?;
        let cpu = registry
            .find::<Processor>()
            .ok_or(SimulationError::MissingComponent(Processor::TYPE_NAME))?;
        let space = registry
            .find::<AddressSpace>()
            .ok_or(SimulationError::MissingComponent(AddressSpace::TYPE_NAME))?;
        let dispatcher = Dispatcher::new(execution.clone(), cpu, space, registry.pollables());

        tracing::info!(
            "Machine wired: {} components in {} rounds",
            registry.len(),
            report.rounds
        );
        Ok(Self {
            registry,
            restore_table: RestoreTable::standard(),
            dispatcher,
            observers: Vec::new(),
            wiring: limits.clone(),
            wiring_rounds: report.rounds,
            state: MachineState::Ready,
        })
    }

    /// The reference PC described by `config`.
    pub fn standard(config: &MachineConfig) -> SimResult<Self> {
        let memory = config
            .memory_bytes()
            .map_err(|e| SimulationError::Config(e.to_string()))?;
        let memory = usize::try_from(memory)
            .map_err(|_| SimulationError::Config(format!("memory size {memory} is too large")))?;

        let mut registry = ComponentRegistry::new();
        let cpu = registry.add(Processor::new());
        {
            let mut cpu = cpu.borrow_mut();
            cpu.set_reset_vector(config.entry());
            cpu.reset();
        }
        registry.add(AddressSpace::new(memory, config.execution.max_block_len));
        registry.add(IoPortHandler::new());
        registry.add(IntervalTimer::new());
        registry.add(InterruptController::new());
        if config.devices.keyboard {
            registry.add(Keyboard::new());
        }
        if let Some(net) = &config.devices.network {
            let mac = match &net.mac {
                Some(mac) => machina_config::parse_mac(mac)
                    .map_err(|e| SimulationError::Config(e.to_string()))?,
                None => DEFAULT_MAC,
            };
            registry.add(NetworkCard::new(net.io_base, net.irq, mac));
        }

        tracing::info!("Building machine '{}' with {} bytes of RAM", config.name, memory);
        Self::new(registry, &config.execution, &config.wiring)
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn wiring_rounds(&self) -> u32 {
        self.wiring_rounds
    }

    pub fn restore_table_mut(&mut self) -> &mut RestoreTable {
        &mut self.restore_table
    }

    pub fn component<T: ComponentType>(&self) -> Option<Rc<RefCell<T>>> {
        self.registry.find::<T>()
    }

    pub fn processor(&self) -> SimResult<Rc<RefCell<Processor>>> {
        self.component::<Processor>()
            .ok_or(SimulationError::MissingComponent(Processor::TYPE_NAME))
    }

    pub fn address_space(&self) -> SimResult<Rc<RefCell<AddressSpace>>> {
        self.component::<AddressSpace>()
            .ok_or(SimulationError::MissingComponent(AddressSpace::TYPE_NAME))
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SimulationObserver>) {
        self.observers.push(observer.clone());
        self.dispatcher.add_observer(observer);
    }

    pub fn last_dispatch_end(&self) -> Option<DispatchEnd> {
        self.dispatcher.last_end()
    }

    /// Copy `image` into guest memory and point the processor at its entry.
    pub fn load_image(&mut self, image: &ProgramImage) -> SimResult<()> {
        self.address_space()?.borrow_mut().load_image(image)?;
        for observer in &self.observers {
            observer.on_simulation_start();
        }
        self.set_entry(image.entry_point)
    }

    pub fn set_entry(&mut self, eip: u32) -> SimResult<()> {
        let cpu = self.processor()?;
        let mut cpu = cpu.borrow_mut();
        cpu.set_reset_vector(eip);
        cpu.eip = eip;
        Ok(())
    }

    /// Power-cycle every component. Wiring is kept.
    pub fn reset(&mut self) {
        for component in self.registry.iter() {
            component.component().borrow_mut().reset();
        }
        tracing::info!("Machine reset");
    }

    /// Halted with interrupts masked; further dispatching cannot make progress.
    pub fn is_stopped(&self) -> bool {
        match self.processor() {
            Ok(cpu) => {
                let cpu = cpu.borrow();
                cpu.is_stopped()
            }
            Err(_) => true,
        }
    }

    /// One dispatcher invocation. Returns the number of instructions retired.
    pub fn execute(&mut self) -> SimResult<u64> {
        if self.state == MachineState::Invalid {
            return Err(SimulationError::MachineInvalid);
        }
        self.dispatcher.execute()
    }

    pub fn save_snapshot(&self, out: &mut dyn Write) -> Result<usize, SnapshotError> {
        snapshot::save(&self.registry, out)
    }

    /// Restore from `input`. A failure that cannot be rolled back invalidates the machine.
    pub fn load_snapshot(&mut self, input: &mut dyn Read) -> Result<RestoreReport, SnapshotError> {
        match snapshot::load(
            &mut self.registry,
            &self.restore_table,
            input,
            self.wiring.max_rounds,
        ) {
            Ok(report) => {
                self.dispatcher.set_pollables(self.registry.pollables());
                self.state = MachineState::Ready;
                Ok(report)
            }
            Err(err) => {
                if err.invalidates_machine() {
                    tracing::error!("Machine invalidated by failed restore: {}", err);
                    self.state = MachineState::Invalid;
                }
                Err(err)
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        for observer in &self.observers {
            observer.on_simulation_stop();
        }
    }
}
