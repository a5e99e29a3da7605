// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Mode-dispatched execution loop.
//!
//! One call inspects the processor mode, runs the matching strategy for a bounded number
//! of basic blocks, and returns how many instructions retired. Interrupts are serviced and
//! pollable peripherals drained whenever more than `interrupt_check_threshold` instructions
//! have retired since the last check.

use crate::component::Pollable;
use crate::cpu::{BlockExit, Delivery, Processor, ProcessorFault, ProcessorMode};
use crate::memory::{AddressSpace, PhysicalMemory};
use crate::{SimResult, SimulationObserver};
use machina_config::ExecutionConfig;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Per-mode interrupt servicing and fault handling.
pub trait ModeStrategy {
    const MODE: ProcessorMode;

    fn service_interrupts(
        cpu: &mut Processor,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery>;

    fn handle_fault(
        cpu: &mut Processor,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery>;
}

pub struct RealMode;
pub struct ProtectedMode;
pub struct Virtual8086Mode;

impl ModeStrategy for RealMode {
    const MODE: ProcessorMode = ProcessorMode::Real;

    fn service_interrupts(
        cpu: &mut Processor,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.process_real_mode_interrupts(instructions, mem)
    }

    fn handle_fault(
        cpu: &mut Processor,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.handle_real_mode_fault(fault, mem)
    }
}

impl ModeStrategy for ProtectedMode {
    const MODE: ProcessorMode = ProcessorMode::Protected;

    fn service_interrupts(
        cpu: &mut Processor,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.process_protected_mode_interrupts(instructions, mem)
    }

    fn handle_fault(
        cpu: &mut Processor,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.handle_protected_mode_fault(fault, mem)
    }
}

impl ModeStrategy for Virtual8086Mode {
    const MODE: ProcessorMode = ProcessorMode::Virtual8086;

    fn service_interrupts(
        cpu: &mut Processor,
        instructions: u64,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.process_vm86_mode_interrupts(instructions, mem)
    }

    fn handle_fault(
        cpu: &mut Processor,
        fault: ProcessorFault,
        mem: &mut PhysicalMemory,
    ) -> SimResult<Delivery> {
        cpu.handle_vm86_mode_fault(fault, mem)
    }
}

/// Why the last invocation returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEnd {
    BlockLimit,
    Halted,
    ModeSwitch(ProcessorMode),
    Fault(ProcessorFault),
}

pub struct Dispatcher {
    config: ExecutionConfig,
    cpu: Rc<RefCell<Processor>>,
    space: Rc<RefCell<AddressSpace>>,
    pollables: Vec<Rc<RefCell<dyn Pollable>>>,
    observers: Vec<Arc<dyn SimulationObserver>>,
    last_end: Option<DispatchEnd>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("pollables", &self.pollables.len())
            .field("observers", &self.observers.len())
            .field("last_end", &self.last_end)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: ExecutionConfig,
        cpu: Rc<RefCell<Processor>>,
        space: Rc<RefCell<AddressSpace>>,
        pollables: Vec<Rc<RefCell<dyn Pollable>>>,
    ) -> Self {
        Self {
            config,
            cpu,
            space,
            pollables,
            observers: Vec::new(),
            last_end: None,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SimulationObserver>) {
        self.observers.push(observer);
    }

    pub fn set_pollables(&mut self, pollables: Vec<Rc<RefCell<dyn Pollable>>>) {
        self.pollables = pollables;
    }

    pub fn last_end(&self) -> Option<DispatchEnd> {
        self.last_end
    }

    /// Run one invocation in the processor's current mode.
    pub fn execute(&mut self) -> SimResult<u64> {
        let mode = self.cpu.borrow().mode();
        for observer in &self.observers {
            observer.on_dispatch_start(mode);
        }
        match mode {
            ProcessorMode::Real => self.run::<RealMode>(),
            ProcessorMode::Protected => self.run::<ProtectedMode>(),
            ProcessorMode::Virtual8086 => self.run::<Virtual8086Mode>(),
        }
    }

    fn run<S: ModeStrategy>(&mut self) -> SimResult<u64> {
        let threshold = self.config.interrupt_check_threshold;
        let mut instructions = 0u64;
        let mut since_check = 0u64;
        let mut end = DispatchEnd::BlockLimit;

        let mut cpu = self.cpu.borrow_mut();
        let mut space = self.space.borrow_mut();

        for _ in 0..self.config.max_blocks_per_dispatch {
            let outcome = space.execute_block(S::MODE, self.config.backend, &mut cpu)?;
            instructions += outcome.retired;
            since_check += outcome.retired;
            for observer in &self.observers {
                observer.on_block(S::MODE, outcome.retired);
            }

            match outcome.exit {
                BlockExit::Continue => {
                    if since_check <= threshold {
                        continue;
                    }
                    let delivery =
                        S::service_interrupts(&mut cpu, since_check, space.memory_mut())?;
                    since_check = 0;
                    self.after_check(delivery);
                    if cpu.mode() != S::MODE {
                        end = self.mode_switched(S::MODE, cpu.mode());
                        break;
                    }
                }
                BlockExit::Halted => {
                    // Let device time pass so a timer or host input can wake the processor.
                    // A halted processor retires nothing, so idle time is charged as at
                    // least one full check interval.
                    let delivery = S::service_interrupts(
                        &mut cpu,
                        since_check.max(threshold),
                        space.memory_mut(),
                    )?;
                    since_check = 0;
                    self.after_check(delivery);
                    if cpu.mode() != S::MODE {
                        end = self.mode_switched(S::MODE, cpu.mode());
                        break;
                    }
                    if cpu.is_halted() {
                        end = DispatchEnd::Halted;
                        break;
                    }
                }
                BlockExit::ModeSwitch(to) => {
                    end = self.mode_switched(S::MODE, to);
                    break;
                }
                BlockExit::Fault(fault) => {
                    for observer in &self.observers {
                        observer.on_fault(fault);
                    }
                    S::handle_fault(&mut cpu, fault, space.memory_mut())?;
                    if cpu.mode() != S::MODE {
                        self.mode_switched(S::MODE, cpu.mode());
                    }
                    end = DispatchEnd::Fault(fault);
                    break;
                }
            }
        }

        tracing::debug!(
            "{:?} dispatch: {} instructions, ended by {:?}",
            S::MODE,
            instructions,
            end
        );
        self.last_end = Some(end);
        Ok(instructions)
    }

    fn after_check(&self, delivery: Delivery) {
        for observer in &self.observers {
            observer.on_interrupt_check(delivery);
        }
        for pollable in &self.pollables {
            pollable.borrow_mut().poll();
        }
    }

    fn mode_switched(&self, from: ProcessorMode, to: ProcessorMode) -> DispatchEnd {
        tracing::debug!("Mode switch {:?} -> {:?}", from, to);
        for observer in &self.observers {
            observer.on_mode_switch(from, to);
        }
        DispatchEnd::ModeSwitch(to)
    }
}
