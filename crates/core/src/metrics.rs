// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cpu::{Delivery, ProcessorFault, ProcessorMode};
use crate::SimulationObserver;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PerformanceMetrics {
    instruction_count: AtomicU64,
    block_count: AtomicU64,
    interrupt_checks: AtomicU64,
    interrupts_delivered: AtomicU64,
    fault_count: AtomicU64,
    mode_switches: AtomicU64,
    dispatches: [AtomicU64; 3],
    start_time: Instant,
}

/// Point-in-time copy of the counters, for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub instructions: u64,
    pub blocks: u64,
    pub interrupt_checks: u64,
    pub interrupts_delivered: u64,
    pub faults: u64,
    pub mode_switches: u64,
    pub real_mode_dispatches: u64,
    pub protected_mode_dispatches: u64,
    pub vm86_mode_dispatches: u64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn mode_index(mode: ProcessorMode) -> usize {
    match mode {
        ProcessorMode::Real => 0,
        ProcessorMode::Protected => 1,
        ProcessorMode::Virtual8086 => 2,
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            instruction_count: AtomicU64::new(0),
            block_count: AtomicU64::new(0),
            interrupt_checks: AtomicU64::new(0),
            interrupts_delivered: AtomicU64::new(0),
            fault_count: AtomicU64::new(0),
            mode_switches: AtomicU64::new(0),
            dispatches: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            start_time: Instant::now(),
        }
    }

    pub fn reset(&self) {
        self.instruction_count.store(0, Ordering::SeqCst);
        self.block_count.store(0, Ordering::SeqCst);
        self.interrupt_checks.store(0, Ordering::SeqCst);
        self.interrupts_delivered.store(0, Ordering::SeqCst);
        self.fault_count.store(0, Ordering::SeqCst);
        self.mode_switches.store(0, Ordering::SeqCst);
        for counter in &self.dispatches {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn get_instructions(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn get_blocks(&self) -> u64 {
        self.block_count.load(Ordering::SeqCst)
    }

    pub fn get_interrupt_checks(&self) -> u64 {
        self.interrupt_checks.load(Ordering::SeqCst)
    }

    pub fn get_faults(&self) -> u64 {
        self.fault_count.load(Ordering::SeqCst)
    }

    pub fn get_mode_switches(&self) -> u64 {
        self.mode_switches.load(Ordering::SeqCst)
    }

    pub fn get_dispatches(&self, mode: ProcessorMode) -> u64 {
        self.dispatches[mode_index(mode)].load(Ordering::SeqCst)
    }

    pub fn get_ips(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.get_instructions() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instructions: self.get_instructions(),
            blocks: self.get_blocks(),
            interrupt_checks: self.get_interrupt_checks(),
            interrupts_delivered: self.interrupts_delivered.load(Ordering::SeqCst),
            faults: self.get_faults(),
            mode_switches: self.get_mode_switches(),
            real_mode_dispatches: self.get_dispatches(ProcessorMode::Real),
            protected_mode_dispatches: self.get_dispatches(ProcessorMode::Protected),
            vm86_mode_dispatches: self.get_dispatches(ProcessorMode::Virtual8086),
        }
    }
}

impl SimulationObserver for PerformanceMetrics {
    fn on_dispatch_start(&self, mode: ProcessorMode) {
        self.dispatches[mode_index(mode)].fetch_add(1, Ordering::SeqCst);
    }

    fn on_block(&self, _mode: ProcessorMode, retired: u64) {
        self.block_count.fetch_add(1, Ordering::SeqCst);
        self.instruction_count.fetch_add(retired, Ordering::SeqCst);
    }

    fn on_interrupt_check(&self, delivery: Delivery) {
        self.interrupt_checks.fetch_add(1, Ordering::SeqCst);
        if matches!(
            delivery,
            Delivery::Delivered { .. } | Delivery::ModeSwitch { .. }
        ) {
            self.interrupts_delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_fault(&self, _fault: ProcessorFault) {
        self.fault_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_mode_switch(&self, _from: ProcessorMode, _to: ProcessorMode) {
        self.mode_switches.fetch_add(1, Ordering::SeqCst);
    }
}
