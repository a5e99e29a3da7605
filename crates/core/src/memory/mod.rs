// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{Component, ComponentType, Offer};
use crate::cpu::{BlockExit, BlockOutcome, Processor, ProcessorMode, Step};
use crate::decoder::{self, Decoded};
use crate::{SimResult, SimulationError};
use machina_config::ExecutionBackend;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

const A20_BIT: u32 = 1 << 20;
const MAX_MEMORY_PAYLOAD: usize = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start_addr: u32,
    pub data: Vec<u8>,
}

/// A guest image to be copied into physical memory before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramImage {
    pub entry_point: u32,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry_point: u32) -> Self {
        Self {
            entry_point,
            segments: Vec::new(),
        }
    }

    pub fn add_segment(&mut self, start_addr: u32, data: Vec<u8>) {
        self.segments.push(Segment { start_addr, data });
    }
}

/// Flat guest RAM starting at physical address zero, behind the A20 gate.
#[derive(Debug)]
pub struct PhysicalMemory {
    data: Vec<u8>,
    a20: Rc<Cell<bool>>,
    generation: u64,
}

impl PhysicalMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            a20: Rc::new(Cell::new(true)),
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bumped on every write; decoded block caches compare against it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20.get()
    }

    fn translate(&self, addr: u32) -> SimResult<usize> {
        let addr = if self.a20.get() { addr } else { addr & !A20_BIT };
        let idx = addr as usize;
        if idx < self.data.len() {
            Ok(idx)
        } else {
            Err(SimulationError::MemoryViolation(u64::from(addr)))
        }
    }

    pub fn read_u8(&self, addr: u32) -> SimResult<u8> {
        Ok(self.data[self.translate(addr)?])
    }

    pub fn read_u16(&self, addr: u32) -> SimResult<u16> {
        let b0 = self.read_u8(addr)? as u16;
        let b1 = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(b0 | (b1 << 8))
    }

    pub fn read_u32(&self, addr: u32) -> SimResult<u32> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> SimResult<()> {
        let idx = self.translate(addr)?;
        self.data[idx] = value;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr.wrapping_add(1), (value >> 8) as u8)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> SimResult<()> {
        self.write_u16(addr, (value & 0xFFFF) as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> SimResult<()> {
        let start = addr as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(SimulationError::MemoryViolation(u64::from(addr)))?;
        self.data[start..end].copy_from_slice(bytes);
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> SimResult<&[u8]> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(SimulationError::MemoryViolation(u64::from(addr)))?;
        Ok(&self.data[start..end])
    }
}

#[derive(Debug)]
struct CachedBlock {
    generation: u64,
    /// A20 state the block was decoded under; toggling it remaps the bytes behind EIP.
    a20: bool,
    instructions: Vec<Decoded>,
}

impl CachedBlock {
    fn is_current(&self, memory: &PhysicalMemory) -> bool {
        self.generation == memory.generation() && self.a20 == memory.a20_enabled()
    }
}

/// Physical address space component: guest RAM plus basic-block execution.
#[derive(Debug)]
pub struct AddressSpace {
    memory: PhysicalMemory,
    max_block_len: u32,
    cache: HashMap<(ProcessorMode, u32), CachedBlock>,
}

impl AddressSpace {
    pub fn new(size: usize, max_block_len: u32) -> Self {
        Self {
            memory: PhysicalMemory::new(size),
            max_block_len: max_block_len.max(1),
            cache: HashMap::new(),
        }
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    /// Shared gate line; holders may flip it without borrowing the address space.
    pub fn a20_line(&self) -> Rc<Cell<bool>> {
        self.memory.a20.clone()
    }

    pub fn load_image(&mut self, image: &ProgramImage) -> SimResult<()> {
        for segment in &image.segments {
            self.memory.write_bytes(segment.start_addr, &segment.data)?;
            tracing::debug!(
                "Loaded {} bytes at {:#x}",
                segment.data.len(),
                segment.start_addr
            );
        }
        Ok(())
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Execute one basic block starting at the processor's current EIP.
    pub fn execute_block(
        &mut self,
        mode: ProcessorMode,
        backend: ExecutionBackend,
        cpu: &mut Processor,
    ) -> SimResult<BlockOutcome> {
        if cpu.is_halted() {
            return Ok(BlockOutcome {
                retired: 0,
                exit: BlockExit::Halted,
            });
        }

        let start = cpu.eip;
        let cached = match backend {
            ExecutionBackend::Interpreter => None,
            ExecutionBackend::Compiled => Some(self.compile(mode, start)),
        };

        let mut retired = 0u64;
        let mut index = 0usize;
        loop {
            let decoded = match &cached {
                Some(block)
                    if block.is_current(&self.memory) && index < block.instructions.len() =>
                {
                    block.instructions[index]
                }
                _ => decoder::decode(mode, &self.memory, cpu.eip)?,
            };
            index += 1;

            let exit = match cpu.execute(mode, &mut self.memory, &decoded)? {
                Step::Next if retired + 1 < u64::from(self.max_block_len) => {
                    retired += 1;
                    continue;
                }
                Step::Next | Step::EndBlock => {
                    retired += 1;
                    BlockExit::Continue
                }
                Step::Halt => {
                    retired += 1;
                    BlockExit::Halted
                }
                Step::ModeSwitch(to) => {
                    retired += 1;
                    BlockExit::ModeSwitch(to)
                }
                Step::Fault(fault) => BlockExit::Fault(fault),
            };

            if let Some(block) = cached {
                self.cache.insert((mode, start), block);
            }
            return Ok(BlockOutcome { retired, exit });
        }
    }

    /// Decoded form of the block at `start`, reusing the cache while memory and A20 are unchanged.
    fn compile(&mut self, mode: ProcessorMode, start: u32) -> CachedBlock {
        if let Some(block) = self.cache.remove(&(mode, start)) {
            if block.is_current(&self.memory) {
                return block;
            }
        }

        let mut instructions = Vec::new();
        let mut eip = start;
        while instructions.len() < self.max_block_len as usize {
            // Stop at the first undecodable byte; the interpreter path reports it when reached.
            let Ok(decoded) = decoder::decode(mode, &self.memory, eip) else {
                break;
            };
            instructions.push(decoded);
            if decoded.instruction.ends_block() {
                break;
            }
            eip = eip.wrapping_add(u32::from(decoded.len));
        }
        tracing::debug!(
            "Compiled block {:?}@{:#x}: {} instructions",
            mode,
            start,
            instructions.len()
        );
        CachedBlock {
            generation: self.memory.generation(),
            a20: self.memory.a20_enabled(),
            instructions,
        }
    }
}

impl Component for AddressSpace {
    fn reset(&mut self) {
        self.memory.a20.set(true);
        self.cache.clear();
    }

    fn accept(&mut self, _offer: &Offer<'_>) {}

    fn is_wired(&self) -> bool {
        true
    }

    fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
        out.write_bool(self.memory.a20.get())?;
        out.write_u32_le(self.max_block_len)?;
        out.write_len_prefixed_bytes_u32(&self.memory.data)?;
        Ok(())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
        let a20 = input.read_bool()?;
        let max_block_len = input.read_u32_le()?;
        let data = input.read_len_prefixed_bytes_u32(MAX_MEMORY_PAYLOAD)?;
        if data.len() != self.memory.data.len() {
            return Err(SimulationError::CorruptState("guest RAM size mismatch"));
        }
        // The gate handle is shared with other devices, so update it in place.
        self.memory.a20.set(a20);
        self.memory.data = data;
        self.memory.generation = self.memory.generation.wrapping_add(1);
        self.max_block_len = max_block_len.max(1);
        self.cache.clear();
        Ok(())
    }
}

impl ComponentType for AddressSpace {
    const TYPE_NAME: &'static str = "machina.memory.AddressSpace";
}
