// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How guest basic blocks are turned into work.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    /// Decode every instruction each time it is executed.
    #[default]
    Interpreter,
    /// Decode a basic block once and replay the cached form until memory changes.
    Compiled,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub backend: ExecutionBackend,
    /// Instructions retired between interrupt/peripheral checks.
    pub interrupt_check_threshold: u64,
    /// Basic blocks executed per dispatcher invocation at most.
    pub max_blocks_per_dispatch: u32,
    /// Instructions decoded into a single basic block at most.
    pub max_block_len: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: ExecutionBackend::Interpreter,
            interrupt_check_threshold: 1000,
            max_blocks_per_dispatch: 100,
            max_block_len: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WiringConfig {
    pub max_rounds: u32,
}

impl Default for WiringConfig {
    fn default() -> Self {
        Self { max_rounds: 100 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_network_base")]
    pub io_base: u16,
    #[serde(default = "default_network_irq")]
    pub irq: u8,
    #[serde(default)]
    pub mac: Option<String>,
}

fn default_network_base() -> u16 {
    0x300
}

fn default_network_irq() -> u8 {
    9
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub keyboard: bool,
    pub network: Option<NetworkConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            keyboard: true,
            network: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub name: String,
    pub memory: String, // e.g. "1MB"
    pub load_address: u32,
    pub entry_point: Option<u32>,
    pub execution: ExecutionConfig,
    pub wiring: WiringConfig,
    pub devices: DeviceConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "pc".to_string(),
            memory: "1MiB".to_string(),
            load_address: 0x7C00,
            entry_point: None,
            execution: ExecutionConfig::default(),
            wiring: WiringConfig::default(),
            devices: DeviceConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("memory size must be greater than zero")]
    EmptyMemory,
    #[error("memory size {0} bytes exceeds the 4 GiB physical address space")]
    MemoryTooLarge(u64),
    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("entry point {entry:#x} lies outside of guest memory ({memory:#x} bytes)")]
    EntryOutOfRange { entry: u32, memory: u64 },
    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),
}

impl MachineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open machine config at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse Machine Config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn memory_bytes(&self) -> Result<u64> {
        parse_size(&self.memory)
    }

    /// Address execution starts at: the explicit entry point, else the load address.
    pub fn entry(&self) -> u32 {
        self.entry_point.unwrap_or(self.load_address)
    }

    pub fn validate(&self) -> Result<()> {
        let memory = self.memory_bytes()?;
        if memory == 0 {
            return Err(ConfigError::EmptyMemory.into());
        }
        if memory > u64::from(u32::MAX) + 1 {
            return Err(ConfigError::MemoryTooLarge(memory).into());
        }
        if self.execution.interrupt_check_threshold == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "execution.interrupt_check_threshold",
            }
            .into());
        }
        if self.execution.max_blocks_per_dispatch == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "execution.max_blocks_per_dispatch",
            }
            .into());
        }
        if self.execution.max_block_len == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "execution.max_block_len",
            }
            .into());
        }
        if self.wiring.max_rounds == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "wiring.max_rounds",
            }
            .into());
        }
        if u64::from(self.entry()) >= memory {
            return Err(ConfigError::EntryOutOfRange {
                entry: self.entry(),
                memory,
            }
            .into());
        }
        if let Some(net) = &self.devices.network {
            if let Some(mac) = &net.mac {
                parse_mac(mac)?;
            }
        }
        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

/// Parses `aa:bb:cc:dd:ee:ff` (or `-` separated) into raw bytes.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(ConfigError::InvalidMac(mac.to_string()).into());
    }
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| ConfigError::InvalidMac(mac.to_string()))?;
    }
    Ok(out)
}
