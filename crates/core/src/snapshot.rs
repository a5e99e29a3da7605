// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Labeled-entry snapshot container.
//!
//! ```text
//! magic "MACHSNAP" | u16 version | u16 reserved | u32 entry count
//! entry: u16 label len | label (utf-8, "<type-name>#<n>") | u32 payload len | payload
//! ```
//!
//! All integers are little-endian. Payloads are opaque to the container; each one is the
//! owning component's own serialization.

use crate::bus::IoPortHandler;
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::component::{ComponentRef, ComponentType};
use crate::cpu::Processor;
use crate::memory::AddressSpace;
use crate::peripherals::keyboard::Keyboard;
use crate::peripherals::network::NetworkCard;
use crate::peripherals::pic::InterruptController;
use crate::peripherals::pit::IntervalTimer;
use crate::registry::ComponentRegistry;
use crate::wiring::{self, WiringError};
use crate::SimulationError;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

pub const MAGIC: &[u8; 8] = b"MACHSNAP";
pub const VERSION: u16 = 1;

const MAX_ENTRIES: u32 = 4096;
const MAX_LABEL_LEN: usize = 256;
const MAX_PAYLOAD_LEN: usize = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is truncated")]
    Truncated,
    #[error("not a machine snapshot (bad magic)")]
    InvalidMagic,
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
    #[error("malformed entry label {0:?}")]
    MalformedLabel(String),
    #[error("duplicate entry label {0}")]
    DuplicateLabel(String),
    #[error("failed to save {label}: {source}")]
    Save {
        label: String,
        source: SimulationError,
    },
    #[error("failed to restore {label}: {source}")]
    Restore {
        label: String,
        source: SimulationError,
    },
    #[error("relink after restore failed: {0}")]
    Relink(#[from] WiringError),
    #[error("rolling back {label} failed: {source}")]
    RollbackFailed {
        label: String,
        source: SimulationError,
    },
}

impl SnapshotError {
    /// Whether the machine was left in a state that must not execute.
    pub fn invalidates_machine(&self) -> bool {
        matches!(
            self,
            SnapshotError::RollbackFailed { .. } | SnapshotError::Relink(_)
        )
    }
}

fn map_eof(err: io::Error) -> SnapshotError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SnapshotError::Truncated
    } else {
        SnapshotError::Io(err)
    }
}

/// One labeled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub label: String,
    pub payload: Vec<u8>,
}

impl SnapshotEntry {
    pub fn type_name(&self) -> &str {
        split_label(&self.label).map_or("", |(name, _)| name)
    }

    pub fn index(&self) -> u32 {
        split_label(&self.label).map_or(0, |(_, n)| n)
    }
}

fn split_label(label: &str) -> Option<(&str, u32)> {
    let (name, index) = label.rsplit_once('#')?;
    if name.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((name, index.parse().ok()?))
}

pub fn write_container(entries: &[SnapshotEntry], out: &mut dyn Write) -> Result<(), SnapshotError> {
    let count = u32::try_from(entries.len()).map_err(|_| SnapshotError::Corrupt("too many entries"))?;
    out.write_all(MAGIC)?;
    out.write_u16_le(VERSION)?;
    out.write_u16_le(0)?;
    out.write_u32_le(count)?;
    for entry in entries {
        let label_len = u16::try_from(entry.label.len())
            .map_err(|_| SnapshotError::MalformedLabel(entry.label.clone()))?;
        out.write_u16_le(label_len)?;
        out.write_all(entry.label.as_bytes())?;
        out.write_len_prefixed_bytes_u32(&entry.payload)?;
    }
    out.flush()?;
    Ok(())
}

/// Parse and validate a whole container without touching any component.
pub fn read_container(input: &mut dyn Read) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).map_err(map_eof)?;
    if &magic != MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = input.read_u16_le().map_err(map_eof)?;
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: version,
            expected: VERSION,
        });
    }
    let _reserved = input.read_u16_le().map_err(map_eof)?;
    let count = input.read_u32_le().map_err(map_eof)?;
    if count > MAX_ENTRIES {
        return Err(SnapshotError::Corrupt("entry count out of range"));
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let label_len = input.read_u16_le().map_err(map_eof)? as usize;
        let label = input
            .read_exact_vec(label_len, MAX_LABEL_LEN)
            .map_err(map_eof)?;
        let label = String::from_utf8(label)
            .map_err(|e| SnapshotError::MalformedLabel(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        if split_label(&label).is_none() {
            return Err(SnapshotError::MalformedLabel(label));
        }
        if !seen.insert(label.clone()) {
            return Err(SnapshotError::DuplicateLabel(label));
        }
        let payload = input
            .read_len_prefixed_bytes_u32(MAX_PAYLOAD_LEN)
            .map_err(map_eof)?;
        entries.push(SnapshotEntry { label, payload });
    }

    let mut trailing = [0u8; 1];
    if input.read(&mut trailing)? != 0 {
        return Err(SnapshotError::Corrupt("trailing bytes after last entry"));
    }
    Ok(entries)
}

/// Write every registry member, in registry order.
pub fn save(registry: &ComponentRegistry, out: &mut dyn Write) -> Result<usize, SnapshotError> {
    let mut entries = Vec::with_capacity(registry.len());
    for (component, label) in registry.iter().zip(registry.labels()) {
        let mut payload = Vec::new();
        if let Err(source) = component.component().borrow().save_state(&mut payload) {
            return Err(SnapshotError::Save { label, source });
        }
        debug!("Snapshot entry {}: {} bytes", label, payload.len());
        entries.push(SnapshotEntry { label, payload });
    }
    write_container(&entries, out)?;
    info!("Saved snapshot with {} entries", entries.len());
    Ok(entries.len())
}

type Locate = fn(&ComponentRegistry) -> Option<(ComponentRef, usize)>;
type PostRestore = fn(&ComponentRef, &ComponentRegistry);

#[derive(Clone, Copy)]
struct RestoreHooks {
    locate: Locate,
    post_restore: Option<PostRestore>,
}

fn locate_first<T: ComponentType>(registry: &ComponentRegistry) -> Option<(ComponentRef, usize)> {
    registry.find_by_type_name(T::TYPE_NAME)
}

/// Type name -> restore hooks, built once at startup.
#[derive(Clone, Default)]
pub struct RestoreTable {
    hooks: HashMap<&'static str, RestoreHooks>,
}

impl std::fmt::Debug for RestoreTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.hooks.keys().collect();
        names.sort();
        f.debug_struct("RestoreTable").field("types", &names).finish()
    }
}

impl RestoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every component type this crate ships.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register::<Processor>();
        table.register::<AddressSpace>();
        table.register::<InterruptController>();
        table.register::<IntervalTimer>();
        table.register::<IoPortHandler>();
        table.register::<Keyboard>();
        table.register::<NetworkCard>();
        table
    }

    pub fn register<T: ComponentType>(&mut self) {
        self.hooks.insert(
            T::TYPE_NAME,
            RestoreHooks {
                locate: locate_first::<T>,
                post_restore: None,
            },
        );
    }

    /// Register `T` with a hook run after its payload has been applied.
    pub fn register_with_hook<T: ComponentType>(&mut self, hook: PostRestore) {
        self.hooks.insert(
            T::TYPE_NAME,
            RestoreHooks {
                locate: locate_first::<T>,
                post_restore: Some(hook),
            },
        );
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.hooks.contains_key(type_name)
    }

    fn get(&self, type_name: &str) -> Option<RestoreHooks> {
        self.hooks.get(type_name).copied()
    }
}

/// What a successful load did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
    pub retained: Vec<String>,
    pub relink_rounds: u32,
}

/// Re-register every port-capable member with the shared dispatch table.
fn reregister_io_ports(registry: &ComponentRegistry) {
    let Some(handler) = registry.find::<IoPortHandler>() else {
        warn!("No I/O port handler present; port devices stay unregistered");
        return;
    };
    let mut handler = handler.borrow_mut();
    let registered = registry
        .iter()
        .filter(|component| handler.register_component(component))
        .count();
    debug!("Re-registered {} port devices", registered);
}

/// Restore `registry` from a container, then relink it.
///
/// On a payload error every component already overwritten is put back from an in-memory
/// backup before the error is returned.
pub fn load(
    registry: &mut ComponentRegistry,
    table: &RestoreTable,
    input: &mut dyn Read,
    max_rounds: u32,
) -> Result<RestoreReport, SnapshotError> {
    let entries = read_container(input)?;
    let mut report = RestoreReport::default();

    let mut plan: Vec<(ComponentRef, &SnapshotEntry, Option<PostRestore>)> = Vec::new();
    for entry in &entries {
        let type_name = entry.type_name();
        let Some(hooks) = table.get(type_name) else {
            warn!("Skipping snapshot entry {}: unknown component type", entry.label);
            report.skipped.push(entry.label.clone());
            continue;
        };
        let Some((component, count)) = (hooks.locate)(registry) else {
            warn!("Skipping snapshot entry {}: no such component in this machine", entry.label);
            report.skipped.push(entry.label.clone());
            continue;
        };
        if plan.iter().any(|(c, _, _)| c.ptr_eq(&component)) {
            warn!(
                "Skipping snapshot entry {}: {} was already restored from an earlier entry",
                entry.label, type_name
            );
            report.skipped.push(entry.label.clone());
            continue;
        }
        if count > 1 {
            warn!(
                "{} instances of {} present; restoring {} into the first",
                count, type_name, entry.label
            );
        }
        plan.push((component, entry, hooks.post_restore));
    }

    let mut backups = Vec::with_capacity(plan.len());
    for (component, entry, _) in &plan {
        let mut backup = Vec::new();
        if let Err(source) = component.component().borrow().save_state(&mut backup) {
            return Err(SnapshotError::Save {
                label: entry.label.clone(),
                source,
            });
        }
        backups.push(backup);
    }

    for (applied, (component, entry, _)) in plan.iter().enumerate() {
        if let Err(source) = apply(component, &entry.payload) {
            warn!("Restoring {} failed ({}); rolling back", entry.label, source);
            for ((component, entry, _), backup) in plan[..=applied].iter().zip(&backups) {
                if let Err(source) = apply(component, backup) {
                    return Err(SnapshotError::RollbackFailed {
                        label: entry.label.clone(),
                        source,
                    });
                }
            }
            // Restoring the port handler's backup empties its table.
            reregister_io_ports(registry);
            return Err(SnapshotError::Restore {
                label: entry.label.clone(),
                source,
            });
        }
        debug!("Restored {}", entry.label);
    }

    for (component, _, hook) in &plan {
        if let Some(hook) = hook {
            hook(component, registry);
        }
    }
    reregister_io_ports(registry);

    let restored: Vec<ComponentRef> = plan.iter().map(|(c, _, _)| c.clone()).collect();
    report.restored = plan.iter().map(|(_, e, _)| e.label.clone()).collect();
    for component in registry.reorder_restored(&restored) {
        warn!(
            "{} has no entry in the snapshot; keeping its current state",
            component.type_name()
        );
        report.retained.push(component.type_name().to_string());
    }

    let relink = wiring::relink(registry, max_rounds)?;
    report.relink_rounds = relink.rounds;
    info!(
        "Restored {} components ({} skipped, {} retained), relinked in {} rounds",
        report.restored.len(),
        report.skipped.len(),
        report.retained.len(),
        report.relink_rounds
    );
    Ok(report)
}

/// Feed `payload` to `component`, requiring it to be consumed exactly.
fn apply(component: &ComponentRef, payload: &[u8]) -> Result<(), SimulationError> {
    let mut reader = payload;
    component.component().borrow_mut().load_state(&mut reader)?;
    if !reader.is_empty() {
        return Err(SimulationError::CorruptState("trailing bytes in component payload"));
    }
    Ok(())
}
