// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Bounded fixpoint wiring.
//!
//! Every round, each component that is not yet wired is offered every member of the
//! registry, itself included. Readiness of an offered component is frozen at the start
//! of the round, so the round in which a component wires depends only on the shape of
//! the dependency graph and never on registry order.

use crate::component::{Linkage, Offer};
use crate::registry::ComponentRegistry;
use tracing::{debug, info};

pub const DEFAULT_MAX_ROUNDS: u32 = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WiringError {
    #[error("{linkage:?} pass did not converge after {rounds} rounds; unwired: {}", .unwired.join(", "))]
    Unconverged {
        linkage: Linkage,
        rounds: u32,
        unwired: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringReport {
    pub linkage: Linkage,
    pub rounds: u32,
    /// Label of each component and the round in which it became wired.
    pub wired_at: Vec<(String, u32)>,
}

/// Run the construction-time pass.
pub fn wire(
    registry: &mut ComponentRegistry,
    max_rounds: u32,
) -> Result<WiringReport, WiringError> {
    run(registry, Linkage::Initialise, max_rounds)
}

/// Run the restore-time pass from a clean slate of relink flags.
pub fn relink(
    registry: &mut ComponentRegistry,
    max_rounds: u32,
) -> Result<WiringReport, WiringError> {
    registry.clear_relinked();
    run(registry, Linkage::Relink, max_rounds)
}

pub fn run(
    registry: &mut ComponentRegistry,
    linkage: Linkage,
    max_rounds: u32,
) -> Result<WiringReport, WiringError> {
    let labels = registry.labels();
    let mut wired_at = Vec::new();
    let mut rounds = 0;

    while rounds < max_rounds && !registry.entries().iter().all(|e| e.flag(linkage)) {
        rounds += 1;
        let ready: Vec<bool> = registry.entries().iter().map(|e| e.flag(linkage)).collect();
        let mut completed = Vec::new();

        for (i, entry) in registry.entries().iter().enumerate() {
            if ready[i] {
                continue;
            }
            let mut target = entry.component.component().borrow_mut();
            for (j, other) in registry.entries().iter().enumerate() {
                let offer = Offer::new(&other.component, ready[j]);
                match linkage {
                    Linkage::Initialise => target.accept(&offer),
                    Linkage::Relink => target.relink(&offer),
                }
            }
            let done = match linkage {
                Linkage::Initialise => target.is_wired(),
                Linkage::Relink => target.is_relinked(),
            };
            if done {
                completed.push(i);
            }
        }

        if completed.is_empty() {
            debug!("{:?} round {} made no progress", linkage, rounds);
            break;
        }
        for i in completed {
            registry.entries_mut()[i].set_flag(linkage, true);
            debug!("{:?}: {} ready in round {}", linkage, labels[i], rounds);
            wired_at.push((labels[i].clone(), rounds));
        }
    }

    let unwired: Vec<String> = registry
        .entries()
        .iter()
        .zip(&labels)
        .filter(|(e, _)| !e.flag(linkage))
        .map(|(_, label)| label.clone())
        .collect();

    if !unwired.is_empty() {
        return Err(WiringError::Unconverged {
            linkage,
            rounds,
            unwired,
        });
    }

    info!(
        "{:?} pass converged: {} components in {} rounds",
        linkage,
        registry.len(),
        rounds
    );
    Ok(WiringReport {
        linkage,
        rounds,
        wired_at,
    })
}
