// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::Parser;
use machina_config::MachineConfig;
use machina_core::cpu::ProcessorMode;
use machina_core::memory::ProgramImage;
use machina_core::metrics::{MetricsSnapshot, PerformanceMetrics};
use machina_core::Machine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw guest image, copied to the configured load address
    #[arg(short, long)]
    image: PathBuf,

    /// Path to the machine description (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of dispatcher invocations
    #[arg(long, default_value = "1000")]
    max_dispatches: u64,

    /// Restore this snapshot before running
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Write a snapshot here after running
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Write a JSON run report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable per-block execution tracing
    #[arg(short, long)]
    trace: bool,
}

#[derive(Debug, Serialize)]
struct RunReport {
    machine: String,
    instructions: u64,
    dispatches: u64,
    mode: ProcessorMode,
    eip: u32,
    halted: bool,
    stopped: bool,
    metrics: MetricsSnapshot,
    snapshot_sha256: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    info!("Starting Machina");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<MachineConfig> {
    match &args.config {
        Some(path) => {
            info!("Loading machine config: {:?}", path);
            MachineConfig::from_file(path)
        }
        None => {
            info!("Using default machine configuration");
            Ok(MachineConfig::default())
        }
    }
}

fn run(args: &Args, config: &MachineConfig) -> anyhow::Result<()> {
    let mut machine = Machine::standard(config).context("Failed to build machine")?;
    let metrics = Arc::new(PerformanceMetrics::new());
    machine.add_observer(metrics.clone());

    info!("Loading image: {:?}", args.image);
    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("Failed to read image {:?}", args.image))?;
    let mut image = ProgramImage::new(config.entry());
    image.add_segment(config.load_address, bytes);
    machine
        .load_image(&image)
        .context("Failed to load image into guest memory")?;
    info!("Entry Point: {:#x}", image.entry_point);

    if let Some(path) = &args.restore {
        info!("Restoring snapshot: {:?}", path);
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open snapshot {:?}", path))?;
        let report = machine
            .load_snapshot(&mut std::io::BufReader::new(file))
            .with_context(|| format!("Failed to restore snapshot {:?}", path))?;
        info!(
            "Restored {} components, skipped {}",
            report.restored.len(),
            report.skipped.len()
        );
    }

    let mut dispatches = 0;
    while dispatches < args.max_dispatches && !machine.is_stopped() {
        machine.execute()?;
        dispatches += 1;
    }
    if machine.is_stopped() {
        info!("Processor halted with interrupts disabled");
    }

    let snapshot_sha256 = match &args.snapshot {
        Some(path) => {
            let mut buf = Vec::new();
            machine.save_snapshot(&mut buf)?;
            std::fs::write(path, &buf)
                .with_context(|| format!("Failed to write snapshot {:?}", path))?;
            info!("Snapshot written to {:?} ({} bytes)", path, buf.len());
            Some(format!("{:x}", Sha256::digest(&buf)))
        }
        None => None,
    };

    let cpu = machine.processor()?;
    let cpu = cpu.borrow();
    let report = RunReport {
        machine: config.name.clone(),
        instructions: metrics.get_instructions(),
        dispatches,
        mode: cpu.mode(),
        eip: cpu.eip,
        halted: cpu.is_halted(),
        stopped: cpu.is_stopped(),
        metrics: metrics.snapshot(),
        snapshot_sha256,
    };
    info!(
        "Finished after {} dispatches: {} instructions ({:.0} IPS), {:?} mode, EIP={:#x}",
        report.dispatches,
        report.instructions,
        metrics.get_ips(),
        report.mode,
        report.eip
    );

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
    }

    Ok(())
}
