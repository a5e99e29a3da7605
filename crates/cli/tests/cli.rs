// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("machina-tests-{}-{}", prefix, nonce));
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

fn machina(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_machina"))
        .args(args)
        .output()
        .expect("Failed to execute machina")
}

fn read_report(path: &PathBuf) -> serde_json::Value {
    let content = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[test]
fn test_cli_runs_until_halt() {
    let dir = temp_dir("halt");
    let image = dir.join("halt.bin");
    // mov ax, 0x42; cli; hlt
    std::fs::write(&image, [0xB8, 0x42, 0x00, 0xFA, 0xF4]).unwrap();
    let report = dir.join("report.json");

    let output = machina(&[
        "--image",
        image.to_str().unwrap(),
        "--report",
        report.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let report = read_report(&report);
    assert_eq!(report["instructions"], 3);
    assert_eq!(report["dispatches"], 1);
    assert_eq!(report["mode"], "real");
    assert_eq!(report["eip"], 0x7C05);
    assert_eq!(report["halted"], true);
    assert_eq!(report["stopped"], true);
    assert!(report["snapshot_sha256"].is_null());
    assert_eq!(report["metrics"]["real_mode_dispatches"], 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_snapshot_restore_round_trip() {
    let dir = temp_dir("snapshot");
    let image = dir.join("spin.bin");
    // mov ax, 0x1234; jmp $
    std::fs::write(&image, [0xB8, 0x34, 0x12, 0xEB, 0xFE]).unwrap();
    let first = dir.join("first.snap");
    let second = dir.join("second.snap");
    let report = dir.join("report.json");

    let output = machina(&[
        "--image",
        image.to_str().unwrap(),
        "--max-dispatches",
        "3",
        "--snapshot",
        first.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let output = machina(&[
        "--image",
        image.to_str().unwrap(),
        "--max-dispatches",
        "0",
        "--restore",
        first.to_str().unwrap(),
        "--snapshot",
        second.to_str().unwrap(),
        "--report",
        report.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    let report = read_report(&report);
    assert_eq!(report["eip"], 0x7C03);
    assert_eq!(report["snapshot_sha256"].as_str().unwrap().len(), 64);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_config_error_exit_code() {
    let dir = temp_dir("config");
    let image = dir.join("nop.bin");
    std::fs::write(&image, [0x90]).unwrap();
    let config = dir.join("machine.yaml");
    std::fs::write(&config, "name: broken\nexecution:\n  interrupt_check_threshold: 0\n").unwrap();

    let output = machina(&[
        "--image",
        image.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(2));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_missing_image_is_runtime_error() {
    let dir = temp_dir("missing");
    let image = dir.join("does-not-exist.bin");

    let output = machina(&["--image", image.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_corrupt_snapshot_is_rejected() {
    let dir = temp_dir("corrupt");
    let image = dir.join("nop.bin");
    std::fs::write(&image, [0x90]).unwrap();
    let snapshot = dir.join("bad.snap");
    std::fs::write(&snapshot, b"NOTASNAP").unwrap();

    let output = machina(&[
        "--image",
        image.to_str().unwrap(),
        "--restore",
        snapshot.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));

    let _ = std::fs::remove_dir_all(&dir);
}
