//! Integration tests for nimbus-vm.
//!
//! Most tests stand in a shell script for the system emulator so the
//! supervision logic runs anywhere with `/bin/sh`. The real-QEMU test
//! requires:
//! - qemu-system-x86_64 on PATH
//! - A bootable disk image
//!
//! Run with: `cargo test -p nimbus-vm -- --ignored`

#![cfg(unix)]

use nimbus_vm::{Arch, LaunchBuilder, ProcessState, VmError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write an executable shell script standing in for the emulator.
fn fake_emulator(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-qemu");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn builder(dir: &Path, binary: PathBuf) -> LaunchBuilder {
    LaunchBuilder::new(Arch::X86_64)
        .binary(binary)
        .image(dir.join("disk.qcow2"))
        .metadata_port(40000)
        .console(dir.join("console.log"))
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_emulator(dir.path(), "exec sleep 30");

    let hypervisor = builder(dir.path(), binary).launch().await.unwrap();
    assert_eq!(hypervisor.state(), ProcessState::Running);
    assert!(hypervisor.pid().is_some());

    let first = hypervisor.terminate().await;
    assert!(!first.is_running());
    assert!(!hypervisor.state().is_running());

    // second call must not fail or hang
    let second = hypervisor.terminate().await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_process_exit_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_emulator(dir.path(), "exit 3");

    let hypervisor = builder(dir.path(), binary).launch().await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(10), hypervisor.wait_exit())
        .await
        .expect("emulator should exit on its own");
    assert_eq!(state, ProcessState::Exited(Some(3)));
    assert_eq!(hypervisor.state(), ProcessState::Exited(Some(3)));

    // terminating an already-exited process is a no-op
    assert_eq!(hypervisor.terminate().await, ProcessState::Exited(Some(3)));
}

#[tokio::test]
async fn test_emulator_receives_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let argv = dir.path().join("argv");
    let binary = fake_emulator(
        dir.path(),
        &format!("printf '%s\\n' \"$@\" > {}", argv.display()),
    );

    let hypervisor = builder(dir.path(), binary)
        .vcpus(2)
        .ram_mb(512)
        .launch()
        .await
        .unwrap();
    hypervisor.wait_exit().await;

    let written = std::fs::read_to_string(&argv).unwrap();
    let args: Vec<&str> = written.lines().collect();
    assert_eq!(args[0], "-snapshot");
    assert!(args.windows(2).any(|w| w == ["-smp", "2"]));
    assert!(args.windows(2).any(|w| w == ["-m", "512M"]));
}

#[tokio::test]
async fn test_missing_binary_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = builder(dir.path(), dir.path().join("no-such-qemu"))
        .launch()
        .await;
    assert!(matches!(result, Err(VmError::Launch { .. })));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_emulator(dir.path(), "exec sleep 30");
    let result = builder(dir.path(), binary).vcpus(0).launch().await;
    assert!(matches!(result, Err(VmError::Config(_))));
}

/// Boot a real guest for a few seconds and check it writes console output.
#[tokio::test]
#[ignore = "requires qemu-system-x86_64 and a bootable image"]
async fn test_real_qemu_console() {
    let image = std::env::var("NIMBUS_TEST_IMAGE")
        .unwrap_or_else(|_| "/var/lib/nimbus/images/cirros.x86_64.qcow2".to_string());
    if !Path::new(&image).exists() {
        eprintln!("Skipping test: image not found");
        eprintln!("Set NIMBUS_TEST_IMAGE to a bootable x86_64 image");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let console = dir.path().join("console.log");
    let hypervisor = LaunchBuilder::new(Arch::X86_64)
        .image(&image)
        .metadata_port(40000)
        .console(&console)
        .host(nimbus_vm::HostCapabilities::detect())
        .launch()
        .await
        .expect("Failed to launch qemu");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(hypervisor.state().is_running());
    hypervisor.terminate().await;

    let output = std::fs::read(&console).unwrap_or_default();
    assert!(!output.is_empty());
}
