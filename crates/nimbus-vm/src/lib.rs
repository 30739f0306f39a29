//! # nimbus-vm
//!
//! Hypervisor layer for the Nimbus instance orchestrator.
//! Turns an instance's resolved attributes into a QEMU command line and
//! supervises the resulting process.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nimbus_vm::{Arch, HostCapabilities, LaunchBuilder};
//!
//! # async fn example() -> nimbus_vm::Result<()> {
//! let hypervisor = LaunchBuilder::new(Arch::X86_64)
//!     .vcpus(2)
//!     .ram_mb(512)
//!     .image("/var/lib/nimbus/images/cirros.x86_64.qcow2")
//!     .metadata_port(41234)
//!     .console("/var/lib/nimbus/consoles/demo")
//!     .host(HostCapabilities::detect())
//!     .launch()
//!     .await?;
//!
//! assert!(hypervisor.state().is_running());
//!
//! // Kill and reap
//! hypervisor.terminate().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Launch Policy**: Metadata-only user network with a guest forward rule,
//!   virtio disk, optional bridged NIC, serial console to file
//! - **Architectures**: Closed set of guest architectures, each with its own
//!   machine, firmware and NIC model
//! - **Supervision**: Child reaped by a background task, non-blocking liveness,
//!   idempotent termination

mod arch;
mod builder;
mod config;
mod error;
mod mac;
mod machine;

pub use arch::{Arch, NicModel};
pub use builder::LaunchBuilder;
pub use config::{
    BridgeConfig, DiskConfig, HostCapabilities, LaunchConfig, METADATA_ADDR, METADATA_NET,
    METADATA_PORT, SMBIOS_PRODUCT,
};
pub use error::{Result, VmError};
pub use mac::MacAddr;
pub use machine::{Hypervisor, ProcessState};
