//! Builder pattern for ergonomic LaunchConfig construction.

use crate::arch::Arch;
use crate::config::{BridgeConfig, DiskConfig, HostCapabilities, LaunchConfig};
use crate::error::Result;
use crate::mac::MacAddr;
use crate::Hypervisor;
use std::path::PathBuf;

/// Fluent builder for configuring and launching a hypervisor process.
///
/// # Example
///
/// ```no_run
/// use nimbus_vm::{Arch, HostCapabilities, LaunchBuilder};
///
/// # async fn example() -> nimbus_vm::Result<()> {
/// let hypervisor = LaunchBuilder::new(Arch::X86_64)
///     .vcpus(2)
///     .ram_mb(512)
///     .volume("/var/lib/nimbus/volumes/vm.qcow2")
///     .metadata_port(41234)
///     .console("/var/lib/nimbus/consoles/vm")
///     .host(HostCapabilities::detect())
///     .launch()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LaunchBuilder {
    config: LaunchConfig,
    binary_dir: Option<PathBuf>,
    host: HostCapabilities,
}

impl LaunchBuilder {
    /// Create a new builder for a guest of the given architecture.
    pub fn new(arch: Arch) -> Self {
        Self {
            config: LaunchConfig {
                arch,
                binary: PathBuf::from(arch.binary()),
                vcpus: 1,
                ram_mb: 256,
                disk: DiskConfig {
                    path: PathBuf::new(),
                    snapshot: false,
                },
                metadata_port: 0,
                bridge: None,
                console_path: PathBuf::new(),
                accelerate: false,
                firmware: None,
            },
            binary_dir: None,
            host: HostCapabilities::emulated(),
        }
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpus = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn ram_mb(mut self, mb: u32) -> Self {
        self.config.ram_mb = mb;
        self
    }

    /// Boot from a writable volume owned by this guest.
    pub fn volume(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.disk = DiskConfig {
            path: path.into(),
            snapshot: false,
        };
        self
    }

    /// Boot from a shared image; guest writes are discarded.
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.disk = DiskConfig {
            path: path.into(),
            snapshot: true,
        };
        self
    }

    /// Set the loopback port the metadata forward rule targets.
    pub fn metadata_port(mut self, port: u16) -> Self {
        self.config.metadata_port = port;
        self
    }

    /// Attach a bridged interface with the given hardware address.
    pub fn with_bridge(mut self, bridge: impl Into<String>, mac: MacAddr) -> Self {
        self.config.bridge = Some(BridgeConfig {
            bridge: bridge.into(),
            mac,
        });
        self
    }

    /// Set the serial console log file.
    pub fn console(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.console_path = path.into();
        self
    }

    /// Describe the host, enabling acceleration when it matches the guest.
    pub fn host(mut self, host: HostCapabilities) -> Self {
        self.host = host;
        self
    }

    /// Look up the emulator in this directory instead of `PATH`.
    pub fn binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = Some(dir.into());
        self
    }

    /// Execute exactly this binary.
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary = path.into();
        self.binary_dir = None;
        self
    }

    /// Override the firmware image.
    pub fn firmware(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firmware = Some(path.into());
        self
    }

    /// Build and return the configuration without launching anything.
    ///
    /// Useful for testing or inspecting the command line.
    pub fn build_config(self) -> LaunchConfig {
        let mut config = self.config;
        config.accelerate = self.host.accelerates(config.arch);
        if let Some(dir) = self.binary_dir {
            config.binary = dir.join(config.arch.binary());
        }
        config
    }

    /// Build the configuration and spawn the hypervisor.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the process
    /// cannot be spawned.
    pub async fn launch(self) -> Result<Hypervisor> {
        Hypervisor::spawn(self.build_config()).await
    }
}
