//! Launch configuration for QEMU guests.
//!
//! [`LaunchConfig`] is plain data describing one guest; [`LaunchConfig::args`]
//! renders it into the exact command line handed to the system emulator.

use crate::arch::Arch;
use crate::error::{Result, VmError};
use crate::mac::MacAddr;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Private subnet of the metadata-only user-mode network.
pub const METADATA_NET: &str = "169.254.169.0/24";

/// Guest-visible address of the metadata service.
pub const METADATA_ADDR: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Guest-visible port of the metadata service.
pub const METADATA_PORT: u16 = 80;

/// SMBIOS product string cloud-init keys its OpenStack datasource on.
pub const SMBIOS_PRODUCT: &str = "OpenStack Compute";

/// What the host can offer a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Host CPU architecture, if it is one we know how to launch
    pub arch: Option<Arch>,
    /// Whether `/dev/kvm` is present
    pub kvm: bool,
}

impl HostCapabilities {
    /// Probe the running host.
    pub fn detect() -> Self {
        let caps = Self {
            arch: Arch::host(),
            kvm: Path::new("/dev/kvm").exists(),
        };
        tracing::debug!(arch = ?caps.arch, kvm = caps.kvm, "Detected host capabilities");
        caps
    }

    /// A host that accelerates nothing.
    pub fn emulated() -> Self {
        Self {
            arch: None,
            kvm: false,
        }
    }

    /// Whether guests of `arch` can run hardware-accelerated.
    pub fn accelerates(&self, arch: Arch) -> bool {
        self.kvm && self.arch == Some(arch)
    }
}

/// The boot disk of a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    /// Path to the disk image on the host
    pub path: PathBuf,
    /// Discard guest writes instead of writing them to `path`.
    ///
    /// Set when the disk is a shared image rather than a volume owned by
    /// the guest.
    pub snapshot: bool,
}

/// A bridged network interface exposing the guest on the host LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Host bridge device (e.g. `br0`)
    pub bridge: String,
    /// Hardware address of the guest interface
    pub mac: MacAddr,
}

/// Complete description of one hypervisor launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Guest architecture
    pub arch: Arch,
    /// System emulator to execute
    pub binary: PathBuf,
    /// Number of virtual CPUs
    pub vcpus: u8,
    /// Memory size in MiB
    pub ram_mb: u32,
    /// Boot disk
    pub disk: DiskConfig,
    /// Host loopback port of the metadata service
    pub metadata_port: u16,
    /// Optional bridged interface
    pub bridge: Option<BridgeConfig>,
    /// File receiving the guest serial console
    pub console_path: PathBuf,
    /// Use hardware acceleration
    pub accelerate: bool,
    /// Firmware override; falls back to the architecture default
    pub firmware: Option<PathBuf>,
}

impl LaunchConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.vcpus == 0 {
            return Err(VmError::Config("vcpus must be > 0".into()));
        }
        if self.ram_mb == 0 {
            return Err(VmError::Config("ram_mb must be > 0".into()));
        }
        if self.metadata_port == 0 {
            return Err(VmError::Config("metadata_port must be set".into()));
        }
        if self.disk.path.as_os_str().is_empty() {
            return Err(VmError::Config("disk path is required".into()));
        }
        if self.console_path.as_os_str().is_empty() {
            return Err(VmError::Config("console path is required".into()));
        }
        if let Some(bridge) = &self.bridge {
            if bridge.bridge.is_empty() || bridge.bridge.contains(',') {
                return Err(VmError::Config(format!(
                    "invalid bridge name: {:?}",
                    bridge.bridge
                )));
            }
        }
        Ok(())
    }

    /// Firmware image to boot, if the architecture needs one.
    pub fn firmware_path(&self) -> Option<&Path> {
        self.firmware.as_deref().or_else(|| self.arch.firmware())
    }

    /// Render the emulator arguments (without the binary itself).
    pub fn args(&self) -> Vec<String> {
        let nic = self.arch.nic_model().as_str();
        let mut args = Vec::with_capacity(32);

        if self.disk.snapshot {
            args.push("-snapshot".to_string());
        }
        args.extend([
            "-nographic".to_string(),
            "-serial".to_string(),
            format!("file:{}", self.console_path.display()),
            "-drive".to_string(),
            format!("file={},if=virtio", self.disk.path.display()),
            "-m".to_string(),
            format!("{}M", self.ram_mb),
            "-smbios".to_string(),
            format!("type=1,product={SMBIOS_PRODUCT}"),
            // metadata-only network: the guest reaches 169.254.169.254:80,
            // which slirp forwards to the host-local metadata service
            "-nic".to_string(),
            format!(
                "user,model={nic},net={METADATA_NET},restrict=on,\
                 guestfwd=tcp:{METADATA_ADDR}:{METADATA_PORT}-cmd:nc 127.0.0.1 {}",
                self.metadata_port
            ),
        ]);

        if self.vcpus > 1 {
            args.push("-smp".to_string());
            args.push(self.vcpus.to_string());
        }

        if let Some(bridge) = &self.bridge {
            args.push("-nic".to_string());
            args.push(format!(
                "bridge,model={nic},br={},mac={}",
                bridge.bridge, bridge.mac
            ));
        }

        if let Some(machine) = self.arch.machine() {
            args.push("-machine".to_string());
            args.push(machine.to_string());
        }

        if self.accelerate {
            args.extend(["-accel", "kvm", "-cpu", "host"].map(String::from));
        } else if self.arch.machine().is_some() {
            args.extend(["-cpu", "max"].map(String::from));
        }

        if let Some(firmware) = self.firmware_path() {
            args.push("-bios".to_string());
            args.push(firmware.display().to_string());
        }

        args
    }
}
