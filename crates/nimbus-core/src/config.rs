//! Registry configuration and the read-only flavor/bridge tables.

use crate::error::CoreError;
use nimbus_vm::HostCapabilities;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Named bundle of CPU, memory and disk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Virtual CPU count.
    pub vcpus: u8,
    /// Memory in MiB.
    #[serde(alias = "ram")]
    pub ram_mb: u32,
    /// Root disk size in GiB.
    #[serde(default, alias = "disk")]
    pub disk_gb: u32,
}

/// Flavor and network-bridge tables, supplied once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Flavors keyed by reference.
    #[serde(default)]
    pub flavors: HashMap<String, Flavor>,
    /// Host bridge device keyed by network id.
    #[serde(default)]
    pub net_bridges: HashMap<String, String>,
}

impl Catalog {
    /// Look up a flavor by reference.
    pub fn flavor(&self, reference: &str) -> Option<&Flavor> {
        self.flavors.get(reference)
    }

    /// Look up the bridge mapped to a network id.
    pub fn bridge(&self, network: &str) -> Option<&str> {
        self.net_bridges.get(network).map(String::as_str)
    }
}

/// Configuration for [`InstanceRegistry`](crate::InstanceRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Flavor and bridge tables.
    pub catalog: Catalog,
    /// Directory holding one console log per instance.
    pub consoles_dir: PathBuf,
    /// Directory holding the `qemu-system-*` binaries (default: `PATH`).
    pub qemu_dir: Option<PathBuf>,
    /// Host address-resolution table.
    pub arp_table: PathBuf,
    /// How long a parsed ARP table is reused (default: 1s).
    pub arp_ttl: Duration,
    /// Upper bound on metadata service + hypervisor startup (default: 30s).
    pub setup_timeout: Duration,
    /// How long an instance may stay in BUILD before it is reported as
    /// ERROR (default: unbounded).
    pub build_timeout: Option<Duration>,
    /// Host acceleration capabilities.
    pub host: HostCapabilities,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            consoles_dir: PathBuf::from("consoles"),
            qemu_dir: None,
            arp_table: PathBuf::from("/proc/net/arp"),
            arp_ttl: Duration::from_secs(1),
            setup_timeout: Duration::from_secs(30),
            build_timeout: None,
            host: HostCapabilities::emulated(),
        }
    }
}

impl RegistryConfig {
    /// Create a configuration with the given tables and console directory.
    pub fn new(catalog: Catalog, consoles_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            consoles_dir: consoles_dir.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.consoles_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidRequest(
                "consoles_dir is required".into(),
            ));
        }
        if self.setup_timeout.is_zero() {
            return Err(CoreError::InvalidRequest(
                "setup_timeout must be > 0".into(),
            ));
        }
        for (name, flavor) in &self.catalog.flavors {
            if flavor.vcpus == 0 || flavor.ram_mb == 0 {
                return Err(CoreError::InvalidRequest(format!(
                    "flavor {name} must have vcpus and ram_mb > 0"
                )));
            }
        }
        Ok(())
    }
}
