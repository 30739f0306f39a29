//! Configuration for the API server.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults. Flavors and network bridges come from a TOML tables file.

use nimbus_core::{Catalog, HostCapabilities, RegistryConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8855;

/// Configuration for the Nimbus API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Working directory holding images, volumes, keypairs and consoles.
    pub workdir: PathBuf,

    /// Flavor and bridge tables file.
    pub tables_path: PathBuf,

    /// Directory holding the `qemu-system-*` binaries (default: `PATH`).
    pub qemu_dir: Option<PathBuf>,

    /// `qemu-img` binary used to clone volumes.
    pub qemu_img: PathBuf,

    /// Host ARP table.
    pub arp_table: PathBuf,

    /// How long an instance may stay in BUILD (default: unbounded).
    pub build_timeout: Option<Duration>,

    /// Shut down after this long without a request (default: never).
    pub idle_timeout: Option<Duration>,
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read tables file {path}: {source}")]
    ReadTables {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tables file {path}: {source}")]
    ParseTables {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Default for ApiConfig {
    fn default() -> Self {
        let workdir = PathBuf::from("/var/lib/nimbus");
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_HTTP_PORT),
            tables_path: workdir.join("conf.toml"),
            workdir,
            qemu_dir: None,
            qemu_img: PathBuf::from("qemu-img"),
            arp_table: PathBuf::from("/proc/net/arp"),
            build_timeout: None,
            idle_timeout: None,
        }
    }
}

impl ApiConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NIMBUS_HTTP_HOST` | `0.0.0.0` |
    /// | `NIMBUS_HTTP_PORT` | `8855` |
    /// | `NIMBUS_WORKDIR` | `/var/lib/nimbus` |
    /// | `NIMBUS_TABLES` | `{workdir}/conf.toml` |
    /// | `NIMBUS_QEMU_DIR` | unset (use `PATH`) |
    /// | `NIMBUS_QEMU_IMG` | `qemu-img` |
    /// | `NIMBUS_ARP_TABLE` | `/proc/net/arp` |
    /// | `NIMBUS_BUILD_TIMEOUT_SECS` | unset |
    /// | `NIMBUS_IDLE_SECS` | unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = var("NIMBUS_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = var("NIMBUS_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        let workdir = var("NIMBUS_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or(default.workdir);

        let secs = |key: &str| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
        };

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            tables_path: var("NIMBUS_TABLES")
                .map(PathBuf::from)
                .unwrap_or_else(|| workdir.join("conf.toml")),
            qemu_dir: var("NIMBUS_QEMU_DIR").map(PathBuf::from),
            qemu_img: var("NIMBUS_QEMU_IMG")
                .map(PathBuf::from)
                .unwrap_or(default.qemu_img),
            arp_table: var("NIMBUS_ARP_TABLE")
                .map(PathBuf::from)
                .unwrap_or(default.arp_table),
            build_timeout: secs("NIMBUS_BUILD_TIMEOUT_SECS"),
            idle_timeout: secs("NIMBUS_IDLE_SECS"),
            workdir,
        }
    }

    /// Directory of bootable images.
    pub fn images_dir(&self) -> PathBuf {
        self.workdir.join("images")
    }

    /// Directory of per-instance volumes.
    pub fn volumes_dir(&self) -> PathBuf {
        self.workdir.join("volumes")
    }

    /// Directory of imported public keys.
    pub fn keypairs_dir(&self) -> PathBuf {
        self.workdir.join("keypairs")
    }

    /// Directory of serial console logs.
    pub fn consoles_dir(&self) -> PathBuf {
        self.workdir.join("consoles")
    }

    /// Read the flavor and bridge tables.
    ///
    /// A missing file yields empty tables, so the server can still start.
    pub fn load_catalog(&self) -> Result<Catalog, ConfigError> {
        load_catalog(&self.tables_path)
    }

    /// Registry configuration for these settings and tables.
    pub fn registry_config(&self, catalog: Catalog, host: HostCapabilities) -> RegistryConfig {
        let mut config = RegistryConfig::new(catalog, self.consoles_dir());
        config.qemu_dir = self.qemu_dir.clone();
        config.arp_table = self.arp_table.clone();
        config.build_timeout = self.build_timeout;
        config.host = host;
        config
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if !self.workdir.exists() {
            tracing::warn!("Work directory not found: {:?}", self.workdir);
        }

        if !self.images_dir().exists() {
            tracing::warn!("Images directory not found: {:?}", self.images_dir());
        }

        if !self.tables_path.exists() {
            tracing::warn!("Tables file not found: {:?}", self.tables_path);
        }

        if let Some(dir) = &self.qemu_dir {
            if !dir.exists() {
                tracing::warn!("QEMU directory not found: {:?}", dir);
            }
        }

        if !self.arp_table.exists() {
            tracing::warn!("ARP table not found: {:?}", self.arp_table);
        }
    }
}

/// Parse a flavor/bridge tables file.
///
/// ```toml
/// [flavors."m1.small"]
/// vcpus = 1
/// ram = 2048
/// disk = 20
///
/// [net_bridges]
/// lan = "br0"
/// ```
pub fn load_catalog(path: &Path) -> Result<Catalog, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Tables file missing, no flavors available");
            return Ok(Catalog::default());
        }
        Err(source) => {
            return Err(ConfigError::ReadTables {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::ParseTables {
        path: path.to_path_buf(),
        source,
    })
}
