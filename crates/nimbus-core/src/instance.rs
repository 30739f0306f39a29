//! Instance type - a guest with its metadata service and hypervisor.

use crate::arp::ArpObserver;
use crate::config::{Flavor, RegistryConfig};
use crate::error::{CoreError, Result};
use crate::metadata::{MetadataContent, MetadataService};
use crate::storage::{Image, ImageStore, Volume};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use nimbus_vm::{Hypervisor, LaunchBuilder, MacAddr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique identifier for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for InstanceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::NotFound(format!("instance {s}")))
    }
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    /// Booting; no network address observed yet.
    Build,
    /// Network address observed on the bridged link.
    Active,
    /// Launch failed, the process exited, or boot timed out.
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "BUILD"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A create request, already decoded from its wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    /// Display name (required)
    pub name: String,
    /// Image id (required)
    pub image_ref: String,
    /// Flavor reference (required)
    pub flavor_ref: String,
    /// Network id mapped to a host bridge
    pub network: Option<String>,
    /// Opaque boot data, served verbatim to the guest
    pub user_data: Bytes,
    /// Public key name
    pub key_name: Option<String>,
    /// Guest hostname (default: `name`)
    pub hostname: Option<String>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
    /// Tags
    pub tags: Vec<String>,
    /// Boot from a fresh volume of this size instead of the shared image
    pub volume_size_gb: Option<u32>,
}

impl CreateRequest {
    /// Create a request with the required references.
    pub fn new(
        name: impl Into<String>,
        image_ref: impl Into<String>,
        flavor_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image_ref: image_ref.into(),
            flavor_ref: flavor_ref.into(),
            ..Default::default()
        }
    }

    /// Check that required fields are present.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidRequest("name is required".into()));
        }
        if self.image_ref.trim().is_empty() {
            return Err(CoreError::InvalidRequest("imageRef is required".into()));
        }
        if self.flavor_ref.trim().is_empty() {
            return Err(CoreError::InvalidRequest("flavorRef is required".into()));
        }
        if self.volume_size_gb == Some(0) {
            return Err(CoreError::InvalidRequest("volume_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Resources resolved by the registry before an instance is built.
#[derive(Debug, Clone)]
pub(crate) struct Resources {
    pub image: Image,
    pub volume: Volume,
    pub flavor: Flavor,
    pub bridge: Option<String>,
    pub public_keys: BTreeMap<String, String>,
    pub hw_address: MacAddr,
    pub console_path: PathBuf,
}

/// One network address as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// IP address
    pub addr: Ipv4Addr,
    /// IP version
    pub version: u8,
}

/// Serializable snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub name: String,
    pub hostname: String,
    /// Creation time, RFC 3339 with second precision
    pub created: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub status: InstanceStatus,
    #[serde(rename = "accessIPv4", skip_serializing_if = "Option::is_none")]
    pub access_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<BTreeMap<String, Vec<Address>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    pub image_ref: String,
    pub flavor_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    pub hw_address: MacAddr,
}

/// A guest virtual machine.
///
/// After [`setup`](Self::setup) either both the metadata service and the
/// hypervisor are running, or neither is and `fault` says why. Resources are
/// released by [`teardown`](Self::teardown); dropping an instance only
/// stops its exit watcher, which in turn kills the process.
pub struct Instance {
    id: InstanceId,
    name: String,
    hostname: String,
    user_data: Bytes,
    metadata: BTreeMap<String, String>,
    tags: Vec<String>,
    key_name: Option<String>,
    public_keys: BTreeMap<String, String>,
    image: Image,
    volume: Volume,
    flavor_ref: String,
    flavor: Flavor,
    bridge: Option<String>,
    hw_address: MacAddr,
    console_path: PathBuf,
    created_at: DateTime<Utc>,
    booted_at: tokio::time::Instant,
    hypervisor: Option<Arc<Hypervisor>>,
    metadata_service: Option<Arc<MetadataService>>,
    watcher: Option<JoinHandle<()>>,
    fault: Option<String>,
}

impl Instance {
    pub(crate) fn new(id: InstanceId, request: CreateRequest, resources: Resources) -> Self {
        let hostname = request
            .hostname
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| request.name.clone());
        Self {
            id,
            name: request.name,
            hostname,
            user_data: request.user_data,
            metadata: request.metadata,
            tags: request.tags,
            key_name: request.key_name,
            public_keys: resources.public_keys,
            image: resources.image,
            volume: resources.volume,
            flavor_ref: request.flavor_ref,
            flavor: resources.flavor,
            bridge: resources.bridge,
            hw_address: resources.hw_address,
            console_path: resources.console_path,
            created_at: Utc::now(),
            booted_at: tokio::time::Instant::now(),
            hypervisor: None,
            metadata_service: None,
            watcher: None,
            fault: None,
        }
    }

    /// Start the metadata service, then the hypervisor wired to it.
    ///
    /// A hypervisor launch failure is not an error: the metadata service is
    /// stopped again and the failure is recorded as the instance's fault.
    ///
    /// # Errors
    /// Returns [`CoreError::Provision`] if the metadata service cannot start.
    pub(crate) async fn setup(&mut self, config: &RegistryConfig) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::info!(
            instance_id = %self.id,
            arch = %self.image.arch,
            vcpus = self.flavor.vcpus,
            ram_mb = self.flavor.ram_mb,
            hw_address = %self.hw_address,
            "Setting up instance"
        );

        if let Some(dir) = self.console_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                CoreError::Provision(format!("failed to create console directory: {e}"))
            })?;
        }

        let metadata = MetadataService::start(self.metadata_content()).await?;
        tracing::debug!(instance_id = %self.id, port = metadata.port(), "Metadata service ready");

        let mut launch = LaunchBuilder::new(self.image.arch)
            .vcpus(self.flavor.vcpus)
            .ram_mb(self.flavor.ram_mb)
            .metadata_port(metadata.port())
            .console(&self.console_path)
            .host(config.host);
        launch = match &self.volume {
            Volume::Shared(path) => launch.image(path),
            Volume::Owned(path) => launch.volume(path),
        };
        if let Some(bridge) = &self.bridge {
            launch = launch.with_bridge(bridge, self.hw_address);
        }
        if let Some(dir) = &config.qemu_dir {
            launch = launch.binary_dir(dir);
        }

        match launch.launch().await {
            Ok(hypervisor) => {
                let hypervisor = Arc::new(hypervisor);
                let metadata = Arc::new(metadata);
                self.watcher = Some(tokio::spawn(watch_exit(
                    self.id,
                    Arc::clone(&hypervisor),
                    Arc::clone(&metadata),
                )));
                self.hypervisor = Some(hypervisor);
                self.metadata_service = Some(metadata);
                tracing::info!(
                    instance_id = %self.id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Instance launched"
                );
            }
            Err(e) => {
                metadata.stop().await;
                let err = CoreError::from(e);
                tracing::error!(instance_id = %self.id, error = %err, "Hypervisor launch failed");
                self.fault = Some(err.to_string());
            }
        }
        Ok(())
    }

    fn metadata_content(&self) -> MetadataContent {
        MetadataContent {
            uuid: self.id.to_string(),
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            public_keys: self.public_keys.clone(),
            meta: self.metadata.clone(),
            user_data: self.user_data.clone(),
            hw_address: self.hw_address,
        }
    }

    /// Get the instance ID.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Get the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the hardware address of the bridged link.
    pub fn hw_address(&self) -> MacAddr {
        self.hw_address
    }

    /// Get the boot disk.
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Loopback port of the metadata service, while it runs.
    pub fn metadata_port(&self) -> Option<u16> {
        self.metadata_service.as_ref().map(|m| m.port())
    }

    /// Whether the hypervisor process has exited (or never started).
    pub fn has_exited(&self) -> bool {
        self.hypervisor
            .as_ref()
            .map_or(true, |h| !h.state().is_running())
    }

    /// Compute the current status, observing the ARP table.
    ///
    /// Never cached: every call re-checks the process and the network.
    pub async fn status(
        &self,
        arp: &ArpObserver,
        build_timeout: Option<Duration>,
    ) -> (InstanceStatus, Option<Ipv4Addr>, Option<String>) {
        if let Some(fault) = &self.fault {
            return (InstanceStatus::Error, None, Some(fault.clone()));
        }
        let Some(hypervisor) = &self.hypervisor else {
            return (InstanceStatus::Error, None, None);
        };
        let state = hypervisor.state();
        if !state.is_running() {
            return (
                InstanceStatus::Error,
                None,
                Some(format!("hypervisor {state}")),
            );
        }
        if let Some(ip) = arp.resolve(&self.hw_address).await {
            return (InstanceStatus::Active, Some(ip), None);
        }
        if let Some(timeout) = build_timeout {
            if self.booted_at.elapsed() >= timeout {
                return (
                    InstanceStatus::Error,
                    None,
                    Some(format!(
                        "no network address observed within {}s",
                        timeout.as_secs()
                    )),
                );
            }
        }
        (InstanceStatus::Build, None, None)
    }

    /// Build a client-facing snapshot.
    pub async fn info(&self, arp: &ArpObserver, build_timeout: Option<Duration>) -> InstanceInfo {
        let (status, access_ipv4, fault) = self.status(arp, build_timeout).await;
        let addresses = access_ipv4.map(|addr| {
            BTreeMap::from([("private".to_string(), vec![Address { addr, version: 4 }])])
        });
        InstanceInfo {
            id: self.id,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            created: self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            status,
            access_ipv4,
            addresses,
            fault,
            image_ref: self.image.id.clone(),
            flavor_ref: self.flavor_ref.clone(),
            key_name: self.key_name.clone(),
            hw_address: self.hw_address,
        }
    }

    /// Serial console output so far; empty if the guest wrote nothing yet.
    pub async fn console(&self) -> Result<String> {
        match tokio::fs::read(&self.console_path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Shared handle to the metadata service, while it runs.
    pub(crate) fn metadata_service(&self) -> Option<Arc<MetadataService>> {
        self.metadata_service.clone()
    }

    /// Release every resource the instance holds.
    ///
    /// Each step is attempted regardless of earlier failures.
    pub async fn teardown(mut self, images: &dyn ImageStore) {
        let start = std::time::Instant::now();
        tracing::info!(instance_id = %self.id, "Tearing down instance");

        if let Some(hypervisor) = self.hypervisor.take() {
            let state = hypervisor.terminate().await;
            tracing::debug!(instance_id = %self.id, %state, "Hypervisor reaped");
        }

        // the watcher stops the metadata service once the process is gone
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                tracing::warn!(instance_id = %self.id, error = %e, "Exit watcher failed");
            }
        }
        if let Some(metadata) = self.metadata_service.take() {
            metadata.stop().await;
        }

        match tokio::fs::remove_file(&self.console_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    instance_id = %self.id,
                    path = %self.console_path.display(),
                    error = %e,
                    "Failed to remove console log"
                );
            }
        }

        if let Volume::Owned(path) = &self.volume {
            if let Err(e) = images.remove_volume(path).await {
                tracing::warn!(
                    instance_id = %self.id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove volume"
                );
            }
        }

        tracing::info!(
            instance_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Instance torn down"
        );
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hw_address", &self.hw_address)
            .field("volume", &self.volume)
            .field("hypervisor", &self.hypervisor)
            .field("metadata_port", &self.metadata_port())
            .field("fault", &self.fault)
            .finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // the watcher holds the last hypervisor handle once the instance is
        // gone; aborting it drops that handle and kills the process
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Stop the metadata service as soon as the hypervisor exits.
async fn watch_exit(id: InstanceId, hypervisor: Arc<Hypervisor>, metadata: Arc<MetadataService>) {
    let state = hypervisor.wait_exit().await;
    tracing::info!(instance_id = %id, %state, "Hypervisor exited, releasing metadata service");
    metadata.stop().await;
}
