//! NimbusServer - shared state behind the REST handlers.

use crate::config::ApiConfig;
use nimbus_core::{DirImageStore, DirKeyStore, HostCapabilities, InstanceRegistry, RegistryConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Application state for the compute API.
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct NimbusServer {
    /// Instance registry from nimbus-core
    registry: Arc<InstanceRegistry>,

    /// Keypair directory, also read by the registry
    keypairs: DirKeyStore,

    /// Unix time (seconds) of the last request
    last_request: Arc<AtomicU64>,
}

impl NimbusServer {
    /// Create a server from the API configuration and already-parsed tables.
    pub fn new(config: &ApiConfig, registry_config: RegistryConfig) -> Self {
        let images = DirImageStore::new(config.images_dir(), config.volumes_dir())
            .with_qemu_img(&config.qemu_img);
        let keypairs = DirKeyStore::new(config.keypairs_dir());
        let registry = InstanceRegistry::new(
            registry_config,
            Arc::new(images),
            Arc::new(keypairs.clone()),
        );
        Self::with_registry(registry, keypairs)
    }

    /// Create a server from the environment, probing the host.
    pub fn from_config(config: &ApiConfig) -> Result<Self, crate::ConfigError> {
        let catalog = config.load_catalog()?;
        let host = HostCapabilities::detect();
        tracing::info!(
            flavors = catalog.flavors.len(),
            networks = catalog.net_bridges.len(),
            host_arch = ?host.arch,
            kvm = host.kvm,
            "Tables loaded"
        );
        Ok(Self::new(config, config.registry_config(catalog, host)))
    }

    /// Wrap an existing registry.
    pub fn with_registry(registry: InstanceRegistry, keypairs: DirKeyStore) -> Self {
        Self {
            registry: Arc::new(registry),
            keypairs,
            last_request: Arc::new(AtomicU64::new(now_secs())),
        }
    }

    /// Get a reference to the instance registry.
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Get a cloned Arc to the instance registry.
    ///
    /// Use this when you need to share the registry across tasks (e.g., for cleanup).
    pub fn registry_arc(&self) -> Arc<InstanceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Get the keypair store.
    pub fn keypairs(&self) -> &DirKeyStore {
        &self.keypairs
    }

    /// Record that a request was just received.
    pub fn touch(&self) {
        self.last_request.store(now_secs(), Ordering::Relaxed);
    }

    /// Time since the last request.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_request.load(Ordering::Relaxed);
        Duration::from_secs(now_secs().saturating_sub(last))
    }

    /// Resolve once no request has been received for `timeout`.
    pub async fn idle(&self, timeout: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= timeout {
                tracing::warn!(idle_secs = idle.as_secs(), "Service idle, shutting down");
                return;
            }
            tokio::time::sleep(timeout - idle).await;
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
