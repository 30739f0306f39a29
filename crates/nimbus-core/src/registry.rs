//! Instance registry for lifecycle management of multiple instances.

use crate::arp::ArpObserver;
use crate::config::RegistryConfig;
use crate::error::{CoreError, Result};
use crate::hwaddr;
use crate::instance::{CreateRequest, Instance, InstanceId, InstanceInfo, Resources};
use crate::storage::{ImageStore, KeyStore, Volume};
use nimbus_vm::MacAddr;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// A registry entry.
enum Slot {
    /// Id and hardware address claimed, setup still running.
    Reserved { hw_address: MacAddr },
    /// Set up and visible to clients.
    Ready(Instance),
}

impl Slot {
    fn hw_address(&self) -> MacAddr {
        match self {
            Slot::Reserved { hw_address } => *hw_address,
            Slot::Ready(instance) => instance.hw_address(),
        }
    }
}

type Slots = Arc<RwLock<HashMap<InstanceId, Slot>>>;

/// Owns every instance and serializes their lifecycle transitions.
///
/// # Thread Safety
///
/// The map sits behind an async RwLock. Every mutation (reserve, fill,
/// remove) happens in a short write-locked section that performs no external
/// I/O, so slow setup and teardown never block other callers. Hardware
/// addresses are allocated and reserved inside one such section, which keeps
/// them distinct under concurrent creates.
///
/// A reservation is always resolved: provisioning runs on its own task, so
/// a caller that stops waiting on [`create`](Self::create) cannot leave a
/// slot or an owned volume behind.
pub struct InstanceRegistry {
    instances: Slots,
    /// Signalled whenever a reservation is filled or released.
    settled: Arc<Notify>,
    config: Arc<RegistryConfig>,
    images: Arc<dyn ImageStore>,
    keys: Arc<dyn KeyStore>,
    arp: ArpObserver,
}

impl InstanceRegistry {
    /// Create a new, empty registry.
    pub fn new(
        config: RegistryConfig,
        images: Arc<dyn ImageStore>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        tracing::info!(
            consoles_dir = %config.consoles_dir.display(),
            flavors = config.catalog.flavors.len(),
            networks = config.catalog.net_bridges.len(),
            "Creating instance registry"
        );
        let arp = ArpObserver::new(&config.arp_table, config.arp_ttl);
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            settled: Arc::new(Notify::new()),
            config: Arc::new(config),
            images,
            keys,
            arp,
        }
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create and launch a new instance.
    ///
    /// Returns once the metadata service and hypervisor have been started.
    /// A hypervisor that fails to launch still yields a registered instance
    /// in `ERROR` state.
    ///
    /// If the returned future is dropped after the instance was reserved,
    /// provisioning still runs to completion in the background and the
    /// instance either becomes visible or is rolled back.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidRequest`] for missing fields or an unknown flavor
    /// - [`CoreError::NotFound`] for an unknown image or network
    /// - [`CoreError::Provision`] if the volume clone, the metadata service
    ///   or setup as a whole fails; nothing stays registered
    pub async fn create(&self, request: CreateRequest) -> Result<InstanceId> {
        request.validate()?;
        let flavor = *self
            .config
            .catalog
            .flavor(&request.flavor_ref)
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!("unknown flavor {}", request.flavor_ref))
            })?;

        let image = self
            .images
            .find_image(&request.image_ref)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("image {}", request.image_ref)))?;

        let bridge = match &request.network {
            Some(network) => Some(
                self.config
                    .catalog
                    .bridge(network)
                    .ok_or_else(|| CoreError::NotFound(format!("network {network}")))?
                    .to_string(),
            ),
            None => None,
        };

        let mut public_keys = BTreeMap::new();
        if let Some(name) = &request.key_name {
            match self.keys.read_public_key(name).await {
                Some(key) => {
                    public_keys.insert(name.clone(), key);
                }
                None => {
                    tracing::warn!(key_name = %name, "Public key not found, continuing without");
                }
            }
        }

        let (id, hw_address) = self.reserve().await;
        tracing::debug!(instance_id = %id, %hw_address, "Instance reserved");

        let resources = Resources {
            volume: Volume::Shared(image.path.clone()),
            image,
            flavor,
            bridge,
            public_keys,
            hw_address,
            console_path: self.config.consoles_dir.join(id.to_string()),
        };
        let task = tokio::spawn(self.provisioner().run(id, request, resources));
        match task.await {
            Ok(result) => result.map(|()| id),
            Err(e) => {
                tracing::error!(instance_id = %id, error = %e, "Provisioning task failed");
                self.provisioner().release(id).await;
                Err(CoreError::Provision(format!("provisioning task failed: {e}")))
            }
        }
    }

    fn provisioner(&self) -> Provisioner {
        Provisioner {
            instances: Arc::clone(&self.instances),
            settled: Arc::clone(&self.settled),
            config: Arc::clone(&self.config),
            images: Arc::clone(&self.images),
        }
    }

    /// Claim a fresh id and a hardware address distinct from every entry.
    async fn reserve(&self) -> (InstanceId, MacAddr) {
        let mut instances = self.instances.write().await;
        let taken: HashSet<MacAddr> = instances.values().map(Slot::hw_address).collect();
        let hw_address = hwaddr::allocate(&taken);
        let mut id = InstanceId::new();
        while instances.contains_key(&id) {
            id = InstanceId::new();
        }
        instances.insert(id, Slot::Reserved { hw_address });
        (id, hw_address)
    }

    /// Get a snapshot of an instance, with its status computed now.
    pub async fn get(&self, id: InstanceId) -> Result<InstanceInfo> {
        let instances = self.instances.read().await;
        match instances.get(&id) {
            Some(Slot::Ready(instance)) => {
                Ok(instance.info(&self.arp, self.config.build_timeout).await)
            }
            _ => Err(CoreError::NotFound(format!("instance {id}"))),
        }
    }

    /// Snapshots of all registered instances.
    pub async fn list(&self) -> Vec<InstanceInfo> {
        let instances = self.instances.read().await;
        let mut infos = Vec::with_capacity(instances.len());
        for slot in instances.values() {
            if let Slot::Ready(instance) = slot {
                infos.push(instance.info(&self.arp, self.config.build_timeout).await);
            }
        }
        infos
    }

    /// List all registered instance IDs.
    pub async fn ids(&self) -> Vec<InstanceId> {
        let instances = self.instances.read().await;
        instances
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Check if an instance is registered.
    pub async fn exists(&self, id: InstanceId) -> bool {
        let instances = self.instances.read().await;
        matches!(instances.get(&id), Some(Slot::Ready(_)))
    }

    /// Get the number of registered instances.
    pub async fn count(&self) -> usize {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Delete an instance and release its resources.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if no such instance exists
    /// - [`CoreError::Conflict`] if the instance is still being set up
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        let instance = {
            let mut instances = self.instances.write().await;
            match instances.remove(&id) {
                Some(Slot::Ready(instance)) => instance,
                Some(reserved) => {
                    instances.insert(id, reserved);
                    return Err(CoreError::Conflict(format!(
                        "instance {id} is still being set up"
                    )));
                }
                None => return Err(CoreError::NotFound(format!("instance {id}"))),
            }
        };
        instance.teardown(self.images.as_ref()).await;
        Ok(())
    }

    /// Serial console output of an instance.
    pub async fn console(&self, id: InstanceId) -> Result<String> {
        let instances = self.instances.read().await;
        match instances.get(&id) {
            Some(Slot::Ready(instance)) => instance.console().await,
            _ => Err(CoreError::NotFound(format!("instance {id}"))),
        }
    }

    /// Delete all registered instances.
    ///
    /// Used during shutdown. Instances still being set up are waited for
    /// and torn down once they are ready, so the registry is empty when
    /// this returns.
    pub async fn teardown_all(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let (ready, pending) = {
                let mut instances = self.instances.write().await;
                let mut ready = Vec::new();
                for (id, slot) in std::mem::take(&mut *instances) {
                    match slot {
                        Slot::Ready(instance) => ready.push(instance),
                        reserved => {
                            instances.insert(id, reserved);
                        }
                    }
                }
                (ready, instances.len())
            };

            tracing::info!(count = ready.len(), pending, "Tearing down all instances");
            for instance in ready {
                instance.teardown(self.images.as_ref()).await;
            }

            if pending == 0 {
                return;
            }
            settled.await;
        }
    }

    /// Release the metadata services of instances whose process exited.
    ///
    /// Such instances stay registered (status `ERROR`) until deleted.
    /// Returns the number of exited instances.
    pub async fn reap_exited(&self) -> usize {
        let (exited, services) = {
            let instances = self.instances.read().await;
            let mut exited = 0;
            let mut services = Vec::new();
            for slot in instances.values() {
                if let Slot::Ready(instance) = slot {
                    if instance.has_exited() {
                        exited += 1;
                        services.extend(instance.metadata_service());
                    }
                }
            }
            (exited, services)
        };

        for service in services {
            service.stop().await;
        }
        if exited > 0 {
            tracing::debug!(exited, "Reaped exited instances");
        }
        exited
    }
}

/// Finishes a create on its own task.
///
/// Owns shared handles only, so it outlives the caller of
/// [`InstanceRegistry::create`].
struct Provisioner {
    instances: Slots,
    settled: Arc<Notify>,
    config: Arc<RegistryConfig>,
    images: Arc<dyn ImageStore>,
}

impl Provisioner {
    /// Clone the volume, set the instance up and fill its reservation.
    ///
    /// On any failure the reservation is released and nothing the instance
    /// created is left behind.
    async fn run(
        self,
        id: InstanceId,
        request: CreateRequest,
        mut resources: Resources,
    ) -> Result<()> {
        if let Some(size_gb) = request.volume_size_gb {
            match self
                .images
                .clone_to_volume(&resources.image, size_gb, &id)
                .await
            {
                Ok(path) => resources.volume = Volume::Owned(path),
                Err(e) => {
                    tracing::error!(instance_id = %id, error = %e, "Volume provisioning failed");
                    self.release(id).await;
                    return Err(e);
                }
            }
        }

        let mut instance = Instance::new(id, request, resources);
        let setup = tokio::time::timeout(self.config.setup_timeout, instance.setup(&self.config));
        let failure = match setup.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(CoreError::Provision(format!(
                "setup timed out after {}s",
                self.config.setup_timeout.as_secs()
            ))),
        };
        if let Some(e) = failure {
            tracing::error!(instance_id = %id, error = %e, "Instance setup failed");
            instance.teardown(self.images.as_ref()).await;
            self.release(id).await;
            return Err(e);
        }

        self.instances.write().await.insert(id, Slot::Ready(instance));
        self.settled.notify_waiters();
        tracing::info!(instance_id = %id, "Instance registered");
        Ok(())
    }

    /// Drop a reservation after a failed create.
    async fn release(&self, id: InstanceId) {
        {
            let mut instances = self.instances.write().await;
            if matches!(instances.get(&id), Some(Slot::Reserved { .. })) {
                instances.remove(&id);
            }
        }
        self.settled.notify_waiters();
    }
}
