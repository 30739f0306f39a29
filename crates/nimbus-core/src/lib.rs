//! # nimbus-core
//!
//! Instance orchestration layer for Nimbus virtual machines.
//!
//! This crate turns a create request into a running guest: it allocates a
//! unique hardware address, starts a private metadata service, launches a
//! supervised QEMU process wired to that service, infers the guest's
//! network address from the host ARP table, and reclaims everything on
//! delete or process exit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    nimbus-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────┐     ┌─────────────────────────┐   │
//! │  │ InstanceRegistry │────▶│  HashMap<InstanceId,    │   │
//! │  │   - create()     │     │      Reserved | Ready>  │   │
//! │  │   - get()        │     └─────────────────────────┘   │
//! │  │   - delete()     │                                   │
//! │  └──────────────────┘                                   │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌──────────────────┐     ┌─────────────────────────┐   │
//! │  │    Instance      │────▶│  Hypervisor             │   │
//! │  │  - setup()       │     │  (from nimbus-vm)       │   │
//! │  │  - status()      │     └─────────────────────────┘   │
//! │  │  - teardown()    │                │ guestfwd          │
//! │  └──────────────────┘                ▼                   │
//! │           │              ┌─────────────────────────┐   │
//! │  ┌──────────────────┐     │  MetadataService        │   │
//! │  │   ArpObserver    │     │  127.0.0.1:{port}       │   │
//! │  │  - resolve()     │     └─────────────────────────┘   │
//! │  └──────────────────┘                                   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use nimbus_core::{
//!     Catalog, CreateRequest, DirImageStore, DirKeyStore, InstanceRegistry, RegistryConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(catalog: Catalog) -> nimbus_core::Result<()> {
//! let registry = InstanceRegistry::new(
//!     RegistryConfig::new(catalog, "/var/lib/nimbus/consoles"),
//!     Arc::new(DirImageStore::new("/var/lib/nimbus/images", "/var/lib/nimbus/volumes")),
//!     Arc::new(DirKeyStore::new("/var/lib/nimbus/keypairs")),
//! );
//!
//! let id = registry
//!     .create(CreateRequest::new("web-1", "5f0c...", "m1.small"))
//!     .await?;
//!
//! let info = registry.get(id).await?;
//! println!("{} is {}", info.name, info.status);
//!
//! registry.delete(id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Instance Lifecycle**: Create, observe and delete guests with
//!   explicit, best-effort teardown
//! - **Metadata Service**: OpenStack-style `meta_data.json`, `user_data` and
//!   `network_data.json` per guest, on a loopback port
//! - **Address Observation**: BUILD until the guest shows up in the ARP
//!   table, then ACTIVE
//! - **Storage**: Shared snapshot boot or per-instance copy-on-write volumes

mod arp;
mod config;
mod error;
mod hwaddr;
mod instance;
mod metadata;
mod registry;
mod storage;

pub use arp::{parse_table, ArpEntry, ArpObserver};
pub use config::{Catalog, Flavor, RegistryConfig};
pub use error::{CoreError, Result};
pub use hwaddr::{allocate as allocate_hw_address, QEMU_OUI};
pub use instance::{
    Address, CreateRequest, Instance, InstanceId, InstanceInfo, InstanceStatus,
};
pub use metadata::{router as metadata_router, MetadataContent, MetadataService};
pub use registry::InstanceRegistry;
pub use storage::{DirImageStore, DirKeyStore, Image, ImageStore, KeyStore, Volume};

pub use nimbus_vm::{Arch, HostCapabilities, MacAddr};
