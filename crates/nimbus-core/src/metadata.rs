//! Per-instance metadata service.
//!
//! Each instance gets its own small HTTP server bound to an ephemeral
//! loopback port. The hypervisor forwards the guest's connections to
//! `169.254.169.254:80` here, so the guest can fetch its user data, identity
//! and network description the way cloud-init expects on OpenStack.

use crate::error::{CoreError, Result};
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use bytes::Bytes;
use nimbus_vm::MacAddr;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// How long `stop` waits for in-flight requests before aborting the server.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Static content served to one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataContent {
    /// Instance id
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Guest hostname
    pub hostname: String,
    /// SSH public keys by key name
    pub public_keys: BTreeMap<String, String>,
    /// Free-form user metadata
    pub meta: BTreeMap<String, String>,
    /// Opaque user data, served verbatim
    pub user_data: Bytes,
    /// Hardware address of the guest's bridged link
    pub hw_address: MacAddr,
}

/// Build the metadata router for one guest.
pub fn router(content: MetadataContent) -> Router {
    Router::new()
        .route("/openstack", get(index))
        .route("/openstack/:version/meta_data.json", get(meta_data))
        .route("/openstack/:version/user_data", get(user_data))
        .route("/openstack/:version/network_data.json", get(network_data))
        .route("/openstack/:version/vendor_data.json", get(vendor_data))
        .route("/openstack/:version/vendor_data2.json", get(vendor_data))
        .with_state(Arc::new(content))
}

async fn index() -> impl IntoResponse {
    Json(json!({}))
}

async fn vendor_data() -> impl IntoResponse {
    Json(json!({}))
}

async fn meta_data(State(content): State<Arc<MetadataContent>>) -> impl IntoResponse {
    tracing::debug!(instance_id = %content.uuid, "Serving meta_data.json");
    Json(json!({
        "uuid": content.uuid,
        "name": content.name,
        "hostname": content.hostname,
        "public_keys": content.public_keys,
        "meta": content.meta,
    }))
}

async fn user_data(State(content): State<Arc<MetadataContent>>) -> impl IntoResponse {
    tracing::debug!(instance_id = %content.uuid, size = content.user_data.len(), "Serving user_data");
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content.user_data.clone(),
    )
}

async fn network_data(State(content): State<Arc<MetadataContent>>) -> impl IntoResponse {
    Json(json!({
        "links": [{
            "id": "br_link0",
            "ethernet_mac_address": content.hw_address,
            "type": "bridge",
        }],
        "networks": [{
            "id": "network0",
            "link": "br_link0",
            "type": "ipv4_dhcp",
        }],
        "services": [],
    }))
}

/// A running metadata service.
///
/// Call [`stop`](Self::stop) to release the port. Dropping a service that
/// was never stopped aborts its server task.
#[derive(Debug)]
pub struct MetadataService {
    port: u16,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataService {
    /// Bind `127.0.0.1:0` and start serving `content`.
    ///
    /// # Errors
    /// Returns [`CoreError::Provision`] if the listener cannot be bound.
    pub async fn start(content: MetadataContent) -> Result<Self> {
        let instance_id = content.uuid.clone();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| {
                tracing::error!(instance_id = %instance_id, error = %e, "Metadata service bind failed");
                CoreError::Provision(format!("metadata service bind failed: {e}"))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| CoreError::Provision(format!("metadata service address: {e}")))?
            .port();

        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let app = router(content);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Metadata service terminated with error");
            }
        });

        tracing::info!(instance_id = %instance_id, port, "Metadata service started");
        Ok(Self {
            port,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Loopback port the service listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving and release the port.
    ///
    /// Idempotent and infallible: a server that already stopped, panicked
    /// or was cancelled by runtime shutdown is simply forgotten. Concurrent
    /// callers all return only once the port is released.
    pub async fn stop(&self) {
        // held until the task is gone so a second caller cannot return early
        let mut guard = self.task.lock().await;
        let Some(mut task) = guard.take() else {
            return;
        };
        self.shutdown.notify_one();

        tokio::select! {
            result = &mut task => {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        tracing::warn!(port = self.port, error = %e, "Metadata service task failed");
                    }
                }
            }
            _ = tokio::time::sleep(STOP_GRACE) => {
                tracing::debug!(port = self.port, "Metadata service slow to drain, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        tracing::debug!(port = self.port, "Metadata service stopped");
    }
}

impl Drop for MetadataService {
    fn drop(&mut self) {
        // only reached without stop() when a setup future was cancelled
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
