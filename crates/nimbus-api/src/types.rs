//! Request and response bodies of the compute API.
//!
//! Field names follow the OpenStack compute API so stock clients
//! (openstacksdk, terraform) can talk to Nimbus.

use bytes::Bytes;
use nimbus_core::{CreateRequest, InstanceId, InstanceInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Servers
// ============================================================================

/// `POST /servers` body.
#[derive(Debug, Deserialize)]
pub struct CreateServerBody {
    pub server: CreateServerParams,
}

/// Parameters for creating a server.
#[derive(Debug, Deserialize)]
pub struct CreateServerParams {
    /// Display name.
    pub name: String,

    /// Image id.
    #[serde(rename = "imageRef", default)]
    pub image_ref: String,

    /// Flavor reference.
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,

    /// Networks to attach; only the first is used.
    #[serde(default)]
    pub networks: Vec<NetworkParam>,

    /// Boot data, passed to the guest verbatim.
    #[serde(default)]
    pub user_data: Option<String>,

    /// Public key name.
    #[serde(default)]
    pub key_name: Option<String>,

    /// Guest hostname (default: `name`).
    #[serde(default)]
    pub hostname: Option<String>,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Block devices; a `volume` destination with a size boots from a
    /// fresh volume.
    #[serde(default)]
    pub block_device_mapping_v2: Vec<BlockDeviceMapping>,
}

/// One entry of `networks`.
#[derive(Debug, Deserialize)]
pub struct NetworkParam {
    pub uuid: String,
}

/// One entry of `block_device_mapping_v2`.
#[derive(Debug, Deserialize)]
pub struct BlockDeviceMapping {
    #[serde(default)]
    pub destination_type: Option<String>,
    #[serde(default)]
    pub volume_size: Option<u32>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl From<CreateServerParams> for CreateRequest {
    fn from(params: CreateServerParams) -> Self {
        let volume = params
            .block_device_mapping_v2
            .iter()
            .find(|bdm| bdm.destination_type.as_deref() == Some("volume"));
        let volume_size_gb = volume.and_then(|bdm| bdm.volume_size);
        // boot-from-volume clients may leave imageRef empty and put it here
        let image_ref = if params.image_ref.is_empty() {
            volume.and_then(|bdm| bdm.uuid.clone()).unwrap_or_default()
        } else {
            params.image_ref
        };

        CreateRequest {
            name: params.name,
            image_ref,
            flavor_ref: params.flavor_ref,
            network: params.networks.into_iter().next().map(|n| n.uuid),
            user_data: params.user_data.map(Bytes::from).unwrap_or_default(),
            key_name: params.key_name,
            hostname: params.hostname,
            metadata: params.metadata,
            tags: params.tags,
            volume_size_gb,
        }
    }
}

/// `POST /servers` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateServerResponse {
    pub server: ServerRef,
}

/// Identity of a server, with (empty) links.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerRef {
    pub id: InstanceId,
    #[serde(default)]
    pub links: Vec<serde_json::Value>,
}

/// `GET /servers` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerRefList {
    pub servers: Vec<ServerRef>,
}

/// `GET /servers/{id}` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerDetail {
    pub server: InstanceInfo,
}

/// `GET /servers/detail` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerDetailList {
    pub servers: Vec<InstanceInfo>,
}

/// `POST /servers/{id}/action` body. Only console output is supported.
#[derive(Debug, Deserialize)]
pub struct ServerAction {
    #[serde(rename = "os-getConsoleOutput")]
    pub get_console_output: Option<ConsoleOutputParams>,
}

/// Parameters of `os-getConsoleOutput`.
#[derive(Debug, Default, Deserialize)]
pub struct ConsoleOutputParams {
    /// Return only the last `length` lines.
    #[serde(default, deserialize_with = "lenient_length")]
    pub length: Option<usize>,
}

/// Clients send `length` as a number, a numeric string or null.
fn lenient_length<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Length {
        Number(usize),
        Text(String),
    }
    Ok(match Option::<Length>::deserialize(deserializer)? {
        Some(Length::Number(n)) => Some(n),
        Some(Length::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// `os-getConsoleOutput` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsoleOutput {
    pub output: String,
}

/// Keep the last `length` lines of `output`.
pub fn tail_lines(output: &str, length: Option<usize>) -> String {
    match length {
        Some(n) => {
            let lines: Vec<&str> = output.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
        None => output.to_string(),
    }
}

// ============================================================================
// Keypairs
// ============================================================================

/// `POST /os-keypairs` body.
#[derive(Debug, Deserialize)]
pub struct ImportKeypairBody {
    pub keypair: KeypairParams,
}

/// Parameters for importing a keypair.
#[derive(Debug, Deserialize)]
pub struct KeypairParams {
    pub name: String,
    pub public_key: String,
}

// ============================================================================
// Versions
// ============================================================================

/// One supported API version.
#[derive(Debug, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub status: String,
    pub version: String,
    pub min_version: String,
}

/// `GET /` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Versions {
    pub versions: Vec<Version>,
}

impl Versions {
    /// The single version this server implements.
    pub fn current() -> Self {
        Self {
            versions: vec![Version {
                id: "v2.1".into(),
                status: "CURRENT".into(),
                version: "2.1".into(),
                min_version: "2.1".into(),
            }],
        }
    }
}
