//! # nimbus-api
//!
//! OpenStack-compatible compute API exposing Nimbus instances over HTTP.
//!
//! ## Quick Start
//!
//! Run the server with default configuration:
//!
//! ```bash
//! cargo run -p nimbus-api
//! ```
//!
//! Configure via environment variables:
//!
//! ```bash
//! export NIMBUS_WORKDIR=/var/lib/nimbus
//! export NIMBUS_HTTP_PORT=8855
//! export NIMBUS_QEMU_DIR=/usr/bin
//! cargo run -p nimbus-api
//! ```
//!
//! The work directory holds `images/`, `volumes/`, `keypairs/`,
//! `consoles/` and the `conf.toml` flavor/bridge tables.
//!
//! ## Routes
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /servers` | List server ids |
//! | `GET /servers/detail` | List servers with status |
//! | `POST /servers` | Create a server |
//! | `GET /servers/{id}` | Show a server |
//! | `DELETE /servers/{id}` | Delete a server |
//! | `POST /servers/{id}/action` | Console output |
//! | `POST /os-keypairs` | Import a public key |
//! | `DELETE /os-keypairs/{name}` | Delete a public key |

mod config;
pub mod http;
mod server;
mod types;

pub use config::{load_catalog, ApiConfig, ConfigError, DEFAULT_HTTP_PORT};
pub use http::{build_router, ApiError};
pub use server::NimbusServer;
pub use types::*;
