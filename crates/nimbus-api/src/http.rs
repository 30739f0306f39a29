//! HTTP transport for the compute API.
//!
//! ## Endpoints
//!
//! - `GET /` - Version document
//! - `GET /servers` - Server ids
//! - `GET /servers/detail` - Server details
//! - `POST /servers` - Create a server
//! - `GET /servers/{id}` - Server details
//! - `DELETE /servers/{id}` - Delete a server
//! - `POST /servers/{id}/action` - `os-getConsoleOutput`
//! - `POST /os-keypairs` - Import a public key
//! - `DELETE /os-keypairs/{name}` - Delete a public key
//!
//! Every route is also served under `/compute`.

use crate::server::NimbusServer;
use crate::types::*;
use axum::{
    extract::{rejection::JsonRejection, OriginalUri, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use nimbus_core::{CoreError, CreateRequest, InstanceId};
use tower_http::trace::TraceLayer;

/// Error returned by handlers, rendered in the compute API's fault format.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(CoreError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(CoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Core(CoreError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = match status {
            StatusCode::BAD_REQUEST => "badRequest",
            StatusCode::NOT_FOUND => "itemNotFound",
            StatusCode::CONFLICT => "conflictingRequest",
            _ => "computeFault",
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, %status, "Request rejected");
        }
        let mut body = serde_json::Map::new();
        body.insert(
            kind.to_string(),
            serde_json::json!({ "code": status.as_u16(), "message": self.to_string() }),
        );
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router for the compute API.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: NimbusServer) -> Router {
    tracing::debug!("Building HTTP router");

    let api = Router::new()
        .route("/", get(versions_handler))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/detail", get(list_servers_detail))
        .route("/servers/:id", get(get_server).delete(delete_server))
        .route("/servers/:id/action", post(server_action))
        .route("/os-keypairs", post(import_keypair))
        .route("/os-keypairs/:name", axum::routing::delete(delete_keypair));

    Router::new()
        .merge(api.clone())
        .nest("/compute", api)
        .layer(middleware::from_fn_with_state(server.clone(), track_activity))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Record request times for idle shutdown.
async fn track_activity(State(server): State<NimbusServer>, request: Request, next: Next) -> Response {
    server.touch();
    next.run(request).await
}

async fn versions_handler() -> impl IntoResponse {
    tracing::trace!("Version request");
    Json(Versions::current())
}

async fn list_servers(State(server): State<NimbusServer>) -> impl IntoResponse {
    let servers = server
        .registry()
        .ids()
        .await
        .into_iter()
        .map(|id| ServerRef { id, links: vec![] })
        .collect();
    Json(ServerRefList { servers })
}

async fn list_servers_detail(State(server): State<NimbusServer>) -> impl IntoResponse {
    Json(ServerDetailList {
        servers: server.registry().list().await,
    })
}

async fn create_server(
    State(server): State<NimbusServer>,
    OriginalUri(uri): OriginalUri,
    body: Result<Json<CreateServerBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let request = CreateRequest::from(body.server);
    tracing::info!(
        name = %request.name,
        image_ref = %request.image_ref,
        flavor_ref = %request.flavor_ref,
        "Create server request"
    );

    let id = server.registry().create(request).await?;
    let location = format!("{}/{id}", uri.path().trim_end_matches('/'));
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(CreateServerResponse {
            server: ServerRef { id, links: vec![] },
        }),
    )
        .into_response())
}

async fn get_server(
    State(server): State<NimbusServer>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServerDetail>> {
    let id: InstanceId = id.parse()?;
    let info = server.registry().get(id).await?;
    Ok(Json(ServerDetail { server: info }))
}

async fn delete_server(
    State(server): State<NimbusServer>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id: InstanceId = id.parse()?;
    tracing::info!(instance_id = %id, "Delete server request");
    server.registry().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn server_action(
    State(server): State<NimbusServer>,
    Path(id): Path<String>,
    body: Result<Json<ServerAction>, JsonRejection>,
) -> ApiResult<Json<ConsoleOutput>> {
    let id: InstanceId = id.parse()?;
    let Json(action) = body?;
    let Some(params) = action.get_console_output else {
        return Err(ApiError::BadRequest("unsupported server action".into()));
    };
    let output = server.registry().console(id).await?;
    Ok(Json(ConsoleOutput {
        output: tail_lines(&output, params.length),
    }))
}

async fn import_keypair(
    State(server): State<NimbusServer>,
    body: Result<Json<ImportKeypairBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = body?;
    let KeypairParams { name, public_key } = body.keypair;
    server.keypairs().import(&name, &public_key).await?;
    Ok(Json(serde_json::json!({
        "keypair": { "name": name, "public_key": public_key }
    })))
}

async fn delete_keypair(
    State(server): State<NimbusServer>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    server.keypairs().delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: NimbusServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
