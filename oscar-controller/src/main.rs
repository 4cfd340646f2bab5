//! HTTP front-end for the OSCAR control plane: wires the five client
//! crates into an [`Orchestrator`] and exposes its operations over the
//! surface described in spec.md §6.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use oscar_builder_client::{BuilderClient, BuilderConfig};
use oscar_cluster_client::{ClusterClient, ClusterConfig};
use oscar_common::{BucketNotification, FunctionSpec, OscarError};
use oscar_faas_client::{FaasClient, FaasConfig};
use oscar_objectstore_client::{ObjectStoreClient, ObjectStoreConfig};
use oscar_orchestrator::{DefaultFilesystemFactory, ExistsOutcome, Orchestrator, OrchestratorConfig};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting oscar-controller");

    let cluster_config = ClusterConfig::from_env()?;
    let cluster = ClusterClient::new(cluster_config);

    let builder = BuilderClient::new(BuilderConfig::from_env()?, cluster.clone());
    let objectstore = ObjectStoreClient::new(ObjectStoreConfig::from_env()?).await;
    let faas_config = FaasConfig::from_env()?;
    let faas_endpoint = faas_config.endpoint.clone();
    let faas = FaasClient::new(faas_config);
    let onetrigger_version = std::env::var("ONETRIGGER_VERSION").ok();
    let filesystem_factory = DefaultFilesystemFactory::new(cluster.clone(), onetrigger_version, faas_endpoint);
    let orchestrator_config = OrchestratorConfig::from_env()?;

    let orchestrator = Arc::new(Orchestrator::new(
        orchestrator_config,
        Arc::new(builder),
        Arc::new(objectstore),
        Arc::new(faas),
        Arc::new(cluster),
        Arc::new(filesystem_factory),
    ));

    let state = AppState { orchestrator };

    let app = Router::new()
        .route("/functions", post(create_function_handler))
        .route("/functions", delete(delete_function_handler))
        .route("/functions", put(replace_function_handler))
        .route("/functions", get(list_functions_handler))
        .route("/function/:name", get(get_function_handler))
        .route("/function/:name", post(invoke_sync_handler))
        .route("/async-function/:name", post(invoke_async_handler))
        .route("/events", post(events_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = ([0, 0, 0, 0], 8080).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "oscar-controller listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Raw upstream (status, body) response, forwarded verbatim to the caller.
struct RawResponse(u16, Vec<u8>);

impl IntoResponse for RawResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.1).into_response()
    }
}

fn upstream_status(err: &oscar_orchestrator::Error) -> StatusCode {
    match err {
        oscar_orchestrator::Error::Common(OscarError::Upstream { status, .. }) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// `POST /functions`, spec.md §4.6 `init`: idempotent short-circuit on an
/// already-registered function, otherwise an early 200 with the build and
/// registration running in a detached background task.
async fn create_function_handler(
    State(state): State<AppState>,
    Json(spec): Json<FunctionSpec>,
) -> impl IntoResponse {
    match state.orchestrator.exists(&spec.name).await {
        ExistsOutcome::AlreadyRegistered { status, body } => RawResponse(status, body).into_response(),
        ExistsOutcome::Absent => {
            let orchestrator = state.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.init(spec).await {
                    error!(error = %e, "background init failed");
                }
            });
            (StatusCode::OK, "Initializing function").into_response()
        }
    }
}

/// `DELETE /functions`, spec.md §4.6 `rm`: synchronous, forwards the FaaS
/// runtime's response status on upstream rejection.
async fn delete_function_handler(
    State(state): State<AppState>,
    Json(spec): Json<FunctionSpec>,
) -> impl IntoResponse {
    match state.orchestrator.rm(spec).await {
        Ok(()) => (StatusCode::OK, "Function removed").into_response(),
        Err(e) => {
            warn!(error = %e, "rm failed");
            (upstream_status(&e), e.to_string()).into_response()
        }
    }
}

async fn replace_function_handler() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}

async fn list_functions_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.list_functions().await {
        Ok((status, body)) => RawResponse(status, body).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn get_function_handler(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.get_function(&name).await {
        Ok((status, body)) => RawResponse(status, body).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn invoke_sync_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    match state.orchestrator.invoke(&name, body.to_vec(), false).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (upstream_status(&e), e.to_string()).into_response(),
    }
}

async fn invoke_async_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    match state.orchestrator.invoke(&name, body.to_vec(), true).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (upstream_status(&e), e.to_string()).into_response(),
    }
}

/// `POST /events`, spec.md §4.6 `processEvent`: dispatched fire-and-forget,
/// so a malformed or unrouted notification never blocks the storage
/// backend's webhook delivery.
async fn events_handler(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let raw_body = body.to_vec();
    match serde_json::from_slice::<BucketNotification>(&raw_body) {
        Ok(notification) => {
            state.orchestrator.process_event(&notification, raw_body).await;
            StatusCode::OK
        }
        Err(e) => {
            warn!(error = %e, "malformed event notification");
            StatusCode::BAD_REQUEST
        }
    }
}
