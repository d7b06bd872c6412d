mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{FlowExecutor, FlowOutcomeService};
use crate::flows::FlowRegistry;
use crate::gateway::{HttpFlowGateway, RpcConnection, RpcSettings};
use crate::storage;

pub use errors::{AppError, ErrorResponse};

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub executor: Arc<FlowExecutor>,
    pub outcomes: Arc<FlowOutcomeService>,
}

/// Everything `serve` needs, already resolved from CLI, env and config file.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub rpc: RpcSettings,
    pub flow_locations: Vec<PathBuf>,
    pub max_body: usize,
}

/// Build the REST router. Every route lives under `/api/v1`.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    let api = Router::new()
        .route("/flowstarter/registeredflows", get(handlers::registered_flows))
        .route("/flowstarter/startflow", post(handlers::start_flow))
        .route(
            "/flowstarter/flowoutcomeforclientid/{clientid}",
            get(handlers::flow_outcome_for_client_id),
        )
        .route("/flowstarter/flowoutcome/{flowid}", get(handlers::flow_outcome))
        .route("/flowstarter/getprotocolversion", get(handlers::protocol_version))
        .route("/flowmanagerrpcops/killflow/{flowid}", post(handlers::kill_flow))
        .route("/flowmanagerrpcops/listactive", get(handlers::list_active))
        .route("/flowmanagerrpcops/getprotocolversion", get(handlers::protocol_version))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
///
/// Opens the job store and the engine connection, reconciles leftover RUNNING
/// jobs in the background, and closes the connection once the server stops.
pub async fn serve(settings: ServeSettings) -> Result<()> {
    ensure_sqlite_dir(&settings.database_url)?;
    let store = storage::connect(&settings.database_url)
        .await
        .with_context(|| format!("Failed to open job store '{}'", settings.database_url))?;

    let registry = Arc::new(
        FlowRegistry::with_locations(&settings.flow_locations)
            .await
            .context("Failed to load flow locations")?,
    );

    let connection = Arc::new(RpcConnection::open(settings.rpc.clone())?);
    let gateway = Arc::new(HttpFlowGateway::new(connection.clone()));

    let executor = Arc::new(FlowExecutor::new(registry, store.clone(), gateway.clone()));
    let outcomes = Arc::new(FlowOutcomeService::new(store, gateway));

    let reconciler = executor.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.reconcile().await {
            error!(error = %e, "Startup reconciliation failed");
        }
    });

    let state = Arc::new(AppState { executor, outcomes });
    let app = router(state, settings.max_body);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    info!("Flowgate API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    connection.close();
    info!("Flowgate API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// SQLite will not create missing parent directories for a database file.
fn ensure_sqlite_dir(database_url: &str) -> Result<()> {
    let Some(rest) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or(rest);
    if file.is_empty() || file == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(file).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}
