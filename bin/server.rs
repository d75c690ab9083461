// ERP Sync - Web Server
// REST surface over the sync and ingestion engines (axum)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use erp_sync::logging::init_logging;
use erp_sync::{
    setup_database, EntityCatalog, EventClassifier, EventIngestor, HttpRemoteCatalog,
    ProcessingOutcome, Settings, SqliteLocalCatalog, SqliteStore, StatusError, StatusReporter,
    SyncError, SyncService,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
///
/// The connection mutex doubles as the run lock: one run at a time.
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    catalog: Arc<EntityCatalog>,
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

/// Outcome of a blocking run, already mapped to an HTTP status
type RunResult = Result<Value, (StatusCode, String)>;

fn sync_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::UnknownEntity(_) => StatusCode::NOT_FOUND,
        SyncError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn status_error_code(err: &StatusError) -> StatusCode {
    match err {
        StatusError::RecordNotFound(_) | StatusError::RemoteEventNotFound(_) => StatusCode::NOT_FOUND,
        StatusError::InvalidFingerprint(_) | StatusError::NoKeyField(_) => StatusCode::BAD_REQUEST,
        StatusError::Remote(_) => StatusCode::BAD_GATEWAY,
        StatusError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
}

fn to_value(value: impl Serialize) -> RunResult {
    serde_json::to_value(value).map_err(internal)
}

/// Run `job` on the blocking pool holding the run lock
async fn run_locked<F>(state: AppState, job: F) -> Response
where
    F: FnOnce(&Settings, &EntityCatalog, &Connection) -> RunResult + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let conn = state
            .db
            .lock()
            .map_err(|_| internal("database lock poisoned"))?;
        job(&state.settings, &state.catalog, &conn)
    })
    .await;

    match result {
        Ok(Ok(data)) => ApiResponse::ok(data),
        Ok(Err((status, message))) => {
            error!(status = %status, "{}", message);
            failure(status, message)
        }
        Err(join_error) => failure(StatusCode::INTERNAL_SERVER_ERROR, join_error),
    }
}

fn remote_client(settings: &Settings) -> Result<HttpRemoteCatalog, (StatusCode, String)> {
    HttpRemoteCatalog::from_settings(settings)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{:#}", e)))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// POST /sync/all - Reconcile every entity kind
async fn sync_all(State(state): State<AppState>) -> Response {
    run_locked(state, |settings, catalog, conn| {
        let client = remote_client(settings)?;
        let local = SqliteLocalCatalog::new(conn, &settings.export_dir);
        let service = SyncService::new(conn, catalog, &local, &client, &settings.tenant);
        let reports = service
            .sync_all()
            .map_err(|e| (sync_status(&e), e.to_string()))?;
        to_value(reports)
    })
    .await
}

/// POST /sync/entity/:name - Reconcile one entity kind
async fn sync_entity(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    run_locked(state, move |settings, catalog, conn| {
        let client = remote_client(settings)?;
        let local = SqliteLocalCatalog::new(conn, &settings.export_dir);
        let service = SyncService::new(conn, catalog, &local, &client, &settings.tenant);
        let report = service
            .sync_entity(&name)
            .map_err(|e| (sync_status(&e), e.to_string()))?;
        to_value(report)
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct IngestRequest {
    limit: Option<usize>,
}

/// POST /sync/worker-events - Ingest pending worker change events
async fn sync_worker_events(
    State(state): State<AppState>,
    body: Option<Json<IngestRequest>>,
) -> Response {
    let limit = body.map(|Json(b)| b.limit).unwrap_or_default();
    run_locked(state, move |settings, _, conn| {
        let client = remote_client(settings)?;
        let ingestor = EventIngestor::new(EventClassifier::new(settings.classifier));
        let stats = ingestor
            .sync_remote(&client, limit, &SqliteStore::new(conn))
            .map_err(|e| (sync_status(&e), e.to_string()))?;
        to_value(stats)
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct ReportRequest {
    error: Option<String>,
}

/// POST /worker-events/:id/report - Report a persisted event as processed
async fn report_worker_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ReportRequest>>,
) -> Response {
    let outcome = match body.and_then(|Json(b)| b.error) {
        Some(detail) => ProcessingOutcome::Failure { detail },
        None => ProcessingOutcome::Success,
    };
    run_locked(state, move |settings, _, conn| {
        let client = remote_client(settings)?;
        let result = StatusReporter::new(&client, &settings.tenant)
            .report(conn, id, &outcome)
            .map_err(|e| (status_error_code(&e), e.to_string()))?;
        to_value(result)
    })
    .await
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    init_logging(&settings.log_level);

    let conn = Connection::open(&settings.db_path)?;
    setup_database(&conn)?;
    info!(path = ?settings.db_path, "database opened");

    let catalog = match &settings.entity_catalog {
        Some(path) => EntityCatalog::from_file(path)?,
        None => EntityCatalog::builtin(),
    };

    let addr = settings.server_addr.clone();
    let state = AppState {
        settings: Arc::new(settings),
        catalog: Arc::new(catalog),
        db: Arc::new(Mutex::new(conn)),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync/all", post(sync_all))
        .route("/sync/entity/:name", post(sync_entity))
        .route("/sync/worker-events", post(sync_worker_events))
        .route("/worker-events/:id/report", post(report_worker_event))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Server running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
