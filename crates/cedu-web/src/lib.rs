//! Admin HTTP surface for catalog sync.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cedu_storage::PgCatalog;
use cedu_sync::{
    build_scheduler, list_audit_logs, CatalogImporter, FailureKind, ImportConfig, ImportOptions,
    ImportPipeline, ImportResult,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cedu-web";

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Clone)]
pub struct AppState {
    pub importer: Arc<dyn CatalogImporter>,
}

impl AppState {
    pub fn new(importer: Arc<dyn CatalogImporter>) -> Self {
        Self { importer }
    }
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct ImportsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/admin/catalog/sync", post(sync_handler))
        .route("/admin/catalog/imports", get(imports_handler))
        .with_state(Arc::new(state))
}

/// 200 on success, 409 while another import runs, 500 for any other failure.
pub fn status_for(result: &ImportResult) -> StatusCode {
    match (result.success, result.failure) {
        (true, _) => StatusCode::OK,
        (false, Some(FailureKind::ImportInProgress)) => StatusCode::CONFLICT,
        (false, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let result = state
        .importer
        .run_import(ImportOptions {
            dry_run: query.dry_run,
            snapshot_path: None,
        })
        .await;
    (status_for(&result), Json(result)).into_response()
}

async fn imports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImportsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let logs_dir = state.importer.logs_dir().to_path_buf();
    let listed = tokio::task::spawn_blocking(move || list_audit_logs(&logs_dir, limit))
        .await
        .context("audit log listing task failed")
        .and_then(|listed| listed);
    match listed {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

/// Run one import before serving. A failed sync is logged and the server
/// keeps running on whatever catalog is already persisted.
pub async fn startup_sync(importer: &dyn CatalogImporter) -> ImportResult {
    let result = importer.run_import(ImportOptions::default()).await;
    if result.success {
        info!(run_id = %result.run_id, duration_ms = result.duration_ms, "startup catalog sync finished");
    } else {
        error!(
            run_id = %result.run_id,
            failure = ?result.failure,
            errors = result.errors.len(),
            "startup catalog sync failed; serving the previously persisted catalog"
        );
    }
    result
}

pub async fn serve(
    importer: Arc<dyn CatalogImporter>,
    config: &ImportConfig,
    bind: &str,
) -> anyhow::Result<()> {
    if config.sync_on_startup {
        startup_sync(importer.as_ref()).await;
    }

    let scheduler = build_scheduler(importer.clone(), config).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduled catalog sync enabled");
    }

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "catalog admin server listening");
    axum::serve(listener, app(AppState::new(importer))).await?;
    drop(scheduler);
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ImportConfig::from_env();
    let bind = std::env::var("CEDU_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let catalog = PgCatalog::connect(&config.database_url)
        .await
        .context("connecting to the catalog database")?;
    catalog.migrate().await.context("applying migrations")?;
    let importer: Arc<dyn CatalogImporter> = Arc::new(ImportPipeline::new(config.clone(), catalog));
    serve(importer, &config, &bind).await
}
