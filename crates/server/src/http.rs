use std::{collections::HashMap, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, HOST},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lookbook_assets::{AssetError, AssetResolver};
use lookbook_core::{ChangeJob, JobError, JobKind, RenderJob};
use lookbook_worker::{MutationSource, Staging};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::ServerConfig,
    jobs::{JobService, RUNWAY_DURATION_SECS},
};

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    jobs: JobService,
    assets: AssetResolver,
    public_base_url: Option<String>,
    fallback_origin: String,
}

impl AppState {
    fn new(config: &ServerConfig) -> Result<Self> {
        let assets = AssetResolver::new(&config.root)
            .with_context(|| format!("Project root {} is not accessible", config.root.display()))?
            .with_allowed_dirs(config.allowed_dirs.iter().cloned());

        Ok(Self {
            inner: Arc::new(AppStateInner {
                jobs: JobService::new(config),
                assets,
                public_base_url: config.public_base_url.clone(),
                fallback_origin: format!("http://{}", config.bind_address()),
            }),
        })
    }

    fn jobs(&self) -> &JobService {
        &self.inner.jobs
    }

    fn assets(&self) -> &AssetResolver {
        &self.inner.assets
    }

    /// Scheme and host workers use to reach `/api/assets` on this server.
    fn origin(&self, headers: &HeaderMap) -> String {
        self.inner
            .public_base_url
            .clone()
            .or_else(|| derive_base_url(headers))
            .unwrap_or_else(|| self.inner.fallback_origin.clone())
    }
}

#[derive(Debug)]
enum ApiError {
    Job(JobError),
    Asset(AssetError),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        Self::Job(err)
    }
}

impl From<AssetError> for ApiError {
    fn from(err: AssetError) -> Self {
        Self::Asset(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Job(JobError::Validation(format!(
            "request body must be a JSON object: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Job(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(code = err.code(), "job failed: {err}");
                } else {
                    tracing::warn!(code = err.code(), "job rejected: {err}");
                }
                (status, Json(job_error_body(&err))).into_response()
            }
            ApiError::Asset(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = match &err {
                    AssetError::Io(io) => {
                        tracing::error!("asset read failed: {io}");
                        "failed to read asset".to_string()
                    }
                    other => other.to_string(),
                };
                (
                    status,
                    Json(json!({
                        "success": false,
                        "error": message,
                        "code": asset_error_code(&err),
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// `{success:false, error, code}` plus whatever the worker left behind.
fn job_error_body(err: &JobError) -> Value {
    let message = match err {
        // Staging paths are absolute; keep them in the log only.
        JobError::Staging { .. } => "failed to stage worker input".to_string(),
        // So may a detected interpreter.
        JobError::Spawn { source, .. } => format!("failed to start worker process: {source}"),
        JobError::WorkerExit { program, .. } | JobError::WorkerTimeout { program, .. } => err
            .to_string()
            .replacen(program.as_str(), program_name(program), 1),
        other => other.to_string(),
    };

    let mut body = Map::new();
    body.insert("success".into(), Value::Bool(false));
    body.insert("error".into(), Value::String(message));
    body.insert("code".into(), Value::String(err.code().to_string()));
    if let Some(output) = err.output() {
        body.insert("raw_stdout".into(), Value::String(output.stdout.clone()));
        body.insert("raw_stderr".into(), Value::String(output.stderr.clone()));
        if let Some(code) = output.exit_code {
            body.insert("exit_code".into(), json!(code));
        }
    }
    if let Some(candidates) = err.candidates() {
        body.insert("candidates".into(), json!(candidates));
    }
    Value::Object(body)
}

fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

fn asset_error_code(err: &AssetError) -> &'static str {
    match err {
        AssetError::BadRequest(_) => "E_BAD_REQUEST",
        AssetError::Forbidden => "E_FORBIDDEN",
        AssetError::NotFound => "E_NOT_FOUND",
        AssetError::Io(_) => "E_IO",
    }
}

/// Router with every route and layer; used by the server and by tests.
pub fn build_router(config: &ServerConfig) -> Result<Router> {
    let state = AppState::new(config)?;

    let router = Router::new()
        .route("/api/generate-flatlay", post(generate_flatlay))
        .route("/api/virtual-showcase", post(virtual_showcase))
        .route("/api/runway", post(runway))
        .route("/api/apply-change", post(apply_change))
        .route("/api/assets", get(serve_asset))
        .route("/health", get(health))
        .layer(Extension(state))
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

pub async fn run_http_server(config: ServerConfig) -> Result<()> {
    let router = build_router(&config)?;

    if let Some(max_age) = config.staging_max_age {
        spawn_staging_pruner(Staging::new(config.staging_dir.clone()), max_age);
    }

    let bind = config.bind_address();
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {bind}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind lookbook server to {addr}"))?;

    tracing::info!(root = %config.root.display(), "lookbook server listening on {addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

/// Prunes once at startup, then every hour.
fn spawn_staging_pruner(staging: Staging, max_age: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let staging = staging.clone();
            let pruned =
                tokio::task::spawn_blocking(move || staging.prune_older_than(max_age)).await;
            match pruned {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => tracing::info!(removed, "pruned stale staging files"),
                Ok(Err(err)) => tracing::warn!("staging prune failed: {err}"),
                Err(err) => tracing::warn!("staging prune task failed: {err}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn generate_flatlay(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    render(state, headers, body, JobKind::Flatlay).await
}

async fn virtual_showcase(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    render(state, headers, body, JobKind::Showcase).await
}

async fn runway(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    render(state, headers, body, JobKind::Runway).await
}

async fn render(
    state: AppState,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
    kind: JobKind,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let job = RenderJob::from_body(kind, &body)?;
    let origin = state.origin(&headers);

    let outcome = state.jobs().render(&job, &origin).await?;

    let body = match kind {
        JobKind::Runway => json!({
            "success": true,
            "videoUrl": outcome.url,
            "duration": RUNWAY_DURATION_SECS,
            "message": "Runway video generated successfully",
        }),
        JobKind::Showcase => json!({
            "success": true,
            "imageUrl": outcome.url,
            "message": "Virtual showcase generated successfully",
        }),
        _ => json!({
            "success": true,
            "imageUrl": outcome.url,
            "message": "Flatlay render generated successfully",
        }),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn apply_change(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let job = ChangeJob::from_body(&body)?;
    let origin = state.origin(&headers);

    let outcome = state.jobs().apply_change(&job, &origin).await?;
    let message = match outcome.source {
        MutationSource::File(_) => "Design updated successfully",
        MutationSource::Stdout => "Design updated from stdout",
    };

    Ok(Json(json!({
        "success": true,
        "design": outcome.design,
        "message": message,
    }))
    .into_response())
}

async fn serve_asset(
    Extension(state): Extension<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let asset = state
        .assets()
        .load(params.get("path").map(String::as_str))
        .await?;

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static(asset.content_type)),
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        asset.bytes,
    )
        .into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        layer
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

fn derive_base_url(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())?;

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("http");

    Some(format!("{}://{}", scheme, host))
}
