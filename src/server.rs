//! Web UI and JSON API.
//!
//! Serves a single-page UI that drives the pipeline interactively, plus the
//! JSON endpoints it calls.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | The UI |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/domains` | Configured domains and index status |
//! | `POST` | `/api/retrieve` | Retrieved schema chunks for a question |
//! | `POST` | `/api/generate` | One validated SQL candidate, not executed |
//! | `POST` | `/api/run` | Full pipeline with repair attempts |
//! | `POST` | `/api/execute` | Guardrail-check and run user-edited SQL |
//! | `POST` | `/api/export.csv` | Render a result table as CSV |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "guardrail_violation", "message": "...", "sql": "DELETE FROM t" } }
//! ```
//!
//! Pipeline invocations share one lock, so only one runs at a time no
//! matter how many browser sessions are open.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{QueryResult, RetrievedChunk};
use crate::pipeline::{Answer, Generated, Services};

const INDEX_HTML: &str = include_str!("ui.html");

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
    run_lock: Arc<Mutex<()>>,
}

/// Starts the web server on `[server].bind` with production services.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config).await?;
    serve(Arc::new(services), &config.server.bind).await
}

/// Serve the UI and API over the given services.
pub async fn serve(services: Arc<Services>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(services);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("nlsql UI listening on http://{}", bind_addr);
    tracing::info!(bind = bind_addr, "server started");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(services: Arc<Services>) -> Router {
    let state = AppState {
        services,
        run_lock: Arc::new(Mutex::new(())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/api/domains", get(handle_domains))
        .route("/api/retrieve", post(handle_retrieve))
        .route("/api/generate", post(handle_generate))
        .route("/api/run", post(handle_run))
        .route("/api/execute", post(handle_execute))
        .route("/api/export.csv", post(handle_export_csv))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    /// The SQL the error is about, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    sql: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                sql: self.sql,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        sql: None,
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
        sql: None,
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::UnknownDomain { .. } => StatusCode::NOT_FOUND,
            PipelineError::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Generation(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Retrieval(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Guardrail { .. }
            | PipelineError::Execution { .. }
            | PipelineError::Suspicious { .. }
            | PipelineError::RetriesExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            sql: err.sql().map(str::to_string),
        }
    }
}

// ============ GET / and /health ============

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/domains ============

#[derive(Serialize)]
struct DomainInfo {
    name: String,
    dbname: String,
    chunks: i64,
}

#[derive(Serialize)]
struct DomainsResponse {
    domains: Vec<DomainInfo>,
    top_k: usize,
    max_attempts: u32,
}

async fn handle_domains(State(state): State<AppState>) -> Result<Json<DomainsResponse>, AppError> {
    let config = &state.services.config;
    let mut domains = Vec::new();
    for (name, domain) in &config.domains {
        let stats = state
            .services
            .store
            .stats(name)
            .await
            .map_err(|e| internal(format!("{:#}", e)))?;
        domains.push(DomainInfo {
            name: name.clone(),
            dbname: domain.dbname.clone(),
            chunks: stats.chunks,
        });
    }
    Ok(Json(DomainsResponse {
        domains,
        top_k: config.retrieval.top_k,
        max_attempts: config.retry.max_attempts,
    }))
}

// ============ Pipeline endpoints ============

#[derive(Deserialize)]
struct QuestionRequest {
    domain: String,
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

impl QuestionRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.question.trim().is_empty() {
            return Err(bad_request("question must not be empty"));
        }
        if self.k == Some(0) {
            return Err(bad_request("k must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RetrieveResponse {
    chunks: Vec<RetrievedChunk>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    req.validate()?;
    let _guard = state.run_lock.lock().await;
    let chunks = state
        .services
        .retrieve(&req.domain, &req.question, req.k)
        .await?;
    Ok(Json(RetrieveResponse { chunks }))
}

#[derive(Serialize)]
struct GenerateResponse {
    chunks: Vec<RetrievedChunk>,
    #[serde(flatten)]
    generated: Generated,
}

async fn handle_generate(
    State(state): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    req.validate()?;
    let _guard = state.run_lock.lock().await;
    let (chunks, generated) = state
        .services
        .generate(&req.domain, &req.question, req.k)
        .await?;
    Ok(Json(GenerateResponse { chunks, generated }))
}

async fn handle_run(
    State(state): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> Result<Json<Answer>, AppError> {
    req.validate()?;
    let _guard = state.run_lock.lock().await;
    let answer = state
        .services
        .ask(&req.domain, &req.question, req.k)
        .await?;
    Ok(Json(answer))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    domain: String,
    sql: String,
}

#[derive(Serialize)]
struct ExecuteResponse {
    sql: String,
    result: QueryResult,
}

async fn handle_execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let _guard = state.run_lock.lock().await;
    let (sql, result) = state.services.execute_sql(&req.domain, &req.sql).await?;
    Ok(Json(ExecuteResponse { sql, result }))
}

// ============ POST /api/export.csv ============

async fn handle_export_csv(Json(result): Json<QueryResult>) -> Result<Response, AppError> {
    let csv = result.to_csv().map_err(|e| internal(format!("{:#}", e)))?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"result.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}
