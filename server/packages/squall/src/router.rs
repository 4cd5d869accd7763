//! HTTP boundary.
//!
//! Two routes: `POST /query` runs one agent session and streams its
//! events back as NDJSON, `GET /health` reports liveness. Validation
//! failures before the first byte of the stream are ProblemDetails JSON
//! responses; failures after streaming begins become terminal `error`
//! events on the stream, since the 200 status is already on the wire.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use squall_error::{ErrorType, ProblemDetails, SquallError, UploadRejectReason};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::config::{load_skills, session_timeout, resolve, ProjectConfig, QueryRequest};
use crate::credentials::resolve_credentials;
use crate::session::{SessionInputs, SessionOrchestrator};
use crate::uploads::validate_uploads;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug)]
pub struct AppState {
    orchestrator: SessionOrchestrator,
    project_config: Option<ProjectConfig>,
    /// Directory the project document lives in; skills paths resolve
    /// relative to it.
    config_dir: PathBuf,
}

impl AppState {
    pub fn new(
        orchestrator: SessionOrchestrator,
        project_config: Option<ProjectConfig>,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            orchestrator,
            project_config,
            config_dir,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/query", post(post_query))
        .route("/health", get(get_health))
        .fallback(not_found)
        // Lift axum's default 2 MB body cap so oversized uploads reach
        // `validate_uploads` and get the documented ProblemDetails
        // rejection; the real limits live in `uploads.rs`.
        .layer(axum::extract::DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(cors_layer())
        .with_state(Arc::new(state));

    let http_logging = match std::env::var("SQUALL_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }
    router
}

/// Allowed origins come from `CORS_ORIGINS` (comma-separated); unset or
/// `*` allows any origin.
fn cors_layer() -> CorsLayer {
    let origins = std::env::var("CORS_ORIGINS").unwrap_or_default();
    if origins.is_empty() || origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// A request rejected before streaming began.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ApiError {
    source: SquallError,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details = self.source.to_problem_details();
        details.request_id = Some(self.request_id);
        let status =
            StatusCode::from_u16(details.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(details)).into_response()
    }
}

#[utoipa::path(
    post,
    path = "/query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "NDJSON stream of agent events", body = String, content_type = "application/x-ndjson"),
        (status = 400, description = "Invalid configuration or unsafe upload", body = ProblemDetails),
        (status = 413, description = "Upload exceeds size limits", body = ProblemDetails),
    ),
    tag = "sessions"
)]
/// Run Agent Session
///
/// Provisions a sandbox, runs the agent against the prompt, and streams
/// its events back as one JSON record per line.
async fn post_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let fail = |source: SquallError| ApiError {
        source,
        request_id: request_id.clone(),
    };

    tracing::info!(
        %request_id,
        prompt_len = request.prompt.len(),
        timeout = request.timeout,
        "query received"
    );

    // Everything that can be rejected with a status code is checked
    // before any sandbox exists.
    let timeout = session_timeout(&request).map_err(&fail)?;
    let uploads = match &request.files {
        Some(files) => validate_uploads(files).map_err(&fail)?,
        None => Vec::new(),
    };
    let skills = match state
        .project_config
        .as_ref()
        .and_then(|config| config.skills_dir.as_deref())
    {
        Some(dir) => load_skills(&state.config_dir, dir),
        None => Default::default(),
    };
    let config = resolve(state.project_config.as_ref(), &request, !skills.is_empty())
        .map_err(&fail)?;
    let credentials = resolve_credentials(&request).map_err(&fail)?;

    let stream = state.orchestrator.start(
        SessionInputs {
            config,
            credentials,
            uploads,
            skills,
            timeout,
        },
        request_id.clone(),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|err| fail(SquallError::AgentProcessFailed {
            subtype: None,
            message: format!("failed to build response: {err}"),
        }))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
///
/// Returns the server health status.
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

#[derive(OpenApi)]
#[openapi(
    paths(post_query, get_health),
    components(
        schemas(
            QueryRequest,
            HealthResponse,
            ProblemDetails,
            ErrorType,
            UploadRejectReason
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Agent session execution")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}
