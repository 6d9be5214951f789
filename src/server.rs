//! Streaming HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/analyze` | Run an analysis, streaming NDJSON events |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Request Body
//!
//! `POST /analyze` accepts either shape:
//!
//! ```json
//! { "appStoreIds": ["com.spotify.music", "com.apple.music"] }
//! { "messages": [{ "role": "user", "content": "com.a vs com.b" }], "user": "u1" }
//! ```
//!
//! # Response
//!
//! `200 OK` with `Content-Type: application/x-ndjson`: one JSON event per
//! line, flushed as produced. The HTTP status is committed before the
//! pipeline runs, so failures after the first byte arrive as in-stream
//! `status: error` events, not HTTP errors.
//!
//! # Error Contract
//!
//! Shape validation failures return before the stream starts:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "request must contain messages or appStoreIds" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients consuming the stream directly.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::models::StreamEvent;
use crate::orchestrator::{AnalysisRequest, Orchestrator};

/// Events buffered between the pipeline and a slow consumer before
/// producers start applying backpressure.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Start the HTTP server and serve until the process is terminated.
pub async fn run_server(bind: &str, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { orchestrator });

    tracing::info!(%bind, "server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
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
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
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
    }
}

// ============ Request parsing ============

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeBody {
    #[serde(default)]
    messages: Option<Vec<ChatMessageBody>>,
    #[serde(default)]
    app_store_ids: Option<Vec<String>>,
    #[serde(default)]
    user: Option<String>,
}

/// Shape-validate the request body into an [`AnalysisRequest`].
fn parse_request(body: AnalyzeBody) -> Result<AnalysisRequest, AppError> {
    if let Some(ids) = body.app_store_ids {
        if ids.iter().all(|id| id.trim().is_empty()) {
            return Err(bad_request("appStoreIds must contain at least one id"));
        }
        return Ok(AnalysisRequest {
            app_ids: ids
                .into_iter()
                .filter(|id| !id.trim().is_empty())
                .collect(),
            turns: Vec::new(),
            user: body.user,
        });
    }

    let Some(messages) = body.messages else {
        return Err(bad_request(
            "request must contain messages or appStoreIds",
        ));
    };
    let turns: Vec<String> = messages
        .into_iter()
        .filter(|m| m.role == "user" && !m.content.trim().is_empty())
        .map(|m| m.content)
        .collect();
    if turns.is_empty() {
        return Err(bad_request("messages must contain at least one user turn"));
    }

    Ok(AnalysisRequest {
        app_ids: Vec::new(),
        turns,
        user: body.user,
    })
}

// ============ Handlers ============

async fn handle_analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Response, AppError> {
    let request = parse_request(body)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(CHANNEL_CAPACITY);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.run(request, tx).await;
    });

    let lines = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| {
            r#"{"type":"status","status":"error","message":"serialization failure"}"#.to_string()
        });
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: e.to_string(),
        })?;
    Ok(response)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
