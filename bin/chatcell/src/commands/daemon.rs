use chatcell_agent::{Orchestrator, SendRequest};
use chatcell_core::{Config, ErrorRecord, Paths};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use axum::{
    extract::{Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// ---------------------------------------------------------------------------
// Shared state passed to HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DaemonState {
    orchestrator: Arc<Orchestrator>,
    api_token: Option<String>,
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Bearer token authentication middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<DaemonState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let token = match &state.api_token {
        Some(t) if !t.is_empty() => t,
        _ => return next.run(req).await,
    };

    if req.uri().path() == "/status" {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|presented| secure_eq(presented, token))
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing Bearer token").into_response()
    }
}

// ---------------------------------------------------------------------------
// HTTP request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TargetBody {
    #[serde(alias = "ai")]
    target: String,
}

#[derive(Deserialize)]
struct SwitchBody {
    #[serde(alias = "ai")]
    target: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct ExportBody {
    #[serde(alias = "ai")]
    target: String,
    #[serde(default)]
    output_path: Option<PathBuf>,
}

/// Domain results always travel as HTTP 200 with a `success` flag.
fn reply<T: Serialize>(result: Result<T, ErrorRecord>) -> Json<Value> {
    match result.map(|fields| serde_json::to_value(fields)) {
        Ok(Ok(Value::Object(fields))) => {
            let mut body = serde_json::Map::new();
            body.insert("success".to_string(), Value::Bool(true));
            body.extend(fields);
            Json(Value::Object(body))
        }
        Ok(Ok(other)) => Json(json!({ "success": true, "result": other })),
        Ok(Err(e)) => {
            error!(error = %e, "Failed to serialize response");
            Json(json!({ "success": false, "error": e.to_string() }))
        }
        Err(err) => Json(json!({ "success": false, "error": err })),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_send(State(state): State<DaemonState>, Json(req): Json<SendRequest>) -> impl IntoResponse {
    Json(state.orchestrator.send(req).await)
}

async fn handle_status(State(state): State<DaemonState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

async fn handle_chats_list(State(state): State<DaemonState>, Query(q): Query<TargetBody>) -> impl IntoResponse {
    let o = &state.orchestrator;
    let result = match o.list_chats(&q.target).await {
        Ok(chats) => o
            .current_chat(&q.target)
            .await
            .map(|current| json!({ "target": q.target, "chats": chats, "current": current })),
        Err(e) => Err(e),
    };
    reply(result)
}

async fn handle_chats_new(State(state): State<DaemonState>, Json(b): Json<TargetBody>) -> impl IntoResponse {
    let result = state.orchestrator.new_chat(&b.target).await;
    reply(result.map(|chat| json!({ "target": b.target, "chat": chat })))
}

async fn handle_chats_switch(State(state): State<DaemonState>, Json(b): Json<SwitchBody>) -> impl IntoResponse {
    let result = state.orchestrator.switch_chat(&b.target, &b.chat_id).await;
    reply(result.map(|chat| json!({ "target": b.target, "chat": chat })))
}

async fn handle_chats_export(State(state): State<DaemonState>, Json(b): Json<ExportBody>) -> impl IntoResponse {
    let result = state
        .orchestrator
        .export_chat(&b.target, b.output_path.as_deref())
        .await;
    reply(result.map(|export| match export {
        Some(e) => json!({
            "target": b.target,
            "chat": e.chat,
            "markdown": e.markdown,
            "message_count": e.message_count,
            "output_path": b.output_path,
        }),
        None => json!({
            "target": b.target,
            "chat": null,
            "markdown": null,
            "message_count": 0,
            "output_path": null,
        }),
    }))
}

async fn handle_session_new(State(state): State<DaemonState>, Json(b): Json<TargetBody>) -> impl IntoResponse {
    let result = state.orchestrator.new_session(&b.target).await;
    reply(result.map(|()| json!({ "target": b.target })))
}

async fn handle_model_invalidate(State(state): State<DaemonState>, Json(b): Json<TargetBody>) -> impl IntoResponse {
    let result = state.orchestrator.invalidate_model(&b.target).await;
    reply(result.map(|()| json!({ "target": b.target })))
}

pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/send", post(handle_send))
        .route("/status", get(handle_status))
        .route("/chats/list", get(handle_chats_list))
        .route("/chats/new", post(handle_chats_new))
        .route("/chats/switch", post(handle_chats_switch))
        .route("/chats/export", post(handle_chats_export))
        .route("/session/new", post(handle_session_new))
        .route("/session/model/invalidate", post(handle_model_invalidate))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(CorsLayer::permissive().allow_credentials(false))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1")
}

pub async fn run(
    config_path: Option<PathBuf>,
    init_config: bool,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = config_path.unwrap_or_else(|| paths.config_file());

    if init_config {
        if config_path.exists() {
            println!("Config already exists at {}", config_path.display());
        } else {
            Config::default().save(&config_path)?;
            println!("Wrote default config to {}", config_path.display());
        }
        return Ok(());
    }

    if !config_path.exists() {
        info!(path = %config_path.display(), "No config file found, using defaults");
    }
    let config = Config::load_or_default(&config_path)?;

    let host = host.unwrap_or_else(|| config.daemon.host.clone());
    let port = port.unwrap_or(config.daemon.port);
    let grace = Duration::from_secs(config.daemon.shutdown_grace_secs);
    let api_token = config.daemon.api_token.clone().filter(|t| !t.is_empty());
    if api_token.is_none() && !is_loopback(&host) {
        warn!(host = %host, "Daemon exposed beyond loopback without daemon.apiToken");
    }

    let orchestrator = Orchestrator::start(config, &paths).await?;
    let app = router(DaemonState {
        orchestrator: orchestrator.clone(),
        api_token,
    });

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, assistants = ?orchestrator.assistant_ids(), "chatcell daemon listening");

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown_rx;
                let _ = rx.recv().await;
            })
            .await
    });

    // ── Wait for shutdown signal ──
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining interactions...");
    let deadline = tokio::time::Instant::now() + grace;
    let _ = shutdown_tx.send(());

    let abandoned = orchestrator.shutdown(grace).await;

    match tokio::time::timeout_at(deadline, &mut http_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server exited with error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => {
            warn!("HTTP server did not drain in the grace window, aborting");
            http_handle.abort();
        }
    }

    if abandoned.is_empty() {
        info!("Daemon stopped");
    } else {
        warn!(abandoned = ?abandoned, "Daemon stopped with interactions abandoned");
    }
    Ok(())
}
