use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::llm::{LlmSettings, Message, Orchestrator, TurnLimits};
use crate::mcp::aggregator::Aggregator;
use crate::mcp::config::{ServerDescriptor, ServerMap, validate_server_name};
use crate::mcp::session::RmcpConnector;
use crate::mcp::store::{FileRegistry, ServerRegistry};
use crate::normalized::axum_event;
use crate::tools;

/// Start the Axum server with the provided configuration.
///
/// Runs until Ctrl-C. Shutdown cancels every turn still streaming so their
/// tool sessions close before the process exits.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        provider = ?settings.provider,
        "LLM configuration loaded"
    );

    let registry: Arc<dyn ServerRegistry> =
        Arc::new(FileRegistry::new(&config.mcp.registry_path));
    match registry.list().await {
        Ok(servers) => {
            for (name, descriptor) in &servers {
                info!(
                    name: "mcp.server.registered",
                    server = %name,
                    transport = descriptor.transport(),
                    "MCP server registered"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "MCP registry unreadable; turns will use built-in tools only"),
    }

    let aggregator = Aggregator::new(
        Arc::new(RmcpConnector::new(config.chat.connect_timeout())),
        tools::builtin_tools(&config.chat),
        config.chat.connect_timeout(),
    );
    for name in aggregator.builtin_namespace().names() {
        info!(name: "tool.builtin.registered", tool = %name, "Built-in tool registered");
    }

    let orchestrator = Orchestrator::new(
        settings,
        Arc::clone(&registry),
        aggregator,
        TurnLimits::from(&config.chat),
    )
    .with_system_prompt(tools::system_prompt(&config.chat));

    let state = AppState::new(Arc::new(orchestrator), Arc::clone(&config));
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!(name: "server.shutdown", "Shutting down; cancelling active turns");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

/// Routes, middleware and state.
pub fn build_router(state: AppState) -> Router {
    let timeout_duration = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/mcp",
            get(list_servers).post(add_server).delete(remove_server),
        )
        .route("/api/tools", get(list_tools))
        .route("/api/chat", post(api_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout_duration, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
                }
            },
        ))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// JSON error response: `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match err {
            BridgeError::Config { .. } => StatusCode::BAD_REQUEST,
            BridgeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/mcp - the configured servers, keyed by name.
async fn list_servers(State(state): State<AppState>) -> Result<Json<ServerMap>, ApiError> {
    Ok(Json(state.registry.list().await?))
}

fn server_name(body: &Value) -> Result<String, ApiError> {
    let name = body
        .get("mcpServer")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Invalid server name"))?;
    validate_server_name(name).map_err(|e| {
        tracing::debug!(error = %e, "rejected server name");
        ApiError::bad_request("Invalid server name")
    })?;
    Ok(name.to_string())
}

/// POST /api/mcp `{ "mcpServer": name, "config": descriptor }`
async fn add_server(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = server_name(&body)?;
    let raw = body.get("config").cloned().unwrap_or(Value::Null);
    let descriptor = ServerDescriptor::from_value(&name, raw).map_err(|e| {
        tracing::warn!(server = %name, error = %e, "rejected server configuration");
        ApiError::bad_request("Invalid server configuration")
    })?;

    state.registry.add(&name, descriptor).await?;
    info!(name: "mcp.server.added", server = %name, "MCP server saved");
    Ok(Json(json!({ "success": true, "mcpServer": name })))
}

/// DELETE /api/mcp `{ "mcpServer": name }`. Removing an absent name succeeds.
async fn remove_server(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = server_name(&body)?;
    let existed = state.registry.remove(&name).await?;
    info!(name: "mcp.server.removed", server = %name, existed, "MCP server removed");
    Ok(Json(json!({ "success": true, "mcpServer": name })))
}

/// GET /api/tools - what the model would be offered right now.
///
/// Opens sessions to every configured server, so this costs as much as the
/// start of a turn. The sessions are closed before responding.
async fn list_tools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.registry.list().await?;
    let aggregated = state.orchestrator.aggregator().build(&snapshot).await;
    aggregated.sessions.close_all();

    let tools: Vec<Value> = aggregated
        .namespace
        .tools()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "origin": tool.origin,
            })
        })
        .collect();

    Ok(Json(json!({
        "tools": tools,
        "failures": aggregated.failures,
        "collisions": aggregated.namespace.collisions(),
    })))
}

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// Conversation so far, oldest first.
    messages: Vec<Message>,
}

/// POST /api/chat - run one turn and stream it as SSE.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    tracing::info!(message_count = req.messages.len(), "Received chat request");

    let events = state
        .orchestrator
        .run_turn(req.messages, state.shutdown.child_token())
        .map(|evt| Ok(axum_event(&evt)));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
