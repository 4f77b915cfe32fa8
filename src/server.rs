//! HTTP front door
//!
//! `GET /start` opens a conversation, `POST /chat` runs one turn,
//! `GET /health` answers liveness probes.

use crate::conversation::ConversationService;
use crate::error::{ChatError, Result, RunError};
use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const API_KEY_HEADER: &str = "X-API-KEY";

/// State shared across routes
#[derive(Clone)]
pub struct AppState {
    pub conversations: ConversationService,
    pub api_key: Arc<str>,
    /// Cancelled on shutdown; every chat turn runs under a child of it
    pub shutdown: CancellationToken,
}

/// Rejects requests whose `X-API-KEY` does not match the configured secret
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<AppState> for RequireApiKey {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|val| val.to_str().ok());

        match provided {
            Some(key) if key == &*state.api_key => Ok(RequireApiKey),
            Some(_) => {
                warn!("Rejected request with invalid API key");
                Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "Invalid API key"}))))
            }
            None => {
                warn!("Rejected request without API key");
                Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "Missing API key"}))))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub conversation_id: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/start", get(start_conversation))
        .route("/chat", post(chat))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// Serve until the shutdown token is cancelled
#[instrument(skip(state))]
pub async fn start_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("toolrelay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn start_conversation(_auth: RequireApiKey, State(state): State<AppState>) -> Response {
    match state.conversations.start().await {
        Ok(conversation_id) => Json(StartResponse { conversation_id }).into_response(),
        Err(e) => chat_error_response(e),
    }
}

async fn chat(
    _auth: RequireApiKey,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let conversation_id = match request.conversation_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            warn!("Chat request without conversation_id");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing conversation_id"})),
            )
                .into_response();
        }
    };

    // Cancelled on shutdown, or when this future is dropped on disconnect
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    match state
        .conversations
        .chat(&conversation_id, &request.message, &cancel)
        .await
    {
        Ok(response) => Json(ChatResponse { response }).into_response(),
        Err(e) => chat_error_response(e),
    }
}

fn chat_error_response(err: ChatError) -> Response {
    let status = match &err {
        ChatError::Run(RunError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        ChatError::Run(RunError::ToolDefect(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        ChatError::Run(RunError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    error!("Chat request failed ({}): {}", status, err);
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
