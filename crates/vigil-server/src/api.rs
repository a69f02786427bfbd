use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, Method, StatusCode},
    middleware,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use vigil_shared::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, PROTOCOL_VERSION};
use vigil_shared::protocol::Frame;
use vigil_shared::types::{
    ConversationSummary, Message, MessageId, MessageType, PresenceEntry, User, UserId,
};
use vigil_store::{Database, NewMessage};

use crate::auth::{bearer_token, verify_admin_token, AuthUser};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub presence: Arc<dyn PresenceRegistry>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/conversations", get(list_conversations))
        .route("/messages", post(send_message))
        .route("/messages/read", patch(mark_read))
        .route("/messages/read-all/:sender_id", patch(mark_all_read))
        .route("/messages/:user_id", get(conversation_messages))
        .route("/online-users", get(online_users))
        .route("/user-status/:user_id", get(user_status))
        .route("/session", delete(logout))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/users/:user_id", get(admin_get_user))
        .route("/admin/sessions", post(admin_create_session))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    uptime_secs: u64,
    heartbeat_timeout_secs: u64,
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    receiver_id: UserId,
    content: String,
    #[serde(rename = "type", default)]
    message_type: MessageType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    message_ids: Vec<MessageId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    updated: usize,
    message_ids: Vec<MessageId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    username: String,
    display_name: Option<String>,
}

#[derive(Serialize)]
struct CreateUserResponse {
    user: User,
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    user_id: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    user_id: UserId,
    token: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.presence.active_users().await.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        heartbeat_timeout_secs: state.config.heartbeat_timeout.as_secs(),
    })
}

async fn list_conversations(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let summaries = state.db.lock().await.list_conversations(me)?;
    Ok(Json(summaries))
}

async fn conversation_messages(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let other = parse_user_id(&user_id)?;
    let Query(page) = query.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = page.offset.unwrap_or(0);

    let db = state.db.lock().await;
    if !db.user_exists(other)? {
        return Err(ServerError::NotFound(format!("user {other}")));
    }
    let messages = db.get_conversation_messages(me, other, limit, offset)?;
    Ok(Json(messages))
}

async fn online_users(
    AuthUser(_me): AuthUser,
    State(state): State<AppState>,
) -> Json<Vec<UserId>> {
    Json(state.presence.active_users().await)
}

async fn user_status(
    AuthUser(_me): AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceEntry>, ServerError> {
    let user_id = parse_user_id(&user_id)?;
    if !state.db.lock().await.user_exists(user_id)? {
        return Err(ServerError::NotFound(format!("user {user_id}")));
    }
    Ok(Json(PresenceEntry {
        user_id,
        status: state.presence.status(user_id).await,
    }))
}

/// Persist first; only a stored message is pushed to the receiver. The sender
/// gets the stored message in the response and no socket echo.
async fn send_message(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let Json(req) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    if req.content.trim().is_empty() {
        return Err(ServerError::BadRequest("Message content is empty".into()));
    }
    let len = req.content.chars().count();
    if len > state.config.max_message_len {
        return Err(ServerError::BadRequest(format!(
            "Message too long: {len} chars (max {})",
            state.config.max_message_len
        )));
    }
    if req.receiver_id == me {
        return Err(ServerError::BadRequest("Cannot message yourself".into()));
    }

    let message = {
        let db = state.db.lock().await;
        if !db.user_exists(req.receiver_id)? {
            return Err(ServerError::NotFound(format!("user {}", req.receiver_id)));
        }
        db.insert_message(&NewMessage {
            sender_id: me,
            receiver_id: req.receiver_id,
            content: req.content,
            message_type: req.message_type,
        })?
    };

    let delivered = state
        .presence
        .send_to_user(
            message.receiver_id,
            Frame::Message {
                message: message.clone(),
            },
        )
        .await;

    info!(
        id = %message.id,
        from = %me,
        to = %message.receiver_id,
        delivered,
        "Message stored"
    );

    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<MarkReadRequest>, JsonRejection>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let Json(req) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    if req.message_ids.is_empty() {
        return Err(ServerError::BadRequest("messageIds must not be empty".into()));
    }

    let flipped = state
        .db
        .lock()
        .await
        .mark_read(me, &req.message_ids)
        .map_err(|e| match e {
            vigil_store::StoreError::NotFound => {
                ServerError::NotFound("one or more messages not found".into())
            }
            other => other.into(),
        })?;

    // Receipts only for messages that actually flipped; offline senders
    // catch up on their next fetch.
    for message in &flipped {
        state
            .presence
            .send_to_user(
                message.sender_id,
                Frame::MessageRead {
                    message_id: message.id,
                    read_by: me,
                },
            )
            .await;
    }

    Ok(Json(MarkReadResponse {
        updated: flipped.len(),
        message_ids: flipped.iter().map(|m| m.id).collect(),
    }))
}

async fn mark_all_read(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(sender_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let sender = parse_user_id(&sender_id)?;

    let flipped = {
        let db = state.db.lock().await;
        if !db.user_exists(sender)? {
            return Err(ServerError::NotFound(format!("user {sender}")));
        }
        db.mark_all_read(me, sender)?
    };

    if !flipped.is_empty() {
        state
            .presence
            .send_to_user(
                sender,
                Frame::AllMessagesRead {
                    read_by: me,
                    count: flipped.len() as u64,
                },
            )
            .await;
    }

    Ok(Json(MarkReadResponse {
        updated: flipped.len(),
        message_ids: flipped,
    }))
}

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateUserResponse>), ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let Json(req) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let username = req.username.trim();
    if username.is_empty() {
        return Err(ServerError::BadRequest("username must not be empty".into()));
    }

    let (user, token) = {
        let db = state.db.lock().await;
        let user = db.create_user(username, req.display_name.as_deref())?;
        let token = db.create_session(user.id)?;
        (user, token)
    };

    info!(user = %user.id, username = %user.username, "Admin created user");
    Ok((StatusCode::CREATED, Json(CreateUserResponse { user, token })))
}

async fn admin_create_session(
    headers: HeaderMap,
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let Json(req) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let token = state.db.lock().await.create_session(req.user_id)?;

    info!(user = %req.user_id, "Admin issued session");
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            user_id: req.user_id,
            token,
        }),
    ))
}

async fn admin_get_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let user_id = parse_user_id(&user_id)?;
    let user = state.db.lock().await.get_user(user_id)?;
    Ok(Json(user))
}

/// Revoke the caller's own session token.
async fn logout(
    AuthUser(me): AuthUser,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<StatusCode, ServerError> {
    let token = bearer_token(&headers).ok_or(ServerError::Unauthorized)?;
    state.db.lock().await.revoke_session(token)?;
    info!(user = %me, "Session revoked");
    Ok(StatusCode::NO_CONTENT)
}

fn parse_user_id(raw: &str) -> Result<UserId, ServerError> {
    UserId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
