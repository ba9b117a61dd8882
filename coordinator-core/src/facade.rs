//! Coordinator Façade — §4.6, §6.1.
//!
//! Dispatches the external HTTP/WebSocket surface to the `Coordinator`.
//! Router composition, the `{"error": "..."}` envelope, and the CORS layer
//! are carried over near-verbatim from the teacher's `operator_api.rs`;
//! the teacher's single `SessionAuth` extractor is split into three small
//! `FromRequestParts` impls, one per auth class named in §6.1.

use crate::auth;
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::frames::{ClientFrame, SandboxEvent, ServerFrame, close_code};
use crate::model::{EventType, MessageSource, MessageStatus, ParticipantRole, now_ms};
use crate::session::Coordinator;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, warn};

pub type AppState = Arc<Coordinator>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<crate::error::ErrorEnvelope>) {
    (status, Json(crate::error::ErrorEnvelope { error: msg.into() }))
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_envelope())).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth extractors — §6.1
// ---------------------------------------------------------------------------

/// No credentials required: `/health`, webhook receivers (verified by their own signature).
pub struct Public;

impl<S: Send + Sync> FromRequestParts<S> for Public {
    type Rejection = (StatusCode, Json<crate::error::ErrorEnvelope>);

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        Ok(Public)
    }
}

/// Service-to-service HMAC auth: every non-public, non-sandbox route.
pub struct ServiceAuth;

impl<S: Send + Sync> FromRequestParts<S> for ServiceAuth {
    type Rejection = (StatusCode, Json<crate::error::ErrorEnvelope>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Some(secret) = Config::load().internal_callback_secret.as_deref() else {
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal authentication not configured"));
        };
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing Authorization header"))?;
        let token = auth::extract_bearer_token(header_value)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
        auth::verify_service_token(token, secret, now_ms())
            .map_err(|err| api_error(StatusCode::UNAUTHORIZED, err.to_string()))?;
        Ok(ServiceAuth)
    }
}

/// Sandbox bearer auth for `POST /sessions/:id/pr`: the Façade delegates
/// token validation to the coordinator's own `Sandbox.auth_token` (§6.1).
pub struct SandboxAuth {
    pub bearer: String,
}

impl<S: Send + Sync> FromRequestParts<S> for SandboxAuth {
    type Rejection = (StatusCode, Json<crate::error::ErrorEnvelope>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing Authorization header"))?;
        let bearer = auth::extract_bearer_token(header_value)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
        Ok(SandboxAuth { bearer: bearer.to_string() })
    }
}

/// Either a service caller or an authenticated sandbox may request a PR
/// (§6.1, seed scenario 6): accept whichever class is presented.
pub enum PrAuth {
    Service,
    Sandbox(String),
}

impl FromRequestParts<AppState> for PrAuth {
    type Rejection = (StatusCode, Json<crate::error::ErrorEnvelope>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        if let Ok(ServiceAuth) = ServiceAuth::from_request_parts(parts, state).await {
            return Ok(PrAuth::Service);
        }
        let sandbox_auth = SandboxAuth::from_request_parts(parts, state).await?;
        Ok(PrAuth::Sandbox(sandbox_auth.bearer))
    }
}

// ---------------------------------------------------------------------------
// CORS — carried over from the teacher's build_cors_layer()
// ---------------------------------------------------------------------------

fn build_cors_layer() -> CorsLayer {
    use axum::http::Method;

    let allowed_methods = vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let allowed_headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT];
    let origins_env = Config::load().cors_allowed_origins.clone();

    if origins_env.is_empty() || origins_env == "*" {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<_> = origins_env.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
            .allow_credentials(true)
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSessionBody {
    session_name: String,
    repo_owner: String,
    repo_name: String,
    repo_default_branch: String,
}

#[derive(Deserialize)]
struct PromptBody {
    author_id: String,
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_source")]
    source: MessageSource,
}

fn default_source() -> MessageSource {
    MessageSource::Web
}

#[derive(Deserialize)]
struct AddParticipantBody {
    user_id: String,
    #[serde(default = "default_role")]
    role: ParticipantRole,
}

fn default_role() -> ParticipantRole {
    ParticipantRole::Member
}

#[derive(Deserialize)]
struct PrBody {
    installation_id: String,
}

#[derive(Deserialize)]
struct EventsQuery {
    cursor: Option<i64>,
    limit: Option<usize>,
    #[serde(rename = "type")]
    event_type: Option<EventType>,
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct MessagesQuery {
    status: Option<MessageStatus>,
}

#[derive(Serialize)]
struct Paginated<T: Serialize> {
    items: Vec<T>,
    cursor: Option<i64>,
    #[serde(rename = "hasMore")]
    has_more: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(_: Public) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": crate::metrics::uptime_secs(),
    }))
}

async fn prometheus_metrics(_: Public) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        crate::metrics::metrics().render_prometheus(),
    )
}

async fn list_sessions(_: ServiceAuth, State(state): State<AppState>) -> Result<impl IntoResponse> {
    let sessions = state.list_sessions()?;
    Ok(Json(serde_json::json!({ "items": sessions, "cursor": null::<i64>, "hasMore": false })))
}

async fn create_session(_: ServiceAuth, State(state): State<AppState>, Json(body): Json<CreateSessionBody>) -> Result<impl IntoResponse> {
    let session = state.create_session(body.session_name, body.repo_owner, body.repo_name, body.repo_default_branch)?;
    Ok(Json(session))
}

async fn get_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.get_session(&id)?))
}

async fn delete_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    state.delete_session(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.archive_session(&id)?))
}

async fn unarchive_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.unarchive_session(&id)?))
}

async fn warm_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    let session = state.get_session(&id)?;
    let params = crate::provider::CreateSandboxConfig {
        session_id: session.id.clone(),
        repo_owner: session.repo_owner.clone(),
        repo_name: session.repo_name.clone(),
        base_sha: session.base_sha.clone(),
        cpu_cores: 2,
        memory_mb: 2048,
    };
    state.lifecycle.warm(&session.id, &params).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn enqueue_prompt(
    _: ServiceAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PromptBody>,
) -> Result<impl IntoResponse> {
    let session = state.get_session(&id)?;
    let (message, position) = state
        .enqueue_prompt(&session, body.author_id, body.content, body.model, body.source)
        .await?;
    Ok(Json(serde_json::json!({ "message_id": message.id, "position": position })))
}

async fn stop_session(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    let session = state.get_session(&id)?;
    state.stop(&session).await?;
    Ok(StatusCode::OK)
}

async fn list_events(
    _: ServiceAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let (items, cursor, has_more) = state.list_events(&id, q.cursor, limit, q.event_type, q.message_id.as_deref())?;
    Ok(Json(Paginated { items, cursor, has_more }))
}

async fn list_artifacts(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.list_artifacts(&id)?))
}

async fn list_participants(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.list_participants(&id)?))
}

async fn add_participant(
    _: ServiceAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddParticipantBody>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.add_participant(&id, body.user_id, body.role)?))
}

async fn list_messages(
    _: ServiceAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.list_messages(&id, q.status)?))
}

async fn mint_ws_token(_: ServiceAuth, State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<AddParticipantBody>) -> Result<impl IntoResponse> {
    let participant = state.add_participant(&id, body.user_id, body.role)?;
    let token = state.mint_ws_token(&participant.id)?;
    Ok(Json(serde_json::json!({ "token": token, "participant_id": participant.id })))
}

async fn create_pr(
    auth: PrAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PrBody>,
) -> Result<impl IntoResponse> {
    let session = state.get_session(&id)?;
    if let PrAuth::Sandbox(bearer) = &auth {
        let sandbox = state
            .sandboxes
            .find(|s| s.session_id == session.id)?
            .ok_or_else(|| CoordinatorError::NotFound("no sandbox for session".into()))?;
        if sandbox.refused_at_socket_upgrade() {
            return Err(CoordinatorError::Gone("sandbox is stopped or stale".into()));
        }
        if !auth::sandbox_token_matches(bearer, &sandbox.auth_token) {
            return Err(CoordinatorError::Unauthenticated("invalid sandbox bearer token".into()));
        }
    }
    let artifact = state.create_pull_request(&session, &body.installation_id).await?;
    Ok(Json(artifact))
}

// ---------------------------------------------------------------------------
// WebSocket routes — §4.4, §6.1, §6.2
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if q.kind.as_deref() == Some("sandbox") {
        return ws_sandbox_upgrade(state, id, headers, ws).await;
    }
    ws.on_upgrade(move |socket| handle_client_socket(state, id, socket))
}

async fn ws_sandbox_upgrade(state: AppState, session_id: String, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer_token);
    let object_id = headers.get("X-Sandbox-ID").and_then(|v| v.to_str().ok());

    let (Some(bearer), Some(object_id)) = (bearer, object_id) else {
        return (StatusCode::UNAUTHORIZED, "missing sandbox credentials").into_response();
    };

    let sandbox = match state.sandboxes.find(|s| s.session_id == session_id) {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, "no sandbox for session").into_response(),
        Err(err) => return err.into_response(),
    };
    if sandbox.refused_at_socket_upgrade() {
        return (StatusCode::GONE, "sandbox is stopped or stale").into_response();
    }
    if !auth::sandbox_token_matches(bearer, &sandbox.auth_token) || sandbox.provider_object_id.as_deref() != Some(object_id) {
        return (StatusCode::UNAUTHORIZED, "invalid sandbox credentials").into_response();
    }

    let object_id = object_id.to_string();
    ws.on_upgrade(move |socket| handle_sandbox_socket(state, session_id, object_id, socket))
}

async fn handle_client_socket(state: AppState, session_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let subscribed = tokio::time::timeout(Config::load().ws_auth_timeout, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(ClientFrame::Subscribe { token, client_id, resume_ws_id }) = serde_json::from_str(&text) {
                    return Some((token, client_id, resume_ws_id));
                }
            }
        }
        None
    })
    .await;

    let Ok(Some((token, client_id, resume_ws_id))) = subscribed else {
        let _ = tx.send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: close_code::AUTH_TIMEOUT,
            reason: "authentication timeout".into(),
        })));
        forward.abort();
        return;
    };

    let participant = match state.participant_by_ws_token(&session_id, &token) {
        Ok(Some(p)) => p,
        _ => {
            let _ = tx.send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                code: close_code::INVALID_AUTH,
                reason: "invalid auth token".into(),
            })));
            forward.abort();
            return;
        }
    };

    // §4.4 hibernation recovery: a client that remembers its prior `ws_id`
    // presents it to recover the `ws_client_mapping` row left behind by the
    // connection that existed before the runtime holding it was discarded.
    // Absence of that row (GC'd, expired, or never existed) means the old
    // identity is unrecoverable — close 4002 and make the client fall back
    // to a plain (non-resuming) subscribe.
    let ws_id = if let Some(resume_id) = resume_ws_id {
        match state.ws_client_mapping.get(&resume_id) {
            Ok(Some(row)) if row.session_id == session_id && row.participant_id == participant.id => resume_id,
            _ => {
                let _ = tx.send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: close_code::STATE_LOST_AFTER_HIBERNATION,
                    reason: "no recoverable state for that ws_id, reconnect fresh".into(),
                })));
                forward.abort();
                return;
            }
        }
    } else {
        crate::model::new_id()
    };

    let mapping = crate::model::WsClientMapping {
        ws_id: ws_id.clone(),
        session_id: session_id.clone(),
        participant_id: participant.id.clone(),
        client_id: client_id.clone(),
        created_at: now_ms(),
    };
    if state.ws_client_mapping.insert(ws_id.clone(), mapping).is_err() {
        warn!(session_id, "failed to persist ws_client_mapping");
    }

    let runtime = state.runtime_for(&session_id);
    runtime.hub.register_client(ws_id.clone(), tx.clone());
    crate::metrics::metrics().active_client_sockets.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let session = match state.get_session(&session_id) {
        Ok(s) => s,
        Err(_) => {
            forward.abort();
            return;
        }
    };
    let subscribed_frame = ServerFrame::Subscribed {
        session_id: session.id.clone(),
        state: format!("{:?}", session.status).to_lowercase(),
        participant_id: participant.id.clone(),
        participant: serde_json::to_value(&participant).ok(),
    };
    if let Ok(text) = serde_json::to_string(&subscribed_frame) {
        let _ = tx.send(WsMessage::Text(text.into()));
    }

    while let Some(Ok(msg)) = stream.next().await {
        let WsMessage::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
        match frame {
            ClientFrame::Ping => {
                let pong = ServerFrame::Pong { timestamp: now_ms() };
                if let Ok(text) = serde_json::to_string(&pong) {
                    let _ = tx.send(WsMessage::Text(text.into()));
                }
            }
            ClientFrame::Subscribe { .. } => {
                let _ = tx.send(WsMessage::Text(serde_json::to_string(&subscribed_frame).unwrap_or_default().into()));
            }
            ClientFrame::Prompt { content, model, attachments: _ } => {
                if let Ok(session) = state.get_session(&session_id) {
                    let _ = state
                        .enqueue_prompt(&session, participant.id.clone(), content, model, MessageSource::Web)
                        .await;
                }
            }
            ClientFrame::Stop => {
                if let Ok(session) = state.get_session(&session_id) {
                    let _ = state.stop(&session).await;
                }
            }
            ClientFrame::Typing => {
                if let Ok(session) = state.get_session(&session_id) {
                    let params = crate::provider::CreateSandboxConfig {
                        session_id: session.id.clone(),
                        repo_owner: session.repo_owner.clone(),
                        repo_name: session.repo_name.clone(),
                        base_sha: session.base_sha.clone(),
                        cpu_cores: 2,
                        memory_mb: 2048,
                    };
                    let _ = state.lifecycle.warm(&session.id, &params).await;
                }
            }
            ClientFrame::Presence { .. } => {
                debug!(session_id, "presence frame received, not yet modeled beyond broadcast");
            }
        }
    }

    runtime.hub.remove_client(&ws_id);
    crate::metrics::metrics().active_client_sockets.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    forward.abort();
}

async fn handle_sandbox_socket(state: AppState, session_id: String, object_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let runtime = state.runtime_for(&session_id);
    runtime.hub.set_sandbox(object_id.clone(), tx);

    if let Ok(Some(sandbox)) = state.sandboxes.find(|s| s.session_id == session_id) {
        let _ = state.lifecycle.mark_connected(&sandbox.id);
    }

    while let Some(Ok(msg)) = stream.next().await {
        let WsMessage::Text(text) = msg else { continue };
        let Ok(event) = serde_json::from_str::<SandboxEvent>(&text) else { continue };
        if let (Ok(session), Ok(Some(sandbox))) = (state.get_session(&session_id), state.sandboxes.find(|s| s.session_id == session_id)) {
            let _ = state.handle_sandbox_event(&session, &sandbox.id, event).await;
        }
    }

    if runtime.hub.has_sandbox_socket_for(&object_id) {
        runtime.hub.clear_sandbox();
    }
    forward.abort();
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let session_routes = Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/warm", post(warm_session))
        .route("/sessions/{id}/prompt", post(enqueue_prompt))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/events", get(list_events))
        .route("/sessions/{id}/artifacts", get(list_artifacts))
        .route("/sessions/{id}/participants", get(list_participants).post(add_participant))
        .route("/sessions/{id}/messages", get(list_messages))
        .route("/sessions/{id}/pr", post(create_pr))
        .route("/sessions/{id}/ws-token", post(mint_ws_token))
        .route("/sessions/{id}/archive", post(archive_session))
        .route("/sessions/{id}/unarchive", post(unarchive_session))
        .route("/sessions/{id}/ws", get(ws_upgrade));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(session_routes)
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Once;
    use tower::util::ServiceExt;

    static INIT: Once = Once::new();
    fn init() {
        INIT.call_once(|| {
            let dir = std::env::temp_dir().join(format!("facade-test-{}", std::process::id()));
            std::fs::create_dir_all(&dir).ok();
            unsafe {
                std::env::set_var("COORDINATOR_STATE_DIR", dir);
                std::env::set_var("INTERNAL_CALLBACK_SECRET", "test-secret");
            }
        });
    }

    fn app() -> Router {
        let coordinator = Arc::new(Coordinator::open().unwrap());
        router(coordinator)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn service_auth_header() -> String {
        let token = auth::mint_service_token("test-secret", now_ms()).unwrap();
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn health_is_unauthenticated() {
        init();
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_sessions_requires_service_auth() {
        init();
        let response = app()
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_and_fetch_session_round_trips() {
        init();
        let app = app();
        let body = serde_json::json!({
            "session_name": "acme-widgets-pr-42",
            "repo_owner": "Acme",
            "repo_name": "Widgets",
            "repo_default_branch": "main",
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sessions")
                    .header(header::AUTHORIZATION, service_auth_header())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response.into_body()).await;
        assert_eq!(created["repo_owner"], "acme");
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/sessions/{id}"))
                    .header(header::AUTHORIZATION, service_auth_header())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
