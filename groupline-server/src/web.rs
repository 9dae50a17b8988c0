//! HTTP surface: the WebSocket endpoint, health, and the group REST API.
//!
//! Group endpoints authenticate with `Authorization: Bearer <token>` and
//! delegate to [`MembershipService`]. The messages endpoint is the REST
//! snapshot clients use to resync after reconnecting.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::Authenticator;
use crate::connection::{ConnectionSettings, handle_socket};
use crate::error::ServiceError;
use crate::hub::Hub;
use crate::membership::MembershipService;
use crate::persistence::RemovalOutcome;
use crate::types::{ChatMessage, GroupId, GroupMember, GroupSummary, InstanceId, UserId};

const DEFAULT_HISTORY: usize = 50;

pub struct AppState {
    pub hub: Hub,
    pub membership: MembershipService,
    pub auth: Arc<dyn Authenticator>,
    pub settings: ConnectionSettings,
    pub max_frame_bytes: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/groups", get(api_list_groups).post(api_create_group))
        .route(
            "/api/v1/groups/{id}",
            patch(api_rename_group).delete(api_delete_group),
        )
        .route(
            "/api/v1/groups/{id}/members",
            get(api_group_members).post(api_add_members),
        )
        .route("/api/v1/groups/{id}/members/{user_id}", delete(api_remove_member))
        .route("/api/v1/groups/{id}/leave", post(api_leave_group))
        .route("/api/v1/groups/{id}/messages", get(api_group_messages))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .with_state(state)
}

// ── Errors ─────────────────────────────────────────────────────────────

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = match &e {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Persist(_) | ServiceError::Store(_) => {
                tracing::error!("Request failed: {e}");
                return ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into());
            }
        };
        ApiError(status, e.to_string())
    }
}

fn bearer_user(headers: &HeaderMap, state: &AppState) -> Result<UserId, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(StatusCode::UNAUTHORIZED, "missing bearer token".into()))?;
    state
        .auth
        .verify(token.trim())
        .map_err(|e| ApiError(StatusCode::UNAUTHORIZED, e.to_string()))
}

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.hub.clone();
    let auth = Arc::clone(&state.auth);
    let settings = state.settings;
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, hub, auth, settings))
}

// ── REST API ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub instance_id: InstanceId,
    pub connections: usize,
    pub groups: usize,
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.hub.registry();
    Json(HealthResponse {
        instance_id: state.hub.instance_id(),
        connections: registry.client_count(),
        groups: registry.group_count(),
    })
}

#[derive(Deserialize)]
struct GroupNameRequest {
    name: String,
}

#[derive(Deserialize)]
struct AddMembersRequest {
    user_ids: Vec<UserId>,
}

#[derive(Serialize)]
struct AddMembersResponse {
    added: Vec<UserId>,
}

#[derive(Serialize)]
struct LeaveResponse {
    group_deleted: bool,
    promoted: Option<UserId>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn api_list_groups(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<GroupSummary>>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    Ok(Json(state.membership.list_groups(actor).await?))
}

async fn api_create_group(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupNameRequest>,
) -> Result<(StatusCode, Json<GroupSummary>), ApiError> {
    let actor = bearer_user(&headers, &state)?;
    let group = state.membership.create_group(actor, &req.name).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn api_rename_group(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupNameRequest>,
) -> Result<Json<GroupSummary>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    Ok(Json(state.membership.rename(actor, id, &req.name).await?))
}

async fn api_delete_group(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    state.membership.delete(actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_group_members(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<GroupMember>>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    Ok(Json(state.membership.members(actor, id).await?))
}

async fn api_add_members(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<AddMembersResponse>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    let added = state.membership.invite(actor, id, &req.user_ids).await?;
    Ok(Json(AddMembersResponse { added }))
}

async fn api_remove_member(
    headers: HeaderMap,
    Path((id, user_id)): Path<(GroupId, UserId)>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    state.membership.remove(actor, id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_leave_group(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<LeaveResponse>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    let response = match state.membership.leave(actor, id).await? {
        RemovalOutcome::GroupDeleted => LeaveResponse { group_deleted: true, promoted: None },
        RemovalOutcome::Removed { promoted } => LeaveResponse { group_deleted: false, promoted },
        RemovalOutcome::NotMember => LeaveResponse { group_deleted: false, promoted: None },
    };
    Ok(Json(response))
}

async fn api_group_messages(
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    Query(params): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let actor = bearer_user(&headers, &state)?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY);
    Ok(Json(state.membership.messages(actor, id, limit).await?))
}
