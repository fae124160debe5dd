//! Node API routes.
//!
//! ## Routes
//!
//! - `POST /nodes` - Create a node with its initial configuration
//! - `GET  /nodes` - List nodes, optionally filtered by status
//! - `GET  /nodes/{id}` - Get a node
//! - `GET  /nodes/{id}/revisions` - Page through a node's revisions
//! - `GET  /nodes/{id}/revisions/{rev}` - Get one revision
//! - `POST /nodes/{id}/desired-config` - Push a new desired configuration
//! - `POST /nodes/{id}/rollback` - Roll back to an earlier revision
//! - `POST /nodes/{id}/disable`, `/nodes/{id}/enable` - Toggle operator disable
//! - `POST /nodes/check-offline` - Run one offline sweep

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use fleet_control::revision::revision_for_node;
use fleet_control::{ConfigRevision, Node, NodeStatus, RevisionOrigin};
use fleet_core::{AgentToken, NodeId, Payload, RevisionNumber, ServerId};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody, ApiResult};
use crate::extract::{ApiJson, ApiQuery, OptionalApiJson};
use crate::server::AppState;

/// Page size used when a revision listing omits `limit`.
pub const DEFAULT_REVISION_PAGE_SIZE: usize = 50;

/// Request to create a node.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    /// Server the node runs on.
    pub server_id: String,
    /// Secret the node's agent will present.
    pub agent_token: String,
    /// Initial configuration (stored as revision 1).
    #[schema(value_type = Object)]
    pub desired_config: serde_json::Value,
}

/// Request to push a new desired configuration.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushConfigRequest {
    /// New configuration document.
    #[schema(value_type = Object)]
    pub desired_config: serde_json::Value,
}

/// Request to roll back a node.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    /// Revision to restore; defaults to the one before the current desired
    /// revision.
    #[serde(default)]
    pub to_revision: Option<u64>,
}

/// Node response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    /// Node ID.
    pub id: String,
    /// Server the node runs on.
    pub server_id: String,
    /// Display host from the server directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_host: Option<String>,
    /// Revision the operator wants running.
    pub desired_revision: u64,
    /// Revision the agent last reported.
    pub applied_revision: Option<u64>,
    /// `pending`, `success` or `failed`.
    pub last_apply_status: String,
    /// Detail from the last apply report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply_message: Option<String>,
    /// `pending`, `online`, `offline` or `disabled`.
    pub status: String,
    /// Last agent contact (RFC 3339).
    pub last_seen_at: Option<String>,
    /// Engine versions last reported by the agent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine_versions: BTreeMap<String, String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

/// List nodes response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListNodesResponse {
    /// Nodes, most recently seen first.
    pub nodes: Vec<NodeResponse>,
}

/// How a revision came to exist.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OriginResponse {
    /// `initial`, `push` or `rollback`.
    pub kind: String,
    /// Desired revision when the rollback was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<u64>,
    /// Revision whose payload was copied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<u64>,
}

/// Revision response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionResponse {
    /// Owning node.
    pub node_id: String,
    /// Revision number (1-based).
    pub revision_number: u64,
    /// Payload decoded as JSON, when it is JSON.
    #[schema(value_type = Option<Object>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config: Option<serde_json::Value>,
    /// Raw payload, base64.
    pub payload_base64: String,
    /// Provenance.
    pub origin: OriginResponse,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Actor who created the revision.
    pub created_by: String,
}

/// Revision page response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListRevisionsResponse {
    /// Revisions in ascending order.
    pub revisions: Vec<RevisionResponse>,
    /// Cursor for the next page; absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<u64>,
}

/// Offline sweep response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckOfflineResponse {
    /// Nodes transitioned to `offline` by this sweep.
    pub marked_offline: Vec<String>,
}

/// Query for `GET /nodes`.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListNodesQuery {
    /// Only return nodes in this status.
    pub status: Option<String>,
}

/// Query for `GET /nodes/{id}/revisions`.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListRevisionsQuery {
    /// Return revisions strictly after this number.
    pub after: Option<u64>,
    /// Page size.
    pub limit: Option<usize>,
}

/// Query for `POST /nodes/check-offline`.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct CheckOfflineQuery {
    /// Staleness threshold; defaults to the server configuration.
    pub offline_after_seconds: Option<u64>,
}

/// Creates node routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes", post(create_node).get(list_nodes))
        .route("/nodes/check-offline", post(check_offline))
        .route("/nodes/:id", get(get_node))
        .route("/nodes/:id/revisions", get(list_revisions))
        .route("/nodes/:id/revisions/:rev", get(get_revision))
        .route("/nodes/:id/desired-config", post(push_desired_config))
        .route("/nodes/:id/rollback", post(rollback))
        .route("/nodes/:id/disable", post(disable_node))
        .route("/nodes/:id/enable", post(enable_node))
}

/// Create a node.
///
/// POST /api/v1/nodes
#[utoipa::path(
    post,
    path = "/api/v1/nodes",
    tag = "nodes",
    request_body = CreateNodeRequest,
    responses(
        (status = 201, description = "Node created", body = NodeResponse),
        (status = 400, description = "Bad request", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn create_node(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let server_id = ServerId::new(req.server_id).map_err(|e| ctx.reject(e))?;
    let token = AgentToken::new(req.agent_token).map_err(|e| ctx.reject(e))?;
    let payload = json_payload(&ctx, &req.desired_config)?;

    tracing::info!(server_id = %server_id, actor = %ctx.actor, "Creating node");

    let node = state
        .plane
        .tracker()
        .create_node(server_id, &token, payload, &ctx.actor)
        .await
        .map_err(|e| ctx.reject(e))?;

    Ok((StatusCode::CREATED, Json(state.node_response(&node))))
}

/// List nodes.
///
/// GET /api/v1/nodes
#[utoipa::path(
    get,
    path = "/api/v1/nodes",
    tag = "nodes",
    params(ListNodesQuery),
    responses(
        (status = 200, description = "Nodes listed", body = ListNodesResponse),
        (status = 400, description = "Unknown status filter", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn list_nodes(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ListNodesQuery>,
) -> ApiResult<Json<ListNodesResponse>> {
    let status = query
        .status
        .as_deref()
        .map(NodeStatus::from_str)
        .transpose()
        .map_err(|e| ctx.reject(e))?;

    let nodes = state
        .plane
        .tracker()
        .list_nodes(status)
        .await
        .map_err(|e| ctx.reject(e))?
        .iter()
        .map(|node| state.node_response(node))
        .collect();

    Ok(Json(ListNodesResponse { nodes }))
}

/// Get a node.
///
/// GET /api/v1/nodes/{id}
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{id}",
    tag = "nodes",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node found", body = NodeResponse),
        (status = 404, description = "Node not found", body = ApiErrorBody),
    )
)]
pub(crate) async fn get_node(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeResponse>> {
    let node_id = parse_node_id(&ctx, &id)?;
    let node = state
        .plane
        .tracker()
        .get_node(&node_id)
        .await
        .map_err(|e| ctx.reject(e))?;
    Ok(Json(state.node_response(&node)))
}

/// Page through a node's revisions.
///
/// GET /api/v1/nodes/{id}/revisions
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{id}/revisions",
    tag = "revisions",
    params(("id" = String, Path, description = "Node ID"), ListRevisionsQuery),
    responses(
        (status = 200, description = "Revision page", body = ListRevisionsResponse),
        (status = 400, description = "Bad page size", body = ApiErrorBody),
        (status = 404, description = "Node not found", body = ApiErrorBody),
    )
)]
pub(crate) async fn list_revisions(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ListRevisionsQuery>,
) -> ApiResult<Json<ListRevisionsResponse>> {
    let node_id = parse_node_id(&ctx, &id)?;
    let after = query
        .after
        .filter(|n| *n > 0)
        .map(RevisionNumber::new)
        .transpose()
        .map_err(|e| ctx.reject(e))?;
    let limit = query.limit.unwrap_or(DEFAULT_REVISION_PAGE_SIZE);

    let page = state
        .plane
        .revisions()
        .list_revisions_page(&node_id, after, limit)
        .await
        .map_err(|e| ctx.reject(e))?;

    Ok(Json(ListRevisionsResponse {
        revisions: page.revisions.iter().map(revision_response).collect(),
        next_after: page.next_after.map(RevisionNumber::get),
    }))
}

/// Get one revision.
///
/// GET /api/v1/nodes/{id}/revisions/{rev}
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{id}/revisions/{rev}",
    tag = "revisions",
    params(
        ("id" = String, Path, description = "Node ID"),
        ("rev" = u64, Path, description = "Revision number"),
    ),
    responses(
        (status = 200, description = "Revision found", body = RevisionResponse),
        (status = 404, description = "Node or revision not found", body = ApiErrorBody),
        (status = 422, description = "Revision number out of range", body = ApiErrorBody),
    )
)]
pub(crate) async fn get_revision(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path((id, rev)): Path<(String, String)>,
) -> ApiResult<Json<RevisionResponse>> {
    let node_id = parse_node_id(&ctx, &id)?;
    let raw = rev.parse::<u64>().map_err(|_| {
        ctx.reject(ApiError::bad_request(format!(
            "revision must be a positive integer, got '{rev}'"
        )))
    })?;
    let revision = revision_for_node(&node_id, raw).map_err(|e| ctx.reject(e))?;

    let revision = state
        .plane
        .revisions()
        .get_revision(&node_id, revision)
        .await
        .map_err(|e| ctx.reject(e))?;
    Ok(Json(revision_response(&revision)))
}

/// Push a new desired configuration.
///
/// POST /api/v1/nodes/{id}/desired-config
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/desired-config",
    tag = "nodes",
    params(("id" = String, Path, description = "Node ID")),
    request_body = PushConfigRequest,
    responses(
        (status = 200, description = "Desired configuration updated", body = NodeResponse),
        (status = 404, description = "Node not found", body = ApiErrorBody),
        (status = 409, description = "Concurrent update", body = ApiErrorBody),
    )
)]
pub(crate) async fn push_desired_config(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<PushConfigRequest>,
) -> ApiResult<Json<NodeResponse>> {
    let node_id = parse_node_id(&ctx, &id)?;
    let payload = json_payload(&ctx, &req.desired_config)?;

    let node = state
        .plane
        .tracker()
        .push_desired_config(&node_id, payload, &ctx.actor)
        .await
        .map_err(|e| ctx.reject(e))?;
    Ok(Json(state.node_response(&node)))
}

/// Roll a node back to an earlier revision.
///
/// POST /api/v1/nodes/{id}/rollback
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/rollback",
    tag = "nodes",
    params(("id" = String, Path, description = "Node ID")),
    request_body = RollbackRequest,
    responses(
        (status = 200, description = "Rollback issued", body = NodeResponse),
        (status = 400, description = "Malformed request body", body = ApiErrorBody),
        (status = 404, description = "Node not found", body = ApiErrorBody),
        (status = 422, description = "Target revision not in history", body = ApiErrorBody),
    )
)]
pub(crate) async fn rollback(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    OptionalApiJson(body): OptionalApiJson<RollbackRequest>,
) -> ApiResult<Json<NodeResponse>> {
    let node_id = parse_node_id(&ctx, &id)?;
    let req = body.unwrap_or_default();
    let target = req
        .to_revision
        .map(|raw| revision_for_node(&node_id, raw))
        .transpose()
        .map_err(|e| ctx.reject(e))?;

    let node = state
        .plane
        .tracker()
        .rollback(&node_id, target, &ctx.actor)
        .await
        .map_err(|e| ctx.reject(e))?;
    Ok(Json(state.node_response(&node)))
}

/// Disable a node.
///
/// POST /api/v1/nodes/{id}/disable
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/disable",
    tag = "nodes",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node disabled", body = NodeResponse),
        (status = 404, description = "Node not found", body = ApiErrorBody),
    )
)]
pub(crate) async fn disable_node(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeResponse>> {
    set_disabled(&ctx, &state, &id, true).await
}

/// Re-enable a node.
///
/// POST /api/v1/nodes/{id}/enable
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/enable",
    tag = "nodes",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node enabled", body = NodeResponse),
        (status = 404, description = "Node not found", body = ApiErrorBody),
    )
)]
pub(crate) async fn enable_node(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeResponse>> {
    set_disabled(&ctx, &state, &id, false).await
}

async fn set_disabled(
    ctx: &RequestContext,
    state: &AppState,
    id: &str,
    disabled: bool,
) -> ApiResult<Json<NodeResponse>> {
    let node_id = parse_node_id(ctx, id)?;
    let node = state
        .plane
        .tracker()
        .set_disabled(&node_id, disabled, &ctx.actor)
        .await
        .map_err(|e| ctx.reject(e))?;
    Ok(Json(state.node_response(&node)))
}

/// Run one offline sweep.
///
/// POST /api/v1/nodes/check-offline
#[utoipa::path(
    post,
    path = "/api/v1/nodes/check-offline",
    tag = "nodes",
    params(CheckOfflineQuery),
    responses(
        (status = 200, description = "Sweep completed", body = CheckOfflineResponse),
        (status = 400, description = "Threshold out of range", body = ApiErrorBody),
    )
)]
pub(crate) async fn check_offline(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CheckOfflineQuery>,
) -> ApiResult<Json<CheckOfflineResponse>> {
    let threshold = query
        .offline_after_seconds
        .unwrap_or(state.config.offline_after_seconds);

    let marked = state
        .plane
        .liveness()
        .check_offline(threshold)
        .await
        .map_err(|e| ctx.reject(e))?;

    if !marked.is_empty() {
        tracing::info!(count = marked.len(), threshold, "Nodes marked offline");
    }

    Ok(Json(CheckOfflineResponse {
        marked_offline: marked.iter().map(ToString::to_string).collect(),
    }))
}

fn parse_node_id(ctx: &RequestContext, raw: &str) -> ApiResult<NodeId> {
    NodeId::from_str(raw).map_err(|e| ctx.reject(e))
}

fn json_payload(ctx: &RequestContext, value: &serde_json::Value) -> ApiResult<Payload> {
    serde_json::to_vec(value)
        .map(Payload::from)
        .map_err(|e| ctx.reject(ApiError::bad_request(format!("invalid desiredConfig: {e}"))))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl AppState {
    pub(crate) fn node_response(&self, node: &Node) -> NodeResponse {
        NodeResponse {
            id: node.id.to_string(),
            server_id: node.server_id.to_string(),
            server_host: self.directory.host(&node.server_id),
            desired_revision: node.desired_revision.get(),
            applied_revision: node.applied_revision.map(RevisionNumber::get),
            last_apply_status: node.last_apply_status.as_str().to_string(),
            last_apply_message: node.last_apply_message.clone(),
            status: node.status.as_str().to_string(),
            last_seen_at: node.last_seen_at.map(format_timestamp),
            engine_versions: node.engine_versions.clone(),
            created_at: format_timestamp(node.created_at),
            updated_at: format_timestamp(node.updated_at),
        }
    }
}

fn revision_response(revision: &ConfigRevision) -> RevisionResponse {
    let bytes = revision.payload.as_bytes();
    RevisionResponse {
        node_id: revision.node_id.to_string(),
        revision_number: revision.revision_number.get(),
        desired_config: serde_json::from_slice(bytes).ok(),
        payload_base64: STANDARD.encode(bytes),
        origin: origin_response(&revision.origin),
        created_at: format_timestamp(revision.created_at),
        created_by: revision.created_by.clone(),
    }
}

fn origin_response(origin: &RevisionOrigin) -> OriginResponse {
    match origin {
        RevisionOrigin::Initial | RevisionOrigin::Push => OriginResponse {
            kind: origin.label().to_string(),
            rolled_back_from: None,
            target: None,
        },
        RevisionOrigin::Rollback {
            rolled_back_from,
            target,
        } => OriginResponse {
            kind: origin.label().to_string(),
            rolled_back_from: Some(rolled_back_from.get()),
            target: Some(target.get()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_origin_exposes_both_pointers() {
        let origin = RevisionOrigin::Rollback {
            rolled_back_from: RevisionNumber::new(4).unwrap(),
            target: RevisionNumber::new(2).unwrap(),
        };
        let response = origin_response(&origin);
        assert_eq!(response.kind, "rollback");
        assert_eq!(response.rolled_back_from, Some(4));
        assert_eq!(response.target, Some(2));
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(ts), "2026-01-02T03:04:05.000Z");
    }
}
