//! API integration tests.
//!
//! Drives the router end to end: HTTP -> routes -> control plane -> storage.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use fleet_api::config::Config;
use fleet_api::server::ServerBuilder;
use fleet_control::{ControlConfig, ControlPlane, EngineVersions};
use fleet_core::{AgentToken, AuditAction, MemoryAuditLog, MemoryBackend, NodeId};

fn test_router() -> axum::Router {
    ServerBuilder::new().build().test_router()
}

async fn create_node(router: &axum::Router, config: Value) -> Result<String> {
    let (status, body) = helpers::post_json(
        router.clone(),
        "/api/v1/nodes",
        json!({
            "serverId": "srv-eu-1",
            "agentToken": "agent-secret",
            "desiredConfig": config,
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    Ok(body["id"].as_str().context("node id")?.to_string())
}

#[tokio::test]
async fn test_push_and_rollback_flow() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({"inbounds": []})).await?;

    let (status, node) = helpers::get_json(router.clone(), &format!("/api/v1/nodes/{id}")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["desiredRevision"], 1);
    assert_eq!(node["appliedRevision"], Value::Null);
    assert_eq!(node["lastApplyStatus"], "pending");
    assert_eq!(node["status"], "pending");
    assert!(node.get("agentToken").is_none());
    assert!(node.get("tokenDigest").is_none());

    let (status, node) = helpers::post_json(
        router.clone(),
        &format!("/api/v1/nodes/{id}/desired-config"),
        json!({"desiredConfig": {"inbounds": [{"tag": "x"}]}}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["desiredRevision"], 2);

    let (status, node) =
        helpers::post_json(router.clone(), &format!("/api/v1/nodes/{id}/rollback"), json!({}))
            .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["desiredRevision"], 3);

    let (status, revision) =
        helpers::get_json(router.clone(), &format!("/api/v1/nodes/{id}/revisions/3")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revision["desiredConfig"], json!({"inbounds": []}));
    assert_eq!(revision["origin"]["kind"], "rollback");
    assert_eq!(revision["origin"]["rolledBackFrom"], 2);
    assert_eq!(revision["origin"]["target"], 1);
    Ok(())
}

#[tokio::test]
async fn test_rollback_without_body_uses_previous_revision() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({"v": 1})).await?;
    helpers::post_json(
        router.clone(),
        &format!("/api/v1/nodes/{id}/desired-config"),
        json!({"desiredConfig": {"v": 2}}),
    )
    .await?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/nodes/{id}/rollback"))
        .body(Body::empty())
        .context("build request")?;
    let (status, node): (_, Value) = helpers::send_json(router, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["desiredRevision"], 3);
    Ok(())
}

#[tokio::test]
async fn test_rollback_to_unknown_revision_is_unprocessable() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({})).await?;

    let (status, body) = helpers::post_json(
        router.clone(),
        &format!("/api/v1/nodes/{id}/rollback"),
        json!({"toRevision": 99}),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_REVISION");

    let (_, page) =
        helpers::get_json(router, &format!("/api/v1/nodes/{id}/revisions")).await?;
    assert_eq!(page["revisions"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_rollback_rejects_unreadable_bodies() -> Result<()> {
    let audit = Arc::new(MemoryAuditLog::new());
    let router = ServerBuilder::new()
        .audit_log(audit.clone())
        .build()
        .test_router();
    let id = create_node(&router, json!({"v": 1})).await?;
    for v in 2..=3 {
        helpers::post_json(
            router.clone(),
            &format!("/api/v1/nodes/{id}/desired-config"),
            json!({"desiredConfig": {"v": v}}),
        )
        .await?;
    }

    let cases: [(&'static str, Option<&'static str>); 3] = [
        (r#"{"toRevision":1}"#, None),
        (r#"{"toRevision":"one"}"#, Some("application/json")),
        (r#"{"toRevision":-1}"#, Some("application/json")),
    ];
    for (body, content_type) in cases {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/v1/nodes/{id}/rollback"));
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let request = builder.body(Body::from(body)).context("build request")?;

        let (status, error) = helpers::send_json::<Value>(router.clone(), request).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(error["code"], "BAD_REQUEST", "{body}");
        assert!(error["requestId"].is_string(), "{body}");
    }

    let (_, node) = helpers::get_json(router.clone(), &format!("/api/v1/nodes/{id}")).await?;
    assert_eq!(node["desiredRevision"], 3);
    let (_, page) = helpers::get_json(router, &format!("/api/v1/nodes/{id}/revisions")).await?;
    assert_eq!(page["revisions"].as_array().map(Vec::len), Some(3));
    assert!(audit.find_by_action(AuditAction::RollbackRequested).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_extractor_rejections_use_error_envelope() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({})).await?;

    let mut request = helpers::make_request(
        Method::POST,
        &format!("/api/v1/nodes/{id}/desired-config"),
        Some(json!({"config": {}})),
    )?;
    request
        .headers_mut()
        .insert("x-request-id", HeaderValue::from_static("req-400"));
    let (status, body) = helpers::send_json::<Value>(router.clone(), request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    assert_eq!(body["requestId"], "req-400");

    let (status, body) =
        helpers::get_json(router, &format!("/api/v1/nodes/{id}/revisions?after=abc")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn test_unknown_node_is_not_found_with_request_id() -> Result<()> {
    let router = test_router();
    let request = helpers::make_request(
        Method::GET,
        "/api/v1/nodes/01HZZZZZZZZZZZZZZZZZZZZZZZ",
        None,
    )?;
    let mut request = request;
    request
        .headers_mut()
        .insert("x-request-id", HeaderValue::from_static("req-404"));

    let response = router.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-404")
    );

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .context("read body")?;
    let body: Value = serde_json::from_slice(&body).context("parse body")?;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["requestId"], "req-404");
    Ok(())
}

#[tokio::test]
async fn test_malformed_inputs_are_bad_requests() -> Result<()> {
    let router = test_router();

    let (status, body) = helpers::get_json(router.clone(), "/api/v1/nodes/not-a-ulid").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = helpers::get_json(router.clone(), "/api/v1/nodes?status=sleeping").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = helpers::post_json(
        router,
        "/api/v1/nodes",
        json!({"serverId": "srv", "agentToken": "   ", "desiredConfig": {}}),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn test_revision_zero_is_unprocessable() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({})).await?;

    let (status, body) =
        helpers::get_json(router, &format!("/api/v1/nodes/{id}/revisions/0")).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_REVISION");
    Ok(())
}

#[tokio::test]
async fn test_revision_paging() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({"n": 1})).await?;
    for n in 2..=5 {
        helpers::post_json(
            router.clone(),
            &format!("/api/v1/nodes/{id}/desired-config"),
            json!({"desiredConfig": {"n": n}}),
        )
        .await?;
    }

    let (status, page) =
        helpers::get_json(router.clone(), &format!("/api/v1/nodes/{id}/revisions?limit=2")).await?;
    assert_eq!(status, StatusCode::OK);
    let numbers: Vec<u64> = page["revisions"]
        .as_array()
        .context("revisions")?
        .iter()
        .filter_map(|r| r["revisionNumber"].as_u64())
        .collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(page["nextAfter"], 2);

    let (_, last) = helpers::get_json(
        router,
        &format!("/api/v1/nodes/{id}/revisions?after=4&limit=2"),
    )
    .await?;
    assert_eq!(last["revisions"].as_array().map(Vec::len), Some(1));
    assert!(last.get("nextAfter").is_none());
    Ok(())
}

#[tokio::test]
async fn test_check_offline_marks_never_seen_nodes() -> Result<()> {
    let router = test_router();
    let a = create_node(&router, json!({})).await?;
    let b = create_node(&router, json!({})).await?;

    let (status, body) = helpers::post_json(
        router.clone(),
        "/api/v1/nodes/check-offline?offlineAfterSeconds=60",
        json!({}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let mut marked: Vec<String> = serde_json::from_value(body["markedOffline"].clone())?;
    marked.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(marked, expected);

    let (_, second) =
        helpers::post_json(router.clone(), "/api/v1/nodes/check-offline", json!({})).await?;
    assert_eq!(second["markedOffline"], json!([]));

    let (_, offline) = helpers::get_json(router, "/api/v1/nodes?status=offline").await?;
    assert_eq!(offline["nodes"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_disabled_nodes_are_skipped_by_sweep() -> Result<()> {
    let router = test_router();
    let id = create_node(&router, json!({})).await?;

    let (status, node) =
        helpers::post_json(router.clone(), &format!("/api/v1/nodes/{id}/disable"), json!({}))
            .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["status"], "disabled");

    let (_, sweep) =
        helpers::post_json(router.clone(), "/api/v1/nodes/check-offline", json!({})).await?;
    assert_eq!(sweep["markedOffline"], json!([]));

    let (_, node) =
        helpers::post_json(router, &format!("/api/v1/nodes/{id}/enable"), json!({})).await?;
    assert_eq!(node["status"], "pending");
    Ok(())
}

#[tokio::test]
async fn test_server_host_decoration() -> Result<()> {
    let mut config = Config::default();
    config
        .servers
        .insert("srv-eu-1".to_string(), "10.0.0.1".to_string());
    let router = ServerBuilder::new().config(config).build().test_router();

    let id = create_node(&router, json!({})).await?;
    let (_, node) = helpers::get_json(router, &format!("/api/v1/nodes/{id}")).await?;
    assert_eq!(node["serverHost"], "10.0.0.1");
    Ok(())
}

#[tokio::test]
async fn test_agent_engine_versions_are_shown() -> Result<()> {
    let storage = Arc::new(MemoryBackend::new());
    let router = ServerBuilder::new()
        .storage_backend(storage.clone())
        .build()
        .test_router();
    let id = create_node(&router, json!({})).await?;

    let plane = ControlPlane::new(
        storage,
        Arc::new(MemoryAuditLog::new()),
        &ControlConfig::default(),
    );
    let node_id: NodeId = id.parse()?;
    let engines = EngineVersions::from([("awg2".to_string(), "1.2.0".to_string())]);
    plane
        .agents()
        .heartbeat(&node_id, &AgentToken::new("agent-secret")?, &engines)
        .await?;

    let (status, node) = helpers::get_json(router, &format!("/api/v1/nodes/{id}")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["status"], "online");
    assert_eq!(node["engineVersions"]["awg2"], "1.2.0");
    Ok(())
}

#[tokio::test]
async fn test_actor_header_reaches_audit_log() -> Result<()> {
    let audit = Arc::new(MemoryAuditLog::new());
    let router = ServerBuilder::new()
        .audit_log(audit.clone())
        .build()
        .test_router();

    let mut request = helpers::make_request(
        Method::POST,
        "/api/v1/nodes",
        Some(json!({"serverId": "srv", "agentToken": "secret", "desiredConfig": {}})),
    )?;
    request
        .headers_mut()
        .insert("x-actor-id", HeaderValue::from_static("operator:alice"));
    let (status, _): (_, Value) = helpers::send_json(router, request).await?;
    assert_eq!(status, StatusCode::CREATED);

    let created = audit.find_by_action(AuditAction::NodeCreated);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].actor, "operator:alice");
    assert!(!created[0].summary.to_string().contains("secret"));
    Ok(())
}

#[tokio::test]
async fn test_anonymous_actor_by_default() -> Result<()> {
    let audit = Arc::new(MemoryAuditLog::new());
    let router = ServerBuilder::new()
        .audit_log(audit.clone())
        .build()
        .test_router();

    create_node(&router, json!({})).await?;
    let created = audit.find_by_action(AuditAction::NodeCreated);
    assert_eq!(created[0].actor, "anonymous");
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_renders_after_init() -> Result<()> {
    fleet_api::metrics::init_metrics();
    let router = test_router();
    create_node(&router, json!({})).await?;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .context("build request")?;
    let response = router.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .context("read body")?;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("fleet_api_request_total"));
    Ok(())
}

mod helpers {
    use super::*;
    use serde::de::DeserializeOwned;

    pub fn make_request(method: Method, uri: &str, body: Option<Value>) -> Result<Request<Body>> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");

        let body = match body {
            Some(v) => Body::from(serde_json::to_vec(&v).context("serialize request body")?),
            None => Body::empty(),
        };

        builder.body(body).context("build request")
    }

    pub async fn send_json<T: DeserializeOwned>(
        router: axum::Router,
        request: Request<Body>,
    ) -> Result<(StatusCode, T)> {
        let response = router.oneshot(request).await?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .context("read response body")?;
        let json = serde_json::from_slice(&body).with_context(|| {
            format!(
                "parse JSON response (status={status}): {}",
                String::from_utf8_lossy(&body)
            )
        })?;
        Ok((status, json))
    }

    pub async fn get_json(router: axum::Router, uri: &str) -> Result<(StatusCode, Value)> {
        send_json(router, make_request(Method::GET, uri, None)?).await
    }

    pub async fn post_json(
        router: axum::Router,
        uri: &str,
        body: Value,
    ) -> Result<(StatusCode, Value)> {
        send_json(router, make_request(Method::POST, uri, Some(body))?).await
    }
}
