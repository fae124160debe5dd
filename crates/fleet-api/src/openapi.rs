//! `OpenAPI` (3.1) specification generation for `fleet-api`.

use utoipa::OpenApi;

/// `OpenAPI` documentation for the fleet REST API (`/api/v1/*`).
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleet API",
        description = "Node configuration control plane"
    ),
    paths(
        crate::routes::nodes::create_node,
        crate::routes::nodes::list_nodes,
        crate::routes::nodes::get_node,
        crate::routes::nodes::list_revisions,
        crate::routes::nodes::get_revision,
        crate::routes::nodes::push_desired_config,
        crate::routes::nodes::rollback,
        crate::routes::nodes::disable_node,
        crate::routes::nodes::enable_node,
        crate::routes::nodes::check_offline,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::routes::nodes::CreateNodeRequest,
            crate::routes::nodes::PushConfigRequest,
            crate::routes::nodes::RollbackRequest,
            crate::routes::nodes::NodeResponse,
            crate::routes::nodes::ListNodesResponse,
            crate::routes::nodes::OriginResponse,
            crate::routes::nodes::RevisionResponse,
            crate::routes::nodes::ListRevisionsResponse,
            crate::routes::nodes::CheckOfflineResponse,
        )
    ),
    tags(
        (name = "nodes", description = "Node lifecycle and reconciliation"),
        (name = "revisions", description = "Configuration revision history"),
    ),
)]
pub struct ApiDoc;

/// Returns the generated `OpenAPI` spec.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Returns the generated `OpenAPI` spec serialized as pretty JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn openapi_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_node_route_is_documented() {
        let spec = openapi();
        for path in [
            "/api/v1/nodes",
            "/api/v1/nodes/{id}",
            "/api/v1/nodes/{id}/revisions",
            "/api/v1/nodes/{id}/revisions/{rev}",
            "/api/v1/nodes/{id}/desired-config",
            "/api/v1/nodes/{id}/rollback",
            "/api/v1/nodes/{id}/disable",
            "/api/v1/nodes/{id}/enable",
            "/api/v1/nodes/check-offline",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn spec_serializes() {
        let json = openapi_json().unwrap();
        assert!(json.contains("ApiErrorBody"));
    }
}
