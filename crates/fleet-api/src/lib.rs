//! # fleet-api
//!
//! HTTP composition layer for the node configuration control plane.
//!
//! This crate is a **thin composition layer** with no domain policy. All
//! reconciliation logic lives in `fleet-control`; handlers translate JSON to
//! control-plane calls and errors back to stable codes.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                               - Liveness
//! GET  /ready                                - Readiness (storage reachable)
//! GET  /metrics                              - Prometheus text
//! POST /api/v1/nodes                         - Create node
//! GET  /api/v1/nodes?status=                 - List nodes
//! GET  /api/v1/nodes/{id}                    - Get node
//! GET  /api/v1/nodes/{id}/revisions          - Page revisions
//! GET  /api/v1/nodes/{id}/revisions/{rev}    - Get revision
//! POST /api/v1/nodes/{id}/desired-config     - Push desired config
//! POST /api/v1/nodes/{id}/rollback           - Roll back
//! POST /api/v1/nodes/{id}/disable | /enable  - Operator disable
//! POST /api/v1/nodes/check-offline           - Run one offline sweep
//! ```
//!
//! Agent operations (report, heartbeat, desired-config fetch) are not
//! exposed here; embed [`fleet_control::AgentGateway`] in the agent-facing
//! transport instead.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fleet_api::server::Server;
//!
//! let server = Server::builder().http_port(8080).build();
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::directory::{ServerDirectory, StaticServerDirectory};
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::{Server, ServerBuilder};
}
