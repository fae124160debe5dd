//! Request context extraction.
//!
//! Callers are not authenticated here; the actor recorded in audit entries is
//! whatever the caller puts in `X-Actor-Id`.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;
use ulid::Ulid;

use crate::error::ApiError;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header naming the operator on whose behalf the request is made.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Actor recorded when the caller does not identify itself.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Per-request context derived from headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Actor attributed in audit records.
    pub actor: String,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl RequestContext {
    /// Converts `err` into an [`ApiError`] tagged with this request's ID.
    #[must_use]
    pub fn reject(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        let request_id =
            header_string(headers, REQUEST_ID_HEADER).unwrap_or_else(|| Ulid::new().to_string());
        let actor =
            header_string(headers, ACTOR_HEADER).unwrap_or_else(|| ANONYMOUS_ACTOR.to_string());
        Self { actor, request_id }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let ctx = Self::from_headers(&parts.headers);
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Middleware that resolves the [`RequestContext`] once and echoes the
/// request ID on every response.
pub async fn context_middleware(req: Request<Body>, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &()).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        actor = %ctx.actor,
    );

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_headers_are_missing() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.actor, ANONYMOUS_ACTOR);
        assert!(Ulid::from_string(&ctx.request_id).is_ok());
    }

    #[test]
    fn headers_override_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("operator:alice"));
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.actor, "operator:alice");
        assert_eq!(ctx.request_id, "req-42");
    }

    #[test]
    fn blank_actor_falls_back_to_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("   "));
        assert_eq!(RequestContext::from_headers(&headers).actor, ANONYMOUS_ACTOR);
    }
}
