//! Body and query extractors that reject with the JSON error envelope.
//!
//! axum's own `Json` and `Query` rejections answer in plain text; these
//! wrappers convert them into [`ApiError::bad_request`] tagged with the
//! request ID.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};
use axum::Json;
use serde::de::DeserializeOwned;

use crate::context::{RequestContext, REQUEST_ID_HEADER};
use crate::error::ApiError;

/// Largest request body accepted by [`OptionalApiJson`].
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// JSON request body; any rejection becomes `400 BAD_REQUEST`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

/// Optional JSON request body.
///
/// An empty body yields `None`. A non-empty body must be valid JSON of the
/// expected shape, sent as `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalApiJson<T>(pub Option<T>);

/// Query string; any rejection becomes `400 BAD_REQUEST`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(req.extensions(), req.headers());
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(bad_request(rejection.body_text(), request_id)),
        }
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for OptionalApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(req.extensions(), req.headers());
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(bad_request(
                    format!("failed to read request body: {e}"),
                    request_id,
                ));
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(None));
        }

        let req = Request::from_parts(parts, Body::from(bytes));
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(Some(value))),
            Err(rejection) => Err(bad_request(rejection.body_text(), request_id)),
        }
    }
}

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(bad_request(
                rejection.body_text(),
                request_id(&parts.extensions, &parts.headers),
            )),
        }
    }
}

fn request_id(extensions: &Extensions, headers: &HeaderMap) -> Option<String> {
    extensions
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .or_else(|| {
            headers
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
}

fn bad_request(message: String, request_id: Option<String>) -> ApiError {
    let err = ApiError::bad_request(message);
    match request_id {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}
