//! Error taxonomy shared by the gateway, the backend operations and the
//! HTTP surface.
//!
//! Handlers never return raw transport errors: every failure is first
//! normalized into a [`GatewayError`] and then rendered as
//! `{"error": message}` with a status chosen by the kind of route.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No session token, or the backend rejected the one we sent.
    #[error("Unauthorized")]
    Unauthorized,

    /// Required input was missing; raised before any network call.
    #[error("{0}")]
    Validation(String),

    /// The backend answered with a non-success status.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// The request never produced an HTTP response.
    #[error("{0}")]
    Network(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// What a failing route was doing. List reads, single-resource reads and
/// mutations each fail with their own status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Collection reads: unexpected failures are 500.
    List,
    /// Single-resource reads: failures are reported as 404.
    Item,
    /// Writes: failures are reported as 400.
    Mutation,
    /// Login, signup and `me`: failures are reported as 401.
    Auth,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Maps a gateway failure to a response for a route of the given kind.
    pub fn from_gateway(kind: RouteKind, err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized => Self::unauthorized(),
            GatewayError::Validation(m) => Self::bad_request(m),
            other => {
                let status = match kind {
                    RouteKind::List => StatusCode::INTERNAL_SERVER_ERROR,
                    RouteKind::Item => StatusCode::NOT_FOUND,
                    RouteKind::Mutation => StatusCode::BAD_REQUEST,
                    RouteKind::Auth => StatusCode::UNAUTHORIZED,
                };
                Self::new(status, other.to_string())
            }
        }
    }
}

/// Shorthand used by handlers: `.map_err(fail(RouteKind::List))`.
pub fn fail(kind: RouteKind) -> impl Fn(GatewayError) -> ApiError {
    move |e| ApiError::from_gateway(kind, e)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
