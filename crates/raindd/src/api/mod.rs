//! HTTP surface: the management API and the hook listener, which is served
//! over mutual TLS (see [`tls`]).
//!
//! Every JSON response is wrapped in an [`Envelope`]. Handler errors map
//! onto status codes by [`ErrorKind`]: not-found is 404, validation is 400
//! and everything else is 500.

mod bottles;
mod containers;
pub mod hooks;
mod images;
mod networks;
mod pods;
mod policies;
pub mod server;
mod services;
pub mod tls;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use raind::Platform;
use raind_bottle::{BottleService, BottleStore};
use raind_common::paths::stores;
use raind_common::{ErrorKind, RaindError};
use serde::Serialize;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The control plane.
    pub platform: Arc<Platform>,
    /// Bottle lifecycle.
    pub bottles: Arc<BottleService>,
}

impl AppState {
    /// Wire the bottle service onto `platform`.
    #[must_use]
    pub fn new(platform: Arc<Platform>) -> Self {
        let store = Arc::new(BottleStore::new(
            platform.config.paths.store(stores::BOTTLES),
        ));
        let bottles = Arc::new(BottleService::new(
            platform.engine.clone(),
            platform.policies.clone(),
            store,
        ));
        Self { platform, bottles }
    }
}

/// Response wrapper shared by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    /// `success` or `fail`.
    pub status: &'static str,
    /// Human readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Handler result.
pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn success<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        status: "success",
        message: None,
        data: Some(data),
    }))
}

fn done(message: impl Into<String>) -> ApiResult<()> {
    Ok(Json(Envelope {
        status: "success",
        message: Some(message.into()),
        data: None,
    }))
}

/// A failed request.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Failure with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Status code for an error kind.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RaindError> for ApiError {
    fn from(err: RaindError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            tracing::warn!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            status: "fail",
            message: Some(self.message),
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}
