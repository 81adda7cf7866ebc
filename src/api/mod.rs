//! HTTP surface — control API for the studio and webhook ingress for
//! provider callbacks.

pub mod routes;
pub mod webhooks;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use crate::engine::{EngineContext, StepExecutor};
use crate::error::{DatabaseError, Error};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<EngineContext>,
    pub executor: Arc<StepExecutor>,
}

impl AppState {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(ctx.clone())),
            ctx,
        }
    }
}

/// Error envelope: every failure body is `{ "kind": ..., "message": ... }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "conflict",
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "unavailable",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "kind": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Validation(e) => Self::validation(e.to_string()),
            Error::Template(e) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                kind: "template",
                message: e.to_string(),
            },
            Error::Database(DatabaseError::NotFound { entity, id }) => {
                Self::not_found(format!("{entity} {id} not found"))
            }
            Error::Database(DatabaseError::ConcurrencyConflict { entity, id }) => {
                Self::conflict(format!("{entity} {id} was modified concurrently"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(error: DatabaseError) -> Self {
        ApiError::from(Error::Database(error))
    }
}

/// Build the full router: control API plus webhook ingress.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::control_routes())
        .merge(webhooks::webhook_routes())
        .with_state(state)
}
