//! HTTP route handlers for the registrar.

use axum::{
    Json, Router,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use rollcall_common::constants::headers;
use rollcall_common::{CallerContext, RollcallError};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

mod connect;
mod health;
mod resources;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/status", get(health::status))

        // Push stream
        .route("/connect", get(connect::connect))

        // Resource directory
        .route("/resource-types", post(resources::register_type))
        .route("/resources", post(resources::add_or_update_resource))
        .route(
            "/resources/{resource_type}/{name}",
            get(resources::get_resource).delete(resources::remove_resource),
        )
        .route("/subscriptions", post(resources::subscribe))
        .route("/subscriptions/{resource_type}/{name}", delete(resources::unsubscribe))
        .route("/associations", put(resources::add_or_update_association))
        .route(
            "/associations/{left_type}/{left_name}/{right_type}/{right_name}",
            get(resources::get_association).delete(resources::remove_association),
        )
        .route("/changes", get(resources::lost_events))

        // Request tracing and permissive CORS for browser clients
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )

        // Add shared state
        .with_state(state)
}

/// Error body returned by every handler
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

/// Handler error carrying the domain error
pub struct ApiError(pub RollcallError);

impl From<RollcallError> for ApiError {
    fn from(e: RollcallError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// Connection a request is made on behalf of.
///
/// The client address comes from `X-Client-Address` (as announced in the
/// `hello` event of its push stream); the server address is this server.
pub struct Caller(pub CallerContext);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let client = parts
            .headers
            .get(headers::X_CLIENT_ADDRESS)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                RollcallError::invalid(format!("missing {} header", headers::X_CLIENT_ADDRESS))
            })?;

        Ok(Caller(CallerContext::new(client, state.leader.server())))
    }
}
