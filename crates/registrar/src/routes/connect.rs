//! Push stream endpoint.

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use futures::stream::BoxStream;
use rollcall_common::constants::headers;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::state::AppState;

/// Open a server-sent-events stream identified by the remote address.
///
/// Server peers (`X-Node-Id`) are only accepted from current members.
pub async fn connect(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
) -> Result<Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>, StatusCode> {
    if let Some(node_id) = request_headers.get(headers::X_NODE_ID) {
        if !state.hub.is_allowed_peer(remote.ip()).await {
            tracing::warn!(peer = %remote, node_id = ?node_id, "Rejected peer outside the membership");
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let stream = state.hub.attach(remote.to_string()).await;
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
