//! Resource, association and subscription endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rollcall_common::{Association, Attributes, ChangeEvent, Resource, ResourceKey, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ApiError, Caller};
use crate::graph::AssociationTargets;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct RegisteredResponse {
    created: bool,
}

pub async fn register_type(
    State(state): State<AppState>,
    Json(resource_type): Json<ResourceType>,
) -> ApiResult<Json<RegisteredResponse>> {
    let created = state.access.register_resource_type(&resource_type).await?;
    Ok(Json(RegisteredResponse { created }))
}

#[derive(Deserialize)]
pub struct WriteResource {
    resource: Resource,
    /// Type of the right-hand resources in `associations`
    #[serde(default)]
    right_type: Option<String>,
    /// Desired outgoing associations, keyed by right-hand name
    #[serde(default)]
    associations: Option<AssociationTargets>,
}

pub async fn add_or_update_resource(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Json(request): Json<WriteResource>,
) -> ApiResult<Json<Resource>> {
    let stored = state
        .access
        .add_or_update_resource(
            &request.resource,
            request.right_type.as_deref(),
            request.associations.as_ref(),
            &ctx,
        )
        .await?;
    Ok(Json(stored))
}

pub async fn get_resource(
    State(state): State<AppState>,
    Path((resource_type, name)): Path<(String, String)>,
) -> ApiResult<Result<Json<Resource>, StatusCode>> {
    let key = ResourceKey::new(resource_type, name);
    Ok(state
        .access
        .get_resource(&key)
        .await?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND))
}

#[derive(Serialize)]
pub struct RemovedResponse {
    removed: bool,
}

pub async fn remove_resource(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((resource_type, name)): Path<(String, String)>,
) -> ApiResult<Json<RemovedResponse>> {
    let key = ResourceKey::new(resource_type, name);
    let removed = state.access.remove_resource(&key, &ctx).await?;
    Ok(Json(RemovedResponse { removed }))
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum SubscribeRequest {
    Many { keys: BTreeSet<ResourceKey> },
    One(ResourceKey),
}

#[derive(Serialize)]
pub struct SubscribeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<Resource>,
    added: usize,
}

pub async fn subscribe(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResponse>> {
    let response = match request {
        SubscribeRequest::One(key) => SubscribeResponse {
            resource: state.access.subscribe(&key, &ctx).await?,
            added: 1,
        },
        SubscribeRequest::Many { keys } => SubscribeResponse {
            resource: None,
            added: state.access.subscribe_all(&keys, &ctx).await?,
        },
    };
    Ok(Json(response))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((resource_type, name)): Path<(String, String)>,
) -> ApiResult<Json<RemovedResponse>> {
    let key = ResourceKey::new(resource_type, name);
    let removed = state.access.unsubscribe(&key, &ctx).await?;
    Ok(Json(RemovedResponse { removed }))
}

#[derive(Deserialize)]
pub struct WriteAssociation {
    left: ResourceKey,
    right: ResourceKey,
    #[serde(default)]
    attributes: Attributes,
}

pub async fn add_or_update_association(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Json(request): Json<WriteAssociation>,
) -> ApiResult<Json<Association>> {
    let association = state
        .access
        .add_or_update_association(&request.left, &request.right, &request.attributes, &ctx)
        .await?;
    Ok(Json(association))
}

pub async fn get_association(
    State(state): State<AppState>,
    Path((left_type, left_name, right_type, right_name)): Path<(String, String, String, String)>,
) -> ApiResult<Result<Json<Association>, StatusCode>> {
    let left = ResourceKey::new(left_type, left_name);
    let right = ResourceKey::new(right_type, right_name);
    Ok(state
        .access
        .get_association(&left, &right)
        .await?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND))
}

pub async fn remove_association(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((left_type, left_name, right_type, right_name)): Path<(String, String, String, String)>,
) -> ApiResult<Json<RemovedResponse>> {
    let left = ResourceKey::new(left_type, left_name);
    let right = ResourceKey::new(right_type, right_name);
    let removed = state.access.remove_association(&left, &right, &ctx).await?;
    Ok(Json(RemovedResponse { removed }))
}

#[derive(Deserialize)]
pub struct ChangesQuery {
    /// Last sequence the client received
    #[serde(default)]
    since: u64,
}

#[derive(Serialize)]
pub struct ChangesResponse {
    current_sequence: u64,
    events: Vec<ChangeEvent>,
}

pub async fn lost_events(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Json<ChangesResponse>> {
    let events = state.access.lost_events(query.since, &ctx).await?;
    let current_sequence = state.access.current_sequence().await?;
    Ok(Json(ChangesResponse {
        current_sequence,
        events,
    }))
}
