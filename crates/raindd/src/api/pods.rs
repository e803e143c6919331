use axum::Json;
use axum::extract::{Path, Query, State};
use raind::pod::{Applied, Manifest, Pod, ReplicaSet};
use serde::Deserialize;

use super::{ApiResult, AppState, done, success};

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ScaleRequest {
    replicas: u32,
}

/// The body is a `Pod` or `ReplicaSet` manifest in YAML.
pub(super) async fn apply(State(state): State<AppState>, body: String) -> ApiResult<Applied> {
    let manifest = Manifest::from_yaml(&body)?;
    success(state.platform.pods.apply(manifest).await?)
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Pod>> {
    success(state.platform.pods.list(query.namespace.as_deref())?)
}

pub(super) async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Pod> {
    success(state.platform.pods.get(&id)?)
}

pub(super) async fn start(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Pod> {
    success(state.platform.pods.start(&id).await?)
}

pub(super) async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Pod> {
    success(state.platform.pods.stop(&id).await?)
}

pub(super) async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.platform.pods.remove(&id).await?;
    done(format!("pod {id} removed"))
}

pub(super) async fn replicasets(State(state): State<AppState>) -> ApiResult<Vec<ReplicaSet>> {
    success(state.platform.pods.store().replicasets()?)
}

pub(super) async fn scale(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult<ReplicaSet> {
    success(state.platform.pods.scale(&id, request.replicas)?)
}

pub(super) async fn remove_replicaset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.platform.pods.remove_replicaset(&id).await?;
    done(format!("replica set {id} removed"))
}
