use axum::Json;
use axum::extract::{Path, State};
use raind_network::policy::{CommitReport, NorthSouthMode, Policy, PolicyKind, PolicyRequest};
use serde::Deserialize;

use super::{ApiResult, AppState, done, success};

#[derive(Debug, Deserialize)]
pub(super) struct ModeRequest {
    mode: NorthSouthMode,
}

pub(super) async fn add(
    State(state): State<AppState>,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<Policy> {
    success(state.platform.policies.add(request).await?)
}

pub(super) async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.platform.policies.remove(&id).await?;
    done(format!("policy {id} removed; takes effect at next commit"))
}

/// `chain` is a policy list name: `east_west`, `north_south_observe` or
/// `north_south_enforce`.
pub(super) async fn list(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> ApiResult<Vec<Policy>> {
    let kind: PolicyKind = chain.parse()?;
    success(state.platform.policies.store().list(kind)?)
}

pub(super) async fn commit(State(state): State<AppState>) -> ApiResult<CommitReport> {
    success(state.platform.policies.commit().await?)
}

pub(super) async fn revert(State(state): State<AppState>) -> ApiResult<CommitReport> {
    success(state.platform.policies.revert().await?)
}

pub(super) async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> ApiResult<CommitReport> {
    success(
        state
            .platform
            .policies
            .set_north_south_mode(request.mode)
            .await?,
    )
}
