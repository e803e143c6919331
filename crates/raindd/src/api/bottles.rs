use axum::extract::{Path, State};
use raind_bottle::Bottle;

use super::{ApiResult, AppState, done, success};

/// The body is the bottle YAML.
pub(super) async fn create(State(state): State<AppState>, body: String) -> ApiResult<Bottle> {
    success(state.bottles.create(&body).await?)
}

pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Vec<Bottle>> {
    success(state.bottles.list()?)
}

pub(super) async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Bottle> {
    success(state.bottles.get(&id)?)
}

pub(super) async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Bottle> {
    success(state.bottles.start(&id).await?)
}

pub(super) async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Bottle> {
    success(state.bottles.stop(&id).await?)
}

pub(super) async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.bottles.delete(&id).await?;
    done(format!("bottle {id} deleted"))
}
