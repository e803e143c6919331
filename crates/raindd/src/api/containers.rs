use axum::Json;
use axum::extract::{Path, State};
use raind::runtime::{ContainerRecord, CreateRequest};
use serde::{Deserialize, Serialize};

use super::{ApiResult, AppState, done, success};

#[derive(Debug, Serialize)]
pub(super) struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ExecRequest {
    command: Vec<String>,
    #[serde(default)]
    tty: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct ExecOutput {
    output: String,
}

pub(super) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<Created> {
    let record = state.platform.engine.create(request).await?;
    success(Created {
        id: record.container_id,
    })
}

pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Vec<ContainerRecord>> {
    success(state.platform.engine.list()?)
}

pub(super) async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ContainerRecord> {
    success(state.platform.engine.get(&id)?)
}

pub(super) async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ContainerRecord> {
    success(state.platform.engine.start(&id).await?)
}

pub(super) async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ContainerRecord> {
    success(state.platform.engine.stop(&id).await?)
}

pub(super) async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<ExecOutput> {
    let output = state
        .platform
        .engine
        .exec(&id, &request.command, request.tty)
        .await?;
    success(ExecOutput { output })
}

pub(super) async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.platform.engine.delete(&id).await?;
    done(format!("container {id} deleted"))
}
