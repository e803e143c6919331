use axum::extract::{Path, State};
use raind::service::{L4Service, ServiceSpec};

use super::{ApiResult, AppState, done, success};

/// The body is the service YAML; chains follow on the controller's next tick.
pub(super) async fn create(State(state): State<AppState>, body: String) -> ApiResult<L4Service> {
    let spec = ServiceSpec::from_yaml(&body)?;
    success(state.platform.services.create(spec)?)
}

pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Vec<L4Service>> {
    success(state.platform.services.list()?)
}

pub(super) async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<L4Service> {
    success(state.platform.services.get(&id)?)
}

pub(super) async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.platform.services.delete(&id).await?;
    done(format!("service {id} deleted"))
}
