use axum::Json;
use axum::extract::{Path, State};
use raind_network::BridgeInfo;
use serde::Deserialize;

use super::{ApiResult, AppState, done, success};

#[derive(Debug, Deserialize)]
pub(super) struct BridgeRequest {
    interface: String,
    /// Gateway address with prefix, e.g. `10.167.0.1/24`.
    address: String,
}

pub(super) async fn create(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> ApiResult<BridgeInfo> {
    success(
        state
            .platform
            .networks
            .create(&request.interface, &request.address)
            .await?,
    )
}

pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Vec<BridgeInfo>> {
    success(state.platform.networks.list()?)
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Path(bridge): Path<String>,
) -> ApiResult<()> {
    state.platform.networks.delete(&bridge).await?;
    done(format!("bridge {bridge} deleted"))
}
