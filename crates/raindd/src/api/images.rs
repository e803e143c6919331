use axum::Json;
use axum::extract::State;
use raind_image::{ImageEntry, ImageRecord, ImageReference};
use serde::Deserialize;

use super::{ApiResult, AppState, done, success};

#[derive(Debug, Deserialize)]
pub(super) struct ImageRequest {
    image: String,
}

pub(super) async fn pull(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> ApiResult<ImageRecord> {
    let image = ImageReference::parse(&request.image)?;
    success(state.platform.images.pull(&image).await?)
}

pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Vec<ImageEntry>> {
    success(state.platform.images.list()?)
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> ApiResult<()> {
    let image = ImageReference::parse(&request.image)?;
    state.platform.images.remove(&image).await?;
    done(format!("image {image} removed"))
}
