use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::hooks::MAX_HOOK_BODY;
use super::{AppState, bottles, containers, hooks, images, networks, pods, policies, services};

/// The management API.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/version", get(version))
        .route("/v1/containers", post(containers::create).get(containers::list))
        .route("/v1/containers/{id}", get(containers::get))
        .route("/v1/containers/{id}/actions/start", post(containers::start))
        .route("/v1/containers/{id}/actions/stop", post(containers::stop))
        .route("/v1/containers/{id}/actions/exec", post(containers::exec))
        .route("/v1/containers/{id}/actions/delete", delete(containers::delete))
        .route(
            "/v1/images",
            post(images::pull).get(images::list).delete(images::remove),
        )
        .route("/v1/networks", post(networks::create).get(networks::list))
        .route("/v1/networks/{bridge}/actions/delete", delete(networks::delete))
        .route("/v1/policies", post(policies::add))
        .route("/v1/policies/commit", post(policies::commit))
        .route("/v1/policies/revert", post(policies::revert))
        .route("/v1/policies/ns/mode", post(policies::set_mode))
        .route("/v1/policies/{id}", get(policies::list).delete(policies::remove))
        .route("/v1/bottle", post(bottles::create).get(bottles::list))
        .route("/v1/bottle/{id}", get(bottles::get))
        .route("/v1/bottle/{id}/actions/start", post(bottles::start))
        .route("/v1/bottle/{id}/actions/stop", post(bottles::stop))
        .route("/v1/bottle/{id}/actions/delete", post(bottles::delete))
        .route("/v1/services", post(services::create).get(services::list))
        .route("/v1/services/{id}", get(services::get).delete(services::delete))
        .route("/v1/pods", post(pods::apply).get(pods::list))
        .route("/v1/pods/{id}", get(pods::get).delete(pods::remove))
        .route("/v1/pods/{id}/actions/start", post(pods::start))
        .route("/v1/pods/{id}/actions/stop", post(pods::stop))
        .route("/v1/replicasets", get(pods::replicasets))
        .route("/v1/replicasets/{id}", delete(pods::remove_replicaset))
        .route("/v1/replicasets/{id}/actions/scale", post(pods::scale))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The hook listener: runtime hook callbacks and CSR signing.
///
/// Serve it with [`HookPeer`](super::tls::HookPeer) connect info; hook
/// callbacks are refused without a verified client certificate.
pub fn hook_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/hooks/droplet", post(hooks::droplet))
        .route("/v1/pki/sign", post(hooks::sign))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_HOOK_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "status": "success", "message": "raindd running" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "status": "success", "data": { "version": env!("CARGO_PKG_VERSION") } }))
}
