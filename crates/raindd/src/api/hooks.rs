//! Hook listener handlers.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use raind_common::RaindError;
use raind_oci::{ContainerState, HookEvent};

use super::tls::HookPeer;
use super::{ApiError, ApiResult, AppState, done};

/// Header naming the lifecycle event of a hook delivery.
pub const HOOK_EVENT_HEADER: &str = "x-hook-event";

/// Bootstrap credential header required by the CSR endpoint.
pub const HOOK_SETTER_HEADER: &str = "x-raind-hook-setter";

/// Expected value of [`HOOK_SETTER_HEADER`].
pub const HOOK_SETTER: &str = "CONDENSER";

/// Largest accepted hook body.
pub const MAX_HOOK_BODY: usize = 1024 * 1024;

pub(super) async fn droplet(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<HookPeer>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<()> {
    let Some(spiffe_id) = peer.spiffe_id else {
        tracing::warn!(peer = %peer.addr, "Hook rejected without client certificate");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "client certificate required",
        ));
    };
    let event = headers
        .get(HOOK_EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| RaindError::validation("hook", "missing X-Hook-Event header"))?;
    let event: HookEvent = event.parse()?;
    let payload: ContainerState = serde_json::from_slice(&body)
        .map_err(|e| RaindError::validation("hook payload", e.to_string()))?;
    if spiffe_id.trust_domain != state.platform.pki.trust_domain() || spiffe_id.id != payload.id {
        tracing::warn!(peer = %peer.addr, spiffe_id = %spiffe_id, container_id = %payload.id, %event, "Hook rejected for foreign container");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("{spiffe_id} may not report for {}", payload.id),
        ));
    }

    state.platform.hooks.handle(event, &payload)?;
    done(format!("{event} recorded for {}", payload.id))
}

pub(super) async fn sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let setter = headers
        .get(HOOK_SETTER_HEADER)
        .and_then(|value| value.to_str().ok());
    if setter != Some(HOOK_SETTER) {
        tracing::warn!("CSR rejected without bootstrap credential");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "missing or invalid bootstrap credential",
        ));
    }

    let issued = state.platform.pki.sign(&body)?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        issued.pem,
    ))
}
