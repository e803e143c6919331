//! Management API and hook listener against a faked platform.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use raind::pki::{SpiffeId, container_csr};
use raind::platform::{HostSeams, Platform};
use raind::runtime::lifecycle::fake::SimulatedRuntime;
use raind::runtime::{ProcessProbe, RuntimeConfig};
use raind_common::RecordingRunner;
use raind_image::manager::fake::StaticPuller;
use raind_network::MemoryNetfilter;
use raind_oci::image::ExecutionConfig;
use raind_oci::{ContainerState, ContainerStatus, HookEvent};
use raindd::api::AppState;
use raindd::api::server::{app, hook_app};
use raindd::api::tls::{self, HookListener, HookPeer};
use serde_json::{Value, json};
use tempfile::TempDir;
use test_log::test;
use tower::ServiceExt;

struct Alive;

impl ProcessProbe for Alive {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

struct Harness {
    _dir: TempDir,
    state: AppState,
    runtime: Arc<SimulatedRuntime>,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = RuntimeConfig::default()
        .with_root(dir.path().join("raind"))
        .with_state_timeout(Duration::from_secs(1));
    let runtime = Arc::new(SimulatedRuntime::new());
    let seams = HostSeams {
        runner: Arc::new(RecordingRunner::new()),
        netfilter: Arc::new(MemoryNetfilter::new()),
        runtime: runtime.clone(),
        puller: Arc::new(StaticPuller::new(ExecutionConfig {
            cmd: Some(vec!["/bin/sh".to_string()]),
            ..ExecutionConfig::default()
        })),
        probe: Arc::new(Alive),
    };
    let platform = Platform::new(config, seams).unwrap();
    runtime.attach(platform.hooks.clone());
    platform.bootstrap().await.unwrap();
    Harness {
        _dir: dir,
        state: AppState::new(Arc::new(platform)),
        runtime,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn text_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

fn container_peer(id: &str) -> HookPeer {
    HookPeer::authenticated(peer_addr(), SpiffeId::container("raind.local", id))
}

fn hook_request(event: &str, state: &ContainerState, peer: HookPeer) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/hooks/droplet")
        .header("x-hook-event", event)
        .extension(ConnectInfo(peer))
        .body(Body::from(serde_json::to_vec(state).unwrap()))
        .unwrap()
}

fn empty(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[test(tokio::test)]
async fn container_lifecycle_over_http() {
    let h = harness().await;
    let router = app(h.state.clone());

    let (status, body) = send(
        &router,
        json_request(Method::POST, "/v1/containers", &json!({"image": "alpine", "name": "web"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&router, empty(Method::GET, "/v1/containers/web")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["container_id"], id.as_str());

    let (status, _) = send(&router, empty(Method::POST, "/v1/containers/web/actions/start")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        json_request(
            Method::POST,
            "/v1/containers/web/actions/exec",
            &json!({"command": ["echo", "hi"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["output"], "echo hi");

    // running containers cannot be deleted
    let (status, body) = send(&router, empty(Method::DELETE, "/v1/containers/web/actions/delete")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "fail");

    send(&router, empty(Method::POST, "/v1/containers/web/actions/stop")).await;
    let (status, _) = send(&router, empty(Method::DELETE, "/v1/containers/web/actions/delete")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, empty(Method::GET, "/v1/containers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[test(tokio::test)]
async fn unknown_container_is_not_found() {
    let h = harness().await;
    let router = app(h.state.clone());
    let (status, body) = send(&router, empty(Method::GET, "/v1/containers/ghost-a")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({"status": "fail", "message": "container: ghost-a not found"})
    );
}

#[test(tokio::test)]
async fn bottle_from_yaml_body() {
    let h = harness().await;
    let router = app(h.state.clone());
    let yaml = r"
bottle: {name: shop}
services:
  db: {image: postgres}
  web: {image: nginx, depends_on: [db], env: ['URL=db:5432']}
";
    let (status, body) = send(&router, text_request("/v1/bottle", yaml)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["start_order"], json!(["db", "web"]));

    let (status, _) = send(&router, empty(Method::POST, "/v1/bottle/shop/actions/start")).await;
    assert_eq!(status, StatusCode::OK);
    let web = h.state.platform.engine.get("shop-web").unwrap();
    assert_eq!(web.state, ContainerStatus::Running);

    let (status, _) = send(&router, empty(Method::POST, "/v1/bottle/shop/actions/delete")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&router, empty(Method::GET, "/v1/bottle/shop")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test(tokio::test)]
async fn policy_validation_is_bad_request() {
    let h = harness().await;
    let router = app(h.state.clone());
    let (status, body) = send(
        &router,
        json_request(
            Method::POST,
            "/v1/policies",
            &json!({"type": "north_south_enforce", "source": {"container_name": "web"}, "destination": {"address": "nowhere"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = send(&router, empty(Method::GET, "/v1/policies/east_west")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = send(&router, empty(Method::GET, "/v1/policies/sideways")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test(tokio::test)]
async fn unsupported_manifest_kind_is_rejected() {
    let h = harness().await;
    let router = app(h.state.clone());
    let (status, body) = send(&router, text_request("/v1/pods", "kind: Deployment\nmetadata: {name: x}\n")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["status"], "fail");
}

#[test(tokio::test)]
async fn hook_delivery_moves_container() {
    let h = harness().await;
    h.runtime.suppress(HookEvent::CreateRuntime);
    let record = h
        .state
        .platform
        .engine
        .create(raind::runtime::CreateRequest::new("alpine"))
        .await
        .unwrap();
    assert_eq!(record.state, ContainerStatus::Creating);

    let hooks = hook_app(h.state.clone());
    let mut state = ContainerState::new(record.container_id.clone(), "/bundle");
    state.pid = Some(4242);
    let peer = container_peer(&record.container_id);
    let (status, body) = send(&hooks, hook_request("createRuntime", &state, peer.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let record = h.state.platform.engine.get(&record.container_id).unwrap();
    assert_eq!(record.state, ContainerStatus::Created);
    assert_eq!(record.pid, 4242);

    let (status, _) = send(&hooks, hook_request("reboot", &state, peer)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test(tokio::test)]
async fn hook_body_limit_and_bootstrap_credential() {
    let h = harness().await;
    let hooks = hook_app(h.state.clone());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/hooks/droplet")
        .header("x-hook-event", "poststart")
        .extension(ConnectInfo(container_peer("abc")))
        .body(Body::from(vec![b' '; 2 * 1024 * 1024]))
        .unwrap();
    let (status, _) = send(&hooks, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, body) = send(&hooks, text_request("/v1/pki/sign", "not a csr")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "fail");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/pki/sign")
        .header("x-raind-hook-setter", "CONDENSER")
        .body(Body::from("not a csr"))
        .unwrap();
    let (status, body) = send(&hooks, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

#[test(tokio::test)]
async fn hooks_require_the_container_identity() {
    let h = harness().await;
    let router = app(h.state.clone());
    let (status, body) = send(
        &router,
        json_request(Method::POST, "/v1/containers", &json!({"image": "alpine", "name": "victim"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let dir = h.state.platform.config.paths.container(&id);
    let hooks = hook_app(h.state.clone());
    let state = ContainerState::new(id.clone(), "/bundle");

    let (status, _) = send(&hooks, hook_request("poststop", &state, HookPeer::anonymous(peer_addr()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&hooks, hook_request("poststop", &state, container_peer("someoneelse"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "fail");

    let foreign = HookPeer::authenticated(peer_addr(), SpiffeId::container("other.domain", &id));
    let (status, _) = send(&hooks, hook_request("poststop", &state, foreign)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let record = h.state.platform.engine.get(&id).unwrap();
    assert_eq!(record.state, ContainerStatus::Created);
    assert!(dir.exists());
}

#[test(tokio::test)]
async fn hook_listener_authenticates_over_tls() {
    let h = harness().await;
    h.runtime.suppress(HookEvent::CreateRuntime);
    let platform = h.state.platform.clone();
    let record = platform
        .engine
        .create(raind::runtime::CreateRequest::new("alpine"))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = tls::server_config(&platform.pki, addr).unwrap();
    let listener = HookListener::new(listener, config).unwrap();
    let service = hook_app(h.state.clone()).into_make_service_with_connect_info::<HookPeer>();
    tokio::spawn(async move { axum::serve(listener, service).await });

    let ca = reqwest::Certificate::from_pem(platform.pki.ca_pem().as_bytes()).unwrap();
    let builder = || {
        reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca.clone())
            .timeout(Duration::from_secs(5))
    };
    let spiffe_id = SpiffeId::container("raind.local", record.container_id.clone());
    let (csr, key) = container_csr(&spiffe_id).unwrap();
    let issued = platform.pki.sign(&csr).unwrap();
    let identity = reqwest::Identity::from_pem(format!("{key}{}", issued.pem).as_bytes()).unwrap();

    let mut state = ContainerState::new(record.container_id.clone(), "/bundle");
    state.pid = Some(4242);
    let url = format!("https://{addr}/v1/hooks/droplet");
    let post = |client: &reqwest::Client| {
        client
            .post(&url)
            .header("x-hook-event", "createRuntime")
            .body(serde_json::to_vec(&state).unwrap())
            .send()
    };

    let anonymous = post(&builder().build().unwrap()).await.unwrap();
    assert_eq!(anonymous.status().as_u16(), 401);
    assert_eq!(
        platform.engine.get(&record.container_id).unwrap().state,
        ContainerStatus::Creating
    );

    let client = builder().identity(identity).build().unwrap();
    let response = post(&client).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let record = platform.engine.get(&record.container_id).unwrap();
    assert_eq!(record.state, ContainerStatus::Created);
    assert_eq!(record.pid, 4242);
}
