//! Pull an image from an in-process registry.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use flate2::Compression;
use flate2::write::GzEncoder;
use raind_common::RaindError;
use raind_image::layer::sha256_digest;
use raind_image::{ImagePuller, ImageReference, RegistryPuller};

#[derive(Default)]
struct Registry {
    manifests: HashMap<String, (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
}

async fn manifest(
    State(registry): State<Arc<Registry>>,
    Path(reference): Path<String>,
) -> impl IntoResponse {
    match registry.manifests.get(&reference) {
        Some((media_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, media_type.clone())], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn blob(State(registry): State<Arc<Registry>>, Path(digest): Path<String>) -> impl IntoResponse {
    registry
        .blobs
        .get(&digest)
        .map_or_else(|| StatusCode::NOT_FOUND.into_response(), |b| b.clone().into_response())
}

async fn serve(registry: Registry) -> String {
    let app = Router::new()
        .route("/v2/library/demo/manifests/{reference}", get(manifest))
        .route("/v2/library/demo/blobs/{digest}", get(blob))
        .with_state(Arc::new(registry));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn layer() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let data = b"hello from demo\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "etc/motd", &data[..]).unwrap();
    let tarball = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tarball).unwrap();
    encoder.finish().unwrap()
}

/// Registry serving an index -> amd64 manifest -> config + one layer.
/// `corrupt_layer` serves different bytes than the layer digest advertises.
fn demo_registry(corrupt_layer: bool) -> Registry {
    let config = br#"{"architecture":"amd64","os":"linux","config":{"Cmd":["/bin/demo"]}}"#.to_vec();
    let layer = layer();
    let config_digest = sha256_digest(&config);
    let layer_digest = sha256_digest(&layer);

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"mediaType": "application/vnd.oci.image.config.v1+json",
                   "digest": config_digest, "size": config.len()},
        "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": layer_digest, "size": layer.len()}]
    });
    let manifest = serde_json::to_vec(&manifest).unwrap();
    let manifest_digest = sha256_digest(&manifest);

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {"mediaType": "application/vnd.oci.image.manifest.v1+json",
             "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
             "size": 1, "platform": {"os": "linux", "architecture": "arm64"}},
            {"mediaType": "application/vnd.oci.image.manifest.v1+json",
             "digest": manifest_digest, "size": manifest.len(),
             "platform": {"os": "linux", "architecture": "amd64"}}
        ]
    });

    let mut registry = Registry::default();
    registry.manifests.insert(
        "latest".into(),
        (
            "application/vnd.oci.image.index.v1+json".into(),
            serde_json::to_vec(&index).unwrap(),
        ),
    );
    registry.manifests.insert(
        manifest_digest,
        ("application/vnd.oci.image.manifest.v1+json".into(), manifest),
    );
    registry.blobs.insert(config_digest, config);
    let served_layer = if corrupt_layer { b"tampered".to_vec() } else { layer };
    registry.blobs.insert(layer_digest, served_layer);
    registry
}

#[tokio::test]
async fn pulls_index_selected_manifest() {
    let host = serve(demo_registry(false)).await;
    let temp = tempfile::tempdir().unwrap();
    let bundle = temp.path().join("demo/latest");
    let image = ImageReference::parse(&format!("{host}/demo")).unwrap();

    RegistryPuller.pull(&image, &bundle).await.unwrap();

    assert!(bundle.join("manifest.json").exists());
    assert!(bundle.join("manifest.selected.json").exists());
    let config = std::fs::read_to_string(bundle.join("config.json")).unwrap();
    assert!(config.contains("/bin/demo"));
    assert_eq!(
        std::fs::read_to_string(bundle.join("rootfs/etc/motd")).unwrap(),
        "hello from demo\n"
    );
}

#[tokio::test]
async fn digest_mismatch_aborts_and_cleans_bundle() {
    let host = serve(demo_registry(true)).await;
    let temp = tempfile::tempdir().unwrap();
    let bundle = temp.path().join("demo/latest");
    let image = ImageReference::parse(&format!("{host}/demo")).unwrap();

    let err = RegistryPuller.pull(&image, &bundle).await.unwrap_err();
    assert!(matches!(err, RaindError::DigestMismatch { .. }), "{err}");
    assert!(!bundle.exists());
}

#[tokio::test]
async fn unknown_tag_is_a_registry_error() {
    let host = serve(demo_registry(false)).await;
    let temp = tempfile::tempdir().unwrap();
    let image = ImageReference::parse(&format!("{host}/demo:missing")).unwrap();

    let err = RegistryPuller
        .pull(&image, &temp.path().join("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, RaindError::Registry { .. }), "{err}");
}
