//! Registry client and pull materialization.
//!
//! A pull writes the bundle layout
//! `<bundle>/{manifest.json, manifest.selected.json, config.json, blobs/sha256/…, rootfs/}`.
//! Every blob is hashed while it streams to disk and checked against its
//! descriptor; any failure removes the partially written bundle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use raind_common::fs::remove_dir_all_if_exists;
use raind_common::{RaindError, RaindResult};
use raind_oci::image::{ImageIndex, ImageManifest, media_types};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::layer::{apply_layer, sha256_digest, verify_digest};
use crate::reference::ImageReference;

/// Overall timeout for registry HTTP calls.
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(60);
/// Operating system selected from multi-platform indexes.
pub const TARGET_OS: &str = "linux";
/// Architecture selected from multi-platform indexes.
pub const TARGET_ARCH: &str = "amd64";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Fetches an image into a bundle directory.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pull `image` into `bundle`, producing `config.json` and `rootfs/`.
    ///
    /// # Errors
    ///
    /// Returns registry, timeout, digest or I/O errors. On error `bundle` does
    /// not exist.
    async fn pull(&self, image: &ImageReference, bundle: &Path) -> RaindResult<()>;
}

/// Registry client for pulling images.
pub struct RegistryClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

fn registry_error(context: &str, err: &reqwest::Error) -> RaindError {
    if err.is_timeout() {
        RaindError::Timeout {
            operation: context.to_string(),
        }
    } else {
        RaindError::Registry {
            message: format!("{context}: {err}"),
        }
    }
}

impl RegistryClient {
    /// Create a new registry client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> RaindResult<Self> {
        let client = Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .map_err(|e| registry_error("build http client", &e))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a client for the registry an image lives on.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn for_reference(image: &ImageReference) -> RaindResult<Self> {
        if image.is_docker_hub() {
            Self::new("https://registry-1.docker.io")
        } else if image.registry.starts_with("localhost") || image.registry.starts_with("127.") {
            Self::new(format!("http://{}", image.registry))
        } else {
            Self::new(format!("https://{}", image.registry))
        }
    }

    /// Fetch a manifest or index by tag or digest. Returns the body bytes.
    ///
    /// # Errors
    ///
    /// Returns registry or timeout errors.
    pub async fn get_manifest(&mut self, repository: &str, reference: &str) -> RaindResult<Vec<u8>> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        tracing::debug!(url = %url, "Getting manifest");
        let response = self.send(repository, &url, Some(MANIFEST_ACCEPT)).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| registry_error("read manifest body", &e))?;
        Ok(body.to_vec())
    }

    /// Stream a blob to `dest`, verifying its digest.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::DigestMismatch`] if the content does not hash to
    /// `digest`, or registry, timeout and I/O errors.
    pub async fn download_blob(&mut self, repository: &str, digest: &str, dest: &Path) -> RaindResult<()> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        tracing::debug!(url = %url, "Getting blob");
        let response = self.send(repository, &url, None).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| registry_error("read blob body", &e))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        verify_digest(digest, &actual)
    }

    async fn send(&mut self, repository: &str, url: &str, accept: Option<&str>) -> RaindResult<Response> {
        let mut authenticated = false;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| registry_error("registry request", &e))?;

            if response.status() == StatusCode::UNAUTHORIZED && !authenticated {
                self.authenticate(repository, &response).await?;
                authenticated = true;
                continue;
            }
            if !response.status().is_success() {
                return Err(RaindError::Registry {
                    message: format!("GET {url}: {}", response.status()),
                });
            }
            return Ok(response);
        }
    }

    async fn authenticate(&mut self, repository: &str, response: &Response) -> RaindResult<()> {
        let auth_header = response
            .headers()
            .get("Www-Authenticate")
            .ok_or_else(|| RaindError::Registry {
                message: "missing Www-Authenticate header".to_string(),
            })?
            .to_str()
            .map_err(|_| RaindError::Registry {
                message: "invalid Www-Authenticate header".to_string(),
            })?;

        tracing::debug!(header = auth_header, "Authenticating");

        // Bearer realm="...",service="...",scope="..."
        let params: HashMap<&str, &str> = auth_header
            .trim_start_matches("Bearer ")
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                Some((key.trim(), value.trim().trim_matches('"')))
            })
            .collect();

        let realm = params.get("realm").ok_or_else(|| RaindError::Registry {
            message: "missing realm in Www-Authenticate".to_string(),
        })?;
        let scope = params
            .get("scope")
            .map_or_else(|| format!("repository:{repository}:pull"), ToString::to_string);
        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", (*service).to_string()));
        }

        let token: TokenResponse = self
            .client
            .get(*realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| registry_error("request token", &e))?
            .json()
            .await
            .map_err(|e| registry_error("parse token response", &e))?;

        self.token = Some(token.token.or(token.access_token).ok_or_else(|| {
            RaindError::Registry {
                message: "no token in response".to_string(),
            }
        })?);
        Ok(())
    }
}

/// [`ImagePuller`] backed by the OCI distribution API.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryPuller;

#[async_trait]
impl ImagePuller for RegistryPuller {
    async fn pull(&self, image: &ImageReference, bundle: &Path) -> RaindResult<()> {
        tracing::info!(image = %image, bundle = %bundle.display(), "Pulling image");
        let mut client = RegistryClient::for_reference(image)?;
        match pull_into(&mut client, image, bundle).await {
            Ok(()) => {
                tracing::info!(image = %image, "Image pulled");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(image = %image, error = %err, "Pull failed, removing bundle");
                if let Err(cleanup) = remove_dir_all_if_exists(bundle) {
                    tracing::warn!(error = %cleanup, "Failed to remove partial bundle");
                }
                Err(err)
            }
        }
    }
}

async fn pull_into(client: &mut RegistryClient, image: &ImageReference, bundle: &Path) -> RaindResult<()> {
    let blobs = bundle.join("blobs").join("sha256");
    tokio::fs::create_dir_all(&blobs).await?;

    let top = client.get_manifest(&image.repository, image.reference()).await?;
    tokio::fs::write(bundle.join("manifest.json"), &top).await?;

    let selected = select_manifest(client, image, top).await?;
    tokio::fs::write(bundle.join("manifest.selected.json"), &selected).await?;
    let manifest: ImageManifest = serde_json::from_slice(&selected)?;

    let config_blob = blob_path(&blobs, &manifest.config.digest)?;
    client
        .download_blob(&image.repository, &manifest.config.digest, &config_blob)
        .await?;
    tokio::fs::copy(&config_blob, bundle.join("config.json")).await?;

    let rootfs = bundle.join("rootfs");
    tokio::fs::create_dir_all(&rootfs).await?;
    for layer in &manifest.layers {
        let path = blob_path(&blobs, &layer.digest)?;
        client.download_blob(&image.repository, &layer.digest, &path).await?;
        let rootfs = rootfs.clone();
        tokio::task::spawn_blocking(move || apply_layer(&path, &rootfs))
            .await
            .map_err(|e| RaindError::internal(format!("layer extraction task: {e}")))??;
    }
    Ok(())
}

/// Resolve an index to the linux/amd64 manifest; plain manifests pass through.
async fn select_manifest(
    client: &mut RegistryClient,
    image: &ImageReference,
    top: Vec<u8>,
) -> RaindResult<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(&top)?;
    let is_index = value
        .get("mediaType")
        .and_then(serde_json::Value::as_str)
        .is_some_and(media_types::is_index)
        || value.get("manifests").is_some();
    if !is_index {
        return Ok(top);
    }

    let index: ImageIndex = serde_json::from_value(value)?;
    let entry = index.select(TARGET_OS, TARGET_ARCH).ok_or_else(|| RaindError::Registry {
        message: format!("{image} has no {TARGET_OS}/{TARGET_ARCH} manifest"),
    })?;
    let digest = entry.descriptor.digest.clone();
    let body = client.get_manifest(&image.repository, &digest).await?;
    verify_digest(&digest, &sha256_digest(&body))?;
    Ok(body)
}

fn blob_path(blobs: &Path, digest: &str) -> RaindResult<PathBuf> {
    let hex = digest
        .strip_prefix("sha256:")
        .filter(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| RaindError::validation("blob digest", digest.to_string()))?;
    Ok(blobs.join(hex))
}
