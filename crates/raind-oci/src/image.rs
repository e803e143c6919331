//! OCI and Docker image manifest and configuration types.
//!
//! Only the fields raind reads are modelled; unknown fields are ignored on
//! deserialization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type of the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor.
    pub config: Descriptor,
    /// Image layers, base layer first.
    pub layers: Vec<Descriptor>,
}

/// Image index (multi-architecture manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Manifest list.
    pub manifests: Vec<ManifestDescriptor>,
}

impl ImageIndex {
    /// The manifest for `os`/`architecture`, if the index carries one.
    #[must_use]
    pub fn select(&self, os: &str, architecture: &str) -> Option<&ManifestDescriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == architecture)
        })
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size in bytes.
    pub size: i64,
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Image configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Execution parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfig>,
}

impl ImageConfig {
    /// Execution parameters, or empty defaults when the image has none.
    #[must_use]
    pub fn execution(&self) -> ExecutionConfig {
        self.config.clone().unwrap_or_default()
    }
}

/// Execution configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    /// User.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

impl ExecutionConfig {
    /// Effective command: `user` when non-empty, else `entrypoint ++ cmd`.
    #[must_use]
    pub fn command(&self, user: &[String]) -> Vec<String> {
        if !user.is_empty() {
            return user.to_vec();
        }
        self.entrypoint
            .iter()
            .flatten()
            .chain(self.cmd.iter().flatten())
            .cloned()
            .collect()
    }

    /// Image environment followed by `extra`; later keys override earlier
    /// ones while keeping the first position.
    #[must_use]
    pub fn environment(&self, extra: &[String]) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        for entry in self.env.iter().flatten().chain(extra) {
            let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
            if let Some(existing) = merged
                .iter_mut()
                .find(|e| e.split_once('=').map_or(e.as_str(), |(k, _)| k) == key)
            {
                existing.clone_from(entry);
            } else {
                merged.push(entry.clone());
            }
        }
        merged
    }

    /// Working directory, defaulting to `/`.
    #[must_use]
    pub fn cwd(&self) -> String {
        self.working_dir
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/")
            .to_string()
    }
}

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI layer media type (tar+gzip).
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// OCI layer media type (tar+zstd).
    pub const LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    /// OCI layer media type (uncompressed tar).
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    /// Docker manifest v2 schema 2 media type.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list media type.
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Returns true for index and manifest-list media types.
    #[must_use]
    pub fn is_index(media_type: &str) -> bool {
        media_type == INDEX || media_type == DOCKER_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_selects_platform() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"mediaType": "m", "digest": "sha256:arm", "size": 1,
                 "platform": {"os": "linux", "architecture": "arm64"}},
                {"mediaType": "m", "digest": "sha256:amd", "size": 1,
                 "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        }"#;
        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert_eq!(
            index.select("linux", "amd64").unwrap().descriptor.digest,
            "sha256:amd"
        );
        assert!(index.select("windows", "amd64").is_none());
    }

    #[test]
    fn command_prefers_user_then_entrypoint_and_cmd() {
        let exec = ExecutionConfig {
            entrypoint: Some(vec!["/docker-entrypoint.sh".into()]),
            cmd: Some(vec!["nginx".into(), "-g".into()]),
            ..ExecutionConfig::default()
        };
        assert_eq!(
            exec.command(&[]),
            vec!["/docker-entrypoint.sh", "nginx", "-g"]
        );
        assert_eq!(exec.command(&["sh".into()]), vec!["sh"]);
    }

    #[test]
    fn environment_overrides_keep_order() {
        let exec = ExecutionConfig {
            env: Some(vec!["PATH=/bin".into(), "A=1".into()]),
            ..ExecutionConfig::default()
        };
        assert_eq!(
            exec.environment(&["A=2".into(), "B=3".into()]),
            vec!["PATH=/bin", "A=2", "B=3"]
        );
    }

    #[test]
    fn docker_config_parses_pascal_case() {
        let json = r#"{"architecture":"amd64","os":"linux",
            "config":{"Env":["X=1"],"Cmd":["sh"],"WorkingDir":"/app"}}"#;
        let config: ImageConfig = serde_json::from_str(json).unwrap();
        let exec = config.execution();
        assert_eq!(exec.cwd(), "/app");
        assert_eq!(exec.command(&[]), vec!["sh"]);
    }
}
