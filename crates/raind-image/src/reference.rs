//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use raind_common::{RaindError, RaindResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (with optional port).
    pub registry: String,
    /// Repository name, always namespaced (`library/alpine`).
    pub repository: String,
    /// Tag or digest.
    pub tag: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageTag {
    /// The tag or digest as stored in the image store.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(tag) => tag,
            Self::Digest(digest) => digest,
        }
    }
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";
    /// Namespace given to bare repository names.
    pub const DEFAULT_NAMESPACE: &'static str = "library";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `x@sha256:...` -> docker.io/library/x@sha256:...
    /// - `localhost:5000/org/app:v1` -> localhost:5000/org/app:v1
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty names, whitespace, empty tags or
    /// digests that are not `sha256:<hex>`.
    pub fn parse(reference: &str) -> RaindResult<Self> {
        let invalid = |reason: &str| {
            RaindError::validation("image reference", format!("{reference:?}: {reason}"))
        };
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid("empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            let hex = digest
                .strip_prefix("sha256:")
                .ok_or_else(|| invalid("digest must be sha256"))?;
            if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("malformed digest"));
            }
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // registry:port/image has no tag
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else if potential_tag.is_empty() {
                return Err(invalid("empty tag"));
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() || name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(invalid("malformed repository"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                let repository = if rest.contains('/') {
                    rest.to_string()
                } else {
                    format!("{}/{rest}", Self::DEFAULT_NAMESPACE)
                };
                (first.to_string(), repository)
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("{}/{name}", Self::DEFAULT_NAMESPACE),
            ),
        };

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// The tag or digest.
    #[must_use]
    pub fn reference(&self) -> &str {
        self.tag.as_str()
    }

    /// Whether the image lives on Docker Hub.
    #[must_use]
    pub fn is_docker_hub(&self) -> bool {
        self.registry == Self::DEFAULT_REGISTRY
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.tag {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn pair(s: &str) -> (String, String) {
        let r = ImageReference::parse(s).unwrap();
        (r.repository.clone(), r.reference().to_string())
    }

    #[test]
    fn parse_simple() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert!(matches!(r.tag, ImageTag::Tag(t) if t == "latest"));
    }

    #[test]
    fn canonical_pairs() {
        assert_eq!(pair("nginx"), ("library/nginx".into(), "latest".into()));
        assert_eq!(pair("a/b:1"), ("a/b".into(), "1".into()));
        let digest = format!("sha256:{}", "ab".repeat(32));
        assert_eq!(
            pair(&format!("x@{digest}")),
            ("library/x".into(), digest.clone())
        );
    }

    #[test]
    fn parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/app:v1.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.reference(), "v1.0");

        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "library/app");
        assert_eq!(r.reference(), "latest");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "  ", "a b", "x@md5:00", "x@sha256:", "x:", "/x", "a//b"] {
            assert!(ImageReference::parse(bad).is_err(), "{bad:?} should fail");
        }
    }

    proptest! {
        #[test]
        fn tag_round_trip(
            ns in "[a-z][a-z0-9]{0,8}",
            name in "[a-z][a-z0-9-]{0,12}",
            tag in "[a-zA-Z0-9][a-zA-Z0-9._-]{0,10}",
        ) {
            let r = ImageReference::parse(&format!("{ns}/{name}:{tag}")).unwrap();
            prop_assert_eq!(r.repository.clone(), format!("{ns}/{name}"));
            prop_assert_eq!(r.reference(), tag.as_str());
        }

        #[test]
        fn bare_names_get_default_namespace_and_tag(name in "[a-z][a-z0-9_-]{0,16}") {
            let r = ImageReference::parse(&name).unwrap();
            prop_assert_eq!(r.repository.clone(), format!("library/{name}"));
            prop_assert_eq!(r.reference(), "latest");
        }
    }
}
