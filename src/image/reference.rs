//! Parsing and normalisation of image references
//!
//! Accepts the usual `[registry/]repository[:tag][@digest]` forms and
//! applies the Docker Hub conventions: a missing host means
//! `registry-1.docker.io`, single-segment Hub repositories get the
//! `library/` prefix, a missing tag means `latest`. The bare word `scratch`
//! is the distinguished "no base image" sentinel.

use std::fmt;

use crate::digest::Digest;
use crate::error::{BuildError, Result};

/// Default registry host for references without one.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
/// Repository namespace for official Docker Hub images.
pub const DOCKER_HUB_LIBRARY: &str = "library";
/// Sentinel reference meaning "no base image".
pub const SCRATCH: &str = "scratch";

/// A normalised image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
    scratch: bool,
}

impl ImageReference {
    /// Parse and normalise a reference string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(BuildError::InvalidConfiguration(
                "image reference is empty".to_string(),
            ));
        }
        if s == SCRATCH {
            return Ok(Self::scratch());
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (s, None),
        };

        // A ':' after the last '/' is a tag separator; earlier ones belong
        // to the registry host's port.
        let (name, tag) = match name.rfind(':') {
            Some(colon) if colon > name.rfind('/').unwrap_or(0) => {
                (&name[..colon], Some(name[colon + 1..].to_string()))
            }
            _ => (name, None),
        };

        let (registry, mut repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };

        if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            repository = format!("{}/{}", DOCKER_HUB_LIBRARY, repository);
        }

        validate_repository(&repository)?;
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
            scratch: false,
        })
    }

    /// The distinguished "no base image" value.
    pub fn scratch() -> Self {
        ImageReference {
            registry: String::new(),
            repository: SCRATCH.to_string(),
            tag: None,
            digest: None,
            scratch: true,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The reference part used in manifest URLs: the digest when pinned,
    /// otherwise the tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => "latest".to_string(),
        }
    }

    /// Whether two references point at the same registry host, making
    /// cross-repository blob mounting possible between them.
    pub fn same_registry(&self, other: &ImageReference) -> bool {
        !self.scratch && !other.scratch && self.registry == other.registry
    }

    /// Reference with the tag replaced, keeping registry and repository.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.tag = Some(tag.into());
        copy.digest = None;
        copy
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
            && c.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
    };
    if repository.is_empty() || !repository.split('/').all(valid_component) {
        return Err(BuildError::InvalidConfiguration(format!(
            "invalid repository name '{}'",
            repository
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let ok = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b));
    if !ok {
        return Err(BuildError::InvalidConfiguration(format!(
            "invalid tag '{}'",
            tag
        )));
    }
    Ok(())
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scratch {
            return write!(f, "{}", SCRATCH);
        }
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        ImageReference::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_normalises_to_docker_hub_library() {
        let reference = ImageReference::parse("busybox").unwrap();
        assert_eq!(reference.registry(), DOCKER_HUB_REGISTRY);
        assert_eq!(reference.repository(), "library/busybox");
        assert_eq!(reference.tag(), Some("latest"));
        assert!(reference.digest().is_none());
    }

    #[test]
    fn user_repository_on_docker_hub_keeps_namespace() {
        let reference = ImageReference::parse("someuser/someapp:v2").unwrap();
        assert_eq!(reference.registry(), DOCKER_HUB_REGISTRY);
        assert_eq!(reference.repository(), "someuser/someapp");
        assert_eq!(reference.tag(), Some("v2"));
    }

    #[test]
    fn explicit_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/my/app:dev").unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "my/app");
        assert_eq!(reference.tag(), Some("dev"));
    }

    #[test]
    fn digest_pinned_reference() {
        let hex = "a".repeat(64);
        let reference =
            ImageReference::parse(&format!("gcr.io/distroless/java@sha256:{}", hex)).unwrap();
        assert_eq!(reference.registry(), "gcr.io");
        assert_eq!(reference.repository(), "distroless/java");
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.reference(), format!("sha256:{}", hex));
    }

    #[test]
    fn tag_and_digest_together() {
        let hex = "b".repeat(64);
        let reference =
            ImageReference::parse(&format!("quay.io/app/img:1.0@sha256:{}", hex)).unwrap();
        assert_eq!(reference.tag(), Some("1.0"));
        // Digest wins for manifest URLs.
        assert_eq!(reference.reference(), format!("sha256:{}", hex));
    }

    #[test]
    fn scratch_is_a_sentinel() {
        let reference = ImageReference::parse("scratch").unwrap();
        assert!(reference.is_scratch());
        assert_eq!(reference.to_string(), "scratch");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("UPPER/case").is_err());
        assert!(ImageReference::parse("repo:tag with space").is_err());
        assert!(ImageReference::parse("gcr.io/app@sha999:abc").is_err());
    }

    #[test]
    fn same_registry_enables_mounting() {
        let base = ImageReference::parse("a.example/src/base").unwrap();
        let target = ImageReference::parse("a.example/dst/app").unwrap();
        let elsewhere = ImageReference::parse("b.example/dst/app").unwrap();
        assert!(base.same_registry(&target));
        assert!(!base.same_registry(&elsewhere));
        assert!(!ImageReference::scratch().same_registry(&target));
    }

    #[test]
    fn display_round_trips() {
        for input in [
            "registry-1.docker.io/library/busybox:latest",
            "gcr.io/distroless/java:11",
            "localhost:5000/my/app:dev",
        ] {
            let parsed = ImageReference::parse(input).unwrap();
            assert_eq!(parsed.to_string(), input);
            assert_eq!(ImageReference::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }
}
