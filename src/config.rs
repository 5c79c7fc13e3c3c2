//! Build configuration
//!
//! One configuration object covers a whole containerization run: where the
//! base image comes from, where the result goes, cache locations, platform,
//! timestamp policy, transport limits, and the credential retriever chain.
//! Validation happens before any I/O.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::credentials::CredentialRetriever;
use crate::error::{BuildError, Result};
use crate::image::reference::ImageReference;

/// Default connect and read timeout for registry requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// An instant, or "whatever the clock says when the build runs".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSpec {
    Instant(SystemTime),
    UseCurrent,
}

impl TimestampSpec {
    pub fn resolve(&self) -> SystemTime {
        match self {
            TimestampSpec::Instant(t) => *t,
            TimestampSpec::UseCurrent => SystemTime::now(),
        }
    }

    /// Epoch plus one second, the reproducible default for file entries.
    pub fn epoch_plus_second() -> Self {
        TimestampSpec::Instant(UNIX_EPOCH + Duration::from_secs(1))
    }

    /// The epoch, the reproducible default for the image creation time.
    pub fn epoch() -> Self {
        TimestampSpec::Instant(UNIX_EPOCH)
    }
}

/// Target platform selected from multi-platform base images and recorded
/// in the produced config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

/// Configuration for one build.
#[derive(Clone)]
pub struct BuildConfiguration {
    pub base_image: ImageReference,
    pub target_image: Option<ImageReference>,
    pub additional_tags: BTreeSet<String>,
    pub allow_insecure_registries: bool,
    pub send_credentials_over_http: bool,
    pub application_layers_cache_dir: PathBuf,
    pub base_image_layers_cache_dir: PathBuf,
    pub platform: Platform,
    pub creation_time: TimestampSpec,
    pub files_modification_time: TimestampSpec,
    pub http_timeout: Duration,
    pub credential_retrievers: Vec<Arc<dyn CredentialRetriever>>,
}

impl BuildConfiguration {
    pub fn new(base_image: ImageReference) -> Self {
        BuildConfiguration {
            base_image,
            target_image: None,
            additional_tags: BTreeSet::new(),
            allow_insecure_registries: false,
            send_credentials_over_http: false,
            application_layers_cache_dir: PathBuf::from(".cache/application-layers"),
            base_image_layers_cache_dir: PathBuf::from(".cache/base-image-layers"),
            platform: Platform::default(),
            creation_time: TimestampSpec::epoch(),
            files_modification_time: TimestampSpec::epoch_plus_second(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            credential_retrievers: Vec::new(),
        }
    }

    pub fn with_target_image(mut self, target: ImageReference) -> Self {
        self.target_image = Some(target);
        self
    }

    pub fn with_additional_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.additional_tags.extend(tags);
        self
    }

    pub fn with_allow_insecure_registries(mut self, allow: bool) -> Self {
        self.allow_insecure_registries = allow;
        self
    }

    pub fn with_send_credentials_over_http(mut self, send: bool) -> Self {
        self.send_credentials_over_http = send;
        self
    }

    pub fn with_application_layers_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.application_layers_cache_dir = dir.into();
        self
    }

    pub fn with_base_image_layers_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_image_layers_cache_dir = dir.into();
        self
    }

    pub fn with_platform(mut self, architecture: impl Into<String>, os: impl Into<String>) -> Self {
        self.platform = Platform {
            architecture: architecture.into(),
            os: os.into(),
        };
        self
    }

    pub fn with_creation_time(mut self, spec: TimestampSpec) -> Self {
        self.creation_time = spec;
        self
    }

    pub fn with_files_modification_time(mut self, spec: TimestampSpec) -> Self {
        self.files_modification_time = spec;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_credential_retriever(
        mut self,
        retriever: Arc<dyn CredentialRetriever>,
    ) -> Self {
        self.credential_retrievers.push(retriever);
        self
    }

    /// Sanity checks that need no I/O; anything failing here is
    /// [`BuildError::InvalidConfiguration`].
    pub fn validate(&self) -> Result<()> {
        if let Some(target) = &self.target_image {
            if target.is_scratch() {
                return Err(BuildError::InvalidConfiguration(
                    "target image cannot be 'scratch'".to_string(),
                ));
            }
        }
        for tag in &self.additional_tags {
            let valid = !tag.is_empty()
                && tag.len() <= 128
                && tag
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b));
            if !valid {
                return Err(BuildError::InvalidConfiguration(format!(
                    "invalid additional tag '{}'",
                    tag
                )));
            }
        }
        if self.application_layers_cache_dir == self.base_image_layers_cache_dir {
            // Shared directories are fine for layers but the image metadata
            // of base and target would collide.
            return Err(BuildError::InvalidConfiguration(
                "application and base image caches must use distinct directories".to_string(),
            ));
        }
        Ok(())
    }

    /// The target image, which registry and daemon sinks require.
    pub fn require_target_image(&self) -> Result<&ImageReference> {
        self.target_image.as_ref().ok_or_else(|| {
            BuildError::InvalidConfiguration(
                "a target image is required for this sink".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ImageReference {
        ImageReference::parse("gcr.io/distroless/java:11").unwrap()
    }

    #[test]
    fn defaults_are_reproducible() {
        let config = BuildConfiguration::new(base());
        assert_eq!(config.creation_time, TimestampSpec::epoch());
        assert_eq!(
            config.files_modification_time,
            TimestampSpec::epoch_plus_second()
        );
        assert_eq!(config.http_timeout, DEFAULT_HTTP_TIMEOUT);
        assert_eq!(config.platform, Platform::default());
        assert!(!config.allow_insecure_registries);
        assert!(!config.send_credentials_over_http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn scratch_target_is_rejected() {
        let config =
            BuildConfiguration::new(base()).with_target_image(ImageReference::scratch());
        assert!(matches!(
            config.validate(),
            Err(BuildError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn bad_additional_tag_is_rejected() {
        let config = BuildConfiguration::new(base())
            .with_additional_tags(["ok-tag".to_string(), "not a tag".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn colliding_cache_dirs_are_rejected() {
        let config = BuildConfiguration::new(base())
            .with_application_layers_cache_dir("/tmp/cache")
            .with_base_image_layers_cache_dir("/tmp/cache");
        assert!(config.validate().is_err());
    }

    #[test]
    fn require_target_image() {
        let config = BuildConfiguration::new(base());
        assert!(config.require_target_image().is_err());
        let config =
            config.with_target_image(ImageReference::parse("gcr.io/my/app:latest").unwrap());
        assert_eq!(
            config.require_target_image().unwrap().repository(),
            "my/app"
        );
    }

    #[test]
    fn use_current_resolves_to_now() {
        let before = SystemTime::now();
        let resolved = TimestampSpec::UseCurrent.resolve();
        assert!(resolved >= before);
        assert_eq!(
            TimestampSpec::epoch().resolve(),
            UNIX_EPOCH,
        );
    }
}
