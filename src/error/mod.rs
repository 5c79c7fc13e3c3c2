//! Error types for the build pipeline and registry operations

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Failure classes surfaced across component boundaries.
///
/// Retrying happens only inside the HTTP transport; every other layer either
/// propagates one of these kinds or fails.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Malformed image reference, missing required fields, negative timeouts.
    /// Surfaced before any I/O happens.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A digest string that is not `sha256:` plus 64 lowercase hex characters.
    #[error("invalid digest format: {0}")]
    InvalidDigestFormat(String),

    /// No working credentials for a registry after trying every retriever.
    #[error(
        "no working credentials for registry {registry} ({retrievers_tried} credential retriever(s) tried)"
    )]
    AuthenticationFailed {
        registry: String,
        retrievers_tried: usize,
    },

    /// 401/403 after a successful authentication handshake.
    #[error("registry denied access to {registry}/{repository}: {message}")]
    RegistryUnauthorized {
        registry: String,
        repository: String,
        message: String,
    },

    /// Network failure, timeout, or malformed response, after transport
    /// retries were exhausted.
    #[error("registry transport error: {0}")]
    RegistryTransport(String),

    /// The registry returned a well-formed error document.
    #[error("registry error ({code}): {message}")]
    RegistryError { code: String, message: String },

    /// Manifest list with no child matching the configured platform.
    #[error("no manifest for platform {architecture}/{os}")]
    UnsupportedPlatform { architecture: String, os: String },

    /// An on-disk cache invariant was violated, e.g. digest mismatch on read.
    #[error("cache entry corrupted at {path}: {message}")]
    CacheCorrupted { path: PathBuf, message: String },

    /// Duplicate layer digest mapping to different content.
    #[error("conflicting cache contents for layer {0}")]
    LayerConflict(String),

    /// Cooperative cancellation of the build.
    #[error("build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// First failure of a parallel step group, with the failures of cancelled
    /// or later-failing siblings attached for diagnostics.
    #[error("{first} ({} suppressed sibling failure(s))", .suppressed.len())]
    WithSuppressed {
        first: Box<BuildError>,
        suppressed: Vec<BuildError>,
    },
}

impl BuildError {
    /// Attach sibling failures to this error without losing the primary cause.
    pub fn with_suppressed(self, suppressed: Vec<BuildError>) -> BuildError {
        if suppressed.is_empty() {
            return self;
        }
        match self {
            BuildError::WithSuppressed {
                first,
                suppressed: mut existing,
            } => {
                existing.extend(suppressed);
                BuildError::WithSuppressed {
                    first,
                    suppressed: existing,
                }
            }
            other => BuildError::WithSuppressed {
                first: Box::new(other),
                suppressed,
            },
        }
    }

    /// The primary cause, unwrapping any suppressed-sibling envelope.
    pub fn primary(&self) -> &BuildError {
        match self {
            BuildError::WithSuppressed { first, .. } => first,
            other => other,
        }
    }

    /// Sibling failures attached to this error, empty for plain errors.
    pub fn suppressed(&self) -> &[BuildError] {
        match self {
            BuildError::WithSuppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.primary(), BuildError::Cancelled)
    }

    /// An equivalent error value. Coalesced steps hand one failure to every
    /// waiter through an `Arc`; this turns the shared reference back into an
    /// owned error without losing the kind.
    pub fn duplicate(&self) -> BuildError {
        match self {
            BuildError::InvalidConfiguration(s) => BuildError::InvalidConfiguration(s.clone()),
            BuildError::InvalidDigestFormat(s) => BuildError::InvalidDigestFormat(s.clone()),
            BuildError::AuthenticationFailed {
                registry,
                retrievers_tried,
            } => BuildError::AuthenticationFailed {
                registry: registry.clone(),
                retrievers_tried: *retrievers_tried,
            },
            BuildError::RegistryUnauthorized {
                registry,
                repository,
                message,
            } => BuildError::RegistryUnauthorized {
                registry: registry.clone(),
                repository: repository.clone(),
                message: message.clone(),
            },
            BuildError::RegistryTransport(s) => BuildError::RegistryTransport(s.clone()),
            BuildError::RegistryError { code, message } => BuildError::RegistryError {
                code: code.clone(),
                message: message.clone(),
            },
            BuildError::UnsupportedPlatform { architecture, os } => {
                BuildError::UnsupportedPlatform {
                    architecture: architecture.clone(),
                    os: os.clone(),
                }
            }
            BuildError::CacheCorrupted { path, message } => BuildError::CacheCorrupted {
                path: path.clone(),
                message: message.clone(),
            },
            BuildError::LayerConflict(s) => BuildError::LayerConflict(s.clone()),
            BuildError::Cancelled => BuildError::Cancelled,
            BuildError::Io(e) => BuildError::Io(std::io::Error::new(e.kind(), e.to_string())),
            BuildError::Json(e) => {
                BuildError::Json(<serde_json::Error as serde::de::Error>::custom(e))
            }
            BuildError::WithSuppressed { first, suppressed } => BuildError::WithSuppressed {
                first: Box::new(first.duplicate()),
                suppressed: suppressed.iter().map(BuildError::duplicate).collect(),
            },
        }
    }
}

impl From<reqwest::Error> for BuildError {
    fn from(err: reqwest::Error) -> Self {
        BuildError::RegistryTransport(err.to_string())
    }
}

impl From<url::ParseError> for BuildError {
    fn from(err: url::ParseError) -> Self {
        BuildError::InvalidConfiguration(format!("invalid URL: {}", err))
    }
}
