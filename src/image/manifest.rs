//! Manifest templates and wire-format parsing
//!
//! Explicit serde types for the supported manifest media types: Docker
//! schema 2, Docker schema 1 (read-only), Docker manifest list, OCI image
//! manifest, and OCI image index. Incoming manifests are classified by
//! their `mediaType` field, falling back to `schemaVersion`, the way
//! registries actually behave.
//!
//! The bytes a manifest was received or serialised as are kept alongside
//! the parsed form: the SHA-256 of those exact bytes is the manifest's
//! identity, and re-serialisation between digesting and pushing would
//! silently change it.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BuildError, Result};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `Accept` header value listing every manifest media type we can parse.
pub fn accept_header() -> String {
    [
        DOCKER_MANIFEST_V2,
        DOCKER_MANIFEST_LIST,
        OCI_MANIFEST,
        OCI_INDEX,
        DOCKER_MANIFEST_V1,
        DOCKER_MANIFEST_V1_SIGNED,
    ]
    .join(", ")
}

/// A content descriptor as embedded in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorTemplate {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

/// Docker schema 2 / OCI image manifest. The two formats share a shape and
/// differ only in media type strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifestTemplate {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: DescriptorTemplate,
    pub layers: Vec<DescriptorTemplate>,
}

/// Target platform of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTemplate {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestListEntry {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    pub platform: PlatformTemplate,
}

/// Docker manifest list / OCI image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestListTemplate {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<ManifestListEntry>,
}

/// Docker schema 1, accepted read-only for old registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1ManifestTemplate {
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub fs_layers: Vec<V1FsLayer>,
    #[serde(default)]
    pub history: Vec<V1HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1FsLayer {
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1HistoryEntry {
    pub v1_compatibility: String,
}

/// A classified manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Docker schema 2 or OCI image manifest.
    Image(ImageManifestTemplate),
    /// Docker manifest list or OCI index.
    List(ManifestListTemplate),
    /// Docker schema 1.
    V1(V1ManifestTemplate),
}

impl Manifest {
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Image(m) => &m.media_type,
            Manifest::List(m) => &m.media_type,
            Manifest::V1(_) => DOCKER_MANIFEST_V1,
        }
    }
}

/// A manifest together with the exact bytes it arrived as (or was first
/// serialised as) and the digest of those bytes.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub digest: Digest,
    pub manifest: Manifest,
}

impl RawManifest {
    pub fn from_bytes(bytes: Vec<u8>, content_type: Option<&str>) -> Result<Self> {
        let manifest = parse_manifest(&bytes, content_type)?;
        let digest = Digest::of_bytes(&bytes);
        Ok(RawManifest {
            bytes,
            digest,
            manifest,
        })
    }
}

/// Classify and parse manifest bytes, trusting the `mediaType` field,
/// then the HTTP `Content-Type`, then `schemaVersion`.
pub fn parse_manifest(bytes: &[u8], content_type: Option<&str>) -> Result<Manifest> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        schema_version: Option<u32>,
        media_type: Option<String>,
    }

    let probe: Probe = serde_json::from_slice(bytes)?;
    let declared = probe
        .media_type
        .as_deref()
        .or(content_type)
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());

    match declared.as_deref() {
        Some(DOCKER_MANIFEST_V2) | Some(OCI_MANIFEST) => {
            Ok(Manifest::Image(serde_json::from_slice(bytes)?))
        }
        Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX) => {
            Ok(Manifest::List(serde_json::from_slice(bytes)?))
        }
        Some(DOCKER_MANIFEST_V1) | Some(DOCKER_MANIFEST_V1_SIGNED) => {
            Ok(Manifest::V1(serde_json::from_slice(bytes)?))
        }
        _ => match probe.schema_version {
            Some(1) => Ok(Manifest::V1(serde_json::from_slice(bytes)?)),
            Some(2) => {
                // Media type missing: OCI manifests may omit it. An image
                // manifest has `config`; an index has `manifests`.
                let value: serde_json::Value = serde_json::from_slice(bytes)?;
                if value.get("manifests").is_some() {
                    let mut list: ManifestListTemplate = serde_json::from_slice(bytes)?;
                    if list.media_type.is_empty() {
                        list.media_type = OCI_INDEX.to_string();
                    }
                    Ok(Manifest::List(list))
                } else {
                    let mut manifest: ImageManifestTemplate = serde_json::from_slice(bytes)?;
                    if manifest.media_type.is_empty() {
                        manifest.media_type = OCI_MANIFEST.to_string();
                    }
                    Ok(Manifest::Image(manifest))
                }
            }
            other => Err(BuildError::RegistryError {
                code: "MANIFEST_INVALID".to_string(),
                message: format!("unrecognised manifest schemaVersion {:?}", other),
            }),
        },
    }
}

/// Select the child of a manifest list matching the target platform.
pub fn select_platform<'a>(
    list: &'a ManifestListTemplate,
    architecture: &str,
    os: &str,
) -> Result<&'a ManifestListEntry> {
    list.manifests
        .iter()
        .find(|entry| entry.platform.architecture == architecture && entry.platform.os == os)
        .ok_or_else(|| BuildError::UnsupportedPlatform {
            architecture: architecture.to_string(),
            os: os.to_string(),
        })
}

impl ImageManifestTemplate {
    /// Assemble a pushable manifest from finished descriptors. OCI output
    /// uses OCI config/layer media types, Docker output the Docker ones.
    pub fn assemble(
        manifest_media_type: &str,
        config: DescriptorTemplate,
        layers: Vec<DescriptorTemplate>,
    ) -> Self {
        ImageManifestTemplate {
            schema_version: 2,
            media_type: manifest_media_type.to_string(),
            config,
            layers,
        }
    }

    /// Serialise once; the returned bytes are both digested and pushed.
    pub fn to_raw(&self) -> Result<RawManifest> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Digest::of_bytes(&bytes);
        Ok(RawManifest {
            bytes,
            digest,
            manifest: Manifest::Image(self.clone()),
        })
    }
}
