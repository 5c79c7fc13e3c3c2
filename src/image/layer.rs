//! The layer sum type used throughout the build pipeline

use std::fmt;
use std::sync::Arc;

use crate::blob::{Blob, BlobDescriptor};
use crate::cache::CachedLayer;
use crate::digest::Digest;
use crate::error::{BuildError, Result};

/// One image layer in one of four states of knowledge.
///
/// Every non-`Unwritten` layer has a compressed descriptor; every
/// non-`ReferenceNoDiffId` layer has a diff-id. Accessors return an error
/// for variant-absent fields instead of panicking.
#[derive(Clone)]
pub enum Layer {
    /// Freshly described content with no digests yet: the blob pair from
    /// the tar builder, compressed for storage and raw for the diff-id.
    Unwritten {
        uncompressed: Arc<dyn Blob>,
        compressed: Arc<dyn Blob>,
    },
    /// Bytes present in the local cache with both digests known.
    Cached(CachedLayer),
    /// Base-image layer known by both digests, bytes possibly remote.
    Reference {
        diff_id: Digest,
        descriptor: BlobDescriptor,
    },
    /// Layer from a schema-1 manifest: only the compressed descriptor is
    /// known until the bytes are pulled.
    ReferenceNoDiffId { descriptor: BlobDescriptor },
}

impl Layer {
    /// Compressed-side descriptor; absent only for unwritten layers.
    pub fn descriptor(&self) -> Result<BlobDescriptor> {
        match self {
            Layer::Unwritten { .. } => Err(BuildError::InvalidConfiguration(
                "layer has not been written yet, no descriptor available".to_string(),
            )),
            Layer::Cached(cached) => Ok(BlobDescriptor::new(
                cached.size,
                cached.layer_digest.clone(),
            )),
            Layer::Reference { descriptor, .. } | Layer::ReferenceNoDiffId { descriptor } => {
                Ok(descriptor.clone())
            }
        }
    }

    /// SHA-256 of the uncompressed tar; absent for unwritten and schema-1
    /// reference layers.
    pub fn diff_id(&self) -> Result<Digest> {
        match self {
            Layer::Unwritten { .. } => Err(BuildError::InvalidConfiguration(
                "layer has not been written yet, no diff-id available".to_string(),
            )),
            Layer::Cached(cached) => Ok(cached.diff_id.clone()),
            Layer::Reference { diff_id, .. } => Ok(diff_id.clone()),
            Layer::ReferenceNoDiffId { .. } => Err(BuildError::InvalidConfiguration(
                "schema-1 reference layer has no diff-id".to_string(),
            )),
        }
    }

    /// Local file with the compressed bytes, when present.
    pub fn cached_path(&self) -> Option<&std::path::Path> {
        match self {
            Layer::Cached(cached) => Some(&cached.path),
            _ => None,
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Unwritten { .. } => f.write_str("Layer::Unwritten"),
            Layer::Cached(cached) => write!(f, "Layer::Cached({})", cached.layer_digest),
            Layer::Reference { descriptor, .. } => {
                write!(f, "Layer::Reference({})", descriptor.digest)
            }
            Layer::ReferenceNoDiffId { descriptor } => {
                write!(f, "Layer::ReferenceNoDiffId({})", descriptor.digest)
            }
        }
    }
}
