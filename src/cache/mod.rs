//! Content-addressed on-disk cache for layers and image metadata
//!
//! Layout, rooted at a configurable directory:
//!
//! ```text
//! layers/<layer-digest-hex>/<diff-id-hex>   -- compressed layer bytes
//! layers/<layer-digest-hex>/metadata        -- small JSON sidecar
//! selectors/<selector-hex>                  -- contents: "<layer-digest-hex>"
//! images/<registry>/<repo>/<tag-or-digest>/ -- cached manifest and config
//! tmp/                                      -- staging for atomic writes
//! ```
//!
//! A layer directory appears at its final path only after both the bytes and
//! the metadata are fully written: everything is staged under `tmp/` and
//! published with a single `rename`. Readers therefore never observe a torn
//! entry, and concurrent writers race harmlessly; the loser discards its
//! staging directory. Selector files are written only after the layer they
//! name exists.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::Blob;
use crate::digest::{CountingDigestWriter, Digest};
use crate::error::{BuildError, Result};
use crate::image::reference::ImageReference;

const LAYERS_DIR: &str = "layers";
const SELECTORS_DIR: &str = "selectors";
const IMAGES_DIR: &str = "images";
const TMP_DIR: &str = "tmp";
const METADATA_FILE: &str = "metadata";

/// A fully cached layer: compressed bytes on disk plus both digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    pub layer_digest: Digest,
    pub diff_id: Digest,
    pub size: u64,
    pub path: PathBuf,
}

/// Sidecar JSON stored next to the layer bytes.
#[derive(Debug, Serialize, Deserialize)]
struct LayerMetadata {
    size: u64,
    diff_id: String,
}

/// Cached base-image manifest and container configuration.
#[derive(Debug, Clone)]
pub struct CachedImageMetadata {
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
}

/// Content-addressed layer store, safe for concurrent use by multiple
/// processes through the atomic-rename publication protocol.
pub struct Cache {
    root: PathBuf,
    strict: bool,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [LAYERS_DIR, SELECTORS_DIR, IMAGES_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Cache {
            root,
            strict: false,
        })
    }

    /// In strict mode a digest mismatch on read surfaces as
    /// [`BuildError::CacheCorrupted`] instead of being deleted and treated
    /// as a miss.
    pub fn with_strict_verification(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join(LAYERS_DIR).join(digest.hex())
    }

    fn selector_path(&self, selector: &Digest) -> PathBuf {
        self.root.join(SELECTORS_DIR).join(selector.hex())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Stream a compressed layer blob into the cache, returning the complete
    /// entry. The blob is drained exactly once; its digest names the entry
    /// and a decompressing tee computes the diff-id in the same pass. If an
    /// entry with the same digest already exists the staged copy is
    /// discarded and the existing entry returned.
    pub fn put(&self, selector: Option<&Digest>, compressed: &dyn Blob) -> Result<CachedLayer> {
        let staging = self.tmp_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;

        let result = self.stage_layer(&staging, compressed);
        let (descriptor_digest, size, diff_id) = match result {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        let published = self.publish(&staging, &descriptor_digest)?;
        let cached = match published {
            Some(existing) => existing,
            None => CachedLayer {
                layer_digest: descriptor_digest.clone(),
                diff_id: diff_id.clone(),
                size,
                path: self.layer_dir(&descriptor_digest).join(diff_id.hex()),
            },
        };

        if let Some(selector) = selector {
            self.write_selector(selector, &cached.layer_digest)?;
        }
        Ok(cached)
    }

    /// Write blob bytes and metadata into the staging directory.
    fn stage_layer(&self, staging: &Path, compressed: &dyn Blob) -> Result<(Digest, u64, Digest)> {
        let blob_tmp = staging.join("layer.partial");
        let file = File::create(&blob_tmp)?;

        // Tee: compressed bytes go to disk while a write-side gunzip feeds a
        // hasher computing the diff-id.
        let disk = CountingDigestWriter::new(BufWriter::new(file));
        let diff_id_hasher = CountingDigestWriter::new(io::sink());
        let decoder = flate2::write::GzDecoder::new(diff_id_hasher);
        let mut tee = TeeWriter {
            first: disk,
            second: decoder,
        };

        let descriptor = compressed.write_to(&mut tee)?;
        let TeeWriter {
            first: disk,
            second: decoder,
        } = tee;

        let (buf_writer, disk_digest, disk_size) = disk.finish();
        let mut file = buf_writer
            .into_inner()
            .map_err(|e| BuildError::Io(e.into_error()))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let diff_id_hasher = decoder
            .finish()
            .map_err(|e| BuildError::Io(io::Error::other(format!("gunzip for diff-id: {}", e))))?;
        let (_, diff_id, _) = diff_id_hasher.finish();

        if disk_digest != descriptor.digest || disk_size != descriptor.size {
            return Err(BuildError::CacheCorrupted {
                path: blob_tmp,
                message: format!(
                    "blob reported {} ({} bytes) but wrote {} ({} bytes)",
                    descriptor.digest, descriptor.size, disk_digest, disk_size
                ),
            });
        }

        fs::rename(&blob_tmp, staging.join(diff_id.hex()))?;

        let metadata = LayerMetadata {
            size: disk_size,
            diff_id: diff_id.to_string(),
        };
        let mut metadata_file = File::create(staging.join(METADATA_FILE))?;
        metadata_file.write_all(&serde_json::to_vec(&metadata)?)?;
        metadata_file.sync_all()?;

        Ok((disk_digest, disk_size, diff_id))
    }

    /// Atomically move the staged directory to its final path. Returns
    /// `Some(existing)` when another writer won the race.
    fn publish(&self, staging: &Path, digest: &Digest) -> Result<Option<CachedLayer>> {
        let final_dir = self.layer_dir(digest);
        if final_dir.exists() {
            fs::remove_dir_all(staging)?;
            return Ok(Some(self.load_entry(digest)?));
        }
        match fs::rename(staging, &final_dir) {
            Ok(()) => Ok(None),
            Err(_) if final_dir.exists() => {
                // Lost the publication race; the surviving entry wins.
                fs::remove_dir_all(staging)?;
                Ok(Some(self.load_entry(digest)?))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(staging);
                Err(e.into())
            }
        }
    }

    fn write_selector(&self, selector: &Digest, layer_digest: &Digest) -> Result<()> {
        let tmp = self.tmp_dir().join(Uuid::new_v4().to_string());
        fs::write(&tmp, layer_digest.hex())?;
        fs::rename(&tmp, self.selector_path(selector))?;
        Ok(())
    }

    /// Constant-time lookup by layer digest.
    pub fn get_by_digest(&self, digest: &Digest) -> Result<Option<CachedLayer>> {
        if !self.layer_dir(digest).is_dir() {
            return Ok(None);
        }
        match self.load_entry(digest) {
            Ok(entry) => {
                if self.strict {
                    self.verify_entry(&entry)?;
                }
                Ok(Some(entry))
            }
            Err(e @ BuildError::CacheCorrupted { .. }) => {
                if self.strict {
                    Err(e)
                } else {
                    // Recover by dropping the offending entry.
                    let _ = fs::remove_dir_all(self.layer_dir(digest));
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Constant-time lookup by selector: read the selector file, then load
    /// the layer it names.
    pub fn get_by_selector(&self, selector: &Digest) -> Result<Option<CachedLayer>> {
        let path = self.selector_path(selector);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let layer_digest = Digest::parse(contents.trim()).map_err(|_| {
            BuildError::CacheCorrupted {
                path: path.clone(),
                message: format!("selector names an invalid digest: '{}'", contents.trim()),
            }
        })?;
        self.get_by_digest(&layer_digest)
    }

    fn load_entry(&self, digest: &Digest) -> Result<CachedLayer> {
        let dir = self.layer_dir(digest);
        let mut diff_id_file: Option<(Digest, u64)> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METADATA_FILE {
                continue;
            }
            let Ok(diff_id) = Digest::parse(&name) else {
                return Err(BuildError::CacheCorrupted {
                    path: entry.path(),
                    message: "unexpected file in layer directory".to_string(),
                });
            };
            let size = entry.metadata()?.len();
            if let Some((existing, _)) = &diff_id_file {
                return Err(BuildError::LayerConflict(format!(
                    "layer {} has two content files: {} and {}",
                    digest, existing, diff_id
                )));
            }
            diff_id_file = Some((diff_id, size));
        }
        let (diff_id, size) = diff_id_file.ok_or_else(|| BuildError::CacheCorrupted {
            path: dir.clone(),
            message: "layer directory has no content file".to_string(),
        })?;

        // The metadata sidecar is optional but must agree when present.
        let metadata_path = dir.join(METADATA_FILE);
        if let Ok(bytes) = fs::read(&metadata_path) {
            let metadata: LayerMetadata =
                serde_json::from_slice(&bytes).map_err(|e| BuildError::CacheCorrupted {
                    path: metadata_path.clone(),
                    message: format!("unreadable metadata: {}", e),
                })?;
            if metadata.size != size || metadata.diff_id != diff_id.to_string() {
                return Err(BuildError::CacheCorrupted {
                    path: metadata_path,
                    message: "metadata disagrees with content file".to_string(),
                });
            }
        }

        Ok(CachedLayer {
            layer_digest: digest.clone(),
            diff_id: diff_id.clone(),
            size,
            path: dir.join(diff_id.hex()),
        })
    }

    /// Full re-hash of the stored bytes against the entry's digest.
    fn verify_entry(&self, entry: &CachedLayer) -> Result<()> {
        let mut file = File::open(&entry.path)?;
        let mut tee = CountingDigestWriter::new(io::sink());
        io::copy(&mut file, &mut tee)?;
        let (_, digest, size) = tee.finish();
        if digest != entry.layer_digest || size != entry.size {
            return Err(BuildError::CacheCorrupted {
                path: entry.path.clone(),
                message: format!(
                    "stored bytes hash to {} ({} bytes), expected {} ({} bytes)",
                    digest, size, entry.layer_digest, entry.size
                ),
            });
        }
        Ok(())
    }

    fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.root
            .join(IMAGES_DIR)
            .join(reference.registry())
            .join(reference.repository())
            .join(reference.reference())
    }

    /// Cache a base image's manifest and container configuration, atomically.
    pub fn write_image_metadata(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        config: &[u8],
    ) -> Result<()> {
        let staging = self.tmp_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;
        fs::write(staging.join("manifest.json"), manifest)?;
        fs::write(staging.join("config.json"), config)?;

        let final_dir = self.image_dir(reference);
        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        match fs::rename(&staging, &final_dir) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                if final_dir.exists() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    pub fn read_image_metadata(
        &self,
        reference: &ImageReference,
    ) -> Result<Option<CachedImageMetadata>> {
        let dir = self.image_dir(reference);
        let manifest = match fs::read(dir.join("manifest.json")) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = match fs::read(dir.join("config.json")) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CachedImageMetadata { manifest, config }))
    }

    /// Remove leftover staging entries. Called after a successful build;
    /// interrupted builds may leave partial files here, never in `layers/`.
    pub fn clean_tmp(&self) -> Result<()> {
        for entry in fs::read_dir(self.tmp_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Duplicates writes to two sinks; used to hash the decompressed stream
/// while the compressed bytes land on disk.
struct TeeWriter<A: Write, B: Write> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.first.write(buf)?;
        self.second.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob;
    use crate::tar_builder::{LayerEntry, TarLayerBuilder};

    fn compressed_fixture(content: &[u8]) -> (std::sync::Arc<dyn Blob>, Digest) {
        let compressed = blob::compress(blob::from_bytes(content.to_vec()));
        let diff_id = Digest::of_bytes(content);
        (compressed, diff_id)
    }

    #[test]
    fn put_then_get_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path()).unwrap();
        let (compressed, diff_id) = compressed_fixture(b"uncompressed tar bytes");

        let cached = cache.put(None, compressed.as_ref()).unwrap();
        assert_eq!(cached.diff_id, diff_id);
        assert!(cached.path.is_file());
        assert_eq!(
            cached.path.file_name().unwrap().to_string_lossy(),
            diff_id.hex()
        );

        let loaded = cache.get_by_digest(&cached.layer_digest).unwrap().unwrap();
        assert_eq!(loaded, cached);

        // Stored bytes hash to the layer digest.
        let stored = fs::read(&loaded.path).unwrap();
        assert_eq!(Digest::of_bytes(&stored), loaded.layer_digest);
    }

    #[test]
    fn selector_maps_to_existing_layer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path()).unwrap();
        let (compressed, _) = compressed_fixture(b"selector target");
        let selector = Digest::of_bytes(b"the inputs that produced this layer");

        let cached = cache.put(Some(&selector), compressed.as_ref()).unwrap();
        let by_selector = cache.get_by_selector(&selector).unwrap().unwrap();
        assert_eq!(by_selector.layer_digest, cached.layer_digest);

        let missing = Digest::of_bytes(b"unknown selector");
        assert!(cache.get_by_selector(&missing).unwrap().is_none());
    }

    #[test]
    fn duplicate_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path()).unwrap();
        let (compressed, _) = compressed_fixture(b"same content twice");

        let first = cache.put(None, compressed.as_ref()).unwrap();
        let second = cache.put(None, compressed.as_ref()).unwrap();
        assert_eq!(first, second);

        let layers: Vec<_> = fs::read_dir(dir.path().join(LAYERS_DIR))
            .unwrap()
            .collect();
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn partial_staging_is_invisible_to_readers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path()).unwrap();

        // Simulate a crash: bytes landed in tmp/ but were never published.
        let staging = dir.path().join(TMP_DIR).join("interrupted");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("layer.partial"), b"torn write").unwrap();

        let digest = Digest::of_bytes(b"torn write");
        assert!(cache.get_by_digest(&digest).unwrap().is_none());

        cache.clean_tmp().unwrap();
        assert_eq!(fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn corrupted_entry_is_dropped_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let (compressed, _) = compressed_fixture(b"will be corrupted");

        let cache = Cache::new(dir.path()).unwrap();
        let cached = cache.put(None, compressed.as_ref()).unwrap();
        fs::write(&cached.path, b"scribbled over").unwrap();

        // Metadata still agrees with nothing; size changed, so the lenient
        // path treats the entry as a miss and removes it.
        let lenient = Cache::new(dir.path()).unwrap();
        assert!(lenient.get_by_digest(&cached.layer_digest).unwrap().is_none());

        // Re-populate and corrupt contents without changing the size.
        let cache = Cache::new(dir.path()).unwrap();
        let cached = cache.put(None, compressed.as_ref()).unwrap();
        let stored = fs::read(&cached.path).unwrap();
        let mut flipped = stored.clone();
        flipped[0] ^= 0xff;
        fs::write(&cached.path, &flipped).unwrap();

        let strict = Cache::new(dir.path()).unwrap().with_strict_verification(true);
        let err = strict.get_by_digest(&cached.layer_digest).unwrap_err();
        assert!(matches!(err, BuildError::CacheCorrupted { .. }));
    }

    #[test]
    fn tar_layer_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("Main.class");
        fs::write(&src, b"\xca\xfe\xba\xbe").unwrap();

        let mut builder = TarLayerBuilder::new();
        builder.add_entry(LayerEntry::new(&src, "/app/classes/Main.class"));
        let selector = builder.selector().unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(cache_dir.path()).unwrap();
        let cached = cache
            .put(Some(&selector), builder.to_compressed_blob().as_ref())
            .unwrap();

        // Diff-id equals the digest of the uncompressed tar.
        let (raw_tar, raw_desc) = crate::blob::blob_to_bytes(builder.to_blob().as_ref()).unwrap();
        assert_eq!(cached.diff_id, raw_desc.digest);
        assert_eq!(cached.diff_id, Digest::of_bytes(&raw_tar));

        // Rebuilding the same entries hits the selector, no work needed.
        let hit = cache.get_by_selector(&selector).unwrap().unwrap();
        assert_eq!(hit, cached);
    }

    #[test]
    fn image_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path()).unwrap();
        let reference = ImageReference::parse("gcr.io/distroless/java:11").unwrap();

        assert!(cache.read_image_metadata(&reference).unwrap().is_none());
        cache
            .write_image_metadata(&reference, b"{\"schemaVersion\":2}", b"{\"os\":\"linux\"}")
            .unwrap();
        let metadata = cache.read_image_metadata(&reference).unwrap().unwrap();
        assert_eq!(metadata.manifest, b"{\"schemaVersion\":2}");
        assert_eq!(metadata.config, b"{\"os\":\"linux\"}");
    }
}
