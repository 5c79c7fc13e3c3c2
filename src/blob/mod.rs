//! Lazy blobs with a write-once descriptor contract
//!
//! A [`Blob`] produces its bytes into a sink exactly once and reports the
//! true size and SHA-256 of what it wrote as a [`BlobDescriptor`]. Sources
//! include in-memory bytes, files, closures, and gzip wrappers; the tar
//! layer builder contributes its own implementation.

pub mod gzip;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::digest::{CountingDigestWriter, Digest};
use crate::error::Result;

use gzip::DeterministicGzEncoder;

/// Size, digest, and optional media type of a written blob.
///
/// Invariant: `size` is exactly the number of bytes whose SHA-256 is `digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub size: u64,
    pub digest: Digest,
    pub media_type: Option<String>,
}

impl BlobDescriptor {
    pub fn new(size: u64, digest: Digest) -> Self {
        Self {
            size,
            digest,
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// A value that can stream its bytes into a sink once.
///
/// Implementations backed by stable storage (bytes, files) are restartable;
/// closure-backed blobs are not required to be.
pub trait Blob: Send + Sync {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor>;
}

/// Drain a blob into memory, keeping its descriptor.
pub fn blob_to_bytes(blob: &dyn Blob) -> Result<(Vec<u8>, BlobDescriptor)> {
    let mut buf = Vec::new();
    let descriptor = blob.write_to(&mut buf)?;
    Ok((buf, descriptor))
}

struct BytesBlob {
    data: Vec<u8>,
}

impl Blob for BytesBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut tee = CountingDigestWriter::new(out);
        tee.write_all(&self.data)?;
        let (_, digest, size) = tee.finish();
        Ok(BlobDescriptor::new(size, digest))
    }
}

struct FileBlob {
    path: PathBuf,
}

impl Blob for FileBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut file = File::open(&self.path)?;
        let mut tee = CountingDigestWriter::new(out);
        io::copy(&mut file, &mut tee)?;
        let (_, digest, size) = tee.finish();
        Ok(BlobDescriptor::new(size, digest))
    }
}

struct WriterBlob<F> {
    writer: F,
}

impl<F> Blob for WriterBlob<F>
where
    F: Fn(&mut dyn Write) -> Result<()> + Send + Sync,
{
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut tee = CountingDigestWriter::new(out);
        (self.writer)(&mut tee)?;
        let (_, digest, size) = tee.finish();
        Ok(BlobDescriptor::new(size, digest))
    }
}

/// Gzip-compresses an inner blob; the descriptor reports the compressed
/// output. The inner blob's own descriptor (the uncompressed side) is
/// discarded here and recoverable by teeing the sink.
struct GzipCompressBlob {
    inner: Arc<dyn Blob>,
}

impl Blob for GzipCompressBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let tee = CountingDigestWriter::new(out);
        let mut encoder = DeterministicGzEncoder::new(tee)?;
        self.inner.write_to(&mut encoder)?;
        let tee = encoder.finish()?;
        let (_, digest, size) = tee.finish();
        Ok(BlobDescriptor::new(size, digest))
    }
}

/// Gunzips an inner blob; the descriptor reports the decompressed output.
struct GzipDecompressBlob {
    inner: Arc<dyn Blob>,
}

impl Blob for GzipDecompressBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let tee = CountingDigestWriter::new(out);
        let mut decoder = flate2::write::GzDecoder::new(tee);
        self.inner.write_to(&mut decoder)?;
        let tee = decoder.finish()?;
        let (_, digest, size) = tee.finish();
        Ok(BlobDescriptor::new(size, digest))
    }
}

/// Blob from in-memory bytes.
pub fn from_bytes(data: Vec<u8>) -> Arc<dyn Blob> {
    Arc::new(BytesBlob { data })
}

/// Blob from a file on disk. The file must outlive every write.
pub fn from_file(path: impl Into<PathBuf>) -> Arc<dyn Blob> {
    Arc::new(FileBlob { path: path.into() })
}

/// Blob from a lazy writer closure.
pub fn from_writer<F>(writer: F) -> Arc<dyn Blob>
where
    F: Fn(&mut dyn Write) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(WriterBlob { writer })
}

/// Wrap a blob so its bytes are gzip-compressed on the way out.
pub fn compress(inner: Arc<dyn Blob>) -> Arc<dyn Blob> {
    Arc::new(GzipCompressBlob { inner })
}

/// Wrap a gzip-compressed blob so its bytes are decompressed on the way out.
pub fn decompress(inner: Arc<dyn Blob>) -> Arc<dyn Blob> {
    Arc::new(GzipDecompressBlob { inner })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_blob_reports_true_size_and_digest() {
        let blob = from_bytes(b"hello world".to_vec());
        let (written, descriptor) = blob_to_bytes(blob.as_ref()).unwrap();
        assert_eq!(written, b"hello world");
        assert_eq!(descriptor.size, 11);
        assert_eq!(descriptor.digest, Digest::of_bytes(b"hello world"));
    }

    #[test]
    fn file_blob_streams_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"file-backed blob").unwrap();

        let blob = from_file(&path);
        let (written, descriptor) = blob_to_bytes(blob.as_ref()).unwrap();
        assert_eq!(written, b"file-backed blob");
        assert_eq!(descriptor.digest, Digest::of_bytes(b"file-backed blob"));
    }

    #[test]
    fn writer_blob_runs_closure_once_per_write() {
        let blob = from_writer(|out| {
            out.write_all(b"lazy ")?;
            out.write_all(b"bytes")?;
            Ok(())
        });
        let (written, descriptor) = blob_to_bytes(blob.as_ref()).unwrap();
        assert_eq!(written, b"lazy bytes");
        assert_eq!(descriptor.size, 10);
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let original = b"some layer content, long enough to compress".to_vec();
        let compressed = compress(from_bytes(original.clone()));
        let (compressed_bytes, compressed_desc) = blob_to_bytes(compressed.as_ref()).unwrap();
        assert_eq!(
            compressed_desc.digest,
            Digest::of_bytes(&compressed_bytes),
            "wrapper must report the digest of its output bytes"
        );

        let restored = decompress(from_bytes(compressed_bytes));
        let (restored_bytes, restored_desc) = blob_to_bytes(restored.as_ref()).unwrap();
        assert_eq!(restored_bytes, original);
        assert_eq!(restored_desc.digest, Digest::of_bytes(&original));
    }

    #[test]
    fn compression_is_reproducible() {
        let make = || {
            let blob = compress(from_bytes(b"same input".to_vec()));
            blob_to_bytes(blob.as_ref()).unwrap().1
        };
        assert_eq!(make().digest, make().digest);
    }

    #[test]
    fn empty_blob_descriptor() {
        let (bytes, descriptor) = blob_to_bytes(from_bytes(Vec::new()).as_ref()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(descriptor.size, 0);
        assert_eq!(descriptor.digest, Digest::empty());
    }
}
