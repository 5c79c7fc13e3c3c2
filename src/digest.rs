//! SHA-256 digests as used in manifests, registry URLs, and the layer cache
//!
//! A [`Digest`] is the content address of a blob: the lowercase hex SHA-256
//! of its bytes, formatted `sha256:<hex>` on the wire. Layer digests address
//! compressed bytes; diff-ids address the uncompressed tar.

use std::fmt;
use std::io::{self, Write};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{BuildError, Result};

/// Hex SHA-256 of zero bytes, the digest of an empty blob.
pub const EMPTY_DIGEST_HEX: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const ALGORITHM: &str = "sha256";
const HEX_LEN: usize = 64;

/// A parsed, validated `sha256:<64 lowercase hex>` content digest.
///
/// Equality and ordering are byte-wise over the hex form; the type is used
/// as a map key throughout the cache and the build pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse from either `sha256:<hex>` or a bare `<hex>` string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = match s.split_once(':') {
            Some((algorithm, rest)) => {
                if algorithm != ALGORITHM {
                    return Err(BuildError::InvalidDigestFormat(format!(
                        "unsupported algorithm '{}' in digest '{}'",
                        algorithm, s
                    )));
                }
                rest
            }
            None => s,
        };

        if hex.len() != HEX_LEN {
            return Err(BuildError::InvalidDigestFormat(format!(
                "expected {} hex characters, got {} in '{}'",
                HEX_LEN,
                hex.len(),
                s
            )));
        }
        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(BuildError::InvalidDigestFormat(format!(
                "digest '{}' contains non-lowercase-hex characters",
                s
            )));
        }

        Ok(Digest {
            hex: hex.to_string(),
        })
    }

    /// Digest of a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Digest of the canonical JSON encoding of a serialisable value.
    ///
    /// Used for selectors: same inputs, same digest.
    pub fn of_json<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::of_bytes(&bytes))
    }

    /// The digest of zero bytes.
    pub fn empty() -> Self {
        Digest {
            hex: EMPTY_DIGEST_HEX.to_string(),
        }
    }

    /// The 64-character hex portion, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.hex)
    }
}

impl std::str::FromStr for Digest {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A writer tee that hashes and counts everything passing through it.
///
/// Wrap any sink to recover the size and digest of the bytes written, e.g.
/// to observe a compressing blob's uncompressed input.
pub struct CountingDigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> CountingDigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Consume the tee, returning `(inner, digest, size)`.
    pub fn finish(self) -> (W, Digest, u64) {
        let digest = Digest {
            hex: hex::encode(self.hasher.finalize()),
        };
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for CountingDigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Incremental hasher for streamed downloads and uploads.
#[derive(Default)]
pub struct DigestBuilder {
    hasher: Sha256,
    seen: u64,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    pub fn finish(self) -> Digest {
        Digest {
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let prefixed = Digest::parse(&format!("sha256:{}", HELLO_HEX)).unwrap();
        let bare = Digest::parse(HELLO_HEX).unwrap();
        assert_eq!(prefixed, bare);
        assert_eq!(prefixed.hex(), HELLO_HEX);
        assert_eq!(prefixed.to_string(), format!("sha256:{}", HELLO_HEX));
    }

    #[test]
    fn rejects_foreign_algorithms() {
        let err = Digest::parse(&format!("sha512:{}", HELLO_HEX)).unwrap_err();
        assert!(matches!(err, BuildError::InvalidDigestFormat(_)));
    }

    #[test]
    fn rejects_wrong_length_and_uppercase() {
        assert!(Digest::parse("sha256:abcd").is_err());
        assert!(Digest::parse(&HELLO_HEX.to_uppercase()).is_err());
        assert!(Digest::parse(&format!("sha256:{}zz", &HELLO_HEX[..62])).is_err());
    }

    #[test]
    fn of_bytes_matches_known_value() {
        assert_eq!(Digest::of_bytes(b"hello world").hex(), HELLO_HEX);
        assert_eq!(Digest::of_bytes(b"").hex(), EMPTY_DIGEST_HEX);
    }

    #[test]
    fn counting_writer_reports_size_and_digest() {
        let mut tee = CountingDigestWriter::new(Vec::new());
        tee.write_all(b"hello ").unwrap();
        tee.write_all(b"world").unwrap();
        let (inner, digest, size) = tee.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(size, 11);
        assert_eq!(digest.hex(), HELLO_HEX);
    }

    #[test]
    fn builder_matches_one_shot_hash() {
        let mut builder = DigestBuilder::new();
        builder.update(b"hello ");
        builder.update(b"world");
        assert_eq!(builder.bytes_seen(), 11);
        assert_eq!(builder.finish().hex(), HELLO_HEX);
    }

    #[test]
    fn json_digest_is_stable_for_equal_values() {
        #[derive(Serialize)]
        struct Probe {
            path: &'static str,
            mode: u32,
        }
        let a = Digest::of_json(&Probe {
            path: "/app/Main.class",
            mode: 0o644,
        })
        .unwrap();
        let b = Digest::of_json(&Probe {
            path: "/app/Main.class",
            mode: 0o644,
        })
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn serde_round_trip() {
        let digest = Digest::of_bytes(b"hello world");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", HELLO_HEX));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
