//! Byte-stable gzip encoding for layer archives
//!
//! The standard gzip header embeds a modification time and an operating
//! system identifier, both of which vary between runs and hosts. Layers must
//! hash identically wherever they are built, so the header is written by hand
//! with those fields zeroed and the compressed stream framed explicitly.

use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

// ID1 ID2 CM=deflate FLG=0 MTIME=0 XFL=0 OS=0
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Gzip encoder producing identical bytes for identical input, regardless of
/// wall clock or platform. Compression level is the flate2 default.
pub struct DeterministicGzEncoder<W: Write> {
    deflate: DeflateEncoder<W>,
    crc: Crc,
}

impl<W: Write> DeterministicGzEncoder<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&GZIP_HEADER)?;
        Ok(Self {
            deflate: DeflateEncoder::new(out, Compression::default()),
            crc: Crc::new(),
        })
    }

    /// Flush the deflate stream and append the CRC-32 / length trailer.
    pub fn finish(self) -> io::Result<W> {
        let mut out = self.deflate.finish()?;
        out.write_all(&self.crc.sum().to_le_bytes())?;
        out.write_all(&self.crc.amount().to_le_bytes())?;
        Ok(out)
    }
}

impl<W: Write> Write for DeterministicGzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.deflate.write(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.deflate.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeterministicGzEncoder::new(Vec::new()).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn output_is_valid_gzip() {
        let compressed = gzip(b"layer bytes for the decoder to chew on");
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"layer bytes for the decoder to chew on");
    }

    #[test]
    fn header_has_zeroed_mtime_and_os() {
        let compressed = gzip(b"anything");
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        // MTIME bytes 4..8, OS byte 9
        assert_eq!(&compressed[4..8], &[0, 0, 0, 0]);
        assert_eq!(compressed[9], 0);
    }

    #[test]
    fn identical_input_gives_identical_bytes() {
        let a = gzip(b"reproducible");
        let b = gzip(b"reproducible");
        assert_eq!(a, b);
    }
}
