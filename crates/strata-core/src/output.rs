//! # Output Integrity
//!
//! BLAKE3 digests of merged responses, so two runs over the same streams
//! can be compared without storing either output.
//!
//! # Requires
//!
//! This module is only available with the `crypto-hash` feature enabled.

use std::io::{self, Write};

/// Writer adapter hashing every byte it forwards.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    bytes: u64,
}

impl<W: Write> ChecksumWriter<W> {
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    /// Bytes forwarded so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Hex digest of everything written, plus the inner writer.
    #[must_use]
    pub fn finish(self) -> (String, W) {
        (self.hasher.finalize().to_hex().to_string(), self.inner)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hex BLAKE3 digest of raw bytes.
#[must_use]
pub fn compute_blake3_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
