//! CRC32 checksums, used to detect torn and corrupt writes in the snapshot and
//! metadata files. Log segments maintain their own running checksum, see
//! `raft::log::Segment`.

use std::io::{Read, Write};

/// A writer that computes a running CRC32 over all bytes written through it.
pub struct HashWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> HashWriter<W> {
    /// Wraps the given writer.
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: crc32fast::Hasher::new() }
    }

    /// Returns the checksum of the bytes written so far, and the inner writer.
    pub fn finish(self) -> (u32, W) {
        (self.hasher.finalize(), self.inner)
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that computes a running CRC32 over all bytes read through it.
pub struct HashReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> HashReader<R> {
    /// Wraps the given reader.
    pub fn new(inner: R) -> Self {
        Self { inner, hasher: crc32fast::Hasher::new() }
    }

    /// Returns the checksum of the bytes read so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Appends a trailing little-endian CRC32 of the given bytes.
pub fn append(mut bytes: Vec<u8>) -> Vec<u8> {
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}

/// Verifies and strips a trailing CRC32 appended by append(). Returns None if
/// the data is truncated or the checksum doesn't match.
pub fn verify(bytes: &[u8]) -> Option<&[u8]> {
    let split = bytes.len().checked_sub(4)?;
    let (data, crc) = bytes.split_at(split);
    let crc = u32::from_le_bytes(crc.try_into().ok()?);
    (crc32fast::hash(data) == crc).then_some(data)
}
