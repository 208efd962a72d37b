//! XEP-0138 stream compression seam and the zlib default engine.
//!
//! XMPP compresses the whole stream, not individual stanzas, so both
//! directions are single long-lived zlib streams flushed at stanza
//! granularity (`Z_SYNC_FLUSH`) to keep the peer's inflater fed.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::warn;

use crate::error::ConnectionError;

const CHUNK: usize = 8192;

/// The compression stage of the transform chain.
pub trait Compressor: Send {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, ConnectionError>;
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, ConnectionError>;

    /// Reset both directions for a fresh stream.
    fn cleanup(&mut self);
}

/// Default zlib engine.
pub struct ZlibCompressor {
    deflate: Compress,
    inflate: Decompress,
}

impl ZlibCompressor {
    pub fn new() -> ZlibCompressor {
        ZlibCompressor {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        ZlibCompressor::new()
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut pos = 0usize;
        loop {
            let before = self.deflate.total_in() as usize;
            let status = self
                .deflate
                .compress_vec(&data[pos..], &mut out, FlushCompress::Sync)
                .map_err(|e| {
                    warn!(error = %e, "deflate failed");
                    ConnectionError::CompressionFailed
                })?;
            pos += self.deflate.total_in() as usize - before;
            match status {
                Status::Ok | Status::BufError => {
                    if pos >= data.len() && out.len() < out.capacity() {
                        break;
                    }
                    out.reserve(CHUNK);
                }
                Status::StreamEnd => break,
            }
        }
        Ok(out)
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let mut out = Vec::with_capacity(data.len() * 4 + 64);
        let mut pos = 0usize;
        loop {
            let before = self.inflate.total_in() as usize;
            let status = self
                .inflate
                .decompress_vec(&data[pos..], &mut out, FlushDecompress::Sync)
                .map_err(|e| {
                    warn!(error = %e, "inflate failed");
                    ConnectionError::CompressionFailed
                })?;
            pos += self.inflate.total_in() as usize - before;
            match status {
                Status::Ok | Status::BufError => {
                    if pos >= data.len() && out.len() < out.capacity() {
                        break;
                    }
                    out.reserve(CHUNK);
                }
                Status::StreamEnd => break,
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {
        self.deflate = Compress::new(Compression::default(), true);
        self.inflate = Decompress::new(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_stanza_boundaries() {
        let mut a = ZlibCompressor::new();
        let mut b = ZlibCompressor::new();

        let first = a.compress(b"<presence/>").unwrap();
        let second = a.compress(b"<message to='x@y'><body>hello hello hello</body></message>").unwrap();

        // Each sync-flushed chunk inflates independently of later ones.
        assert_eq!(b.decompress(&first).unwrap(), b"<presence/>");
        assert_eq!(
            b.decompress(&second).unwrap(),
            b"<message to='x@y'><body>hello hello hello</body></message>".to_vec()
        );
    }

    #[test]
    fn test_split_compressed_input() {
        let mut a = ZlibCompressor::new();
        let mut b = ZlibCompressor::new();

        let wire = a.compress(b"<iq type='get' id='1'/>").unwrap();
        let (head, tail) = wire.split_at(wire.len() / 2);

        let mut plain = b.decompress(head).unwrap();
        plain.extend(b.decompress(tail).unwrap());
        assert_eq!(plain, b"<iq type='get' id='1'/>");
    }

    #[test]
    fn test_cleanup_starts_fresh_streams() {
        let mut a = ZlibCompressor::new();
        let mut b = ZlibCompressor::new();
        let _ = a.compress(b"<presence/>").unwrap();
        a.cleanup();
        b.cleanup();
        let wire = a.compress(b"<presence/>").unwrap();
        assert_eq!(b.decompress(&wire).unwrap(), b"<presence/>");
    }

    #[test]
    fn test_garbage_input_fails() {
        let mut b = ZlibCompressor::new();
        assert!(b.decompress(b"definitely not zlib data").is_err());
    }
}
