//! Payload compression for journal entries.
//!
//! The journal compresses keys, records, and changeset pages independently
//! and keeps a compressed region only when it is strictly smaller than the
//! raw bytes. The on-disk format does not identify the algorithm; the
//! environment configuration selects it when the journal is opened, so an
//! environment must be reopened with the same selector it was written with.

use crate::error::{CoreError, CoreResult};
use lz4_flex::block;

/// Compression algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    /// No compression.
    #[default]
    None,
    /// LZ4 block compression.
    Lz4,
}

/// A compressor with an internal scratch arena.
///
/// The arena is reused across calls, so compressing or decompressing
/// invalidates the result of the previous call. The journal is
/// single-writer, which makes the sharing safe without synchronization.
#[derive(Debug)]
pub struct Compressor {
    arena: Vec<u8>,
}

impl Compressor {
    /// Creates a compressor for the given algorithm, or `None` when
    /// compression is disabled.
    #[must_use]
    pub fn create(algorithm: CompressionAlgorithm) -> Option<Self> {
        match algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Lz4 => Some(Self { arena: Vec::new() }),
        }
    }

    /// Compresses `src` into the internal arena and returns the compressed
    /// length.
    ///
    /// The caller decides whether to use the compressed form (typically
    /// only when the returned length is strictly smaller than `src.len()`).
    ///
    /// # Errors
    ///
    /// Returns an error if the compressor fails internally.
    pub fn compress(&mut self, src: &[u8]) -> CoreResult<usize> {
        self.arena.resize(block::get_maximum_output_size(src.len()), 0);
        let len = block::compress_into(src, &mut self.arena)
            .map_err(|e| CoreError::compression(e.to_string()))?;
        Ok(len)
    }

    /// Returns the arena contents produced by the last `compress` or
    /// `decompress` call.
    #[must_use]
    pub fn arena(&self) -> &[u8] {
        &self.arena
    }

    /// Decompresses `src` into the internal arena.
    ///
    /// `uncompressed_len` must be the original length recorded next to the
    /// compressed bytes. Returns the decompressed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid compressed data or does
    /// not expand to `uncompressed_len` bytes.
    pub fn decompress(&mut self, src: &[u8], uncompressed_len: usize) -> CoreResult<&[u8]> {
        self.arena.resize(uncompressed_len, 0);
        let len = block::decompress_into(src, &mut self.arena)
            .map_err(|e| CoreError::compression(e.to_string()))?;
        if len != uncompressed_len {
            return Err(CoreError::compression(format!(
                "decompressed {len} bytes, expected {uncompressed_len}"
            )));
        }
        Ok(&self.arena[..len])
    }

    /// Decompresses `src` into a caller-provided arena.
    ///
    /// Used by changeset redo, which decompresses page images into a
    /// page-sized buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is invalid or does not fill `out`
    /// exactly.
    pub fn decompress_into(&self, src: &[u8], out: &mut [u8]) -> CoreResult<()> {
        let len = block::decompress_into(src, out)
            .map_err(|e| CoreError::compression(e.to_string()))?;
        if len != out.len() {
            return Err(CoreError::compression(format!(
                "decompressed {len} bytes, expected {}",
                out.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_algorithm_creates_no_compressor() {
        assert!(Compressor::create(CompressionAlgorithm::None).is_none());
        assert!(Compressor::create(CompressionAlgorithm::Lz4).is_some());
    }

    #[test]
    fn compress_roundtrip() {
        let mut c = Compressor::create(CompressionAlgorithm::Lz4).unwrap();
        let src = vec![0x42u8; 4096];

        let clen = c.compress(&src).unwrap();
        assert!(clen < src.len());

        let compressed = c.arena()[..clen].to_vec();
        let out = c.decompress(&compressed, src.len()).unwrap();
        assert_eq!(out, &src[..]);
    }

    #[test]
    fn incompressible_input_grows() {
        let mut c = Compressor::create(CompressionAlgorithm::Lz4).unwrap();
        // Short high-entropy input; LZ4 cannot shrink it.
        let src: Vec<u8> = (0u8..=15).collect();

        let clen = c.compress(&src).unwrap();
        assert!(clen >= src.len());
    }

    #[test]
    fn decompress_into_caller_arena() {
        let mut c = Compressor::create(CompressionAlgorithm::Lz4).unwrap();
        let src = vec![7u8; 1024];

        let clen = c.compress(&src).unwrap();
        let compressed = c.arena()[..clen].to_vec();

        let mut out = vec![0u8; src.len()];
        c.decompress_into(&compressed, &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn decompress_length_mismatch_is_error() {
        let mut c = Compressor::create(CompressionAlgorithm::Lz4).unwrap();
        let src = vec![7u8; 128];
        let clen = c.compress(&src).unwrap();
        let compressed = c.arena()[..clen].to_vec();

        assert!(c.decompress(&compressed, 64).is_err());
    }
}
