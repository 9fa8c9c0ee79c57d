//! Optional payload compression.
//!
//! Compression is only attempted for payloads at or above a size threshold, and a
//! compressed result is only kept when it is at most `max_ratio` of the original
//! size. Anything else is stored as-is, so [`Compressor::compress_if_needed`] never
//! returns more bytes than it was given.

use crate::error::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipLevel;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::{Read, Write};

/// Default minimum payload size for compression (1 KiB).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default maximum compressed/original ratio for a result to be kept.
pub const DEFAULT_MAX_COMPRESSION_RATIO: f64 = 0.8;

/// Default gzip level.
pub const DEFAULT_GZIP_LEVEL: u32 = 6;

/// Algorithms a stored payload can be compressed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// LZ4 block format with the uncompressed size prepended.
    Lz4,
    /// Gzip stream.
    Gzip,
}

impl CompressionAlgorithm {
    /// All algorithms available in this build.
    pub const ALL: [CompressionAlgorithm; 2] = [CompressionAlgorithm::Lz4, CompressionAlgorithm::Gzip];

    pub const fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }
}

/// How the compressor picks an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmChoice {
    /// Try every available algorithm and keep the smallest output.
    #[default]
    Auto,
    Lz4,
    Gzip,
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads smaller than this are never compressed.
    pub threshold_bytes: usize,
    /// Compressed output must be at most this fraction of the input.
    pub max_ratio: f64,
    pub algorithm: AlgorithmChoice,
    /// Gzip level, 0-9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            max_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
            algorithm: AlgorithmChoice::Auto,
            level: DEFAULT_GZIP_LEVEL,
        }
    }
}

impl CompressionConfig {
    /// Compression switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, bytes: usize) -> Self {
        self.threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: AlgorithmChoice) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_max_ratio(mut self, ratio: f64) -> Self {
        self.max_ratio = ratio;
        self
    }

    /// Rejects out-of-range settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_ratio > 0.0 && self.max_ratio <= 1.0) {
            return Err(CacheError::InvalidArgument(format!(
                "compression max_ratio must be in (0, 1], got {}",
                self.max_ratio
            )));
        }
        if self.level > 9 {
            return Err(CacheError::InvalidArgument(format!(
                "gzip level must be 0-9, got {}",
                self.level
            )));
        }
        Ok(())
    }
}

/// Output of [`Compressor::compress_if_needed`].
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    /// Bytes to store.
    pub data: Vec<u8>,
    /// Algorithm used, `None` when stored uncompressed.
    pub algorithm: Option<CompressionAlgorithm>,
    /// Size of the input.
    pub original_size: usize,
}

impl Compressed {
    pub fn is_compressed(&self) -> bool {
        self.algorithm.is_some()
    }

    /// Stored size divided by original size.
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.data.len() as f64 / self.original_size as f64
        }
    }
}

/// Applies [`CompressionConfig`] to payloads.
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compresses `data` when enabled, large enough, and worth it.
    ///
    /// An algorithm that fails is skipped; if every candidate fails or none shrinks
    /// the payload below `max_ratio`, the input is returned unchanged.
    pub fn compress_if_needed(&self, data: Vec<u8>) -> Compressed {
        let original_size = data.len();
        if !self.config.enabled || original_size < self.config.threshold_bytes {
            return Compressed {
                data,
                algorithm: None,
                original_size,
            };
        }

        let candidates: &[CompressionAlgorithm] = match self.config.algorithm {
            AlgorithmChoice::Auto => &CompressionAlgorithm::ALL,
            AlgorithmChoice::Lz4 => &[CompressionAlgorithm::Lz4],
            AlgorithmChoice::Gzip => &[CompressionAlgorithm::Gzip],
        };

        let mut best: Option<(CompressionAlgorithm, Vec<u8>)> = None;
        for &algorithm in candidates {
            match self.compress_with(algorithm, &data) {
                Ok(out) => {
                    if best.as_ref().map_or(true, |(_, b)| out.len() < b.len()) {
                        best = Some((algorithm, out));
                    }
                }
                Err(e) => {
                    tracing::debug!(algorithm = algorithm.as_str(), error = %e, "compression attempt failed");
                }
            }
        }

        let limit = original_size as f64 * self.config.max_ratio;
        match best {
            Some((algorithm, out)) if (out.len() as f64) <= limit => Compressed {
                data: out,
                algorithm: Some(algorithm),
                original_size,
            },
            _ => Compressed {
                data,
                algorithm: None,
                original_size,
            },
        }
    }

    /// Restores bytes written by [`compress_if_needed`](Self::compress_if_needed).
    pub fn decompress_if_needed<'a>(
        &self,
        data: &'a [u8],
        algorithm: Option<CompressionAlgorithm>,
    ) -> Result<Cow<'a, [u8]>> {
        match algorithm {
            None => Ok(Cow::Borrowed(data)),
            Some(CompressionAlgorithm::Lz4) => decompress_size_prepended(data)
                .map(Cow::Owned)
                .map_err(|e| CacheError::Deserialization(format!("lz4 decompression failed: {e}"))),
            Some(CompressionAlgorithm::Gzip) => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| CacheError::Deserialization(format!("gzip decompression failed: {e}")))?;
                Ok(Cow::Owned(out))
            }
        }
    }

    fn compress_with(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        match algorithm {
            CompressionAlgorithm::Lz4 => Ok(compress_prepend_size(data)),
            CompressionAlgorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.config.level.min(9)));
                encoder
                    .write_all(data)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| CacheError::Serialization(e.to_string()))
            }
        }
    }
}
