//! Error types for cachemux.
//!
//! Every failure the engine can surface is a [`CacheError`]. Each variant carries a
//! stable [`ErrorCode`] so callers can branch on the category without matching on
//! message text.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cachemux operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Stable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidKey,
    KeyTooLong,
    InvalidArgument,
    SerializationError,
    DeserializationError,
    DataIntegrityError,
    ProviderError,
    CircuitOpen,
    RateLimitExceeded,
    Timeout,
    ComputeError,
    Unknown,
}

impl ErrorCode {
    /// Returns the code as it appears in error messages and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidKey => "INVALID_KEY",
            ErrorCode::KeyTooLong => "KEY_TOO_LONG",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::DataIntegrityError => "DATA_INTEGRITY_ERROR",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ComputeError => "COMPUTE_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in cachemux operations.
///
/// `CacheError` is `Clone` because a single failure of a deduplicated computation is
/// delivered to every caller that attached to it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The key is empty or contains only whitespace.
    #[error("[INVALID_KEY] Invalid cache key: {0}")]
    InvalidKey(String),

    /// The key exceeds the configured maximum length.
    #[error("[KEY_TOO_LONG] Cache key is {len} bytes, maximum is {max}")]
    KeyTooLong {
        /// Actual key length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An option or argument is out of range.
    #[error("[INVALID_ARGUMENT] {0}")]
    InvalidArgument(String),

    /// The value could not be encoded.
    #[error("[SERIALIZATION_ERROR] {0}")]
    Serialization(String),

    /// Stored bytes could not be decoded back into a value.
    #[error("[DESERIALIZATION_ERROR] {0}")]
    Deserialization(String),

    /// Stored checksum does not match the payload.
    #[error("[DATA_INTEGRITY_ERROR] Checksum mismatch: expected {expected}, got {actual}")]
    DataIntegrity {
        /// Checksum recorded at write time.
        expected: String,
        /// Checksum recomputed at read time.
        actual: String,
    },

    /// A storage adapter reported a failure.
    #[error("[PROVIDER_ERROR] Provider '{provider}' failed: {message}")]
    Provider {
        /// Registered provider name.
        provider: String,
        /// Adapter-reported message.
        message: String,
    },

    /// The guarding circuit breaker is open.
    #[error("[CIRCUIT_OPEN] Circuit '{name}' is open, retry in {retry_in:?}")]
    CircuitOpen {
        /// Breaker name (operation or provider).
        name: String,
        /// Remaining cool-down before a probe is allowed.
        retry_in: Duration,
    },

    /// Admission control rejected the call.
    #[error("[RATE_LIMIT_EXCEEDED] Rate limit exceeded for '{operation}': {limit} requests per {window:?}")]
    RateLimitExceeded {
        /// Rate-limited operation name.
        operation: String,
        /// Effective request ceiling.
        limit: u32,
        /// Sliding window length.
        window: Duration,
    },

    /// A bounded wait elapsed.
    #[error("[TIMEOUT] '{operation}' timed out after {after:?}")]
    Timeout {
        /// Operation that waited.
        operation: String,
        /// Time waited.
        after: Duration,
    },

    /// The compute function failed after all retries.
    #[error("[COMPUTE_ERROR] Computation for '{key}' failed after {attempts} attempt(s): {message}")]
    Compute {
        /// Key being computed.
        key: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Message of the last failure.
        message: String,
    },

    /// Catch-all for unexpected internal failures.
    #[error("[UNKNOWN] {0}")]
    Unknown(String),
}

impl CacheError {
    /// Returns the stable category of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CacheError::InvalidKey(_) => ErrorCode::InvalidKey,
            CacheError::KeyTooLong { .. } => ErrorCode::KeyTooLong,
            CacheError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CacheError::Serialization(_) => ErrorCode::SerializationError,
            CacheError::Deserialization(_) => ErrorCode::DeserializationError,
            CacheError::DataIntegrity { .. } => ErrorCode::DataIntegrityError,
            CacheError::Provider { .. } => ErrorCode::ProviderError,
            CacheError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            CacheError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            CacheError::Timeout { .. } => ErrorCode::Timeout,
            CacheError::Compute { .. } => ErrorCode::ComputeError,
            CacheError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Builds a provider error.
    pub fn provider(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CacheError::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Builds a compute error for a single failed attempt.
    ///
    /// Compute functions return this (or any other `CacheError`) to signal failure;
    /// the engine rewrites the attempt count once retries are exhausted.
    pub fn compute(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CacheError::Compute {
            key: key.into(),
            attempts: 1,
            message: message.to_string(),
        }
    }

    /// True for errors raised by validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::InvalidKey | ErrorCode::KeyTooLong | ErrorCode::InvalidArgument
        )
    }

    /// True for admission-control rejections (rate limit, queue timeout, open circuit).
    pub fn is_admission(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::RateLimitExceeded | ErrorCode::Timeout | ErrorCode::CircuitOpen
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CacheError::Deserialization(err.to_string())
        } else {
            CacheError::Serialization(err.to_string())
        }
    }
}
