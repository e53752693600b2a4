//! Error types for the casgate gateway
//!
//! Provides structured error types for all gateway components including
//! cache tiers, the fetch pipeline, replication, and the CAS backend
//! adapters. Callers are expected to switch on the error kind; every
//! variant keeps the operation context and the lowest-layer cause.

use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Content Errors
    // =========================================================================
    #[error("content not found: {cid} ({context})")]
    NotFound { cid: String, context: String },

    #[error("operation {operation} timed out after {elapsed_ms}ms (cid: {cid})")]
    Timeout {
        operation: String,
        cid: String,
        elapsed_ms: u64,
    },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("connection to {source_name} failed: {cause}")]
    Connection { source_name: String, cause: String },

    #[error("backend {backend} returned an error during {operation}: {cause}")]
    Backend {
        backend: String,
        operation: String,
        cause: String,
    },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    #[error("write to tier {tier} failed for {cid}: {cause}")]
    WriteFailed {
        tier: String,
        cid: String,
        cause: String,
    },

    #[error("tier {tier} cannot fit {needed} bytes even after eviction (capacity {capacity})")]
    CapacityExhausted {
        tier: String,
        needed: u64,
        capacity: u64,
    },

    #[error("item of {size} bytes exceeds tier {tier} limit of {limit} bytes")]
    TooLarge { tier: String, size: u64, limit: u64 },

    // =========================================================================
    // Replication & Integrity Errors
    // =========================================================================
    #[error("under-replicated: {cid} placed on {got} of {required} required tiers")]
    UnderReplicated {
        cid: String,
        got: usize,
        required: usize,
    },

    #[error("cache index at {path} is corrupt: {cause}")]
    CorruptIndex { path: String, cause: String },

    #[error("integrity mismatch for {cid}: tiers {corrupted_tiers:?} disagree with {reference_tier}")]
    IntegrityMismatch {
        cid: String,
        reference_tier: String,
        corrupted_tiers: Vec<String>,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Parse & IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a `NotFound` with operation context
    pub fn not_found(cid: impl Into<String>, context: impl Into<String>) -> Self {
        Error::NotFound {
            cid: cid.into(),
            context: context.into(),
        }
    }

    /// Check if this error is safe to retry against the same target
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::Connection { .. }
                | Error::HttpClient(_)
                | Error::Backend { .. }
        )
    }

    /// Check if recovery should fall through to the next tier or source
    ///
    /// Covers the fetch pipeline (try the next gateway) and tier placement
    /// (try the next tier accepting the size).
    pub fn is_fallthrough(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::Timeout { .. }
                | Error::CapacityExhausted { .. }
                | Error::TooLarge { .. }
        )
    }

    /// Check if the error means the content simply is not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;
