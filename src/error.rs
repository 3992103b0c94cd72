//! Error types for the fetch and scoring pipeline.
//!
//! Transient failures are retried inside the fetcher; everything that
//! reaches a caller arrives as one of these typed variants.

use crate::models::{AnalysisSummary, StreamFailure};
use crate::storage::StorageError;
use thiserror::Error;

/// Top-level error enum for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or rejected credential. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The local limiter or the provider kept refusing requests.
    #[error("Rate limit exceeded for {key}: {detail}")]
    RateLimitExceeded { key: String, detail: String },

    /// Timeouts, connection failures and 5xx responses after the attempt cap.
    #[error("Transient network error after {attempts} attempt(s): {detail}")]
    TransientNetwork { attempts: u32, detail: String },

    /// Non-retryable HTTP status (404, 422, ...).
    #[error("API error {status} for {url}")]
    Api { status: u16, url: String },

    #[error("Failed to decode response from {url}: {detail}")]
    Decode { url: String, detail: String },

    #[error("Invalid ruleset: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// An optional capability was not configured or not linked in.
    #[error("{feature} is not available: {reason}")]
    FeatureUnavailable { feature: String, reason: String },

    /// Every fetch stream of an analysis run failed.
    #[error("All {} fetch stream(s) failed", .summary.failures.len())]
    AllStreamsFailed { summary: Box<AnalysisSummary> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether a caller may reasonably try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimitExceeded { .. } | PipelineError::TransientNetwork { .. }
        )
    }

    /// Describe this error as the failure of one fetch stream.
    pub fn to_stream_failure(&self, stream: &str) -> StreamFailure {
        StreamFailure {
            stream: stream.to_string(),
            error: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

/// Reasons a ruleset is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed ruleset: {0}")]
    Malformed(String),

    #[error("failed to read rules file {path}: {detail}")]
    Unreadable { path: String, detail: String },

    #[error("ruleset defines no dimensions")]
    NoDimensions,

    #[error("duplicate dimension name: {0}")]
    DuplicateDimension(String),

    #[error("dimension '{0}' lists no event kinds")]
    EmptyDimension(String),

    #[error("unknown event kind '{kind}' in {location}")]
    UnknownKind { location: String, kind: String },

    #[error("weight for {location} must be finite and non-negative, got {value}")]
    InvalidWeight { location: String, value: f64 },

    #[error("dimension '{dimension}' overrides the weight of '{kind}' without listing it in kinds")]
    OrphanKindWeight { dimension: String, kind: String },

    #[error(
        "kind '{kind}' has conflicting weights: {first} in '{first_dimension}', {second} in '{second_dimension}'"
    )]
    ConflictingWeight {
        kind: String,
        first_dimension: String,
        first: f64,
        second_dimension: String,
        second: f64,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
