//! Error taxonomy for the query/read-feed pipeline
//!
//! Every stage and the enumerator report failures through [`PipelineError`].
//! Errors are `Clone` so that a failed step can be inspected repeatedly
//! without the pipeline issuing another fetch.

use std::fmt;

use thiserror::Error;

use crate::observability::Severity;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Status code surfaced when split/merge reconciliation gives up on a range.
pub const STATUS_GONE: u16 = 410;

/// Sub-status accompanying [`STATUS_GONE`] for a retired partition range.
pub const SUB_STATUS_PARTITION_KEY_RANGE_GONE: u32 = 1002;

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Continuation token could not be parsed or is inconsistent with the query
    MalformedContinuationToken,
    /// Server partitioning no longer matches the fetched range
    SplitOrMergeInProgress,
    /// Terminal failure from the fetch collaborator
    FetchFailed,
    /// Operation not available for this pipeline shape
    UnsupportedOperation,
    /// Caller cancelled the pull
    Cancelled,
    /// Invalid configuration, plan, or range
    InvalidArgument,
}

impl ErrorCode {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedContinuationToken => "PIPELINE_MALFORMED_CONTINUATION_TOKEN",
            ErrorCode::SplitOrMergeInProgress => "PIPELINE_SPLIT_OR_MERGE",
            ErrorCode::FetchFailed => "PIPELINE_FETCH_FAILED",
            ErrorCode::UnsupportedOperation => "PIPELINE_UNSUPPORTED_OPERATION",
            ErrorCode::Cancelled => "PIPELINE_CANCELLED",
            ErrorCode::InvalidArgument => "PIPELINE_INVALID_ARGUMENT",
        }
    }

    /// Severity used when the error is logged
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::SplitOrMergeInProgress | ErrorCode::Cancelled => Severity::Info,
            ErrorCode::MalformedContinuationToken | ErrorCode::InvalidArgument => Severity::Warn,
            ErrorCode::FetchFailed | ErrorCode::UnsupportedOperation => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Malformed continuation token '{token}': {reason}")]
    MalformedContinuationToken { token: String, reason: String },

    #[error("Split or merge in progress for range {range}")]
    SplitOrMergeInProgress { range: String },

    #[error("Fetch failed ({status_code}/{sub_status_code}): {message}")]
    FetchFailed {
        status_code: u16,
        sub_status_code: u32,
        message: String,
        activity_id: Option<String>,
        retriable: bool,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PipelineError {
    /// Malformed token error carrying the offending text
    pub fn malformed(token: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedContinuationToken {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Non-retriable fetch failure
    pub fn fetch_failed(status_code: u16, message: impl Into<String>) -> Self {
        PipelineError::FetchFailed {
            status_code,
            sub_status_code: 0,
            message: message.into(),
            activity_id: None,
            retriable: false,
        }
    }

    /// Fetch failure the caller may retry (throttling, timeouts)
    pub fn retriable_fetch_failed(status_code: u16, message: impl Into<String>) -> Self {
        PipelineError::FetchFailed {
            status_code,
            sub_status_code: 0,
            message: message.into(),
            activity_id: None,
            retriable: true,
        }
    }

    /// Get the error code
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::MalformedContinuationToken { .. } => ErrorCode::MalformedContinuationToken,
            PipelineError::SplitOrMergeInProgress { .. } => ErrorCode::SplitOrMergeInProgress,
            PipelineError::FetchFailed { .. } => ErrorCode::FetchFailed,
            PipelineError::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            PipelineError::Cancelled => ErrorCode::Cancelled,
            PipelineError::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Whether the same pipeline may be pulled again after this error.
    ///
    /// Non-retriable errors mark the enumerator done.
    pub fn is_retriable(&self) -> bool {
        match self {
            PipelineError::FetchFailed { retriable, .. } => *retriable,
            PipelineError::SplitOrMergeInProgress { .. } | PipelineError::Cancelled => true,
            PipelineError::MalformedContinuationToken { .. }
            | PipelineError::UnsupportedOperation(_)
            | PipelineError::InvalidArgument(_) => false,
        }
    }

    /// Whether this is the transport's split/merge signal
    pub fn is_split_or_merge(&self) -> bool {
        matches!(self, PipelineError::SplitOrMergeInProgress { .. })
    }
}
