//! Error types for mongo-mirror.
//!
//! Every variant carries a stable code (`MIRROR-0xx`) so operators can grep
//! run logs for a failure class without parsing messages.

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mirroring collections.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration (MIRROR-001).
    #[error("[MIRROR-001] Configuration error: {0}")]
    Config(String),

    /// A store could not be reached or failed its health check (MIRROR-002).
    #[error("[MIRROR-002] Failed to connect to {role}: {message}")]
    Connection {
        /// Which endpoint failed (`source` or `destination`).
        role: String,
        /// Underlying failure.
        message: String,
    },

    /// The destination resolves to a forbidden production host (MIRROR-003).
    #[error("[MIRROR-003] Refusing to write to a production destination: {0}")]
    SafetyViolation(String),

    /// A UUID-shaped value failed to parse (MIRROR-004).
    #[error("[MIRROR-004] Invalid identifier '{value}': {reason}")]
    InvalidIdentifier {
        /// Offending value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// The explicit filter of a collection is not a valid JSON object (MIRROR-005).
    #[error("[MIRROR-005] Invalid filter for collection '{collection}': {message}")]
    InvalidFilterSyntax {
        /// Collection name.
        collection: String,
        /// Parser message.
        message: String,
    },

    /// `batch_size` is neither `all` nor a positive integer (MIRROR-006).
    #[error("[MIRROR-006] Invalid batch size '{value}' for collection '{collection}': must be a positive number or 'all'")]
    InvalidBatchSize {
        /// Collection name.
        collection: String,
        /// Raw configured value.
        value: String,
    },

    /// Counting, querying or decoding from the source failed (MIRROR-007).
    #[error("[MIRROR-007] Source query failed for collection '{collection}': {message}")]
    SourceQueryFailed {
        /// Collection name.
        collection: String,
        /// Underlying failure.
        message: String,
    },

    /// A destination write failed (MIRROR-008).
    #[error("[MIRROR-008] Write failed for collection '{collection}': {message}")]
    WriteFailed {
        /// Collection name.
        collection: String,
        /// Underlying failure.
        message: String,
    },

    /// Raw store error before it is attributed to a collection (MIRROR-009).
    #[error("[MIRROR-009] Store error: {message}")]
    Store {
        /// Driver message.
        message: String,
        /// Whether the failure is a network-level blip worth retrying.
        transient: bool,
    },

    /// The run deadline expired (MIRROR-010).
    #[error("[MIRROR-010] Operation timed out after {0}s")]
    Timeout(u64),

    /// IO error (MIRROR-011).
    #[error("[MIRROR-011] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error (MIRROR-012).
    #[error("[MIRROR-012] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns the error code (e.g., "MIRROR-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "MIRROR-001",
            Self::Connection { .. } => "MIRROR-002",
            Self::SafetyViolation(_) => "MIRROR-003",
            Self::InvalidIdentifier { .. } => "MIRROR-004",
            Self::InvalidFilterSyntax { .. } => "MIRROR-005",
            Self::InvalidBatchSize { .. } => "MIRROR-006",
            Self::SourceQueryFailed { .. } => "MIRROR-007",
            Self::WriteFailed { .. } => "MIRROR-008",
            Self::Store { .. } => "MIRROR-009",
            Self::Timeout(_) => "MIRROR-010",
            Self::Io(_) => "MIRROR-011",
            Self::Yaml(_) => "MIRROR-012",
        }
    }

    /// Returns true if this error must stop the whole run, regardless of
    /// `continue_on_error`.
    ///
    /// These all point at a configuration or environment defect that every
    /// remaining collection would hit as well.
    #[must_use]
    pub const fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Connection { .. }
                | Self::SafetyViolation(_)
                | Self::InvalidBatchSize { .. }
                | Self::Yaml(_)
        )
    }

    /// Attributes a store failure to a source query of `collection`.
    pub(crate) fn source_query(collection: &str, err: Self) -> Self {
        match err {
            Self::Store { message, .. } => Self::SourceQueryFailed {
                collection: collection.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Attributes a store failure to a destination write of `collection`.
    pub(crate) fn write(collection: &str, err: Self) -> Self {
        match err {
            Self::Store { message, .. } => Self::WriteFailed {
                collection: collection.to_string(),
                message,
            },
            other => other,
        }
    }
}
