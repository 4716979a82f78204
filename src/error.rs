// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication subsystem.
//!
//! Errors are categorized by the boundary they cross (broker, store, replay
//! HTTP call, configuration) and carry enough context to be logged once by
//! the caller that decides to suppress them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Broker unreachable, channel closed, publish/consume failure |
//! | `Replay` | Yes | Replay HTTP call failed (transport error, timeout, non-2xx) |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Envelope` | No | Mutation Event could not be encoded or decoded |
//! | `Conflict` | No | Unique constraint violated by a mutation |
//! | `InvalidState` | No | Node lifecycle state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Nothing in this crate retries. [`ReplicationError::is_retryable()`] only
//! classifies the failure for logs and metrics: a retryable failure was
//! transient at the moment it happened, a non-retryable one would fail again.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the replication subsystem and its CRUD collaborator.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Broker connection, declaration, publish or consume error.
    ///
    /// Surfaced as a failed publish/consume; never fails the originating
    /// local mutation.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<lapin::Error>,
    },

    /// SQLite error while persisting domain rows.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Occurs at startup. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mutation Event could not be serialized or parsed.
    ///
    /// A delivery that fails to parse is dropped, never redelivered.
    #[error("Envelope error: {0}")]
    Envelope(String),

    /// Replay HTTP call failed.
    ///
    /// The delivery is acknowledged regardless; the event is lost.
    #[error("Replay error ({url}): {message}")]
    Replay { url: String, message: String },

    /// A unique constraint was violated (e.g. duplicate tracking number).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Node state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running node).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a broker error from a lapin error.
    pub fn broker(operation: impl Into<String>, source: lapin::Error) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source.
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a replay error for the given target URL.
    pub fn replay(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Replay {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true, // Network errors are transient
            Self::Replay { .. } => true,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::Envelope(_) => false, // Malformed at the source
            Self::Conflict(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics (`error_type` label).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker { .. } => "broker",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::Envelope(_) => "envelope",
            Self::Replay { .. } => "replay",
            Self::Conflict(_) => "conflict",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_broker() {
        let err = ReplicationError::broker_msg("basic_publish", "channel closed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("basic_publish"));
    }

    #[test]
    fn test_is_retryable_replay() {
        let err = ReplicationError::replay("http://127.0.0.1:8001/api/v1/warehouses/", "timed out");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("8001"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("node id contains '.'".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_envelope() {
        let err = ReplicationError::Envelope("missing field `source_node`".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "envelope");
    }

    #[test]
    fn test_not_retryable_conflict() {
        let err = ReplicationError::Conflict("tracking_number TRK001".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_store_error_from_sqlx() {
        let err: ReplicationError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), "store");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_broker_error_formatting() {
        let err = ReplicationError::Broker {
            operation: "connect".to_string(),
            message: "connection refused".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Broker error"));
        assert!(msg.contains("connect"));
        assert!(msg.contains("connection refused"));
    }
}
