//! Error types for stoop sync operations

use std::time::Duration;
use thiserror::Error;

/// Payload-free classification of a [`SyncError`].
///
/// UI callers use this to decide between "retry" and "fatal" presentation
/// without depending on error internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Validation,
    TransientNetwork,
    Timeout,
    RealtimeDisconnected,
    Config,
    Persistence,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or STOOP_SYNC_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Durable storage errors raised by the persistence bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("IO error: {reason}")]
    Io { reason: String },

    #[error("Serialization error: {reason}")]
    Serde { reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde {
            reason: e.to_string(),
        }
    }
}

/// Master error type for the sync core.
///
/// Every variant is `Clone` because a single in-flight fetch settles all of
/// its waiters with the same result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Permission denied on {resource}: {reason}")]
    PermissionDenied { resource: String, reason: String },

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Transient network error: {reason}")]
    TransientNetwork { reason: String },

    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Realtime channel disconnected after {attempts} reconnect attempts")]
    RealtimeDisconnected { attempts: u32 },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl SyncError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn permission_denied(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RealtimeDisconnected { .. } => ErrorKind::RealtimeDisconnected,
            Self::Config(_) => ErrorKind::Config,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Network-class failures that a bounded local retry may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::Timeout
        )
    }

    /// Failures that must reach the caller on the first occurrence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::Validation
        )
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = SyncError::not_found("marketplace/list");
        let msg = format!("{}", err);
        assert!(msg.contains("not found"));
        assert!(msg.contains("marketplace/list"));
    }

    #[test]
    fn test_timeout_display() {
        let err = SyncError::Timeout {
            after: Duration::from_millis(1500),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("1.5s"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::transient("reset").is_retryable());
        assert!(SyncError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!SyncError::not_found("x").is_retryable());
        assert!(!SyncError::permission_denied("x", "rls").is_retryable());
        assert!(!SyncError::validation("price", "negative").is_retryable());
        assert!(!SyncError::RealtimeDisconnected { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(SyncError::not_found("x").is_terminal());
        assert!(SyncError::permission_denied("x", "rls").is_terminal());
        assert!(SyncError::validation("title", "empty").is_terminal());
        assert!(!SyncError::transient("reset").is_terminal());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "memory.critical_threshold",
            reason: "must be >= pressure_threshold".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("memory.critical_threshold"));
        assert!(msg.contains("pressure_threshold"));
    }

    #[test]
    fn test_sync_error_from_variants() {
        let config = SyncError::from(ConfigError::MissingConfigPath);
        assert_eq!(config.kind(), ErrorKind::Config);

        let persistence = SyncError::from(PersistenceError::Backend {
            reason: "full".to_string(),
        });
        assert_eq!(persistence.kind(), ErrorKind::Persistence);

        let io = PersistenceError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        assert!(matches!(io, PersistenceError::Io { .. }));
    }
}
