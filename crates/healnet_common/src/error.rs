//! Error taxonomy
//!
//! Telemetry failures are non-fatal and become degraded samples. Issue and
//! remediation misuse is returned to the caller. Only configuration errors
//! abort startup.

use chrono::{DateTime, Utc};

use crate::types::IssueId;

/// Failure to obtain a sample from a device
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TelemetryError {
    #[error("device {device} unreachable: {reason}")]
    Unreachable { device: String, reason: String },

    #[error("poll of {device} timed out after {timeout_ms}ms")]
    Timeout { device: String, timeout_ms: u64 },
}

/// Invalid or unreadable configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("no devices configured")]
    NoDevices,

    #[error("device {0} is configured more than once")]
    DuplicateDevice(String),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the healing core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HealError {
    #[error("issue {0} not found")]
    NotFound(IssueId),

    #[error("issue {0} is already resolved")]
    AlreadyResolved(IssueId),

    #[error("remediation already in progress for issue {0}")]
    AlreadyInProgress(IssueId),

    #[error("remediation for issue {issue} failed: {reason}")]
    RemediationFailed { issue: IssueId, reason: String },

    #[error("issue {issue} reached the limit of {attempts} automatic remediation attempts")]
    RetryLimitReached { issue: IssueId, attempts: u32 },

    #[error("detector model changed concurrently (expected version {expected}, found {found})")]
    ModelUpdateConflict { expected: u64, found: u64 },

    #[error("sample for {device} at {timestamp} is older than the newest stored sample")]
    OutOfOrder {
        device: String,
        timestamp: DateTime<Utc>,
    },
}

pub type HealResult<T> = std::result::Result<T, HealError>;
