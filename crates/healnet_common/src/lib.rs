//! Shared types for the healnet daemon and its collaborators.

pub mod action;
pub mod config;
pub mod error;
pub mod types;
pub mod views;

pub use action::{ActionKind, RemediationAction, RemediationOutcome, RemediationPlan, RemediationRecord};
pub use config::Config;
pub use error::{ConfigError, HealError, HealResult, TelemetryError};
pub use types::{
    AnomalyCategory, AnomalyScore, Device, DeviceStatus, Issue, IssueFilter, IssueId,
    IssueStatus, Metric, MetricDeviation, Resolution, ResolutionOutcome, Sample, Verdict,
};
pub use views::{CommandResult, DeviceView, HistoryPoint, IssueView, NetworkStatus, OverallHealth};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
