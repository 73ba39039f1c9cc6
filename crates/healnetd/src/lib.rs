//! healnet daemon library - exposes modules for testing.

pub mod daemon;
pub mod detector;
pub mod feedback;
pub mod issues;
pub mod metrics;
pub mod monitor;
pub mod persistence;
pub mod remediation;
pub mod service;
pub mod store;
pub mod telemetry;

pub use daemon::HealDaemon;
