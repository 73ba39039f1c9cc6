//! Configuration for the healing daemon.
//!
//! Loaded from /etc/healnet/config.toml (or a path given on the command line).
//! Missing fields take defaults; present but invalid values are rejected at
//! startup by [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::action::{default_plans, RemediationPlan};
use crate::error::ConfigError;
use crate::types::{Device, DeviceStatus, Metric};
use crate::views::OverallHealth;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/healnet/config.toml";

/// Default state directory for the JSON journal
pub const STATE_DIR: &str = "/var/lib/healnet";

/// Control loop cadence and resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick period in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-device poll timeout in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Overall tick budget; stragglers past it are left for the next tick
    #[serde(default = "default_tick_deadline")]
    pub tick_deadline_ms: u64,

    /// Upper bound on devices worked concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Samples kept per device
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Default number of points returned by history queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub status: StatusThresholds,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    2_000
}

fn default_tick_deadline() -> u64 {
    4_000
}

fn default_max_concurrency() -> usize {
    16
}

fn default_window_capacity() -> usize {
    100
}

fn default_history_limit() -> usize {
    100
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_timeout_ms: default_poll_timeout(),
            tick_deadline_ms: default_tick_deadline(),
            max_concurrency: default_max_concurrency(),
            window_capacity: default_window_capacity(),
            history_limit: default_history_limit(),
            status: StatusThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_millis(self.tick_deadline_ms)
    }
}

/// Latency/loss bands for device status and the network rollup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusThresholds {
    #[serde(default = "default_warning_latency")]
    pub warning_latency_ms: f64,
    #[serde(default = "default_critical_latency")]
    pub critical_latency_ms: f64,
    #[serde(default = "default_warning_loss")]
    pub warning_loss_pct: f64,
    #[serde(default = "default_critical_loss")]
    pub critical_loss_pct: f64,
}

fn default_warning_latency() -> f64 {
    200.0
}

fn default_critical_latency() -> f64 {
    500.0
}

fn default_warning_loss() -> f64 {
    5.0
}

fn default_critical_loss() -> f64 {
    20.0
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning_latency_ms: default_warning_latency(),
            critical_latency_ms: default_critical_latency(),
            warning_loss_pct: default_warning_loss(),
            critical_loss_pct: default_critical_loss(),
        }
    }
}

impl StatusThresholds {
    /// Health band for a latency/loss pair; bounds are exclusive
    pub fn classify(&self, latency_ms: f64, packet_loss_pct: f64) -> OverallHealth {
        if latency_ms > self.critical_latency_ms || packet_loss_pct > self.critical_loss_pct {
            OverallHealth::Critical
        } else if latency_ms > self.warning_latency_ms || packet_loss_pct > self.warning_loss_pct {
            OverallHealth::Warning
        } else {
            OverallHealth::Good
        }
    }

    pub fn device_status(&self, latency_ms: f64, packet_loss_pct: f64) -> DeviceStatus {
        match self.classify(latency_ms, packet_loss_pct) {
            OverallHealth::Critical => DeviceStatus::Error,
            OverallHealth::Warning => DeviceStatus::Warning,
            OverallHealth::Good => DeviceStatus::Healthy,
        }
    }
}

/// Minimum spread per metric, so a flat baseline does not turn noise into
/// infinite deviation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFloors {
    #[serde(default = "default_connectivity_floor")]
    pub connectivity: f64,
    #[serde(default = "default_latency_floor")]
    pub latency_ms: f64,
    #[serde(default = "default_loss_floor")]
    pub packet_loss_pct: f64,
    #[serde(default = "default_bandwidth_floor")]
    pub bandwidth_mbps: f64,
    #[serde(default = "default_resource_floor")]
    pub resource_pct: f64,
}

fn default_connectivity_floor() -> f64 {
    0.25
}

fn default_latency_floor() -> f64 {
    5.0
}

fn default_loss_floor() -> f64 {
    1.0
}

fn default_bandwidth_floor() -> f64 {
    5.0
}

fn default_resource_floor() -> f64 {
    5.0
}

impl Default for MetricFloors {
    fn default() -> Self {
        Self {
            connectivity: default_connectivity_floor(),
            latency_ms: default_latency_floor(),
            packet_loss_pct: default_loss_floor(),
            bandwidth_mbps: default_bandwidth_floor(),
            resource_pct: default_resource_floor(),
        }
    }
}

impl MetricFloors {
    pub fn for_metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Connectivity => self.connectivity,
            Metric::Latency => self.latency_ms,
            Metric::PacketLoss => self.packet_loss_pct,
            Metric::Bandwidth => self.bandwidth_mbps,
            Metric::Cpu | Metric::Memory | Metric::Disk => self.resource_pct,
        }
    }
}

/// Absolute limits that count as anomalous regardless of baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCeilings {
    #[serde(default = "default_latency_ceiling")]
    pub latency_ms: Option<f64>,
    #[serde(default = "default_loss_ceiling")]
    pub packet_loss_pct: Option<f64>,
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default = "default_resource_ceiling")]
    pub cpu_pct: Option<f64>,
    #[serde(default = "default_resource_ceiling")]
    pub memory_pct: Option<f64>,
    #[serde(default = "default_resource_ceiling")]
    pub disk_pct: Option<f64>,
}

fn default_latency_ceiling() -> Option<f64> {
    Some(500.0)
}

fn default_loss_ceiling() -> Option<f64> {
    Some(20.0)
}

fn default_resource_ceiling() -> Option<f64> {
    Some(95.0)
}

impl Default for MetricCeilings {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ceiling(),
            packet_loss_pct: default_loss_ceiling(),
            bandwidth_mbps: None,
            cpu_pct: default_resource_ceiling(),
            memory_pct: default_resource_ceiling(),
            disk_pct: default_resource_ceiling(),
        }
    }
}

impl MetricCeilings {
    pub fn for_metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Connectivity => None,
            Metric::Latency => self.latency_ms,
            Metric::PacketLoss => self.packet_loss_pct,
            Metric::Bandwidth => self.bandwidth_mbps,
            Metric::Cpu => self.cpu_pct,
            Metric::Memory => self.memory_pct,
            Metric::Disk => self.disk_pct,
        }
    }
}

/// Detector thresholds and learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Severity at or above which a candidate anomaly is reported
    #[serde(default = "default_severity_cutoff")]
    pub severity_cutoff: f64,

    /// Consecutive deviating samples required
    #[serde(default = "default_confirm_samples")]
    pub confirm_samples: usize,

    /// Samples needed before the baseline is trusted
    #[serde(default = "default_min_baseline_samples")]
    pub min_baseline_samples: usize,

    /// Initial deviation multiplier for every metric
    #[serde(default = "default_tolerance")]
    pub default_tolerance: f64,

    #[serde(default = "default_min_tolerance")]
    pub min_tolerance: f64,

    #[serde(default = "default_max_tolerance")]
    pub max_tolerance: f64,

    /// Fraction of the gap to the target tolerance closed per update
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default)]
    pub floors: MetricFloors,

    #[serde(default)]
    pub ceilings: MetricCeilings,
}

fn default_severity_cutoff() -> f64 {
    1.0
}

fn default_confirm_samples() -> usize {
    3
}

fn default_min_baseline_samples() -> usize {
    3
}

fn default_tolerance() -> f64 {
    3.0
}

fn default_min_tolerance() -> f64 {
    1.5
}

fn default_max_tolerance() -> f64 {
    12.0
}

fn default_learning_rate() -> f64 {
    0.25
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            severity_cutoff: default_severity_cutoff(),
            confirm_samples: default_confirm_samples(),
            min_baseline_samples: default_min_baseline_samples(),
            default_tolerance: default_tolerance(),
            min_tolerance: default_min_tolerance(),
            max_tolerance: default_max_tolerance(),
            learning_rate: default_learning_rate(),
            floors: MetricFloors::default(),
            ceilings: MetricCeilings::default(),
        }
    }
}

/// Remediation registry and safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Dispatch plans automatically from the control loop
    #[serde(default = "default_auto_remediate")]
    pub auto_remediate: bool,

    /// Log commands instead of executing them
    #[serde(default)]
    pub dry_run: bool,

    /// Failed attempts before an issue needs manual resolution
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    #[serde(default = "default_plans")]
    pub plans: Vec<RemediationPlan>,
}

fn default_auto_remediate() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_action_timeout() -> u64 {
    30
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            auto_remediate: default_auto_remediate(),
            dry_run: false,
            max_attempts: default_max_attempts(),
            action_timeout_secs: default_action_timeout(),
            plans: default_plans(),
        }
    }
}

impl RemediationConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Where journal files live. `None` keeps everything in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: Option<PathBuf>,
}

fn default_state_dir() -> Option<PathBuf> {
    Some(PathBuf::from(STATE_DIR))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// One inventory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub address: String,

    /// TCP port used for reachability probes
    #[serde(default = "default_probe_port")]
    pub port: u16,

    /// Also sample this host's CPU/memory/disk
    #[serde(default)]
    pub local: bool,
}

fn default_probe_port() -> u16 {
    80
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: default_probe_port(),
            local: false,
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub remediation: RemediationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load and validate config from a path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Inventory as device records
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|d| Device::new(d.name.clone(), d.address.clone()))
            .collect()
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::invalid("devices.name", "must not be empty"));
            }
            if device.address.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "devices.address",
                    format!("device {} has no address", device.name),
                ));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
        }

        let monitor = &self.monitor;
        if monitor.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("monitor.poll_interval_secs", "must be > 0"));
        }
        if monitor.poll_timeout_ms == 0 {
            return Err(ConfigError::invalid("monitor.poll_timeout_ms", "must be > 0"));
        }
        if monitor.tick_deadline_ms < monitor.poll_timeout_ms {
            return Err(ConfigError::invalid(
                "monitor.tick_deadline_ms",
                "must be at least poll_timeout_ms",
            ));
        }
        if monitor.max_concurrency == 0 {
            return Err(ConfigError::invalid("monitor.max_concurrency", "must be > 0"));
        }
        if monitor.history_limit == 0 {
            return Err(ConfigError::invalid("monitor.history_limit", "must be > 0"));
        }
        let status = &monitor.status;
        if !(positive(status.warning_latency_ms)
            && positive(status.critical_latency_ms)
            && status.warning_latency_ms <= status.critical_latency_ms)
        {
            return Err(ConfigError::invalid(
                "monitor.status",
                "latency bands must satisfy 0 < warning <= critical",
            ));
        }
        if !(positive(status.warning_loss_pct)
            && positive(status.critical_loss_pct)
            && status.warning_loss_pct <= status.critical_loss_pct)
        {
            return Err(ConfigError::invalid(
                "monitor.status",
                "loss bands must satisfy 0 < warning <= critical",
            ));
        }

        let detection = &self.detection;
        if !positive(detection.severity_cutoff) {
            return Err(ConfigError::invalid("detection.severity_cutoff", "must be a positive number"));
        }
        if detection.confirm_samples == 0 {
            return Err(ConfigError::invalid("detection.confirm_samples", "must be > 0"));
        }
        if detection.min_baseline_samples < 2 {
            return Err(ConfigError::invalid("detection.min_baseline_samples", "must be >= 2"));
        }
        if monitor.window_capacity < detection.confirm_samples + detection.min_baseline_samples {
            return Err(ConfigError::invalid(
                "monitor.window_capacity",
                "must hold confirm_samples + min_baseline_samples",
            ));
        }
        if !(positive(detection.min_tolerance)
            && positive(detection.max_tolerance)
            && detection.min_tolerance <= detection.default_tolerance
            && detection.default_tolerance <= detection.max_tolerance)
        {
            return Err(ConfigError::invalid(
                "detection.tolerance",
                "must satisfy 0 < min_tolerance <= default_tolerance <= max_tolerance",
            ));
        }
        if !(positive(detection.learning_rate) && detection.learning_rate <= 1.0) {
            return Err(ConfigError::invalid("detection.learning_rate", "must be in (0, 1]"));
        }
        for metric in Metric::ALL {
            if !positive(detection.floors.for_metric(metric)) {
                return Err(ConfigError::invalid(
                    "detection.floors",
                    format!("{} floor must be > 0", metric),
                ));
            }
            if let Some(ceiling) = detection.ceilings.for_metric(metric) {
                if !positive(ceiling) {
                    return Err(ConfigError::invalid(
                        "detection.ceilings",
                        format!("{} ceiling must be > 0", metric),
                    ));
                }
            }
        }

        let remediation = &self.remediation;
        if remediation.max_attempts == 0 {
            return Err(ConfigError::invalid("remediation.max_attempts", "must be >= 1"));
        }
        if remediation.action_timeout_secs == 0 {
            return Err(ConfigError::invalid("remediation.action_timeout_secs", "must be > 0"));
        }
        let mut categories = HashSet::new();
        for plan in &remediation.plans {
            if !categories.insert(plan.category) {
                return Err(ConfigError::invalid(
                    "remediation.plans",
                    format!("category {} has more than one plan", plan.category),
                ));
            }
        }

        Ok(())
    }
}

/// Finite and strictly positive; rejects NaN
fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
