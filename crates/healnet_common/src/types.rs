//! Core data model shared by the daemon and its collaborators.
//!
//! Samples are immutable once built, issues are never deleted (only their
//! status moves forward), and anomaly scores are transient unless they are
//! attached to an issue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::action::RemediationRecord;

/// Issue identifier
pub type IssueId = Uuid;

/// Last-known health of a device
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Healthy,
    Warning,
    Error,
}

impl DeviceStatus {
    /// The more severe of two statuses
    pub fn worst(self, other: DeviceStatus) -> DeviceStatus {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Healthy => "healthy",
            DeviceStatus::Warning => "warning",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored network device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub address: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            status: DeviceStatus::Healthy,
        }
    }
}

/// One device's metrics at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device: String,
    pub timestamp: DateTime<Utc>,
    /// False when the poll failed or timed out
    pub reachable: bool,
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub bandwidth_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_pct: Option<f64>,
}

impl Sample {
    pub fn new(
        device: impl Into<String>,
        timestamp: DateTime<Utc>,
        latency_ms: f64,
        packet_loss_pct: f64,
        bandwidth_mbps: f64,
    ) -> Self {
        Self {
            device: device.into(),
            timestamp,
            reachable: true,
            latency_ms,
            packet_loss_pct,
            bandwidth_mbps,
            cpu_pct: None,
            memory_pct: None,
            disk_pct: None,
        }
    }

    /// Degraded sample recorded when a device could not be reached in time.
    /// Latency is pinned to the timeout, loss to 100%.
    pub fn unreachable(device: impl Into<String>, timestamp: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            device: device.into(),
            timestamp,
            reachable: false,
            latency_ms: timeout.as_secs_f64() * 1000.0,
            packet_loss_pct: 100.0,
            bandwidth_mbps: 0.0,
            cpu_pct: None,
            memory_pct: None,
            disk_pct: None,
        }
    }

    pub fn with_resources(mut self, cpu_pct: f64, memory_pct: f64, disk_pct: f64) -> Self {
        self.cpu_pct = Some(cpu_pct);
        self.memory_pct = Some(memory_pct);
        self.disk_pct = Some(disk_pct);
        self
    }

    /// Value of a metric in this sample. Connectivity is 1.0 when unreachable.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Connectivity => Some(if self.reachable { 0.0 } else { 1.0 }),
            Metric::Latency => Some(self.latency_ms),
            Metric::PacketLoss => Some(self.packet_loss_pct),
            Metric::Bandwidth => Some(self.bandwidth_mbps),
            Metric::Cpu => self.cpu_pct,
            Metric::Memory => self.memory_pct,
            Metric::Disk => self.disk_pct,
        }
    }
}

/// Tracked metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Connectivity,
    Latency,
    PacketLoss,
    Bandwidth,
    Cpu,
    Memory,
    Disk,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Connectivity,
        Metric::Latency,
        Metric::PacketLoss,
        Metric::Bandwidth,
        Metric::Cpu,
        Metric::Memory,
        Metric::Disk,
    ];

    pub fn category(self) -> AnomalyCategory {
        match self {
            Metric::Connectivity => AnomalyCategory::Connectivity,
            Metric::Latency => AnomalyCategory::HighLatency,
            Metric::PacketLoss => AnomalyCategory::PacketLoss,
            Metric::Bandwidth => AnomalyCategory::Bandwidth,
            Metric::Cpu | Metric::Memory | Metric::Disk => AnomalyCategory::Resource,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Connectivity => "connectivity",
            Metric::Latency => "latency",
            Metric::PacketLoss => "packet_loss",
            Metric::Bandwidth => "bandwidth",
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::Disk => "disk",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of anomalous condition; issues are deduplicated per (device, category)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    Connectivity,
    HighLatency,
    PacketLoss,
    Bandwidth,
    Resource,
    #[serde(rename = "general_anomaly")]
    General,
}

impl AnomalyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::Connectivity => "connectivity",
            AnomalyCategory::HighLatency => "high_latency",
            AnomalyCategory::PacketLoss => "packet_loss",
            AnomalyCategory::Bandwidth => "bandwidth",
            AnomalyCategory::Resource => "resource",
            AnomalyCategory::General => "general_anomaly",
        }
    }

    /// Operator-facing title
    pub fn title(&self) -> &'static str {
        match self {
            AnomalyCategory::Connectivity => "Device Unreachable",
            AnomalyCategory::HighLatency => "High Network Latency Detected",
            AnomalyCategory::PacketLoss => "Packet Loss Issues Detected",
            AnomalyCategory::Bandwidth => "Abnormal Bandwidth Usage Detected",
            AnomalyCategory::Resource => "Host Resource Pressure Detected",
            AnomalyCategory::General => "Network Anomaly Detected",
        }
    }
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deviation of one metric from its baseline over the trailing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDeviation {
    pub metric: Metric,
    /// Most recent observed value
    pub value: f64,
    pub baseline: f64,
    /// Distance from the baseline in units of spread, before tolerance
    pub z: f64,
    /// Normalized deviation compared against the severity cutoff
    pub deviation: f64,
}

/// Detector output for one device at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub device: String,
    pub scored_at: DateTime<Utc>,
    /// Max of the per-metric deviations
    pub severity: f64,
    pub features: Vec<MetricDeviation>,
}

impl AnomalyScore {
    /// Score with nothing to report (warm-up or empty window)
    pub fn quiet(device: impl Into<String>, scored_at: DateTime<Utc>) -> Self {
        Self {
            device: device.into(),
            scored_at,
            severity: 0.0,
            features: Vec::new(),
        }
    }

    pub fn deviation(&self, metric: Metric) -> Option<&MetricDeviation> {
        self.features.iter().find(|f| f.metric == metric)
    }

    /// Highest deviation among the metrics of a category
    pub fn category_severity(&self, category: AnomalyCategory) -> f64 {
        self.features
            .iter()
            .filter(|f| f.metric.category() == category)
            .map(|f| f.deviation)
            .fold(0.0, f64::max)
    }

    pub fn exceeds(&self, cutoff: f64) -> bool {
        self.severity >= cutoff
    }

    /// Categories whose deviation reaches the cutoff, in metric order
    pub fn candidates(&self, cutoff: f64) -> Vec<AnomalyCategory> {
        let mut categories: Vec<AnomalyCategory> = Vec::new();
        for feature in &self.features {
            let category = feature.metric.category();
            if feature.deviation >= cutoff && !categories.contains(&category) {
                categories.push(category);
            }
        }
        categories
    }
}

/// Issue lifecycle state. `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Active,
    Resolving,
    Resolved,
}

impl IssueStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, IssueStatus::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Active => "active",
            IssueStatus::Resolving => "resolving",
            IssueStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded result of a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionOutcome {
    Success,
    Failure,
    Unknown,
}

/// Operator judgement on whether the detection was real
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Confirmed,
    FalsePositive,
}

/// What a resolve call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    #[serde(default)]
    pub verdict: Option<Verdict>,
}

impl Resolution {
    pub fn new(outcome: ResolutionOutcome, verdict: Option<Verdict>) -> Self {
        Self { outcome, verdict }
    }

    pub fn success() -> Self {
        Self::new(ResolutionOutcome::Success, None)
    }

    /// Operator says the condition never was a problem
    pub fn false_positive() -> Self {
        Self::new(ResolutionOutcome::Unknown, Some(Verdict::FalsePositive))
    }
}

/// Operator-facing unit of state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub device: String,
    pub category: AnomalyCategory,
    pub title: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Number of detections folded into this issue
    pub occurrences: u32,
    pub status: IssueStatus,
    pub outcome: Option<ResolutionOutcome>,
    pub verdict: Option<Verdict>,
    /// Failed automated remediation attempts
    pub failure_count: u32,
    /// Score that opened the issue; its features feed the detector on resolution
    pub origin_score: AnomalyScore,
    pub last_score: AnomalyScore,
    #[serde(default)]
    pub remediation_log: Vec<RemediationRecord>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn new(device: impl Into<String>, category: AnomalyCategory, score: AnomalyScore) -> Self {
        let device = device.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: category.title().to_string(),
            description: describe(&device, category, &score),
            device,
            category,
            detected_at: now,
            last_seen_at: now,
            occurrences: 1,
            status: IssueStatus::Active,
            outcome: None,
            verdict: None,
            failure_count: 0,
            origin_score: score.clone(),
            last_score: score,
            remediation_log: Vec::new(),
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

fn describe(device: &str, category: AnomalyCategory, score: &AnomalyScore) -> String {
    let value_of = |metric: Metric| score.deviation(metric).map(|d| (d.value, d.baseline));

    match category {
        AnomalyCategory::Connectivity => {
            format!("Device {} did not answer telemetry polls.", device)
        }
        AnomalyCategory::HighLatency => match value_of(Metric::Latency) {
            Some((value, baseline)) => format!(
                "Network latency is high ({:.2}ms), exceeding the baseline of {:.2}ms.",
                value, baseline
            ),
            None => "Network latency is high.".to_string(),
        },
        AnomalyCategory::PacketLoss => match value_of(Metric::PacketLoss) {
            Some((value, _)) => format!("Packet loss of {:.2}% detected on the network.", value),
            None => "Packet loss detected on the network.".to_string(),
        },
        AnomalyCategory::Bandwidth => match value_of(Metric::Bandwidth) {
            Some((value, baseline)) => format!(
                "Bandwidth usage of {:.2} Mbps deviates from the baseline of {:.2} Mbps.",
                value, baseline
            ),
            None => "Bandwidth usage deviates from the baseline.".to_string(),
        },
        AnomalyCategory::Resource | AnomalyCategory::General => {
            let metrics = score
                .features
                .iter()
                .filter(|f| category == AnomalyCategory::General || f.metric.category() == category)
                .map(|f| format!("{}: {:.2}", f.metric, f.value))
                .collect::<Vec<_>>()
                .join(", ");
            if category == AnomalyCategory::Resource {
                format!("Host resource usage on {} is abnormal. Metrics: {}", device, metrics)
            } else {
                format!("Unusual network behavior detected. Metrics: {}", metrics)
            }
        }
    }
}

/// Query filter for issue listings
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub device: Option<String>,
    pub status: Option<IssueStatus>,
    /// Only active and resolving issues
    pub open_only: bool,
}

impl IssueFilter {
    pub fn open() -> Self {
        Self {
            open_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        if self.open_only && !issue.is_open() {
            return false;
        }
        if let Some(device) = &self.device {
            if &issue.device != device {
                return false;
            }
        }
        match self.status {
            Some(status) => issue.status == status,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_with(metric: Metric, value: f64, baseline: f64, deviation: f64) -> AnomalyScore {
        AnomalyScore {
            device: "router-1".to_string(),
            scored_at: Utc::now(),
            severity: deviation,
            features: vec![MetricDeviation {
                metric,
                value,
                baseline,
                z: deviation * 3.0,
                deviation,
            }],
        }
    }

    #[test]
    fn test_device_status_ordering() {
        assert_eq!(DeviceStatus::Healthy.worst(DeviceStatus::Warning), DeviceStatus::Warning);
        assert_eq!(DeviceStatus::Error.worst(DeviceStatus::Warning), DeviceStatus::Error);
    }

    #[test]
    fn test_unreachable_sample() {
        let sample = Sample::unreachable("ap-1", Utc::now(), Duration::from_secs(2));
        assert!(!sample.reachable);
        assert_eq!(sample.latency_ms, 2000.0);
        assert_eq!(sample.packet_loss_pct, 100.0);
        assert_eq!(sample.value(Metric::Connectivity), Some(1.0));
        assert_eq!(sample.value(Metric::Cpu), None);
    }

    #[test]
    fn test_candidates_deduplicate_resource_metrics() {
        let mut score = score_with(Metric::Cpu, 99.0, 20.0, 2.0);
        score.features.push(MetricDeviation {
            metric: Metric::Memory,
            value: 97.0,
            baseline: 40.0,
            z: 4.5,
            deviation: 1.5,
        });
        score.features.push(MetricDeviation {
            metric: Metric::Latency,
            value: 11.0,
            baseline: 11.0,
            z: 0.3,
            deviation: 0.1,
        });

        assert_eq!(score.candidates(1.0), vec![AnomalyCategory::Resource]);
        assert_eq!(score.category_severity(AnomalyCategory::Resource), 2.0);
    }

    #[test]
    fn test_issue_description_uses_score() {
        let issue = Issue::new(
            "router-1",
            AnomalyCategory::HighLatency,
            score_with(Metric::Latency, 250.0, 11.0, 4.0),
        );
        assert_eq!(issue.title, "High Network Latency Detected");
        assert!(issue.description.contains("250.00ms"));
        assert_eq!(issue.status, IssueStatus::Active);
        assert_eq!(issue.occurrences, 1);
    }

    #[test]
    fn test_issue_filter() {
        let mut issue = Issue::new(
            "switch-1",
            AnomalyCategory::PacketLoss,
            score_with(Metric::PacketLoss, 30.0, 0.5, 3.0),
        );
        assert!(IssueFilter::open().matches(&issue));

        issue.status = IssueStatus::Resolved;
        assert!(!IssueFilter::open().matches(&issue));

        let by_device = IssueFilter {
            device: Some("router-1".to_string()),
            ..IssueFilter::default()
        };
        assert!(!by_device.matches(&issue));
    }
}
