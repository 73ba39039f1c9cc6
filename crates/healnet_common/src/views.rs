//! Boundary views handed to presentation and transport layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Device, DeviceStatus, Issue, IssueId, IssueStatus, Sample};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub name: String,
    pub address: String,
    pub status: DeviceStatus,
}

impl From<&Device> for DeviceView {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name.clone(),
            address: device.address.clone(),
            status: device.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueView {
    pub id: IssueId,
    pub title: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub status: IssueStatus,
}

impl From<&Issue> for IssueView {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id,
            title: issue.title.clone(),
            description: issue.description.clone(),
            detected_at: issue.detected_at,
            status: issue.status,
        }
    }
}

/// One point of the metrics history chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub latency: f64,
    pub packet_loss: f64,
    pub bandwidth_usage: f64,
}

impl From<&Sample> for HistoryPoint {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp,
            latency: sample.latency_ms,
            packet_loss: sample.packet_loss_pct,
            bandwidth_usage: sample.bandwidth_mbps,
        }
    }
}

/// Structured reply to a command; never an error across the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Network-wide health rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Good,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub last_updated: Option<DateTime<Utc>>,
    pub overall_health: OverallHealth,
    /// Mean over reachable devices' latest samples
    pub latency: f64,
    pub packet_loss: f64,
    pub bandwidth_usage: f64,
    pub connected_devices: usize,
    pub total_devices: usize,
}
