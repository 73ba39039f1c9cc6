//! Remediation action types
//!
//! Actions are a closed set of tagged variants. The daemon's registry maps an
//! anomaly category to one plan; there is no open-ended dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AnomalyCategory, IssueId};

/// Corrective action with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Flush the local resolver cache
    FlushDns,
    /// Flush DNS and release/renew the DHCP lease
    ResetNetwork,
    /// Bring an interface down and up again
    RestartInterface { interface: String },
    /// Disable and re-enable the network adapter
    ResetAdapter { interface: String },
    /// Drop the neighbour/ARP cache
    ClearCache,
    /// Replace the default route
    RerouteTraffic { via: String },
    /// Operator-supplied commands, run in order
    Shell { commands: Vec<String> },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::FlushDns => "flush_dns",
            ActionKind::ResetNetwork => "reset_network",
            ActionKind::RestartInterface { .. } => "restart_interface",
            ActionKind::ResetAdapter { .. } => "reset_adapter",
            ActionKind::ClearCache => "clear_cache",
            ActionKind::RerouteTraffic { .. } => "reroute_traffic",
            ActionKind::Shell { .. } => "shell",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry entry: how to remediate one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub category: AnomalyCategory,
    pub name: String,
    pub action: ActionKind,
    /// Seconds to wait after the action before declaring the outcome
    #[serde(default)]
    pub verification_wait_secs: u64,
}

impl RemediationPlan {
    pub fn new(category: AnomalyCategory, name: impl Into<String>, action: ActionKind) -> Self {
        Self {
            category,
            name: name.into(),
            action,
            verification_wait_secs: 0,
        }
    }
}

/// A plan bound to a concrete issue and device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub issue_id: IssueId,
    pub device: String,
    pub plan: String,
    pub kind: ActionKind,
}

/// Outcome of one remediation attempt, appended to the issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub action: RemediationAction,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub messages: Vec<String>,
}

/// Result of `attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationOutcome {
    Success,
    Failure,
    /// No plan registered for the category; the issue stays active
    Unsupported,
}

/// Built-in strategies
pub fn default_plans() -> Vec<RemediationPlan> {
    vec![
        RemediationPlan {
            category: AnomalyCategory::HighLatency,
            name: "Flush DNS and Reset Network".to_string(),
            action: ActionKind::ResetNetwork,
            verification_wait_secs: 5,
        },
        RemediationPlan {
            category: AnomalyCategory::PacketLoss,
            name: "Reset Network Adapter".to_string(),
            action: ActionKind::ResetAdapter {
                interface: "eth0".to_string(),
            },
            verification_wait_secs: 5,
        },
        RemediationPlan {
            category: AnomalyCategory::Connectivity,
            name: "Restart Interface".to_string(),
            action: ActionKind::RestartInterface {
                interface: "eth0".to_string(),
            },
            verification_wait_secs: 5,
        },
        RemediationPlan {
            category: AnomalyCategory::General,
            name: "Basic Network Troubleshooting".to_string(),
            action: ActionKind::FlushDns,
            verification_wait_secs: 3,
        },
    ]
}
