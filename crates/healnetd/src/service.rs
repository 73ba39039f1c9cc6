//! Query and command surface for presentation layers
//!
//! Every call returns plain views. Errors never cross this boundary: commands
//! answer with a [`CommandResult`].

use healnet_common::config::{MonitorConfig, StatusThresholds};
use healnet_common::{
    CommandResult, DeviceView, HealError, HistoryPoint, IssueFilter, IssueId, IssueView,
    NetworkStatus, OverallHealth, Resolution, ResolutionOutcome, Sample, Verdict,
};
use std::sync::Arc;
use tracing::warn;

use crate::issues::IssueManager;
use crate::monitor::Monitor;
use crate::store::MetricsStore;

#[derive(Clone)]
pub struct HealingService {
    monitor: Arc<Monitor>,
    store: Arc<MetricsStore>,
    issues: Arc<IssueManager>,
    history_limit: usize,
    thresholds: StatusThresholds,
}

impl HealingService {
    pub fn new(
        monitor: Arc<Monitor>,
        store: Arc<MetricsStore>,
        issues: Arc<IssueManager>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            monitor,
            store,
            issues,
            history_limit: config.history_limit,
            thresholds: config.status.clone(),
        }
    }

    pub async fn list_devices(&self) -> Vec<DeviceView> {
        self.monitor.devices().await.iter().map(DeviceView::from).collect()
    }

    /// Active and resolving issues, newest first
    pub async fn list_active_issues(&self) -> Vec<IssueView> {
        self.issues
            .list(&IssueFilter::open())
            .await
            .iter()
            .map(IssueView::from)
            .collect()
    }

    /// Latest points for a device; `None` uses the configured default limit
    pub async fn history(&self, device: &str, limit: Option<usize>) -> Vec<HistoryPoint> {
        let limit = limit.unwrap_or(self.history_limit).min(self.store.capacity());
        self.store.history(device, limit).await
    }

    /// Resolve an issue on behalf of an operator
    pub async fn resolve(
        &self,
        issue_id: &str,
        outcome: ResolutionOutcome,
        verdict: Option<Verdict>,
    ) -> CommandResult {
        let id = match IssueId::parse_str(issue_id.trim()) {
            Ok(id) => id,
            Err(_) => return CommandResult::failed(format!("Invalid issue id: {}", issue_id)),
        };

        match self.issues.resolve(id, Resolution::new(outcome, verdict)).await {
            Ok(issue) => CommandResult::ok(format!("Issue '{}' marked as resolved", issue.title)),
            Err(e @ (HealError::NotFound(_) | HealError::AlreadyResolved(_))) => {
                CommandResult::failed(e.to_string())
            }
            Err(e) => {
                warn!("Resolve of {} failed: {}", id, e);
                CommandResult::failed(e.to_string())
            }
        }
    }

    /// Network-wide rollup over each device's latest sample
    pub async fn network_status(&self) -> NetworkStatus {
        let devices = self.monitor.devices().await;
        let mut latest = Vec::new();
        for device in &devices {
            if let Some(sample) = self.store.latest(&device.name).await {
                if sample.reachable {
                    latest.push(sample);
                }
            }
        }

        let connected = latest.len();
        let mean = |f: fn(&Sample) -> f64| -> f64 {
            if connected == 0 {
                0.0
            } else {
                latest.iter().map(f).sum::<f64>() / connected as f64
            }
        };
        let latency = mean(|s| s.latency_ms);
        let packet_loss = mean(|s| s.packet_loss_pct);
        let bandwidth_usage = mean(|s| s.bandwidth_mbps);

        let last_updated = self.monitor.last_tick().await;
        let overall_health = if last_updated.is_some() && connected == 0 && !devices.is_empty() {
            OverallHealth::Critical
        } else {
            self.thresholds.classify(latency, packet_loss)
        };

        NetworkStatus {
            last_updated,
            overall_health,
            latency,
            packet_loss,
            bandwidth_usage,
            connected_devices: connected,
            total_devices: devices.len(),
        }
    }
}
