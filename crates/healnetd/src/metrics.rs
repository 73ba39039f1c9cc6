//! Prometheus metrics for the control loop

use anyhow::Result;
use healnet_common::RemediationOutcome;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct LoopMetrics {
    pub ticks_total: IntCounter,
    pub ticks_over_deadline_total: IntCounter,
    /// Labeled by result: ok / unreachable / skipped
    pub polls_total: IntCounterVec,
    pub issues_opened_total: IntCounterVec,
    /// Labeled by outcome: success / failure / unsupported / refused
    pub remediations_total: IntCounterVec,
    pub model_updates_total: IntCounter,
    pub model_version: IntGauge,
    pub open_issues: IntGauge,

    registry: Registry,
}

impl LoopMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ticks_total = register_int_counter_with_registry!(
            "healnet_ticks_total",
            "Control loop ticks completed",
            registry
        )?;

        let ticks_over_deadline_total = register_int_counter_with_registry!(
            "healnet_ticks_over_deadline_total",
            "Ticks that left device work running past the deadline",
            registry
        )?;

        let polls_total = register_int_counter_vec_with_registry!(
            "healnet_polls_total",
            "Device polls by result",
            &["result"],
            registry
        )?;

        let issues_opened_total = register_int_counter_vec_with_registry!(
            "healnet_issues_opened_total",
            "Issues opened by anomaly category",
            &["category"],
            registry
        )?;

        let remediations_total = register_int_counter_vec_with_registry!(
            "healnet_remediations_total",
            "Remediation attempts by outcome",
            &["outcome"],
            registry
        )?;

        let model_updates_total = register_int_counter_with_registry!(
            "healnet_model_updates_total",
            "Detector model updates applied from feedback",
            registry
        )?;

        let model_version = register_int_gauge_with_registry!(
            "healnet_model_version",
            "Current detector model version",
            registry
        )?;

        let open_issues = register_int_gauge_with_registry!(
            "healnet_open_issues",
            "Active and resolving issues",
            registry
        )?;

        Ok(Self {
            ticks_total,
            ticks_over_deadline_total,
            polls_total,
            issues_opened_total,
            remediations_total,
            model_updates_total,
            model_version,
            open_issues,
            registry,
        })
    }

    pub fn record_remediation(&self, outcome: RemediationOutcome) {
        let label = match outcome {
            RemediationOutcome::Success => "success",
            RemediationOutcome::Failure => "failure",
            RemediationOutcome::Unsupported => "unsupported",
        };
        self.remediations_total.with_label_values(&[label]).inc();
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        let metrics = LoopMetrics::new().unwrap();
        metrics.ticks_total.inc();
        metrics.record_remediation(RemediationOutcome::Success);
        metrics.polls_total.with_label_values(&["ok"]).inc_by(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("healnet_ticks_total 1"));
        assert!(text.contains("healnet_remediations_total{outcome=\"success\"} 1"));
        assert!(text.contains("healnet_polls_total{result=\"ok\"} 3"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = LoopMetrics::new().unwrap();
        let b = LoopMetrics::new().unwrap();
        a.ticks_total.inc();
        assert_eq!(b.ticks_total.get(), 0);
    }
}
