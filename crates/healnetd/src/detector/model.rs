//! Learned detector state and the incremental update rule
//!
//! Each metric carries a tolerance: the number of baseline spreads a value may
//! drift before it counts as deviating. Feedback moves a tolerance a fraction
//! of the way toward a target derived from the labeled score, so repeating the
//! same label converges instead of accumulating. Labels are also remembered by
//! issue id and applied at most once.

use healnet_common::config::DetectionConfig;
use healnet_common::{IssueId, Metric, MetricDeviation, ResolutionOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Number of applied issue ids remembered for idempotence
const APPLIED_HISTORY: usize = 1024;

/// Headroom added above a false positive's deviation
const FALSE_POSITIVE_MARGIN: f64 = 1.25;

/// Fraction of a remediated deviation adopted as the new tolerance
const REMEDIATED_BAND: f64 = 0.75;

/// Fraction of a confirmed-but-unfixed deviation adopted as the new tolerance
const UNRESOLVED_BAND: f64 = 0.5;

/// What the operator or the remediation engine concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Confirmed,
    FalsePositive,
}

/// A labeled outcome for a prior anomaly score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLabel {
    pub issue_id: IssueId,
    pub label: Label,
    pub outcome: Option<ResolutionOutcome>,
    /// Feature vector of the score that opened the issue
    pub features: Vec<MetricDeviation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricModel {
    pub tolerance: f64,
}

/// Detector parameters shared by every scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorModel {
    pub version: u64,
    pub metrics: BTreeMap<Metric, MetricModel>,
    #[serde(default)]
    applied: VecDeque<IssueId>,
}

impl DetectorModel {
    pub fn new(config: &DetectionConfig) -> Self {
        let metrics = Metric::ALL
            .iter()
            .map(|m| {
                (
                    *m,
                    MetricModel {
                        tolerance: config.default_tolerance,
                    },
                )
            })
            .collect();
        Self {
            version: 0,
            metrics,
            applied: VecDeque::new(),
        }
    }

    pub fn tolerance(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).map(|m| m.tolerance)
    }

    pub fn has_applied(&self, issue_id: &IssueId) -> bool {
        self.applied.contains(issue_id)
    }

    /// Apply a label. Returns false when the label was already applied.
    pub fn apply(&mut self, feedback: &FeedbackLabel, config: &DetectionConfig) -> bool {
        if self.has_applied(&feedback.issue_id) {
            return false;
        }

        for feature in &feedback.features {
            // Only metrics that actually drove the detection are retrained
            if feature.deviation < config.severity_cutoff || feature.z <= 0.0 {
                continue;
            }
            let Some(model) = self.metrics.get_mut(&feature.metric) else {
                continue;
            };
            let current = model.tolerance;
            let target = match (feedback.label, feedback.outcome) {
                (Label::FalsePositive, _) => current.max(feature.z * FALSE_POSITIVE_MARGIN),
                (Label::Confirmed, Some(ResolutionOutcome::Success)) => {
                    current.max(feature.z * REMEDIATED_BAND)
                }
                (Label::Confirmed, _) => current.min(feature.z * UNRESOLVED_BAND),
            };
            let target = target.clamp(config.min_tolerance, config.max_tolerance);
            model.tolerance = current + config.learning_rate * (target - current);
        }

        self.applied.push_back(feedback.issue_id);
        if self.applied.len() > APPLIED_HISTORY {
            self.applied.pop_front();
        }
        self.version += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn latency_feature(z: f64, tolerance: f64) -> MetricDeviation {
        MetricDeviation {
            metric: Metric::Latency,
            value: 60.0,
            baseline: 11.0,
            z,
            deviation: z / tolerance,
        }
    }

    fn label(kind: Label, outcome: Option<ResolutionOutcome>, z: f64) -> FeedbackLabel {
        FeedbackLabel {
            issue_id: Uuid::new_v4(),
            label: kind,
            outcome,
            features: vec![latency_feature(z, 3.0)],
        }
    }

    #[test]
    fn test_new_model_uses_default_tolerance() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        for metric in Metric::ALL {
            assert_eq!(model.tolerance(metric), Some(config.default_tolerance));
        }
        assert_eq!(model.version, 0);
    }

    #[test]
    fn test_false_positive_raises_tolerance() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);

        assert!(model.apply(&label(Label::FalsePositive, None, 6.0), &config));
        let tolerance = model.tolerance(Metric::Latency).unwrap();
        assert!(tolerance > config.default_tolerance);
        assert!(tolerance <= 6.0 * FALSE_POSITIVE_MARGIN);
        assert_eq!(model.version, 1);
    }

    #[test]
    fn test_unfixed_confirmation_tightens_tolerance() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);

        model.apply(&label(Label::Confirmed, Some(ResolutionOutcome::Failure), 4.0), &config);
        let tolerance = model.tolerance(Metric::Latency).unwrap();
        assert!(tolerance < config.default_tolerance);
        assert!(tolerance >= config.min_tolerance);
    }

    #[test]
    fn test_same_label_applied_once() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);
        let feedback = label(Label::FalsePositive, None, 8.0);

        assert!(model.apply(&feedback, &config));
        let after_first = model.clone();
        for _ in 0..10 {
            assert!(!model.apply(&feedback, &config));
        }
        assert_eq!(model, after_first);
    }

    #[test]
    fn test_repeated_identical_evidence_is_bounded() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);

        for _ in 0..200 {
            model.apply(&label(Label::FalsePositive, None, 6.0), &config);
        }
        let tolerance = model.tolerance(Metric::Latency).unwrap();
        assert!(tolerance <= 6.0 * FALSE_POSITIVE_MARGIN + 1e-9);
        assert!(tolerance <= config.max_tolerance);
    }

    #[test]
    fn test_metrics_below_cutoff_untouched() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);
        let mut feedback = label(Label::FalsePositive, None, 6.0);
        feedback.features.push(MetricDeviation {
            metric: Metric::Bandwidth,
            value: 20.0,
            baseline: 19.0,
            z: 0.2,
            deviation: 0.07,
        });

        model.apply(&feedback, &config);
        assert_eq!(model.tolerance(Metric::Bandwidth), Some(config.default_tolerance));
    }

    #[test]
    fn test_applied_history_is_capped() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);
        for _ in 0..(APPLIED_HISTORY + 10) {
            model.apply(&label(Label::Confirmed, Some(ResolutionOutcome::Success), 1.0), &config);
        }
        assert_eq!(model.applied.len(), APPLIED_HISTORY);
    }
}
