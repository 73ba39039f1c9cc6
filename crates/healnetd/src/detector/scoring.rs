//! Deterministic scoring of a metrics window
//!
//! The window is split into a trailing run of `confirm_samples` samples and a
//! baseline made of everything before it. For every metric, each sample of the
//! trailing run gets a deviation:
//!
//! ```text
//! deviation = |x - mean(baseline)| / (max(stddev(baseline), floor) * tolerance)
//! ```
//!
//! raised to `x / ceiling` when the value crosses an absolute ceiling. The
//! metric's deviation is the minimum over the trailing run, so every sample in
//! the run has to deviate. Severity is the maximum over metrics, so a single
//! misbehaving metric is enough to trigger detection.
//!
//! Connectivity needs no baseline: the expected value is "reachable".
//! Latency, loss and resource metrics only count upward drift; bandwidth
//! counts both directions.

use chrono::{DateTime, Utc};
use healnet_common::config::DetectionConfig;
use healnet_common::{AnomalyScore, Metric, MetricDeviation, Sample};

use super::model::DetectorModel;

/// Score a device's window against the model. Pure: identical inputs give an
/// identical score.
pub fn score(
    model: &DetectorModel,
    config: &DetectionConfig,
    device: &str,
    window: &[Sample],
) -> AnomalyScore {
    let scored_at = window
        .last()
        .map(|s| s.timestamp)
        .unwrap_or_else(DateTime::<Utc>::default);

    let run = config.confirm_samples.max(1);
    if window.len() < run {
        return AnomalyScore::quiet(device, scored_at);
    }
    let (baseline, trailing) = window.split_at(window.len() - run);

    let features: Vec<MetricDeviation> = Metric::ALL
        .iter()
        .filter_map(|metric| {
            let tolerance = model.tolerance(*metric).unwrap_or(config.default_tolerance);
            match metric {
                Metric::Connectivity => score_connectivity(config, tolerance, trailing),
                _ => score_statistical(*metric, config, tolerance, baseline, trailing),
            }
        })
        .collect();

    let severity = features.iter().map(|f| f.deviation).fold(0.0, f64::max);

    AnomalyScore {
        device: device.to_string(),
        scored_at,
        severity,
        features,
    }
}

fn score_connectivity(
    config: &DetectionConfig,
    tolerance: f64,
    trailing: &[Sample],
) -> Option<MetricDeviation> {
    let floor = config.floors.for_metric(Metric::Connectivity);
    let values: Vec<f64> = trailing
        .iter()
        .map(|s| s.value(Metric::Connectivity).unwrap_or(0.0))
        .collect();
    let z = min_of(values.iter().map(|v| v / floor));
    let last = *values.last()?;

    Some(MetricDeviation {
        metric: Metric::Connectivity,
        value: last,
        baseline: 0.0,
        z,
        deviation: z / tolerance,
    })
}

fn score_statistical(
    metric: Metric,
    config: &DetectionConfig,
    tolerance: f64,
    baseline: &[Sample],
    trailing: &[Sample],
) -> Option<MetricDeviation> {
    // An unreachable sample says nothing about latency or load; connectivity covers it
    if trailing.iter().any(|s| !s.reachable) {
        return None;
    }
    let values: Vec<f64> = trailing
        .iter()
        .map(|s| s.value(metric))
        .collect::<Option<Vec<f64>>>()?;

    let history: Vec<f64> = baseline
        .iter()
        .filter(|s| s.reachable)
        .filter_map(|s| s.value(metric))
        .collect();
    let stats = if history.len() >= config.min_baseline_samples {
        Some(mean_and_stddev(&history))
    } else {
        None
    };
    let ceiling = config.ceilings.for_metric(metric);
    if stats.is_none() && ceiling.is_none() {
        return None;
    }

    let floor = config.floors.for_metric(metric);
    let distance = |x: f64| -> f64 {
        match stats {
            Some((mean, stddev)) => {
                let delta = if two_sided(metric) {
                    (x - mean).abs()
                } else {
                    (x - mean).max(0.0)
                };
                delta / stddev.max(floor)
            }
            None => 0.0,
        }
    };
    let over_ceiling = |x: f64| -> f64 {
        match ceiling {
            Some(limit) if x >= limit => x / limit,
            _ => 0.0,
        }
    };

    let z = min_of(values.iter().map(|x| distance(*x)));
    let deviation = min_of(
        values
            .iter()
            .map(|x| (distance(*x) / tolerance).max(over_ceiling(*x))),
    );
    let last = *values.last()?;

    Some(MetricDeviation {
        metric,
        value: last,
        baseline: stats.map(|(mean, _)| mean).or(ceiling).unwrap_or(0.0),
        z,
        deviation,
    })
}

fn two_sided(metric: Metric) -> bool {
    matches!(metric, Metric::Bandwidth)
}

fn min_of(values: impl Iterator<Item = f64>) -> f64 {
    let min = values.fold(f64::INFINITY, f64::min);
    if min.is_finite() {
        min
    } else {
        0.0
    }
}

/// Population mean and standard deviation
fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use healnet_common::AnomalyCategory;

    fn window(latencies: &[f64]) -> Vec<Sample> {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        latencies
            .iter()
            .enumerate()
            .map(|(i, l)| Sample::new("router-1", base + Duration::seconds(5 * i as i64), *l, 0.0, 20.0))
            .collect()
    }

    fn unreachable(n: usize) -> Vec<Sample> {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Sample::unreachable(
                    "ap-1",
                    base + Duration::seconds(5 * i as i64),
                    std::time::Duration::from_secs(2),
                )
            })
            .collect()
    }

    #[test]
    fn test_latency_spike_needs_full_trailing_run() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);

        // Not enough baseline yet
        for len in 1..6 {
            let samples = window(&[10.0, 12.0, 11.0, 60.0, 58.0, 61.0][..len]);
            let score = score(&model, &config, "router-1", &samples);
            assert!(score.candidates(config.severity_cutoff).is_empty(), "len {}", len);
        }

        let samples = window(&[10.0, 12.0, 11.0, 60.0, 58.0, 61.0]);
        let score = score(&model, &config, "router-1", &samples);
        assert_eq!(score.candidates(config.severity_cutoff), vec![AnomalyCategory::HighLatency]);

        let latency = score.deviation(Metric::Latency).unwrap();
        assert_relative_eq!(latency.baseline, 11.0);
        // min over the run is 58ms: (58 - 11) / max(0.816, 5.0)
        assert_relative_eq!(latency.z, 47.0 / 5.0, epsilon = 1e-9);
        assert_relative_eq!(latency.deviation, 47.0 / 15.0, epsilon = 1e-9);
        assert_relative_eq!(score.severity, latency.deviation);
    }

    #[test]
    fn test_single_spike_is_not_an_anomaly() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        let samples = window(&[10.0, 12.0, 11.0, 10.0, 60.0, 11.0]);
        let score = score(&model, &config, "router-1", &samples);
        assert!(!score.exceeds(config.severity_cutoff));
    }

    #[test]
    fn test_latency_drop_is_ignored() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        let samples = window(&[80.0, 82.0, 81.0, 10.0, 11.0, 10.0]);
        let score = score(&model, &config, "router-1", &samples);
        assert_eq!(score.deviation(Metric::Latency).unwrap().deviation, 0.0);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        let samples = window(&[10.0, 12.0, 11.0, 60.0, 58.0, 61.0, 13.0]);

        let first = score(&model, &config, "router-1", &samples);
        let second = score(&model, &config, "router-1", &samples);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreachable_run_scores_connectivity_only() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);

        let score = score(&model, &config, "ap-1", &unreachable(3));
        assert_eq!(score.candidates(config.severity_cutoff), vec![AnomalyCategory::Connectivity]);
        assert!(score.deviation(Metric::Latency).is_none());

        let short = super::score(&model, &config, "ap-1", &unreachable(2));
        assert_eq!(short.severity, 0.0);
    }

    #[test]
    fn test_ceiling_triggers_without_baseline() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        let samples = window(&[900.0, 950.0, 1000.0]);

        let score = score(&model, &config, "router-1", &samples);
        assert!(score.candidates(config.severity_cutoff).contains(&AnomalyCategory::HighLatency));
        assert_relative_eq!(score.deviation(Metric::Latency).unwrap().deviation, 1.8);
    }

    #[test]
    fn test_resource_metrics_scored_when_present() {
        let config = DetectionConfig::default();
        let model = DetectorModel::new(&config);
        let mut samples = window(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0]);
        for (i, sample) in samples.iter_mut().enumerate() {
            let cpu = if i < 3 { 20.0 } else { 90.0 };
            *sample = sample.clone().with_resources(cpu, 40.0, 50.0);
        }

        let score = score(&model, &config, "router-1", &samples);
        assert_eq!(score.candidates(config.severity_cutoff), vec![AnomalyCategory::Resource]);
    }

    #[test]
    fn test_higher_tolerance_lowers_deviation() {
        let config = DetectionConfig::default();
        let mut model = DetectorModel::new(&config);
        let samples = window(&[10.0, 12.0, 11.0, 60.0, 58.0, 61.0]);
        let before = score(&model, &config, "router-1", &samples);

        if let Some(latency) = model.metrics.get_mut(&Metric::Latency) {
            latency.tolerance = 6.0;
        }
        let after = score(&model, &config, "router-1", &samples);
        assert!(
            after.deviation(Metric::Latency).unwrap().deviation
                < before.deviation(Metric::Latency).unwrap().deviation
        );
    }
}
