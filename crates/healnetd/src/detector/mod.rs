//! Anomaly detector
//!
//! Scoring reads an immutable model snapshot; feedback builds a new model and
//! swaps it in. A scorer therefore always sees one complete model version.

pub mod model;
pub mod scoring;

pub use model::{DetectorModel, FeedbackLabel, Label, MetricModel};

use healnet_common::config::DetectionConfig;
use healnet_common::{AnomalyScore, HealError, HealResult, Sample};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Shared detector with copy-on-write model updates
pub struct AnomalyDetector {
    config: DetectionConfig,
    model: RwLock<Arc<DetectorModel>>,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig) -> Self {
        let model = DetectorModel::new(&config);
        Self::with_model(config, model)
    }

    /// Start from a previously persisted model
    pub fn with_model(config: DetectionConfig, model: DetectorModel) -> Self {
        Self {
            config,
            model: RwLock::new(Arc::new(model)),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Current model version
    pub fn snapshot(&self) -> Arc<DetectorModel> {
        match self.model.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Score a window against the current model
    pub fn score(&self, device: &str, window: &[Sample]) -> AnomalyScore {
        let model = self.snapshot();
        let score = scoring::score(&model, &self.config, device, window);
        if score.exceeds(self.config.severity_cutoff) {
            debug!(
                "{} scored {:.2} against model v{}",
                device, score.severity, model.version
            );
        }
        score
    }

    /// Apply a feedback label. Returns the new version, or None when the label
    /// had already been applied.
    ///
    /// The next model is built from a snapshot outside the lock and installed
    /// only if no other update landed in between; otherwise it is rebuilt.
    pub fn update(&self, feedback: &FeedbackLabel) -> Option<u64> {
        loop {
            let base = self.snapshot();
            let mut next = DetectorModel::clone(&base);
            if !next.apply(feedback, &self.config) {
                debug!("Feedback for issue {} already applied", feedback.issue_id);
                return None;
            }
            let version = next.version;
            match self.install(next, base.version) {
                Ok(()) => {
                    info!(
                        "Detector model updated to v{} from {:?} feedback on issue {}",
                        version, feedback.label, feedback.issue_id
                    );
                    return Some(version);
                }
                Err(e) => debug!("{}, rebuilding", e),
            }
        }
    }

    /// Replace the model if the current version is still `expected_version`
    fn install(&self, model: DetectorModel, expected_version: u64) -> HealResult<()> {
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.version != expected_version {
            return Err(HealError::ModelUpdateConflict {
                expected: expected_version,
                found: guard.version,
            });
        }
        *guard = Arc::new(model);
        Ok(())
    }
}
