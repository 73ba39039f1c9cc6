//! Feedback loop: resolved issues retrain the detector
//!
//! Runs as its own task so detection never waits on training. Delivery is
//! best-effort: labels still queued at shutdown are dropped, while the
//! resolved issues themselves remain in the journal.

use chrono::Utc;
use healnet_common::{Issue, ResolutionOutcome, Verdict};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detector::{AnomalyDetector, FeedbackLabel, Label};
use crate::issues::FeedbackSender;
use crate::metrics::LoopMetrics;
use crate::persistence::{Persistence, TrainingEvent};

pub type FeedbackReceiver = mpsc::UnboundedReceiver<Issue>;

/// Channel connecting the issue manager to the feedback loop
pub fn channel() -> (FeedbackSender, FeedbackReceiver) {
    mpsc::unbounded_channel()
}

/// Training label for a resolved issue, if it carries enough signal
pub fn label_for(issue: &Issue) -> Option<FeedbackLabel> {
    let label = match (issue.verdict, issue.outcome) {
        (Some(Verdict::FalsePositive), _) => Label::FalsePositive,
        (Some(Verdict::Confirmed), _) | (_, Some(ResolutionOutcome::Success)) => Label::Confirmed,
        _ => return None,
    };
    Some(FeedbackLabel {
        issue_id: issue.id,
        label,
        outcome: issue.outcome,
        features: issue.origin_score.features.clone(),
    })
}

pub struct FeedbackLoop {
    detector: Arc<AnomalyDetector>,
    persistence: Arc<dyn Persistence>,
    metrics: Option<LoopMetrics>,
}

impl FeedbackLoop {
    pub fn new(detector: Arc<AnomalyDetector>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            detector,
            persistence,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LoopMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Train on one resolved issue. Returns the new model version when the
    /// detector changed.
    pub async fn handle(&self, issue: &Issue) -> Option<u64> {
        let Some(label) = label_for(issue) else {
            debug!("Issue {} resolved without a usable label", issue.id);
            return None;
        };
        let version = self.detector.update(&label)?;

        if let Some(metrics) = &self.metrics {
            metrics.model_updates_total.inc();
            metrics.model_version.set(version as i64);
        }

        let snapshot = self.detector.snapshot();
        if let Err(e) = self.persistence.save_model(&snapshot).await {
            warn!("Failed to save detector model v{}: {:#}", version, e);
        }
        let event = TrainingEvent {
            timestamp: Utc::now(),
            issue_id: issue.id,
            label: label.label,
            model_version: version,
        };
        if let Err(e) = self.persistence.append_training(&event).await {
            warn!("Failed to append training history: {:#}", e);
        }
        Some(version)
    }

    /// Consume resolved issues until every sender is dropped
    pub fn spawn(self, mut rx: FeedbackReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Feedback loop started");
            while let Some(issue) = rx.recv().await {
                self.handle(&issue).await;
            }
            info!("Feedback loop stopped");
        })
    }
}
