//! Daemon assembly
//!
//! Wires the store, detector, issue manager, remediation engine, feedback loop
//! and control loop together, restoring journaled state first.

use anyhow::{Context, Result};
use healnet_common::Config;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::detector::AnomalyDetector;
use crate::feedback::{self, FeedbackLoop};
use crate::issues::IssueManager;
use crate::metrics::LoopMetrics;
use crate::monitor::{Monitor, TickReport};
use crate::persistence::Persistence;
use crate::remediation::{ActionExecutor, RemediationEngine};
use crate::service::HealingService;
use crate::store::MetricsStore;
use crate::telemetry::TelemetrySource;

pub struct HealDaemon {
    monitor: Arc<Monitor>,
    service: HealingService,
    detector: Arc<AnomalyDetector>,
    issues: Arc<IssueManager>,
    metrics: LoopMetrics,
    feedback: JoinHandle<()>,
}

impl HealDaemon {
    /// Build the daemon. The config must already be validated.
    pub async fn new(
        config: Config,
        source: Arc<dyn TelemetrySource>,
        executor: Arc<dyn ActionExecutor>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        info!("Initializing healnet daemon");
        let metrics = LoopMetrics::new().context("Failed to register metrics")?;

        let detector = match persistence.load_model().await {
            Ok(Some(model)) => {
                info!("Loaded detector model v{}", model.version);
                metrics.model_version.set(model.version as i64);
                AnomalyDetector::with_model(config.detection.clone(), model)
            }
            Ok(None) => AnomalyDetector::new(config.detection.clone()),
            Err(e) => {
                warn!("Failed to load detector model, starting fresh: {:#}", e);
                AnomalyDetector::new(config.detection.clone())
            }
        };
        let detector = Arc::new(detector);

        let (tx, rx) = feedback::channel();
        let issues = Arc::new(IssueManager::new(Arc::clone(&persistence), Some(tx)));
        let journaled = persistence
            .load_issues()
            .await
            .context("Failed to load issue journal")?;
        issues.restore(journaled).await;

        let feedback = FeedbackLoop::new(Arc::clone(&detector), Arc::clone(&persistence))
            .with_metrics(metrics.clone())
            .spawn(rx);

        let store = Arc::new(MetricsStore::new(config.monitor.window_capacity));
        let remediation = Arc::new(RemediationEngine::new(
            config.remediation.clone(),
            Arc::clone(&issues),
            executor,
        ));
        let monitor = Arc::new(Monitor::new(
            config.monitor.clone(),
            config.remediation.auto_remediate,
            config.devices(),
            source,
            Arc::clone(&store),
            Arc::clone(&detector),
            Arc::clone(&issues),
            remediation,
            metrics.clone(),
        ));
        let service = HealingService::new(
            Arc::clone(&monitor),
            store,
            Arc::clone(&issues),
            &config.monitor,
        );

        info!(
            "healnet ready: {} devices, auto_remediate={}, dry_run={}",
            config.devices.len(),
            config.remediation.auto_remediate,
            config.remediation.dry_run
        );

        Ok(Self {
            monitor,
            service,
            detector,
            issues,
            metrics,
            feedback,
        })
    }

    pub fn service(&self) -> &HealingService {
        &self.service
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    pub fn issues(&self) -> &Arc<IssueManager> {
        &self.issues
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Single tick, for one-shot runs and tests
    pub async fn tick(&self) -> TickReport {
        self.monitor.tick().await
    }

    /// Run until shutdown is signalled. Feedback still queued is dropped.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        self.monitor.run(shutdown).await;
        self.feedback.abort();
        info!("healnet stopped");
    }
}
