//! Control loop
//!
//! Each tick polls every device concurrently (bounded by a semaphore), appends
//! the sample, scores the window, reports candidate issues and dispatches
//! remediation. A device whose work from an earlier tick is still running is
//! skipped, which keeps its samples in order. Work still running at the tick
//! deadline is detached and finishes on its own.

use chrono::{DateTime, Utc};
use healnet_common::config::MonitorConfig;
use healnet_common::{
    Device, DeviceStatus, HealError, IssueFilter, IssueStatus, RemediationOutcome,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::detector::AnomalyDetector;
use crate::issues::IssueManager;
use crate::metrics::LoopMetrics;
use crate::remediation::RemediationEngine;
use crate::store::MetricsStore;
use crate::telemetry::{poll_device, TelemetrySource};

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub polled: usize,
    pub unreachable: usize,
    /// Devices skipped because earlier work was still running
    pub skipped: usize,
    /// Device tasks left running at the deadline
    pub stragglers: usize,
    pub candidates: usize,
    pub remediations: Vec<RemediationOutcome>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct DeviceOutcome {
    reachable: bool,
    candidates: usize,
    remediations: Vec<RemediationOutcome>,
}

impl TickReport {
    fn absorb(&mut self, outcome: DeviceOutcome) {
        self.polled += 1;
        if !outcome.reachable {
            self.unreachable += 1;
        }
        self.candidates += outcome.candidates;
        self.remediations.extend(outcome.remediations);
    }
}

/// Marks a device busy until dropped
struct InFlight {
    busy: Arc<Mutex<HashSet<String>>>,
    device: String,
}

impl InFlight {
    fn claim(busy: &Arc<Mutex<HashSet<String>>>, device: &str) -> Option<Self> {
        let mut set = busy.lock().ok()?;
        if !set.insert(device.to_string()) {
            return None;
        }
        Some(Self {
            busy: Arc::clone(busy),
            device: device.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut set) = self.busy.lock() {
            set.remove(&self.device);
        }
    }
}

/// Per-device work shared by every task
#[derive(Clone)]
struct Pipeline {
    source: Arc<dyn TelemetrySource>,
    store: Arc<MetricsStore>,
    detector: Arc<AnomalyDetector>,
    issues: Arc<IssueManager>,
    remediation: Arc<RemediationEngine>,
    metrics: LoopMetrics,
    poll_timeout: Duration,
    auto_remediate: bool,
}

impl Pipeline {
    async fn process(&self, device: Device) -> DeviceOutcome {
        let sample = poll_device(self.source.as_ref(), &device, self.poll_timeout).await;
        let mut outcome = DeviceOutcome {
            reachable: sample.reachable,
            ..DeviceOutcome::default()
        };
        let result = if sample.reachable { "ok" } else { "unreachable" };
        self.metrics.polls_total.with_label_values(&[result]).inc();

        if let Err(e) = self.store.append(sample).await {
            warn!("Dropping sample for {}: {}", device.name, e);
            return outcome;
        }

        let window = self.store.recent_window(&device.name).await;
        let score = self.detector.score(&device.name, &window);
        let cutoff = self.detector.config().severity_cutoff;

        for category in score.candidates(cutoff) {
            outcome.candidates += 1;
            let issue = self
                .issues
                .report_candidate(&device.name, category, score.clone())
                .await;
            if issue.occurrences == 1 {
                self.metrics
                    .issues_opened_total
                    .with_label_values(&[category.as_str()])
                    .inc();
            }

            if !self.auto_remediate
                || issue.status != IssueStatus::Active
                || self.remediation.plan_for(category).is_none()
            {
                continue;
            }
            match self.remediation.attempt(issue.id).await {
                Ok(result) => {
                    self.metrics.record_remediation(result);
                    outcome.remediations.push(result);
                }
                Err(HealError::RetryLimitReached { issue, attempts }) => {
                    debug!(
                        "Issue {} awaits manual resolution after {} failed attempts",
                        issue, attempts
                    );
                }
                Err(e @ (HealError::AlreadyInProgress(_) | HealError::AlreadyResolved(_))) => {
                    debug!("{}", e);
                }
                Err(e) => {
                    self.metrics
                        .remediations_total
                        .with_label_values(&["refused"])
                        .inc();
                    warn!("Remediation of issue {} not attempted: {}", issue.id, e);
                }
            }
        }
        outcome
    }
}

pub struct Monitor {
    config: MonitorConfig,
    devices: RwLock<Vec<Device>>,
    pipeline: Pipeline,
    permits: Arc<Semaphore>,
    busy: Arc<Mutex<HashSet<String>>>,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        auto_remediate: bool,
        devices: Vec<Device>,
        source: Arc<dyn TelemetrySource>,
        store: Arc<MetricsStore>,
        detector: Arc<AnomalyDetector>,
        issues: Arc<IssueManager>,
        remediation: Arc<RemediationEngine>,
        metrics: LoopMetrics,
    ) -> Self {
        let permits = devices.len().min(config.max_concurrency).max(1);
        let pipeline = Pipeline {
            source,
            store,
            detector,
            issues,
            remediation,
            metrics,
            poll_timeout: config.poll_timeout(),
            auto_remediate,
        };
        Self {
            config,
            devices: RwLock::new(devices),
            pipeline,
            permits: Arc::new(Semaphore::new(permits)),
            busy: Arc::new(Mutex::new(HashSet::new())),
            last_tick: RwLock::new(None),
        }
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.clone()
    }

    pub async fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.last_tick.read().await
    }

    /// Run one round of polling, detection and remediation
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let devices = self.devices().await;
        let mut report = TickReport::default();
        let mut tasks = JoinSet::new();

        for device in devices {
            let Some(guard) = InFlight::claim(&self.busy, &device.name) else {
                debug!("{} still busy from an earlier tick, skipping", device.name);
                self.pipeline
                    .metrics
                    .polls_total
                    .with_label_values(&["skipped"])
                    .inc();
                report.skipped += 1;
                continue;
            };
            let pipeline = self.pipeline.clone();
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let _guard = guard;
                let _permit = permits.acquire_owned().await.ok();
                pipeline.process(device).await
            });
        }

        let deadline = sleep(self.config.tick_deadline());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => report.absorb(outcome),
                    Some(Err(e)) => error!("Device task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    report.stragglers = tasks.len();
                    warn!(
                        "Tick deadline of {}ms passed with {} devices still working",
                        self.config.tick_deadline_ms,
                        report.stragglers
                    );
                    self.pipeline.metrics.ticks_over_deadline_total.inc();
                    tasks.detach_all();
                    break;
                }
            }
        }

        self.refresh_statuses().await;
        *self.last_tick.write().await = Some(Utc::now());
        self.pipeline.metrics.ticks_total.inc();

        report.elapsed = started.elapsed();
        debug!(
            "Tick: {} polled, {} unreachable, {} skipped, {} candidates in {:?}",
            report.polled, report.unreachable, report.skipped, report.candidates, report.elapsed
        );
        report
    }

    /// Recompute every device's status from its latest sample and open issues
    async fn refresh_statuses(&self) {
        let open = self.pipeline.issues.list(&IssueFilter::open()).await;
        self.pipeline.metrics.open_issues.set(open.len() as i64);
        let with_issues: HashSet<&str> = open.iter().map(|i| i.device.as_str()).collect();

        let mut devices = self.devices.write().await;
        for device in devices.iter_mut() {
            let mut status = match self.pipeline.store.latest(&device.name).await {
                Some(sample) if !sample.reachable => DeviceStatus::Error,
                Some(sample) => self
                    .config
                    .status
                    .device_status(sample.latency_ms, sample.packet_loss_pct),
                None => device.status,
            };
            if with_issues.contains(device.name.as_str()) {
                status = status.worst(DeviceStatus::Warning);
            }
            if status != device.status {
                info!("{} is now {} (was {})", device.name, status, device.status);
                device.status = status;
            }
        }
    }

    /// Tick on the configured interval until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Control loop started: {} devices every {}s",
            self.devices.read().await.len(),
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Control loop stopped");
    }
}
