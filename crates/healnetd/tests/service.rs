//! Service boundary, concurrency and restart tests

use healnet_common::config::DeviceConfig;
use healnet_common::{
    AnomalyCategory, AnomalyScore, Config, IssueFilter, IssueStatus, OverallHealth,
    ResolutionOutcome, Verdict,
};
use healnetd::detector::Label;
use healnetd::issues::IssueManager;
use healnetd::persistence::{JsonPersistence, MemoryPersistence, Persistence};
use healnetd::remediation::FakeExecutor;
use healnetd::telemetry::{Scripted, ScriptedSource};
use healnetd::HealDaemon;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(devices: &[&str]) -> Config {
    let mut config = Config {
        devices: devices
            .iter()
            .map(|name| DeviceConfig::new(*name, "192.0.2.20"))
            .collect(),
        ..Config::default()
    };
    config.monitor.poll_timeout_ms = 100;
    config.monitor.tick_deadline_ms = 1_000;
    config.storage.state_dir = None;
    config.remediation.auto_remediate = false;
    config
}

async fn daemon_with(
    config: Config,
    source: Arc<ScriptedSource>,
    persistence: Arc<dyn Persistence>,
) -> HealDaemon {
    HealDaemon::new(config, source, Arc::new(FakeExecutor::new()), persistence)
        .await
        .unwrap()
}

async fn unreachable_issue(daemon: &HealDaemon) -> String {
    for _ in 0..3 {
        daemon.tick().await;
    }
    let active = daemon.service().list_active_issues().await;
    assert_eq!(active.len(), 1);
    active[0].id.to_string()
}

fn failing_source(device: &str, ticks: usize) -> Arc<ScriptedSource> {
    let source = Arc::new(ScriptedSource::new());
    for _ in 0..ticks {
        source.push(device, Scripted::Fail);
    }
    source
}

#[tokio::test]
async fn test_resolve_rejects_bad_ids() {
    let daemon = daemon_with(
        config(&["ap-1"]),
        Arc::new(ScriptedSource::new()),
        Arc::new(MemoryPersistence::new()),
    )
    .await;

    let result = daemon
        .service()
        .resolve("not-a-uuid", ResolutionOutcome::Success, None)
        .await;
    assert!(!result.success);
    assert!(result.message.unwrap().contains("Invalid issue id"));

    let result = daemon
        .service()
        .resolve(
            "6f1c1f4e-8c53-4d59-9d2f-4a4b5e0b7c11",
            ResolutionOutcome::Success,
            None,
        )
        .await;
    assert!(!result.success);
    assert!(result.message.unwrap().contains("not found"));
}

#[tokio::test]
async fn test_second_resolve_reports_already_resolved() {
    let daemon = daemon_with(
        config(&["ap-1"]),
        failing_source("ap-1", 3),
        Arc::new(MemoryPersistence::new()),
    )
    .await;
    let id = unreachable_issue(&daemon).await;

    let first = daemon
        .service()
        .resolve(&id, ResolutionOutcome::Failure, Some(Verdict::FalsePositive))
        .await;
    assert!(first.success);
    assert_eq!(
        first.message.as_deref(),
        Some("Issue 'Device Unreachable' marked as resolved")
    );

    let second = daemon
        .service()
        .resolve(&id, ResolutionOutcome::Success, None)
        .await;
    assert!(!second.success);
    assert!(second.message.unwrap().contains("already resolved"));
    assert!(daemon.service().list_active_issues().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_reports_share_one_issue() {
    let issues = Arc::new(IssueManager::new(Arc::new(MemoryPersistence::new()), None));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let issues = Arc::clone(&issues);
        handles.push(tokio::spawn(async move {
            let score = AnomalyScore::quiet("router-1", chrono::Utc::now());
            issues
                .report_candidate("router-1", AnomalyCategory::HighLatency, score)
                .await
                .id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let open = issues.list(&IssueFilter::open()).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].occurrences, 20);
}

#[tokio::test]
async fn test_network_status_and_history() {
    let source = Arc::new(ScriptedSource::new());
    source.push_latencies("router-1", &[100.0, 100.0, 100.0]);
    source.push_latencies("switch-1", &[400.0, 400.0, 400.0]);
    let daemon = daemon_with(
        config(&["router-1", "switch-1"]),
        source,
        Arc::new(MemoryPersistence::new()),
    )
    .await;

    let status = daemon.service().network_status().await;
    assert!(status.last_updated.is_none());
    assert_eq!(status.connected_devices, 0);
    assert_eq!(status.overall_health, OverallHealth::Good);

    for _ in 0..3 {
        daemon.tick().await;
    }
    let status = daemon.service().network_status().await;
    assert!(status.last_updated.is_some());
    assert_eq!(status.total_devices, 2);
    assert_eq!(status.connected_devices, 2);
    assert!((status.latency - 250.0).abs() < 1e-9);
    assert!((status.bandwidth_usage - 20.0).abs() < 1e-9);
    assert_eq!(status.overall_health, OverallHealth::Warning);

    let history = daemon.service().history("router-1", Some(2)).await;
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp <= history[1].timestamp);
    assert_eq!(daemon.service().history("router-1", None).await.len(), 3);
    assert!(daemon.service().history("unknown", None).await.is_empty());
}

#[tokio::test]
async fn test_all_devices_down_is_critical() {
    let daemon = daemon_with(
        config(&["ap-1"]),
        failing_source("ap-1", 1),
        Arc::new(MemoryPersistence::new()),
    )
    .await;
    daemon.tick().await;

    let status = daemon.service().network_status().await;
    assert_eq!(status.connected_devices, 0);
    assert_eq!(status.overall_health, OverallHealth::Critical);
}

#[tokio::test]
async fn test_hanging_device_is_marked_unreachable() {
    let source = Arc::new(ScriptedSource::new());
    source.push("ap-1", Scripted::Hang);
    source.push_latencies("router-1", &[10.0]);
    let daemon = daemon_with(
        config(&["ap-1", "router-1"]),
        source,
        Arc::new(MemoryPersistence::new()),
    )
    .await;

    let report = daemon.tick().await;
    assert_eq!(report.polled, 2);
    assert_eq!(report.unreachable, 1);
    assert_eq!(report.stragglers, 0);

    let history = daemon.service().history("ap-1", None).await;
    assert_eq!(history.len(), 1);
    assert!((history[0].packet_loss - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let id = {
        let persistence = Arc::new(JsonPersistence::new(dir.path()));
        let daemon = daemon_with(
            config(&["ap-1"]),
            failing_source("ap-1", 6),
            persistence.clone(),
        )
        .await;
        let id = unreachable_issue(&daemon).await;

        // Resolve the first outage, then let a second one open
        let result = daemon
            .service()
            .resolve(&id, ResolutionOutcome::Success, Some(Verdict::Confirmed))
            .await;
        assert!(result.success);
        for _ in 0..100 {
            if !persistence.training_history().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(daemon.detector().snapshot().version, 1);

        daemon.tick().await;
        let active = daemon.service().list_active_issues().await;
        assert_eq!(active.len(), 1);
        active[0].id
    };

    let persistence = Arc::new(JsonPersistence::new(dir.path()));
    let training = persistence.training_history().await.unwrap();
    assert_eq!(training.len(), 1);
    assert_eq!(training[0].label, Label::Confirmed);
    assert_eq!(training[0].model_version, 1);
    assert!(!persistence.resolution_history().await.unwrap().is_empty());

    let daemon = daemon_with(
        config(&["ap-1"]),
        Arc::new(ScriptedSource::new()),
        persistence,
    )
    .await;
    assert_eq!(daemon.detector().snapshot().version, 1);

    let restored = daemon.issues().list(&IssueFilter::default()).await;
    assert_eq!(restored.len(), 2);
    let open = daemon.issues().get(id).await.unwrap();
    assert_eq!(open.status, IssueStatus::Active);
    assert_eq!(
        daemon
            .issues()
            .open_issue("ap-1", AnomalyCategory::Connectivity)
            .await
            .map(|i| i.id),
        Some(id)
    );
}
