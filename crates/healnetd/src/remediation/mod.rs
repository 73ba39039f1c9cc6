//! Remediation engine
//!
//! Maps an issue's category to a registered plan and runs it at most once at
//! a time per issue. The claim is taken through the issue manager, so a
//! concurrent second attempt sees `AlreadyInProgress` instead of running the
//! action twice.

pub mod executor;

pub use executor::{ActionExecutor, CommandExecutor, ExecutionReport, FakeExecutor};

use chrono::Utc;
use healnet_common::config::RemediationConfig;
use healnet_common::{
    AnomalyCategory, HealError, HealResult, IssueId, RemediationAction, RemediationOutcome,
    RemediationPlan, RemediationRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::issues::IssueManager;

pub struct RemediationEngine {
    config: RemediationConfig,
    registry: HashMap<AnomalyCategory, RemediationPlan>,
    issues: Arc<IssueManager>,
    executor: Arc<dyn ActionExecutor>,
}

impl RemediationEngine {
    pub fn new(
        config: RemediationConfig,
        issues: Arc<IssueManager>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let registry = config
            .plans
            .iter()
            .map(|plan| (plan.category, plan.clone()))
            .collect();
        Self {
            config,
            registry,
            issues,
            executor,
        }
    }

    pub fn plan_for(&self, category: AnomalyCategory) -> Option<&RemediationPlan> {
        self.registry.get(&category)
    }

    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    /// Run the registered plan for an issue and record the outcome on it
    pub async fn attempt(&self, issue_id: IssueId) -> HealResult<RemediationOutcome> {
        let issue = self
            .issues
            .get(issue_id)
            .await
            .ok_or(HealError::NotFound(issue_id))?;
        let Some(plan) = self.registry.get(&issue.category) else {
            debug!("No remediation plan for {} (issue {})", issue.category, issue_id);
            return Ok(RemediationOutcome::Unsupported);
        };

        let issue = self
            .issues
            .begin_remediation(issue_id, self.config.max_attempts)
            .await?;
        let action = RemediationAction {
            issue_id,
            device: issue.device.clone(),
            plan: plan.name.clone(),
            kind: plan.action.clone(),
        };

        info!(
            "Attempting '{}' for issue {} on {} (attempt {})",
            plan.name,
            issue_id,
            issue.device,
            issue.failure_count + 1
        );
        let started_at = Utc::now();
        let limit = self.config.action_timeout();
        let (success, mut messages) = match timeout(limit, self.executor.execute(&action)).await {
            Ok(Ok(report)) => (report.success, report.messages),
            Ok(Err(e)) => (false, vec![format!("Execution error: {:#}", e)]),
            Err(_) => (
                false,
                vec![format!("Action timed out after {}s", limit.as_secs())],
            ),
        };

        if success && plan.verification_wait_secs > 0 {
            debug!(
                "Waiting {}s before confirming '{}'",
                plan.verification_wait_secs, plan.name
            );
            sleep(Duration::from_secs(plan.verification_wait_secs)).await;
        }
        if !success {
            warn!("'{}' failed for issue {}: {}", plan.name, issue_id, messages.join("; "));
            messages.push(
                HealError::RemediationFailed {
                    issue: issue_id,
                    reason: plan.name.clone(),
                }
                .to_string(),
            );
        }

        let record = RemediationRecord {
            action,
            started_at,
            finished_at: Utc::now(),
            success,
            messages,
        };
        self.issues.finish_remediation(issue_id, record).await?;

        Ok(if success {
            RemediationOutcome::Success
        } else {
            RemediationOutcome::Failure
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use healnet_common::{ActionKind, AnomalyScore, IssueStatus};

    fn engine(
        executor: Arc<dyn ActionExecutor>,
        config: RemediationConfig,
    ) -> (RemediationEngine, Arc<IssueManager>) {
        let issues = Arc::new(IssueManager::new(Arc::new(MemoryPersistence::new()), None));
        (RemediationEngine::new(config, issues.clone(), executor), issues)
    }

    fn config() -> RemediationConfig {
        RemediationConfig {
            plans: vec![RemediationPlan::new(
                AnomalyCategory::HighLatency,
                "Flush DNS and Reset Network",
                ActionKind::ResetNetwork,
            )],
            ..RemediationConfig::default()
        }
    }

    async fn report(issues: &IssueManager, category: AnomalyCategory) -> IssueId {
        issues
            .report_candidate("router-1", category, AnomalyScore::quiet("router-1", Utc::now()))
            .await
            .id
    }

    #[tokio::test]
    async fn test_unknown_issue() {
        let (engine, _) = engine(Arc::new(FakeExecutor::new()), config());
        let id = IssueId::new_v4();
        assert_eq!(engine.attempt(id).await, Err(HealError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_unsupported_category_stays_active() {
        let (engine, issues) = engine(Arc::new(FakeExecutor::new()), config());
        let id = report(&issues, AnomalyCategory::Bandwidth).await;

        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Unsupported));
        assert_eq!(issues.get(id).await.unwrap().status, IssueStatus::Active);
    }

    #[tokio::test]
    async fn test_success_resolves_issue() {
        let executor = Arc::new(FakeExecutor::new());
        let (engine, issues) = engine(executor.clone(), config());
        let id = report(&issues, AnomalyCategory::HighLatency).await;

        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Success));
        let issue = issues.get(id).await.unwrap();
        assert_eq!(issue.status, IssueStatus::Resolved);
        assert_eq!(issue.remediation_log.len(), 1);
        assert_eq!(executor.executed()[0].plan, "Flush DNS and Reset Network");
        assert_eq!(engine.attempt(id).await, Err(HealError::AlreadyResolved(id)));
    }

    #[tokio::test]
    async fn test_failures_until_retry_limit() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push(ExecutionReport::failed(vec!["no carrier".to_string()]));
        executor.push_error("interface busy");
        let mut config = config();
        config.max_attempts = 2;
        let (engine, issues) = engine(executor.clone(), config);
        let id = report(&issues, AnomalyCategory::HighLatency).await;

        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Failure));
        assert_eq!(issues.get(id).await.unwrap().status, IssueStatus::Active);
        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Failure));
        assert_eq!(
            engine.attempt(id).await,
            Err(HealError::RetryLimitReached { issue: id, attempts: 2 })
        );

        let issue = issues.get(id).await.unwrap();
        assert_eq!(issue.failure_count, 2);
        assert!(issue.remediation_log[1].messages[0].contains("interface busy"));
        assert_eq!(executor.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let executor = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(1500)));
        let mut config = config();
        config.action_timeout_secs = 1;
        let (engine, issues) = engine(executor, config);
        let id = report(&issues, AnomalyCategory::HighLatency).await;

        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Failure));
        let issue = issues.get(id).await.unwrap();
        assert_eq!(issue.status, IssueStatus::Active);
        assert_eq!(issue.failure_count, 1);
        assert!(issue.remediation_log[0].messages[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_timed_out_command_is_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let config = RemediationConfig {
            plans: vec![RemediationPlan::new(
                AnomalyCategory::HighLatency,
                "Slow Script",
                ActionKind::Shell {
                    commands: vec![format!("sleep 2; touch {}", marker.display())],
                },
            )],
            action_timeout_secs: 1,
            ..RemediationConfig::default()
        };
        let (engine, issues) = engine(Arc::new(CommandExecutor::new(false)), config);
        let id = report(&issues, AnomalyCategory::HighLatency).await;

        assert_eq!(engine.attempt(id).await, Ok(RemediationOutcome::Failure));
        assert_eq!(issues.get(id).await.unwrap().status, IssueStatus::Active);

        // The shell was killed, so the retry cannot overlap the first run
        sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_concurrent_attempts_run_action_once() {
        let executor = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(100)));
        let (engine, issues) = engine(executor.clone(), config());
        let engine = Arc::new(engine);
        let id = report(&issues, AnomalyCategory::HighLatency).await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.attempt(id).await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.attempt(id).await }
        });
        let results = vec![first.await.unwrap(), second.await.unwrap()];

        assert_eq!(
            results.iter().filter(|r| **r == Ok(RemediationOutcome::Success)).count(),
            1
        );
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == Err(HealError::AlreadyInProgress(id)))
                .count(),
            1
        );
        assert_eq!(executor.executed().len(), 1);
    }
}
