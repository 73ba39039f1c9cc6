//! Issue lifecycle
//!
//! ```text
//! active --begin_remediation--> resolving --success--> resolved
//!    ^                              |
//!    +-----------failure------------+
//! active | resolving --resolve--> resolved
//! ```
//!
//! All state sits behind one mutex. The open index maps (device, category) to
//! the single active or resolving issue for that pair.

use chrono::Utc;
use healnet_common::{
    AnomalyCategory, AnomalyScore, HealError, HealResult, Issue, IssueFilter, IssueId,
    IssueStatus, RemediationRecord, Resolution, ResolutionOutcome, Verdict,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::persistence::{Persistence, ResolutionEntry};

/// Resolved issues headed for the feedback loop
pub type FeedbackSender = mpsc::UnboundedSender<Issue>;

#[derive(Default)]
struct IssueBook {
    issues: HashMap<IssueId, Issue>,
    open: HashMap<(String, AnomalyCategory), IssueId>,
    revision: u64,
}

impl IssueBook {
    fn get_mut(&mut self, id: IssueId) -> HealResult<&mut Issue> {
        self.issues.get_mut(&id).ok_or(HealError::NotFound(id))
    }

    fn close(&mut self, id: IssueId) {
        if let Some(issue) = self.issues.get(&id) {
            let key = (issue.device.clone(), issue.category);
            if self.open.get(&key) == Some(&id) {
                self.open.remove(&key);
            }
        }
    }
}

pub struct IssueManager {
    book: Mutex<IssueBook>,
    feedback: Option<FeedbackSender>,
    persistence: Arc<dyn Persistence>,
    /// Revision of the last snapshot written
    persisted: Mutex<u64>,
}

impl IssueManager {
    pub fn new(persistence: Arc<dyn Persistence>, feedback: Option<FeedbackSender>) -> Self {
        Self {
            book: Mutex::new(IssueBook::default()),
            feedback,
            persistence,
            persisted: Mutex::new(0),
        }
    }

    /// Reload issues from a previous run. Remediations that were in flight at
    /// shutdown never finished, so those issues go back to active.
    pub async fn restore(&self, issues: Vec<Issue>) {
        let mut book = self.book.lock().await;
        let mut reopened = 0;
        for mut issue in issues {
            if issue.status == IssueStatus::Resolving {
                issue.status = IssueStatus::Active;
                reopened += 1;
            }
            if issue.is_open() {
                let key = (issue.device.clone(), issue.category);
                if let Some(previous) = book.open.insert(key, issue.id) {
                    warn!("Duplicate open issue {} in journal, keeping {}", previous, issue.id);
                }
            }
            book.issues.insert(issue.id, issue);
        }
        info!(
            "Restored {} issues ({} open, {} interrupted remediations)",
            book.issues.len(),
            book.open.len(),
            reopened
        );
    }

    /// Record a candidate anomaly. Refreshes the open issue for the same
    /// (device, category) or creates a new one. Only creation writes a
    /// snapshot; refreshed counters ride along with the next transition.
    pub async fn report_candidate(
        &self,
        device: &str,
        category: AnomalyCategory,
        score: AnomalyScore,
    ) -> Issue {
        let (issue, created) = {
            let mut guard = self.book.lock().await;
            let book = &mut *guard;
            let key = (device.to_string(), category);
            let existing = book.open.get(&key).copied();

            let (issue, created) = match existing.and_then(|id| book.issues.get_mut(&id)) {
                Some(issue) => {
                    issue.last_score = score;
                    issue.last_seen_at = Utc::now();
                    issue.occurrences += 1;
                    debug!("Issue {} seen again ({} times)", issue.id, issue.occurrences);
                    (issue.clone(), false)
                }
                None => {
                    let issue = Issue::new(device, category, score);
                    info!("New issue {}: {} on {}", issue.id, issue.title, device);
                    book.open.insert(key, issue.id);
                    book.issues.insert(issue.id, issue.clone());
                    (issue, true)
                }
            };
            book.revision += 1;
            (issue, created)
        };
        if created {
            self.persist().await;
        }
        issue
    }

    /// Issues matching the filter, newest first
    pub async fn list(&self, filter: &IssueFilter) -> Vec<Issue> {
        let book = self.book.lock().await;
        let mut issues: Vec<Issue> = book
            .issues
            .values()
            .filter(|issue| filter.matches(issue))
            .cloned()
            .collect();
        issues.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.id.cmp(&b.id)));
        issues
    }

    pub async fn get(&self, id: IssueId) -> Option<Issue> {
        self.book.lock().await.issues.get(&id).cloned()
    }

    /// Open issue for a (device, category) pair
    pub async fn open_issue(&self, device: &str, category: AnomalyCategory) -> Option<Issue> {
        let book = self.book.lock().await;
        book.open
            .get(&(device.to_string(), category))
            .and_then(|id| book.issues.get(id))
            .cloned()
    }

    /// Mark an issue resolved by an operator
    pub async fn resolve(&self, id: IssueId, resolution: Resolution) -> HealResult<Issue> {
        let issue = {
            let mut book = self.book.lock().await;
            let issue = book.get_mut(id)?;
            if issue.status == IssueStatus::Resolved {
                return Err(HealError::AlreadyResolved(id));
            }
            issue.status = IssueStatus::Resolved;
            issue.outcome = Some(resolution.outcome);
            issue.verdict = resolution.verdict;
            issue.resolved_at = Some(Utc::now());
            let issue = issue.clone();
            book.close(id);
            book.revision += 1;
            issue
        };

        info!(
            "Issue {} resolved: outcome={:?} verdict={:?}",
            id, resolution.outcome, resolution.verdict
        );
        self.journal(ResolutionEntry::resolution(&issue)).await;
        self.publish(&issue);
        self.persist().await;
        Ok(issue)
    }

    /// Claim an issue for remediation. At most one claim is held at a time.
    pub async fn begin_remediation(&self, id: IssueId, max_attempts: u32) -> HealResult<Issue> {
        let issue = {
            let mut book = self.book.lock().await;
            let issue = book.get_mut(id)?;
            match issue.status {
                IssueStatus::Resolved => return Err(HealError::AlreadyResolved(id)),
                IssueStatus::Resolving => return Err(HealError::AlreadyInProgress(id)),
                IssueStatus::Active => {}
            }
            if issue.failure_count >= max_attempts {
                return Err(HealError::RetryLimitReached {
                    issue: id,
                    attempts: issue.failure_count,
                });
            }
            issue.status = IssueStatus::Resolving;
            let issue = issue.clone();
            book.revision += 1;
            issue
        };
        self.persist().await;
        Ok(issue)
    }

    /// Record the result of a remediation started with `begin_remediation`
    pub async fn finish_remediation(
        &self,
        id: IssueId,
        record: RemediationRecord,
    ) -> HealResult<Issue> {
        let (issue, resolved_now) = {
            let mut book = self.book.lock().await;
            let issue = book.get_mut(id)?;
            let success = record.success;
            issue.remediation_log.push(record);

            let resolved_now = if issue.status == IssueStatus::Resolved {
                // Operator resolved it while the action ran; keep their verdict
                false
            } else if success {
                issue.status = IssueStatus::Resolved;
                issue.outcome = Some(ResolutionOutcome::Success);
                issue.verdict = Some(Verdict::Confirmed);
                issue.resolved_at = Some(Utc::now());
                true
            } else {
                issue.status = IssueStatus::Active;
                issue.outcome = Some(ResolutionOutcome::Failure);
                issue.failure_count += 1;
                false
            };

            let issue = issue.clone();
            if resolved_now {
                book.close(id);
            }
            book.revision += 1;
            (issue, resolved_now)
        };

        if let Some(record) = issue.remediation_log.last() {
            self.journal(ResolutionEntry::remediation(&issue, record)).await;
        }
        if resolved_now {
            info!("Issue {} resolved by remediation", id);
            self.journal(ResolutionEntry::resolution(&issue)).await;
            self.publish(&issue);
        } else if issue.status == IssueStatus::Active {
            warn!(
                "Remediation of issue {} failed ({} failures)",
                id, issue.failure_count
            );
        }
        self.persist().await;
        Ok(issue)
    }

    fn publish(&self, issue: &Issue) {
        if let Some(feedback) = &self.feedback {
            if feedback.send(issue.clone()).is_err() {
                warn!("Feedback loop stopped; issue {} will not train the detector", issue.id);
            }
        }
    }

    async fn journal(&self, entry: ResolutionEntry) {
        if let Err(e) = self.persistence.append_resolution(&entry).await {
            warn!("Failed to append resolution history: {:#}", e);
        }
    }

    /// Write the issue snapshot unless a newer one is already on disk
    async fn persist(&self) {
        let mut persisted = self.persisted.lock().await;
        let (revision, issues) = {
            let book = self.book.lock().await;
            (book.revision, book.issues.values().cloned().collect::<Vec<_>>())
        };
        if revision <= *persisted {
            return;
        }
        match self.persistence.save_issues(&issues).await {
            Ok(()) => *persisted = revision,
            Err(e) => warn!("Failed to save issue snapshot: {:#}", e),
        }
    }
}
