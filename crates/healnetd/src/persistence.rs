//! Journal of issues, resolution history and the detector model
//!
//! `JsonPersistence` keeps everything under one state directory:
//!
//! - `issues.json`: latest snapshot of every issue
//! - `model.json`: latest detector model
//! - `resolution_history.jsonl`: one line per remediation attempt or resolution
//! - `training_history.jsonl`: one line per applied model update
//!
//! Snapshots are written to a temporary file and renamed into place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healnet_common::{
    AnomalyCategory, Issue, IssueId, RemediationRecord, ResolutionOutcome, Verdict,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::detector::{DetectorModel, Label};

const ISSUES_FILE: &str = "issues.json";
const MODEL_FILE: &str = "model.json";
const RESOLUTION_HISTORY_FILE: &str = "resolution_history.jsonl";
const TRAINING_HISTORY_FILE: &str = "training_history.jsonl";

/// What a resolution history line records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Remediation,
    Resolution,
}

/// One line of the resolution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEntry {
    pub timestamp: DateTime<Utc>,
    pub event: HistoryEvent,
    pub issue_id: IssueId,
    pub device: String,
    pub category: AnomalyCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ResolutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl ResolutionEntry {
    pub fn remediation(issue: &Issue, record: &RemediationRecord) -> Self {
        Self {
            timestamp: record.finished_at,
            event: HistoryEvent::Remediation,
            issue_id: issue.id,
            device: issue.device.clone(),
            category: issue.category,
            strategy: Some(record.action.plan.clone()),
            success: Some(record.success),
            outcome: None,
            verdict: None,
            messages: record.messages.clone(),
        }
    }

    pub fn resolution(issue: &Issue) -> Self {
        Self {
            timestamp: issue.resolved_at.unwrap_or_else(Utc::now),
            event: HistoryEvent::Resolution,
            issue_id: issue.id,
            device: issue.device.clone(),
            category: issue.category,
            strategy: None,
            success: None,
            outcome: issue.outcome,
            verdict: issue.verdict,
            messages: Vec::new(),
        }
    }
}

/// One applied detector update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEvent {
    pub timestamp: DateTime<Utc>,
    pub issue_id: IssueId,
    pub label: Label,
    pub model_version: u64,
}

/// Storage backend for the daemon's durable state
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_issues(&self) -> Result<Vec<Issue>>;

    async fn save_issues(&self, issues: &[Issue]) -> Result<()>;

    async fn append_resolution(&self, entry: &ResolutionEntry) -> Result<()>;

    async fn load_model(&self) -> Result<Option<DetectorModel>>;

    async fn save_model(&self, model: &DetectorModel) -> Result<()>;

    async fn append_training(&self, event: &TrainingEvent) -> Result<()>;
}

/// Keeps state in memory only; lost on exit
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    issues: Vec<Issue>,
    model: Option<DetectorModel>,
    resolutions: Vec<ResolutionEntry>,
    training: Vec<TrainingEvent>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn resolutions(&self) -> Vec<ResolutionEntry> {
        self.with_state(|s| s.resolutions.clone())
    }

    pub fn training(&self) -> Vec<TrainingEvent> {
        self.with_state(|s| s.training.clone())
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.with_state(|s| s.issues.clone())
    }

    pub fn model(&self) -> Option<DetectorModel> {
        self.with_state(|s| s.model.clone())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_issues(&self) -> Result<Vec<Issue>> {
        Ok(self.issues())
    }

    async fn save_issues(&self, issues: &[Issue]) -> Result<()> {
        self.with_state(|s| s.issues = issues.to_vec());
        Ok(())
    }

    async fn append_resolution(&self, entry: &ResolutionEntry) -> Result<()> {
        self.with_state(|s| s.resolutions.push(entry.clone()));
        Ok(())
    }

    async fn load_model(&self) -> Result<Option<DetectorModel>> {
        Ok(self.model())
    }

    async fn save_model(&self, model: &DetectorModel) -> Result<()> {
        self.with_state(|s| s.model = Some(model.clone()));
        Ok(())
    }

    async fn append_training(&self, event: &TrainingEvent) -> Result<()> {
        self.with_state(|s| s.training.push(event.clone()));
        Ok(())
    }
}

/// JSON files under a state directory
pub struct JsonPersistence {
    dir: PathBuf,
}

impl JsonPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))
    }

    async fn write_snapshot<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;

        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;

        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        Ok(())
    }

    async fn append_line<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.dir.join(name);
        let json = serde_json::to_string(value)? + "\n";

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(json.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", path.display()))?;
        Ok(())
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>> {
        let path = self.dir.join(name);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    /// Read back the resolution history
    pub async fn resolution_history(&self) -> Result<Vec<ResolutionEntry>> {
        self.read_lines(RESOLUTION_HISTORY_FILE).await
    }

    /// Read back the training history
    pub async fn training_history(&self) -> Result<Vec<TrainingEvent>> {
        self.read_lines(TRAINING_HISTORY_FILE).await
    }

    async fn read_lines<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Vec<T>> {
        let Some(content) = self.read_optional(name).await? else {
            return Ok(Vec::new());
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).with_context(|| format!("Corrupt line in {}", name))
            })
            .collect()
    }
}

#[async_trait]
impl Persistence for JsonPersistence {
    async fn load_issues(&self) -> Result<Vec<Issue>> {
        match self.read_optional(ISSUES_FILE).await? {
            Some(content) => serde_json::from_str(&content).context("Failed to parse issues.json"),
            None => Ok(Vec::new()),
        }
    }

    async fn save_issues(&self, issues: &[Issue]) -> Result<()> {
        self.write_snapshot(ISSUES_FILE, issues).await
    }

    async fn append_resolution(&self, entry: &ResolutionEntry) -> Result<()> {
        self.append_line(RESOLUTION_HISTORY_FILE, entry).await
    }

    async fn load_model(&self) -> Result<Option<DetectorModel>> {
        match self.read_optional(MODEL_FILE).await? {
            Some(content) => {
                let model = serde_json::from_str(&content).context("Failed to parse model.json")?;
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }

    async fn save_model(&self, model: &DetectorModel) -> Result<()> {
        self.write_snapshot(MODEL_FILE, model).await
    }

    async fn append_training(&self, event: &TrainingEvent) -> Result<()> {
        self.append_line(TRAINING_HISTORY_FILE, event).await
    }
}
