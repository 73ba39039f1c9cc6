//! Action execution
//!
//! `CommandExecutor` maps each action variant to Linux commands and runs them
//! in order, stopping at the first failure. In dry-run mode the commands are
//! only logged.

use anyhow::Result;
use async_trait::async_trait;
use healnet_common::config::RemediationConfig;
use healnet_common::{ActionKind, RemediationAction};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{info, warn};

/// Forces dry-run mode when set to a truthy value
pub const SIMULATION_ENV: &str = "HEALNET_SIMULATION";

/// What an executor reports back
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub messages: Vec<String>,
}

impl ExecutionReport {
    pub fn ok(messages: Vec<String>) -> Self {
        Self {
            success: true,
            messages,
        }
    }

    pub fn failed(messages: Vec<String>) -> Self {
        Self {
            success: false,
            messages,
        }
    }
}

/// Runs a remediation action against the system
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &RemediationAction) -> Result<ExecutionReport>;
}

/// Executes actions as platform commands
pub struct CommandExecutor {
    dry_run: bool,
}

impl CommandExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Dry-run when configured or when the simulation variable is set
    pub fn from_config(config: &RemediationConfig) -> Self {
        let simulated = std::env::var(SIMULATION_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        if simulated && !config.dry_run {
            info!("{} is set, remediation commands will not be executed", SIMULATION_ENV);
        }
        Self::new(config.dry_run || simulated)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Commands for an action, as program plus arguments
pub fn commands_for(kind: &ActionKind) -> Vec<Vec<String>> {
    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    match kind {
        ActionKind::FlushDns => vec![cmd(&["resolvectl", "flush-caches"])],
        ActionKind::ResetNetwork => vec![
            cmd(&["resolvectl", "flush-caches"]),
            cmd(&["dhclient", "-r"]),
            cmd(&["dhclient"]),
        ],
        ActionKind::RestartInterface { interface } => vec![
            cmd(&["ip", "link", "set", interface.as_str(), "down"]),
            cmd(&["ip", "link", "set", interface.as_str(), "up"]),
        ],
        ActionKind::ResetAdapter { interface } => vec![
            cmd(&["nmcli", "device", "disconnect", interface.as_str()]),
            cmd(&["nmcli", "device", "connect", interface.as_str()]),
        ],
        ActionKind::ClearCache => vec![cmd(&["ip", "neigh", "flush", "all"])],
        ActionKind::RerouteTraffic { via } => {
            vec![cmd(&["ip", "route", "replace", "default", "via", via.as_str()])]
        }
        ActionKind::Shell { commands } => commands
            .iter()
            .map(|c| cmd(&["sh", "-c", c.as_str()]))
            .collect(),
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, action: &RemediationAction) -> Result<ExecutionReport> {
        info!(
            "{} on {}: {} (dry_run={})",
            action.plan, action.device, action.kind, self.dry_run
        );

        let mut messages = Vec::new();
        for argv in commands_for(&action.kind) {
            let line = argv.join(" ");
            if self.dry_run {
                info!("[DRY-RUN] Would execute: {}", line);
                messages.push(format!("[dry-run] {}", line));
                continue;
            }

            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            info!("Executing: {}", line);
            match Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    messages.push(format!("{} (success)", line));
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!("{} failed: {}", line, stderr.trim());
                    messages.push(format!("{} failed: {}", line, stderr.trim()));
                    return Ok(ExecutionReport::failed(messages));
                }
                Err(e) => {
                    warn!("Could not execute {}: {}", line, e);
                    messages.push(format!("Could not execute {}: {}", line, e));
                    return Ok(ExecutionReport::failed(messages));
                }
            }
        }
        Ok(ExecutionReport::ok(messages))
    }
}

/// Scripted executor for tests and simulations: replays queued reports and
/// records every action it receives
#[derive(Default)]
pub struct FakeExecutor {
    responses: Mutex<Vec<Result<ExecutionReport, String>>>,
    delay: Option<std::time::Duration>,
    executed: Mutex<Vec<RemediationAction>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a report; reports are consumed in order, then success is assumed
    pub fn push(&self, report: ExecutionReport) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Ok(report));
        }
    }

    /// Queue an execution error
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Err(error.into()));
        }
    }

    pub fn executed(&self) -> Vec<RemediationAction> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn execute(&self, action: &RemediationAction) -> Result<ExecutionReport> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(action.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().ok().and_then(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.remove(0))
            }
        });
        match next {
            Some(Ok(report)) => Ok(report),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(ExecutionReport::ok(vec![format!("{} applied", action.kind)])),
        }
    }
}
