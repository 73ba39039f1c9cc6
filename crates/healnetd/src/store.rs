//! Bounded per-device metrics history.
//!
//! Each device owns a FIFO window of fixed capacity. Samples are appended in
//! timestamp order and evicted strictly by arrival, never by score.

use healnet_common::{HealError, HealResult, HistoryPoint, Sample};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// Append-only, time-ordered sample store
pub struct MetricsStore {
    capacity: usize,
    windows: RwLock<HashMap<String, VecDeque<Sample>>>,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest one when the window is full.
    /// A sample older than the newest stored one is rejected.
    pub async fn append(&self, sample: Sample) -> HealResult<()> {
        let mut windows = self.windows.write().await;
        let window = windows
            .entry(sample.device.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if let Some(last) = window.back() {
            if sample.timestamp < last.timestamp {
                return Err(HealError::OutOfOrder {
                    device: sample.device,
                    timestamp: sample.timestamp,
                });
            }
        }

        if window.len() == self.capacity {
            if let Some(evicted) = window.pop_front() {
                debug!("Evicted sample {} for {}", evicted.timestamp, evicted.device);
            }
        }
        window.push_back(sample);
        Ok(())
    }

    /// Current window for a device, oldest first
    pub async fn recent_window(&self, device: &str) -> Vec<Sample> {
        self.windows
            .read()
            .await
            .get(device)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest sample for a device
    pub async fn latest(&self, device: &str) -> Option<Sample> {
        self.windows
            .read()
            .await
            .get(device)
            .and_then(|w| w.back().cloned())
    }

    /// Up to `limit` most recent points, in timestamp order
    pub async fn history(&self, device: &str, limit: usize) -> Vec<HistoryPoint> {
        let windows = self.windows.read().await;
        match windows.get(device) {
            Some(window) => {
                let skip = window.len().saturating_sub(limit);
                window.iter().skip(skip).map(HistoryPoint::from).collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn len(&self, device: &str) -> usize {
        self.windows.read().await.get(device).map_or(0, |w| w.len())
    }
}
