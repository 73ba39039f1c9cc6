//! Telemetry sources
//!
//! A source turns one device into one sample. Failures never reach the control
//! loop: [`poll_device`] bounds every call with a timeout and substitutes an
//! unreachable sample.

use async_trait::async_trait;
use chrono::Utc;
use healnet_common::config::DeviceConfig;
use healnet_common::{Device, Sample, TelemetryError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn poll(&self, device: &Device) -> Result<Sample, TelemetryError>;
}

/// Poll a device, converting failures and timeouts into an unreachable sample
pub async fn poll_device(
    source: &dyn TelemetrySource,
    device: &Device,
    limit: Duration,
) -> Sample {
    let result = match timeout(limit, source.poll(device)).await {
        Ok(result) => result,
        Err(_) => Err(TelemetryError::Timeout {
            device: device.name.clone(),
            timeout_ms: limit.as_millis() as u64,
        }),
    };
    match result {
        Ok(sample) => sample,
        Err(e) => {
            debug!("{}", e);
            Sample::unreachable(device.name.clone(), Utc::now(), limit)
        }
    }
}

/// Connect attempts per poll; failed attempts count as lost packets
const PROBE_ATTEMPTS: u32 = 4;

/// Per-attempt connect timeout
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(400);

/// Probes devices with TCP connects and samples this host's resources for
/// devices flagged `local`
pub struct TcpProbeSource {
    targets: HashMap<String, DeviceConfig>,
    host: Mutex<HostSampler>,
}

impl TcpProbeSource {
    pub fn new(devices: &[DeviceConfig]) -> Self {
        Self {
            targets: devices.iter().map(|d| (d.name.clone(), d.clone())).collect(),
            host: Mutex::new(HostSampler::new()),
        }
    }

    async fn probe(&self, target: &DeviceConfig) -> Result<(f64, f64), TelemetryError> {
        let address = format!("{}:{}", target.address, target.port);
        let mut latencies = Vec::new();
        let mut last_error = String::new();

        for _ in 0..PROBE_ATTEMPTS {
            let started = Instant::now();
            match timeout(ATTEMPT_TIMEOUT, TcpStream::connect(&address)).await {
                Ok(Ok(_stream)) => latencies.push(started.elapsed().as_secs_f64() * 1000.0),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {}ms", ATTEMPT_TIMEOUT.as_millis()),
            }
        }

        if latencies.is_empty() {
            return Err(TelemetryError::Unreachable {
                device: target.name.clone(),
                reason: last_error,
            });
        }
        let latency = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let lost = PROBE_ATTEMPTS as usize - latencies.len();
        let loss = lost as f64 * 100.0 / PROBE_ATTEMPTS as f64;
        Ok((latency, loss))
    }
}

#[async_trait]
impl TelemetrySource for TcpProbeSource {
    async fn poll(&self, device: &Device) -> Result<Sample, TelemetryError> {
        let target = self
            .targets
            .get(&device.name)
            .cloned()
            .unwrap_or_else(|| DeviceConfig::new(device.name.clone(), device.address.clone()));

        let (latency, loss) = self.probe(&target).await?;

        if !target.local {
            // Throughput of a remote device is not observable over a connect probe
            return Ok(Sample::new(device.name.clone(), Utc::now(), latency, loss, 0.0));
        }

        let usage = match self.host.lock() {
            Ok(mut host) => host.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        };
        Ok(
            Sample::new(device.name.clone(), Utc::now(), latency, loss, usage.bandwidth_mbps)
                .with_resources(usage.cpu_pct, usage.memory_pct, usage.disk_pct),
        )
    }
}

struct HostUsage {
    cpu_pct: f64,
    memory_pct: f64,
    disk_pct: f64,
    bandwidth_mbps: f64,
}

/// Local resource readings; network counters are deltas since the last call
struct HostSampler {
    system: System,
    networks: Networks,
    last_refresh: Instant,
}

impl HostSampler {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            last_refresh: Instant::now(),
        }
    }

    fn sample(&mut self) -> HostUsage {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.networks.refresh();
        let elapsed = self.last_refresh.elapsed().as_secs_f64().max(1e-3);
        self.last_refresh = Instant::now();

        let cpus = self.system.cpus();
        let cpu_pct = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };
        let total_memory = self.system.total_memory();
        let memory_pct = if total_memory > 0 {
            self.system.used_memory() as f64 * 100.0 / total_memory as f64
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
        let disk_pct = if total > 0 {
            (total - available) as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        let bytes: u64 = self
            .networks
            .list()
            .values()
            .map(|data| data.received() + data.transmitted())
            .sum();
        let bandwidth_mbps = bytes as f64 * 8.0 / 1_000_000.0 / elapsed;

        HostUsage {
            cpu_pct,
            memory_pct,
            disk_pct,
            bandwidth_mbps,
        }
    }
}

/// Synthetic telemetry for demos and dry runs. Deterministic for a given seed.
pub struct SimulatedSource {
    rng: Mutex<StdRng>,
    reachability: f64,
}

impl SimulatedSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            reachability: 0.8,
        }
    }

    pub fn with_reachability(mut self, reachability: f64) -> Self {
        self.reachability = reachability.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl TelemetrySource for SimulatedSource {
    async fn poll(&self, device: &Device) -> Result<Sample, TelemetryError> {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !rng.gen_bool(self.reachability) {
            return Err(TelemetryError::Unreachable {
                device: device.name.clone(),
                reason: "simulated outage".to_string(),
            });
        }
        let latency = rng.gen_range(10.0..100.0);
        let loss = if rng.gen_bool(0.1) { rng.gen_range(0.0..5.0) } else { 0.0 };
        let bandwidth = rng.gen_range(5.0..50.0);
        Ok(Sample::new(device.name.clone(), Utc::now(), latency, loss, bandwidth))
    }
}

/// One scripted poll result
#[derive(Debug, Clone)]
pub enum Scripted {
    Sample(Sample),
    Fail,
    /// Never answer; exercises the poll timeout
    Hang,
}

/// Replays queued results per device. An exhausted queue repeats its last
/// reachable sample with a fresh timestamp.
#[derive(Default)]
pub struct ScriptedSource {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    last: Mutex<HashMap<String, Sample>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, device: &str, item: Scripted) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(device.to_string()).or_default().push_back(item);
        }
    }

    /// Queue reachable samples with the given latencies
    pub fn push_latencies(&self, device: &str, latencies: &[f64]) {
        for latency in latencies {
            let sample = Sample::new(device, Utc::now(), *latency, 0.0, 20.0);
            self.push(device, Scripted::Sample(sample));
        }
    }

    fn next(&self, device: &str) -> Option<Scripted> {
        self.queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(device).and_then(|q| q.pop_front()))
    }
}

#[async_trait]
impl TelemetrySource for ScriptedSource {
    async fn poll(&self, device: &Device) -> Result<Sample, TelemetryError> {
        match self.next(&device.name) {
            Some(Scripted::Sample(mut sample)) => {
                sample.timestamp = Utc::now();
                if let Ok(mut last) = self.last.lock() {
                    last.insert(device.name.clone(), sample.clone());
                }
                Ok(sample)
            }
            Some(Scripted::Fail) => Err(TelemetryError::Unreachable {
                device: device.name.clone(),
                reason: "scripted failure".to_string(),
            }),
            Some(Scripted::Hang) => std::future::pending().await,
            None => {
                let previous = self.last.lock().ok().and_then(|l| l.get(&device.name).cloned());
                match previous {
                    Some(mut sample) => {
                        sample.timestamp = Utc::now();
                        Ok(sample)
                    }
                    None => {
                        warn!("No scripted telemetry for {}", device.name);
                        Err(TelemetryError::Unreachable {
                            device: device.name.clone(),
                            reason: "nothing scripted".to_string(),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> Device {
        Device::new(name, "192.0.2.1")
    }

    #[tokio::test]
    async fn test_failure_becomes_unreachable_sample() {
        let source = ScriptedSource::new();
        source.push("ap-1", Scripted::Fail);

        let sample = poll_device(&source, &device("ap-1"), Duration::from_millis(200)).await;
        assert!(!sample.reachable);
        assert_eq!(sample.latency_ms, 200.0);
        assert_eq!(sample.packet_loss_pct, 100.0);
    }

    #[tokio::test]
    async fn test_hang_is_bounded_by_timeout() {
        let source = ScriptedSource::new();
        source.push("ap-1", Scripted::Hang);

        let started = Instant::now();
        let sample = poll_device(&source, &device("ap-1"), Duration::from_millis(100)).await;
        assert!(!sample.reachable);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_scripted_source_repeats_last_sample() {
        let source = ScriptedSource::new();
        source.push_latencies("router-1", &[12.0]);

        let first = source.poll(&device("router-1")).await.unwrap();
        let second = source.poll(&device("router-1")).await.unwrap();
        assert_eq!(first.latency_ms, 12.0);
        assert_eq!(second.latency_ms, 12.0);
        assert!(second.timestamp >= first.timestamp);
        assert!(source.poll(&device("other")).await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_source_is_seeded() {
        let a = SimulatedSource::new(7).with_reachability(1.0);
        let b = SimulatedSource::new(7).with_reachability(1.0);
        for _ in 0..5 {
            let x = a.poll(&device("sw")).await.unwrap();
            let y = b.poll(&device("sw")).await.unwrap();
            assert_eq!(x.latency_ms, y.latency_ms);
            assert!((10.0..100.0).contains(&x.latency_ms));
            assert!((5.0..50.0).contains(&x.bandwidth_mbps));
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut config = DeviceConfig::new("loopback", "127.0.0.1");
        config.port = port;
        let source = TcpProbeSource::new(&[config]);
        let sample = source
            .poll(&Device::new("loopback", "127.0.0.1"))
            .await
            .unwrap();
        assert!(sample.reachable);
        assert_eq!(sample.packet_loss_pct, 0.0);
        assert!(sample.cpu_pct.is_none());
    }
}
