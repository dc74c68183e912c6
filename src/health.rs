use crate::protocol::{HealthSample, Outbound};
use crate::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;

pub const HEALTH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("no CPU information available")]
    NoCpu,
    #[error("invalid CPU reading: {0}")]
    InvalidCpu(f32),
    #[error("no mounted disk contains {}", .0.display())]
    NoDisk(PathBuf),
    #[error("disk mounted at {} reports zero capacity", .0.display())]
    EmptyDisk(PathBuf),
}

/// Host resource probes. Each call is cheap; CPU usage is measured over the
/// time since the previous call.
pub trait HostMetrics {
    fn cpu_percent(&mut self) -> Result<f64, MetricsError>;
    fn disk_percent(&mut self, path: &Path) -> Result<f64, MetricsError>;
}

// ---------------------------------------------------------------------------
// sysinfo-backed metrics
// ---------------------------------------------------------------------------

pub struct SystemMetrics {
    system: System,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // First refresh only establishes the baseline for the next delta.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SystemMetrics {
    fn cpu_percent(&mut self) -> Result<f64, MetricsError> {
        self.system.refresh_cpu_usage();
        if self.system.cpus().is_empty() {
            return Err(MetricsError::NoCpu);
        }
        let usage = self.system.global_cpu_usage();
        if !usage.is_finite() {
            return Err(MetricsError::InvalidCpu(usage));
        }
        Ok(f64::from(usage))
    }

    fn disk_percent(&mut self, path: &Path) -> Result<f64, MetricsError> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| MetricsError::NoDisk(path.to_path_buf()))?;

        used_percent(disk.total_space(), disk.available_space())
            .ok_or_else(|| MetricsError::EmptyDisk(disk.mount_point().to_path_buf()))
    }
}

pub fn used_percent(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Take one sample. Any failed probe skips the whole sample so the worker
/// never sees half of one.
pub fn sample<M: HostMetrics>(metrics: &mut M, disk_path: &Path) -> Option<HealthSample> {
    let disk_percent = match metrics.disk_percent(disk_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("failed to get disk usage: {e}");
            return None;
        }
    };
    let cpu_percent = match metrics.cpu_percent() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("failed to get cpu usage: {e}");
            return None;
        }
    };
    Some(HealthSample {
        cpu_percent,
        disk_percent,
    })
}

/// Publish a HEALTH message every `interval` until shutdown. The first
/// sample goes out one interval after start.
pub async fn run_sampler<M: HostMetrics>(
    session: &Session,
    mut metrics: M,
    disk_path: &Path,
    interval: Duration,
) {
    let cancel = session.cancellation();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(stats) = sample(&mut metrics, disk_path) else {
            continue;
        };
        if let Err(e) = session.publish(Outbound::Health(stats)).await {
            tracing::debug!("health sampler stopping: {e}");
            return;
        }
    }
}

pub fn spawn_health_sampler<M>(
    session: Arc<Session>,
    metrics: M,
    disk_path: PathBuf,
    interval: Duration,
) -> JoinHandle<()>
where
    M: HostMetrics + Send + 'static,
{
    tokio::spawn(async move { run_sampler(&session, metrics, &disk_path, interval).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound;
    use tokio_tungstenite::tungstenite::Message;

    struct FakeMetrics {
        cpu: Result<f64, ()>,
        disk: Result<f64, ()>,
    }

    impl HostMetrics for FakeMetrics {
        fn cpu_percent(&mut self) -> Result<f64, MetricsError> {
            self.cpu.map_err(|_| MetricsError::NoCpu)
        }

        fn disk_percent(&mut self, path: &Path) -> Result<f64, MetricsError> {
            self.disk.map_err(|_| MetricsError::NoDisk(path.to_path_buf()))
        }
    }

    #[test]
    fn test_used_percent() {
        assert_eq!(used_percent(200, 50), Some(75.0));
        assert_eq!(used_percent(100, 100), Some(0.0));
        assert_eq!(used_percent(100, 150), Some(0.0));
        assert_eq!(used_percent(0, 0), None);
    }

    #[test]
    fn test_sample_success() {
        let mut m = FakeMetrics {
            cpu: Ok(12.5),
            disk: Ok(40.0),
        };
        assert_eq!(
            sample(&mut m, Path::new("/")),
            Some(HealthSample {
                cpu_percent: 12.5,
                disk_percent: 40.0
            })
        );
    }

    #[test]
    fn test_disk_failure_skips_sample() {
        let mut m = FakeMetrics {
            cpu: Ok(12.5),
            disk: Err(()),
        };
        assert_eq!(sample(&mut m, Path::new("/")), None);
    }

    #[test]
    fn test_cpu_failure_skips_sample() {
        let mut m = FakeMetrics {
            cpu: Err(()),
            disk: Ok(40.0),
        };
        assert_eq!(sample(&mut m, Path::new("/")), None);
    }

    #[test]
    fn test_system_metrics_root_disk() {
        let mut m = SystemMetrics::new();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        if let Ok(cpu) = m.cpu_percent() {
            assert!((0.0..=100.0).contains(&cpu), "cpu out of range: {cpu}");
        }
        if let Ok(disk) = m.disk_percent(Path::new("/")) {
            assert!((0.0..=100.0).contains(&disk), "disk out of range: {disk}");
        }
    }

    async fn run_with(metrics: FakeMetrics) -> Vec<Message> {
        let (outbox, outlet) = outbound::channel(16);
        let session = Arc::new(
            Session::new(1, outbox, Box::new(|_code: i32| {}))
                .with_grace(Duration::from_millis(10)),
        );
        let writer = tokio::spawn(async move {
            let mut frames: Vec<Message> = Vec::new();
            outbound::run_writer(&mut frames, outlet).await.unwrap();
            frames
        });

        let sampler = spawn_health_sampler(
            session.clone(),
            metrics,
            PathBuf::from("/"),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        session.shutdown("test").await;
        tokio::time::timeout(Duration::from_secs(1), sampler)
            .await
            .expect("sampler did not stop")
            .unwrap();
        writer.await.unwrap()
    }

    fn kinds(frames: &[Message]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|m| match m {
                Message::Text(t) => {
                    let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
                    Some(v["type"].as_str().unwrap().to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sampler_publishes_periodically() {
        let frames = run_with(FakeMetrics {
            cpu: Ok(5.0),
            disk: Ok(50.0),
        })
        .await;
        let kinds = kinds(&frames);
        let health = kinds.iter().filter(|k| *k == "HEALTH").count();
        assert!(health >= 2, "expected several samples, got {kinds:?}");
        assert!(kinds.iter().any(|k| k == "AGENT_SHUTDOWN"));
    }

    #[tokio::test]
    async fn test_sampler_stops_when_writer_is_gone() {
        let (outbox, outlet) = outbound::channel(4);
        drop(outlet);
        let session = Session::new(1, outbox, Box::new(|_code: i32| {}));
        let metrics = FakeMetrics {
            cpu: Ok(5.0),
            disk: Ok(50.0),
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            run_sampler(&session, metrics, Path::new("/"), Duration::from_millis(10)),
        )
        .await
        .expect("sampler kept running without a writer");
    }

    #[tokio::test]
    async fn test_sampler_never_sends_partial_samples() {
        let frames = run_with(FakeMetrics {
            cpu: Ok(5.0),
            disk: Err(()),
        })
        .await;
        assert_eq!(kinds(&frames), vec!["AGENT_SHUTDOWN".to_string()]);
    }
}
