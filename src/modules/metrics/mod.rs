//! Metrics collection utilities.
//!
//! Provides aggregated global and per-host request statistics with latency
//! percentiles for observability.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_WINDOW: usize = 128;

/// Aggregated metrics across all hosts.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            average_latency: None,
        }
    }
}

/// Host-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct HostStats {
    pub host: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
}

#[derive(Debug)]
struct HostAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_status: Option<u16>,
}

impl HostAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_status: None,
        }
    }

    fn record(&mut self, success: bool, status: Option<u16>, latency: Duration) {
        self.total_requests += 1;
        if status.is_some() {
            self.last_status = status;
        }

        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }

    fn stats(&self, host: &str) -> HostStats {
        let (average_latency, p95_latency) = self.latency_stats();
        HostStats {
            host: host.to_string(),
            total_requests: self.total_requests,
            successes: self.successes,
            failures: self.failures,
            average_latency,
            p95_latency,
            consecutive_failures: self.consecutive_failures,
            last_status: self.last_status,
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    hosts: HashMap<String, HostAccumulator>,
}

impl MetricsState {
    fn record(&mut self, host: &str, success: bool, status: Option<u16>, latency: Duration) {
        self.global.total_requests += 1;
        if success {
            self.global.successes += 1;
        } else {
            self.global.failures += 1;
        }

        self.global.average_latency = Some(match self.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        let max_window = self.max_window;
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostAccumulator::new(max_window))
            .record(success, status, latency);
    }
}

/// Thread-safe metrics collector shared by request instances.
///
/// A response counts as a success unless its status is 5xx; transport
/// failures always count as failures.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                global: GlobalStats::default(),
                max_window: window.max(16),
                hosts: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        // A panic while holding the lock leaves plain counters behind; keep using them.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_response(&self, host: &str, status: u16, latency: Duration) {
        self.state().record(host, status < 500, Some(status), latency);
    }

    pub fn record_failure(&self, host: &str, latency: Duration) {
        self.state().record(host, false, None, latency);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let mut hosts: Vec<_> = guard
            .hosts
            .iter()
            .map(|(host, acc)| acc.stats(host))
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        MetricsSnapshot {
            global: guard.global.clone(),
            hosts,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
