use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{io_error, CoreError, CoreResult};
use crate::subscription::{CallbackSet, Subscription};
use crate::time::{Clock, MonotonicClock};

/// Per-operation performance record.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    /// File path or operation name.
    pub name: String,
    pub started_at_ms: u64,
    pub total_ms: u64,
    /// Time spent loading the descriptor from disk.
    pub load_ms: u64,
    /// Time spent producing and validating the artifact.
    pub build_ms: u64,
    /// Time spent on the install thread.
    pub install_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub peak_memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

impl PerformanceSample {
    pub fn new(name: impl Into<String>, started_at_ms: u64, total_ms: u64, success: bool) -> Self {
        Self {
            name: name.into(),
            started_at_ms,
            total_ms,
            load_ms: 0,
            build_ms: 0,
            install_ms: 0,
            success,
            error: None,
            peak_memory_bytes: None,
            cpu_percent: None,
        }
    }
}

/// Aggregated view over a ring of samples.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateMetrics {
    pub samples: usize,
    pub average_total_ms: f64,
    pub average_load_ms: f64,
    pub average_build_ms: f64,
    pub average_install_ms: f64,
    pub success_rate: f64,
}

/// Finding produced by [`PerformanceMonitor::detect_bottlenecks`].
#[derive(Debug, Clone, Serialize)]
pub struct BottleneckInfo {
    pub component: String,
    pub kind: String,
    /// 0-100, higher is worse.
    pub severity: f64,
    pub description: String,
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ring capacity for the global and per-path sample buffers.
    pub capacity: usize,
    pub warning_threshold_ms: u64,
    pub memory_warning_bytes: Option<u64>,
    pub cpu_warning_percent: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            warning_threshold_ms: 1000,
            memory_warning_bytes: None,
            cpu_warning_percent: None,
        }
    }
}

struct MonitorInner {
    config: MonitorConfig,
    global: VecDeque<PerformanceSample>,
    by_path: FxHashMap<String, VecDeque<PerformanceSample>>,
}

struct MonitorShared {
    inner: RwLock<MonitorInner>,
    clock: Arc<dyn Clock>,
    slow_operation: CallbackSet<(String, u64)>,
    perf_warning: CallbackSet<(String, u64)>,
}

/// Bounded-ring performance monitor.
///
/// Cheap to clone; clones share the same rings.
#[derive(Clone)]
pub struct PerformanceMonitor {
    shared: Arc<MonitorShared>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                inner: RwLock::new(MonitorInner {
                    config,
                    global: VecDeque::new(),
                    by_path: FxHashMap::default(),
                }),
                clock,
                slow_operation: CallbackSet::new(),
                perf_warning: CallbackSet::new(),
            }),
        }
    }

    /// Begin timing a named operation; the handle records a sample when
    /// dropped or explicitly finished.
    pub fn start_operation(&self, name: impl Into<String>) -> OperationTimer {
        OperationTimer {
            monitor: self.clone(),
            name: name.into(),
            started_at_ms: self.shared.clock.now_ms(),
            error: None,
            failed: false,
            recorded: false,
        }
    }

    /// Append a sample to the global ring and the per-path ring, evicting
    /// the oldest entries beyond capacity.
    pub fn record_sample(&self, sample: PerformanceSample) {
        let (threshold, path_average) = {
            let mut inner = self.shared.inner.write();
            let capacity = inner.config.capacity.max(1);
            let threshold = inner.config.warning_threshold_ms;

            if let Some(limit) = inner.config.memory_warning_bytes {
                if sample.peak_memory_bytes.map_or(false, |m| m > limit) {
                    log::warn!(
                        "operation '{}' peak memory {} bytes exceeds limit {}",
                        sample.name,
                        sample.peak_memory_bytes.unwrap_or(0),
                        limit
                    );
                }
            }
            if let Some(limit) = inner.config.cpu_warning_percent {
                if sample.cpu_percent.map_or(false, |c| c > limit) {
                    log::warn!(
                        "operation '{}' cpu usage {:.1}% exceeds limit {:.1}%",
                        sample.name,
                        sample.cpu_percent.unwrap_or(0.0),
                        limit
                    );
                }
            }

            inner.global.push_back(sample.clone());
            while inner.global.len() > capacity {
                inner.global.pop_front();
            }

            let ring = inner.by_path.entry(sample.name.clone()).or_default();
            ring.push_back(sample.clone());
            while ring.len() > capacity {
                ring.pop_front();
            }
            let path_average = aggregate(ring.iter()).average_total_ms;

            (threshold, path_average)
        };

        if sample.total_ms > threshold {
            log::warn!(
                "slow operation '{}' took {} ms (threshold {} ms)",
                sample.name,
                sample.total_ms,
                threshold
            );
            self.shared
                .slow_operation
                .emit(&(sample.name.clone(), sample.total_ms));
        }
        if path_average > threshold as f64 {
            self.shared
                .perf_warning
                .emit(&(sample.name.clone(), path_average as u64));
        }
    }

    /// Aggregate over the global ring.
    pub fn average_metrics(&self) -> AggregateMetrics {
        aggregate(self.shared.inner.read().global.iter())
    }

    /// Aggregate over a single path's ring.
    pub fn metrics_for(&self, path: &str) -> Option<AggregateMetrics> {
        self.shared
            .inner
            .read()
            .by_path
            .get(path)
            .map(|ring| aggregate(ring.iter()))
    }

    /// Paths whose average total time exceeds `threshold_ms`, worst first.
    pub fn slow_paths(&self, threshold_ms: u64) -> Vec<(String, f64)> {
        let inner = self.shared.inner.read();
        let mut slow: Vec<(String, f64)> = inner
            .by_path
            .iter()
            .map(|(path, ring)| (path.clone(), aggregate(ring.iter()).average_total_ms))
            .filter(|(_, avg)| *avg > threshold_ms as f64)
            .collect();
        slow.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        slow
    }

    /// Fraction of successful samples in the global ring; 1.0 when empty.
    pub fn success_rate(&self) -> f64 {
        let inner = self.shared.inner.read();
        if inner.global.is_empty() {
            return 1.0;
        }
        let ok = inner.global.iter().filter(|s| s.success).count();
        ok as f64 / inner.global.len() as f64
    }

    /// 0-100 score penalising slow averages relative to the threshold.
    pub fn performance_score(&self) -> f64 {
        let (average, threshold) = {
            let inner = self.shared.inner.read();
            (
                aggregate(inner.global.iter()).average_total_ms,
                inner.config.warning_threshold_ms as f64,
            )
        };
        if average <= 0.0 {
            return 100.0;
        }
        (100.0 * (threshold / (threshold + average))).clamp(0.0, 100.0)
    }

    /// 0-100 score derived from the success rate.
    pub fn reliability_score(&self) -> f64 {
        self.success_rate() * 100.0
    }

    /// Slow-file heuristic: paths averaging more than twice the warning
    /// threshold are reported as I/O-or-build bottlenecks.
    pub fn detect_bottlenecks(&self) -> Vec<BottleneckInfo> {
        let threshold = self.shared.inner.read().config.warning_threshold_ms;
        self.slow_paths(threshold * 2)
            .into_iter()
            .map(|(path, avg)| BottleneckInfo {
                severity: (avg / threshold.max(1) as f64 * 25.0).clamp(0.0, 100.0),
                description: format!(
                    "average {:.1} ms exceeds {} ms warning threshold",
                    avg, threshold
                ),
                component: path,
                kind: "I/O".to_string(),
            })
            .collect()
    }

    /// Human-readable report over all rings.
    pub fn report(&self) -> String {
        let global = self.average_metrics();
        let mut out = String::new();
        out.push_str("=== Performance Report ===\n");
        out.push_str(&format!("Samples: {}\n", global.samples));
        out.push_str(&format!("Average total: {:.2} ms\n", global.average_total_ms));
        out.push_str(&format!(
            "  load {:.2} ms / build {:.2} ms / install {:.2} ms\n",
            global.average_load_ms, global.average_build_ms, global.average_install_ms
        ));
        out.push_str(&format!(
            "Success rate: {:.1}%\n",
            self.success_rate() * 100.0
        ));
        out.push_str(&format!(
            "Scores: performance {:.0} / reliability {:.0}\n",
            self.performance_score(),
            self.reliability_score()
        ));

        let inner = self.shared.inner.read();
        let threshold = inner.config.warning_threshold_ms;
        drop(inner);
        let slow = self.slow_paths(threshold);
        if !slow.is_empty() {
            out.push_str("Slow paths:\n");
            for (path, avg) in &slow {
                out.push_str(&format!("  {} — {:.1} ms avg\n", path, avg));
            }
        }
        out.push_str("==========================\n");
        out
    }

    /// Structured report.
    pub fn report_json(&self) -> serde_json::Value {
        let inner = self.shared.inner.read();
        let threshold = inner.config.warning_threshold_ms;
        let by_file: serde_json::Map<String, serde_json::Value> = inner
            .by_path
            .iter()
            .map(|(path, ring)| {
                (
                    path.clone(),
                    serde_json::to_value(aggregate(ring.iter())).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        drop(inner);

        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "global_average": self.average_metrics(),
            "global_success_rate": self.success_rate(),
            "by_file": by_file,
            "slow_operations": self.slow_paths(threshold)
                .into_iter()
                .map(|(path, avg)| serde_json::json!({"path": path, "average_ms": avg}))
                .collect::<Vec<_>>(),
            "bottlenecks": self.detect_bottlenecks(),
        })
    }

    /// Write a report to `path`; `.json` emits the structured form, `.txt`
    /// the human-readable one.
    pub fn export(&self, path: &Path) -> CoreResult<()> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(&self.report_json()).map_err(|e| {
                CoreError::SerializationError {
                    message: e.to_string(),
                }
            })?,
            Some("txt") => self.report(),
            other => {
                return Err(CoreError::SerializationError {
                    message: format!("unsupported report extension: {:?}", other),
                })
            }
        };
        let mut file = std::fs::File::create(path).map_err(|e| io_error(path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| io_error(path, e))
    }

    pub fn set_warning_threshold_ms(&self, threshold_ms: u64) {
        self.shared.inner.write().config.warning_threshold_ms = threshold_ms;
    }

    pub fn warning_threshold_ms(&self) -> u64 {
        self.shared.inner.read().config.warning_threshold_ms
    }

    pub fn set_memory_warning_bytes(&self, limit: Option<u64>) {
        self.shared.inner.write().config.memory_warning_bytes = limit;
    }

    pub fn set_cpu_warning_percent(&self, limit: Option<f64>) {
        self.shared.inner.write().config.cpu_warning_percent = limit;
    }

    /// Fired when an individual sample exceeds the warning threshold.
    pub fn on_slow_operation(
        &self,
        callback: impl Fn(&(String, u64)) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.slow_operation.add(callback)
    }

    /// Fired when a path's average exceeds the warning threshold.
    pub fn on_performance_warning(
        &self,
        callback: impl Fn(&(String, u64)) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.perf_warning.add(callback)
    }

    pub fn clear_history(&self) {
        let mut inner = self.shared.inner.write();
        inner.global.clear();
        inner.by_path.clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

fn aggregate<'a>(samples: impl Iterator<Item = &'a PerformanceSample>) -> AggregateMetrics {
    let mut metrics = AggregateMetrics::default();
    let mut ok = 0usize;
    let (mut total, mut load, mut build, mut install) = (0u64, 0u64, 0u64, 0u64);
    for sample in samples {
        metrics.samples += 1;
        total += sample.total_ms;
        load += sample.load_ms;
        build += sample.build_ms;
        install += sample.install_ms;
        if sample.success {
            ok += 1;
        }
    }
    if metrics.samples > 0 {
        let n = metrics.samples as f64;
        metrics.average_total_ms = total as f64 / n;
        metrics.average_load_ms = load as f64 / n;
        metrics.average_build_ms = build as f64 / n;
        metrics.average_install_ms = install as f64 / n;
        metrics.success_rate = ok as f64 / n;
    }
    metrics
}

/// Timing guard returned by [`PerformanceMonitor::start_operation`].
///
/// Records a successful sample on drop unless [`OperationTimer::fail`] was
/// called first.
pub struct OperationTimer {
    monitor: PerformanceMonitor,
    name: String,
    started_at_ms: u64,
    error: Option<String>,
    failed: bool,
    recorded: bool,
}

impl OperationTimer {
    /// Mark the operation as failed; the sample is recorded on drop.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.failed = true;
        self.error = Some(error.into());
    }

    /// Record the sample now instead of at drop.
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let now = self.monitor.shared.clock.now_ms();
        let mut sample = PerformanceSample::new(
            self.name.clone(),
            self.started_at_ms,
            now.saturating_sub(self.started_at_ms),
            !self.failed,
        );
        sample.error = self.error.take();
        self.monitor.record_sample(sample);
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.record();
    }
}
