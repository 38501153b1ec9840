/// Performance monitoring
///
/// Passive sink tapped by the hot-reload manager and the command invoker.
/// Samples land in bounded rings (global plus per-path); aggregates, slow-path
/// lists and textual/JSON reports are derived on demand.
pub mod monitor;

pub use monitor::{
    AggregateMetrics, BottleneckInfo, MonitorConfig, OperationTimer, PerformanceMonitor,
    PerformanceSample,
};
