/// Task execution
///
/// The executor owns the three scheduling domains of the core:
/// - a rayon worker pool for async command bodies, watcher handlers and the
///   produce/validate steps of reload,
/// - a timer thread firing debounce, deferred-execution and batch-flush
///   timers, handing the work off to the worker pool,
/// - a single install thread through which all artifact installs funnel.
pub mod executor;

pub use executor::{
    CancellationToken, Executor, ExecutorConfig, ExecutorStats, TaskHandle, TaskOutcome,
};
