/// Hot-Reload System
///
/// Reconciles file-system changes with registered artifacts: each change is
/// debounced by the watcher, admitted against the reload delay and content
/// hash, produced and validated on the worker pool, installed on the single
/// install thread, and propagated through the include dependency graph.
/// Rollback points taken before each attempt recover from failed installs.
pub mod cache;
pub mod descriptor;
pub mod graph;
pub mod manager;
pub mod producer;
pub mod watcher;

pub use manager::{HotReloadConfig, HotReloadManager, ReloadEvent, ReloadMetrics};
pub use producer::{Artifact, ArtifactId, ArtifactInstaller, ArtifactProducer};
pub use watcher::{
    ChangeEvent, ChangeType, DebounceStrategy, FileFilter, FileWatcher, WatcherConfig,
};
