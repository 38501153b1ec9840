use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::error::{CoreError, CoreResult, ReloadStage};
use crate::executor::{Executor, TaskOutcome};
use crate::hot_reload::cache::{hash_content, ArtifactCache, ContentHash};
use crate::hot_reload::descriptor;
use crate::hot_reload::graph::ReloadGraph;
use crate::hot_reload::producer::{Artifact, ArtifactId, ArtifactInstaller, ArtifactProducer};
use crate::hot_reload::watcher::{
    ChangeEvent, ChangeType, FileFilter, FileWatcher, WatcherConfig,
};
use crate::profiling::{PerformanceMonitor, PerformanceSample};
use crate::subscription::{CallbackSet, Subscription};
use crate::time::Clock;

/// Hot-reload configuration.
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Master switch; when disabled, change events are dropped.
    pub enabled: bool,
    /// Additional post-debounce wait batching rapid editor saves: a change
    /// arriving sooner than this after the last successful reload of the
    /// same path is dropped.
    pub reload_delay_ms: u64,
    /// Descriptor extensions accepted by the watcher filter.
    pub extensions: Vec<String>,
    /// Upper bound on concurrently running reload pipelines.
    pub max_concurrent_reloads: usize,
    /// How long a rollback point outlives a successful reload.
    pub rollback_grace_ms: u64,
    /// Capacity of the produced-artifact LRU cache.
    pub cache_capacity: usize,
    pub watcher: WatcherConfig,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reload_delay_ms: 100,
            extensions: vec!["json".to_string()],
            max_concurrent_reloads: 4,
            rollback_grace_ms: 0,
            cache_capacity: 32,
            watcher: WatcherConfig::default(),
        }
    }
}

/// Lifecycle events emitted by the manager.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    Started { path: PathBuf },
    Completed { path: PathBuf, duration_ms: u64 },
    Failed {
        path: PathBuf,
        stage: ReloadStage,
        message: String,
    },
    /// Rollback failed too; the registration is excluded from auto-reload
    /// until re-registered.
    Degraded { path: PathBuf },
    CycleDetected { path: PathBuf },
}

/// Timing breakdown of the most recent reload of a path.
#[derive(Debug, Clone, Default)]
pub struct ReloadMetrics {
    pub total_ms: u64,
    pub load_ms: u64,
    pub build_ms: u64,
    pub install_ms: u64,
    pub success: bool,
}

struct Registration {
    identity: ArtifactId,
    last_reload_ms: u64,
    last_hash: Option<ContentHash>,
    degraded: bool,
    pipeline: Arc<Mutex<()>>,
    last_metrics: Option<ReloadMetrics>,
}

type ErrorHandler = Box<dyn Fn(&Path, &CoreError) + Send + Sync>;
type RecoveryHandler = Box<dyn Fn(&Path) -> bool + Send + Sync>;

struct ReloadShared {
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    monitor: PerformanceMonitor,
    producer: Arc<dyn ArtifactProducer>,
    installer: Arc<dyn ArtifactInstaller>,
    watcher: Arc<FileWatcher>,
    registrations: DashMap<PathBuf, Registration>,
    graph: RwLock<ReloadGraph>,
    cache: Mutex<ArtifactCache>,
    rollbacks: Mutex<rustc_hash::FxHashMap<PathBuf, Artifact>>,
    enabled: AtomicBool,
    reload_delay_ms: AtomicU64,
    rollback_grace_ms: AtomicU64,
    max_concurrent: AtomicUsize,
    active: AtomicUsize,
    queue: Mutex<VecDeque<PathBuf>>,
    events: CallbackSet<ReloadEvent>,
    error_handler: RwLock<Option<ErrorHandler>>,
    recovery_handler: RwLock<Option<RecoveryHandler>>,
    total_reloads: AtomicU64,
    successful_reloads: AtomicU64,
    failed_reloads: AtomicU64,
    started_at_ms: u64,
    weak_self: Weak<ReloadShared>,
}

/// Registers artifacts against descriptor paths, resolves change events into
/// reload pipelines, and owns rollback.
pub struct HotReloadManager {
    shared: Arc<ReloadShared>,
    _watch_sub: Subscription,
}

impl HotReloadManager {
    pub fn new(
        config: HotReloadConfig,
        executor: Arc<Executor>,
        producer: Arc<dyn ArtifactProducer>,
        installer: Arc<dyn ArtifactInstaller>,
        monitor: PerformanceMonitor,
    ) -> CoreResult<Self> {
        let watcher = Arc::new(FileWatcher::new(config.watcher.clone(), executor.clone())?);
        let extensions: Vec<&str> = config.extensions.iter().map(String::as_str).collect();
        watcher.set_filter(FileFilter::new().with_extensions(&extensions));

        let clock = executor.clock();
        let started_at_ms = clock.now_ms();
        let shared = Arc::new_cyclic(|weak_self| ReloadShared {
            executor,
            clock,
            monitor,
            producer,
            installer,
            watcher: watcher.clone(),
            registrations: DashMap::new(),
            graph: RwLock::new(ReloadGraph::new()),
            cache: Mutex::new(ArtifactCache::new(config.cache_capacity)),
            rollbacks: Mutex::new(rustc_hash::FxHashMap::default()),
            enabled: AtomicBool::new(config.enabled),
            reload_delay_ms: AtomicU64::new(config.reload_delay_ms),
            rollback_grace_ms: AtomicU64::new(config.rollback_grace_ms),
            max_concurrent: AtomicUsize::new(config.max_concurrent_reloads.max(1)),
            active: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            events: CallbackSet::new(),
            error_handler: RwLock::new(None),
            recovery_handler: RwLock::new(None),
            total_reloads: AtomicU64::new(0),
            successful_reloads: AtomicU64::new(0),
            failed_reloads: AtomicU64::new(0),
            started_at_ms,
            weak_self: weak_self.clone(),
        });

        let watch_sub = {
            let weak = Arc::downgrade(&shared);
            watcher.subscribe(move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_change(event);
                }
            })
        };

        Ok(Self {
            shared,
            _watch_sub: watch_sub,
        })
    }

    /// Canonicalise `path`, snapshot the current artifact for the identity,
    /// record the registration (replacing any prior identity for the path),
    /// build its include edges, and start watching the file.
    pub fn register(&self, path: &Path, identity: ArtifactId) -> CoreResult<PathBuf> {
        let canonical = std::fs::canonicalize(path).map_err(|_| CoreError::PathInvalid {
            path: path.to_path_buf(),
        })?;

        // The snapshot both validates the identity and primes the installer.
        self.shared.installer.snapshot(identity)?;

        let bytes = std::fs::read(&canonical).ok();
        let last_hash = bytes.as_deref().map(hash_content);

        self.shared.registrations.insert(
            canonical.clone(),
            Registration {
                identity,
                last_reload_ms: 0,
                last_hash,
                degraded: false,
                pipeline: Arc::new(Mutex::new(())),
                last_metrics: None,
            },
        );

        if let Some(bytes) = &bytes {
            self.shared.refresh_dependencies(&canonical, bytes, &[]);
        }

        match self.shared.watcher.watch_file(&canonical) {
            Ok(_) => {}
            Err(CoreError::DuplicateRegistration { .. }) => {}
            Err(e) => return Err(e),
        }

        log::info!("registered {} as {}", canonical.display(), identity);
        Ok(canonical)
    }

    /// Watch every matching file in a directory. Files only reload once
    /// registered or reachable through the include graph.
    pub fn register_directory(&self, path: &Path, recursive: bool) -> CoreResult<PathBuf> {
        self.shared.watcher.watch_directory(path, recursive)
    }

    pub fn unregister(&self, path: &Path) -> bool {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let removed = self.shared.registrations.remove(&canonical).is_some();
        if removed {
            self.shared.rollbacks.lock().remove(&canonical);
            self.shared.graph.write().remove(&canonical);
            let _ = self.shared.watcher.unwatch(&canonical);
            log::info!("unregistered {}", canonical.display());
        }
        removed
    }

    pub fn unregister_all(&self) {
        let paths: Vec<PathBuf> = self
            .shared
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for path in paths {
            self.unregister(&path);
        }
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.shared.registrations.contains_key(&canonical)
    }

    pub fn registered_paths(&self) -> Vec<PathBuf> {
        self.shared
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        log::info!("hot reload {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn set_reload_delay(&self, delay_ms: u64) {
        self.shared.reload_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn set_filters(&self, extensions: &[&str]) {
        self.shared
            .watcher
            .set_filter(FileFilter::new().with_extensions(extensions));
    }

    pub fn set_error_handler(&self, handler: impl Fn(&Path, &CoreError) + Send + Sync + 'static) {
        *self.shared.error_handler.write() = Some(Box::new(handler));
    }

    /// Consulted after a failed rollback; returning true suppresses the
    /// degraded marking.
    pub fn set_recovery_handler(&self, handler: impl Fn(&Path) -> bool + Send + Sync + 'static) {
        *self.shared.recovery_handler.write() = Some(Box::new(handler));
    }

    /// Manual reload: runs the pipeline on the calling thread, bypassing the
    /// reload-delay admission.
    pub fn reload(&self, path: &Path) -> CoreResult<()> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.shared.registrations.contains_key(&canonical) {
            return Err(CoreError::PathInvalid { path: canonical });
        }
        let mut visited = FxHashSet::default();
        visited.insert(canonical.clone());
        self.shared
            .run_pipeline(&canonical, Trigger::Manual, &mut visited);
        Ok(())
    }

    pub fn reload_all(&self) {
        for path in self.registered_paths() {
            if let Err(e) = self.reload(&path) {
                log::warn!("reload_all: {}", e);
            }
        }
    }

    pub fn reload_batch(&self, paths: &[&Path]) {
        for path in paths {
            if let Err(e) = self.reload(path) {
                log::warn!("reload_batch: {}", e);
            }
        }
    }

    pub fn clear_rollback_points(&self) {
        self.shared.rollbacks.lock().clear();
    }

    pub fn on_event(&self, callback: impl Fn(&ReloadEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.events.add(callback)
    }

    pub fn last_metrics(&self, path: &Path) -> Option<ReloadMetrics> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.shared
            .registrations
            .get(&canonical)
            .and_then(|reg| reg.last_metrics.clone())
    }

    pub fn performance_report(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_ms": self.shared.clock.now_ms().saturating_sub(self.shared.started_at_ms),
            "total_reloads": self.shared.total_reloads.load(Ordering::Relaxed),
            "successful_reloads": self.shared.successful_reloads.load(Ordering::Relaxed),
            "failed_reloads": self.shared.failed_reloads.load(Ordering::Relaxed),
            "registered": self.shared.registrations.len(),
            "cached_artifacts": self.shared.cache.lock().len(),
        })
    }

    pub fn reset_performance_counters(&self) {
        self.shared.total_reloads.store(0, Ordering::Relaxed);
        self.shared.successful_reloads.store(0, Ordering::Relaxed);
        self.shared.failed_reloads.store(0, Ordering::Relaxed);
    }

    /// The underlying watcher, for debounce and filter tuning.
    pub fn watcher(&self) -> &FileWatcher {
        &self.shared.watcher
    }
}

/// How a pipeline run was triggered; governs the admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Debounced watcher event: reload-delay and content-hash admission
    /// apply, and the artifact cache may serve the content.
    Watcher,
    /// Explicit `reload` call: always runs; the cache may serve.
    Manual,
    /// Include propagation: always runs and bypasses the cache, since the
    /// artifact depends on content beyond this descriptor's bytes.
    Propagated,
}

impl ReloadShared {
    fn handle_change(&self, event: &ChangeEvent) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if event.change == ChangeType::Removed {
            log::warn!("watched descriptor removed: {}", event.path.display());
            return;
        }

        if self.registrations.contains_key(&event.path) {
            self.schedule(event.path.clone());
            return;
        }
        // Dependency-linked path: schedule every registered artifact that
        // includes it.
        let dependents = self.graph.read().dependents_of(&event.path);
        for dependent in dependents {
            if self.registrations.contains_key(&dependent) {
                self.schedule(dependent);
            }
        }
    }

    fn schedule(&self, path: PathBuf) {
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
        let max = self.max_concurrent.load(Ordering::Relaxed);
        if self.active.load(Ordering::SeqCst) >= max {
            self.queue.lock().push_back(path);
            return;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.executor.spawn(move || shared.drain_from(path));
    }

    fn drain_from(self: Arc<Self>, first: PathBuf) {
        let mut next = Some(first);
        loop {
            if let Some(path) = next.take() {
                let mut visited = FxHashSet::default();
                visited.insert(path.clone());
                self.run_pipeline(&path, Trigger::Watcher, &mut visited);
                next = self.queue.lock().pop_front();
                continue;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.queue.lock().is_empty() {
                return;
            }
            // A racing schedule() queued a path after the drain; reclaim the
            // slot rather than strand it until the next change event.
            if self.active.fetch_add(1, Ordering::SeqCst)
                >= self.max_concurrent.load(Ordering::Relaxed)
            {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            next = self.queue.lock().pop_front();
        }
    }

    /// The reload pipeline for one path. Steps for a single path run
    /// strictly in order; pipelines for different paths overlap and
    /// serialise only at the install step.
    fn run_pipeline(&self, path: &Path, trigger: Trigger, visited: &mut FxHashSet<PathBuf>) {
        let Some((identity, pipeline, degraded, last_reload_ms, last_hash)) =
            self.registrations.get(path).map(|reg| {
                (
                    reg.identity,
                    reg.pipeline.clone(),
                    reg.degraded,
                    reg.last_reload_ms,
                    reg.last_hash,
                )
            })
        else {
            return;
        };
        if degraded {
            log::debug!("{} is degraded; reload skipped", path.display());
            return;
        }

        let _serial = pipeline.lock();

        // Admission.
        let now = self.clock.now_ms();
        if trigger == Trigger::Watcher {
            let delay = self.reload_delay_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_reload_ms) < delay {
                log::debug!("{} change dropped by reload delay", path.display());
                return;
            }
        }

        let started = now;
        let mut metrics = ReloadMetrics::default();

        // Load the descriptor and short-circuit identical content.
        let load_start = self.clock.now_ms();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(path, ReloadStage::Parse, &e.to_string(), started, metrics);
                return;
            }
        };
        let hash = hash_content(&bytes);
        metrics.load_ms = self.clock.now_ms().saturating_sub(load_start);
        if trigger == Trigger::Watcher && last_hash == Some(hash) {
            log::debug!("{} content unchanged; reload skipped", path.display());
            return;
        }

        self.events.emit(&ReloadEvent::Started {
            path: path.to_path_buf(),
        });

        // Backup: at most one rollback point per path.
        match self.installer.snapshot(identity) {
            Ok(prior) => {
                self.rollbacks.lock().insert(path.to_path_buf(), prior);
            }
            Err(e) => {
                log::warn!("no rollback point for {}: {}", path.display(), e);
            }
        }

        // Produce and validate, via the content cache when possible.
        let build_start = self.clock.now_ms();
        let cached = if trigger == Trigger::Propagated {
            None
        } else {
            self.cache.lock().get(&hash)
        };
        let artifact = match cached {
            Some(artifact) => {
                log::debug!("{} served from artifact cache", path.display());
                artifact
            }
            None => {
                let produced = match self.producer.produce(path) {
                    Ok(artifact) => artifact,
                    Err(e) => {
                        metrics.build_ms = self.clock.now_ms().saturating_sub(build_start);
                        self.fail(path, ReloadStage::Parse, &e.to_string(), started, metrics);
                        return;
                    }
                };
                if let Err(e) = self.producer.validate(&produced) {
                    metrics.build_ms = self.clock.now_ms().saturating_sub(build_start);
                    self.fail(path, ReloadStage::Validate, &e.to_string(), started, metrics);
                    return;
                }
                produced
            }
        };
        metrics.build_ms = self.clock.now_ms().saturating_sub(build_start);

        // Rebuild this node's out-edges in the reload dependency graph.
        self.refresh_dependencies(path, &bytes, &self.producer.dependencies(&artifact));

        // Install, serialised on the install thread.
        let install_start = self.clock.now_ms();
        let install_result = {
            let installer = self.installer.clone();
            let artifact = artifact.clone();
            self.executor
                .run_on_install_thread(move || installer.replace(identity, artifact))
                .wait()
        };
        metrics.install_ms = self.clock.now_ms().saturating_sub(install_start);

        match install_result {
            TaskOutcome::Completed(Ok(())) => {}
            TaskOutcome::Completed(Err(e)) => {
                self.attempt_rollback(path, identity, &e.to_string(), started, metrics);
                return;
            }
            TaskOutcome::Cancelled => {
                self.fail(
                    path,
                    ReloadStage::Install,
                    "install lane shut down",
                    started,
                    metrics,
                );
                return;
            }
            TaskOutcome::Panicked(message) => {
                self.attempt_rollback(path, identity, &message, started, metrics);
                return;
            }
        }

        // Commit.
        let finished = self.clock.now_ms();
        metrics.total_ms = finished.saturating_sub(started);
        metrics.success = true;
        self.cache.lock().put(hash, artifact);
        if let Some(mut reg) = self.registrations.get_mut(path) {
            reg.last_reload_ms = finished;
            reg.last_hash = Some(hash);
            reg.last_metrics = Some(metrics.clone());
        }
        self.drop_rollback_after_grace(path);
        self.total_reloads.fetch_add(1, Ordering::Relaxed);
        self.successful_reloads.fetch_add(1, Ordering::Relaxed);
        self.record_sample(path, started, &metrics, None);
        self.events.emit(&ReloadEvent::Completed {
            path: path.to_path_buf(),
            duration_ms: metrics.total_ms,
        });
        log::info!(
            "reloaded {} in {} ms (load {} / build {} / install {})",
            path.display(),
            metrics.total_ms,
            metrics.load_ms,
            metrics.build_ms,
            metrics.install_ms
        );
        drop(_serial);

        // Propagate through the reverse include graph; a second visit to a
        // node in this wave is a cycle and is dropped.
        let dependents = self.graph.read().dependents_of(path);
        for dependent in dependents {
            if !visited.insert(dependent.clone()) {
                log::warn!(
                    "include cycle detected while propagating {}",
                    dependent.display()
                );
                self.events.emit(&ReloadEvent::CycleDetected { path: dependent });
                continue;
            }
            if self.registrations.contains_key(&dependent) {
                self.run_pipeline(&dependent, Trigger::Propagated, visited);
            }
        }
    }

    /// Merge core-parsed includes with producer-reported dependencies and
    /// install them as this node's out-edges; include files are watched so
    /// their changes propagate.
    fn refresh_dependencies(&self, path: &Path, bytes: &[u8], extra: &[PathBuf]) {
        let mut includes = match descriptor::includes_of_bytes(path, bytes) {
            Ok(includes) => includes,
            Err(e) => {
                log::debug!("{}: {}", path.display(), e);
                Vec::new()
            }
        };
        includes.extend(extra.iter().cloned());
        self.graph.write().set_dependencies(path, &includes);

        for include in &includes {
            match self.watcher.watch_file(include) {
                Ok(_) => {}
                Err(CoreError::DuplicateRegistration { .. }) => {}
                Err(e) => log::debug!("include {} not watchable: {}", include.display(), e),
            }
        }
    }

    fn attempt_rollback(
        &self,
        path: &Path,
        identity: ArtifactId,
        install_error: &str,
        started: u64,
        mut metrics: ReloadMetrics,
    ) {
        // The rollback point is consumed by the attempt.
        let prior = self.rollbacks.lock().remove(path);
        let Some(prior) = prior else {
            self.fail(path, ReloadStage::Install, install_error, started, metrics);
            return;
        };

        let rollback_result = {
            let installer = self.installer.clone();
            self.executor
                .run_on_install_thread(move || installer.replace(identity, prior))
                .wait()
        };

        match rollback_result {
            TaskOutcome::Completed(Ok(())) => {
                log::warn!(
                    "install of {} failed, rolled back to prior artifact: {}",
                    path.display(),
                    install_error
                );
                self.fail(path, ReloadStage::Install, install_error, started, metrics);
            }
            _ => {
                let recovered = self
                    .recovery_handler
                    .read()
                    .as_ref()
                    .map_or(false, |handler| handler(path));
                if recovered {
                    log::warn!("{} recovered by handler after failed rollback", path.display());
                    self.fail(path, ReloadStage::Install, install_error, started, metrics);
                    return;
                }
                if let Some(mut reg) = self.registrations.get_mut(path) {
                    reg.degraded = true;
                }
                metrics.total_ms = self.clock.now_ms().saturating_sub(started);
                self.total_reloads.fetch_add(1, Ordering::Relaxed);
                self.failed_reloads.fetch_add(1, Ordering::Relaxed);
                self.record_sample(path, started, &metrics, Some("rollback failed"));
                let error = CoreError::ReloadFailed {
                    stage: ReloadStage::Rollback,
                    path: path.to_path_buf(),
                    message: format!("install failed ({}) and rollback failed", install_error),
                };
                self.notify_error(path, &error);
                self.events.emit(&ReloadEvent::Failed {
                    path: path.to_path_buf(),
                    stage: ReloadStage::Rollback,
                    message: error.to_string(),
                });
                self.events.emit(&ReloadEvent::Degraded {
                    path: path.to_path_buf(),
                });
            }
        }
    }

    fn fail(
        &self,
        path: &Path,
        stage: ReloadStage,
        message: &str,
        started: u64,
        mut metrics: ReloadMetrics,
    ) {
        metrics.total_ms = self.clock.now_ms().saturating_sub(started);
        metrics.success = false;
        if let Some(mut reg) = self.registrations.get_mut(path) {
            reg.last_metrics = Some(metrics.clone());
        }
        self.total_reloads.fetch_add(1, Ordering::Relaxed);
        self.failed_reloads.fetch_add(1, Ordering::Relaxed);
        self.record_sample(path, started, &metrics, Some(message));

        let error = CoreError::ReloadFailed {
            stage,
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        log::warn!("{}", error);
        self.notify_error(path, &error);
        self.events.emit(&ReloadEvent::Failed {
            path: path.to_path_buf(),
            stage,
            message: message.to_string(),
        });
    }

    fn notify_error(&self, path: &Path, error: &CoreError) {
        if let Some(handler) = self.error_handler.read().as_ref() {
            handler(path, error);
        }
    }

    fn drop_rollback_after_grace(&self, path: &Path) {
        let grace = self.rollback_grace_ms.load(Ordering::Relaxed);
        if grace == 0 {
            self.rollbacks.lock().remove(path);
            return;
        }
        let weak = self.weak_self.clone();
        let path = path.to_path_buf();
        self.executor
            .schedule(Duration::from_millis(grace), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.rollbacks.lock().remove(&path);
                }
            });
    }

    fn record_sample(
        &self,
        path: &Path,
        started: u64,
        metrics: &ReloadMetrics,
        error: Option<&str>,
    ) {
        let mut sample = PerformanceSample::new(
            path.to_string_lossy().to_string(),
            started,
            metrics.total_ms,
            metrics.success,
        );
        sample.load_ms = metrics.load_ms;
        sample.build_ms = metrics.build_ms;
        sample.install_ms = metrics.install_ms;
        sample.error = error.map(str::to_string);
        self.monitor.record_sample(sample);
    }
}
