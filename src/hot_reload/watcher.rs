use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{CoreError, CoreResult};
use crate::executor::Executor;
use crate::subscription::{CallbackSet, Subscription};
use crate::time::Clock;

/// Kind of file-system change delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Modified,
    Added,
    Removed,
}

/// Debounced change event.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub change: ChangeType,
    pub observed_at_ms: u64,
}

/// Strategy used to coalesce rapid event bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceStrategy {
    /// Always wait the configured interval of inactivity.
    Fixed,
    /// Interval grows with the recent change frequency, capped at 1000 ms.
    Adaptive,
    /// Interval doubles per successive event in a burst; an idle period of
    /// twice the base interval resets it.
    Exponential,
}

/// Declarative filter applied to events before debouncing.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    extensions: Vec<String>,
    patterns: Vec<Regex>,
    max_file_size: Option<u64>,
    include_hidden: bool,
}

impl FileFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only these extensions (case-insensitive, leading dot optional).
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    /// Accept only paths matching at least one glob pattern; patterns are
    /// precompiled here.
    pub fn with_patterns(mut self, globs: &[&str]) -> CoreResult<Self> {
        let mut patterns = Vec::with_capacity(globs.len());
        for glob in globs {
            let source = glob_to_regex(glob);
            let regex = Regex::new(&source).map_err(|e| CoreError::Internal {
                message: format!("invalid glob pattern '{}': {}", glob, e),
            })?;
            patterns.push(regex);
        }
        self.patterns = patterns;
        Ok(self)
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn with_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    /// Test a path (and its size, when known) against the filter.
    pub fn matches(&self, path: &Path, file_size: Option<u64>) -> bool {
        if !self.include_hidden {
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with('.'));
            if hidden {
                return false;
            }
        }
        if !self.extensions.is_empty() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            match ext {
                Some(ext) if self.extensions.iter().any(|e| *e == ext) => {}
                _ => return false,
            }
        }
        if !self.patterns.is_empty() {
            let text = path.to_string_lossy();
            if !self.patterns.iter().any(|p| p.is_match(&text)) {
                return false;
            }
        }
        if let (Some(limit), Some(size)) = (self.max_file_size, file_size) {
            if size > limit {
                return false;
            }
        }
        true
    }
}

/// Translate a glob into an anchored regex: `**` crosses separators, `*`
/// and `?` do not.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub strategy: DebounceStrategy,
    pub max_watched_files: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            strategy: DebounceStrategy::Fixed,
            max_watched_files: 10_000,
        }
    }
}

const ADAPTIVE_CAP_MS: u64 = 1000;
const ADAPTIVE_WINDOW_MS: u64 = 1000;

struct PendingChange {
    change: ChangeType,
    deadline_ms: u64,
    interval_ms: u64,
    last_event_ms: u64,
    window: VecDeque<u64>,
}

struct DirWatch {
    recursive: bool,
    known: FxHashSet<PathBuf>,
}

struct WatcherShared {
    clock: Arc<dyn Clock>,
    executor: Arc<Executor>,
    files: RwLock<FxHashSet<PathBuf>>,
    dirs: RwLock<FxHashMap<PathBuf, DirWatch>>,
    filter: RwLock<FileFilter>,
    debounce_ms: AtomicU64,
    strategy: RwLock<DebounceStrategy>,
    max_watched: AtomicUsize,
    observed: AtomicU64,
    filtered: AtomicU64,
    emitted: AtomicU64,
    subscribers: CallbackSet<ChangeEvent>,
    watch_started: CallbackSet<PathBuf>,
    watch_stopped: CallbackSet<PathBuf>,
    watch_failed: CallbackSet<(PathBuf, String)>,
    pending: Mutex<FxHashMap<PathBuf, PendingChange>>,
    cond: Condvar,
    shutdown: AtomicBool,
    weak_self: Weak<WatcherShared>,
}

/// Debounced file and directory watcher built on `notify`.
///
/// Raw backend events are filtered, coalesced per path in a pending map, and
/// emitted to subscribers on the executor's worker pool after the
/// strategy-chosen interval of inactivity.
pub struct FileWatcher {
    shared: Arc<WatcherShared>,
    backend: Mutex<RecommendedWatcher>,
    debounce_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig, executor: Arc<Executor>) -> CoreResult<Self> {
        let clock = executor.clock();
        let shared = Arc::new_cyclic(|weak_self| WatcherShared {
            clock,
            executor,
            files: RwLock::new(FxHashSet::default()),
            dirs: RwLock::new(FxHashMap::default()),
            filter: RwLock::new(FileFilter::new()),
            debounce_ms: AtomicU64::new(config.debounce_ms),
            strategy: RwLock::new(config.strategy),
            max_watched: AtomicUsize::new(config.max_watched_files),
            observed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            subscribers: CallbackSet::new(),
            watch_started: CallbackSet::new(),
            watch_stopped: CallbackSet::new(),
            watch_failed: CallbackSet::new(),
            pending: Mutex::new(FxHashMap::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let backend = {
            let shared = shared.clone();
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => shared.ingest_raw(event),
                    Err(e) => log::warn!("watch backend error: {}", e),
                }
            })
            .map_err(|e| CoreError::BackendFailure {
                path: PathBuf::new(),
                message: e.to_string(),
            })?
        };

        let debounce_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("pulse-debounce".to_string())
                .spawn(move || shared.debounce_loop())
                .map_err(|e| CoreError::Internal {
                    message: format!("failed to spawn debounce thread: {}", e),
                })?
        };

        Ok(Self {
            shared,
            backend: Mutex::new(backend),
            debounce_thread: Mutex::new(Some(debounce_thread)),
        })
    }

    /// Watch a single file. Returns the canonical path under which events
    /// will be reported.
    pub fn watch_file(&self, path: &Path) -> CoreResult<PathBuf> {
        let canonical = std::fs::canonicalize(path).map_err(|_| CoreError::PathInvalid {
            path: path.to_path_buf(),
        })?;
        if !canonical.is_file() {
            return Err(CoreError::PathInvalid {
                path: path.to_path_buf(),
            });
        }
        if self.shared.files.read().contains(&canonical) {
            return Err(CoreError::DuplicateRegistration { path: canonical });
        }
        let watched = self.shared.files.read().len() + self.shared.dirs.read().len();
        if watched >= self.shared.max_watched.load(Ordering::Relaxed) {
            return Err(CoreError::BackendFailure {
                path: canonical,
                message: "watch limit reached".to_string(),
            });
        }

        if let Err(e) = self
            .backend
            .lock()
            .watch(&canonical, RecursiveMode::NonRecursive)
        {
            let message = e.to_string();
            self.shared
                .watch_failed
                .emit(&(canonical.clone(), message.clone()));
            return Err(CoreError::BackendFailure {
                path: canonical,
                message,
            });
        }

        self.shared.files.write().insert(canonical.clone());
        self.shared.watch_started.emit(&canonical);
        log::debug!("watching file {}", canonical.display());
        Ok(canonical)
    }

    /// Watch a directory; matching children are tracked and newly discovered
    /// files emit `Added`.
    pub fn watch_directory(&self, path: &Path, recursive: bool) -> CoreResult<PathBuf> {
        let canonical = std::fs::canonicalize(path).map_err(|_| CoreError::PathInvalid {
            path: path.to_path_buf(),
        })?;
        if !canonical.is_dir() {
            return Err(CoreError::PathInvalid {
                path: path.to_path_buf(),
            });
        }
        if self.shared.dirs.read().contains_key(&canonical) {
            return Err(CoreError::DuplicateRegistration { path: canonical });
        }

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(e) = self.backend.lock().watch(&canonical, mode) {
            let message = e.to_string();
            self.shared
                .watch_failed
                .emit(&(canonical.clone(), message.clone()));
            return Err(CoreError::BackendFailure {
                path: canonical,
                message,
            });
        }

        let known = {
            let filter = self.shared.filter.read();
            scan_directory(&canonical, recursive, &filter)
        };
        self.shared.dirs.write().insert(
            canonical.clone(),
            DirWatch { recursive, known },
        );
        self.shared.watch_started.emit(&canonical);
        log::debug!(
            "watching directory {} (recursive: {})",
            canonical.display(),
            recursive
        );
        Ok(canonical)
    }

    pub fn watch_files(&self, paths: &[&Path]) -> CoreResult<Vec<PathBuf>> {
        paths.iter().map(|p| self.watch_file(p)).collect()
    }

    pub fn watch_directories(&self, paths: &[&Path], recursive: bool) -> CoreResult<Vec<PathBuf>> {
        paths
            .iter()
            .map(|p| self.watch_directory(p, recursive))
            .collect()
    }

    /// Stop watching a file or directory.
    pub fn unwatch(&self, path: &Path) -> CoreResult<()> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.shared.files.write().remove(&canonical) {
            let _ = self.backend.lock().unwatch(&canonical);
            self.shared.pending.lock().remove(&canonical);
            self.shared.watch_stopped.emit(&canonical);
            return Ok(());
        }
        if self.shared.dirs.write().remove(&canonical).is_some() {
            let _ = self.backend.lock().unwatch(&canonical);
            self.shared.watch_stopped.emit(&canonical);
            return Ok(());
        }
        Err(CoreError::PathInvalid { path: canonical })
    }

    pub fn unwatch_all(&self) {
        let files: Vec<PathBuf> = self.shared.files.write().drain().collect();
        let dirs: Vec<PathBuf> = self.shared.dirs.write().drain().map(|(k, _)| k).collect();
        let mut backend = self.backend.lock();
        for path in files.iter().chain(dirs.iter()) {
            let _ = backend.unwatch(path);
            self.shared.watch_stopped.emit(path);
        }
        self.shared.pending.lock().clear();
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.shared.files.read().contains(&canonical)
            || self.shared.dirs.read().contains_key(&canonical)
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.shared.files.read().iter().cloned().collect()
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.shared.dirs.read().keys().cloned().collect()
    }

    pub fn set_debounce(&self, interval_ms: u64) {
        self.shared.debounce_ms.store(interval_ms, Ordering::Relaxed);
    }

    pub fn set_debounce_strategy(&self, strategy: DebounceStrategy) {
        *self.shared.strategy.write() = strategy;
    }

    pub fn set_filter(&self, filter: FileFilter) {
        *self.shared.filter.write() = filter;
    }

    pub fn set_max_watched_files(&self, max: usize) {
        self.shared.max_watched.store(max, Ordering::Relaxed);
    }

    /// Subscribe to debounced change events. Handlers run on the executor's
    /// worker pool and must not block.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.subscribers.add(callback)
    }

    pub fn on_watch_started(
        &self,
        callback: impl Fn(&PathBuf) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.watch_started.add(callback)
    }

    pub fn on_watch_stopped(
        &self,
        callback: impl Fn(&PathBuf) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.watch_stopped.add(callback)
    }

    pub fn on_watch_failed(
        &self,
        callback: impl Fn(&(PathBuf, String)) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.watch_failed.add(callback)
    }

    pub fn events_observed(&self) -> u64 {
        self.shared.observed.load(Ordering::Relaxed)
    }

    pub fn events_filtered(&self) -> u64 {
        self.shared.filtered.load(Ordering::Relaxed)
    }

    pub fn events_emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(handle) = self.debounce_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl WatcherShared {
    fn ingest_raw(&self, event: notify::Event) {
        let change = match event.kind {
            EventKind::Create(_) => ChangeType::Added,
            EventKind::Modify(_) => ChangeType::Modified,
            EventKind::Remove(_) => ChangeType::Removed,
            _ => return,
        };
        for path in event.paths {
            self.ingest(path, change);
        }
    }

    /// Route one raw event: resolve directory semantics, filter, then fold
    /// into the pending map with a strategy-chosen deadline.
    fn ingest(&self, path: PathBuf, change: ChangeType) {
        self.observed.fetch_add(1, Ordering::Relaxed);

        // A watched directory itself changed: rescan its children off-thread.
        if self.dirs.read().contains_key(&path) {
            if let Some(shared) = self.weak_self.upgrade() {
                let dir = path.clone();
                self.executor.spawn(move || shared.rescan(&dir));
            }
            return;
        }

        let mut change = change;
        let explicit = self.files.read().contains(&path);
        if !explicit {
            // Only events under a watched directory are interesting.
            let Some(owner) = self.owning_dir(&path) else {
                return;
            };
            let mut dirs = self.dirs.write();
            let Some(dir_watch) = dirs.get_mut(&owner) else {
                return;
            };
            match change {
                ChangeType::Removed => {
                    if !dir_watch.known.remove(&path) {
                        return;
                    }
                }
                ChangeType::Added => {
                    dir_watch.known.insert(path.clone());
                }
                ChangeType::Modified => {
                    // First sighting of a file in a watched directory is an
                    // addition from the subscriber's point of view.
                    if dir_watch.known.insert(path.clone()) {
                        change = ChangeType::Added;
                    }
                }
            }
        }

        let size = std::fs::metadata(&path).ok().map(|m| m.len());
        if !self.filter.read().matches(&path, size) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.push_pending(path, change);
    }

    fn owning_dir(&self, path: &Path) -> Option<PathBuf> {
        let dirs = self.dirs.read();
        let parent = path.parent()?;
        if dirs.contains_key(parent) {
            return Some(parent.to_path_buf());
        }
        for (dir, watch) in dirs.iter() {
            if watch.recursive && path.starts_with(dir) {
                return Some(dir.clone());
            }
        }
        None
    }

    fn push_pending(&self, path: PathBuf, change: ChangeType) {
        let now = self.clock.now_ms();
        let base = self.debounce_ms.load(Ordering::Relaxed).max(1);
        let strategy = *self.strategy.read();

        let mut pending = self.pending.lock();
        let entry = pending.entry(path).or_insert_with(|| PendingChange {
            change,
            deadline_ms: 0,
            interval_ms: base,
            last_event_ms: 0,
            window: VecDeque::new(),
        });

        let interval = match strategy {
            DebounceStrategy::Fixed => base,
            DebounceStrategy::Adaptive => {
                while entry
                    .window
                    .front()
                    .map_or(false, |t| now.saturating_sub(*t) > ADAPTIVE_WINDOW_MS)
                {
                    entry.window.pop_front();
                }
                entry.window.push_back(now);
                (base * entry.window.len() as u64).min(ADAPTIVE_CAP_MS)
            }
            DebounceStrategy::Exponential => {
                if entry.last_event_ms == 0 || now.saturating_sub(entry.last_event_ms) >= 2 * base {
                    base
                } else {
                    entry.interval_ms.saturating_mul(2)
                }
            }
        };

        entry.change = change;
        entry.interval_ms = interval;
        entry.last_event_ms = now;
        entry.deadline_ms = now + interval;
        drop(pending);
        self.cond.notify_one();
    }

    fn rescan(&self, dir: &Path) {
        let (recursive, previous) = {
            let dirs = self.dirs.read();
            let Some(watch) = dirs.get(dir) else { return };
            (watch.recursive, watch.known.clone())
        };
        let current = {
            let filter = self.filter.read();
            scan_directory(dir, recursive, &filter)
        };

        for added in current.difference(&previous) {
            self.push_pending(added.clone(), ChangeType::Added);
        }
        for removed in previous.difference(&current) {
            self.push_pending(removed.clone(), ChangeType::Removed);
        }

        if let Some(watch) = self.dirs.write().get_mut(dir) {
            watch.known = current;
        }
    }

    fn debounce_loop(self: Arc<Self>) {
        let mut pending = self.pending.lock();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let now = self.clock.now_ms();
            let due: Vec<PathBuf> = pending
                .iter()
                .filter(|(_, p)| p.deadline_ms <= now)
                .map(|(path, _)| path.clone())
                .collect();
            if !due.is_empty() {
                let mut events = Vec::with_capacity(due.len());
                for path in due {
                    if let Some(p) = pending.remove(&path) {
                        events.push(ChangeEvent {
                            path,
                            change: p.change,
                            observed_at_ms: p.last_event_ms,
                        });
                    }
                }
                MutexGuard::unlocked(&mut pending, || {
                    for event in events {
                        self.emitted.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "change event {:?} for {}",
                            event.change,
                            event.path.display()
                        );
                        let subscribers = self.subscribers.clone();
                        self.executor.spawn(move || subscribers.emit(&event));
                    }
                });
                continue;
            }

            match pending.values().map(|p| p.deadline_ms).min() {
                Some(deadline) => {
                    let wait = deadline.saturating_sub(self.clock.now_ms()).max(1);
                    self.cond
                        .wait_for(&mut pending, Duration::from_millis(wait));
                }
                None => {
                    self.cond.wait(&mut pending);
                }
            }
        }
    }
}

fn scan_directory(dir: &Path, recursive: bool, filter: &FileFilter) -> FxHashSet<PathBuf> {
    let mut found = FxHashSet::default();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    stack.push(path);
                }
            } else {
                let size = entry.metadata().ok().map(|m| m.len());
                if filter.matches(&path, size) {
                    found.insert(path);
                }
            }
        }
    }
    found
}
