use std::any::TypeId;
use std::marker::PhantomData;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{CoreError, CoreResult};
use crate::state::cell::{Cell, CellSlot, CellValue, ErasedComputer, ErasedValue};
use crate::state::graph::DependencyGraph;
use crate::subscription::{CallbackSet, Subscription};
use crate::time::{Clock, MonotonicClock};

/// How a write entered the store.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// External caller; rejected for computed cells.
    External,
    /// Recomputation of a computed cell's own value.
    Recompute,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PendingKind {
    Notify,
    Recompute,
}

struct PendingEntry {
    kind: PendingKind,
    key: String,
    job: Box<dyn FnOnce() + Send>,
}

pub(crate) struct StoreShared {
    pub(crate) cells: DashMap<String, Arc<CellSlot>>,
    graph: RwLock<DependencyGraph>,
    pending: Mutex<Vec<PendingEntry>>,
    batch_depth: AtomicUsize,
    clock: Arc<dyn Clock>,
    debug: AtomicBool,
    monitoring: AtomicBool,
    warning_threshold_ms: AtomicU64,
    cell_added: CallbackSet<String>,
    cell_removed: CallbackSet<String>,
    cell_changed: CallbackSet<String>,
    perf_warning: CallbackSet<(String, u64)>,
}

/// Thread-safe reactive cell registry.
///
/// Cheap to clone; clones share the same cells. Writes take a per-cell lock;
/// listeners and computers always run outside it. Batching is store-wide:
/// while any batch epoch is open, notifications from every thread defer onto
/// the epoch queue and drain when the outermost batch closes.
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<StoreShared>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                cells: DashMap::new(),
                graph: RwLock::new(DependencyGraph::new()),
                pending: Mutex::new(Vec::new()),
                batch_depth: AtomicUsize::new(0),
                clock,
                debug: AtomicBool::new(false),
                monitoring: AtomicBool::new(false),
                warning_threshold_ms: AtomicU64::new(50),
                cell_added: CallbackSet::new(),
                cell_removed: CallbackSet::new(),
                cell_changed: CallbackSet::new(),
                perf_warning: CallbackSet::new(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<StoreShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared_cells(&self) -> &DashMap<String, Arc<CellSlot>> {
        &self.shared.cells
    }

    fn handle<T: CellValue>(&self, slot: Arc<CellSlot>) -> Cell<T> {
        Cell {
            slot,
            store: Arc::downgrade(&self.shared),
            _marker: PhantomData,
        }
    }

    /// Register a cell. Re-registering an existing key with the same type
    /// returns the existing cell and ignores `initial`; a conflicting type
    /// fails with `DuplicateKey`.
    pub fn create<T: CellValue>(&self, key: &str, initial: T) -> CoreResult<Cell<T>> {
        if let Some(existing) = self.shared.cells.get(key) {
            let slot = existing.value().clone();
            drop(existing);
            return if slot.type_id == TypeId::of::<T>() {
                Ok(self.handle(slot))
            } else {
                Err(CoreError::DuplicateKey {
                    key: key.to_string(),
                    existing: slot.type_name,
                })
            };
        }

        let slot = Arc::new(CellSlot::new(key.to_string(), initial, None));
        match self.shared.cells.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Lost a registration race; apply the same-type rule.
                let slot = entry.get().clone();
                drop(entry);
                if slot.type_id == TypeId::of::<T>() {
                    Ok(self.handle(slot))
                } else {
                    Err(CoreError::DuplicateKey {
                        key: key.to_string(),
                        existing: slot.type_name,
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot.clone());
                self.shared.cell_added.emit(&key.to_string());
                log::debug!("state cell '{}' created", key);
                Ok(self.handle(slot))
            }
        }
    }

    /// Typed lookup; absent key or mismatched type returns `None`.
    pub fn get<T: CellValue>(&self, key: &str) -> Option<Cell<T>> {
        let slot = self.shared.cells.get(key)?.value().clone();
        if slot.type_id == TypeId::of::<T>() {
            Some(self.handle(slot))
        } else {
            None
        }
    }

    /// Clone of the current value of a typed cell.
    pub fn value<T: CellValue>(&self, key: &str) -> CoreResult<T> {
        let slot = self.lookup(key)?;
        if slot.type_id != TypeId::of::<T>() {
            return Err(CoreError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                found: slot.type_name,
            });
        }
        let core = slot.core.lock();
        core.value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| CoreError::Internal {
                message: format!("cell '{}' value lost its declared type", key),
            })
    }

    /// Register a computed cell. Every dependency must already exist and may
    /// not name the cell itself; a fresh key cannot be reached by any
    /// existing edge, so the inserted edges keep the graph acyclic.
    pub fn create_computed<T: CellValue>(
        &self,
        key: &str,
        compute: impl Fn() -> T + Send + Sync + 'static,
        dependencies: &[&str],
    ) -> CoreResult<Cell<T>> {
        if let Some(existing) = self.shared.cells.get(key) {
            return Err(CoreError::DuplicateKey {
                key: key.to_string(),
                existing: existing.value().type_name,
            });
        }
        for dep in dependencies {
            if *dep == key {
                return Err(CoreError::CyclicDependency {
                    dependent: key.to_string(),
                    dependency: key.to_string(),
                });
            }
            if !self.shared.cells.contains_key(*dep) {
                return Err(CoreError::UnknownKey {
                    key: (*dep).to_string(),
                });
            }
        }

        let computer: Arc<ErasedComputer> = {
            let compute = Arc::new(compute);
            Arc::new(move || Box::new(compute()) as ErasedValue)
        };
        let initial = {
            let produced = computer();
            produced
                .downcast::<T>()
                .map(|v| *v)
                .map_err(|_| CoreError::Internal {
                    message: format!("computer for '{}' produced a foreign type", key),
                })?
        };

        let slot = Arc::new(CellSlot::new(key.to_string(), initial, Some(computer)));
        match self.shared.cells.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(CoreError::DuplicateKey {
                key: key.to_string(),
                existing: entry.get().type_name,
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot.clone());
                {
                    // A fresh key has no dependents, so these edges cannot
                    // close a cycle; edges added later go through
                    // `add_dependency`'s reachability check.
                    let mut graph = self.shared.graph.write();
                    for dep in dependencies {
                        graph.add_edge(key, dep);
                    }
                }
                self.shared.cell_added.emit(&key.to_string());
                log::debug!(
                    "computed cell '{}' created over {:?}",
                    key,
                    dependencies
                );
                Ok(self.handle(slot))
            }
        }
    }

    fn lookup(&self, key: &str) -> CoreResult<Arc<CellSlot>> {
        self.shared
            .cells
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::UnknownKey {
                key: key.to_string(),
            })
    }

    /// Validated write to a typed cell.
    pub fn write<T: CellValue>(&self, key: &str, value: T) -> CoreResult<()> {
        let slot = self.lookup(key)?;
        if slot.type_id != TypeId::of::<T>() {
            return Err(CoreError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                found: slot.type_name,
            });
        }
        self.write_slot(&slot, Box::new(value), WriteMode::External)
    }

    /// Core write path: validate, dedupe, advance history, install, then
    /// notify listeners and recompute dependents (deferred inside a batch).
    pub(crate) fn write_slot(
        &self,
        slot: &Arc<CellSlot>,
        new_value: ErasedValue,
        mode: WriteMode,
    ) -> CoreResult<()> {
        let started = self.shared.clock.now_ms();

        let bundle = {
            let mut core = slot.core.lock();
            if mode == WriteMode::External && core.computer.is_some() {
                return Err(CoreError::ComputedCellImmutable {
                    key: slot.key.clone(),
                });
            }
            if let Some(validator) = &core.validator {
                if !validator(new_value.as_ref()) {
                    return Err(CoreError::ValidationRejected {
                        key: slot.key.clone(),
                    });
                }
            }
            if (slot.eq_values)(core.value.as_ref(), new_value.as_ref()) {
                return Ok(());
            }

            if core.history_enabled {
                core.history.truncate(core.history_position + 1);
                let snapshot =
                    (slot.clone_value)(new_value.as_ref()).ok_or_else(|| CoreError::Internal {
                        message: format!("cell '{}' write carries a foreign type", slot.key),
                    })?;
                core.history.push_back(snapshot);
                while core.history.len() > core.history_capacity {
                    core.history.pop_front();
                }
                core.history_position = core.history.len() - 1;
            }

            core.value = new_value;
            core.update_count += 1;
            core.last_update_ms = self.shared.clock.now_ms();

            if self.shared.debug.load(Ordering::Relaxed) {
                log::debug!(
                    "state '{}' updated (update #{})",
                    slot.key,
                    core.update_count
                );
            }

            self.notify_bundle(slot, &core)?
        };

        self.dispatch(slot.key.clone(), bundle, mode);

        if self.shared.monitoring.load(Ordering::Relaxed) {
            let elapsed = self.shared.clock.now_ms().saturating_sub(started);
            if elapsed > self.shared.warning_threshold_ms.load(Ordering::Relaxed) {
                log::warn!("slow state write on '{}': {} ms", slot.key, elapsed);
                self.shared.perf_warning.emit(&(slot.key.clone(), elapsed));
            }
        }
        Ok(())
    }

    /// Snapshot listeners and payload under the cell lock. Listeners added
    /// after this point do not observe the triggering change.
    fn notify_bundle(
        &self,
        slot: &Arc<CellSlot>,
        core: &crate::state::cell::CellCore,
    ) -> CoreResult<NotifyBundle> {
        let payload: Arc<dyn std::any::Any + Send + Sync> = Arc::from(
            (slot.clone_value)(core.value.as_ref()).ok_or_else(|| CoreError::Internal {
                message: format!("cell '{}' value lost its declared type", slot.key),
            })?,
        );
        Ok(NotifyBundle {
            listeners: core.listeners.iter().map(|(_, l)| l.clone()).collect(),
            payload,
        })
    }

    /// Run (or defer) listener notifications for a write. Only external
    /// writes trigger dependent propagation: recompute writes are themselves
    /// driven by an [`StateStore::update_dependents`] wave that already holds
    /// the complete topological order, and re-entering it would fire
    /// downstream cells once per updated input with transiently-inconsistent
    /// values.
    fn dispatch(&self, key: String, bundle: NotifyBundle, mode: WriteMode) {
        if self.shared.batch_depth.load(Ordering::SeqCst) > 0 {
            let mut pending = self.shared.pending.lock();
            let shared = self.shared.clone();
            let notify_key = key.clone();
            pending.push(PendingEntry {
                kind: PendingKind::Notify,
                key: key.clone(),
                job: Box::new(move || {
                    bundle.run();
                    shared.cell_changed.emit(&notify_key);
                }),
            });
            if mode == WriteMode::External {
                let store = self.clone();
                let recompute_key = key.clone();
                pending.push(PendingEntry {
                    kind: PendingKind::Recompute,
                    key,
                    job: Box::new(move || store.update_dependents(&recompute_key)),
                });
            }
        } else {
            bundle.run();
            self.shared.cell_changed.emit(&key);
            if mode == WriteMode::External {
                self.update_dependents(&key);
            }
        }
    }

    /// Recompute every computed cell downstream of `key`, in topological
    /// order so each computer reads already-updated inputs. Each recompute
    /// notifies that cell's listeners exactly once; the wave drives every
    /// downstream cell itself.
    pub fn update_dependents(&self, key: &str) {
        let order = self.shared.graph.read().affected_downstream(key);
        for affected in order {
            let Some(slot) = self
                .shared
                .cells
                .get(&affected)
                .map(|entry| entry.value().clone())
            else {
                continue;
            };
            let computer = slot.core.lock().computer.clone();
            let Some(computer) = computer else { continue };
            let produced = computer();
            if let Err(e) = self.write_slot(&slot, produced, WriteMode::Recompute) {
                log::warn!("recomputation of '{}' rejected: {}", affected, e);
            }
        }
    }

    /// Remove a cell and prune its dependency edges. Returns false for an
    /// unknown key.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shared.cells.remove(key).is_some();
        if removed {
            self.shared.graph.write().remove_node(key);
            self.shared.cell_removed.emit(&key.to_string());
            log::debug!("state cell '{}' removed", key);
        }
        removed
    }

    /// Destroy every cell and edge.
    pub fn clear(&self) {
        let keys: Vec<String> = self
            .shared
            .cells
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.shared.cells.clear();
        self.shared.graph.write().clear();
        for key in keys {
            self.shared.cell_removed.emit(&key);
        }
    }

    /// Open a batch epoch: writes inside `f` apply immediately but listener
    /// notifications and dependent recomputations defer, deduplicate by key
    /// (latest payload wins) and drain when the outermost batch closes.
    /// A panicking closure still commits applied writes and drains the queue
    /// before unwinding.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.batch_depth.fetch_add(1, Ordering::SeqCst);
        let result = catch_unwind(AssertUnwindSafe(f));
        let remaining = self.shared.batch_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.drain_pending();
        }
        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    fn drain_pending(&self) {
        let drained = std::mem::take(&mut *self.shared.pending.lock());
        if drained.is_empty() {
            return;
        }

        // Dedup by (kind, key): the latest queued payload wins, executed in
        // first-insertion order.
        let mut last_index: FxHashMap<(PendingKind, String), usize> = FxHashMap::default();
        for (index, entry) in drained.iter().enumerate() {
            last_index.insert((entry.kind, entry.key.clone()), index);
        }

        let keys_in_order: Vec<(PendingKind, String)> = drained
            .iter()
            .map(|entry| (entry.kind, entry.key.clone()))
            .collect();

        let mut entries: Vec<Option<PendingEntry>> = drained.into_iter().map(Some).collect();
        let mut seen: FxHashSet<(PendingKind, String)> = FxHashSet::default();
        for key in keys_in_order {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(index) = last_index.get(&key) {
                if let Some(entry) = entries[*index].take() {
                    (entry.job)();
                }
            }
        }
    }

    /// Install a validator for subsequent writes.
    pub fn set_validator<T: CellValue>(
        &self,
        key: &str,
        validator: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> CoreResult<()> {
        let slot = self.lookup(key)?;
        if slot.type_id != TypeId::of::<T>() {
            return Err(CoreError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                found: slot.type_name,
            });
        }
        slot.core.lock().validator = Some(Arc::new(move |value| {
            value.downcast_ref::<T>().map_or(false, &validator)
        }));
        Ok(())
    }

    /// Enable a bounded undo/redo ring seeded with the current value.
    pub fn enable_history(&self, key: &str, capacity: usize) -> CoreResult<()> {
        let slot = self.lookup(key)?;
        let mut core = slot.core.lock();
        let seed = (slot.clone_value)(core.value.as_ref()).ok_or_else(|| CoreError::Internal {
            message: format!("cell '{}' value lost its declared type", key),
        })?;
        core.history_enabled = true;
        core.history_capacity = capacity.max(1);
        core.history.clear();
        core.history.push_back(seed);
        core.history_position = 0;
        Ok(())
    }

    pub fn disable_history(&self, key: &str) -> CoreResult<()> {
        let slot = self.lookup(key)?;
        let mut core = slot.core.lock();
        core.history_enabled = false;
        core.history.clear();
        core.history_position = 0;
        Ok(())
    }

    pub fn can_undo(&self, key: &str) -> bool {
        self.lookup(key).map_or(false, |slot| {
            let core = slot.core.lock();
            core.history_enabled && core.history_position > 0
        })
    }

    pub fn can_redo(&self, key: &str) -> bool {
        self.lookup(key).map_or(false, |slot| {
            let core = slot.core.lock();
            core.history_enabled
                && !core.history.is_empty()
                && core.history_position < core.history.len() - 1
        })
    }

    /// Step the history position backward and reinstall that value without
    /// validation and without pushing to history. Listeners fire and
    /// dependents recompute as for a write.
    pub fn undo(&self, key: &str) -> CoreResult<()> {
        self.step_history(key, -1)
    }

    /// Symmetric to [`StateStore::undo`].
    pub fn redo(&self, key: &str) -> CoreResult<()> {
        self.step_history(key, 1)
    }

    fn step_history(&self, key: &str, direction: i64) -> CoreResult<()> {
        let slot = self.lookup(key)?;
        let bundle = {
            let mut core = slot.core.lock();
            if !core.history_enabled {
                return Err(CoreError::HistoryBoundary {
                    key: key.to_string(),
                });
            }
            let target = core.history_position as i64 + direction;
            if target < 0 || target >= core.history.len() as i64 {
                return Err(CoreError::HistoryBoundary {
                    key: key.to_string(),
                });
            }
            core.history_position = target as usize;
            let value = (slot.clone_value)(core.history[core.history_position].as_ref())
                .ok_or_else(|| CoreError::Internal {
                    message: format!("cell '{}' history entry lost its type", key),
                })?;
            core.value = value;
            core.update_count += 1;
            core.last_update_ms = self.shared.clock.now_ms();
            self.notify_bundle(&slot, &core)?
        };
        self.dispatch(key.to_string(), bundle, WriteMode::External);
        Ok(())
    }

    /// Insert a dependency edge; rejected when it would close a cycle or an
    /// endpoint is absent.
    pub fn add_dependency(&self, dependent: &str, dependency: &str) -> CoreResult<()> {
        self.lookup(dependent)?;
        self.lookup(dependency)?;
        let mut graph = self.shared.graph.write();
        if graph.would_cycle(dependent, dependency) {
            return Err(CoreError::CyclicDependency {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        graph.add_edge(dependent, dependency);
        Ok(())
    }

    pub fn remove_dependency(&self, dependent: &str, dependency: &str) -> CoreResult<()> {
        self.lookup(dependent)?;
        self.lookup(dependency)?;
        self.shared.graph.write().remove_edge(dependent, dependency);
        Ok(())
    }

    pub fn dependencies_of(&self, key: &str) -> Vec<String> {
        self.shared.graph.read().dependencies(key)
    }

    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.shared.graph.read().dependents(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared
            .cells
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.cells.is_empty()
    }

    pub fn set_debug(&self, enabled: bool) {
        self.shared.debug.store(enabled, Ordering::Relaxed);
    }

    /// Enable the write-latency tap feeding `on_performance_warning`.
    pub fn set_monitoring(&self, enabled: bool) {
        self.shared.monitoring.store(enabled, Ordering::Relaxed);
    }

    pub fn set_warning_threshold_ms(&self, threshold_ms: u64) {
        self.shared
            .warning_threshold_ms
            .store(threshold_ms, Ordering::Relaxed);
    }

    pub fn on_cell_added(
        &self,
        callback: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.cell_added.add(callback)
    }

    pub fn on_cell_removed(
        &self,
        callback: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.cell_removed.add(callback)
    }

    pub fn on_cell_changed(
        &self,
        callback: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.cell_changed.add(callback)
    }

    pub fn on_performance_warning(
        &self,
        callback: impl Fn(&(String, u64)) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.perf_warning.add(callback)
    }

    /// Per-cell update counters, one line per cell.
    pub fn performance_report(&self) -> String {
        let mut lines: Vec<String> = self
            .shared
            .cells
            .iter()
            .map(|entry| {
                let core = entry.value().core.lock();
                format!(
                    "{}: {} updates, last at {} ms",
                    entry.key(),
                    core.update_count,
                    core.last_update_ms
                )
            })
            .collect();
        lines.sort();
        let mut out = String::from("=== State Performance ===\n");
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

struct NotifyBundle {
    listeners: Vec<Arc<crate::state::cell::ErasedListener>>,
    payload: Arc<dyn std::any::Any + Send + Sync>,
}

impl NotifyBundle {
    fn run(self) {
        for listener in &self.listeners {
            listener(self.payload.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn test_create_get_and_type_mismatch() {
        let store = StateStore::new();
        store.create("count", 1i64).expect("create");

        assert!(store.get::<i64>("count").is_some());
        assert!(store.get::<String>("count").is_none());

        // Same-type re-registration returns existing cell, initial ignored.
        let again = store.create("count", 99i64).expect("re-register");
        assert_eq!(again.get(), 1);

        let err = store.create("count", "text".to_string()).expect_err("conflict");
        assert_eq!(err.code(), "state.duplicate_key");
    }

    #[test]
    fn test_write_notifies_listeners_in_order() {
        let store = StateStore::new();
        let cell = store.create("x", 0i64).expect("create");
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let s1 = seen.clone();
        let _sub1 = cell.subscribe(move |v| s1.lock().push((1, *v)));
        let s2 = seen.clone();
        let _sub2 = cell.subscribe(move |v| s2.lock().push((2, *v)));

        store.write("x", 5i64).expect("write");
        assert_eq!(*seen.lock(), vec![(1, 5), (2, 5)]);
    }

    #[test]
    fn test_equal_write_is_noop() {
        let store = StateStore::new();
        let cell = store.create("x", 5i64).expect("create");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = cell.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store.write("x", 5i64).expect("no-op write succeeds");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(cell.update_count(), 0);
    }

    #[test]
    fn test_validator_rejects_without_side_effects() {
        let store = StateStore::new();
        let cell = store.create("age", 30i64).expect("create");
        store
            .set_validator("age", |v: &i64| *v >= 0)
            .expect("validator");
        store.enable_history("age", 10).expect("history");

        let err = store.write("age", -1i64).expect_err("rejected");
        assert_eq!(err.code(), "state.validation_rejected");
        assert_eq!(cell.get(), 30);
        assert!(!store.can_undo("age"));
    }

    #[test]
    fn test_history_undo_redo_invariant() {
        let store = StateStore::new();
        let cell = store.create("v", 1i64).expect("create");
        store.enable_history("v", 10).expect("history");

        store.write("v", 2i64).expect("write");
        store.write("v", 3i64).expect("write");

        assert!(store.can_undo("v"));
        store.undo("v").expect("undo");
        assert_eq!(cell.get(), 2);
        store.undo("v").expect("undo");
        assert_eq!(cell.get(), 1);
        assert!(!store.can_undo("v"));
        assert_eq!(
            store.undo("v").expect_err("boundary").code(),
            "state.history_boundary"
        );

        store.redo("v").expect("redo");
        assert_eq!(cell.get(), 2);
        store.redo("v").expect("redo");
        assert_eq!(cell.get(), 3);
        assert!(!store.can_redo("v"));
    }

    #[test]
    fn test_write_truncates_redo_suffix() {
        let store = StateStore::new();
        let cell = store.create("v", 1i64).expect("create");
        store.enable_history("v", 10).expect("history");

        store.write("v", 2i64).expect("write");
        store.undo("v").expect("undo");
        store.write("v", 9i64).expect("write clears redo");
        assert!(!store.can_redo("v"));
        store.undo("v").expect("undo");
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn test_history_capacity_trims_front() {
        let store = StateStore::new();
        store.create("v", 0i64).expect("create");
        store.enable_history("v", 3).expect("history");
        for i in 1..=5i64 {
            store.write("v", i).expect("write");
        }
        // Ring holds the last three values; undo twice reaches the oldest.
        store.undo("v").expect("undo");
        store.undo("v").expect("undo");
        assert!(!store.can_undo("v"));
        assert_eq!(store.value::<i64>("v").expect("value"), 3);
    }

    #[test]
    fn test_computed_cell_rejects_external_write() {
        let store = StateStore::new();
        let a = store.create("a", 2i64).expect("create");
        store
            .create_computed("double", move || a.get() * 2, &["a"])
            .expect("computed");

        let err = store.write("double", 5i64).expect_err("immutable");
        assert_eq!(err.code(), "state.computed_immutable");
    }

    #[test]
    fn test_computed_propagation() {
        let store = StateStore::new();
        let a = store.create("a", 1i64).expect("create");
        let b = store.create("b", 2i64).expect("create");
        let sum = store
            .create_computed(
                "sum",
                {
                    let (a, b) = (a.clone(), b.clone());
                    move || a.get() + b.get()
                },
                &["a", "b"],
            )
            .expect("computed");

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = sum.subscribe(move |v| s.lock().push(*v));

        store.write("a", 10i64).expect("write");
        assert_eq!(sum.get(), 12);
        assert_eq!(*seen.lock(), vec![12]);
    }

    #[test]
    fn test_chained_computed_topological_order() {
        let store = StateStore::new();
        let a = store.create("a", 1i64).expect("create");
        let sum = store
            .create_computed(
                "sum",
                {
                    let a = a.clone();
                    move || a.get() + 1
                },
                &["a"],
            )
            .expect("sum");
        let display = store
            .create_computed(
                "display",
                {
                    let sum = sum.clone();
                    move || format!("value: {}", sum.get())
                },
                &["sum"],
            )
            .expect("display");

        store.write("a", 41i64).expect("write");
        assert_eq!(display.get(), "value: 42");
    }

    #[test]
    fn test_diamond_recompute_notifies_once_with_consistent_value() {
        // a feeds b and c; d reads both. One write to a must yield exactly
        // one notification for d, computed from the updated b AND c.
        let store = StateStore::new();
        let a = store.create("a", 1i64).expect("a");
        let b = store
            .create_computed(
                "b",
                {
                    let a = a.clone();
                    move || a.get() + 1
                },
                &["a"],
            )
            .expect("b");
        let c = store
            .create_computed(
                "c",
                {
                    let a = a.clone();
                    move || a.get() * 2
                },
                &["a"],
            )
            .expect("c");
        let d = store
            .create_computed(
                "d",
                {
                    let (b, c) = (b.clone(), c.clone());
                    move || b.get() + c.get()
                },
                &["b", "c"],
            )
            .expect("d");

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = d.subscribe(move |v| s.lock().push(*v));

        store.write("a", 10i64).expect("write");
        assert_eq!(d.get(), 31); // (10 + 1) + (10 * 2)
        assert_eq!(*seen.lock(), vec![31]);
    }

    #[test]
    fn test_computed_self_dependency_rejected() {
        let store = StateStore::new();
        let err = store
            .create_computed("total", || 0i64, &["total"])
            .expect_err("self dependency");
        assert_eq!(err.code(), "state.cyclic_dependency");
        assert!(store.get::<i64>("total").is_none());
    }

    #[test]
    fn test_cycle_rejected() {
        let store = StateStore::new();
        store.create("a", 0i64).expect("a");
        store.create("b", 0i64).expect("b");
        store.add_dependency("b", "a").expect("b <- a");
        let err = store.add_dependency("a", "b").expect_err("cycle");
        assert_eq!(err.code(), "state.cyclic_dependency");
        // Graph unchanged: a still has no dependencies.
        assert!(store.dependencies_of("a").is_empty());
    }

    #[test]
    fn test_dependency_requires_both_endpoints() {
        let store = StateStore::new();
        store.create("a", 0i64).expect("a");
        let err = store.add_dependency("a", "ghost").expect_err("missing");
        assert_eq!(err.code(), "state.unknown_key");
    }

    #[test]
    fn test_batch_dedupes_notifications() {
        let store = StateStore::new();
        let cell = store.create("x", 0i64).expect("create");
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = cell.subscribe(move |v| s.lock().push(*v));

        store.batch(|| {
            store.write("x", 1i64).expect("write");
            store.write("x", 2i64).expect("write");
            store.write("x", 3i64).expect("write");
            // Reads inside the batch observe applied values.
            assert_eq!(cell.get(), 3);
        });

        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_nested_batch_shares_epoch() {
        let store = StateStore::new();
        let cell = store.create("x", 0i64).expect("create");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = cell.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store.batch(|| {
            store.write("x", 1i64).expect("write");
            store.batch(|| {
                store.write("x", 2i64).expect("write");
            });
            // Inner batch close must not drain the shared epoch.
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_panic_commits_and_drains() {
        let store = StateStore::new();
        let cell = store.create("x", 0i64).expect("create");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = cell.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let result = catch_unwind(AssertUnwindSafe(|| {
            store.batch(|| {
                store.write("x", 7i64).expect("write");
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert_eq!(cell.get(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_prunes_graph_and_fires_event() {
        let store = StateStore::new();
        store.create("a", 0i64).expect("a");
        store.create("b", 0i64).expect("b");
        store.add_dependency("b", "a").expect("edge");

        let removed = Arc::new(PlMutex::new(Vec::new()));
        let r = removed.clone();
        let _sub = store.on_cell_removed(move |key| r.lock().push(key.clone()));

        assert!(store.remove("a"));
        assert!(store.dependencies_of("b").is_empty());
        assert_eq!(*removed.lock(), vec!["a".to_string()]);
        assert!(!store.remove("a"));
    }

    #[test]
    fn test_listener_added_during_notification_skips_trigger() {
        let store = StateStore::new();
        let cell = store.create("x", 0i64).expect("create");
        let late_calls = Arc::new(AtomicUsize::new(0));

        let store2 = store.clone();
        let cell2 = cell.clone();
        let late = late_calls.clone();
        let extra: Arc<PlMutex<Vec<Subscription>>> = Arc::new(PlMutex::new(Vec::new()));
        let extra2 = extra.clone();
        let _sub = cell.subscribe(move |_| {
            let late = late.clone();
            let sub = cell2.subscribe(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
            extra2.lock().push(sub);
            let _ = &store2;
        });

        store.write("x", 1i64).expect("write");
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }
}
