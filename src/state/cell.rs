use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::subscription::Subscription;

/// Bound required of cell value types: cloneable for history and listener
/// payloads, comparable for write deduplication, sendable across the worker
/// pool.
pub trait CellValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> CellValue for T {}

pub(crate) type ErasedValue = Box<dyn Any + Send + Sync>;
pub(crate) type ErasedListener = dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync;
pub(crate) type ErasedValidator = dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync;
pub(crate) type ErasedComputer = dyn Fn() -> ErasedValue + Send + Sync;

pub(crate) fn clone_erased<T: CellValue>(value: &(dyn Any + Send + Sync)) -> Option<ErasedValue> {
    value
        .downcast_ref::<T>()
        .map(|v| Box::new(v.clone()) as ErasedValue)
}

pub(crate) fn eq_erased<T: CellValue>(
    a: &(dyn Any + Send + Sync),
    b: &(dyn Any + Send + Sync),
) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Type-erased cell entry held by the store. The value, validator, computer,
/// listeners and history all live behind a single per-cell mutex; user
/// closures are never invoked while it is held.
pub(crate) struct CellSlot {
    pub(crate) key: String,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) clone_value: fn(&(dyn Any + Send + Sync)) -> Option<ErasedValue>,
    pub(crate) eq_values: fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool,
    pub(crate) core: Mutex<CellCore>,
}

pub(crate) struct CellCore {
    pub(crate) value: ErasedValue,
    pub(crate) validator: Option<Arc<ErasedValidator>>,
    pub(crate) computer: Option<Arc<ErasedComputer>>,
    pub(crate) listeners: Vec<(u64, Arc<ErasedListener>)>,
    pub(crate) next_listener_id: u64,
    pub(crate) history: VecDeque<ErasedValue>,
    pub(crate) history_enabled: bool,
    pub(crate) history_capacity: usize,
    pub(crate) history_position: usize,
    pub(crate) update_count: u64,
    pub(crate) last_update_ms: u64,
}

impl CellSlot {
    pub(crate) fn new<T: CellValue>(
        key: String,
        initial: T,
        computer: Option<Arc<ErasedComputer>>,
    ) -> Self {
        Self {
            key,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            clone_value: clone_erased::<T>,
            eq_values: eq_erased::<T>,
            core: Mutex::new(CellCore {
                value: Box::new(initial),
                validator: None,
                computer,
                listeners: Vec::new(),
                next_listener_id: 1,
                history: VecDeque::new(),
                history_enabled: false,
                history_capacity: 0,
                history_position: 0,
                update_count: 0,
                last_update_ms: 0,
            }),
        }
    }

    pub(crate) fn is_computed(&self) -> bool {
        self.core.lock().computer.is_some()
    }
}

/// Typed handle to a store cell.
///
/// Handles are cheap to clone and remain valid until the cell is removed
/// from the store; operations on a removed cell's handle fail with
/// `UnknownKey`.
pub struct Cell<T> {
    pub(crate) slot: Arc<CellSlot>,
    pub(crate) store: Weak<super::store::StoreShared>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: CellValue> Cell<T> {
    pub fn key(&self) -> &str {
        &self.slot.key
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        let core = self.slot.core.lock();
        core.value
            .downcast_ref::<T>()
            .cloned()
            .expect("cell value matches its declared type")
    }

    /// Write through the store's normal write path (validation, history,
    /// notification, dependent recomputation).
    pub fn set(&self, value: T) -> CoreResult<()> {
        let shared = self.store.upgrade().ok_or_else(|| CoreError::Internal {
            message: "state store dropped".to_string(),
        })?;
        super::store::StateStore::from_shared(shared).write(&self.slot.key, value)
    }

    /// Attach a listener invoked after each successful write. Dropping the
    /// returned subscription detaches it.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut core = self.slot.core.lock();
            let id = core.next_listener_id;
            core.next_listener_id += 1;
            let erased: Arc<ErasedListener> = Arc::new(move |value| {
                if let Some(typed) = value.downcast_ref::<T>() {
                    listener(typed);
                }
            });
            core.listeners.push((id, erased));
            id
        };

        let slot = Arc::downgrade(&self.slot);
        Subscription::new(move || {
            if let Some(slot) = slot.upgrade() {
                slot.core.lock().listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn is_computed(&self) -> bool {
        self.slot.is_computed()
    }

    pub fn update_count(&self) -> u64 {
        self.slot.core.lock().update_count
    }

    pub fn last_update_ms(&self) -> u64 {
        self.slot.core.lock().last_update_ms
    }

    pub fn listener_count(&self) -> usize {
        self.slot.core.lock().listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erased_clone_and_eq() {
        let a: ErasedValue = Box::new(5i64);
        let b = clone_erased::<i64>(a.as_ref()).expect("clone");
        assert!(eq_erased::<i64>(a.as_ref(), b.as_ref()));

        let c: ErasedValue = Box::new(7i64);
        assert!(!eq_erased::<i64>(a.as_ref(), c.as_ref()));

        // Mismatched type neither clones nor compares equal.
        assert!(clone_erased::<String>(a.as_ref()).is_none());
        let s: ErasedValue = Box::new("x".to_string());
        assert!(!eq_erased::<i64>(a.as_ref(), s.as_ref()));
    }

    #[test]
    fn test_slot_tracks_type() {
        let slot = CellSlot::new("count".to_string(), 0i64, None);
        assert_eq!(slot.type_id, TypeId::of::<i64>());
        assert!(!slot.is_computed());
    }
}
