use std::any::{Any, TypeId};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::command::Value;

/// Immutable snapshot of named parameters plus a service locator.
///
/// Contexts are cheap to clone and passed by reference into
/// `execute`/`undo`. Services are shared references keyed by type.
#[derive(Clone, Default)]
pub struct CommandContext {
    params: FxHashMap<String, Value>,
    services: FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_service<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn params(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.params.iter()
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(Value::as_bool)
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.param(key).and_then(Value::as_int)
    }

    pub fn float_param(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(Value::as_float)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Shared reference to a registered service, if present.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("params", &self.params)
            .field("services", &self.services.len())
            .finish()
    }
}
