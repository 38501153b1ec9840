use std::any::{Any, TypeId};
use std::path::Path;

use serde_json::Value as JsonValue;

use crate::error::{io_error, CoreError, CoreResult};
use crate::state::cell::ErasedValue;
use crate::state::store::{StateStore, WriteMode};

/// Map a cell value onto a JSON primitive. Only `bool`, `i64`, `f64` and
/// `String` cells serialise; everything else is skipped by persistence.
pub(crate) fn erased_to_json(value: &(dyn Any + Send + Sync)) -> Option<JsonValue> {
    if let Some(b) = value.downcast_ref::<bool>() {
        return Some(JsonValue::Bool(*b));
    }
    if let Some(i) = value.downcast_ref::<i64>() {
        return Some(JsonValue::from(*i));
    }
    if let Some(f) = value.downcast_ref::<f64>() {
        return serde_json::Number::from_f64(*f).map(JsonValue::Number);
    }
    if let Some(s) = value.downcast_ref::<String>() {
        return Some(JsonValue::String(s.clone()));
    }
    None
}

/// Parse a JSON primitive into a value of the cell's declared type.
pub(crate) fn erased_from_json(type_id: TypeId, value: &JsonValue) -> Option<ErasedValue> {
    if type_id == TypeId::of::<bool>() {
        return value.as_bool().map(|b| Box::new(b) as ErasedValue);
    }
    if type_id == TypeId::of::<i64>() {
        return value.as_i64().map(|i| Box::new(i) as ErasedValue);
    }
    if type_id == TypeId::of::<f64>() {
        return value.as_f64().map(|f| Box::new(f) as ErasedValue);
    }
    if type_id == TypeId::of::<String>() {
        return value.as_str().map(|s| Box::new(s.to_string()) as ErasedValue);
    }
    None
}

impl StateStore {
    /// Serialise all JSON-primitive cells to `{ "<key>": <value> }`.
    /// Non-serialisable cells are skipped.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut document = serde_json::Map::new();
        for entry in self.shared_cells().iter() {
            let slot = entry.value();
            let core = slot.core.lock();
            if let Some(json) = erased_to_json(core.value.as_ref()) {
                document.insert(entry.key().clone(), json);
            }
        }
        let text = serde_json::to_string_pretty(&JsonValue::Object(document)).map_err(|e| {
            CoreError::SerializationError {
                message: e.to_string(),
            }
        })?;
        std::fs::write(path, text).map_err(|e| io_error(path, e))
    }

    /// Load a persisted document, applying each value through the normal
    /// write path (validation included). Keys without a matching cell and
    /// values that do not parse as the cell's type are skipped.
    pub fn load(&self, path: &Path) -> CoreResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        let document: JsonValue =
            serde_json::from_str(&text).map_err(|e| CoreError::SerializationError {
                message: e.to_string(),
            })?;
        let JsonValue::Object(map) = document else {
            return Err(CoreError::SerializationError {
                message: "persisted state must be a JSON object".to_string(),
            });
        };

        for (key, value) in map {
            let Some(slot) = self
                .shared_cells()
                .get(&key)
                .map(|entry| entry.value().clone())
            else {
                log::debug!("persisted key '{}' has no cell; skipped", key);
                continue;
            };
            let Some(parsed) = erased_from_json(slot.type_id, &value) else {
                log::debug!("persisted key '{}' does not parse as {}", key, slot.type_name);
                continue;
            };
            if let Err(e) = self.write_slot(&slot, parsed, WriteMode::External) {
                log::warn!("persisted write to '{}' rejected: {}", key, e);
            }
        }
        Ok(())
    }

    /// JSON snapshot of one cell's value; `None` for unknown keys and
    /// non-primitive cells.
    pub fn value_json(&self, key: &str) -> Option<JsonValue> {
        let slot = self.shared_cells().get(key)?.value().clone();
        let core = slot.core.lock();
        erased_to_json(core.value.as_ref())
    }

    /// Write a JSON primitive into an existing cell through the normal write
    /// path. Fails with `TypeMismatch` when the value does not parse as the
    /// cell's declared type.
    pub fn write_json(&self, key: &str, value: &JsonValue) -> CoreResult<()> {
        let slot = self
            .shared_cells()
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::UnknownKey {
                key: key.to_string(),
            })?;
        let parsed =
            erased_from_json(slot.type_id, value).ok_or_else(|| CoreError::TypeMismatch {
                key: key.to_string(),
                expected: slot.type_name,
                found: json_kind(value),
            })?;
        self.write_slot(&slot, parsed, WriteMode::External)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
