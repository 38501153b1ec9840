//! Built-in state commands.
//!
//! Cell-writing commands bridging the command engine and the state store.
//! The store is located through the command context's service locator;
//! parameters name the target cell and the value to apply.

use serde_json::Value as JsonValue;

use crate::command::{
    Command, CommandContext, CommandDescriptor, CommandRegistry, CommandResult, Value,
};
use crate::error::CoreError;
use crate::state::StateStore;

pub const SET_STATE: &str = "state.set";
pub const DELETE_STATE: &str = "state.delete";
pub const BATCH_STATE: &str = "state.batch";

fn store_service(ctx: &CommandContext, command: &str) -> Result<std::sync::Arc<StateStore>, CoreError> {
    ctx.service::<StateStore>()
        .ok_or_else(|| CoreError::CommandFailed {
            command: command.to_string(),
            message: "no StateStore service in context".to_string(),
        })
}

fn key_param(ctx: &CommandContext, command: &str) -> Result<String, CoreError> {
    ctx.str_param("key")
        .map(str::to_string)
        .ok_or_else(|| CoreError::CommandFailed {
            command: command.to_string(),
            message: "missing 'key' parameter".to_string(),
        })
}

/// Writes a primitive value into a cell; undo restores the previous value.
pub struct SetStateCommand {
    descriptor: CommandDescriptor,
    previous: Option<JsonValue>,
}

impl SetStateCommand {
    pub fn new() -> Self {
        Self {
            descriptor: CommandDescriptor::new(SET_STATE)
                .with_description("write a value into a state cell"),
            previous: None,
        }
    }
}

impl Default for SetStateCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for SetStateCommand {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
        let store = store_service(ctx, SET_STATE)?;
        let key = key_param(ctx, SET_STATE)?;
        let value = ctx
            .param("value")
            .and_then(Value::to_json)
            .ok_or_else(|| CoreError::CommandFailed {
                command: SET_STATE.to_string(),
                message: "missing or non-primitive 'value' parameter".to_string(),
            })?;

        self.previous = store.value_json(&key);
        store.write_json(&key, &value)?;
        Ok(Value::Null)
    }

    fn undo(&mut self, ctx: &CommandContext) -> CommandResult {
        let store = store_service(ctx, SET_STATE)?;
        let key = key_param(ctx, SET_STATE)?;
        if let Some(previous) = &self.previous {
            store.write_json(&key, previous)?;
        }
        Ok(Value::Null)
    }

    fn can_undo(&self, _ctx: &CommandContext) -> bool {
        true
    }
}

/// Removes a cell. Not undoable: the cell's type cannot be restored from an
/// erased snapshot.
pub struct DeleteStateCommand {
    descriptor: CommandDescriptor,
}

impl DeleteStateCommand {
    pub fn new() -> Self {
        Self {
            descriptor: CommandDescriptor::new(DELETE_STATE)
                .with_description("remove a state cell"),
        }
    }
}

impl Default for DeleteStateCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for DeleteStateCommand {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
        let store = store_service(ctx, DELETE_STATE)?;
        let key = key_param(ctx, DELETE_STATE)?;
        Ok(Value::Bool(store.remove(&key)))
    }
}

/// Applies every non-`key` parameter as a cell write inside a single batch
/// epoch; undo restores the previous values, also batched.
pub struct BatchStateCommand {
    descriptor: CommandDescriptor,
    previous: Vec<(String, JsonValue)>,
}

impl BatchStateCommand {
    pub fn new() -> Self {
        Self {
            descriptor: CommandDescriptor::new(BATCH_STATE)
                .with_description("write several state cells in one epoch"),
            previous: Vec::new(),
        }
    }
}

impl Default for BatchStateCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for BatchStateCommand {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
        let store = store_service(ctx, BATCH_STATE)?;

        let mut writes: Vec<(String, JsonValue)> = Vec::new();
        for (key, value) in ctx.params() {
            if key == "key" {
                continue;
            }
            if let Some(json) = value.to_json() {
                writes.push((key.clone(), json));
            }
        }
        writes.sort_by(|a, b| a.0.cmp(&b.0));

        self.previous = writes
            .iter()
            .filter_map(|(key, _)| store.value_json(key).map(|v| (key.clone(), v)))
            .collect();

        let mut applied = 0i64;
        store.batch(|| {
            for (key, value) in &writes {
                match store.write_json(key, value) {
                    Ok(()) => applied += 1,
                    Err(e) => log::warn!("batched write to '{}' skipped: {}", key, e),
                }
            }
        });
        Ok(Value::Int(applied))
    }

    fn undo(&mut self, ctx: &CommandContext) -> CommandResult {
        let store = store_service(ctx, BATCH_STATE)?;
        let previous = std::mem::take(&mut self.previous);
        store.batch(|| {
            for (key, value) in &previous {
                if let Err(e) = store.write_json(key, value) {
                    log::warn!("batched undo of '{}' skipped: {}", key, e);
                }
            }
        });
        self.previous = previous;
        Ok(Value::Null)
    }

    fn can_undo(&self, _ctx: &CommandContext) -> bool {
        true
    }
}

/// Register the built-in state commands on a registry.
pub fn register_builtin_commands(registry: &CommandRegistry) {
    registry.register(SET_STATE, |_ctx| Box::new(SetStateCommand::new()));
    registry.register(DELETE_STATE, |_ctx| Box::new(DeleteStateCommand::new()));
    registry.register(BATCH_STATE, |_ctx| Box::new(BatchStateCommand::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_state_and_undo() {
        let store = Arc::new(StateStore::new());
        store.create("volume", 30i64).expect("create");

        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("key", "volume")
            .with_param("value", 80i64);

        let mut command = SetStateCommand::new();
        command.execute(&ctx).expect("execute");
        assert_eq!(store.value::<i64>("volume").expect("volume"), 80);

        command.undo(&ctx).expect("undo");
        assert_eq!(store.value::<i64>("volume").expect("volume"), 30);
    }

    #[test]
    fn test_set_state_requires_key() {
        let store = Arc::new(StateStore::new());
        let ctx = CommandContext::new()
            .with_service(store)
            .with_param("value", 1i64);
        let err = SetStateCommand::new().execute(&ctx).expect_err("no key");
        assert_eq!(err.code(), "command.failed");
    }

    #[test]
    fn test_delete_state() {
        let store = Arc::new(StateStore::new());
        store.create("tmp", 1i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("key", "tmp");

        let result = DeleteStateCommand::new().execute(&ctx).expect("execute");
        assert_eq!(result, Value::Bool(true));
        assert!(store.get::<i64>("tmp").is_none());
    }

    #[test]
    fn test_batch_state_single_epoch() {
        let store = Arc::new(StateStore::new());
        let a = store.create("a", 0i64).expect("a");
        store.create("b", 0i64).expect("b");

        let notified = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let n = notified.clone();
        let _sub = a.subscribe(move |_| {
            n.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("a", 1i64)
            .with_param("b", 2i64);

        let mut command = BatchStateCommand::new();
        let result = command.execute(&ctx).expect("execute");
        assert_eq!(result, Value::Int(2));
        assert_eq!(store.value::<i64>("a").expect("a"), 1);
        assert_eq!(store.value::<i64>("b").expect("b"), 2);
        assert_eq!(notified.load(std::sync::atomic::Ordering::SeqCst), 1);

        command.undo(&ctx).expect("undo");
        assert_eq!(store.value::<i64>("a").expect("a"), 0);
        assert_eq!(store.value::<i64>("b").expect("b"), 0);
    }

    #[test]
    fn test_register_builtin_commands() {
        let registry = CommandRegistry::new();
        register_builtin_commands(&registry);
        assert!(registry.contains(SET_STATE));
        assert!(registry.contains(DELETE_STATE));
        assert!(registry.contains(BATCH_STATE));
    }
}
