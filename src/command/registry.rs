use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::command::{Command, CommandContext};
use crate::error::{CoreError, CoreResult};

type Factory = Box<dyn Fn(&CommandContext) -> Box<dyn Command> + Send + Sync>;

/// Name → factory map producing a fresh command instance per invocation.
pub struct CommandRegistry {
    factories: RwLock<FxHashMap<String, Factory>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register a factory under `name`, replacing any existing one.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&CommandContext) -> Box<dyn Command> + Send + Sync + 'static,
    ) {
        let name = name.into();
        log::debug!("command '{}' registered", name);
        self.factories.write().insert(name, Box::new(factory));
    }

    /// Remove a factory; returns false when the name was unknown.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Instantiate a fresh command for `name`.
    pub fn create(&self, name: &str, ctx: &CommandContext) -> CoreResult<Box<dyn Command>> {
        let factories = self.factories.read();
        let factory = factories.get(name).ok_or_else(|| CoreError::UnknownCommand {
            command: name.to_string(),
        })?;
        Ok(factory(ctx))
    }

    /// Registered command names, sorted.
    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
