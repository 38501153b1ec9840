pub mod command;
pub mod error;
pub mod executor;
pub mod hot_reload;
pub mod profiling;
pub mod state;
pub mod subscription;
pub mod time;

use std::sync::{Arc, OnceLock};

use crate::command::{builtin, CommandManager, CommandRegistry};
use crate::error::CoreResult;
use crate::executor::{Executor, ExecutorConfig};
use crate::hot_reload::{
    ArtifactInstaller, ArtifactProducer, HotReloadConfig, HotReloadManager,
};
use crate::profiling::{MonitorConfig, PerformanceMonitor};

pub use crate::command::{
    Command, CommandContext, CommandDescriptor, CommandId, CommandInterceptor, CommandPriority,
    CommandResult, CommandState, CompositeCommand, ExecutionMode, RetryPolicy, Value,
};
pub use crate::error::{CoreError, ReloadStage};
pub use crate::hot_reload::{Artifact, ArtifactId, ReloadEvent};
pub use crate::state::{Cell, StateStore};
pub use crate::subscription::Subscription;

/// Top-level core configuration.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    pub hot_reload: HotReloadConfig,
}

/// The reactive core: a state store, a command engine and an executor wired
/// together, with an optional hot-reload manager attached on demand.
pub struct Core {
    executor: Arc<Executor>,
    store: StateStore,
    registry: Arc<CommandRegistry>,
    commands: CommandManager,
    monitor: PerformanceMonitor,
    hot_reload_config: HotReloadConfig,
}

impl Core {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        let executor = Arc::new(Executor::new(config.executor)?);
        let monitor =
            PerformanceMonitor::with_clock(config.monitor, executor.clock());
        let store = StateStore::with_clock(executor.clock());
        let registry = Arc::new(CommandRegistry::new());
        builtin::register_builtin_commands(&registry);
        let commands = CommandManager::new(registry.clone(), executor.clone());

        Ok(Self {
            executor,
            store,
            registry,
            commands,
            monitor,
            hot_reload_config: config.hot_reload,
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn commands(&self) -> &CommandManager {
        &self.commands
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Build a hot-reload manager sharing this core's executor and monitor.
    pub fn attach_hot_reload(
        &self,
        producer: Arc<dyn ArtifactProducer>,
        installer: Arc<dyn ArtifactInstaller>,
    ) -> CoreResult<HotReloadManager> {
        HotReloadManager::new(
            self.hot_reload_config.clone(),
            self.executor.clone(),
            producer,
            installer,
            self.monitor.clone(),
        )
    }

    /// Drain running tasks; call before dropping the store.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}

static DEFAULT_STORE: OnceLock<StateStore> = OnceLock::new();

/// Process-wide store for the top-level entry point. Libraries and tests
/// should construct their own [`StateStore`] and pass it explicitly.
pub fn default_store() -> &'static StateStore {
    DEFAULT_STORE.get_or_init(StateStore::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_wires_builtins() {
        let core = Core::new(CoreConfig::default()).expect("core");
        assert!(core.registry().contains(builtin::SET_STATE));

        let store = Arc::new(core.store().clone());
        store.create("volume", 10i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("key", "volume")
            .with_param("value", 55i64);
        core.commands().execute(builtin::SET_STATE, ctx).expect("execute");
        assert_eq!(store.value::<i64>("volume").expect("volume"), 55);

        core.shutdown();
    }

    #[test]
    fn test_default_store_is_shared() {
        let a = default_store();
        a.create("shared", 1i64).expect("create");
        let b = default_store();
        assert!(b.get::<i64>("shared").is_some());
    }
}
