use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::command::invoker::CommandInvoker;
use crate::command::{Command, CommandContext, CommandRegistry, CommandResult};
use crate::error::{CoreError, CoreResult};
use crate::executor::Executor;
use crate::subscription::{CallbackSet, Subscription};

/// Cross-cutting hooks around command execution.
///
/// Returning false from `before_execute` aborts the execution with
/// `RejectedByInterceptor`; later interceptors are not consulted and
/// `on_error` fires for the rejecting interceptor and the ones before it.
pub trait CommandInterceptor: Send + Sync {
    fn before_execute(&self, _command: &dyn Command, _ctx: &CommandContext) -> bool {
        true
    }

    fn after_execute(&self, _command: &dyn Command, _ctx: &CommandContext, _result: &CommandResult) {
    }

    fn on_error(&self, _command: &dyn Command, _ctx: &CommandContext, _error: &CoreError) {}
}

/// Entry in the undo/redo stacks: the executed command, the context it ran
/// with, and the execution timestamp.
struct CommandRecord {
    command: Box<dyn Command>,
    context: CommandContext,
    executed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Structured audit entry appended per execution when auditing is enabled.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub name: String,
    pub timestamp: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

const AUDIT_CAPACITY: usize = 256;

/// Owns the invoker, the interceptor chain, and the undo/redo history.
pub struct CommandManager {
    invoker: CommandInvoker,
    interceptors: RwLock<Vec<Box<dyn CommandInterceptor>>>,
    history_enabled: AtomicBool,
    undo_stack: Mutex<Vec<CommandRecord>>,
    redo_stack: Mutex<Vec<CommandRecord>>,
    audit_enabled: AtomicBool,
    audit: Mutex<VecDeque<AuditRecord>>,
    executed_cb: CallbackSet<String>,
    undone_cb: CallbackSet<String>,
    redone_cb: CallbackSet<String>,
}

impl CommandManager {
    pub fn new(registry: Arc<CommandRegistry>, executor: Arc<Executor>) -> Self {
        Self {
            invoker: CommandInvoker::new(registry, executor),
            interceptors: RwLock::new(Vec::new()),
            history_enabled: AtomicBool::new(false),
            undo_stack: Mutex::new(Vec::new()),
            redo_stack: Mutex::new(Vec::new()),
            audit_enabled: AtomicBool::new(false),
            audit: Mutex::new(VecDeque::new()),
            executed_cb: CallbackSet::new(),
            undone_cb: CallbackSet::new(),
            redone_cb: CallbackSet::new(),
        }
    }

    pub fn invoker(&self) -> &CommandInvoker {
        &self.invoker
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        self.invoker.registry()
    }

    pub fn add_interceptor(&self, interceptor: Box<dyn CommandInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// Execute through the interceptor chain; successful undoable commands
    /// are recorded on the undo stack and the redo stack is cleared.
    pub fn execute(&self, name: &str, ctx: CommandContext) -> CommandResult {
        let command = self.registry().create(name, &ctx)?;

        {
            let interceptors = self.interceptors.read();
            for (index, interceptor) in interceptors.iter().enumerate() {
                if !interceptor.before_execute(command.as_ref(), &ctx) {
                    let err = CoreError::RejectedByInterceptor {
                        command: name.to_string(),
                    };
                    for prior in interceptors[..=index].iter() {
                        prior.on_error(command.as_ref(), &ctx, &err);
                    }
                    self.append_audit(name, false, 0, Some(err.to_string()));
                    return Err(err);
                }
            }
        }

        let outcome = self.invoker.run_prepared(command, &ctx);
        let auditable = outcome
            .command
            .as_ref()
            .map_or(true, |command| command.descriptor().auditable);

        match &outcome.result {
            Ok(_) => {
                if let Some(command) = &outcome.command {
                    let interceptors = self.interceptors.read();
                    for interceptor in interceptors.iter() {
                        interceptor.after_execute(command.as_ref(), &ctx, &outcome.result);
                    }
                }
                if self.history_enabled.load(Ordering::SeqCst) {
                    if let Some(command) = outcome.command {
                        if command.can_undo(&ctx) {
                            self.undo_stack.lock().push(CommandRecord {
                                command,
                                context: ctx.clone(),
                                executed_at: outcome.stats.started_at,
                            });
                            self.redo_stack.lock().clear();
                        }
                    }
                }
                self.executed_cb.emit(&name.to_string());
            }
            Err(e) => {
                if let Some(command) = &outcome.command {
                    let interceptors = self.interceptors.read();
                    for interceptor in interceptors.iter() {
                        interceptor.on_error(command.as_ref(), &ctx, e);
                    }
                }
            }
        }

        if auditable {
            self.append_audit(
                name,
                outcome.result.is_ok(),
                outcome.stats.duration_ms,
                outcome.result.as_ref().err().map(|e| e.to_string()),
            );
        }
        outcome.result
    }

    /// Prospective history recording: applies to commands executed after the
    /// call.
    pub fn enable_history(&self, enabled: bool) {
        self.history_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.lock().is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.lock().is_empty()
    }

    /// Pop the undo stack, invoke the command's `undo`, and move the record
    /// onto the redo stack. Interceptors do not fire on undo.
    pub fn undo(&self) -> CommandResult {
        let Some(mut record) = self.undo_stack.lock().pop() else {
            return Err(CoreError::HistoryBoundary {
                key: "command-history".to_string(),
            });
        };
        let result = record.command.undo(&record.context);
        let name = record.command.descriptor().name.clone();
        match &result {
            Ok(_) => {
                log::debug!(
                    "undid '{}' (executed at {:?})",
                    name,
                    record.executed_at
                );
                self.redo_stack.lock().push(record);
                self.undone_cb.emit(&name);
                self.append_audit(&format!("undo:{}", name), true, 0, None);
            }
            Err(e) => {
                log::warn!("undo of '{}' failed: {}", name, e);
                self.undo_stack.lock().push(record);
            }
        }
        result
    }

    /// Pop the redo stack, invoke the command's `redo`, and move the record
    /// back onto the undo stack. `after_execute` interceptors fire as for an
    /// execute.
    pub fn redo(&self) -> CommandResult {
        let Some(mut record) = self.redo_stack.lock().pop() else {
            return Err(CoreError::HistoryBoundary {
                key: "command-history".to_string(),
            });
        };
        let result = record.command.redo(&record.context);
        let name = record.command.descriptor().name.clone();
        match &result {
            Ok(_) => {
                let interceptors = self.interceptors.read();
                for interceptor in interceptors.iter() {
                    interceptor.after_execute(record.command.as_ref(), &record.context, &result);
                }
                drop(interceptors);
                self.undo_stack.lock().push(record);
                self.redone_cb.emit(&name);
                self.append_audit(&format!("redo:{}", name), true, 0, None);
            }
            Err(e) => {
                log::warn!("redo of '{}' failed: {}", name, e);
                self.redo_stack.lock().push(record);
            }
        }
        result
    }

    pub fn clear_history(&self) {
        self.undo_stack.lock().clear();
        self.redo_stack.lock().clear();
    }

    pub fn enable_audit(&self, enabled: bool) {
        self.audit_enabled.store(enabled, Ordering::SeqCst);
    }

    fn append_audit(&self, name: &str, success: bool, duration_ms: u64, error: Option<String>) {
        if !self.audit_enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut audit = self.audit.lock();
        audit.push_back(AuditRecord {
            name: name.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            success,
            duration_ms,
            error,
        });
        while audit.len() > AUDIT_CAPACITY {
            audit.pop_front();
        }
    }

    pub fn audit_trail(&self) -> Vec<AuditRecord> {
        self.audit.lock().iter().cloned().collect()
    }

    pub fn audit_trail_json(&self) -> CoreResult<serde_json::Value> {
        serde_json::to_value(self.audit_trail()).map_err(|e| CoreError::SerializationError {
            message: e.to_string(),
        })
    }

    pub fn on_executed(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.executed_cb.add(callback)
    }

    pub fn on_undone(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.undone_cb.add(callback)
    }

    pub fn on_redone(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.redone_cb.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandDescriptor, Value};
    use crate::executor::ExecutorConfig;
    use crate::state::StateStore;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> CommandManager {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()).expect("executor"));
        CommandManager::new(Arc::new(CommandRegistry::new()), executor)
    }

    /// Cell-writing command used across manager tests.
    struct SetValue {
        descriptor: CommandDescriptor,
        previous: Option<i64>,
    }

    impl Command for SetValue {
        fn descriptor(&self) -> &CommandDescriptor {
            &self.descriptor
        }

        fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
            let store = ctx.service::<StateStore>().ok_or(CoreError::CommandFailed {
                command: "set-value".to_string(),
                message: "no store service".to_string(),
            })?;
            let key = ctx.str_param("key").unwrap_or("x").to_string();
            let value = ctx.int_param("value").unwrap_or(0);
            self.previous = store.value::<i64>(&key).ok();
            store.write(&key, value)?;
            Ok(Value::Int(value))
        }

        fn undo(&mut self, ctx: &CommandContext) -> CommandResult {
            let store = ctx.service::<StateStore>().ok_or(CoreError::CommandFailed {
                command: "set-value".to_string(),
                message: "no store service".to_string(),
            })?;
            let key = ctx.str_param("key").unwrap_or("x").to_string();
            if let Some(previous) = self.previous {
                store.write(&key, previous)?;
            }
            Ok(Value::Null)
        }

        fn can_undo(&self, _ctx: &CommandContext) -> bool {
            true
        }
    }

    fn register_set_value(manager: &CommandManager) {
        manager.registry().register("set-value", |_ctx| {
            Box::new(SetValue {
                descriptor: CommandDescriptor::new("set-value"),
                previous: None,
            })
        });
    }

    struct CountingInterceptor {
        before: AtomicUsize,
        after: AtomicUsize,
        errors: AtomicUsize,
        reject: bool,
    }

    impl CountingInterceptor {
        fn new(reject: bool) -> Arc<Self> {
            Arc::new(Self {
                before: AtomicUsize::new(0),
                after: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                reject,
            })
        }
    }

    impl CommandInterceptor for Arc<CountingInterceptor> {
        fn before_execute(&self, _command: &dyn Command, _ctx: &CommandContext) -> bool {
            self.before.fetch_add(1, Ordering::SeqCst);
            !self.reject
        }

        fn after_execute(
            &self,
            _command: &dyn Command,
            _ctx: &CommandContext,
            _result: &CommandResult,
        ) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _command: &dyn Command, _ctx: &CommandContext, _error: &CoreError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_undo_redo_through_store() {
        let manager = manager();
        register_set_value(&manager);
        manager.enable_history(true);

        let store = Arc::new(StateStore::new());
        store.create("x", 7i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("key", "x")
            .with_param("value", 42i64);

        manager.execute("set-value", ctx).expect("execute");
        assert_eq!(store.value::<i64>("x").expect("x"), 42);
        assert!(manager.can_undo());

        manager.undo().expect("undo");
        assert_eq!(store.value::<i64>("x").expect("x"), 7);
        assert!(manager.can_redo());
        assert!(!manager.can_undo());

        manager.redo().expect("redo");
        assert_eq!(store.value::<i64>("x").expect("x"), 42);
        assert!(manager.can_undo());
    }

    #[test]
    fn test_interceptor_counts_per_s5() {
        let manager = manager();
        register_set_value(&manager);
        manager.enable_history(true);

        let interceptor = CountingInterceptor::new(false);
        manager.add_interceptor(Box::new(interceptor.clone()));

        let store = Arc::new(StateStore::new());
        store.create("x", 7i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store)
            .with_param("key", "x")
            .with_param("value", 42i64);

        manager.execute("set-value", ctx).expect("execute");
        assert_eq!(interceptor.after.load(Ordering::SeqCst), 1);

        manager.undo().expect("undo");
        assert_eq!(interceptor.after.load(Ordering::SeqCst), 1); // not fired on undo

        manager.redo().expect("redo");
        assert_eq!(interceptor.after.load(Ordering::SeqCst), 2); // fired on redo
    }

    #[test]
    fn test_rejecting_interceptor_aborts() {
        let manager = manager();
        register_set_value(&manager);

        let first = CountingInterceptor::new(false);
        let rejecting = CountingInterceptor::new(true);
        let unreached = CountingInterceptor::new(false);
        manager.add_interceptor(Box::new(first.clone()));
        manager.add_interceptor(Box::new(rejecting.clone()));
        manager.add_interceptor(Box::new(unreached.clone()));

        let store = Arc::new(StateStore::new());
        store.create("x", 0i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store.clone())
            .with_param("key", "x")
            .with_param("value", 1i64);

        let err = manager.execute("set-value", ctx).expect_err("rejected");
        assert_eq!(err.code(), "command.rejected");
        assert_eq!(store.value::<i64>("x").expect("x"), 0);

        // Later interceptors' before_execute not called.
        assert_eq!(unreached.before.load(Ordering::SeqCst), 0);
        // on_error fires for the rejecting interceptor and upstream ones.
        assert_eq!(first.errors.load(Ordering::SeqCst), 1);
        assert_eq!(rejecting.errors.load(Ordering::SeqCst), 1);
        assert_eq!(unreached.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_execute_clears_redo_stack() {
        let manager = manager();
        register_set_value(&manager);
        manager.enable_history(true);

        let store = Arc::new(StateStore::new());
        store.create("x", 0i64).expect("create");
        let ctx = |v: i64| {
            CommandContext::new()
                .with_service(store.clone())
                .with_param("key", "x")
                .with_param("value", v)
        };

        manager.execute("set-value", ctx(1)).expect("execute");
        manager.undo().expect("undo");
        assert!(manager.can_redo());
        manager.execute("set-value", ctx(2)).expect("execute");
        assert!(!manager.can_redo());
    }

    #[test]
    fn test_audit_trail_records() {
        let manager = manager();
        register_set_value(&manager);
        manager.enable_audit(true);

        let store = Arc::new(StateStore::new());
        store.create("x", 0i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store)
            .with_param("key", "x")
            .with_param("value", 5i64);

        manager.execute("set-value", ctx).expect("execute");
        let _ = manager
            .execute("missing", CommandContext::new())
            .expect_err("unknown");

        let trail = manager.audit_trail();
        assert_eq!(trail.len(), 1); // unknown command never reached the chain
        assert_eq!(trail[0].name, "set-value");
        assert!(trail[0].success);
    }

    #[test]
    fn test_history_off_by_default() {
        let manager = manager();
        register_set_value(&manager);

        let store = Arc::new(StateStore::new());
        store.create("x", 0i64).expect("create");
        let ctx = CommandContext::new()
            .with_service(store)
            .with_param("key", "x")
            .with_param("value", 5i64);

        manager.execute("set-value", ctx).expect("execute");
        assert!(!manager.can_undo());
        assert_eq!(
            manager.undo().expect_err("empty").code(),
            "state.history_boundary"
        );
    }
}
