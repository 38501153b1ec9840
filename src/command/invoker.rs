use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::command::{
    Command, CommandContext, CommandDescriptor, CommandId, CommandRegistry, CommandResult,
    CommandState, ExecutionStats, Value,
};
use crate::error::CoreError;
use crate::executor::{CancellationToken, Executor, TaskHandle, TaskOutcome};
use crate::subscription::{CallbackSet, Subscription};
use crate::time::Clock;

/// Progress report published by a running command.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub id: CommandId,
    pub command: String,
    pub percent: u8,
    pub message: String,
}

/// Injected into the command context as a service; commands call
/// [`ProgressSink::report`] to publish progress to invoker observers.
pub struct ProgressSink {
    id: CommandId,
    name: String,
    callbacks: CallbackSet<ProgressUpdate>,
}

impl ProgressSink {
    pub fn report(&self, percent: u8, message: impl Into<String>) {
        self.callbacks.emit(&ProgressUpdate {
            id: self.id,
            command: self.name.clone(),
            percent: percent.min(100),
            message: message.into(),
        });
    }
}

/// Failure notification delivered to `on_failed` observers.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub name: String,
    pub code: &'static str,
    pub message: String,
}

struct RunningCommand {
    name: String,
    state: Arc<Mutex<CommandState>>,
    cancel_requested: Arc<AtomicBool>,
    current_token: Arc<Mutex<CancellationToken>>,
}

struct InvokerShared {
    registry: Arc<CommandRegistry>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    running: DashMap<CommandId, RunningCommand>,
    last_stats: DashMap<String, ExecutionStats>,
    batch_queue: Mutex<Vec<(String, CommandContext)>>,
    batch_interval_ms: AtomicU64,
    batch_scheduled: AtomicBool,
    executed: CallbackSet<(String, Value)>,
    failed: CallbackSet<CommandFailure>,
    progress: CallbackSet<ProgressUpdate>,
}

pub(crate) struct RunOutcome {
    pub result: CommandResult,
    pub command: Option<Box<dyn Command>>,
    pub stats: ExecutionStats,
}

struct DriveOutcome {
    result: CommandResult,
    command: Option<Box<dyn Command>>,
    retries: u32,
}

/// Executes commands across the four execution modes, tracking running
/// commands and exposing cancellation.
#[derive(Clone)]
pub struct CommandInvoker {
    shared: Arc<InvokerShared>,
}

impl CommandInvoker {
    pub fn new(registry: Arc<CommandRegistry>, executor: Arc<Executor>) -> Self {
        let clock = executor.clock();
        Self {
            shared: Arc::new(InvokerShared {
                registry,
                executor,
                clock,
                running: DashMap::new(),
                last_stats: DashMap::new(),
                batch_queue: Mutex::new(Vec::new()),
                batch_interval_ms: AtomicU64::new(100),
                batch_scheduled: AtomicBool::new(false),
                executed: CallbackSet::new(),
                failed: CallbackSet::new(),
                progress: CallbackSet::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.shared.registry
    }

    /// Synchronous execution: blocks the caller until the command completes,
    /// times out, or exhausts its retry policy.
    pub fn execute(&self, name: &str, ctx: CommandContext) -> CommandResult {
        let command = self.shared.registry.create(name, &ctx)?;
        self.run_prepared(command, &ctx).result
    }

    /// Asynchronous execution on the worker pool.
    pub fn execute_async(&self, name: &str, ctx: CommandContext) -> TaskHandle<CommandResult> {
        let invoker = self.clone();
        let name = name.to_string();
        self.shared
            .executor
            .spawn(move || invoker.execute(&name, ctx))
    }

    /// Deferred execution after `delay`; the outcome surfaces through the
    /// `on_executed` / `on_failed` observers.
    pub fn execute_deferred(&self, name: &str, ctx: CommandContext, delay: Duration) {
        let invoker = self.clone();
        let name = name.to_string();
        self.shared.executor.schedule(delay, move || {
            if let Err(e) = invoker.execute(&name, ctx) {
                log::warn!("deferred command '{}' failed: {}", name, e);
            }
        });
    }

    /// Enqueue commands onto the batch queue, flushed every
    /// `batch_interval_ms` (default 100 ms). Each command runs through the
    /// single-command path.
    pub fn execute_batch(&self, names: &[&str], ctx: CommandContext) {
        {
            let mut queue = self.shared.batch_queue.lock();
            for name in names {
                queue.push((name.to_string(), ctx.clone()));
            }
        }
        if !self.shared.batch_scheduled.swap(true, Ordering::SeqCst) {
            let invoker = self.clone();
            let interval = self.shared.batch_interval_ms.load(Ordering::Relaxed);
            self.shared
                .executor
                .schedule(Duration::from_millis(interval), move || {
                    invoker.flush_batch();
                });
        }
    }

    fn flush_batch(&self) {
        self.shared.batch_scheduled.store(false, Ordering::SeqCst);
        let items = std::mem::take(&mut *self.shared.batch_queue.lock());
        for (name, ctx) in items {
            if let Err(e) = self.execute(&name, ctx) {
                log::warn!("batched command '{}' failed: {}", name, e);
            }
        }
    }

    /// Transition a running command to `Cancelled`. Cooperative bodies
    /// observe the token and exit; non-cooperative results are discarded.
    pub fn cancel(&self, id: CommandId) -> bool {
        match self.shared.running.get(&id) {
            Some(entry) => {
                entry.cancel_requested.store(true, Ordering::SeqCst);
                entry.current_token.lock().cancel();
                *entry.state.lock() = CommandState::Cancelled;
                log::debug!("command {} ({}) cancelled", id, entry.name);
                true
            }
            None => false,
        }
    }

    /// Snapshot of currently running commands.
    pub fn running_commands(&self) -> Vec<(CommandId, CommandState)> {
        self.shared
            .running
            .iter()
            .map(|entry| (*entry.key(), *entry.value().state.lock()))
            .collect()
    }

    pub fn state_of(&self, id: CommandId) -> Option<CommandState> {
        self.shared.running.get(&id).map(|e| *e.value().state.lock())
    }

    /// Execution statistics of the most recent run of a command name.
    pub fn last_stats(&self, name: &str) -> Option<ExecutionStats> {
        self.shared.last_stats.get(name).map(|e| e.value().clone())
    }

    pub fn set_batch_interval_ms(&self, interval_ms: u64) {
        self.shared
            .batch_interval_ms
            .store(interval_ms, Ordering::Relaxed);
    }

    pub fn on_executed(
        &self,
        callback: impl Fn(&(String, Value)) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.executed.add(callback)
    }

    pub fn on_failed(
        &self,
        callback: impl Fn(&CommandFailure) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.failed.add(callback)
    }

    pub fn on_progress(
        &self,
        callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.progress.add(callback)
    }

    /// Single-command path shared by every execution mode.
    pub(crate) fn run_prepared(
        &self,
        command: Box<dyn Command>,
        ctx: &CommandContext,
    ) -> RunOutcome {
        let descriptor = command.descriptor().clone();
        let id = descriptor.id;
        let name = descriptor.name.clone();

        let state = Arc::new(Mutex::new(CommandState::Created));
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let current_token = Arc::new(Mutex::new(CancellationToken::new()));
        self.shared.running.insert(
            id,
            RunningCommand {
                name: name.clone(),
                state: state.clone(),
                cancel_requested: cancel_requested.clone(),
                current_token: current_token.clone(),
            },
        );

        let started_at = chrono::Utc::now();
        let start_ms = self.shared.clock.now_ms();

        let outcome = self.drive(command, ctx, &descriptor, &state, &cancel_requested, &current_token);

        let duration_ms = self.shared.clock.now_ms().saturating_sub(start_ms);
        self.shared.running.remove(&id);

        let stats = ExecutionStats {
            duration_ms,
            retry_count: outcome.retries,
            started_at: Some(started_at),
            ended_at: Some(chrono::Utc::now()),
            error: outcome.result.as_ref().err().map(|e| e.to_string()),
        };
        self.shared.last_stats.insert(name.clone(), stats.clone());

        match &outcome.result {
            Ok(value) => {
                log::debug!("command '{}' completed in {} ms", name, duration_ms);
                self.shared.executed.emit(&(name.clone(), value.clone()));
            }
            Err(e) => {
                log::warn!("command '{}' failed: {}", name, e);
                self.shared.failed.emit(&CommandFailure {
                    name: name.clone(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }

        RunOutcome {
            result: outcome.result,
            command: outcome.command,
            stats,
        }
    }

    fn drive(
        &self,
        mut command: Box<dyn Command>,
        ctx: &CommandContext,
        descriptor: &CommandDescriptor,
        state: &Arc<Mutex<CommandState>>,
        cancel_requested: &Arc<AtomicBool>,
        current_token: &Arc<Mutex<CancellationToken>>,
    ) -> DriveOutcome {
        let name = descriptor.name.clone();
        *state.lock() = CommandState::Queued;

        if !command.can_execute(ctx) {
            *state.lock() = CommandState::Failed;
            return DriveOutcome {
                result: Err(CoreError::CommandFailed {
                    command: name,
                    message: "can_execute returned false".to_string(),
                }),
                command: Some(command),
                retries: 0,
            };
        }
        command.on_before_execute(ctx);

        let max_attempts = if descriptor.retry.retryable {
            descriptor.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0u32;
        let mut held = Some(command);
        loop {
            attempt += 1;
            if cancel_requested.load(Ordering::SeqCst) {
                *state.lock() = CommandState::Cancelled;
                return DriveOutcome {
                    result: Err(CoreError::CommandCancelled { command: name }),
                    command: held,
                    retries: attempt - 1,
                };
            }

            let token = CancellationToken::new();
            *current_token.lock() = token.clone();
            *state.lock() = CommandState::Executing;

            let attempt_ctx = ctx
                .clone()
                .with_service(Arc::new(token.clone()))
                .with_service(Arc::new(ProgressSink {
                    id: descriptor.id,
                    name: name.clone(),
                    callbacks: self.shared.progress.clone(),
                }));

            let Some(mut current) = held.take() else {
                *state.lock() = CommandState::Failed;
                return DriveOutcome {
                    result: Err(CoreError::Internal {
                        message: format!("command '{}' instance lost between attempts", name),
                    }),
                    command: None,
                    retries: attempt - 1,
                };
            };

            let exec_ctx = attempt_ctx.clone();
            let handle = self.shared.executor.spawn(move || {
                let result = current.execute(&exec_ctx);
                (result, current)
            });

            let resolved = match handle.wait_timeout(descriptor.timeout) {
                Some(resolved) => Some(resolved),
                None => {
                    // Deadline passed: expire the token so cooperative bodies
                    // exit, then give the instance a grace window to return.
                    token.expire();
                    *state.lock() = CommandState::Timeout;
                    handle.wait_timeout(descriptor.timeout)
                }
            };

            match resolved {
                None => {
                    // Instance abandoned on the worker; no retry possible.
                    return DriveOutcome {
                        result: Err(CoreError::CommandTimeout {
                            command: name,
                            timeout_ms: descriptor.timeout.as_millis() as u64,
                        }),
                        command: None,
                        retries: attempt - 1,
                    };
                }
                Some(TaskOutcome::Cancelled) => {
                    *state.lock() = CommandState::Cancelled;
                    return DriveOutcome {
                        result: Err(CoreError::CommandCancelled { command: name }),
                        command: None,
                        retries: attempt - 1,
                    };
                }
                Some(TaskOutcome::Panicked(message)) => {
                    *state.lock() = CommandState::Failed;
                    return DriveOutcome {
                        result: Err(CoreError::CommandFailed {
                            command: name,
                            message: format!("panicked: {}", message),
                        }),
                        command: None,
                        retries: attempt - 1,
                    };
                }
                Some(TaskOutcome::Completed((result, mut current))) => {
                    if token.is_timed_out() {
                        let err = CoreError::CommandTimeout {
                            command: name.clone(),
                            timeout_ms: descriptor.timeout.as_millis() as u64,
                        };
                        current.on_error(&attempt_ctx, &err);
                        held = Some(current);
                        if descriptor.retry.retryable
                            && attempt < max_attempts
                            && !cancel_requested.load(Ordering::SeqCst)
                        {
                            std::thread::sleep(descriptor.retry.delay);
                            continue;
                        }
                        *state.lock() = CommandState::Timeout;
                        return DriveOutcome {
                            result: Err(err),
                            command: held,
                            retries: attempt - 1,
                        };
                    }

                    if cancel_requested.load(Ordering::SeqCst) || token.is_cancelled() {
                        // Result of a non-cooperative body is discarded.
                        *state.lock() = CommandState::Cancelled;
                        return DriveOutcome {
                            result: Err(CoreError::CommandCancelled { command: name }),
                            command: Some(current),
                            retries: attempt - 1,
                        };
                    }

                    match result {
                        Ok(value) => {
                            *state.lock() = CommandState::Completed;
                            let result = Ok(value);
                            current.on_after_execute(&attempt_ctx, &result);
                            return DriveOutcome {
                                result,
                                command: Some(current),
                                retries: attempt - 1,
                            };
                        }
                        Err(e) if matches!(e, CoreError::CommandCancelled { .. }) => {
                            *state.lock() = CommandState::Cancelled;
                            return DriveOutcome {
                                result: Err(e),
                                command: Some(current),
                                retries: attempt - 1,
                            };
                        }
                        Err(e) => {
                            current.on_error(&attempt_ctx, &e);
                            held = Some(current);
                            if descriptor.retry.retryable
                                && attempt < max_attempts
                                && !cancel_requested.load(Ordering::SeqCst)
                            {
                                log::debug!(
                                    "command '{}' attempt {} failed, retrying: {}",
                                    name,
                                    attempt,
                                    e
                                );
                                std::thread::sleep(descriptor.retry.delay);
                                continue;
                            }
                            *state.lock() = CommandState::Failed;
                            return DriveOutcome {
                                result: Err(e),
                                command: held,
                                retries: attempt - 1,
                            };
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RetryPolicy;
    use crate::executor::ExecutorConfig;
    use std::sync::atomic::AtomicU32;

    fn invoker() -> CommandInvoker {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()).expect("executor"));
        CommandInvoker::new(Arc::new(CommandRegistry::new()), executor)
    }

    struct Flaky {
        descriptor: CommandDescriptor,
        failures_left: Arc<AtomicU32>,
    }

    impl Command for Flaky {
        fn descriptor(&self) -> &CommandDescriptor {
            &self.descriptor
        }

        fn execute(&mut self, _ctx: &CommandContext) -> CommandResult {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::CommandFailed {
                    command: self.descriptor.name.clone(),
                    message: "transient".to_string(),
                });
            }
            Ok(Value::Int(1))
        }
    }

    fn flaky_registry(failures: u32, max_attempts: u32) -> Arc<CommandRegistry> {
        let registry = Arc::new(CommandRegistry::new());
        let counter = Arc::new(AtomicU32::new(failures));
        registry.register("flaky", move |_ctx| {
            Box::new(Flaky {
                descriptor: CommandDescriptor::new("flaky").with_retry(RetryPolicy {
                    retryable: true,
                    max_attempts,
                    delay: Duration::from_millis(5),
                }),
                failures_left: counter.clone(),
            })
        });
        registry
    }

    #[test]
    fn test_sync_execution() {
        let invoker = invoker();
        invoker.registry().register("double", |_ctx| {
            struct Double {
                descriptor: CommandDescriptor,
            }
            impl Command for Double {
                fn descriptor(&self) -> &CommandDescriptor {
                    &self.descriptor
                }
                fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
                    let input = ctx.int_param("input").unwrap_or(0);
                    Ok(Value::Int(input * 2))
                }
            }
            Box::new(Double {
                descriptor: CommandDescriptor::new("double"),
            })
        });

        let result = invoker
            .execute("double", CommandContext::new().with_param("input", 21i64))
            .expect("execute");
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_retry_until_success() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()).expect("executor"));
        let invoker = CommandInvoker::new(flaky_registry(2, 3), executor);
        let result = invoker.execute("flaky", CommandContext::new());
        assert_eq!(result.expect("retries recover"), Value::Int(1));

        let stats = invoker.last_stats("flaky").expect("stats recorded");
        assert_eq!(stats.retry_count, 2);
        assert!(stats.error.is_none());
    }

    #[test]
    fn test_retry_exhaustion_returns_last_failure() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()).expect("executor"));
        let invoker = CommandInvoker::new(flaky_registry(5, 3), executor);
        let err = invoker
            .execute("flaky", CommandContext::new())
            .expect_err("exhausted");
        assert_eq!(err.code(), "command.failed");
    }

    #[test]
    fn test_timeout() {
        let invoker = invoker();
        invoker.registry().register("sleepy", |_ctx| {
            struct Sleepy {
                descriptor: CommandDescriptor,
            }
            impl Command for Sleepy {
                fn descriptor(&self) -> &CommandDescriptor {
                    &self.descriptor
                }
                fn execute(&mut self, _ctx: &CommandContext) -> CommandResult {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(Value::Null)
                }
            }
            Box::new(Sleepy {
                descriptor: CommandDescriptor::new("sleepy")
                    .with_timeout(Duration::from_millis(30)),
            })
        });

        let err = invoker
            .execute("sleepy", CommandContext::new())
            .expect_err("times out");
        assert_eq!(err.code(), "command.timeout");
    }

    #[test]
    fn test_cooperative_cancellation() {
        let invoker = invoker();
        invoker.registry().register("coop", |_ctx| {
            struct Coop {
                descriptor: CommandDescriptor,
            }
            impl Command for Coop {
                fn descriptor(&self) -> &CommandDescriptor {
                    &self.descriptor
                }
                fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
                    let token = ctx
                        .service::<CancellationToken>()
                        .expect("token injected");
                    for _ in 0..100 {
                        if token.is_cancelled() {
                            return Err(CoreError::CommandCancelled {
                                command: "coop".to_string(),
                            });
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Ok(Value::Null)
                }
            }
            Box::new(Coop {
                descriptor: CommandDescriptor::new("coop")
                    .with_timeout(Duration::from_millis(5000)),
            })
        });

        let handle = invoker.execute_async("coop", CommandContext::new());
        // Wait until the command registers as running, then cancel it.
        let id = loop {
            if let Some((id, _)) = invoker.running_commands().first().copied() {
                break id;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(invoker.cancel(id));

        match handle.wait() {
            TaskOutcome::Completed(result) => {
                assert_eq!(result.expect_err("cancelled").code(), "command.cancelled");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_batch_execution_flushes() {
        let invoker = invoker();
        let executed = Arc::new(AtomicU32::new(0));
        let counter = executed.clone();
        invoker.registry().register("tick", move |_ctx| {
            struct Tick {
                descriptor: CommandDescriptor,
                counter: Arc<AtomicU32>,
            }
            impl Command for Tick {
                fn descriptor(&self) -> &CommandDescriptor {
                    &self.descriptor
                }
                fn execute(&mut self, _ctx: &CommandContext) -> CommandResult {
                    self.counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }
            Box::new(Tick {
                descriptor: CommandDescriptor::new("tick"),
                counter: counter.clone(),
            })
        });

        invoker.set_batch_interval_ms(20);
        invoker.execute_batch(&["tick", "tick", "tick"], CommandContext::new());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(executed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_progress_reporting() {
        let invoker = invoker();
        invoker.registry().register("steps", |_ctx| {
            struct Steps {
                descriptor: CommandDescriptor,
            }
            impl Command for Steps {
                fn descriptor(&self) -> &CommandDescriptor {
                    &self.descriptor
                }
                fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
                    if let Some(sink) = ctx.service::<ProgressSink>() {
                        sink.report(50, "halfway");
                        sink.report(100, "done");
                    }
                    Ok(Value::Null)
                }
            }
            Box::new(Steps {
                descriptor: CommandDescriptor::new("steps"),
            })
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = invoker.on_progress(move |update| s.lock().push(update.percent));

        invoker
            .execute("steps", CommandContext::new())
            .expect("execute");
        assert_eq!(*seen.lock(), vec![50, 100]);
    }

    #[test]
    fn test_events_fire() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()).expect("executor"));
        let invoker = CommandInvoker::new(flaky_registry(0, 1), executor);

        let executed = Arc::new(AtomicU32::new(0));
        let e = executed.clone();
        let _sub = invoker.on_executed(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        invoker.execute("flaky", CommandContext::new()).expect("ok");
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        let err = invoker
            .execute("missing", CommandContext::new())
            .expect_err("unknown");
        assert_eq!(err.code(), "command.unknown");
    }
}
