/// Command Engine
///
/// Uniform invocation of named commands across four execution modes
/// (synchronous, asynchronous, deferred, batched), with cancellation,
/// timeouts, retries, interceptors and undo/redo history.
///
/// Commands are produced fresh per invocation by factories held in the
/// [`registry::CommandRegistry`]; the [`invoker::CommandInvoker`] drives the
/// execution modes, and the [`manager::CommandManager`] layers the
/// interceptor chain, the history stacks and the audit trail on top.
pub mod builtin;
pub mod composite;
pub mod context;
pub mod invoker;
pub mod manager;
pub mod registry;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

pub use composite::CompositeCommand;
pub use context::CommandContext;
pub use invoker::{CommandFailure, CommandInvoker, ProgressSink, ProgressUpdate};
pub use manager::{AuditRecord, CommandInterceptor, CommandManager};
pub use registry::CommandRegistry;

/// Command execution priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

/// How a command is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sync,
    Async,
    Deferred,
    Batched,
}

/// Command lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// Unique id assigned to each command instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

fn next_command_id() -> CommandId {
    CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
}

/// Retry behaviour carried by a command descriptor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retryable: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable: false,
            max_attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Immutable command metadata, fixed once the command is constructed.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub id: CommandId,
    pub name: String,
    pub description: String,
    pub priority: CommandPriority,
    pub mode: ExecutionMode,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub auditable: bool,
    pub tags: Vec<String>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_command_id(),
            name: name.into(),
            description: String::new(),
            priority: CommandPriority::Normal,
            mode: ExecutionMode::Sync,
            timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            auditable: true,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn not_auditable(mut self) -> Self {
        self.auditable = false;
        self
    }
}

/// Parameter and result values exchanged with commands.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Opaque shared handle; compared by identity.
    Handle(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn handle<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Handle(h) => h.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// JSON view of primitive values; handles yield `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(v) => Some(serde_json::Value::Bool(*v)),
            Value::Int(v) => Some(serde_json::Value::from(*v)),
            Value::Float(v) => serde_json::Number::from_f64(*v).map(serde_json::Value::Number),
            Value::Str(v) => Some(serde_json::Value::String(v.clone())),
            Value::Handle(_) => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Str(v) => write!(f, "Str({:?})", v),
            Value::Handle(_) => write!(f, "Handle(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Result type commands return from `execute`/`undo`/`redo`.
pub type CommandResult = CoreResult<Value>;

/// Wall-clock execution statistics captured by the invoker.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub duration_ms: u64,
    pub retry_count: u32,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

/// A named, invocable unit of work.
///
/// Implementations are created fresh per invocation by registry factories.
/// `undo`/`redo` default to unsupported; `can_undo` gates history recording.
pub trait Command: Send {
    fn descriptor(&self) -> &CommandDescriptor;

    fn execute(&mut self, ctx: &CommandContext) -> CommandResult;

    fn undo(&mut self, _ctx: &CommandContext) -> CommandResult {
        Err(CoreError::CommandFailed {
            command: self.descriptor().name.clone(),
            message: "undo not supported".to_string(),
        })
    }

    fn redo(&mut self, ctx: &CommandContext) -> CommandResult {
        self.execute(ctx)
    }

    fn can_execute(&self, _ctx: &CommandContext) -> bool {
        true
    }

    fn can_undo(&self, _ctx: &CommandContext) -> bool {
        false
    }

    fn can_redo(&self, ctx: &CommandContext) -> bool {
        self.can_undo(ctx)
    }

    fn on_before_execute(&mut self, _ctx: &CommandContext) {}

    fn on_after_execute(&mut self, _ctx: &CommandContext, _result: &CommandResult) {}

    fn on_error(&mut self, _ctx: &CommandContext, _error: &CoreError) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_ids_are_unique() {
        let a = CommandDescriptor::new("a");
        let b = CommandDescriptor::new("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(3).as_int(), Some(3));
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Str("x".to_string()).as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_int(), None);

        let handle: Arc<dyn Any + Send + Sync> = Arc::new(5u32);
        let value = Value::Handle(handle);
        assert_eq!(value.handle::<u32>().map(|v| *v), Some(5));
        assert!(value.handle::<String>().is_none());
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let a: Arc<dyn Any + Send + Sync> = Arc::new(1u8);
        let b: Arc<dyn Any + Send + Sync> = Arc::new(1u8);
        assert_eq!(Value::Handle(a.clone()), Value::Handle(a.clone()));
        assert_ne!(Value::Handle(a), Value::Handle(b));
    }
}
