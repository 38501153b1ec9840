use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{CoreError, CoreResult};
use crate::time::{Clock, MonotonicClock};

/// Configuration for the executor's worker pool and service threads.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads; defaults to the CPU count.
    pub worker_threads: usize,
    /// Prefix used when naming worker threads.
    pub thread_name_prefix: String,
    /// Stack size for worker threads (in bytes).
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(2),
            thread_name_prefix: "pulse-worker".to_string(),
            stack_size: None,
        }
    }
}

/// Outcome of a task submitted to the executor.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// The executor was shutting down, or the task was abandoned.
    Cancelled,
    /// The task body panicked; caught at the worker-pool boundary.
    Panicked(String),
}

impl<T> TaskOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// Future-like handle for a submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    fn cancelled() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(tx);
        Self { rx }
    }

    /// Block until the task resolves.
    pub fn wait(self) -> TaskOutcome<T> {
        self.rx.recv().unwrap_or(TaskOutcome::Cancelled)
    }

    /// Block up to `timeout`; `None` means the deadline passed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(TaskOutcome::Cancelled),
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<TaskOutcome<T>> {
        self.rx.try_recv().ok()
    }
}

/// Cooperative cancellation flag threaded from caller to worker.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Mark the token as expired by a timeout; implies cancellation.
    pub fn expire(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free execution counters.
#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timers_fired: AtomicU64,
}

/// Snapshot of executor counters.
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub timers_fired: u64,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    fire_at_ms: u64,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at_ms
            .cmp(&self.fire_at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerEntry>>,
    cond: Condvar,
    next_seq: AtomicU64,
}

/// Thread pool plus timer and install lanes.
///
/// Shut the executor down before dropping the components that submitted work
/// to it; running tasks drain, and pending timers are discarded with their
/// handles resolving [`TaskOutcome::Cancelled`].
pub struct Executor {
    pool: Arc<ThreadPool>,
    timers: Arc<TimerShared>,
    install_tx: Mutex<Option<Sender<Job>>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    install_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> CoreResult<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: ExecutorConfig, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let prefix = config.thread_name_prefix.clone();
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(move |idx| format!("{}-{}", prefix, idx));

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool = Arc::new(builder.build().map_err(|e| CoreError::Internal {
            message: format!("failed to build worker pool: {}", e),
        })?);

        let timers = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            next_seq: AtomicU64::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let timer_thread = {
            let timers = timers.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            let clock = clock.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name(format!("{}-timer", config.thread_name_prefix))
                .spawn(move || timer_loop(timers, pool, shutdown, clock, counters))
                .map_err(|e| CoreError::Internal {
                    message: format!("failed to spawn timer thread: {}", e),
                })?
        };

        let (install_tx, install_rx) = crossbeam_channel::unbounded::<Job>();
        let install_thread = std::thread::Builder::new()
            .name(format!("{}-install", config.thread_name_prefix))
            .spawn(move || {
                while let Ok(job) = install_rx.recv() {
                    job();
                }
            })
            .map_err(|e| CoreError::Internal {
                message: format!("failed to spawn install thread: {}", e),
            })?;

        Ok(Self {
            pool,
            timers,
            install_tx: Mutex::new(Some(install_tx)),
            shutdown,
            counters,
            clock,
            timer_thread: Mutex::new(Some(timer_thread)),
            install_thread: Mutex::new(Some(install_thread)),
        })
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Submit a task to the worker pool; the handle resolves when it
    /// completes. Panics are caught at the pool boundary in release builds.
    pub fn spawn<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if self.shutdown.load(Ordering::SeqCst) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return TaskHandle::cancelled();
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let shutdown = self.shutdown.clone();
        let counters = self.counters.clone();
        self.pool.spawn(move || {
            if shutdown.load(Ordering::SeqCst) {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(TaskOutcome::Cancelled);
                return;
            }
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send(TaskOutcome::Completed(value));
                }
                Err(payload) => {
                    if cfg!(debug_assertions) {
                        std::panic::resume_unwind(payload);
                    }
                    let message = panic_message(&payload);
                    log::error!("worker task panicked: {}", message);
                    let _ = tx.send(TaskOutcome::Panicked(message));
                }
            }
        });
        TaskHandle { rx }
    }

    /// Fire `task` on the worker pool after at least `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let fire_at_ms = self.clock.now_ms().saturating_add(delay.as_millis() as u64);
        let seq = self.timers.next_seq.fetch_add(1, Ordering::Relaxed);
        self.timers.queue.lock().push(TimerEntry {
            fire_at_ms,
            seq,
            job: Box::new(task),
        });
        self.timers.cond.notify_one();
    }

    /// Post a task to the single install thread; the handle resolves with
    /// the task's result once the install thread reaches it.
    pub fn run_on_install_thread<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let counters = self.counters.clone();
        let sent = {
            let guard = self.install_tx.lock();
            match guard.as_ref() {
                Some(sender) => sender
                    .send(Box::new(move || {
                        let value = task();
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        let _ = tx.send(TaskOutcome::Completed(value));
                    }))
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return TaskHandle::cancelled();
        }
        TaskHandle { rx }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            timers_fired: self.counters.timers_fired.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, discard pending timers and join the service
    /// threads. Running worker tasks drain before this returns.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timers.cond.notify_all();
        if let Some(handle) = self.timer_thread.lock().take() {
            let _ = handle.join();
        }
        // Dropping the sender ends the install loop once queued jobs drain.
        drop(self.install_tx.lock().take());
        if let Some(handle) = self.install_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(
    timers: Arc<TimerShared>,
    pool: Arc<ThreadPool>,
    shutdown: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
) {
    let mut queue = timers.queue.lock();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            let dropped = queue.len() as u64;
            counters.cancelled.fetch_add(dropped, Ordering::Relaxed);
            queue.clear();
            return;
        }

        let now = clock.now_ms();
        while queue.peek().map_or(false, |e| e.fire_at_ms <= now) {
            if let Some(entry) = queue.pop() {
                counters.timers_fired.fetch_add(1, Ordering::Relaxed);
                let pool = pool.clone();
                MutexGuard::unlocked(&mut queue, || pool.spawn(entry.job));
            }
        }

        match queue.peek().map(|e| e.fire_at_ms) {
            Some(fire_at_ms) => {
                let wait = fire_at_ms.saturating_sub(clock.now_ms()).max(1);
                timers
                    .cond
                    .wait_for(&mut queue, Duration::from_millis(wait));
            }
            None => {
                timers.cond.wait(&mut queue);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_spawn_returns_result() {
        let executor = Executor::new(ExecutorConfig::default()).expect("executor");
        let handle = executor.spawn(|| 21 * 2);
        match handle.wait() {
            TaskOutcome::Completed(v) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let stats = executor.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_schedule_fires_after_delay() {
        let executor = Executor::new(ExecutorConfig::default()).expect("executor");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        executor.schedule(Duration::from_millis(30), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_install_lane_is_serialized() {
        let executor = Executor::new(ExecutorConfig::default()).expect("executor");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let order = order.clone();
            handles.push(executor.run_on_install_thread(move || {
                order.lock().push(i);
            }));
        }
        for handle in handles {
            handle.wait();
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_spawn_after_shutdown_is_cancelled() {
        let executor = Executor::new(ExecutorConfig::default()).expect("executor");
        executor.shutdown();
        let handle = executor.spawn(|| 1);
        assert!(handle.wait().is_cancelled());
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(!token.is_timed_out());

        let token = CancellationToken::new();
        token.expire();
        assert!(token.is_cancelled());
        assert!(token.is_timed_out());
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let executor = Executor::new(ExecutorConfig::default()).expect("executor");
        let handle = executor.spawn(|| {
            std::thread::sleep(Duration::from_millis(200));
            7
        });
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
        match handle.wait_timeout(Duration::from_millis(1000)) {
            Some(TaskOutcome::Completed(v)) => assert_eq!(v, 7),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
