//! A bounded multithreaded worker pool. Similar in spirit to a fixed thread
//! pool, except that it supports (a) cooperative cancellation of the workers
//! and (b) a budget of task errors tolerated before the remaining tasks are
//! cancelled.
//!
//! A panicking task is always fatal: it cancels the remaining tasks and is
//! surfaced to the caller regardless of the error threshold.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

pub type Task<T> = Box<dyn FnOnce() -> Result<T, anyhow::Error> + Send + 'static>;

/// Called with each unhandled recoverable task error and the task's
/// identifier. Returning true swallows the error so it doesn't count toward
/// the error threshold.
pub type ErrorHandler = Box<dyn Fn(&anyhow::Error, &str) -> bool + Send + Sync>;

/// Called once by each worker thread as it exits.
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Created but not started. Tasks cannot be added yet.
    NotStarted,
    /// Accepting and running tasks. The only state where tasks may be added.
    Running,
    /// No more tasks may be added; existing tasks run to completion.
    Closed,
    /// The error threshold was exceeded (or a task panicked). New tasks are
    /// silently ignored while the workers wind down.
    Cancelling,
    /// Terminal: every worker has exited.
    Finished,
}

impl PoolState {
    fn name(self) -> &'static str {
        match self {
            PoolState::NotStarted => "not started",
            PoolState::Running => "running",
            PoolState::Closed => "closed",
            PoolState::Cancelling => "cancelling",
            PoolState::Finished => "finished",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("too many errors: worker pool exceeded threshold of {threshold} error(s)")]
    TooManyErrors {
        threshold: usize,
        errors: Vec<(String, anyhow::Error)>,
    },

    #[error("task \"{id}\" panicked: {message}")]
    TaskPanic { id: String, message: String },

    #[error("request to add task \"{0}\" to worker pool timed out after 5 minutes; the task queue is full")]
    SubmitTimeout(String),

    #[error("{0}")]
    InvalidState(String),
}

impl PoolError {
    /// Short description of the failure for end-of-run log lines: the single
    /// error's text, or a count when there are several.
    pub fn summary(&self) -> String {
        match self {
            PoolError::TooManyErrors { errors, .. } if errors.len() == 1 => {
                format!("{:#}", errors[0].1)
            }
            PoolError::TooManyErrors { errors, .. } => format!("{} errors", errors.len()),
            other => other.to_string(),
        }
    }
}

struct Inner {
    state: PoolState,
    errors: Vec<(String, anyhow::Error)>,
    terminal: Option<PoolError>,
    active_workers: usize,
    spawn_counter: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<T: Send + 'static> {
    inner: Mutex<Inner>,
    cond: Condvar,
    tasks_rx: Receiver<(Task<T>, String)>,
    results: Option<Sender<T>>,
    error_threshold: usize,
    error_handler: Option<ErrorHandler>,
    on_close_hook: Option<CloseHook>,
}

pub struct WorkerPoolOptions<T: Send + 'static> {
    pub max_workers: usize,
    /// Number of task errors tolerated before the pool cancels.
    pub error_threshold: usize,
    /// Bounded task queue capacity; 0 means unbounded.
    pub task_queue_size: usize,
    pub name_prefix: String,
    /// Successful task return values are forwarded here when set.
    pub results: Option<Sender<T>>,
    pub error_handler: Option<ErrorHandler>,
    pub on_close_hook: Option<CloseHook>,
}

impl<T: Send + 'static> Default for WorkerPoolOptions<T> {
    fn default() -> Self {
        WorkerPoolOptions {
            max_workers: 1,
            error_threshold: 0,
            task_queue_size: 0,
            name_prefix: "wkr-".to_string(),
            results: None,
            error_handler: None,
            on_close_hook: None,
        }
    }
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    tasks_tx: Sender<(Task<T>, String)>,
    max_workers: usize,
    name_prefix: String,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(options: WorkerPoolOptions<T>) -> Result<Self, PoolError> {
        if options.max_workers == 0 {
            return Err(PoolError::InvalidState(
                "must have a positive max_workers count: got 0".to_string(),
            ));
        }
        let (tasks_tx, tasks_rx) = if options.task_queue_size > 0 {
            crossbeam_channel::bounded(options.task_queue_size)
        } else {
            crossbeam_channel::unbounded()
        };
        Ok(WorkerPool {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PoolState::NotStarted,
                    errors: Vec::new(),
                    terminal: None,
                    active_workers: 0,
                    spawn_counter: 0,
                    handles: Vec::new(),
                }),
                cond: Condvar::new(),
                tasks_rx,
                results: options.results,
                error_threshold: options.error_threshold,
                error_handler: options.error_handler,
                on_close_hook: options.on_close_hook,
            }),
            tasks_tx,
            max_workers: options.max_workers,
            name_prefix: options.name_prefix,
        })
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }

    pub fn worker_count(&self) -> usize {
        self.lock().active_workers
    }

    /// Approximate number of enqueued tasks; may change by the time this
    /// returns.
    pub fn queued_tasks(&self) -> usize {
        self.shared.tasks_rx.len()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().state == PoolState::Finished
    }

    /// One-line execution summary for diagnostics.
    pub fn progress_str(&self) -> String {
        let inner = self.lock();
        match inner.state {
            PoolState::NotStarted | PoolState::Finished => inner.state.name().to_string(),
            state => {
                let (w, q) = (inner.active_workers, self.shared.tasks_rx.len());
                format!(
                    "{} ({w} active worker{} and ~{q} enqueued task{})",
                    state.name(),
                    if w == 1 { "" } else { "s" },
                    if q == 1 { "" } else { "s" },
                )
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("worker pool lock poisoned")
    }

    /// Start the pool. It now accepts tasks via `submit`.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.state != PoolState::NotStarted {
            return Err(PoolError::InvalidState(format!(
                "can't start worker pool in state \"{}\"",
                inner.state.name()
            )));
        }
        inner.state = PoolState::Running;
        Ok(())
    }

    /// Add a task to run. Blocks while the bounded task queue is full,
    /// logging warnings as the wait drags on and giving up after 5 minutes.
    ///
    /// Submissions while the pool is cancelling are silently dropped; the
    /// accumulated errors surface later from `close` or `join`.
    pub fn submit(
        &self,
        task: impl FnOnce() -> Result<T, anyhow::Error> + Send + 'static,
        id: impl Into<String>,
    ) -> Result<(), PoolError> {
        let id = id.into();
        {
            let mut inner = self.lock();
            match inner.state {
                PoolState::Running => {}
                PoolState::Cancelling => return Ok(()),
                PoolState::NotStarted => {
                    return Err(PoolError::InvalidState(
                        "can't add a task to the worker pool before starting it".to_string(),
                    ));
                }
                PoolState::Closed => {
                    return Err(PoolError::InvalidState(
                        "can't add a task to the worker pool after it's closed".to_string(),
                    ));
                }
                PoolState::Finished => {
                    return Err(inner.terminal.take().unwrap_or_else(|| {
                        PoolError::InvalidState(
                            "can't add a task to the worker pool after it's finished".to_string(),
                        )
                    }));
                }
            }
        }

        let mut item: (Task<T>, String) = (Box::new(task), id);
        let mut waited_secs = 0u32;
        loop {
            match self.tasks_tx.send_timeout(item, Duration::from_secs(1)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    item = returned;
                    waited_secs += 1;
                    match waited_secs {
                        5 => tracing::warn!(
                            "delayed {waited_secs} seconds while attempting to add task \"{}\" \
                             to worker pool",
                            item.1
                        ),
                        20 | 60 => tracing::warn!(
                            "worker pool running abnormally slow; adding task \"{}\" has \
                             stalled for {waited_secs} seconds",
                            item.1
                        ),
                        300 => return Err(PoolError::SubmitTimeout(item.1)),
                        _ => {}
                    }
                    // The pool may have closed or cancelled while blocked
                    let mut inner = self.lock();
                    match inner.state {
                        PoolState::Running => continue,
                        PoolState::Cancelling => return Ok(()),
                        PoolState::Finished => {
                            return Err(inner.terminal.take().unwrap_or_else(|| {
                                PoolError::InvalidState(
                                    "worker pool finished while waiting to add a task".to_string(),
                                )
                            }));
                        }
                        state => {
                            return Err(PoolError::InvalidState(format!(
                                "worker pool {} while waiting to add a task; the task queue is full",
                                state.name()
                            )));
                        }
                    }
                }
                Err(SendTimeoutError::Disconnected(returned)) => {
                    return Err(PoolError::InvalidState(format!(
                        "task queue disconnected while adding task \"{}\"",
                        returned.1
                    )));
                }
            }
        }

        self.spawn_worker_if_needed();
        Ok(())
    }

    fn spawn_worker_if_needed(&self) {
        let mut inner = self.lock();
        if inner.active_workers >= self.max_workers {
            return;
        }
        inner.active_workers += 1;
        inner.spawn_counter += 1;
        let name = format!("{}{}", self.name_prefix, inner.spawn_counter);
        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(shared))
        {
            Ok(handle) => inner.handles.push(handle),
            Err(e) => {
                inner.active_workers -= 1;
                tracing::error!("failed to spawn pool worker: {e}");
            }
        }
    }

    /// Stop accepting tasks. Running tasks finish; queued tasks run unless
    /// `clear_tasks` discards them. Returns the terminal pool error if the
    /// pool was cancelled.
    pub fn close(&self, clear_tasks: bool) -> Result<(), PoolError> {
        let taken = {
            let mut inner = self.lock();
            if inner.state == PoolState::NotStarted {
                return Err(PoolError::InvalidState(
                    "can't close worker pool before starting it".to_string(),
                ));
            }
            if inner.state == PoolState::Running {
                // With no live workers there is nothing left to wait for
                inner.state = if inner.active_workers == 0 {
                    PoolState::Finished
                } else {
                    PoolState::Closed
                };
            }
            inner.terminal.take()
        };
        if clear_tasks {
            let mut dropped = 0usize;
            while self.shared.tasks_rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!("cleared {dropped} unstarted task(s) from worker pool queue");
            }
        }
        self.shared.cond.notify_all();
        match taken {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until every worker has exited. Returns the terminal pool error
    /// if the workers finished by cancelling.
    pub fn join(&self) -> Result<(), PoolError> {
        let (handles, terminal) = {
            let mut inner = self.lock();
            if matches!(inner.state, PoolState::NotStarted | PoolState::Running) {
                return Err(PoolError::InvalidState(format!(
                    "can't join worker pool while in \"{}\" state",
                    inner.state.name()
                )));
            }
            while inner.active_workers > 0 {
                inner = self
                    .shared
                    .cond
                    .wait(inner)
                    .expect("worker pool lock poisoned");
            }
            let handles: Vec<JoinHandle<()>> = inner.handles.drain(..).collect();
            (handles, inner.terminal.take())
        };
        for handle in handles {
            let _ = handle.join();
        }
        match terminal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn run_worker<T: Send + 'static>(shared: Arc<Shared<T>>) {
    tracing::debug!("started new pool worker");
    loop {
        {
            let inner = shared.inner.lock().expect("worker pool lock poisoned");
            // Cancelled pools leave unstarted tasks in the queue; they must
            // not run
            if matches!(inner.state, PoolState::Cancelling | PoolState::Finished) {
                break;
            }
        }
        // Empty queue retires this worker; a later submit spawns a fresh one
        let (task, id) = match shared.tasks_rx.try_recv() {
            Ok(item) => item,
            Err(_) => break,
        };
        run_task(&shared, task, id);
    }

    if let Some(hook) = &shared.on_close_hook {
        hook();
    }
    let mut inner = shared.inner.lock().expect("worker pool lock poisoned");
    inner.active_workers -= 1;
    if inner.state == PoolState::Closed && inner.active_workers == 0 {
        inner.state = PoolState::Finished;
    }
    drop(inner);
    shared.cond.notify_all();
    tracing::debug!("pool worker exited");
}

fn run_task<T: Send + 'static>(shared: &Shared<T>, task: Task<T>, id: String) {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        Ok(Ok(value)) => {
            if let Some(results) = &shared.results {
                // A dropped receiver means the consumer is gone; the value
                // is discarded and the worker keeps going
                let _ = results.send(value);
            }
        }
        Ok(Err(error)) => task_error(shared, error, id),
        Err(panic) => task_panic(shared, panic_message(&panic), id),
    }
}

fn task_error<T: Send + 'static>(shared: &Shared<T>, error: anyhow::Error, id: String) {
    // The handler runs without the pool lock so it can freely touch
    // channels and metrics
    if let Some(handler) = &shared.error_handler {
        if handler(&error, &id) {
            return;
        }
    }
    let label = if id.trim().is_empty() { "task" } else { id.as_str() };
    tracing::error!("{label} failed: {error:#}");

    {
        let mut inner = shared.inner.lock().expect("worker pool lock poisoned");
        inner.errors.push((id, error));
        if inner.errors.len() <= shared.error_threshold {
            return;
        }
        if inner.state == PoolState::Cancelling {
            return;
        }
        inner.state = PoolState::Cancelling;
    }
    finish_cancelling(shared);
}

fn task_panic<T: Send + 'static>(shared: &Shared<T>, message: String, id: String) {
    tracing::error!("task \"{id}\" failed with fatal panic: {message}");
    {
        let mut inner = shared.inner.lock().expect("worker pool lock poisoned");
        if inner.terminal.is_none() {
            inner.terminal = Some(PoolError::TaskPanic { id, message });
        }
        if inner.state == PoolState::Cancelling {
            return;
        }
        inner.state = PoolState::Cancelling;
    }
    finish_cancelling(shared);
}

/// Runs on the worker that tripped cancellation: wait for the peers to
/// finish their in-flight tasks (tasks are never aborted mid-flight), record
/// the terminal error, and move the pool to Finished.
fn finish_cancelling<T: Send + 'static>(shared: &Shared<T>) {
    tracing::debug!("cancelling: waiting for other workers to finish before recording error(s)");
    let mut inner = shared.inner.lock().expect("worker pool lock poisoned");
    while inner.active_workers > 1 {
        inner = shared
            .cond
            .wait(inner)
            .expect("worker pool lock poisoned");
    }
    if inner.terminal.is_none() {
        let errors = std::mem::take(&mut inner.errors);
        inner.terminal = Some(PoolError::TooManyErrors {
            threshold: shared.error_threshold,
            errors,
        });
    }
    inner.state = PoolState::Finished;
    drop(inner);

    let remaining = shared.tasks_rx.len();
    if remaining > 0 {
        tracing::warn!(
            "{remaining} task{} in worker pool not finished",
            if remaining == 1 { "" } else { "s" }
        );
    }
    shared.cond.notify_all();
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_with(
        max_workers: usize,
        error_threshold: usize,
        results: Option<Sender<usize>>,
    ) -> WorkerPool<usize> {
        WorkerPool::new(WorkerPoolOptions {
            max_workers,
            error_threshold,
            task_queue_size: 64,
            results,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_runs_all_tasks_and_forwards_results() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = pool_with(4, 0, Some(tx));
        pool.start().unwrap();
        for i in 0..20 {
            pool.submit(move || Ok(i), format!("task-{i}")).unwrap();
        }
        pool.close(false).unwrap();
        pool.join().unwrap();
        assert!(pool.is_finished());

        let mut results: Vec<usize> = rx.try_iter().collect();
        results.sort_unstable();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_never_exceeds_max_workers() {
        let max = 3;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(max, 0, None);
        pool.start().unwrap();

        for i in 0..30 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit(
                move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(0)
                },
                format!("task-{i}"),
            )
            .unwrap();
        }
        pool.close(false).unwrap();
        pool.join().unwrap();
        assert!(peak.load(Ordering::SeqCst) <= max);
    }

    #[test]
    fn test_error_budget_overflow_surfaces_composite() {
        let pool = pool_with(1, 2, None);
        pool.start().unwrap();
        for i in 0..3 {
            pool.submit(
                move || Err(anyhow::anyhow!("boom {i}")),
                format!("bad-{i}"),
            )
            .unwrap();
        }
        // Workers drain sequentially; wait for the cancellation to land
        while !pool.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let err = pool.close(false).unwrap_err();
        match err {
            PoolError::TooManyErrors { threshold, errors } => {
                assert_eq!(threshold, 2);
                assert_eq!(errors.len(), 3, "exactly k+1 errors must be recorded");
            }
            other => panic!("expected TooManyErrors, got {other}"),
        }
        assert!(pool.is_finished());
    }

    #[test]
    fn test_errors_within_budget_do_not_cancel() {
        let pool = pool_with(2, 5, None);
        pool.start().unwrap();
        for i in 0..3 {
            pool.submit(move || Err(anyhow::anyhow!("boom {i}")), format!("bad-{i}"))
                .unwrap();
        }
        pool.submit(|| Ok(1), "good").unwrap();
        pool.close(false).unwrap();
        pool.join().unwrap();
        assert_eq!(pool.error_count(), 3);
    }

    #[test]
    fn test_error_handler_swallows_errors() {
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_clone = Arc::clone(&handled);
        let pool = WorkerPool::<usize>::new(WorkerPoolOptions {
            max_workers: 1,
            error_threshold: 0,
            task_queue_size: 16,
            error_handler: Some(Box::new(move |_err, _id| {
                handled_clone.fetch_add(1, Ordering::SeqCst);
                true
            })),
            ..Default::default()
        })
        .unwrap();
        pool.start().unwrap();
        for i in 0..4 {
            pool.submit(move || Err(anyhow::anyhow!("boom {i}")), format!("bad-{i}"))
                .unwrap();
        }
        pool.close(false).unwrap();
        pool.join().unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 4);
        assert_eq!(pool.error_count(), 0);
    }

    #[test]
    fn test_panic_is_fatal_despite_handler_and_budget() {
        let pool = WorkerPool::<usize>::new(WorkerPoolOptions {
            max_workers: 1,
            error_threshold: 100,
            task_queue_size: 16,
            error_handler: Some(Box::new(|_, _| true)),
            ..Default::default()
        })
        .unwrap();
        pool.start().unwrap();
        pool.submit(|| panic!("catastrophic"), "doomed").unwrap();
        while !pool.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let err = pool.join().unwrap_err();
        assert!(matches!(err, PoolError::TaskPanic { .. }), "got {err}");
    }

    #[test]
    fn test_submissions_while_cancelling_are_dropped_silently() {
        let pool = pool_with(1, 0, None);
        pool.start().unwrap();
        pool.submit(|| Err(anyhow::anyhow!("boom")), "bad").unwrap();
        while !pool.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Finished after cancelling: the first post-mortem submit yields the
        // terminal error, not a silent drop
        let err = pool.submit(|| Ok(1), "late").unwrap_err();
        assert!(matches!(err, PoolError::TooManyErrors { .. }));
    }

    #[test]
    fn test_lifecycle_misuse_is_rejected() {
        let pool = pool_with(1, 0, None);
        assert!(pool.submit(|| Ok(0), "early").is_err());
        assert!(pool.close(false).is_err());
        pool.start().unwrap();
        assert!(pool.start().is_err());
        assert!(pool.join().is_err(), "join before close must fail");
        pool.close(false).unwrap();
        pool.join().unwrap();
        assert!(pool.submit(|| Ok(0), "late").is_err());
    }

    #[test]
    fn test_close_with_clear_tasks_discards_queue() {
        let gate = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(1, 0, None);
        pool.start().unwrap();

        let gate_clone = Arc::clone(&gate);
        pool.submit(
            move || {
                while gate_clone.load(Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(0)
            },
            "blocker",
        )
        .unwrap();
        for i in 0..5 {
            let ran = Arc::clone(&ran);
            pool.submit(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                },
                format!("queued-{i}"),
            )
            .unwrap();
        }

        pool.close(true).unwrap();
        gate.store(1, Ordering::SeqCst);
        pool.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0, "cleared tasks must not run");
    }

    #[test]
    fn test_on_close_hook_runs_per_worker() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_clone = Arc::clone(&hook_calls);
        let pool = WorkerPool::<usize>::new(WorkerPoolOptions {
            max_workers: 2,
            task_queue_size: 16,
            on_close_hook: Some(Box::new(move || {
                hook_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        })
        .unwrap();
        pool.start().unwrap();
        for i in 0..8 {
            pool.submit(
                || {
                    std::thread::sleep(Duration::from_millis(3));
                    Ok(0)
                },
                format!("task-{i}"),
            )
            .unwrap();
        }
        pool.close(false).unwrap();
        pool.join().unwrap();
        // Workers also retire when the queue momentarily empties, so the
        // hook runs at least once per worker that ever existed
        assert!(hook_calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_close_on_idle_pool_reaches_finished() {
        let pool = pool_with(2, 0, None);
        pool.start().unwrap();
        pool.close(false).unwrap();
        assert!(pool.is_finished());
        pool.join().unwrap();
    }
}
