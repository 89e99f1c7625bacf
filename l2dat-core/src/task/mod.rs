//! Cancellable tasks with weighted progress.
//!
//! One task may run at a time. Work executes on a rayon pool and reports
//! back over a channel; the presentation side drains it with
//! [`TaskEvents::dispatch`] into a [`TaskObserver`].

pub mod progress;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::error::{DatError, Result};
pub use progress::{ProgressTracker, compose};

/// Cooperative cancellation flag shared by a task and its runner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Cancelled,
    Failed(String),
}

/// A decoded file handed to the presentation layer.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub cipher: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started { id: u64, name: String },
    Progress(u8),
    Log(String),
    Document(Document),
    Finished { id: u64, status: TaskStatus },
}

/// Callback surface of a task. Called on the thread that dispatches.
pub trait TaskObserver {
    fn on_start(&mut self, _name: &str) {}
    fn on_progress(&mut self, _percent: u8) {}
    fn on_log(&mut self, _line: &str) {}
    fn on_document(&mut self, _doc: Document) {}
    fn on_success(&mut self) {}
    fn on_cancel(&mut self) {}
    fn on_fail(&mut self, _reason: &str) {}
}

/// Receiving end of the task event stream.
pub struct TaskEvents {
    rx: Receiver<TaskEvent>,
}

impl TaskEvents {
    /// Delivers events until a task finishes and returns its status.
    /// `None` means the runner is gone.
    pub fn dispatch(&self, observer: &mut dyn TaskObserver) -> Option<TaskStatus> {
        while let Ok(event) = self.rx.recv() {
            if let Some(status) = deliver(observer, event) {
                return Some(status);
            }
        }
        None
    }
}

fn deliver(observer: &mut dyn TaskObserver, event: TaskEvent) -> Option<TaskStatus> {
    match event {
        TaskEvent::Started { name, .. } => observer.on_start(&name),
        TaskEvent::Progress(p) => observer.on_progress(p),
        TaskEvent::Log(line) => observer.on_log(&line),
        TaskEvent::Document(doc) => observer.on_document(doc),
        TaskEvent::Finished { status, .. } => {
            match &status {
                TaskStatus::Succeeded => observer.on_success(),
                TaskStatus::Cancelled => observer.on_cancel(),
                TaskStatus::Failed(reason) => observer.on_fail(reason),
            }
            return Some(status);
        }
    }
    None
}

/// Per-run state handed to an action.
pub struct TaskContext {
    cancel: CancelToken,
    progress: ProgressTracker,
    events: Option<Sender<TaskEvent>>,
}

impl TaskContext {
    /// A context that reports nowhere and is never cancelled from outside.
    pub fn detached() -> Self {
        Self {
            cancel: CancelToken::new(),
            progress: ProgressTracker::new(),
            events: None,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the task was aborted.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DatError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.percent()
    }

    pub fn add_progress(&mut self, weight: f64, local: f64) {
        if let Some(p) = self.progress.add(weight, local) {
            self.send(TaskEvent::Progress(p));
        }
    }

    pub fn set_progress(&mut self, value: f64) {
        if let Some(p) = self.progress.set(value) {
            self.send(TaskEvent::Progress(p));
        }
    }

    /// The single log record of an event: traced at info and forwarded to
    /// observers, which should not print it again.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.send(TaskEvent::Log(line));
    }

    pub fn document(&self, doc: Document) {
        self.send(TaskEvent::Document(doc));
    }

    fn send(&self, event: TaskEvent) {
        if let Some(tx) = &self.events {
            // a dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

/// A unit of work the runner can execute.
pub trait Action: Send + 'static {
    fn name(&self) -> String;
    fn run(&self, ctx: &mut TaskContext) -> Result<()>;
}

const VALIDATION_THREADS: usize = 1;

struct ActiveTask {
    id: u64,
    cancel: CancelToken,
}

pub struct TaskRunner {
    pool: ThreadPool,
    validation: Arc<ThreadPool>,
    slot: Arc<Mutex<Option<ActiveTask>>>,
    events: Sender<TaskEvent>,
    next_id: AtomicU64,
}

impl TaskRunner {
    /// `threads == 0` lets rayon pick.
    pub fn new(threads: usize) -> Result<(Self, TaskEvents)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("l2dat-worker-{i}"))
            .build()
            .map_err(|e| DatError::Runtime(format!("worker pool: {e}")))?;
        let validation = rayon::ThreadPoolBuilder::new()
            .num_threads(VALIDATION_THREADS)
            .thread_name(|i| format!("l2dat-validate-{i}"))
            .build()
            .map_err(|e| DatError::Runtime(format!("validation pool: {e}")))?;
        let (tx, rx) = unbounded();
        let runner = Self {
            pool,
            validation: Arc::new(validation),
            slot: Arc::new(Mutex::new(None)),
            events: tx,
            next_id: AtomicU64::new(1),
        };
        Ok((runner, TaskEvents { rx }))
    }

    /// Pool for background validation. Separate from the task pool so a
    /// running batch never holds validation back.
    pub fn validation_pool(&self) -> Arc<ThreadPool> {
        Arc::clone(&self.validation)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Starts `action` unless another task holds the slot.
    pub fn start(&self, action: Box<dyn Action>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        let name = action.name();
        {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                warn!(task = %name, "rejected: another task is running");
                return Err(DatError::TaskBusy);
            }
            *slot = Some(ActiveTask {
                id,
                cancel: cancel.clone(),
            });
            let _ = self.events.send(TaskEvent::Started {
                id,
                name: name.clone(),
            });
        }
        debug!(task = %name, id, "task started");

        let slot = Arc::clone(&self.slot);
        let events = self.events.clone();
        self.pool.spawn(move || {
            let mut ctx = TaskContext {
                cancel,
                progress: ProgressTracker::new(),
                events: Some(events.clone()),
            };
            let _ = events.send(TaskEvent::Progress(0));

            let outcome = catch_unwind(AssertUnwindSafe(|| action.run(&mut ctx)));
            let status = match outcome {
                // an abort that lands after the last write changes nothing
                Ok(Ok(())) => {
                    ctx.set_progress(100.0);
                    TaskStatus::Succeeded
                }
                Ok(Err(e)) if e.is_cancelled() => TaskStatus::Cancelled,
                Ok(Err(e)) => TaskStatus::Failed(e.to_string()),
                Err(panic) => TaskStatus::Failed(panic_message(panic.as_ref())),
            };
            // the observer reports the outcome
            debug!(task = %name, id, ?status, "task finished");

            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|t| t.id == id) {
                *slot = None;
            }
            let _ = events.send(TaskEvent::Finished { id, status });
        });
        Ok(id)
    }

    /// Asks the running task to stop. `false` when nothing is running.
    pub fn abort(&self) -> bool {
        match self.slot.lock().as_ref() {
            Some(task) => {
                task.cancel.cancel();
                debug!(id = task.id, "abort requested");
                true
            }
            None => false,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Steps(u32);

    impl Action for Steps {
        fn name(&self) -> String {
            "steps".into()
        }

        fn run(&self, ctx: &mut TaskContext) -> Result<()> {
            for _ in 0..self.0 {
                ctx.checkpoint()?;
                ctx.add_progress(100.0 / self.0 as f64, 100.0);
            }
            Ok(())
        }
    }

    /// Blocks until released, then honours cancellation.
    struct Gate(Mutex<Option<mpsc::Receiver<()>>>);

    impl Action for Gate {
        fn name(&self) -> String {
            "gate".into()
        }

        fn run(&self, ctx: &mut TaskContext) -> Result<()> {
            if let Some(rx) = self.0.lock().take() {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            ctx.checkpoint()
        }
    }

    /// Finishes its work, then waits before returning `Ok`.
    struct LateReturn {
        done: mpsc::Sender<()>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl Action for LateReturn {
        fn name(&self) -> String {
            "late".into()
        }

        fn run(&self, ctx: &mut TaskContext) -> Result<()> {
            ctx.add_progress(100.0, 100.0);
            let _ = self.done.send(());
            if let Some(rx) = self.release.lock().take() {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            Ok(())
        }
    }

    struct Boom;

    impl Action for Boom {
        fn name(&self) -> String {
            "boom".into()
        }

        fn run(&self, _ctx: &mut TaskContext) -> Result<()> {
            panic!("descriptor table exploded");
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        progress: Vec<u8>,
    }

    impl TaskObserver for Recorder {
        fn on_start(&mut self, name: &str) {
            self.calls.push(format!("start:{name}"));
        }
        fn on_progress(&mut self, percent: u8) {
            self.progress.push(percent);
        }
        fn on_success(&mut self) {
            self.calls.push("success".into());
        }
        fn on_cancel(&mut self) {
            self.calls.push("cancel".into());
        }
        fn on_fail(&mut self, reason: &str) {
            self.calls.push(format!("fail:{reason}"));
        }
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let (runner, events) = TaskRunner::new(2).unwrap();
        runner.start(Box::new(Steps(7))).unwrap();
        let mut rec = Recorder::default();
        assert_eq!(events.dispatch(&mut rec), Some(TaskStatus::Succeeded));
        assert!(rec.progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", rec.progress);
        assert_eq!(rec.progress.first(), Some(&0));
        assert_eq!(rec.progress.last(), Some(&100));
        assert_eq!(rec.calls, ["start:steps", "success"]);
        assert!(!runner.is_busy());
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let (runner, events) = TaskRunner::new(2).unwrap();
        let (release, gate) = mpsc::channel();
        runner
            .start(Box::new(Gate(Mutex::new(Some(gate)))))
            .unwrap();
        let err = runner.start(Box::new(Steps(1))).unwrap_err();
        assert!(matches!(err, DatError::TaskBusy));

        release.send(()).unwrap();
        let mut rec = Recorder::default();
        assert_eq!(events.dispatch(&mut rec), Some(TaskStatus::Succeeded));

        // slot is free again
        runner.start(Box::new(Steps(1))).unwrap();
        assert_eq!(events.dispatch(&mut rec), Some(TaskStatus::Succeeded));
    }

    #[test]
    fn abort_ends_in_cancel() {
        let (runner, events) = TaskRunner::new(1).unwrap();
        let (release, gate) = mpsc::channel();
        runner
            .start(Box::new(Gate(Mutex::new(Some(gate)))))
            .unwrap();
        assert!(runner.abort());
        release.send(()).unwrap();
        let mut rec = Recorder::default();
        assert_eq!(events.dispatch(&mut rec), Some(TaskStatus::Cancelled));
        assert_eq!(rec.calls, ["start:gate", "cancel"]);
        assert!(!runner.abort());
    }

    #[test]
    fn abort_after_completed_work_still_succeeds() {
        let (runner, events) = TaskRunner::new(1).unwrap();
        let (done_tx, done) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        runner
            .start(Box::new(LateReturn {
                done: done_tx,
                release: Mutex::new(Some(release_rx)),
            }))
            .unwrap();
        done.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(runner.abort());
        release.send(()).unwrap();

        let mut rec = Recorder::default();
        assert_eq!(events.dispatch(&mut rec), Some(TaskStatus::Succeeded));
        assert_eq!(rec.calls, ["start:late", "success"]);
        assert_eq!(rec.progress.last(), Some(&100));
    }

    #[test]
    fn panic_is_reported_as_failure() {
        let (runner, events) = TaskRunner::new(1).unwrap();
        runner.start(Box::new(Boom)).unwrap();
        let mut rec = Recorder::default();
        match events.dispatch(&mut rec) {
            Some(TaskStatus::Failed(reason)) => assert!(reason.contains("exploded")),
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(!runner.is_busy());
    }

    #[test]
    fn detached_context_is_silent() {
        let mut ctx = TaskContext::detached();
        ctx.add_progress(50.0, 100.0);
        ctx.log("nobody listens");
        assert_eq!(ctx.progress(), 50);
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel_token().cancel();
        assert!(ctx.checkpoint().unwrap_err().is_cancelled());
    }
}
