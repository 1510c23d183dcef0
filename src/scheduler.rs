//! Dispatch of node evaluations onto the worker pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{ErrorInfo, Key};

/// Why scheduling was aborted.
#[derive(Debug, Clone)]
pub struct SchedulerAbort {
    /// The key whose error triggered the abort.
    pub failed_key: Key,
    /// Its error.
    pub error_info: Arc<ErrorInfo>,
    /// In-progress parents to start error bubbling from.
    pub rdeps_to_bubble_up_to: Vec<Key>,
}

/// How the dispatched work ended.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Every enqueued evaluation ran.
    Completed,
    /// An error stopped scheduling.
    Aborted(SchedulerAbort),
    /// The caller cancelled the evaluation.
    Interrupted,
}

/// A node function that panicked.
#[derive(Debug, Clone)]
pub(crate) struct Crash {
    pub key: Key,
    pub message: String,
}

/// Runs node evaluations on a rayon pool and tracks when all of them are finished.
pub struct NodeVisitor {
    pool: Arc<rayon::ThreadPool>,
    pending: Mutex<usize>,
    idle: Condvar,
    halted: AtomicBool,
    interrupted: AtomicBool,
    abort: Mutex<Option<SchedulerAbort>>,
    crashes: Mutex<Vec<Crash>>,
}

impl NodeVisitor {
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self {
            pool,
            pending: Mutex::new(0),
            idle: Condvar::new(),
            halted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            abort: Mutex::new(None),
            crashes: Mutex::new(Vec::new()),
        }
    }

    /// Runs `task` for `key` on the pool unless scheduling was halted.
    ///
    /// A panic in `task` is recorded as a crash and halts scheduling.
    pub fn spawn<F>(self: &Arc<Self>, key: Key, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_halted() {
            return;
        }
        *self.pending.lock() += 1;
        let visitor = self.clone();
        self.pool.spawn(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                let message = panic_message(payload.as_ref());
                tracing::warn!(key = ?key, %message, "node function crashed");
                visitor.crashes.lock().push(Crash { key, message });
                visitor.halted.store(true, Ordering::SeqCst);
            }
            visitor.task_done();
        });
    }

    fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Returns true once no new evaluation should start.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stops scheduling because of an error. The first abort wins.
    pub fn halt_with_error(&self, abort: SchedulerAbort) {
        let mut current = self.abort.lock();
        if current.is_none() {
            tracing::debug!(key = ?abort.failed_key, "scheduling aborted");
            *current = Some(abort);
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Stops scheduling because the caller cancelled the evaluation.
    pub fn halt_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Blocks until every spawned evaluation has finished.
    pub fn wait_for_completion(&self) -> Completion {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
        drop(pending);
        if self.interrupted.load(Ordering::SeqCst) {
            return Completion::Interrupted;
        }
        match self.abort.lock().clone() {
            Some(abort) => Completion::Aborted(abort),
            None => Completion::Completed,
        }
    }

    pub(crate) fn take_crashes(&self) -> Vec<Crash> {
        std::mem::take(&mut *self.crashes.lock())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
