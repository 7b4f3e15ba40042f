//! Tasks and the worker that runs them.
//!
//! A [`Task`] is one unit of device work. The [`TaskEngine`] owns the
//! session and the filesystem on a single worker thread and runs tasks one
//! at a time; callers observe them through the shared [`TaskHandle`].
//!
//! Cancellation is cooperative. [`TaskHandle::cancel`] only sets a flag;
//! task bodies call [`TaskContext::check_cancel`] between steps and return
//! [`Error::Cancelled`], which the engine records as a clean finish. A
//! command already on the wire always completes.

pub mod catalog;
pub mod engine;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fs::FatFs;
use crate::protocol::session::Session;

pub use engine::{BatchProgress, EngineConfig, Event, TaskEngine};

/// Progress value meaning "unknown".
pub const INDETERMINATE: f32 = -1.0;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// One unit of device work.
pub trait Task: Send {
    /// Short description shown while the task runs.
    fn title(&self) -> String;

    /// Do the work. Return [`Error::Cancelled`] to stop early.
    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()>;

    /// Whether the engine signs on before calling [`run`](Self::run).
    fn requires_sign_on(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct HandleState {
    status: String,
    progress: f32,
    error: Option<Error>,
    finished: bool,
}

/// Shared view of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    title: String,
    state: Mutex<HandleState>,
    done: Condvar,
    cancelled: AtomicBool,
    suppress: AtomicUsize,
}

impl TaskHandle {
    /// Fresh handle.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            state: Mutex::new(HandleState {
                status: String::new(),
                progress: INDETERMINATE,
                error: None,
                finished: false,
            }),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
            suppress: AtomicUsize::new(0),
        }
    }

    /// Task title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Latest status line.
    pub fn status(&self) -> String {
        lock(&self.state).status.clone()
    }

    /// Replace the status line.
    pub fn set_status(&self, status: impl Into<String>) {
        lock(&self.state).status = status.into();
    }

    /// Progress in `[0, 1]`, or [`INDETERMINATE`].
    pub fn progress(&self) -> f32 {
        lock(&self.state).progress
    }

    /// Report progress.
    ///
    /// Values are clamped to `[0, 1]` and never move backwards, so any
    /// observer sees a non-decreasing sequence. A negative value only takes
    /// effect before the first real value.
    pub fn set_progress(&self, progress: f32) {
        let mut state = lock(&self.state);
        if progress < 0.0 {
            if state.progress <= 0.0 {
                state.progress = INDETERMINATE;
            }
            return;
        }
        let progress = progress.min(1.0);
        if progress > state.progress {
            state.progress = progress;
        }
    }

    /// Ask the task to stop at its next check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the task should stop. Always false inside
    /// [`suppress_cancel`](Self::suppress_cancel).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) && self.suppress.load(Ordering::SeqCst) == 0
    }

    /// Whether cancel was requested, regardless of suppression.
    pub fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Hide cancellation until the guard drops, so cleanup can run.
    pub fn suppress_cancel(&self) -> SuppressCancel<'_> {
        self.suppress.fetch_add(1, Ordering::SeqCst);
        SuppressCancel { handle: self }
    }

    /// Message of the failure, if the task failed.
    pub fn error(&self) -> Option<String> {
        lock(&self.state)
            .error
            .as_ref()
            .map(ToString::to_string)
    }

    /// Take the failure out of the handle.
    pub fn take_error(&self) -> Option<Error> {
        lock(&self.state).error.take()
    }

    /// Whether the task failed.
    pub fn has_failed(&self) -> bool {
        lock(&self.state).error.is_some()
    }

    /// Whether the task finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }

    /// Block until the task finished.
    pub fn wait(&self) {
        let mut state = lock(&self.state);
        while !state.finished {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until finished or `timeout` elapsed; returns whether finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        let (state, _) = self
            .done
            .wait_timeout_while(state, timeout, |s| !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.finished
    }

    /// Turn the task result into a caller-facing result.
    pub fn result(&self) -> Result<()> {
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn finish(&self, error: Option<Error>) {
        let mut state = lock(&self.state);
        if error.is_none() && !self.cancel_requested() {
            state.progress = 1.0;
        }
        state.error = error;
        state.finished = true;
        drop(state);
        self.done.notify_all();
    }
}

/// Guard returned by [`TaskHandle::suppress_cancel`].
#[derive(Debug)]
pub struct SuppressCancel<'a> {
    handle: &'a TaskHandle,
}

impl Drop for SuppressCancel<'_> {
    fn drop(&mut self) {
        self.handle
            .suppress
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result slot a task fills while running and the caller reads afterwards.
#[derive(Debug)]
pub struct TaskOutput<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for TaskOutput<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for TaskOutput<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> TaskOutput<T> {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value.
    pub fn set(&self, value: T) {
        *lock(&self.slot) = Some(value);
    }

    /// Remove and return the value.
    pub fn take(&self) -> Option<T> {
        lock(&self.slot).take()
    }
}

impl<T: Clone> TaskOutput<T> {
    /// Copy of the value.
    pub fn get(&self) -> Option<T> {
        lock(&self.slot).clone()
    }
}

/// What a running task can reach.
pub struct TaskContext<'a> {
    fs: &'a mut FatFs<Session>,
    handle: &'a Arc<TaskHandle>,
    notify: &'a dyn Fn(Event),
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        fs: &'a mut FatFs<Session>,
        handle: &'a Arc<TaskHandle>,
        notify: &'a dyn Fn(Event),
    ) -> Self {
        Self { fs, handle, notify }
    }

    /// The card filesystem.
    pub fn fs(&mut self) -> &mut FatFs<Session> {
        self.fs
    }

    /// The protocol session.
    pub fn session(&mut self) -> &mut Session {
        self.fs.device_mut()
    }

    /// This task's handle.
    pub fn handle(&self) -> &Arc<TaskHandle> {
        self.handle
    }

    /// `Err(Cancelled)` once cancel was requested.
    pub fn check_cancel(&self) -> Result<()> {
        if self.handle.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Update the status line and tell subscribers.
    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.handle.set_status(status.clone());
        (self.notify)(Event::Status {
            title: self.handle.title().to_string(),
            status,
        });
    }

    /// Report progress.
    pub fn set_progress(&self, progress: f32) {
        self.handle.set_progress(progress);
    }

    /// A transfer callback for `len` bytes: reports `offset + done` out of
    /// `total` and stops on cancel.
    pub fn transfer_progress(&self, offset: u64, total: u64) -> impl FnMut(u64) -> Result<()> + use<> {
        let handle = Arc::clone(self.handle);
        move |done| {
            if total > 0 {
                handle.set_progress((offset + done) as f32 / total as f32);
            }
            if handle.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}
