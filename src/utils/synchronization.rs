//! Synchronization primitives for the loaders and the save pipeline.
//!
//! # Key Components
//!
//! - [`OnceTask`] - runs a side-effecting loader at most once, other callers block until it is
//!   done and observe the same outcome
//! - [`Completion`] - a one-shot latch carrying a value, used for in-flight loads and saves
//!
//! Both unblock every waiter when the work ends, including when the work panics, so that a
//! failed loader never leaves other threads hanging.

use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{Error, Result};

#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    Running,
    Finished(std::result::Result<(), Arc<Error>>),
}

/// A unit of work that executes at most once.
///
/// The first caller of [`OnceTask::run`] executes the closure; concurrent callers block until it
/// finishes. Later callers return immediately with the memoized outcome. A failure is memoized
/// too and reported to every caller as [`Error::Loader`], with the original error as source.
///
/// # Examples
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use pesmith::utils::synchronization::OnceTask;
///
/// let runs = AtomicUsize::new(0);
/// let task = OnceTask::new("resources");
/// for _ in 0..3 {
///     task.run(|| {
///         runs.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     })?;
/// }
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// # Ok::<(), pesmith::Error>(())
/// ```
#[derive(Debug)]
pub struct OnceTask {
    name: &'static str,
    state: Mutex<TaskState>,
    condvar: Condvar,
}

struct RunGuard<'a> {
    task: &'a OnceTask,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.task.finish(Err(Arc::new(Error::Error(format!(
                "{} loader panicked",
                self.task.name
            )))));
        }
    }
}

impl OnceTask {
    /// A task that has not run yet
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        OnceTask {
            name,
            state: Mutex::new(TaskState::Pending),
            condvar: Condvar::new(),
        }
    }

    /// Name used in error reports
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `work` unless it already ran, then reports its outcome.
    ///
    /// # Errors
    /// Returns [`Error::Loader`] if `work` failed, now or on its first run
    pub fn run<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                TaskState::Finished(outcome) => return self.report(outcome.clone()),
                TaskState::Running => {
                    state = self
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                TaskState::Pending => {
                    *state = TaskState::Running;
                    break;
                }
            }
        }
        drop(state);

        let mut guard = RunGuard {
            task: self,
            finished: false,
        };
        let outcome = work().map_err(Arc::new);
        guard.finished = true;
        self.finish(outcome.clone());
        self.report(outcome)
    }

    /// Blocks until the task has run, without starting it.
    ///
    /// Returns `Ok(())` immediately if the task is still pending.
    ///
    /// # Errors
    /// Returns [`Error::Loader`] if the task failed
    pub fn wait(&self) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .condvar
            .wait_while(state, |state| matches!(state, TaskState::Running))
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            TaskState::Finished(outcome) => self.report(outcome.clone()),
            _ => Ok(()),
        }
    }

    /// Returns true once the task ran, successfully or not
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            TaskState::Finished(_)
        )
    }

    /// Returns true while the work executes
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            TaskState::Running
        )
    }

    /// Forgets a finished outcome so the next [`OnceTask::run`] executes again.
    ///
    /// A running task is left alone.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, TaskState::Finished(_)) {
            *state = TaskState::Pending;
        }
    }

    fn finish(&self, outcome: std::result::Result<(), Arc<Error>>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = TaskState::Finished(outcome);
        self.condvar.notify_all();
    }

    fn report(&self, outcome: std::result::Result<(), Arc<Error>>) -> Result<()> {
        outcome.map_err(|source| Error::Loader {
            loader: self.name,
            source,
        })
    }
}

/// A one-shot latch carrying the result of some background work.
#[derive(Debug)]
pub struct Completion<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Completion {
            value: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }
}

impl<T: Clone> Completion<T> {
    /// An open latch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the value and releases every waiter. Only the first value is kept.
    pub fn complete(&self, value: T) {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(value);
        }
        self.condvar.notify_all();
    }

    /// Returns true once a value is stored
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Blocks until a value is stored
    pub fn wait(&self) -> T {
        let slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = self
            .condvar
            .wait_while(slot, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            Some(value) => value.clone(),
            None => unreachable!("wait_while returned without a value"),
        }
    }

    /// Blocks until a value is stored or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .condvar
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        slot.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn concurrent_callers_share_one_run() {
        let task = Arc::new(OnceTask::new("pe-info"));
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let task = Arc::clone(&task);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    task.run(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[test]
    fn failures_are_memoized() {
        let task = OnceTask::new("managed");
        let first = task.run(|| Err(malformed_error!("bad metadata")));
        let second = task.run(|| Ok(()));

        for outcome in [first, second] {
            match outcome {
                Err(Error::Loader { loader, source }) => {
                    assert_eq!(loader, "managed");
                    assert!(matches!(*source, Error::Malformed { .. }));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        task.reset();
        assert!(task.run(|| Ok(())).is_ok());
    }

    #[test]
    fn panicking_work_releases_waiters() {
        let task = Arc::new(OnceTask::new("resources"));
        let runner = Arc::clone(&task);
        let _ = thread::spawn(move || runner.run(|| panic!("boom"))).join();

        assert!(matches!(task.wait(), Err(Error::Loader { .. })));
    }

    #[test]
    fn completion_wakes_waiters() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait())
        };

        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), None);
        completion.complete(7_u32);
        completion.complete(8_u32);
        assert_eq!(waiter.join().unwrap(), 7);
        assert!(completion.is_complete());
        assert_eq!(completion.wait_timeout(Duration::ZERO), Some(7));
    }
}
