//! Base connection-observer lifecycle, shared by [`crate::command::Command`]
//! and [`crate::event::Event`].
//!
//! `ObserverHandle<T>` owns the generic machinery: the Created→Running→Done
//! state machine, the mutually-exclusive result/exception slot, the
//! lifetime clock fields, and the notify used to wake `await_done` callers.
//! It deliberately knows nothing about parsing — that's the job of the
//! concrete `Command<P>`/`Event<M>` wrappers, which embed a handle and
//! implement the object-safe [`crate::runner::Observer`] trait so the
//! runner can drive them without caring which concrete type it holds.
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Done,
}

/// The four mutually-exclusive terminal sub-states an observer can end in.
#[derive(Debug, Clone)]
enum Completion<T> {
    Resolved(T),
    Failed(Error),
    Cancelled,
    TimedOut(Error),
}

struct Inner<T> {
    state: RunState,
    completion: Option<Completion<T>>,
    /// Set by the runner when the lifetime timer elapses but the
    /// observer is still within its `terminating_timeout` grace window.
    /// Not yet terminal: a late success during that window clears it
    /// instead of the observer ever becoming "done" with it: arrival in
    /// the terminating window replaces the exception with success.
    pending_timeout: Option<Error>,
}

/// Mutable lifetime-clock fields, guarded separately from
/// `Inner<T>` so the runner's tick and a data handler's result-setting
/// never contend on the same lock.
#[derive(Debug, Clone)]
pub struct LifeStatus {
    pub start_time: Option<Instant>,
    pub last_feed_time: Option<Instant>,
    pub timeout: Duration,
    pub terminating_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub in_terminating: bool,
    pub was_on_timeout_called: bool,
}

/// Generic, cheap-clone (`Arc`-backed) shared state for one connection
/// observer. `T` is the observer's result type (a parser's accumulated
/// output for commands, the occurrence list for events).
pub struct ObserverHandle<T> {
    name: String,
    is_command: bool,
    life: Mutex<LifeStatus>,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone> ObserverHandle<T> {
    pub fn new(
        name: impl Into<String>,
        is_command: bool,
        timeout: Duration,
        terminating_timeout: Duration,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            is_command,
            life: Mutex::new(LifeStatus {
                start_time: None,
                last_feed_time: None,
                timeout,
                terminating_timeout,
                inactivity_timeout,
                in_terminating: false,
                was_on_timeout_called: false,
            }),
            inner: Mutex::new(Inner {
                state: RunState::Created,
                completion: None,
                pending_timeout: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_command(&self) -> bool {
        self.is_command
    }

    /// Transition Created -> Running and start the lifetime clock.
    /// Idempotent-failing: calling this on an already-started or done
    /// observer is `WrongUsage`.
    pub fn begin(&self, timeout_override: Option<Duration>) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != RunState::Created {
                return Err(Error::WrongUsage(format!(
                    "'{}' already started or done, cannot start again",
                    self.name
                )));
            }
            inner.state = RunState::Running;
        }
        let mut life = self.life.lock().unwrap();
        if let Some(t) = timeout_override {
            life.timeout = t;
        }
        let now = Instant::now();
        life.start_time = Some(now);
        life.last_feed_time = Some(now);
        Ok(())
    }

    pub fn life_snapshot(&self) -> LifeStatus {
        self.life.lock().unwrap().clone()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.life.lock().unwrap().timeout = timeout;
    }

    pub fn touch_last_feed_time(&self) {
        self.life.lock().unwrap().last_feed_time = Some(Instant::now());
    }

    /// Runner-only: remember a not-yet-terminal timeout exception and
    /// start the terminating-window clock. Guarded so the on_timeout hook
    /// fires at most once per observer.
    pub fn mark_timeout_pending(&self, err: Error) -> bool {
        let mut life = self.life.lock().unwrap();
        if life.was_on_timeout_called {
            return false;
        }
        life.was_on_timeout_called = true;
        life.in_terminating = true;
        life.start_time = Some(Instant::now());
        drop(life);
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RunState::Done {
            inner.pending_timeout = Some(err);
        }
        true
    }

    /// Runner-only: the terminating grace window elapsed with no late
    /// success — finalise as timed-out.
    pub fn finalize_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RunState::Done {
            return;
        }
        if let Some(err) = inner.pending_timeout.take() {
            inner.completion = Some(Completion::TimedOut(err));
            inner.state = RunState::Done;
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Writable once. A second call after the observer is already done
    /// is `ResultAlreadySet`.
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RunState::Done {
            return Err(Error::ResultAlreadySet(self.name.clone()));
        }
        inner.pending_timeout = None;
        inner.completion = Some(Completion::Resolved(value));
        inner.state = RunState::Done;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Writable once. A second call after the observer is already done
    /// is `ResultAlreadySet`.
    pub fn set_exception(&self, err: Error) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RunState::Done {
            return Err(Error::ResultAlreadySet(self.name.clone()));
        }
        inner.pending_timeout = None;
        inner.completion = Some(Completion::Failed(err));
        inner.state = RunState::Done;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// `cancel()`: false (no mutation) if already done, true (and
    /// transitions to done) otherwise.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RunState::Done {
            return false;
        }
        inner.pending_timeout = None;
        inner.completion = Some(Completion::Cancelled);
        inner.state = RunState::Done;
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    pub fn cancelled(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().completion,
            Some(Completion::Cancelled)
        )
    }

    /// True only once a *terminal* completion has been recorded. An
    /// observer with a merely-`pending_timeout` exception (still inside
    /// its terminating window) is not yet done.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().state == RunState::Done
    }

    pub fn result(&self) -> Result<T, Error> {
        let inner = self.inner.lock().unwrap();
        match &inner.completion {
            Some(Completion::Resolved(v)) => Ok(v.clone()),
            Some(Completion::Failed(e)) => Err(e.clone()),
            Some(Completion::TimedOut(e)) => Err(e.clone()),
            Some(Completion::Cancelled) => Err(Error::NoResultSinceCancelCalled(self.name.clone())),
            None => Err(Error::ResultNotAvailableYet(self.name.clone())),
        }
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Build the taxonomy-correct timeout error for this observer's kind.
    fn synth_timeout_err(&self, elapsed_or_budget: Duration) -> Error {
        let life = self.life_snapshot();
        if self.is_command {
            Error::CommandTimeout {
                command: self.name.clone(),
                timeout: life.timeout,
                passed: elapsed_or_budget,
            }
        } else {
            Error::ConnectionObserverTimeout {
                observer: self.name.clone(),
                timeout: life.timeout,
                passed: elapsed_or_budget,
            }
        }
    }

    /// Block until done or `timeout` elapses.
    ///
    /// With `timeout = None`, waits indefinitely for the notify — correct
    /// because the observer's *own* lifetime timeout is independently
    /// enforced by whichever [`crate::runner::Runner`] it was submitted
    /// to, which will eventually drive it to done. A caller-supplied
    /// `timeout` is an independent, caller-side patience budget: on
    /// elapse a timeout error is returned to the caller without mutating
    /// the observer, which keeps running under the runner's control — the
    /// runner's tick loop always independently drives the observer,
    /// whether or not anyone is currently awaiting it.
    pub async fn await_done(&self, timeout: Option<Duration>) -> Result<T, Error> {
        if self.is_done() {
            return self.result();
        }
        match timeout {
            None => loop {
                if self.is_done() {
                    return self.result();
                }
                self.notified().await;
            },
            Some(budget) => {
                let deadline = Instant::now() + budget;
                loop {
                    if self.is_done() {
                        return self.result();
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.synth_timeout_err(budget));
                    }
                    tokio::select! {
                        _ = self.notified() => {}
                        _ = tokio::time::sleep(remaining) => {
                            return Err(self.synth_timeout_err(budget));
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

    #[test]
    fn result_before_done_is_not_available() {
        let handle: ObserverHandle<i32> =
            ObserverHandle::new("t", false, Duration::from_secs(1), Duration::ZERO, Duration::ZERO);
        assert!(matches!(handle.result(), Err(Error::ResultNotAvailableYet(_))));
    }

    #[test]
    fn set_result_then_second_write_is_already_set() {
        let handle: ObserverHandle<i32> =
            ObserverHandle::new("t", false, Duration::from_secs(1), Duration::ZERO, Duration::ZERO);
        handle.set_result(1).unwrap();
        assert_eq!(handle.result().unwrap(), 1);
        assert!(matches!(
            handle.set_result(2),
            Err(Error::ResultAlreadySet(_))
        ));
    }

    #[test]
    fn cancel_on_done_is_noop_false() {
        let handle: ObserverHandle<i32> =
            ObserverHandle::new("t", false, Duration::from_secs(1), Duration::ZERO, Duration::ZERO);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(matches!(
            handle.result(),
            Err(Error::NoResultSinceCancelCalled(_))
        ));
    }

    #[test]
    fn pending_timeout_is_not_yet_done() {
        let handle: ObserverHandle<i32> = ObserverHandle::new(
            "t",
            false,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::ZERO,
        );
        handle.begin(None).unwrap();
        assert!(handle.mark_timeout_pending(Error::Other("timeout".into())));
        assert!(!handle.is_done(), "should still be in terminating grace");
        // late success clears the pending timeout
        handle.set_result(7).unwrap();
        assert_eq!(handle.result().unwrap(), 7);
    }

    #[test]
    fn finalize_timeout_after_grace_elapses() {
        let handle: ObserverHandle<i32> =
            ObserverHandle::new("t", false, Duration::from_millis(10), Duration::ZERO, Duration::ZERO);
        handle.begin(None).unwrap();
        handle.mark_timeout_pending(Error::Other("timeout".into()));
        handle.finalize_timeout();
        assert!(handle.is_done());
        assert!(handle.result().is_err());
    }
}
