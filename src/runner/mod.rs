//! Runner contract.
//!
//! `Observer` is the object-safe capability a runner drives — implemented
//! by [`crate::command::Command`] and [`crate::event::Event`] themselves,
//! never by `ObserverHandle<T>` directly (the handle is generic over a
//! result type and so can't be boxed as `dyn`; the concrete wrapper types
//! supply the type-specific `feed`/`on_timeout` behaviour and forward
//! lifecycle bookkeeping to their embedded handle). Two runner flavours
//! share the same tick algorithm (`tick_once`) and the same `RunnerHandle`
//! shape, differing only in whether each observer gets its own
//! `tokio::task` or shares one per connection.
mod per_connection;
mod per_observer;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connection::DispatchingConnection;
use crate::error::{Error, Result};
use crate::observer::LifeStatus;

pub use per_connection::SharedWorkerRunner;
pub use per_observer::TaskPerObserverRunner;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe view of a connection observer, used by the runner so it can
/// drive heterogeneous `Command<P>`/`Event<M>` instances without knowing
/// their parser/matcher type parameters.
pub trait Observer: Send + Sync {
    fn connection(&self) -> DispatchingConnection;

    /// Deliver one decoded chunk. Called from the connection's dedicated
    /// per-subscriber consumer task, so implementations may do real parsing
    /// work without worrying about blocking other observers.
    fn feed(&self, data: &str, recv_time: Instant);

    /// Hook fired exactly once when the lifetime timer elapses, before the
    /// terminating grace window (if any) begins. Commands that break on
    /// timeout send their abort byte here.
    fn on_timeout(&self) {}

    /// Hook fired when the inactivity gap elapses with no new data.
    fn on_inactivity(&self) {}

    /// Hook fired once by the connection on `shutdown`.
    fn connection_closed(&self);

    fn is_done(&self) -> bool;

    /// Returns `false` if already done, `true` if this call transitioned
    /// the observer to cancelled.
    fn cancel(&self) -> bool;

    fn life(&self) -> LifeStatus;

    fn mark_timeout_pending(&self, err: Error) -> bool;
    fn enter_terminating(&self) {}
    fn finalize_timeout(&self);
    fn touch_last_feed_time(&self);

    fn is_command(&self) -> bool {
        false
    }

    fn command_string(&self) -> Option<String> {
        None
    }

    fn debug_name(&self) -> String;
}

/// Outcome of one `tick_once` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Done,
}

/// The per-tick state machine shared by both runner flavours: check the
/// lifetime clock, fire timeout/inactivity hooks, and
/// advance the terminating-window bookkeeping. Pure function of an
/// `Observer`'s current snapshot plus `Instant::now()` — no I/O.
pub(crate) fn tick_once(observer: &Arc<dyn Observer>) -> TickOutcome {
    if observer.is_done() {
        return TickOutcome::Done;
    }
    let life = observer.life();
    let Some(start) = life.start_time else {
        return TickOutcome::Continue;
    };
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(start);
    let effective_timeout = if life.in_terminating {
        life.terminating_timeout
    } else {
        life.timeout
    };

    if elapsed >= effective_timeout {
        if life.in_terminating {
            observer.finalize_timeout();
            return TickOutcome::Done;
        }
        if observer.mark_timeout_pending(synth_timeout(observer, &life, elapsed)) {
            observer.on_timeout();
        }
        observer.enter_terminating();
        if life.terminating_timeout.is_zero() {
            observer.finalize_timeout();
            return TickOutcome::Done;
        }
        return TickOutcome::Continue;
    }

    if life.inactivity_timeout > Duration::ZERO {
        if let Some(last) = life.last_feed_time {
            if now.saturating_duration_since(last) > life.inactivity_timeout {
                observer.on_inactivity();
                observer.touch_last_feed_time();
            }
        }
    }
    TickOutcome::Continue
}

fn synth_timeout(observer: &Arc<dyn Observer>, life: &LifeStatus, elapsed: Duration) -> Error {
    if observer.is_command() {
        Error::CommandTimeout {
            command: observer.command_string().unwrap_or_else(|| observer.debug_name()),
            timeout: life.timeout,
            passed: elapsed,
        }
    } else {
        Error::ConnectionObserverTimeout {
            observer: observer.debug_name(),
            timeout: life.timeout,
            passed: elapsed,
        }
    }
}

/// Cooperative handle to a running observer's background driver, returned
/// by `Runner::submit`: a stop signal plus a bounded wait for the driver
/// to actually notice it.
pub struct RunnerHandle {
    pub(crate) stop: Arc<Notify>,
    pub(crate) stop_flag: Arc<AtomicBool>,
    pub(crate) done_flag: Arc<AtomicBool>,
    pub(crate) done_notify: Arc<Notify>,
}

impl RunnerHandle {
    pub fn is_done(&self) -> bool {
        self.done_flag.load(Ordering::Acquire)
    }

    /// Request cancellation. With `no_wait`, returns immediately after
    /// signalling. Otherwise waits up to a fixed grace period for the
    /// driver to observe the stop signal and finish, surfacing an error if
    /// it doesn't (a stuck driver is a bug worth surfacing, not silencing).
    pub async fn cancel(&self, no_wait: bool) -> Result<()> {
        self.stop_flag.store(true, Ordering::Release);
        self.stop.notify_waiters();
        if no_wait || self.is_done() {
            return Ok(());
        }
        const GRACE: Duration = Duration::from_millis(500);
        tokio::select! {
            _ = self.done_notify.notified() => Ok(()),
            _ = tokio::time::sleep(GRACE) => Err(Error::Other(format!(
                "runner handle failed to stop within {GRACE:?}"
            ))),
        }
    }
}

/// Background execution strategy for connection observers: owns the
/// decision of *how* an observer's lifetime clock gets ticked and its
/// incoming data gets routed to `feed`.
pub trait Runner: Send + Sync {
    /// Subscribe the observer to its connection, send its command string
    /// (if it has one), and start driving its lifetime clock.
    ///
    /// Precondition: `observer.life().start_time` must already be set,
    /// i.e. the caller already called the observer's own `start()`/`begin`
    /// before submitting it.
    fn submit<'a>(&'a self, observer: Arc<dyn Observer>) -> BoxFuture<'a, Result<RunnerHandle>>;

    /// Cancel every in-flight observer this runner is driving and release
    /// its background resources. Safe to call more than once.
    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()>;
}
