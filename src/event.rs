//! Events: a passive, multi-shot detector over incoming
//! lines. Unlike a command, an event never sends anything and never
//! "finishes" on its own unless `till_occurs_times` is reached; otherwise
//! it simply accumulates occurrences until cancelled or its (typically very
//! long) timeout elapses.
//!
//! `pause`/`resume` toggle whether incoming lines are matched at all, and
//! an optional occurred-callback fires synchronously for every match in
//! addition to the accumulated result.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::DispatchingConnection;
use crate::error::{Error, Result};
use crate::observer::ObserverHandle;
use crate::runner::{Observer, Runner};
use crate::textual::LineAccumulator;

/// Events have no natural deadline; this stands in for "effectively
/// forever" without special-casing an unbounded wait.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

/// Matches incoming lines against whatever the event is looking for.
pub trait EventMatcher: Send + 'static {
    type Occurrence: Clone + Send + 'static;

    /// Inspect one line, returning `Some` for each distinct occurrence it
    /// represents (usually zero or one; a matcher emitting more than one
    /// per line is free to do so, e.g. multiple hits in one burst of text).
    fn on_line(&mut self, line: &str) -> Option<Self::Occurrence>;
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub timeout: Duration,
    /// How many occurrences to collect before the event resolves.
    /// `0` means unbounded: the event never self-resolves and must be
    /// explicitly cancelled or read via `occurrences()`/`last_occurrence()`.
    pub till_occurs_times: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EVENT_TIMEOUT,
            till_occurs_times: 0,
        }
    }
}

type OccurredCallback<O> = Arc<dyn Fn(&O) + Send + Sync>;

struct EventState<O> {
    line_acc: LineAccumulator,
    occurrences: Vec<O>,
    callback: Option<OccurredCallback<O>>,
}

/// A passive, multi-shot observer: matches every line against `M` and
/// accumulates occurrences, optionally resolving once `till_occurs_times`
/// is reached.
pub struct Event<M: EventMatcher> {
    handle: ObserverHandle<Vec<M::Occurrence>>,
    connection: DispatchingConnection,
    settings: EventSettings,
    paused: AtomicBool,
    matcher: Mutex<M>,
    state: Mutex<EventState<M::Occurrence>>,
}

impl<M: EventMatcher> Event<M> {
    pub fn new(connection: DispatchingConnection, name: impl Into<String>, matcher: M, settings: EventSettings) -> Arc<Self> {
        Arc::new(Self {
            handle: ObserverHandle::new(name, false, settings.timeout, Duration::ZERO, Duration::ZERO),
            connection,
            settings,
            paused: AtomicBool::new(false),
            matcher: Mutex::new(matcher),
            state: Mutex::new(EventState {
                line_acc: LineAccumulator::new(),
                occurrences: Vec::new(),
                callback: None,
            }),
        })
    }

    pub fn start(self: &Arc<Self>, runner: &Arc<dyn Runner>) -> Result<()> {
        self.handle.begin(None)?;
        let observer: Arc<dyn Observer> = self.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let _ = runner.submit(observer).await;
        });
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn add_occurred_callback(&self, callback: impl Fn(&M::Occurrence) + Send + Sync + 'static) {
        self.state.lock().unwrap().callback = Some(Arc::new(callback));
    }

    pub fn occurrences(&self) -> Vec<M::Occurrence> {
        self.state.lock().unwrap().occurrences.clone()
    }

    pub fn last_occurrence(&self) -> Option<M::Occurrence> {
        self.state.lock().unwrap().occurrences.last().cloned()
    }

    pub async fn await_done(&self, timeout: Option<Duration>) -> Result<Vec<M::Occurrence>> {
        self.handle.await_done(timeout).await
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    fn record(&self, occurrence: M::Occurrence) {
        if self.handle.is_done() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.occurrences.push(occurrence.clone());
        if let Some(cb) = state.callback.clone() {
            cb(&occurrence);
        }
        let reached_target =
            self.settings.till_occurs_times > 0 && state.occurrences.len() as u64 >= self.settings.till_occurs_times;
        if reached_target {
            let result = state.occurrences.clone();
            drop(state);
            let _ = self.handle.set_result(result);
        }
    }
}

impl<M: EventMatcher> Observer for Event<M> {
    fn connection(&self) -> DispatchingConnection {
        self.connection.clone()
    }

    fn feed(&self, data: &str, recv_time: Instant) {
        self.handle.touch_last_feed_time();
        if self.is_paused() {
            // Still advance the line accumulator so resuming mid-stream
            // doesn't replay or drop a partially-buffered line, but don't
            // run matching while paused.
            self.state.lock().unwrap().line_acc.feed(data);
            return;
        }
        let lines = {
            let mut state = self.state.lock().unwrap();
            state.line_acc.feed(data)
        };
        let mut matcher = self.matcher.lock().unwrap();
        for line in lines {
            if let Some(occurrence) = matcher.on_line(&line.text) {
                drop(matcher);
                self.record(occurrence);
                if self.handle.is_done() {
                    return;
                }
                matcher = self.matcher.lock().unwrap();
            }
        }
        let _ = recv_time;
    }

    fn connection_closed(&self) {
        let _ = self
            .handle
            .set_exception(Error::ConnectionClosed(self.connection.name().to_string()));
    }

    fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    fn life(&self) -> crate::observer::LifeStatus {
        self.handle.life_snapshot()
    }

    fn mark_timeout_pending(&self, err: Error) -> bool {
        self.handle.mark_timeout_pending(err)
    }

    fn finalize_timeout(&self) {
        self.handle.finalize_timeout();
    }

    fn touch_last_feed_time(&self) {
        self.handle.touch_last_feed_time();
    }

    fn debug_name(&self) -> String {
        self.handle.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, RunnerSettings};
    use crate::runner::TaskPerObserverRunner;
    use crate::transport::LoopbackTransport;

    struct SubstringMatcher {
        needle: &'static str,
    }

    impl EventMatcher for SubstringMatcher {
        type Occurrence = String;

        fn on_line(&mut self, line: &str) -> Option<Self::Occurrence> {
            line.contains(self.needle).then(|| line.to_string())
        }
    }

    #[tokio::test]
    async fn resolves_after_till_occurs_times_matches() {
        let conn = DispatchingConnection::new(
            Arc::new(LoopbackTransport::new()),
            ConnectionSettings::named("test"),
        );
        let runner: Arc<dyn Runner> = Arc::new(TaskPerObserverRunner::new(RunnerSettings::default()));
        let event = Event::new(
            conn.clone(),
            "network-down",
            SubstringMatcher { needle: "unreachable" },
            EventSettings { timeout: Duration::from_secs(5), till_occurs_times: 2 },
        );
        event.start(&runner).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.data_received(b"ping: reply from 10.0.0.1\n", Instant::now());
        conn.data_received(b"connect: Network is unreachable\n", Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(event.occurrences().len(), 1);

        conn.data_received(b"connect: Network is unreachable\n", Instant::now());
        let result = event.await_done(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn paused_event_does_not_match() {
        let conn = DispatchingConnection::new(
            Arc::new(LoopbackTransport::new()),
            ConnectionSettings::named("test"),
        );
        let runner: Arc<dyn Runner> = Arc::new(TaskPerObserverRunner::new(RunnerSettings::default()));
        let event = Event::new(
            conn.clone(),
            "network-down",
            SubstringMatcher { needle: "unreachable" },
            EventSettings { timeout: Duration::from_secs(5), till_occurs_times: 0 },
        );
        event.start(&runner).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        event.pause();
        conn.data_received(b"connect: Network is unreachable\n", Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(event.occurrences().is_empty());

        event.resume();
        conn.data_received(b"connect: Network is unreachable\n", Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(event.occurrences().len(), 1);
    }
}
