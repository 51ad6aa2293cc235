//! End-to-end scenarios and cross-cutting invariants exercised against the
//! public API: echo-then-prompt commands, command failure, timeout with a
//! Ctrl-C break, multi-occurrence events, and multi-subscriber fan-out.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use moler_rs::command::{Command, CommandSettings, ReplyParser, CTRL_C};
use moler_rs::config::{ConnectionSettings, RunnerSettings};
use moler_rs::connection::DispatchingConnection;
use moler_rs::error::Error;
use moler_rs::event::{Event, EventMatcher, EventSettings};
use moler_rs::runner::{Runner, TaskPerObserverRunner};
use moler_rs::transport::LoopbackTransport;

fn new_connection(transport: Arc<LoopbackTransport>) -> DispatchingConnection {
    DispatchingConnection::new(transport, ConnectionSettings::named("session"))
}

fn new_runner() -> Arc<dyn Runner> {
    Arc::new(TaskPerObserverRunner::new(RunnerSettings {
        tick: Duration::from_millis(5),
    }))
}

#[derive(Default, Clone)]
struct Lines(Vec<String>);

struct ShellParser {
    prompt: Regex,
    fail_pattern: Regex,
}

impl ShellParser {
    fn new() -> Self {
        Self {
            prompt: Regex::new(r"^host:~ # $").unwrap(),
            fail_pattern: Regex::new(r"command not found").unwrap(),
        }
    }
}

impl ReplyParser for ShellParser {
    type Output = Lines;

    fn on_new_line(&mut self, line: &str, current: &mut Self::Output) -> moler_rs::error::Result<()> {
        if self.prompt.is_match(line) {
            return Ok(());
        }
        if self.fail_pattern.is_match(line) {
            return Err(Error::CommandFailure {
                command: "shell".into(),
                message: line.to_string(),
            });
        }
        current.0.push(line.to_string());
        Ok(())
    }

    fn prompt(&self) -> &Regex {
        &self.prompt
    }
}

#[tokio::test]
async fn scenario_1_echo_then_prompt_command() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let runner = new_runner();
    let cmd = Command::new(conn.clone(), runner, "ls", ShellParser::new(), CommandSettings::default());
    cmd.start(None).unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    conn.data_received(b"ls\nfile1 file2\nhost:~ # ", Instant::now());

    let result = cmd.await_done(Some(Duration::from_secs(1))).await.unwrap();
    assert!(result.0.contains(&"file1 file2".to_string()));
}

#[tokio::test]
async fn scenario_2_command_failure() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let runner = new_runner();
    let cmd = Command::new(conn.clone(), runner, "foo", ShellParser::new(), CommandSettings::default());
    cmd.start(None).unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    conn.data_received(b"foo\nbash: foo: command not found\nhost:~ # ", Instant::now());

    let err = cmd.await_done(Some(Duration::from_secs(1))).await.unwrap_err();
    match err {
        Error::CommandFailure { message, .. } => assert!(message.contains("command not found")),
        other => panic!("expected CommandFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_3_timeout_with_ctrlc_break_then_late_success() {
    let transport = Arc::new(LoopbackTransport::new());
    let conn = new_connection(transport.clone());
    let runner = new_runner();
    let settings = CommandSettings {
        timeout: Duration::from_millis(80),
        terminating_timeout: Duration::from_millis(150),
        break_on_timeout: true,
        ..CommandSettings::default()
    };
    let cmd = Command::new(conn.clone(), runner, "sleep 10", ShellParser::new(), settings);
    cmd.start(None).unwrap();

    // Nothing injected for longer than `timeout`: the Ctrl-C byte must go out.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(transport.sent_text().contains(CTRL_C));

    // A late prompt within the terminating window still succeeds.
    conn.data_received(b"sleep 10\nhost:~ # ", Instant::now());
    let result = cmd.await_done(Some(Duration::from_secs(1))).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn scenario_3b_timeout_with_no_late_prompt_fails() {
    let transport = Arc::new(LoopbackTransport::new());
    let conn = new_connection(transport.clone());
    let runner = new_runner();
    let settings = CommandSettings {
        timeout: Duration::from_millis(40),
        terminating_timeout: Duration::from_millis(40),
        break_on_timeout: true,
        ..CommandSettings::default()
    };
    let cmd = Command::new(conn, runner, "sleep 10", ShellParser::new(), settings);
    cmd.start(None).unwrap();

    let err = cmd.await_done(Some(Duration::from_secs(1))).await.unwrap_err();
    assert!(matches!(err, Error::CommandTimeout { .. }));
}

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
async fn scenario_4_event_multi_match() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let runner = new_runner();
    let event = Event::new(
        conn.clone(),
        "net-down",
        SubstringMatcher { needle: "Network is unreachable" },
        EventSettings { timeout: Duration::from_secs(5), till_occurs_times: 3 },
    );
    let call_count = Arc::new(AtomicUsize::new(0));
    {
        let call_count = call_count.clone();
        event.add_occurred_callback(move |_| {
            call_count.fetch_add(1, Ordering::SeqCst);
        });
    }
    event.start(&runner).unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    conn.data_received(b"ping: reply from 10.0.0.1\n", Instant::now());
    conn.data_received(b"ping: sendmsg: Network is unreachable\n", Instant::now());
    conn.data_received(b"ping: sendmsg: Network is unreachable\n", Instant::now());
    conn.data_received(b"ping: reply from 10.0.0.1\n", Instant::now());
    conn.data_received(b"ping: sendmsg: Network is unreachable\n", Instant::now());

    let occurrences = event.await_done(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(occurrences.len(), 3);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn scenario_5_multi_subscriber_fan_out() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));

    let received_a = Arc::new(Mutex::new(Vec::new()));
    let received_b = Arc::new(Mutex::new(Vec::new()));
    {
        let received_a = received_a.clone();
        conn.subscribe_fn(move |data, _t| received_a.lock().unwrap().push(data), || {});
    }
    {
        let received_b = received_b.clone();
        conn.subscribe_fn(move |data, _t| received_b.lock().unwrap().push(data), || {});
    }

    conn.data_received(b"ABC", Instant::now());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*received_a.lock().unwrap(), vec!["ABC".to_string()]);
    assert_eq!(*received_b.lock().unwrap(), vec!["ABC".to_string()]);
}

#[tokio::test]
async fn scenario_6_unsubscribe_during_delivery() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let received = Arc::new(Mutex::new(Vec::new()));

    let handle_slot: Arc<Mutex<Option<moler_rs::connection::SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    {
        let received = received.clone();
        let conn_for_unsub = conn.clone();
        let handle_slot = handle_slot.clone();
        let handle = conn.subscribe_fn(
            move |data, _t| {
                received.lock().unwrap().push(data.clone());
                if data == "STOP" {
                    if let Some(h) = *handle_slot.lock().unwrap() {
                        conn_for_unsub.unsubscribe(h);
                    }
                }
            },
            || {},
        );
        *handle_slot.lock().unwrap() = Some(handle);
    }

    // A second, unrelated subscriber to confirm the connection stays
    // operative for others after the first unsubscribes itself.
    let other_received = Arc::new(Mutex::new(Vec::new()));
    {
        let other_received = other_received.clone();
        conn.subscribe_fn(move |data, _t| other_received.lock().unwrap().push(data), || {});
    }

    conn.data_received(b"STOP", Instant::now());
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.data_received(b"MORE", Instant::now());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*received.lock().unwrap(), vec!["STOP".to_string()]);
    assert_eq!(
        *other_received.lock().unwrap(),
        vec!["STOP".to_string(), "MORE".to_string()]
    );
}

#[tokio::test]
async fn invariant_cancel_on_done_observer_is_noop() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let runner = new_runner();
    let cmd = Command::new(conn.clone(), runner, "ls", ShellParser::new(), CommandSettings::default());
    cmd.start(None).unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    conn.data_received(b"ls\nhost:~ # ", Instant::now());
    cmd.await_done(Some(Duration::from_secs(1))).await.unwrap();

    assert!(!cmd.cancel());
}

#[tokio::test]
async fn invariant_send_and_receive_on_closed_connection_are_noop() {
    let conn = new_connection(Arc::new(LoopbackTransport::new()));
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        conn.subscribe_fn(move |_d, _t| { received.fetch_add(1, Ordering::SeqCst); }, || {});
    }
    conn.shutdown();

    assert!(conn.send("x", false).await.is_ok());
    conn.data_received(b"after-shutdown", Instant::now());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);

    // idempotent shutdown
    conn.shutdown();
}
