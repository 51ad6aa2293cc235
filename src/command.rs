//! Commands: send a line, parse everything up to a prompt, resolve with a
//! typed result or a taxonomy-correct error.
//!
//! Echo-window detection, a line accumulator, regex-based end-of-output
//! detection, optional Ctrl-C-prefix tolerance on the candidate prompt
//! line, and a `wait_for_prompt_on_failure` toggle that lets a
//! parser-detected failure wait for the prompt to actually arrive before
//! the command is declared done.
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::trace;

use crate::connection::DispatchingConnection;
use crate::error::{Error, Result};
use crate::observer::ObserverHandle;
use crate::regex_helper::RegexHelper;
use crate::runner::{Observer, Runner};
use crate::textual::LineAccumulator;

/// Default command timeout — generous, since commands normally complete
/// in well under a second.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Abort byte sent when a command with `break_on_timeout` times out.
pub const CTRL_C: &str = "\u{3}";
/// Width, in characters, of the echo-matching window taken from each end
/// of the command string.
const ECHO_WINDOW: usize = 20;

/// Per-parser result type plus the hooks that drive output accumulation.
pub trait ReplyParser: Send + 'static {
    type Output: Default + Clone + Send + 'static;

    /// Called once per *full* line of command output (one that ended with
    /// a newline in the source bytes), after the command's own echo has
    /// been consumed — including the final prompt line itself, so
    /// implementations that don't want the prompt text in their
    /// accumulated result should check it against `prompt()` and skip it.
    /// Never called for the trailing partial fragment of a chunk (the one
    /// still awaiting its newline): that fragment is only ever matched
    /// against `prompt()`, so a line split across chunk boundaries is
    /// accumulated exactly once, as a full line, when it completes.
    /// Returning `Err` records a failure; whether that failure completes
    /// the command immediately or waits for the prompt is controlled by
    /// `CommandSettings::wait_for_prompt_on_failure`.
    fn on_new_line(&mut self, line: &str, current: &mut Self::Output) -> Result<()>;

    /// Regex matched against each candidate end-of-output line.
    fn prompt(&self) -> &Regex;

    /// Optional early-abort check, run before `on_new_line` on every full
    /// line: a parser that recognises a fatal condition (e.g.
    /// "Segmentation fault") can fail the command immediately instead of
    /// waiting for a prompt that may never come. Default: never fires.
    fn on_fatal_line(&mut self, _line: &str) -> Option<Error> {
        None
    }
}

/// Construction-time tuning, mirroring `CommandTextualGeneric`'s class
/// attributes turned into per-instance settings.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub timeout: Duration,
    pub terminating_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Whether a command observer should be required to produce a
    /// non-default result before the prompt is allowed to finish it.
    pub ret_required: bool,
    /// Send a Ctrl-C abort byte when the lifetime timer elapses.
    pub break_on_timeout: bool,
    /// Keep accumulating output after a parser failure until the prompt
    /// line actually arrives, instead of finishing the instant the
    /// failure is detected.
    pub wait_for_prompt_on_failure: bool,
    /// Strip a leading literal `^C` from a candidate prompt line before
    /// matching (terminals commonly echo an interrupt this way).
    pub strip_ctrlc_prefix: bool,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            terminating_timeout: Duration::from_millis(500),
            inactivity_timeout: Duration::ZERO,
            ret_required: true,
            break_on_timeout: true,
            wait_for_prompt_on_failure: true,
            strip_ctrlc_prefix: true,
        }
    }
}

struct ParseState<P: ReplyParser> {
    line_acc: LineAccumulator,
    seen_echo: bool,
    current: P::Output,
    regex_helper: RegexHelper,
    pending_failure: Option<Error>,
    /// Set once `on_new_line` has run at least once without erroring.
    /// Backs `ret_required`: a prompt arriving before any output line was
    /// ever parsed doesn't complete the command.
    produced_output: bool,
}

/// A command observer: sends `command_string`, parses replies with `P`
/// until its prompt regex matches, then resolves with `P::Output`.
///
/// Always used behind `Arc` so it can both implement the object-safe
/// [`Observer`] trait (for the runner) and be held by callers wanting the
/// typed `call`/`await_done` API.
pub struct Command<P: ReplyParser> {
    handle: ObserverHandle<P::Output>,
    connection: DispatchingConnection,
    runner: Arc<dyn Runner>,
    command_string: String,
    echo_regex: OnceLock<Regex>,
    settings: CommandSettings,
    state: Mutex<ParseState<P>>,
    parser: Mutex<P>,
}

impl<P: ReplyParser> Command<P> {
    pub fn new(
        connection: DispatchingConnection,
        runner: Arc<dyn Runner>,
        command_string: impl Into<String>,
        parser: P,
        settings: CommandSettings,
    ) -> Arc<Self> {
        let command_string = command_string.into();
        let name = format!("command({command_string})");
        Arc::new(Self {
            handle: ObserverHandle::new(
                name,
                true,
                settings.timeout,
                settings.terminating_timeout,
                settings.inactivity_timeout,
            ),
            connection,
            runner,
            command_string,
            echo_regex: OnceLock::new(),
            settings,
            state: Mutex::new(ParseState {
                line_acc: LineAccumulator::new(),
                seen_echo: false,
                current: P::Output::default(),
                regex_helper: RegexHelper::new(),
                pending_failure: None,
                produced_output: false,
            }),
            parser: Mutex::new(parser),
        })
    }

    fn echo_regex(&self) -> &Regex {
        self.echo_regex.get_or_init(|| build_echo_regex(&self.command_string, ECHO_WINDOW))
    }

    /// Begin the lifetime clock and submit to the runner: sends
    /// `command_string` and starts parsing replies.
    pub fn start(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        self.handle.begin(timeout)?;
        let observer: Arc<dyn Observer> = self.clone();
        let runner = self.runner.clone();
        let this = self.clone();
        // submit() itself awaits the command's send_line; run it on its
        // own task so start() can return synchronously to the caller.
        tokio::spawn(async move {
            if let Err(e) = runner.submit(observer).await {
                trace!(observer = %this.handle.name(), error = %e, "command submit failed");
                let _ = this.handle.set_exception(e);
            }
        });
        Ok(())
    }

    /// `start` then `await_done(None)` — the common case.
    pub async fn call(self: &Arc<Self>) -> Result<P::Output> {
        self.start(None)?;
        self.await_done(None).await
    }

    pub async fn await_done(&self, timeout: Option<Duration>) -> Result<P::Output> {
        self.handle.await_done(timeout).await
    }

    pub fn result(&self) -> Result<P::Output> {
        self.handle.result()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn command_str(&self) -> &str {
        &self.command_string
    }

    fn process_line(&self, state: &mut ParseState<P>, parser: &mut P, text: &str, is_full_line: bool) {
        if self.handle.is_done() {
            return;
        }

        if !state.seen_echo {
            if state.regex_helper.matches(self.echo_regex(), text) {
                state.seen_echo = true;
            }
            // The line carrying (or preceding) the echo is consumed here
            // and never forwarded to the parser — it's the terminal
            // echoing the command back, not command output.
            return;
        }

        // A line still waiting on its trailing newline is re-offered to
        // this function, whole, on every subsequent chunk until it
        // completes — so `on_new_line`/`on_fatal_line` only ever see it
        // once, as a full line. The partial fragment is still checked
        // against the prompt regex, since a prompt commonly arrives with
        // no trailing newline at all.
        if is_full_line {
            if let Some(fatal) = parser.on_fatal_line(text) {
                let _ = self.handle.set_exception(fatal);
                return;
            }

            match parser.on_new_line(text, &mut state.current) {
                Ok(()) => state.produced_output = true,
                Err(e) => {
                    if self.settings.wait_for_prompt_on_failure {
                        state.pending_failure.get_or_insert(e);
                    } else {
                        let _ = self.handle.set_exception(e);
                        return;
                    }
                }
            }
        }

        let candidate = if self.settings.strip_ctrlc_prefix && text.starts_with(CTRL_C) {
            &text[CTRL_C.len()..]
        } else {
            text
        };

        if state.regex_helper.matches(parser.prompt(), candidate) {
            if let Some(failure) = state.pending_failure.take() {
                let _ = self.handle.set_exception(failure);
                return;
            }
            if self.settings.ret_required && !state.produced_output {
                return;
            }
            let _ = self.handle.set_result(state.current.clone());
        }
    }
}

impl<P: ReplyParser> Observer for Command<P> {
    fn connection(&self) -> DispatchingConnection {
        self.connection.clone()
    }

    fn feed(&self, data: &str, recv_time: Instant) {
        self.handle.touch_last_feed_time();
        let mut state = self.state.lock().unwrap();
        let mut parser = self.parser.lock().unwrap();

        let lines = state.line_acc.feed(data);
        for line in lines {
            self.process_line(&mut state, &mut parser, &line.text, true);
            if self.handle.is_done() {
                return;
            }
        }
        if let Some(partial) = state.line_acc.pending_partial() {
            self.process_line(&mut state, &mut parser, &partial.text, false);
        }
        let _ = recv_time;
    }

    fn on_timeout(&self) {
        if self.settings.break_on_timeout {
            let conn = self.connection.clone();
            tokio::spawn(async move {
                let _ = conn.send(CTRL_C, false).await;
            });
        }
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

    fn is_command(&self) -> bool {
        true
    }

    fn command_string(&self) -> Option<String> {
        Some(self.command_string.clone())
    }

    fn debug_name(&self) -> String {
        self.handle.name().to_string()
    }
}

/// Builds a regex matching either the first or the last `window` characters
/// of `command_string`, so echo detection tolerates a terminal wrapping or
/// truncating long command lines.
fn build_echo_regex(command_string: &str, window: usize) -> Regex {
    let chars: Vec<char> = command_string.chars().collect();
    let head: String = chars.iter().take(window).collect();
    let tail: String = chars
        .iter()
        .skip(chars.len().saturating_sub(window))
        .collect();
    let pattern = format!(
        "{}|{}",
        regex::escape(&head),
        regex::escape(&tail)
    );
    Regex::new(&pattern).expect("escaped literal alternation is always a valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::config::RunnerSettings;
    use crate::runner::TaskPerObserverRunner;
    use crate::transport::LoopbackTransport;

    #[derive(Default, Clone)]
    struct Lines(Vec<String>);

    struct LinesParser {
        prompt: Regex,
    }

    impl ReplyParser for LinesParser {
        type Output = Lines;

        fn on_new_line(&mut self, line: &str, current: &mut Self::Output) -> Result<()> {
            if !self.prompt.is_match(line) {
                current.0.push(line.to_string());
            }
            Ok(())
        }

        fn prompt(&self) -> &Regex {
            &self.prompt
        }
    }

    fn conn() -> DispatchingConnection {
        DispatchingConnection::new(
            Arc::new(LoopbackTransport::new()),
            ConnectionSettings::named("test"),
        )
    }

    #[tokio::test]
    async fn echo_then_lines_then_prompt_resolves() {
        let conn = conn();
        let runner: Arc<dyn Runner> = Arc::new(TaskPerObserverRunner::new(RunnerSettings::default()));
        let parser = LinesParser {
            prompt: Regex::new(r"^host:~ #\s*$").unwrap(),
        };
        let cmd = Command::new(conn.clone(), runner, "ls -l", parser, CommandSettings::default());
        cmd.start(None).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.data_received(b"ls -l\ntotal 0\nhost:~ # \n", Instant::now());
        let result = cmd.await_done(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(result.0, vec!["total 0".to_string()]);
    }

    #[tokio::test]
    async fn line_split_across_chunks_is_accumulated_once() {
        let conn = conn();
        let runner: Arc<dyn Runner> = Arc::new(TaskPerObserverRunner::new(RunnerSettings::default()));
        let parser = LinesParser {
            prompt: Regex::new(r"^host:~ #\s*$").unwrap(),
        };
        let cmd = Command::new(conn.clone(), runner, "ls -l", parser, CommandSettings::default());
        cmd.start(None).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.data_received(b"ls -l\ntotal 0", Instant::now());
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.data_received(b" more\nhost:~ # \n", Instant::now());

        let result = cmd.await_done(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(result.0, vec!["total 0 more".to_string()]);
    }

    #[test]
    fn echo_regex_matches_head_or_tail_window() {
        let re = build_echo_regex("a very long command with lots of arguments here", 10);
        assert!(re.is_match("a very lon"));
        assert!(re.is_match("ments here"));
        assert!(!re.is_match("totally unrelated"));
    }
}
