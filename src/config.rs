//! Explicit configuration context.
//!
//! Rather than process-wide singletons for logging levels and the default
//! runner/connection factories, this crate threads small settings structs
//! through constructors, with `Default` impls for ergonomics so callers who
//! don't care can still write `RunnerSettings::default()`.
use std::time::Duration;

/// Tuning knobs for a [`crate::runner::Runner`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Resolution at which a runner re-checks timeout/inactivity/cancellation.
    ///
    /// A 1-10ms range keeps CPU usage low without making timeouts feel
    /// sluggish in tests; 5ms is a reasonable default midpoint.
    pub tick: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
        }
    }
}

/// Construction-time settings for a [`crate::connection::DispatchingConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Human-readable name; surfaces in the `moler.connection.<name>` logger.
    pub name: String,
    /// Newline sequence appended by `send_line`.
    pub newline: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            name: "unnamed".to_string(),
            newline: "\n".to_string(),
        }
    }
}

impl ConnectionSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
