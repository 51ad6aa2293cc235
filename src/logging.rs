//! Structured logging setup.
//!
//! The core emits `tracing` events carrying a `transfer_direction` field
//! (`>` sent, `<` received, ` ` general) and uses a per-connection span
//! named `moler.connection.<name>`. There is no built-in `tracing` level
//! below TRACE for raw, undecoded byte dumps, so those are logged at TRACE
//! on the distinct target [`RAW_DATA_TARGET`], letting `EnvFilter`
//! silence/enable them independently of parsed-string TRACE logging. A
//! column-aligned multi-line formatter for side-by-side sent/received
//! transcripts is intentionally not implemented here.
use tracing_subscriber::EnvFilter;

/// Target used for raw-byte trace events, filterable independently of
/// `moler::connection` TRACE events (e.g. `RUST_LOG=moler::raw_data=trace`).
pub const RAW_DATA_TARGET: &str = "moler::raw_data";

/// `>` sent, `<` received, ` ` general — carried as the `transfer_direction`
/// field on every connection-related `tracing` event.
pub mod direction {
    pub const SENT: &str = ">";
    pub const RECEIVED: &str = "<";
    pub const GENERAL: &str = " ";
}

/// Initialise a process-wide `tracing` subscriber.
///
/// `filter` follows `EnvFilter` syntax, e.g. `"moler=debug,moler::raw_data=trace"`.
pub fn init_tracing(filter: impl AsRef<str>) {
    let env_filter = EnvFilter::try_new(filter.as_ref())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// Logger-name convention for a named connection.
pub fn connection_logger_name(connection_name: &str) -> String {
    format!("moler.connection.{connection_name}")
}
