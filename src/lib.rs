//! Moler-rs: a toolkit for supervisory programs that drive external systems
//! through text-oriented I/O streams.
//!
//! The core abstraction is the connection-observer: a
//! [`connection::DispatchingConnection`] multiplexes one incoming byte
//! stream to many concurrently active, independently timed observers.
//! [`command::Command`] is the active flavor (send a line, parse the reply,
//! resolve once); [`event::Event`] is the passive, multi-shot flavor. A
//! [`runner::Runner`] owns the background execution — ticking timeouts,
//! delivering data, driving cancellation — behind a shared trait so callers
//! can choose a task-per-observer or a shared-worker-per-connection
//! strategy without the rest of the API changing.
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod factory;
pub mod logging;
pub mod observer;
pub mod regex_helper;
pub mod runner;
pub mod textual;
pub mod transport;

pub use command::{Command, CommandSettings, ReplyParser};
pub use config::{ConnectionSettings, RunnerSettings};
pub use connection::{DispatchingConnection, SubscriberKey, SubscriptionHandle};
pub use error::{Error, Result};
pub use event::{Event, EventMatcher, EventSettings};
pub use observer::ObserverHandle;
pub use runner::{Observer, Runner};
pub use transport::{LoopbackTransport, Transport};
