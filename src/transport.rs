//! Pluggable outgoing-I/O primitive.
//!
//! Concrete transports (TCP, serial, SSH, PTY — all out of scope here)
//! implement this trait and are handed to a
//! [`crate::connection::DispatchingConnection`] at construction time. The
//! connection owns the *receive* path (`data_received` is called by
//! whatever drives the transport's read loop); `Transport` only owns *send*.
//!
//! `send` is expressed as a boxed future rather than `async fn` so the trait
//! stays object-safe — the connection holds `Arc<dyn Transport>` as a
//! pluggable backend.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Transport: Send + Sync {
    /// Write `data` to the underlying system. Must not silently truncate.
    fn send<'a>(&'a self, data: Bytes) -> BoxFuture<'a, Result<()>>;

    /// Best-effort liveness check; default `true` (most transports don't
    /// track this explicitly and rely on I/O errors instead).
    fn is_open(&self) -> bool {
        true
    }
}

/// In-memory transport fixture for tests and demos: `send` appends to an
/// internal buffer instead of touching a real device, letting tests assert
/// on exactly what a command/event would have written.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    sent: Arc<Mutex<Vec<Bytes>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_text(&self) -> String {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn send<'a>(&'a self, data: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(data);
            Ok(())
        })
    }
}

/// Wraps any `async fn(Bytes) -> Result<()>`-shaped closure as a `Transport`,
/// for adapters that don't warrant a dedicated struct.
pub struct FnTransport<F> {
    send_fn: F,
}

impl<F> FnTransport<F>
where
    F: for<'a> Fn(&'a Bytes) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    pub fn new(send_fn: F) -> Self {
        Self { send_fn }
    }
}

impl<F> Transport for FnTransport<F>
where
    F: for<'a> Fn(&'a Bytes) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    fn send<'a>(&'a self, data: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { (self.send_fn)(&data).await })
    }
}
