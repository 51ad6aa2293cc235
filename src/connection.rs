//! The dispatching connection.
//!
//! Multiplexes one byte stream to many concurrently active observers.
//! Each `subscribe` call gets its own unbounded `mpsc` channel plus a
//! dedicated `tokio::task` consumer loop, so `data_received` itself never
//! blocks on a slow or misbehaving observer — it only has to push a clone
//! of the decoded string into each subscriber's queue. This generalises an
//! `Arc`-shared, `Mutex`-guarded registry handed out to independently
//! spawned tasks.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::ConnectionSettings;
use crate::error::Result;
use crate::logging::{connection_logger_name, direction, RAW_DATA_TARGET};
use crate::transport::Transport;

/// Identifies one `subscribe` registration, used for deduplication and for
/// `unsubscribe`. Dedup-by-weakref-identity over an arbitrary bound
/// method has no Rust equivalent, so callers supply an explicit key
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey(u64);

/// Handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

type DataHandler = Arc<dyn Fn(String, Instant) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;
type Decoder = Arc<dyn Fn(&[u8]) -> Result<String> + Send + Sync>;
type Encoder = Arc<dyn Fn(&str) -> Bytes + Send + Sync>;

struct Subscription {
    subscription_id: u64,
    key: Option<SubscriberKey>,
    sender: mpsc::UnboundedSender<(String, Instant)>,
    close_handler: CloseHandler,
}

struct Shared {
    name: String,
    logger_name: String,
    transport: Arc<dyn Transport>,
    decoder: Decoder,
    encoder: Encoder,
    newline: Mutex<String>,
    open: AtomicBool,
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Cheap-clone handle to one connection's shared dispatch state.
///
/// An `Arc`-wrapped shared struct cloned into every task that needs it,
/// generalised from a single key-value store to a pub/sub fan-out over
/// decoded text.
#[derive(Clone)]
pub struct DispatchingConnection {
    shared: Arc<Shared>,
}

fn default_decoder() -> Decoder {
    Arc::new(|bytes: &[u8]| Ok(String::from_utf8_lossy(bytes).into_owned()))
}

fn default_encoder() -> Encoder {
    Arc::new(|s: &str| Bytes::copy_from_slice(s.as_bytes()))
}

impl DispatchingConnection {
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        Self::with_codec(transport, settings, default_decoder(), default_encoder())
    }

    pub fn with_codec(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        decoder: Decoder,
        encoder: Encoder,
    ) -> Self {
        let logger_name = connection_logger_name(&settings.name);
        Self {
            shared: Arc::new(Shared {
                name: settings.name,
                logger_name,
                transport,
                decoder,
                encoder,
                newline: Mutex::new(settings.newline),
                open: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn newline(&self) -> String {
        self.shared.newline.lock().unwrap().clone()
    }

    pub fn set_newline(&self, newline: impl Into<String>) {
        *self.shared.newline.lock().unwrap() = newline.into();
    }

    /// Register a new observer. `key` is an optional explicit identity: a
    /// second `subscribe` with the same `Some(key)` is a silent no-op that
    /// returns the existing registration's handle — duplicate registration
    /// is silently ignored, without
    /// needing weakref-style identity comparison.
    pub fn subscribe(
        &self,
        key: Option<SubscriberKey>,
        data_handler: DataHandler,
        close_handler: CloseHandler,
    ) -> SubscriptionHandle {
        let mut subs = self.shared.subscriptions.lock().unwrap();
        if let Some(k) = key {
            if let Some(existing) = subs.iter().find(|s| s.key == Some(k)) {
                return SubscriptionHandle(existing.subscription_id);
            }
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Instant)>();
        subs.push(Subscription {
            subscription_id: id,
            key,
            sender: tx,
            close_handler,
        });
        drop(subs);

        // Dedicated consumer: the connection's receive path only ever does
        // a non-blocking `send` into this channel, so a slow observer's
        // `feed` can't stall delivery to anyone else.
        tokio::spawn(async move {
            while let Some((data, recv_time)) = rx.recv().await {
                data_handler(data, recv_time);
            }
        });

        SubscriptionHandle(id)
    }

    /// Convenience wrapper over `subscribe` for observers that don't need
    /// dedup (each `Command`/`Event` submission is already unique).
    pub fn subscribe_fn(
        &self,
        data_handler: impl Fn(String, Instant) + Send + Sync + 'static,
        close_handler: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.subscribe(None, Arc::new(data_handler), Arc::new(close_handler))
    }

    /// Remove a subscription. Safe to call from within a data handler's own
    /// consumer task (removal only touches the subscriptions `Vec`; dispatch
    /// iterates over a snapshot, see `data_received`). Unknown handles are
    /// logged and ignored, never an error — the observer may already have
    /// been unsubscribed by `shutdown`.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = self.shared.subscriptions.lock().unwrap();
        let before = subs.len();
        subs.retain(|s| s.subscription_id != handle.0);
        if subs.len() == before {
            warn!(connection = %self.shared.name, id = handle.0, "unsubscribe of unknown or already-removed subscription");
        }
    }

    /// Called by whatever drives the transport's read loop when a new chunk
    /// of bytes has arrived. Decodes once, then fans the decoded string out
    /// to every current subscriber's queue. Never blocks on a subscriber.
    pub fn data_received(&self, bytes: &[u8], recv_time: Instant) {
        if !self.is_open() {
            return;
        }
        trace!(target: RAW_DATA_TARGET, connection = %self.shared.name, direction = direction::RECEIVED, bytes = bytes.len(), "raw data received");

        match (self.shared.decoder)(bytes) {
            Ok(decoded) => {
                trace!(connection = %self.shared.name, direction = direction::RECEIVED, %decoded, "decoded data received");
                let snapshot: Vec<_> = {
                    let subs = self.shared.subscriptions.lock().unwrap();
                    subs.iter()
                        .map(|s| (s.subscription_id, s.sender.clone()))
                        .collect()
                };
                for (_, sender) in snapshot {
                    // Receiver gone means that observer's consumer task
                    // already exited (e.g. cancelled); dropping is fine.
                    let _ = sender.send((decoded.clone(), recv_time));
                }
            }
            Err(e) => {
                warn!(connection = %self.shared.name, error = %e, "failed to decode incoming data, dropping chunk");
            }
        }
    }

    /// Send raw text. `mask` suppresses the payload from logs (e.g. a
    /// password prompt reply) while still transmitting it untouched.
    ///
    /// A closed connection is a no-op: nothing is transmitted and no error
    /// is returned, matching the transport-less states a caller has no way
    /// to otherwise observe.
    pub async fn send(&self, data: &str, mask: bool) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        if mask {
            trace!(connection = %self.shared.name, direction = direction::SENT, "<masked>");
        } else {
            trace!(connection = %self.shared.name, direction = direction::SENT, %data, "data sent");
        }
        let bytes = (self.shared.encoder)(data);
        self.shared.transport.send(bytes).await
    }

    pub async fn send_line(&self, data: &str) -> Result<()> {
        let newline = self.newline();
        let line = format!("{data}{newline}");
        self.send(&line, false).await
    }

    /// Marks the connection closed, then notifies every registered close
    /// handler exactly once, in registration order. Subsequent `send`/
    /// `data_received` calls are no-ops.
    pub fn shutdown(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            let subs = std::mem::take(&mut *self.shared.subscriptions.lock().unwrap());
            for sub in subs {
                (sub.close_handler)();
            }
        }
    }

    pub fn logger_name(&self) -> &str {
        &self.shared.logger_name
    }
}

impl SubscriberKey {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}
