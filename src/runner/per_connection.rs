//! `SharedWorkerRunner`: the cooperative-multiplexing runner flavour —
//! one background `tokio::task` per connection, ticking
//! every observer submitted to it in a single loop, instead of one task per
//! observer. Fewer background tasks at the cost of one slow `tick_once`
//! (there isn't one; it's pure bookkeeping) delaying the next observer's
//! check by at most one tick interval.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::config::RunnerSettings;
use crate::connection::SubscriptionHandle;
use crate::error::Result;

use super::{tick_once, BoxFuture, Observer, Runner, RunnerHandle, TickOutcome};

struct Entry {
    observer: Arc<dyn Observer>,
    subscription: SubscriptionHandle,
    stop_flag: Arc<AtomicBool>,
    done_flag: Arc<AtomicBool>,
    done_notify: Arc<Notify>,
}

pub struct SharedWorkerRunner {
    settings: RunnerSettings,
    registry: Arc<Mutex<Vec<Entry>>>,
    shutdown_flag: Arc<AtomicBool>,
    worker_started: Mutex<bool>,
}

impl SharedWorkerRunner {
    pub fn new(settings: RunnerSettings) -> Arc<Self> {
        let this = Arc::new(Self {
            settings,
            registry: Arc::new(Mutex::new(Vec::new())),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            worker_started: Mutex::new(false),
        });
        this.ensure_worker();
        this
    }

    fn ensure_worker(self: &Arc<Self>) {
        let mut started = self.worker_started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;
        let registry = self.registry.clone();
        let shutdown_flag = self.shutdown_flag.clone();
        let tick = self.settings.tick;
        tokio::spawn(async move {
            loop {
                if shutdown_flag.load(Ordering::Acquire) {
                    let drained: Vec<Entry> = {
                        let mut reg = registry.lock().unwrap();
                        std::mem::take(&mut *reg)
                    };
                    for entry in drained {
                        entry.observer.cancel();
                        entry.observer.connection().unsubscribe(entry.subscription);
                        entry.done_flag.store(true, Ordering::Release);
                        entry.done_notify.notify_waiters();
                    }
                    break;
                }

                let mut reg = registry.lock().unwrap();
                reg.retain_mut(|entry| {
                    if entry.stop_flag.load(Ordering::Acquire) {
                        entry.observer.cancel();
                    }
                    let outcome = tick_once(&entry.observer);
                    let done = outcome == TickOutcome::Done || entry.observer.is_done();
                    if done {
                        entry.observer.connection().unsubscribe(entry.subscription);
                        entry.done_flag.store(true, Ordering::Release);
                        entry.done_notify.notify_waiters();
                    }
                    !done
                });
                drop(reg);

                tokio::time::sleep(tick).await;
            }
        });
    }
}

impl Runner for SharedWorkerRunner {
    fn submit<'a>(&'a self, observer: Arc<dyn Observer>) -> BoxFuture<'a, Result<RunnerHandle>> {
        Box::pin(async move {
            let conn = observer.connection();

            let feed_target = observer.clone();
            let close_target = observer.clone();
            let sub = conn.subscribe_fn(
                move |data, recv_time| feed_target.feed(&data, recv_time),
                move || close_target.connection_closed(),
            );

            if observer.is_command() {
                match observer.command_string() {
                    Some(cmd) => {
                        if let Err(e) = conn.send_line(&cmd).await {
                            conn.unsubscribe(sub);
                            return Err(e);
                        }
                    }
                    None => {
                        conn.unsubscribe(sub);
                        return Err(crate::error::Error::WrongUsage(
                            "command observer has no command_string".into(),
                        ));
                    }
                }
            }
            observer.touch_last_feed_time();

            let stop_flag = Arc::new(AtomicBool::new(false));
            let done_flag = Arc::new(AtomicBool::new(false));
            let done_notify = Arc::new(Notify::new());

            self.registry.lock().unwrap().push(Entry {
                observer: observer.clone(),
                subscription: sub,
                stop_flag: stop_flag.clone(),
                done_flag: done_flag.clone(),
                done_notify: done_notify.clone(),
            });

            Ok(RunnerHandle {
                stop: Arc::new(Notify::new()),
                stop_flag,
                done_flag,
                done_notify,
            })
        })
    }

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.shutdown_flag.store(true, Ordering::Release);
        })
    }
}
