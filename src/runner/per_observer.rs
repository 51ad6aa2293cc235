//! `TaskPerObserverRunner`: the primary runner flavour — one dedicated
//! `tokio::task` per submitted observer, ticking its own
//! lifetime clock independently of every other observer on the connection.
//! Simple to reason about and what every example in this crate uses;
//! `SharedWorkerRunner` trades that isolation for fewer background tasks.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::config::RunnerSettings;
use crate::error::Result;

use super::{tick_once, BoxFuture, Observer, Runner, RunnerHandle, TickOutcome};

/// A submitted observer's stop signal, kept around so `shutdown` can reach
/// it even though each observer otherwise drives its own task.
struct RegistryEntry {
    stop: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
    done_flag: Arc<AtomicBool>,
}

pub struct TaskPerObserverRunner {
    settings: RunnerSettings,
    registry: Mutex<Vec<RegistryEntry>>,
}

impl TaskPerObserverRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self {
            settings,
            registry: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TaskPerObserverRunner {
    fn default() -> Self {
        Self::new(RunnerSettings::default())
    }
}

async fn feed_tick_loop(observer: Arc<dyn Observer>, stop: Arc<Notify>, stop_flag: Arc<AtomicBool>, tick: std::time::Duration) {
    loop {
        if stop_flag.load(Ordering::Acquire) {
            observer.cancel();
            break;
        }
        if tick_once(&observer) == TickOutcome::Done {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = stop.notified() => {
                observer.cancel();
                break;
            }
        }
    }
}

impl Runner for TaskPerObserverRunner {
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

            let stop = Arc::new(Notify::new());
            let stop_flag = Arc::new(AtomicBool::new(false));
            let done_flag = Arc::new(AtomicBool::new(false));
            let done_notify = Arc::new(Notify::new());
            let tick = self.settings.tick;

            {
                let mut registry = self.registry.lock().unwrap();
                registry.retain(|e| !e.done_flag.load(Ordering::Acquire));
                registry.push(RegistryEntry {
                    stop: stop.clone(),
                    stop_flag: stop_flag.clone(),
                    done_flag: done_flag.clone(),
                });
            }

            let task_observer = observer.clone();
            let task_conn = conn.clone();
            let (task_stop, task_stop_flag, task_done_flag, task_done_notify) =
                (stop.clone(), stop_flag.clone(), done_flag.clone(), done_notify.clone());

            tokio::spawn(async move {
                feed_tick_loop(task_observer, task_stop, task_stop_flag, tick).await;
                task_conn.unsubscribe(sub);
                task_done_flag.store(true, Ordering::Release);
                task_done_notify.notify_waiters();
            });

            Ok(RunnerHandle {
                stop,
                stop_flag,
                done_flag,
                done_notify,
            })
        })
    }

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entries: Vec<RegistryEntry> = {
                let mut registry = self.registry.lock().unwrap();
                std::mem::take(&mut *registry)
            };
            for entry in entries {
                entry.stop_flag.store(true, Ordering::Release);
                entry.stop.notify_waiters();
            }
        })
    }
}
