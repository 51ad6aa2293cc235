//! Pluggable-backend registries: concrete transport implementations are
//! left to downstream crates, but the registry pattern that lets a caller
//! plug one in by name is itself part of the core — a `(family, variant)`
//! key mapping to a constructor function.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::RunnerSettings;
use crate::error::{Error, Result};
use crate::runner::Runner;
use crate::transport::Transport;

type TransportCtor = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;
type RunnerCtor = Arc<dyn Fn(RunnerSettings) -> Arc<dyn Runner> + Send + Sync>;

/// Registry of named transport constructors, keyed `(family, variant)`
/// (e.g. `("tcp", "plain")`, `("tcp", "tls")`).
#[derive(Default)]
pub struct TransportFactory {
    entries: Mutex<HashMap<(String, String), TransportCtor>>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        family: impl Into<String>,
        variant: impl Into<String>,
        ctor: impl Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    ) {
        self.entries
            .lock()
            .unwrap()
            .insert((family.into(), variant.into()), Arc::new(ctor));
    }

    pub fn create(&self, family: &str, variant: &str) -> Result<Arc<dyn Transport>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&(family.to_string(), variant.to_string())) {
            Some(ctor) => Ok(ctor()),
            None => Err(Error::WrongUsage(format!(
                "no transport registered for ({family}, {variant})"
            ))),
        }
    }
}

/// Registry of named runner constructors, keyed by flavor name (e.g.
/// `"task-per-observer"`, `"shared-worker"`).
#[derive(Default)]
pub struct RunnerFactory {
    entries: Mutex<HashMap<String, RunnerCtor>>,
}

impl RunnerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        flavor: impl Into<String>,
        ctor: impl Fn(RunnerSettings) -> Arc<dyn Runner> + Send + Sync + 'static,
    ) {
        self.entries.lock().unwrap().insert(flavor.into(), Arc::new(ctor));
    }

    pub fn create(&self, flavor: &str, settings: RunnerSettings) -> Result<Arc<dyn Runner>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(flavor) {
            Some(ctor) => Ok(ctor(settings)),
            None => Err(Error::WrongUsage(format!("no runner registered for flavor '{flavor}'"))),
        }
    }
}

fn default_runner_factory() -> RunnerFactory {
    let factory = RunnerFactory::new();
    factory.register("task-per-observer", |settings| {
        Arc::new(crate::runner::TaskPerObserverRunner::new(settings))
    });
    factory.register("shared-worker", |settings| {
        crate::runner::SharedWorkerRunner::new(settings) as Arc<dyn Runner>
    });
    factory
}

/// Process-wide runner factory pre-populated with both built-in flavors.
/// Transports have no built-in registrations (concrete transport
/// implementations are out of scope here), so `TransportFactory`
/// instances are created per-caller instead of shared here.
pub fn runner_factory() -> &'static RunnerFactory {
    static FACTORY: OnceLock<RunnerFactory> = OnceLock::new();
    FACTORY.get_or_init(default_runner_factory)
}
