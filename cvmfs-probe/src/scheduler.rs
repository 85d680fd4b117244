//! Per-instance read scheduling.
//!
//! Each successfully parsed directive block becomes an independently
//! scheduled probe instance: a task looping on the instance's interval (or
//! the global default) and invoking the engine with that instance's
//! configuration. Instances share nothing mutable, so concurrently
//! scheduled instances cannot interfere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio::task::JoinHandle;

use crate::config::{Directive, ProbeConfig};
use crate::probe::ProbeEngine;
use crate::telemetry::{MetricSink, PLUGIN_NAME};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub struct Scheduler {
    engine: Arc<ProbeEngine>,
    sink: Arc<dyn MetricSink>,
    default_interval: Duration,
    instances: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: ProbeEngine, sink: Arc<dyn MetricSink>, default_interval: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            sink,
            default_interval,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Parse one directive block and register the resulting probe instance.
    ///
    /// Integer directive errors propagate and nothing is registered for the
    /// block; sibling blocks already registered are unaffected.
    pub fn configure(&self, directives: &[Directive]) -> Result<()> {
        let config = ProbeConfig::from_directives(directives)?;
        self.register_read(config);
        Ok(())
    }

    /// Spawn the instance's read loop, keyed by its instance id.
    fn register_read(&self, config: ProbeConfig) {
        let interval = config.effective_interval(self.default_interval);
        let instance_id = config.instance_id.clone();
        let engine = Arc::clone(&self.engine);
        let sink = Arc::clone(&self.sink);
        let config = Arc::new(config);
        let shutdown = shutdown_flag();

        let task_config = Arc::clone(&config);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                engine.read(&task_config, sink.as_ref()).await;
            }
        });

        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(instance_id, handle);
        }

        info!("{PLUGIN_NAME}: configured read callback with config: {config}");
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    /// Stop every read loop registered with this scheduler. The process-wide
    /// shutdown flag is left to the caller (`request_shutdown`).
    pub fn shutdown(&self) {
        if let Ok(mut instances) = self.instances.lock() {
            for (_, handle) in instances.drain() {
                handle.abort();
            }
        }
    }
}
