//! In-memory metrics registry
//!
//! Named atomic counters and gauges. Counters only grow; gauges are set by
//! the stats collector. Sinks are out of scope — the registry can log a
//! snapshot periodically for operators running without a scraper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

struct Metric {
    value: AtomicU64,
    #[allow(dead_code)]
    help: &'static str,
}

impl Metric {
    fn new(help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            help,
        }
    }
}

/// Registry of named counters and gauges.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<&'static str, Metric>,
    gauges: DashMap<&'static str, Metric>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_counter(&self, name: &'static str, help: &'static str) {
        self.counters.insert(name, Metric::new(help));
    }

    pub fn register_gauge(&self, name: &'static str, help: &'static str) {
        self.gauges.insert(name, Metric::new(help));
    }

    pub fn counter_increment(&self, name: &'static str) {
        self.counter_add(name, 1);
    }

    pub fn counter_add(&self, name: &'static str, delta: u64) {
        match self.counters.get(name) {
            Some(metric) => {
                metric.value.fetch_add(delta, Ordering::Relaxed);
            }
            None => warn!(name, "unregistered counter"),
        }
    }

    pub fn gauge_set(&self, name: &'static str, value: u64) {
        match self.gauges.get(name) {
            Some(metric) => metric.value.store(value, Ordering::Relaxed),
            None => warn!(name, "unregistered gauge"),
        }
    }

    pub fn counter_value(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map(|metric| metric.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &'static str) -> u64 {
        self.gauges
            .get(name)
            .map(|metric| metric.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stable view of every metric, for logging.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let mut all = BTreeMap::new();
        for entry in self.counters.iter() {
            all.insert(*entry.key(), entry.value().value.load(Ordering::Relaxed));
        }
        for entry in self.gauges.iter() {
            all.insert(*entry.key(), entry.value().value.load(Ordering::Relaxed));
        }
        all
    }

    /// Log a snapshot every `interval` until the shutdown signal flips.
    pub fn spawn_log_rotation(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let metrics = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        info!(?snapshot, "metrics");
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }
}
