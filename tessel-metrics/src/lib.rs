#![deny(missing_docs)]
//! Named counters, timers and histograms shared by the stores, chunks, dispatchers and trainers
//! of one process.

use std::collections::BTreeMap;
use std::sync::Arc;

pub use witchcraft_metrics::{Counter, Histogram, Timer};
use witchcraft_metrics::{Metric, MetricId, MetricRegistry};

/// A handle on one metric registry. Clones share the registry, so a component handed a clone
/// reports into the same counters as its owner.
#[derive(Default, Clone)]
pub struct TesselMetrics {
    registry: Arc<MetricRegistry>,
}

impl TesselMetrics {
    /// The counter called `name`, created on first use.
    pub fn counter(&self, name: &'static str) -> Arc<Counter> {
        self.registry.counter(MetricId::new(name))
    }

    /// The timer called `name`, created on first use.
    pub fn timer(&self, name: &'static str) -> Arc<Timer> {
        self.registry.timer(MetricId::new(name))
    }

    /// The histogram called `name`, created on first use.
    pub fn histogram(&self, name: &'static str) -> Arc<Histogram> {
        self.registry.histogram(MetricId::new(name))
    }

    /// Current value of a named counter, zero if it was never touched.
    pub fn count(&self, name: &'static str) -> i64 {
        self.counter(name).count()
    }

    /// Every counter whose name starts with `prefix`, by name.
    pub fn counts(&self, prefix: &str) -> BTreeMap<String, i64> {
        self.registry
            .metrics()
            .iter()
            .filter(|(id, _)| id.name().starts_with(prefix))
            .filter_map(|(id, metric)| match metric {
                Metric::Counter(counter) => Some((id.name().to_string(), counter.count())),
                _ => None,
            })
            .collect()
    }

    /// `name=value` pairs of [`TesselMetrics::counts`], for log lines.
    pub fn summary(&self, prefix: &str) -> String {
        self.counts(prefix)
            .into_iter()
            .map(|(name, count)| format!("{name}={count}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = TesselMetrics::default();
        let other = metrics.clone();
        other.counter("store.puts").inc();
        other.counter("store.puts").inc();
        assert_eq!(metrics.count("store.puts"), 2);
        assert_eq!(metrics.count("store.removes"), 0);
    }

    #[test]
    fn counts_filter_by_prefix() {
        let metrics = TesselMetrics::default();
        metrics.counter("descent.steps").add(3);
        metrics.counter("descent.shuttles.sent").inc();
        metrics.counter("store.puts").inc();
        metrics.timer("descent.merge.latency");

        let counts = metrics.counts("descent.");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["descent.steps"], 3);
        assert_eq!(metrics.summary("descent."), "descent.shuttles.sent=1 descent.steps=3");
    }
}
