//! Named custom metrics owned by a stage
//!
//! Metrics are created on demand (by the host or by embedded code through
//! the context module) and updated with atomics, so readers never block the
//! processing path.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Counter of embedded exceptions swallowed by a callable's exit hook
pub const EXCEPTIONS_SUPPRESSED: &str = "nExceptionsSuppressed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing
    Counter,
    /// Arbitrary current value
    Gauge,
    /// Elapsed time in nanoseconds
    Time,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Time => "time",
        })
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "time" => Ok(MetricKind::Time),
            other => Err(Error::Context(format!("unknown metric kind '{}'", other))),
        }
    }
}

#[derive(Debug)]
pub struct CustomMetric {
    name: String,
    description: String,
    kind: MetricKind,
    value: AtomicI64,
}

impl CustomMetric {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Adds `delta`; counters reject negative deltas, and no metric wraps
    pub fn increment(&self, delta: i64) -> Result<i64> {
        if self.kind == MetricKind::Counter && delta < 0 {
            return Err(Error::Context(format!(
                "counter '{}' cannot decrease (delta {})",
                self.name, delta
            )));
        }
        self.value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| current.checked_add(delta))
            .map(|previous| previous + delta)
            .map_err(|current| {
                Error::Context(format!(
                    "metric '{}' overflows adding {} to {}",
                    self.name, delta, current
                ))
            })
    }

    pub fn set(&self, value: i64) -> Result<()> {
        if self.kind != MetricKind::Counter {
            self.value.store(value, Ordering::Relaxed);
            return Ok(());
        }
        self.value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (value >= current).then_some(value)
            })
            .map(|_| ())
            .map_err(|current| {
                Error::Context(format!(
                    "counter '{}' cannot decrease from {} to {}",
                    self.name, current, value
                ))
            })
    }
}

/// Metrics of one stage, keyed by name
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: RwLock<BTreeMap<String, Arc<CustomMetric>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a metric, or return the existing one when name and kind match
    pub fn create(
        &self,
        name: &str,
        description: &str,
        kind: MetricKind,
        initial: i64,
    ) -> Result<Arc<CustomMetric>> {
        if let Some(existing) = self.metrics.read().get(name) {
            return Self::check_kind(existing, kind);
        }

        let mut metrics = self.metrics.write();
        if let Some(existing) = metrics.get(name) {
            return Self::check_kind(existing, kind);
        }
        let metric = Arc::new(CustomMetric {
            name: name.to_string(),
            description: description.to_string(),
            kind,
            value: AtomicI64::new(initial),
        });
        metrics.insert(name.to_string(), Arc::clone(&metric));
        tracing::debug!(metric = name, %kind, initial, "Created custom metric");
        Ok(metric)
    }

    fn check_kind(existing: &Arc<CustomMetric>, kind: MetricKind) -> Result<Arc<CustomMetric>> {
        if existing.kind != kind {
            return Err(Error::Context(format!(
                "metric '{}' already exists as a {}",
                existing.name, existing.kind
            )));
        }
        Ok(Arc::clone(existing))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CustomMetric>> {
        self.metrics.read().get(name).cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CustomMetric>> {
        self.get(name)
            .ok_or_else(|| Error::Context(format!("no metric named '{}'", name)))
    }

    /// Current values, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.metrics
            .read()
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent_per_kind() {
        let registry = MetricRegistry::new();
        let a = registry.create("hits", "", MetricKind::Counter, 0).unwrap();
        a.increment(3).unwrap();
        let b = registry.create("hits", "ignored", MetricKind::Counter, 100).unwrap();
        assert_eq!(b.value(), 3);
        assert!(registry.create("hits", "", MetricKind::Gauge, 0).is_err());
    }

    #[test]
    fn test_counter_is_monotonic() {
        let registry = MetricRegistry::new();
        let counter = registry.create(EXCEPTIONS_SUPPRESSED, "", MetricKind::Counter, 0).unwrap();
        assert_eq!(counter.increment(1).unwrap(), 1);
        assert!(counter.increment(-1).is_err());
        assert!(counter.set(0).is_err());

        let gauge = registry.create("depth", "queue depth", MetricKind::Gauge, 10).unwrap();
        gauge.set(2).unwrap();
        gauge.increment(-5).unwrap();
        assert_eq!(registry.snapshot().get("depth"), Some(&-3));
    }

    #[test]
    fn test_increment_never_wraps() {
        let registry = MetricRegistry::new();
        let counter = registry.create("big", "", MetricKind::Counter, i64::MAX - 1).unwrap();
        assert_eq!(counter.increment(1).unwrap(), i64::MAX);
        assert!(matches!(counter.increment(1), Err(Error::Context(_))));
        assert_eq!(counter.value(), i64::MAX);

        let gauge = registry.create("low", "", MetricKind::Gauge, i64::MIN + 1).unwrap();
        assert!(gauge.increment(-2).is_err());
        assert_eq!(gauge.value(), i64::MIN + 1);
        assert!(gauge.increment(i64::MAX).is_ok());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Gauge".parse::<MetricKind>().unwrap(), MetricKind::Gauge);
        assert!("histogram".parse::<MetricKind>().is_err());
    }
}
