//! Metrics capability.
//!
//! Plugins record metrics through [`MetricsHandler`].
//! [`SimpleMetricsHandler`] keeps every series in memory in a [`DashMap`], so
//! concurrent instances can record without a global lock and the host can
//! read a snapshot at any time.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

/// How a recorded value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Monotonic counter; values are increments.
    Counter,
    /// Absolute value; each record replaces the previous one.
    Gauge,
    /// Each value is one observation.
    Histogram,
}

impl MetricKind {
    /// Map a proxy-wasm metric type to a [`MetricKind`].
    pub fn from_abi(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Counter),
            1 => Some(Self::Gauge),
            2 => Some(Self::Histogram),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// Receives metric records emitted by plugin instances.
pub trait MetricsHandler: Send + Sync {
    fn record(&self, name: &str, kind: MetricKind, value: i64);
}

/// Current state of one metric series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricValue {
    Counter(i64),
    Gauge(i64),
    Histogram {
        count: u64,
        sum: i64,
        min: i64,
        max: i64,
    },
}

impl MetricValue {
    fn first(kind: MetricKind, value: i64) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(value),
            MetricKind::Gauge => Self::Gauge(value),
            MetricKind::Histogram => Self::Histogram {
                count: 1,
                sum: value,
                min: value,
                max: value,
            },
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram { .. } => MetricKind::Histogram,
        }
    }

    fn apply(&mut self, value: i64) {
        match self {
            Self::Counter(total) => *total = total.saturating_add(value),
            Self::Gauge(current) => *current = value,
            Self::Histogram {
                count,
                sum,
                min,
                max,
            } => {
                *count += 1;
                *sum = sum.saturating_add(value);
                *min = (*min).min(value);
                *max = (*max).max(value);
            }
        }
    }
}

/// In-memory metrics sink.
///
/// Cheaply cloneable; clones share the same series.
#[derive(Debug, Clone, Default)]
pub struct SimpleMetricsHandler {
    series: Arc<DashMap<String, MetricValue>>,
}

impl SimpleMetricsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single series.
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.series.get(name).map(|entry| entry.value().clone())
    }

    /// Snapshot of every series, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, MetricValue)> {
        let mut all: Vec<_> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl MetricsHandler for SimpleMetricsHandler {
    fn record(&self, name: &str, kind: MetricKind, value: i64) {
        match self.series.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().kind();
                if existing != kind {
                    tracing::warn!(
                        metric = name,
                        existing = %existing,
                        requested = %kind,
                        "metric kind mismatch, record dropped"
                    );
                    return;
                }
                entry.get_mut().apply(value);
            }
            Entry::Vacant(entry) => {
                entry.insert(MetricValue::first(kind, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let m = SimpleMetricsHandler::new();
        m.record("requests", MetricKind::Counter, 1);
        m.record("requests", MetricKind::Counter, 2);
        assert_eq!(m.get("requests"), Some(MetricValue::Counter(3)));
    }

    #[test]
    fn gauge_replaces() {
        let m = SimpleMetricsHandler::new();
        m.record("active", MetricKind::Gauge, 10);
        m.record("active", MetricKind::Gauge, 4);
        assert_eq!(m.get("active"), Some(MetricValue::Gauge(4)));
    }

    #[test]
    fn histogram_tracks_observations() {
        let m = SimpleMetricsHandler::new();
        for v in [5, 1, 9] {
            m.record("latency", MetricKind::Histogram, v);
        }
        assert_eq!(
            m.get("latency"),
            Some(MetricValue::Histogram {
                count: 3,
                sum: 15,
                min: 1,
                max: 9
            })
        );
    }

    #[test]
    fn kind_mismatch_is_ignored() {
        let m = SimpleMetricsHandler::new();
        m.record("x", MetricKind::Counter, 1);
        m.record("x", MetricKind::Gauge, 50);
        assert_eq!(m.get("x"), Some(MetricValue::Counter(1)));
    }

    #[test]
    fn clones_share_series() {
        let m = SimpleMetricsHandler::new();
        let other = m.clone();
        other.record("shared", MetricKind::Counter, 7);
        assert_eq!(m.get("shared"), Some(MetricValue::Counter(7)));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted() {
        let m = SimpleMetricsHandler::new();
        m.record("b", MetricKind::Counter, 1);
        m.record("a", MetricKind::Gauge, 2);
        let names: Vec<String> = m.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn abi_kinds() {
        assert_eq!(MetricKind::from_abi(0), Some(MetricKind::Counter));
        assert_eq!(MetricKind::from_abi(1), Some(MetricKind::Gauge));
        assert_eq!(MetricKind::from_abi(2), Some(MetricKind::Histogram));
        assert_eq!(MetricKind::from_abi(3), None);
    }
}
