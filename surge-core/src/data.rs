use pdatastructs::tdigest::{TDigest, K1};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::error;

const TDIGEST_BACKLOG_SIZE: usize = 100;

/// One scheduled execution unit.
///
/// Created by the arrival scheduler, consumed exactly once by a pool worker,
/// dropped after completion.
#[derive(Debug, Clone, Copy)]
pub struct Iteration {
    pub seq: u64,
    pub scheduled_at: Instant,
    /// Virtual user the iteration was assigned to, set at dispatch.
    pub vu: Option<usize>,
}

impl Iteration {
    pub fn new(seq: u64, scheduled_at: Instant) -> Self {
        Self {
            seq,
            scheduled_at,
            vu: None,
        }
    }
}

/// Sorted tag name/value pairs attached to a sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}:{value}")?;
        }
        write!(f, " }}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Rate,
    Gauge,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Gauge => "gauge",
            MetricKind::Trend => "trend",
        };
        write!(f, "{name}")
    }
}

/// Point-in-time view of every registered metric.
///
/// Consistent as of the read that produced it; ingestion continues
/// unaffected while a snapshot is held.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub elapsed: Duration,
    metrics: HashMap<String, MetricValue>,
}

impl MetricSnapshot {
    pub fn new(elapsed: Duration, metrics: HashMap<String, MetricValue>) -> Self {
        Self { elapsed, metrics }
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(MetricValue::Counter(count)) => *count,
            _ => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.metrics.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Metric names in a stable order for reporting.
    pub fn sorted_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.metrics.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone)]
pub enum MetricValue {
    Counter(u64),
    Rate { trues: u64, total: u64 },
    Gauge(f64),
    Trend(TrendStats),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Rate { .. } => MetricKind::Rate,
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Trend(_) => MetricKind::Trend,
        }
    }
}

/// Running distributional statistics for a trend metric.
///
/// Exact count/sum/min/max plus a TDigest for quantiles, so memory stays
/// bounded regardless of sample volume. Insertion order does not affect the
/// exact fields; quantile estimates are probabilistic.
#[derive(Debug, Clone)]
pub struct TrendStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    digest: TDigest<K1>,
    per_tag: HashMap<TagSet, TagStats>,
}

impl Default for TrendStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            digest: default_tdigest(),
            per_tag: HashMap::new(),
        }
    }
}

impl TrendStats {
    pub fn insert(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.digest.insert(value);
    }

    pub fn insert_tagged(&mut self, value: f64, tags: &TagSet) {
        self.insert(value);
        self.per_tag.entry(tags.clone()).or_default().insert(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.max
        }
    }

    pub fn quantile(&self, quantile: f64) -> f64 {
        if self.count == 0 {
            return 0.;
        }

        let value = self.digest.quantile(quantile);

        // TDigest can return NaN on sparse data; clamp to the exact bounds
        // rather than leaking it into reports.
        if value.is_finite() {
            value.clamp(self.min, self.max)
        } else {
            error!("non-finite quantile estimate; falling back to max");
            self.max
        }
    }

    pub fn per_tag(&self) -> impl Iterator<Item = (&TagSet, &TagStats)> {
        self.per_tag.iter()
    }

    /// Tag breakdown in a stable order for reporting.
    pub fn sorted_tags(&self) -> Vec<(&TagSet, &TagStats)> {
        let mut entries: Vec<_> = self.per_tag.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

/// Exact sub-aggregate for one tag combination of a trend.
#[derive(Debug, Clone, Copy)]
pub struct TagStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TagStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl TagStats {
    fn insert(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.max
        }
    }
}

fn default_tdigest() -> TDigest<K1> {
    TDigest::new(K1::new(10.), TDIGEST_BACKLOG_SIZE)
}
