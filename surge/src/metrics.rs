//! Metric registry and handles.
//!
//! Handles write into shared atomic cells; trend samples go through a
//! lock-free [`AtomicBucket`] that is drained into a TDigest-backed
//! aggregate whenever a snapshot is taken. All combination operations are
//! commutative, so samples from concurrent virtual users can interleave in
//! any order.

use arc_swap::ArcSwap;
use metrics_util::AtomicBucket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use surge_core::{MetricKind, MetricSnapshot, MetricValue, TagSet, TrendStats};

/// Per-run metric registry: constructed at scenario setup, injected into
/// iteration bodies through the VU context, dropped with the run.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    start: Instant,
    metrics: RwLock<HashMap<String, Metric>>,
    latest: ArcSwap<MetricSnapshot>,
}

#[derive(Clone)]
enum Metric {
    Counter(Counter),
    Rate(Rate),
    Gauge(Gauge),
    Trend(Trend),
}

impl Metric {
    fn kind(&self) -> MetricKind {
        match self {
            Metric::Counter(_) => MetricKind::Counter,
            Metric::Rate(_) => MetricKind::Rate,
            Metric::Gauge(_) => MetricKind::Gauge,
            Metric::Trend(_) => MetricKind::Trend,
        }
    }
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                start: Instant::now(),
                metrics: RwLock::new(HashMap::new()),
                latest: ArcSwap::new(Arc::new(MetricSnapshot::default())),
            }),
        }
    }

    /// Get or create the named counter.
    ///
    /// # Panics
    /// Panics if the name is already registered as a different metric kind;
    /// that is a programming error, not a runtime condition.
    pub fn counter(&self, name: &str) -> Counter {
        match self.get_or_create(name, || Metric::Counter(Counter::new(name))) {
            Metric::Counter(counter) => counter,
            other => panic!("metric '{name}' is a {}, not a counter", other.kind()),
        }
    }

    /// Get or create the named rate: the fraction of `add(true)` calls over
    /// all `add` calls.
    pub fn rate(&self, name: &str) -> Rate {
        match self.get_or_create(name, || Metric::Rate(Rate::new(name))) {
            Metric::Rate(rate) => rate,
            other => panic!("metric '{name}' is a {}, not a rate", other.kind()),
        }
    }

    /// Get or create the named gauge.
    pub fn gauge(&self, name: &str) -> Gauge {
        match self.get_or_create(name, || Metric::Gauge(Gauge::new(name))) {
            Metric::Gauge(gauge) => gauge,
            other => panic!("metric '{name}' is a {}, not a gauge", other.kind()),
        }
    }

    /// Get or create the named trend (distributional statistics).
    pub fn trend(&self, name: &str) -> Trend {
        match self.get_or_create(name, || Metric::Trend(Trend::new(name))) {
            Metric::Trend(trend) => trend,
            other => panic!("metric '{name}' is a {}, not a trend", other.kind()),
        }
    }

    /// Record one observation against the named metric, routed through its
    /// kind's combination operation. Unknown names register as trends.
    pub fn record(&self, name: &str, value: f64, tags: Option<TagSet>) {
        let metric = self.get_or_create(name, || Metric::Trend(Trend::new(name)));
        match metric {
            Metric::Counter(counter) => counter.add(value as u64),
            Metric::Rate(rate) => rate.add(value != 0.),
            Metric::Gauge(gauge) => gauge.set(value),
            Metric::Trend(trend) => match tags {
                Some(tags) => trend.record_tagged(value, tags),
                None => trend.record(value),
            },
        }
    }

    fn get_or_create(&self, name: &str, create: impl FnOnce() -> Metric) -> Metric {
        {
            let metrics = self
                .inner
                .metrics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(metric) = metrics.get(name) {
                return metric.clone();
            }
        }

        let mut metrics = self
            .inner
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        metrics
            .entry(name.to_string())
            .or_insert_with(create)
            .clone()
    }

    /// Drain pending trend samples and publish a fresh snapshot.
    ///
    /// Ingestion continues concurrently; the snapshot is consistent as of
    /// the reads that produced it, not globally serialized.
    pub fn snapshot(&self) -> Arc<MetricSnapshot> {
        let metrics = self
            .inner
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut values = HashMap::with_capacity(metrics.len());
        for (name, metric) in metrics.iter() {
            let value = match metric {
                Metric::Counter(counter) => MetricValue::Counter(counter.value()),
                Metric::Rate(rate) => {
                    let (trues, total) = rate.value();
                    MetricValue::Rate { trues, total }
                }
                Metric::Gauge(gauge) => MetricValue::Gauge(gauge.value()),
                Metric::Trend(trend) => MetricValue::Trend(trend.drain()),
            };
            values.insert(name.clone(), value);
        }
        drop(metrics);

        let snapshot = Arc::new(MetricSnapshot::new(self.inner.start.elapsed(), values));
        self.inner.latest.store(snapshot.clone());
        snapshot
    }

    /// The most recently published snapshot, without draining anything.
    pub fn latest(&self) -> Arc<MetricSnapshot> {
        self.inner.latest.load_full()
    }
}

#[derive(Clone)]
pub struct Counter {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    name: Arc<str>,
    cell: Arc<AtomicU64>,
}

impl Counter {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            cell: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add(&self, n: u64) {
        self.cell.fetch_add(n, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(self.name.to_string()).increment(n);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn value(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Rate {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    name: Arc<str>,
    trues: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Rate {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            trues: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add(&self, flag: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if flag {
            self.trues.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!(format!("{}_total", self.name)).increment(1);
            if flag {
                metrics::counter!(format!("{}_true", self.name)).increment(1);
            }
        }
    }

    pub fn value(&self) -> (u64, u64) {
        // Relaxed pair loads can momentarily disagree; total is read first
        // so the observed rate never exceeds 1.
        let total = self.total.load(Ordering::Relaxed);
        let trues = self.trues.load(Ordering::Relaxed).min(total);
        (trues, total)
    }
}

#[derive(Clone)]
pub struct Gauge {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    name: Arc<str>,
    cell: Arc<AtomicU64>,
}

impl Gauge {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            cell: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    pub fn set(&self, value: f64) {
        self.cell.store(value.to_bits(), Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!(self.name.to_string()).set(value);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.cell.load(Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub struct Trend {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    name: Arc<str>,
    bucket: Arc<AtomicBucket<TrendEntry>>,
    agg: Arc<Mutex<TrendStats>>,
}

#[derive(Clone)]
struct TrendEntry {
    value: f64,
    tags: Option<Arc<TagSet>>,
}

impl Trend {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            bucket: Arc::new(AtomicBucket::new()),
            agg: Arc::new(Mutex::new(TrendStats::default())),
        }
    }

    pub fn record(&self, value: f64) {
        self.bucket.push(TrendEntry { value, tags: None });
        #[cfg(feature = "metrics")]
        metrics::histogram!(self.name.to_string()).record(value);
    }

    pub fn record_tagged(&self, value: f64, tags: TagSet) {
        self.bucket.push(TrendEntry {
            value,
            tags: Some(Arc::new(tags)),
        });
        #[cfg(feature = "metrics")]
        metrics::histogram!(self.name.to_string()).record(value);
    }

    /// Fold pending samples into the running aggregate and return a copy.
    fn drain(&self) -> TrendStats {
        let mut agg = self.agg.lock().unwrap_or_else(PoisonError::into_inner);
        self.bucket.clear_with(|entries| {
            for entry in entries {
                match &entry.tags {
                    Some(tags) => agg.insert_tagged(entry.value, tags.as_ref()),
                    None => agg.insert(entry.value),
                }
            }
        });
        agg.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = Registry::new();
        let counter = registry.counter("iterations");
        counter.increment();
        counter.add(4);
        assert_eq!(registry.counter("iterations").value(), 5);
    }

    #[test]
    fn rate_tracks_true_fraction() {
        let registry = Registry::new();
        let rate = registry.rate("errors");
        for i in 0..100 {
            rate.add(i % 10 == 0);
        }
        assert_eq!(rate.value(), (10, 100));
    }

    #[test]
    #[should_panic(expected = "not a rate")]
    fn kind_mismatch_panics() {
        let registry = Registry::new();
        registry.counter("iterations");
        registry.rate("iterations");
    }

    #[test]
    fn snapshot_drains_trends() {
        let registry = Registry::new();
        let trend = registry.trend("http_req_duration");
        for v in [1.0, 2.0, 3.0, 4.0] {
            trend.record(v);
        }

        let snapshot = registry.snapshot();
        let Some(MetricValue::Trend(stats)) = snapshot.get("http_req_duration") else {
            panic!("missing trend");
        };
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.sum(), 10.);

        // Aggregates survive across snapshots.
        trend.record(5.0);
        let snapshot = registry.snapshot();
        let Some(MetricValue::Trend(stats)) = snapshot.get("http_req_duration") else {
            panic!("missing trend");
        };
        assert_eq!(stats.count(), 5);
        assert_eq!(stats.max(), 5.);
    }

    #[test]
    fn tagged_samples_break_down_by_tag() {
        let registry = Registry::new();
        let trend = registry.trend("http_req_duration");
        let ok = TagSet::new().with("status", "200");
        let err = TagSet::new().with("status", "500");
        trend.record_tagged(1., ok.clone());
        trend.record_tagged(2., ok);
        trend.record_tagged(9., err);

        let snapshot = registry.snapshot();
        let Some(MetricValue::Trend(stats)) = snapshot.get("http_req_duration") else {
            panic!("missing trend");
        };
        let tags = stats.sorted_tags();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].1.count(), 2);
        assert_eq!(tags[1].1.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recording_is_lossless() {
        let registry = Registry::new();
        let mut handles = vec![];
        for _ in 0..8 {
            let counter = registry.counter("iterations");
            let rate = registry.rate("errors");
            let trend = registry.trend("latency");
            handles.push(tokio::spawn(async move {
                for i in 0..1_000 {
                    counter.increment();
                    rate.add(i % 2 == 0);
                    trend.record(i as f64);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter("iterations"), 8_000);
        let Some(MetricValue::Rate { trues, total }) = snapshot.get("errors") else {
            panic!("missing rate");
        };
        assert_eq!((*trues, *total), (4_000, 8_000));
        let Some(MetricValue::Trend(stats)) = snapshot.get("latency") else {
            panic!("missing trend");
        };
        assert_eq!(stats.count(), 8_000);
    }

    #[test]
    fn record_routes_by_metric_kind() {
        let registry = Registry::new();
        registry.counter("iterations");
        registry.rate("errors");

        registry.record("iterations", 2., None);
        registry.record("errors", 1., None);
        registry.record("errors", 0., None);
        registry.record("wait_time", 7.5, None);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter("iterations"), 2);
        let Some(MetricValue::Rate { trues, total }) = snapshot.get("errors") else {
            panic!("missing rate");
        };
        assert_eq!((*trues, *total), (1, 2));
        let Some(MetricValue::Trend(stats)) = snapshot.get("wait_time") else {
            panic!("unknown names should register as trends");
        };
        assert_eq!(stats.count(), 1);
    }

    #[test]
    fn latest_returns_published_snapshot() {
        let registry = Registry::new();
        registry.counter("iterations").add(3);
        assert_eq!(registry.latest().counter("iterations"), 0);
        registry.snapshot();
        assert_eq!(registry.latest().counter("iterations"), 3);
    }
}
