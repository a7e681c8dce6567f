//! In-process metrics for the job pipeline.
//!
//! Every series lives in one `DashMap` keyed by name plus sorted labels.
//! Histograms keep fixed millisecond buckets, so quantiles are bucket upper
//! bounds clamped to the largest observation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Metric names recorded by the job pipeline.
pub mod names {
    pub const JOBS_STARTED: &str = "jobs_started";
    pub const JOBS_COMPLETED: &str = "jobs_completed";
    pub const JOBS_FAILED: &str = "jobs_failed";
    pub const JOBS_ACTIVE: &str = "jobs_active";
    pub const TASKS_FAILED: &str = "tasks_failed";
    pub const REMOTE_RETRIES: &str = "remote_retries";
    pub const REMOTE_FAILURES: &str = "remote_failures";
    pub const BREAKER_REJECTIONS: &str = "breaker_rejections";
    pub const TASK_DURATION_MS: &str = "task_duration_ms";
}

/// Upper bounds of the histogram buckets; anything larger lands in overflow.
pub const BUCKET_BOUNDS_MS: [f64; 12] = [
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        let mut sep = '{';
        for (k, v) in &self.labels {
            write!(f, "{sep}{k}={v}")?;
            sep = ',';
        }
        if !self.labels.is_empty() {
            f.write_str("}")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Buckets {
    counts: [u64; BUCKET_BOUNDS_MS.len() + 1],
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Buckets {
    fn observe(&mut self, value: f64) {
        let slot = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.counts[slot] += 1;
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn quantile(&self, q: f64) -> f64 {
        let rank = ((self.count as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (slot, n) in self.counts.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return BUCKET_BOUNDS_MS.get(slot).map_or(self.max, |&b| b.min(self.max));
            }
        }
        self.max
    }

    fn summary(&self) -> HistogramSummary {
        if self.count == 0 {
            return HistogramSummary::default();
        }
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            p50: self.quantile(0.5),
            p95: self.quantile(0.95),
        }
    }
}

enum Series {
    Counter(AtomicU64),
    Gauge(AtomicI64),
    Histogram(Mutex<Buckets>),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl HistogramSummary {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Point-in-time copy of every series, keyed by `name{k=v,...}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Thread-safe metrics registry. Recording under a name already used by a
/// different kind of series is ignored.
#[derive(Default)]
pub struct MetricsRecorder {
    series: DashMap<SeriesKey, Series>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str, labels: &[(&str, &str)], fresh: fn() -> Series, apply: impl FnOnce(&Series)) {
        let entry = self.series.entry(SeriesKey::new(name, labels)).or_insert_with(fresh);
        apply(entry.value());
    }

    fn read<T: Default>(&self, name: &str, labels: &[(&str, &str)], get: impl FnOnce(&Series) -> Option<T>) -> T {
        self.series
            .get(&SeriesKey::new(name, labels))
            .and_then(|s| get(s.value()))
            .unwrap_or_default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.record(name, labels, || Series::Counter(AtomicU64::new(0)), |s| {
            if let Series::Counter(c) = s {
                c.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.read(name, labels, |s| match s {
            Series::Counter(c) => Some(c.load(Ordering::Relaxed)),
            _ => None,
        })
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.record(name, labels, || Series::Gauge(AtomicI64::new(0)), |s| {
            if let Series::Gauge(g) = s {
                g.fetch_add(delta, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.read(name, labels, |s| match s {
            Series::Gauge(g) => Some(g.load(Ordering::Relaxed)),
            _ => None,
        })
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !value.is_finite() {
            return;
        }
        self.record(name, labels, || Series::Histogram(Mutex::default()), |s| {
            if let Series::Histogram(h) = s {
                h.lock().observe(value);
            }
        });
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.read(name, labels, |s| match s {
            Series::Histogram(h) => Some(h.lock().summary()),
            _ => None,
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        for entry in self.series.iter() {
            let key = entry.key().to_string();
            match entry.value() {
                Series::Counter(c) => {
                    snap.counters.insert(key, c.load(Ordering::Relaxed));
                }
                Series::Gauge(g) => {
                    snap.gauges.insert(key, g.load(Ordering::Relaxed));
                }
                Series::Histogram(h) => {
                    snap.histograms.insert(key, h.lock().summary());
                }
            }
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_per_label_set() {
        let m = MetricsRecorder::new();
        m.counter_inc(names::TASKS_FAILED, &[("task", "post")], 2);
        m.counter_inc(names::TASKS_FAILED, &[("task", "dialog")], 1);

        assert_eq!(m.counter_get(names::TASKS_FAILED, &[("task", "post")]), 2);
        assert_eq!(m.counter_get(names::TASKS_FAILED, &[("task", "dialog")]), 1);
        assert_eq!(m.counter_get(names::TASKS_FAILED, &[]), 0);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let m = MetricsRecorder::new();
        m.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("x", &[("a", "1"), ("b", "2")]), 1);
        assert!(m.snapshot().counters.contains_key("x{a=1,b=2}"));
    }

    #[test]
    fn gauge_tracks_active_jobs() {
        let m = MetricsRecorder::new();
        m.gauge_add(names::JOBS_ACTIVE, &[], 2);
        m.gauge_add(names::JOBS_ACTIVE, &[], -1);
        assert_eq!(m.gauge_get(names::JOBS_ACTIVE, &[]), 1);
    }

    #[test]
    fn kind_mismatch_is_ignored() {
        let m = MetricsRecorder::new();
        m.counter_inc("shared", &[], 3);
        m.gauge_add("shared", &[], 5);
        assert_eq!(m.counter_get("shared", &[]), 3);
        assert_eq!(m.gauge_get("shared", &[]), 0);
    }

    #[test]
    fn histogram_quantiles_use_bucket_bounds() {
        let m = MetricsRecorder::new();
        for ms in [5.0, 40.0, 40.0, 80.0, 700.0, 700.0, 700.0, 700.0, 700.0, 4_000.0] {
            m.histogram_observe(names::TASK_DURATION_MS, &[], ms);
        }
        let s = m.histogram_summary(names::TASK_DURATION_MS, &[]);
        assert_eq!(s.count, 10);
        assert_eq!(s.min, 5.0);
        assert_eq!(s.max, 4_000.0);
        assert_eq!(s.p50, 1_000.0);
        assert_eq!(s.p95, 4_000.0);
        assert_eq!(s.mean(), Some(766.5));
    }

    #[test]
    fn overflow_bucket_reports_max() {
        let m = MetricsRecorder::new();
        m.histogram_observe("slow", &[], 90_000.0);
        m.histogram_observe("slow", &[], f64::NAN);
        let s = m.histogram_summary("slow", &[]);
        assert_eq!(s.count, 1);
        assert_eq!(s.p50, 90_000.0);
    }

    #[test]
    fn unknown_histogram_is_empty() {
        let s = MetricsRecorder::new().histogram_summary("none", &[]);
        assert_eq!(s, HistogramSummary::default());
        assert_eq!(s.mean(), None);
    }

    #[test]
    fn snapshot_groups_by_kind() {
        let m = MetricsRecorder::new();
        m.counter_inc(names::REMOTE_RETRIES, &[("kind", "timeout")], 3);
        m.gauge_add(names::JOBS_ACTIVE, &[], 1);
        m.histogram_observe(names::TASK_DURATION_MS, &[("task", "post")], 12.0);

        let snap = m.snapshot();
        assert_eq!(snap.counters["remote_retries{kind=timeout}"], 3);
        assert_eq!(snap.gauges["jobs_active"], 1);
        assert_eq!(snap.histograms["task_duration_ms{task=post}"].count, 1);
    }

    #[test]
    fn concurrent_increments() {
        let m = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.counter_inc(names::REMOTE_RETRIES, &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get(names::REMOTE_RETRIES, &[]), 8000);
    }
}
