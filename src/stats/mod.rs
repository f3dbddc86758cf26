use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

pub mod threshold;

/// Built-in metric names recorded by the engine itself.
pub const CHECKS: &str = "checks";
pub const GROUP_DURATION: &str = "group_duration";
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATION_ERRORS: &str = "iteration_errors";

/// Tag set attached to a metric series. BTreeMap so that insertion order is
/// irrelevant and series names render deterministically.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Identity of one series: metric name plus its exact tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub name: String,
    pub tags: Tags,
}

impl SeriesKey {
    /// Render as `name` or `name{k:v,...}` (tags sorted by key).
    pub fn display_name(&self) -> String {
        if self.tags.is_empty() {
            return self.name.clone();
        }
        let mut out = self.name.clone();
        out.push('{');
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(k);
            out.push(':');
            out.push_str(v);
        }
        out.push('}');
        out
    }
}

/// Accumulated state of one series. Gauges carry a write stamp so that
/// "last write wins" stays well defined when a snapshot merges several series.
#[derive(Debug, Clone)]
enum Series {
    Counter { sum: f64 },
    Rate { hits: u64, total: u64 },
    Trend { samples: Vec<f64> },
    Gauge { last: f64, stamp: u64 },
}

/// Read-only aggregate view of a metric, merged over every series matched by
/// the selector. Two snapshots taken with no intervening writes compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSnapshot {
    Counter { sum: f64 },
    Rate { hits: u64, total: u64 },
    /// Samples sorted ascending.
    Trend { samples: Vec<f64> },
    Gauge { last: Option<f64> },
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Counter { .. } => MetricKind::Counter,
            MetricSnapshot::Rate { .. } => MetricKind::Rate,
            MetricSnapshot::Trend { .. } => MetricKind::Trend,
            MetricSnapshot::Gauge { .. } => MetricKind::Gauge,
        }
    }

    /// True when no observation has been recorded for the selector.
    pub fn is_empty(&self) -> bool {
        match self {
            MetricSnapshot::Counter { .. } => false,
            MetricSnapshot::Rate { total, .. } => *total == 0,
            MetricSnapshot::Trend { samples } => samples.is_empty(),
            MetricSnapshot::Gauge { last } => last.is_none(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            MetricSnapshot::Rate { total, .. } => *total,
            MetricSnapshot::Trend { samples } => samples.len() as u64,
            _ => 0,
        }
    }

    /// Success ratio of a Rate. Zero observations yield NaN, not a crash.
    pub fn ratio(&self) -> f64 {
        match self {
            MetricSnapshot::Rate { hits, total } => {
                if *total == 0 {
                    f64::NAN
                } else {
                    *hits as f64 / *total as f64
                }
            }
            _ => f64::NAN,
        }
    }

    pub fn avg(&self) -> Option<f64> {
        match self {
            MetricSnapshot::Trend { samples } if !samples.is_empty() => {
                Some(samples.iter().sum::<f64>() / samples.len() as f64)
            }
            _ => None,
        }
    }

    pub fn min(&self) -> Option<f64> {
        match self {
            MetricSnapshot::Trend { samples } => samples.first().copied(),
            _ => None,
        }
    }

    pub fn max(&self) -> Option<f64> {
        match self {
            MetricSnapshot::Trend { samples } => samples.last().copied(),
            _ => None,
        }
    }

    /// Nearest-rank percentile over the accumulated samples.
    ///
    /// With samples sorted ascending, `idx = ceil(p / 100 * n)` clamped to
    /// `[1, n]` and the percentile is `samples[idx - 1]`; `p <= 0` yields the
    /// minimum. Threshold comparisons depend on this formula bit-for-bit.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let MetricSnapshot::Trend { samples } = self else {
            return None;
        };
        if samples.is_empty() {
            return None;
        }
        let n = samples.len();
        let rank = (p / 100.0 * n as f64).ceil() as usize;
        let idx = rank.clamp(1, n);
        Some(samples[idx - 1])
    }
}

const NUM_SHARDS: usize = 16;

/// Thread-safe registry of typed metrics.
///
/// A kind is registered per metric *name* at first use; reusing a name with a
/// different kind is a configuration error. Series (name + tag set) live in
/// hash-partitioned shards so that concurrent VUs contend on a shard, never on
/// the whole registry, and writes are visible as soon as the recording call
/// returns.
pub struct MetricRegistry {
    kinds: RwLock<HashMap<String, MetricKind>>,
    shards: Vec<RwLock<HashMap<SeriesKey, Series>>>,
    gauge_clock: AtomicU64,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            gauge_clock: AtomicU64::new(0),
        }
    }

    /// Register `name` with `kind`, or verify a previous registration.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<()> {
        {
            let kinds = self.kinds.read();
            if let Some(existing) = kinds.get(name) {
                if *existing != kind {
                    bail!(
                        "metric '{}' already declared as {}, cannot redeclare as {}",
                        name,
                        existing.as_str(),
                        kind.as_str()
                    );
                }
                return Ok(());
            }
        }
        let mut kinds = self.kinds.write();
        match kinds.get(name) {
            Some(existing) if *existing != kind => bail!(
                "metric '{}' already declared as {}, cannot redeclare as {}",
                name,
                existing.as_str(),
                kind.as_str()
            ),
            Some(_) => Ok(()),
            None => {
                kinds.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.kinds.read().get(name).copied()
    }

    /// Add `value` to a Counter series.
    pub fn counter_add(&self, name: &str, tags: Tags, value: f64) -> Result<()> {
        self.record(name, MetricKind::Counter, tags, |series| {
            if let Series::Counter { sum } = series {
                *sum += value;
            }
        })
    }

    /// Record one observation on a Rate series; `hit` counts toward the ratio.
    pub fn rate_add(&self, name: &str, tags: Tags, hit: bool) -> Result<()> {
        self.record(name, MetricKind::Rate, tags, |series| {
            if let Series::Rate { hits, total } = series {
                *total += 1;
                if hit {
                    *hits += 1;
                }
            }
        })
    }

    /// Insert one sample into a Trend series.
    pub fn trend_add(&self, name: &str, tags: Tags, sample: f64) -> Result<()> {
        self.record(name, MetricKind::Trend, tags, |series| {
            if let Series::Trend { samples } = series {
                samples.push(sample);
            }
        })
    }

    /// Overwrite a Gauge series with `value` (last write wins).
    pub fn gauge_set(&self, name: &str, tags: Tags, value: f64) -> Result<()> {
        let stamp = self.gauge_clock.fetch_add(1, Ordering::Relaxed);
        self.record(name, MetricKind::Gauge, tags, |series| {
            if let Series::Gauge { last, stamp: prev } = series {
                *last = value;
                *prev = stamp;
            }
        })
    }

    fn record(
        &self,
        name: &str,
        kind: MetricKind,
        tags: Tags,
        apply: impl FnOnce(&mut Series),
    ) -> Result<()> {
        self.declare(name, kind)?;
        let key = SeriesKey { name: name.to_string(), tags };
        let mut shard = self.shards[shard_index(&key)].write();
        let series = shard.entry(key).or_insert_with(|| match kind {
            MetricKind::Counter => Series::Counter { sum: 0.0 },
            MetricKind::Rate => Series::Rate { hits: 0, total: 0 },
            MetricKind::Trend => Series::Trend { samples: Vec::new() },
            MetricKind::Gauge => Series::Gauge { last: 0.0, stamp: 0 },
        });
        apply(series);
        Ok(())
    }

    /// Aggregate view over every series named `name` whose tags contain
    /// `filter`. Returns None for a name that was never declared; a declared
    /// name with no matching series yields an empty snapshot. Each shard lock
    /// is held only for the copy.
    pub fn snapshot(&self, name: &str, filter: &Tags) -> Option<MetricSnapshot> {
        let kind = self.kind_of(name)?;
        let mut snap = match kind {
            MetricKind::Counter => MetricSnapshot::Counter { sum: 0.0 },
            MetricKind::Rate => MetricSnapshot::Rate { hits: 0, total: 0 },
            MetricKind::Trend => MetricSnapshot::Trend { samples: Vec::new() },
            MetricKind::Gauge => MetricSnapshot::Gauge { last: None },
        };
        let mut newest_gauge = 0u64;
        for shard in &self.shards {
            let shard = shard.read();
            for (key, series) in shard.iter() {
                if key.name != name || !tags_contain(&key.tags, filter) {
                    continue;
                }
                match (&mut snap, series) {
                    (MetricSnapshot::Counter { sum }, Series::Counter { sum: s }) => *sum += s,
                    (MetricSnapshot::Rate { hits, total }, Series::Rate { hits: h, total: t }) => {
                        *hits += h;
                        *total += t;
                    }
                    (MetricSnapshot::Trend { samples }, Series::Trend { samples: s }) => {
                        samples.extend_from_slice(s);
                    }
                    (MetricSnapshot::Gauge { last }, Series::Gauge { last: l, stamp }) => {
                        if last.is_none() || *stamp >= newest_gauge {
                            *last = Some(*l);
                            newest_gauge = *stamp;
                        }
                    }
                    _ => {}
                }
            }
        }
        if let MetricSnapshot::Trend { samples } = &mut snap {
            samples.sort_by(|a, b| a.total_cmp(b));
        }
        Some(snap)
    }

    /// Snapshot of every individual series, sorted by display name.
    pub fn snapshot_series(&self) -> Vec<(SeriesKey, MetricSnapshot)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (key, series) in shard.iter() {
                let snap = match series {
                    Series::Counter { sum } => MetricSnapshot::Counter { sum: *sum },
                    Series::Rate { hits, total } => {
                        MetricSnapshot::Rate { hits: *hits, total: *total }
                    }
                    Series::Trend { samples } => {
                        let mut samples = samples.clone();
                        samples.sort_by(|a, b| a.total_cmp(b));
                        MetricSnapshot::Trend { samples }
                    }
                    Series::Gauge { last, .. } => MetricSnapshot::Gauge { last: Some(*last) },
                };
                out.push((key.clone(), snap));
            }
        }
        out.sort_by(|a, b| a.0.display_name().cmp(&b.0.display_name()));
        out
    }
}

fn shard_index(key: &SeriesKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

fn tags_contain(tags: &Tags, filter: &Tags) -> bool {
    filter.iter().all(|(k, v)| tags.get(k) == Some(v))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Draining,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateReport {
    pub hits: u64,
    pub total: u64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
    pub abort_on_fail: bool,
}

/// Final structured report of one run. Emitted exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
    pub counters: BTreeMap<String, f64>,
    pub rates: BTreeMap<String, RateReport>,
    pub trends: BTreeMap<String, TrendReport>,
    pub gauges: BTreeMap<String, f64>,
    pub thresholds: Vec<ThresholdReport>,
}

impl RunReport {
    pub fn compile(
        registry: &MetricRegistry,
        status: RunStatus,
        abort_reason: Option<String>,
        started_at: DateTime<Utc>,
        duration_ms: u128,
        thresholds: Vec<ThresholdReport>,
    ) -> Self {
        let mut counters = BTreeMap::new();
        let mut rates = BTreeMap::new();
        let mut trends = BTreeMap::new();
        let mut gauges = BTreeMap::new();

        for (key, snap) in registry.snapshot_series() {
            let name = key.display_name();
            match &snap {
                MetricSnapshot::Counter { sum } => {
                    counters.insert(name, *sum);
                }
                MetricSnapshot::Rate { hits, total } => {
                    rates.insert(
                        name,
                        RateReport { hits: *hits, total: *total, ratio: snap.ratio() },
                    );
                }
                MetricSnapshot::Trend { samples } if !samples.is_empty() => {
                    trends.insert(
                        name,
                        TrendReport {
                            count: snap.count(),
                            avg: snap.avg().unwrap_or(0.0),
                            min: snap.min().unwrap_or(0.0),
                            max: snap.max().unwrap_or(0.0),
                            p90: snap.percentile(90.0).unwrap_or(0.0),
                            p95: snap.percentile(95.0).unwrap_or(0.0),
                            p99: snap.percentile(99.0).unwrap_or(0.0),
                        },
                    );
                }
                MetricSnapshot::Trend { .. } => {}
                MetricSnapshot::Gauge { last } => {
                    if let Some(v) = last {
                        gauges.insert(name, *v);
                    }
                }
            }
        }

        Self {
            status,
            abort_reason,
            started_at,
            duration_ms,
            counters,
            rates,
            trends,
            gauges,
            thresholds,
        }
    }

    /// True when every threshold passed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Plain-text summary on stdout.
    pub fn print(&self) {
        println!("\n--- Test Summary ---");
        println!(
            "Status: {}{}",
            match self.status {
                RunStatus::Completed => "completed",
                RunStatus::Aborted => "aborted",
                _ => "incomplete",
            },
            self.abort_reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        println!("Duration: {}ms", self.duration_ms);

        if !self.trends.is_empty() {
            println!("\nTrends:");
            for (name, t) in &self.trends {
                println!(
                    "  {}: avg={:.2} min={:.2} max={:.2} p95={:.2} count={}",
                    name, t.avg, t.min, t.max, t.p95, t.count
                );
            }
        }

        if !self.rates.is_empty() {
            println!("\nRates:");
            for (name, r) in &self.rates {
                if r.total > 0 {
                    println!("  {}: {:.2}% ({}/{})", name, r.ratio * 100.0, r.hits, r.total);
                } else {
                    println!("  {}: no data", name);
                }
            }
        }

        if !self.counters.is_empty() {
            println!("\nCounters:");
            for (name, val) in &self.counters {
                println!("  {}: {:.2}", name, val);
            }
        }

        if !self.gauges.is_empty() {
            println!("\nGauges:");
            for (name, val) in &self.gauges {
                println!("  {}: {:.2}", name, val);
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                match t.observed {
                    Some(v) => println!("  {} {} {} (observed: {:.4})", mark, t.metric, t.expression, v),
                    None => println!("  {} {} {}", mark, t.metric, t.expression),
                }
            }
        }

        println!("--------------------\n");
    }
}
