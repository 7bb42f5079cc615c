//! Prometheus instruments for the deduplicator.

use crate::DedupConfig;
use parking_lot::Mutex;
use prometheus::{Gauge, IntCounter, Opts, Registry};
use std::time::{Duration, Instant};

/// Metrics reported by the deduplicator.
///
/// | Metric | Type | Description |
/// |--------|------|-------------|
/// | `events_with_disparate_signature` | Counter | Events matching a known descriptor with a new signature |
/// | `dup_ev_per_sec` | Gauge | Duplicate events per second |
/// | `dup_ev_percent` | Gauge | Running average of the duplicate percentage (0 to 100) |
pub struct DedupMetrics {
    disparate_signatures: IntCounter,
    duplicates_per_second: Gauge,
    duplicate_percent: Gauge,
    average: Mutex<RunningAverage>,
    rate: Mutex<CountPerSecond>,
}

impl DedupMetrics {
    /// Create the instruments and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn new(registry: &Registry, config: &DedupConfig) -> prometheus::Result<Self> {
        let metrics = Self::unregistered(config)?;
        registry.register(Box::new(metrics.disparate_signatures.clone()))?;
        registry.register(Box::new(metrics.duplicates_per_second.clone()))?;
        registry.register(Box::new(metrics.duplicate_percent.clone()))?;
        Ok(metrics)
    }

    /// Create the instruments without registering them anywhere.
    pub fn unregistered(config: &DedupConfig) -> prometheus::Result<Self> {
        let disparate_signatures = IntCounter::with_opts(Opts::new(
            "events_with_disparate_signature",
            "Events received that match a descriptor of a previous event, but with a different signature",
        ))?;
        let duplicates_per_second = Gauge::with_opts(Opts::new(
            "dup_ev_per_sec",
            "Number of events received per second that are already known",
        ))?;
        let duplicate_percent = Gauge::with_opts(Opts::new(
            "dup_ev_percent",
            "Percentage of events received that are already known",
        ))?;

        Ok(Self {
            disparate_signatures,
            duplicates_per_second,
            duplicate_percent,
            average: Mutex::new(RunningAverage::new(config.duplicate_average_half_life)),
            rate: Mutex::new(CountPerSecond::new(config.rate_window, Instant::now())),
        })
    }

    /// A never-seen event was accepted.
    pub(crate) fn record_novel(&self) {
        self.update_average(0.0);
    }

    /// An event that was already known was dropped.
    pub(crate) fn record_duplicate(&self) {
        let rate = self.rate.lock().count(Instant::now());
        self.duplicates_per_second.set(rate);
        self.update_average(100.0);
    }

    /// An ancient event was dropped.
    pub(crate) fn record_ancient(&self) {
        self.update_average(100.0);
    }

    pub(crate) fn record_disparate_signature(&self) {
        self.disparate_signatures.inc();
    }

    /// Roll the per-second rate forward without counting anything, so the
    /// gauge decays when duplicates stop arriving.
    pub fn refresh(&self) {
        let rate = self.rate.lock().rate(Instant::now());
        self.duplicates_per_second.set(rate);
    }

    /// Total events seen with a disparate signature.
    pub fn disparate_signatures(&self) -> u64 {
        self.disparate_signatures.get()
    }

    /// Current running duplicate percentage.
    pub fn duplicate_percent(&self) -> f64 {
        self.duplicate_percent.get()
    }

    /// Last published duplicates-per-second rate.
    pub fn duplicates_per_second(&self) -> f64 {
        self.duplicates_per_second.get()
    }

    fn update_average(&self, sample: f64) {
        let value = self.average.lock().update(sample);
        self.duplicate_percent.set(value);
    }
}

impl std::fmt::Debug for DedupMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupMetrics")
            .field("disparate_signatures", &self.disparate_signatures())
            .field("duplicates_per_second", &self.duplicates_per_second())
            .field("duplicate_percent", &self.duplicate_percent())
            .finish()
    }
}

/// Exponentially weighted running average parameterised by half life.
///
/// After `half_life` further samples, a sample's weight has halved. The
/// first sample initialises the average.
#[derive(Debug, Clone)]
pub(crate) struct RunningAverage {
    alpha: f64,
    value: Option<f64>,
}

impl RunningAverage {
    pub(crate) fn new(half_life: f64) -> Self {
        let alpha = if half_life > 0.0 {
            1.0 - 0.5f64.powf(1.0 / half_life)
        } else {
            1.0
        };
        Self { alpha, value: None }
    }

    pub(crate) fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(current) => current + self.alpha * (sample - current),
        };
        self.value = Some(next);
        next
    }
}

/// Counts events over consecutive windows and reports the rate of the last
/// complete window.
#[derive(Debug, Clone)]
pub(crate) struct CountPerSecond {
    window: Duration,
    started: Instant,
    count: u64,
    rate: f64,
}

impl CountPerSecond {
    pub(crate) fn new(window: Duration, now: Instant) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            started: now,
            count: 0,
            rate: 0.0,
        }
    }

    /// Count one event and return the current rate.
    pub(crate) fn count(&mut self, now: Instant) -> f64 {
        self.roll(now);
        self.count += 1;
        self.rate
    }

    pub(crate) fn rate(&mut self, now: Instant) -> f64 {
        self.roll(now);
        self.rate
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.window {
            self.rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.started = now;
        }
    }
}
