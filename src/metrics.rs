//! Tick and snapshot metrics
//!
//! Rolling aggregates cover the last N ticks; per-system and per-command
//! timings are retained for the last completed tick only.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-capacity ring of duration samples for rolling aggregates.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: Vec<Duration>,
    capacity: usize,
    index: usize,
    last: Option<Duration>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            index: 0,
            last: None,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.index] = sample;
        }
        self.index = (self.index + 1) % self.capacity;
        self.last = Some(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }

    pub fn min_max(&self) -> (Duration, Duration) {
        if self.samples.is_empty() {
            return (Duration::ZERO, Duration::ZERO);
        }
        let min = *self.samples.iter().min().unwrap();
        let max = *self.samples.iter().max().unwrap();
        (min, max)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.index = 0;
        self.last = None;
    }
}

/// One system's timing within a tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTiming {
    pub system: String,
    pub nanos: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One command's timing within a tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTiming {
    pub command: String,
    pub nanos: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full record of the last completed tick
#[derive(Debug, Clone, Default)]
pub struct TickRecord {
    pub tick: u64,
    pub total: Duration,
    pub systems: Vec<SystemTiming>,
    pub ais: Vec<SystemTiming>,
    pub commands: Vec<CommandTiming>,
    /// Commands dropped at drain time (e.g. deleted match)
    pub skipped_commands: u64,
}

/// Rolling tick aggregates in both milliseconds and nanoseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickMetricsSummary {
    pub window_len: usize,
    pub total_ticks: u64,
    pub min_ns: u64,
    pub avg_ns: u64,
    pub max_ns: u64,
    pub last_ns: u64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
    pub overruns: u64,
    pub budget_warnings: u64,
}

/// Per-container tick metrics.
#[derive(Debug)]
pub struct TickMetrics {
    window: RollingWindow,
    last: Option<TickRecord>,
    total_ticks: u64,
    overruns: u64,
    budget_warnings: u64,
}

impl TickMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            window: RollingWindow::new(window),
            last: None,
            total_ticks: 0,
            overruns: 0,
            budget_warnings: 0,
        }
    }

    pub fn record(&mut self, record: TickRecord) {
        self.window.push(record.total);
        self.total_ticks += 1;
        self.last = Some(record);
    }

    /// Auto-advance fired late enough that ticks were dropped.
    pub fn record_overrun(&mut self) {
        self.overruns += 1;
    }

    /// Tick exceeded the soft wall-clock budget.
    pub fn record_budget_warning(&mut self) {
        self.budget_warnings += 1;
    }

    /// Per-system and per-command detail of the last completed tick.
    pub fn last_tick(&self) -> Option<&TickRecord> {
        self.last.as_ref()
    }

    pub fn summary(&self) -> TickMetricsSummary {
        let (min, max) = self.window.min_max();
        let avg = self.window.average();
        let last = self.window.last().unwrap_or(Duration::ZERO);
        TickMetricsSummary {
            window_len: self.window.len(),
            total_ticks: self.total_ticks,
            min_ns: min.as_nanos() as u64,
            avg_ns: avg.as_nanos() as u64,
            max_ns: max.as_nanos() as u64,
            last_ns: last.as_nanos() as u64,
            min_ms: min.as_secs_f64() * 1000.0,
            avg_ms: avg.as_secs_f64() * 1000.0,
            max_ms: max.as_secs_f64() * 1000.0,
            last_ms: last.as_secs_f64() * 1000.0,
            overruns: self.overruns,
            budget_warnings: self.budget_warnings,
        }
    }

    /// Clear the rolling window and counters; the tick counter itself is
    /// owned by the container and unaffected.
    pub fn reset(&mut self) {
        self.window.clear();
        self.last = None;
        self.total_ticks = 0;
        self.overruns = 0;
        self.budget_warnings = 0;
    }
}

/// Snapshot engine counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetricsSummary {
    pub total_generations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub incremental_updates: u64,
    pub full_rebuilds: u64,
    pub avg_generation_ms: f64,
    pub last_generation_ms: f64,
    pub max_generation_ms: f64,
    pub cache_hit_rate: f64,
    pub incremental_rate: f64,
}

#[derive(Debug)]
pub struct SnapshotMetrics {
    generations: RollingWindow,
    total_generations: u64,
    cache_hits: u64,
    cache_misses: u64,
    incremental_updates: u64,
    full_rebuilds: u64,
}

impl SnapshotMetrics {
    pub fn new() -> Self {
        Self {
            generations: RollingWindow::new(256),
            total_generations: 0,
            cache_hits: 0,
            cache_misses: 0,
            incremental_updates: 0,
            full_rebuilds: 0,
        }
    }

    pub fn record_generation(&mut self, elapsed: Duration) {
        self.generations.push(elapsed);
        self.total_generations += 1;
    }

    pub fn record_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn record_incremental(&mut self) {
        self.incremental_updates += 1;
    }

    pub fn record_full_rebuild(&mut self) {
        self.full_rebuilds += 1;
    }

    pub fn summary(&self) -> SnapshotMetricsSummary {
        let (_, max) = self.generations.min_max();
        let lookups = self.cache_hits + self.cache_misses;
        let updates = self.incremental_updates + self.full_rebuilds;
        SnapshotMetricsSummary {
            total_generations: self.total_generations,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            incremental_updates: self.incremental_updates,
            full_rebuilds: self.full_rebuilds,
            avg_generation_ms: self.generations.average().as_secs_f64() * 1000.0,
            last_generation_ms: self
                .generations
                .last()
                .unwrap_or(Duration::ZERO)
                .as_secs_f64()
                * 1000.0,
            max_generation_ms: max.as_secs_f64() * 1000.0,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                self.cache_hits as f64 / lookups as f64
            },
            incremental_rate: if updates == 0 {
                0.0
            } else {
                self.incremental_updates as f64 / updates as f64
            },
        }
    }
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        Self::new()
    }
}
