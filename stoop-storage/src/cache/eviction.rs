//! Memory pressure sampling and cache eviction.
//!
//! The evictor samples a [`MemoryProbe`] and, depending on the pressure
//! level, removes unobserved entries from the cache. Entries with live
//! subscribers are never evicted.

use std::sync::Arc;

use stoop_core::{add_duration, CacheEntry, MemoryConfig, QueryKey, SharedClock, Timestamp};
use tracing::{debug, info, warn};

use super::store::CacheStore;

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub timestamp: Timestamp,
}

impl MemorySample {
    pub fn new(used_bytes: u64, total_bytes: u64, timestamp: Timestamp) -> Self {
        let percentage = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };
        Self {
            used_bytes,
            total_bytes,
            percentage,
            timestamp,
        }
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Measures the cache's own footprint against a fixed byte budget.
pub struct CacheFootprintProbe {
    store: Arc<CacheStore>,
    budget_bytes: u64,
}

impl CacheFootprintProbe {
    pub fn new(store: Arc<CacheStore>, budget_bytes: u64) -> Self {
        Self {
            store,
            budget_bytes,
        }
    }
}

impl MemoryProbe for CacheFootprintProbe {
    fn sample(&self) -> MemorySample {
        MemorySample::new(self.store.total_bytes(), self.budget_bytes, self.store.now())
    }
}

/// Pressure classification of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::Critical => "critical",
        }
    }
}

/// What one eviction cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionReport {
    pub level: PressureLevel,
    pub before: MemorySample,
    pub after: MemorySample,
    /// Evicted keys in eviction order.
    pub evicted: Vec<QueryKey>,
}

/// Evicts cache entries under memory pressure.
pub struct Evictor {
    store: Arc<CacheStore>,
    probe: Arc<dyn MemoryProbe>,
    config: MemoryConfig,
    clock: SharedClock,
}

impl Evictor {
    pub fn new(store: Arc<CacheStore>, probe: Arc<dyn MemoryProbe>, config: MemoryConfig) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            probe,
            config,
            clock,
        }
    }

    /// Evictor sampling the cache footprint against `config.budget_bytes`.
    pub fn with_footprint_probe(store: Arc<CacheStore>, config: MemoryConfig) -> Self {
        let probe = Arc::new(CacheFootprintProbe::new(
            Arc::clone(&store),
            config.budget_bytes,
        ));
        Self::new(store, probe, config)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn classify(&self, sample: &MemorySample) -> PressureLevel {
        if sample.percentage >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if sample.percentage >= self.config.pressure_threshold {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    /// Sample once and clean up according to the pressure level.
    pub fn run_cycle(&self) -> EvictionReport {
        let before = self.probe.sample();
        let level = self.classify(&before);
        let evicted = match level {
            PressureLevel::Normal => Vec::new(),
            PressureLevel::Elevated => self.evict_idle(),
            PressureLevel::Critical => self.evict_until_below_critical(),
        };
        let after = if evicted.is_empty() {
            before
        } else {
            self.probe.sample()
        };

        if !evicted.is_empty() {
            info!(
                level = level.as_str(),
                before_pct = before.percentage,
                after_pct = after.percentage,
                evicted = evicted.len(),
                "Evicted cache entries under memory pressure"
            );
        } else if level == PressureLevel::Critical {
            warn!(
                pct = before.percentage,
                "Memory critical but every entry is observed"
            );
        } else {
            debug!(level = level.as_str(), pct = before.percentage, "Memory sample");
        }

        EvictionReport {
            level,
            before,
            after,
            evicted,
        }
    }

    /// Unobserved entries, least recently accessed first.
    fn candidates(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .store
            .entries()
            .into_iter()
            .filter(|entry| entry.subscriber_count == 0)
            .collect();
        entries.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.key.cmp(&b.key))
        });
        entries
    }

    fn evict_idle(&self) -> Vec<QueryKey> {
        let now = self.clock.now();
        self.candidates()
            .into_iter()
            .filter(|entry| add_duration(entry.last_accessed, self.config.idle_cutoff()) < now)
            .filter(|entry| self.store.evict(&entry.key))
            .map(|entry| entry.key)
            .collect()
    }

    fn evict_until_below_critical(&self) -> Vec<QueryKey> {
        let mut evicted = Vec::new();
        for entry in self.candidates() {
            if self.store.evict(&entry.key) {
                evicted.push(entry.key);
            }
            if self.probe.sample().percentage < self.config.critical_threshold {
                break;
            }
        }
        evicted
    }
}
