//! Cache Maintenance Background Task
//!
//! Periodically removes expired unobserved entries (garbage collection) and
//! samples memory pressure to evict entries when the cache grows too large.
//!
//! # Configuration
//!
//! ```rust
//! use stoop_storage::cache::MaintenanceConfig;
//! use std::time::Duration;
//!
//! let config = MaintenanceConfig {
//!     gc_interval: Duration::from_secs(60),     // Collect expired entries every minute
//!     sample_interval: Duration::from_secs(30), // Sample memory every 30 seconds
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stoop_core::{CacheConfig, MemoryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::eviction::{Evictor, PressureLevel};
use super::store::CacheStore;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Intervals for the maintenance task.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// How often to collect expired entries (default: 60 seconds)
    pub gc_interval: Duration,

    /// How often to sample memory pressure (default: 30 seconds)
    pub sample_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from_sections(&CacheConfig::default(), &MemoryConfig::default())
    }
}

impl MaintenanceConfig {
    /// Build from the cache and memory sections of the sync config.
    pub fn from_sections(cache: &CacheConfig, memory: &MemoryConfig) -> Self {
        Self {
            gc_interval: cache.gc_interval(),
            sample_interval: memory.sample_interval(),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for maintenance activity.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    /// Total entries removed by garbage collection
    pub entries_collected: AtomicU64,

    /// Total entries evicted under memory pressure
    pub entries_evicted: AtomicU64,

    /// Total memory samples taken
    pub samples: AtomicU64,

    /// Samples that hit the critical threshold
    pub critical_samples: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            entries_collected: self.entries_collected.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            critical_samples: self.critical_samples.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub entries_collected: u64,
    pub entries_evicted: u64,
    pub samples: u64,
    pub critical_samples: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run garbage collection and memory sampling until shutdown is signalled.
///
/// The first tick of each interval fires immediately, so a cycle runs as
/// soon as the task starts.
pub async fn maintenance_task(
    store: Arc<CacheStore>,
    evictor: Arc<Evictor>,
    config: MaintenanceConfig,
    metrics: Arc<MaintenanceMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut gc_interval = interval(config.gc_interval);
    gc_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sample_interval = interval(config.sample_interval);
    sample_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        gc_interval_ms = config.gc_interval.as_millis() as u64,
        sample_interval_ms = config.sample_interval.as_millis() as u64,
        "Cache maintenance task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache maintenance task shutting down");
                    break;
                }
            }

            _ = gc_interval.tick() => {
                let removed = store.collect_garbage();
                if !removed.is_empty() {
                    metrics
                        .entries_collected
                        .fetch_add(removed.len() as u64, Ordering::Relaxed);
                } else {
                    tracing::trace!("GC cycle completed with no expired entries");
                }
            }

            _ = sample_interval.tick() => {
                let report = evictor.run_cycle();
                metrics.samples.fetch_add(1, Ordering::Relaxed);
                if report.level == PressureLevel::Critical {
                    metrics.critical_samples.fetch_add(1, Ordering::Relaxed);
                }
                metrics
                    .entries_evicted
                    .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        entries_collected = snapshot.entries_collected,
        entries_evicted = snapshot.entries_evicted,
        samples = snapshot.samples,
        "Cache maintenance task completed"
    );
}

/// Spawn [`maintenance_task`] on the current runtime.
pub fn spawn_maintenance(
    store: Arc<CacheStore>,
    evictor: Arc<Evictor>,
    config: MaintenanceConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> (JoinHandle<()>, Arc<MaintenanceMetrics>) {
    let metrics = Arc::new(MaintenanceMetrics::new());
    let handle = tokio::spawn(maintenance_task(
        store,
        evictor,
        config,
        Arc::clone(&metrics),
        shutdown_rx,
    ));
    (handle, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stoop_core::{query_key, ManualClock};

    #[test]
    fn test_config_from_sections() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.gc_interval, Duration::from_secs(60));
        assert_eq!(config.sample_interval, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_collects_expired_entries_and_stops_on_shutdown() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(CacheStore::new(
            CacheConfig::default(),
            Arc::new(clock.clone()),
        ));
        store.set(&query_key!["expired"], json!([]));
        clock.advance(Duration::from_secs(301));
        store.set(&query_key!["recent"], json!([]));

        let evictor = Arc::new(Evictor::with_footprint_probe(
            Arc::clone(&store),
            MemoryConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, metrics) = spawn_maintenance(
            Arc::clone(&store),
            evictor,
            MaintenanceConfig {
                gc_interval: Duration::from_millis(100),
                sample_interval: Duration::from_millis(100),
            },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!store.contains(&query_key!["expired"]));
        assert!(store.contains(&query_key!["recent"]));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.entries_collected, 1);
        assert!(snapshot.samples >= 1);
        assert_eq!(snapshot.entries_evicted, 0);
    }
}
