//! Read-only performance snapshot of the cache directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

use super::artifact::{self, Artifact};
use super::Tier;
use crate::utils::list_files_with_extension;
use crate::Result;

/// Cache-path latency reported when nothing has been measured yet.
pub const DEFAULT_CACHE_RESPONSE_TIME_MS: f64 = 50.0;

/// The heuristic hit rate saturates below this value.
const HIT_RATE_CEILING: f64 = 95.0;
/// Entry count at which the heuristic reaches half of 100%.
const HIT_RATE_HALF_POINT: f64 = 10.0;

/// In-process lookup counters kept by a [`super::CacheStore`].
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    hit_latency_nanos: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_hit(&self, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.hit_latency_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_computation(&self) {
        self.computations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Percentage of lookups served from the cache, if any lookup happened.
    pub fn hit_rate(&self) -> Option<f64> {
        let (hits, misses) = (self.hits(), self.misses());
        let total = hits + misses;
        (total > 0).then(|| hits as f64 / total as f64 * 100.0)
    }

    /// Mean latency of cache hits in milliseconds.
    pub fn avg_hit_latency_ms(&self) -> Option<f64> {
        let hits = self.hits();
        (hits > 0).then(|| self.hit_latency_nanos.load(Ordering::Relaxed) as f64 / hits as f64 / 1e6)
    }
}

/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub total_entries: usize,
    pub permanent_entries: usize,
    #[serde(rename = "cacheSize")]
    pub cache_size_bytes: u64,
    /// Saturating estimate from the entry count alone, see [`estimated_hit_rate`].
    #[serde(rename = "hitRate")]
    pub estimated_hit_rate: f64,
    #[serde(rename = "avgExecutionTime")]
    pub avg_execution_time_ms: f64,
    #[serde(rename = "avgCacheResponseTime")]
    pub avg_cache_response_time_ms: f64,
    /// Real hit ratio from in-process counters; `None` without counters or lookups.
    pub measured_hit_rate: Option<f64>,
    pub avg_access_count: f64,
    pub corrupt_entries: usize,
}

/// `min(95, n / (n + 10) * 100)`: a proxy, not a hit/miss ratio.
pub fn estimated_hit_rate(total_entries: usize) -> f64 {
    let n = total_entries as f64;
    (n / (n + HIT_RATE_HALF_POINT) * 100.0).min(HIT_RATE_CEILING)
}

#[derive(Default)]
struct TierScan {
    entries: usize,
    bytes: u64,
    execution_times: Vec<f64>,
    access_counts: Vec<u64>,
    corrupt: usize,
}

/// Scans both tiers of a cache root. Never fails: missing directories and
/// unreadable artifacts only lower the counts.
pub struct StatsAggregator {
    root: PathBuf,
    assumed_response_time_ms: f64,
    counters: Option<Arc<CacheCounters>>,
}

impl StatsAggregator {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            assumed_response_time_ms: DEFAULT_CACHE_RESPONSE_TIME_MS,
            counters: None,
        }
    }

    pub fn with_counters(mut self, counters: Arc<CacheCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_assumed_response_time(mut self, millis: f64) -> Self {
        self.assumed_response_time_ms = millis;
        self
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let temporary = self.scan_tier(Tier::Temporary);
        let permanent = self.scan_tier(Tier::Permanent);

        let total_entries = temporary.entries + permanent.entries;
        let execution_times: Vec<f64> = temporary
            .execution_times
            .iter()
            .chain(&permanent.execution_times)
            .copied()
            .collect();
        let access_counts: Vec<f64> = temporary
            .access_counts
            .iter()
            .chain(&permanent.access_counts)
            .map(|&c| c as f64)
            .collect();

        let measured_latency = self.counters.as_ref().and_then(|c| c.avg_hit_latency_ms());

        CacheStatsSnapshot {
            total_entries,
            permanent_entries: permanent.entries,
            cache_size_bytes: temporary.bytes + permanent.bytes,
            estimated_hit_rate: estimated_hit_rate(total_entries),
            avg_execution_time_ms: mean(&execution_times),
            avg_cache_response_time_ms: measured_latency.unwrap_or(self.assumed_response_time_ms),
            measured_hit_rate: self.counters.as_ref().and_then(|c| c.hit_rate()),
            avg_access_count: mean(&access_counts),
            corrupt_entries: temporary.corrupt + permanent.corrupt,
        }
    }

    fn scan_tier(&self, tier: Tier) -> TierScan {
        let dir = self.root.join(tier.dir_name());
        let files = match list_files_with_extension(&dir, "json") {
            | Ok(files) => files,
            | Err(e) => {
                warn!("Cannot list {} tier at {}: {}", tier, dir.display(), e);
                return TierScan::default();
            }
        };

        let decoded: Vec<Result<Artifact>> = files
            .par_iter()
            .map(|path| fs::read(path).map_err(Into::into).and_then(|bytes| artifact::decode(&bytes)))
            .collect();

        let mut scan = TierScan::default();
        for (path, outcome) in files.iter().zip(decoded) {
            match outcome {
                | Ok(artifact) => {
                    scan.entries += 1;
                    scan.bytes += artifact.size_bytes;
                    scan.execution_times.extend(artifact.execution_time_ms);
                    scan.access_counts.extend(artifact.access_count);
                }
                | Err(e) => {
                    debug!("Skipping {} in stats scan: {}", path.display(), e);
                    scan.corrupt += 1;
                }
            }
        }
        if scan.corrupt > 0 {
            warn!("{} unreadable artifacts skipped in {} tier", scan.corrupt, tier);
        }
        scan
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}
