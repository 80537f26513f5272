//! Parameter sweeps: expand a grid, run every combination through the cache,
//! and record freshly computed runs in the result store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use super::cache::CacheStore;
use super::{BacktestParameters, BacktestResult, DateRange, Fingerprint, ParameterSet};
use crate::persistence::{ResultRow, ResultStore};
use crate::{Error, Result};

/// Combinations evaluated at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Cross product of sweep dimensions. Timeframe, position ratio and date
/// range are shared by every combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepGrid {
    pub assets: Vec<String>,
    pub strategies: Vec<String>,
    pub leverages: Vec<i64>,
    /// (low, high) threshold percentiles
    pub threshold_pairs: Vec<(f64, f64)>,
    pub timeframe: String,
    pub max_position_ratio: f64,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

impl SweepGrid {
    /// Validated combinations in grid order, one per distinct fingerprint.
    ///
    /// Fails on the first invalid combination, before anything runs.
    pub fn combinations(&self) -> Result<Vec<BacktestParameters>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for asset in &self.assets {
            for strategy in &self.strategies {
                for &leverage in &self.leverages {
                    for &(low, high) in &self.threshold_pairs {
                        let raw = ParameterSet {
                            asset: Some(asset.clone()),
                            strategy: Some(strategy.clone()),
                            leverage: Some(leverage),
                            low_threshold: Some(low),
                            high_threshold: Some(high),
                            timeframe: Some(self.timeframe.clone()),
                            max_position_ratio: Some(self.max_position_ratio),
                            start_date: self.date_range.map(|r| r.start),
                            end_date: self.date_range.map(|r| r.end),
                        };
                        let params = BacktestParameters::new(&raw).map_err(|e| match e {
                            | Error::Validation(msg) => Error::Validation(format!(
                                "{asset}/{strategy}/{leverage}x/{low}-{high}: {msg}"
                            )),
                            | other => other,
                        })?;
                        if seen.insert(params.fingerprint()) {
                            out.push(params);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub fingerprint: Fingerprint,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub computed: usize,
    pub cached: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

enum RunOutcome {
    Computed,
    Cached,
}

/// Drives a sweep through the cache and the result store.
pub struct SweepRunner {
    cache: CacheStore,
    results: Arc<dyn ResultStore>,
    concurrency: usize,
}

impl SweepRunner {
    pub fn new(cache: CacheStore, results: Arc<dyn ResultStore>) -> Self {
        Self { cache, results, concurrency: DEFAULT_CONCURRENCY }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Evaluate every combination of `grid` with `backtest`, at most once per
    /// fingerprint across all callers sharing the cache.
    ///
    /// Individual failures are collected in the report; only an invalid grid
    /// fails the whole sweep.
    pub async fn run<B, Fut>(&self, grid: &SweepGrid, backtest: B) -> Result<SweepReport>
    where
        B: Fn(BacktestParameters) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = anyhow::Result<BacktestResult>> + Send + 'static,
    {
        let combinations = grid.combinations()?;
        let total = combinations.len();
        info!("Sweep: running {} combinations ({} workers)", total, self.concurrency);
        let started = Instant::now();

        let outcomes: Vec<(Fingerprint, Result<RunOutcome>)> = stream::iter(combinations)
            .map(|params| {
                let backtest = backtest.clone();
                async move {
                    let fingerprint = params.fingerprint();
                    let outcome = self.run_one(&fingerprint, params, backtest).await;
                    (fingerprint, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (fingerprint, outcome) in outcomes {
            match outcome {
                | Ok(RunOutcome::Computed) => report.computed += 1,
                | Ok(RunOutcome::Cached) => report.cached += 1,
                | Err(e) => {
                    warn!("Sweep: {} failed: {}", fingerprint, e);
                    report.failed += 1;
                    report.failures.push(SweepFailure { fingerprint, error: e.to_string() });
                }
            }
        }
        info!(
            "Sweep: {} computed, {} cached, {} failed in {:?}",
            report.computed,
            report.cached,
            report.failed,
            started.elapsed()
        );
        Ok(report)
    }

    async fn run_one<B, Fut>(
        &self,
        fingerprint: &Fingerprint,
        params: BacktestParameters,
        backtest: B,
    ) -> Result<RunOutcome>
    where
        B: Fn(BacktestParameters) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<BacktestResult>> + Send + 'static,
    {
        // set only if this call's computation actually ran
        let computed = Arc::new(AtomicBool::new(false));
        let flag = computed.clone();
        let input = params.clone();
        let entry = self
            .cache
            .compute_or_get(fingerprint, move || {
                flag.store(true, Ordering::SeqCst);
                backtest(input)
            })
            .await?;

        if !computed.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Cached);
        }
        let row = ResultRow::from_run(fingerprint, &params, &entry.result);
        if let Err(e) = self.results.append(&row).await {
            error!("Sweep: {} is cached but its run was not recorded: {}", fingerprint, e);
            return Err(e);
        }
        Ok(RunOutcome::Computed)
    }
}
