//! End-to-end flow: sweep, cache, result store, dashboard queries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sweepcache::backtest::cache::{CacheOptions, CacheStore, StatsAggregator, Tier};
use sweepcache::backtest::sweep::{SweepGrid, SweepRunner};
use sweepcache::backtest::{fingerprint, BacktestParameters, BacktestResult, ParameterSet};
use sweepcache::dashboard::{default_filter_options, FilterQueryEngine};
use sweepcache::persistence::{MetricField, ResultStore, RunFilter, SqliteResultStore, ValueRange};
use tempfile::tempdir;

fn grid() -> SweepGrid {
    SweepGrid {
        assets: vec!["ETH".into(), "SOL".into()],
        strategies: vec!["momentum".into(), "contrarian".into()],
        leverages: vec![4, 2, 8],
        threshold_pairs: vec![(20.0, 80.0), (30.0, 70.0)],
        timeframe: "1h".into(),
        max_position_ratio: 0.5,
        date_range: None,
    }
}

async fn simulated_backtest(params: BacktestParameters) -> anyhow::Result<BacktestResult> {
    let leverage = f64::from(params.leverage());
    Ok(BacktestResult {
        execution_time_ms: 500.0 + leverage * 10.0,
        sharpe_ratio: 2.0 - leverage / 4.0,
        max_drawdown: -(leverage * 2.5),
        win_rate: params.high_threshold() - params.low_threshold(),
        time_in_market: 40.0,
        num_trades: (leverage as u64) * 10,
        fees: -leverage * 12.0,
        funding: 3.0,
        total_return: 100.0 / leverage,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_sweep_feeds_stats_and_filters() {
    let dir = tempdir().unwrap();
    let cache = CacheStore::open(dir.path().join("cache"), CacheOptions::default()).unwrap();
    let results = Arc::new(SqliteResultStore::open(Some(dir.path().join("runs.db"))).await.unwrap());
    let runner = SweepRunner::new(cache.clone(), results.clone()).with_concurrency(4);

    let report = runner.run(&grid(), simulated_backtest).await.unwrap();
    assert_eq!(report.computed, 24);
    assert_eq!(report.failed, 0);
    assert_eq!(results.count().await.unwrap(), 24);

    let stats = StatsAggregator::new(cache.root()).with_counters(cache.counters()).snapshot();
    assert_eq!(stats.total_entries, 24);
    assert_eq!(stats.permanent_entries, 0);
    assert_eq!(stats.cache_size_bytes, cache.size_bytes());
    // leverages 2, 4, 8 → 520, 540, 580 ms
    assert!((stats.avg_execution_time_ms - 1640.0 / 3.0).abs() < 1e-6);
    assert_eq!(stats.measured_hit_rate, Some(0.0));

    let response = FilterQueryEngine::new(results.clone()).filter_options().await;
    assert!(response.success);
    let options = response.options;
    assert_eq!(options.assets, vec!["ETH".to_string(), "SOL".to_string()]);
    assert_eq!(options.strategies, vec!["contrarian".to_string(), "momentum".to_string()]);
    assert_eq!(options.leverages, vec![2, 4, 8]);
    assert_eq!(options.threshold_ranges.len(), 2);
    assert_eq!(options.ranges.drawdown, ValueRange::new(5.0, 20.0));
    assert_eq!(options.ranges.trades, ValueRange::new(20.0, 80.0));
    assert_ne!(options, default_filter_options());

    let mut filter = RunFilter { leverages: vec![8], ..Default::default() };
    filter.ranges.insert(MetricField::WinRate, ValueRange::new(50.0, 100.0));
    let rows = results.query_runs(&filter).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.leverage == 8 && r.win_rate == 60.0));
}

#[tokio::test]
async fn test_rerun_after_promotion_hits_permanent_tier() {
    let dir = tempdir().unwrap();
    let cache = CacheStore::open(dir.path(), CacheOptions::default()).unwrap();
    let results = Arc::new(SqliteResultStore::in_memory().unwrap());
    let runner = SweepRunner::new(cache.clone(), results.clone());

    let mut small = grid();
    small.assets.truncate(1);
    small.strategies.truncate(1);
    small.leverages.truncate(1);
    small.threshold_pairs.truncate(1);
    runner.run(&small, simulated_backtest).await.unwrap();

    let fp = fingerprint(&ParameterSet {
        asset: Some("eth".into()),
        strategy: Some("Momentum".into()),
        leverage: Some(4),
        low_threshold: Some(20.0),
        high_threshold: Some(80.0),
        timeframe: Some("1H".into()),
        max_position_ratio: Some(0.5),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(cache.promote(&fp).unwrap().tier, Tier::Permanent);

    // the temporary copy going away does not lose the result
    assert_eq!(cache.clear_temporary().unwrap(), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let report = runner
        .run(&small, move |params| {
            counted.fetch_add(1, Ordering::SeqCst);
            simulated_backtest(params)
        })
        .await
        .unwrap();
    assert_eq!(report.cached, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(results.count().await.unwrap(), 1);

    let entry = cache.get(&fp, None).unwrap().unwrap();
    assert_eq!(entry.tier, Tier::Permanent);
    assert_eq!(entry.access_count, 1);
}
