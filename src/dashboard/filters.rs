//! Filter options for the dashboard's multi-selects and range sliders.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::persistence::{DistinctField, FieldValue, MetricField, ResultStore, ThresholdPair, ValueRange};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRanges {
    pub sharpe_ratio: ValueRange,
    /// Magnitude, not the signed stored value.
    pub drawdown: ValueRange,
    pub win_rate: ValueRange,
    pub time_in_market: ValueRange,
    pub trades: ValueRange,
    pub fees: ValueRange,
    pub funding: ValueRange,
    pub total_return: ValueRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub assets: Vec<String>,
    pub strategies: Vec<String>,
    pub leverages: Vec<u32>,
    pub threshold_ranges: Vec<ThresholdPair>,
    pub ranges: MetricRanges,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterOptionsResponse {
    pub success: bool,
    pub options: FilterOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FilterOptionsResponse {
    fn ok(options: FilterOptions) -> Self {
        Self { success: true, options, error: None }
    }

    fn fallback(reason: String) -> Self {
        Self { success: false, options: default_filter_options(), error: Some(reason) }
    }
}

/// Fixed option set served whenever the result store cannot answer.
pub fn default_filter_options() -> FilterOptions {
    FilterOptions {
        assets: vec!["ETH".into(), "BTC".into(), "SOL".into()],
        strategies: vec!["momentum".into(), "contrarian".into()],
        leverages: (1..=10).collect(),
        threshold_ranges: Vec::new(),
        ranges: MetricRanges {
            sharpe_ratio: ValueRange::new(-2.0, 5.0),
            drawdown: ValueRange::new(0.0, 100.0),
            win_rate: ValueRange::new(0.0, 100.0),
            time_in_market: ValueRange::new(0.0, 100.0),
            trades: ValueRange::new(0.0, 1000.0),
            fees: ValueRange::new(-10_000.0, 0.0),
            funding: ValueRange::new(-10_000.0, 10_000.0),
            total_return: ValueRange::new(-100.0, 5000.0),
        },
    }
}

/// Drawdown is stored signed-negative; report it as a magnitude range.
///
/// Rows written with a positive drawdown are read as magnitudes already. A
/// range straddling zero covers every magnitude up to the larger side.
pub fn drawdown_magnitude(stored: ValueRange) -> ValueRange {
    if stored.max <= 0.0 {
        ValueRange { min: stored.max.abs(), max: stored.min.abs() }
    } else if stored.min >= 0.0 {
        stored
    } else {
        ValueRange { min: 0.0, max: stored.min.abs().max(stored.max) }
    }
}

struct CachedOptions {
    at: Instant,
    options: FilterOptions,
}

/// Builds [`FilterOptions`] from a result store, never failing outright.
pub struct FilterQueryEngine {
    store: Arc<dyn ResultStore>,
    ttl: Option<Duration>,
    cached: RwLock<Option<CachedOptions>>,
}

impl FilterQueryEngine {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store, ttl: None, cached: RwLock::new(None) }
    }

    /// Reuse a successful response for `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub async fn filter_options(&self) -> FilterOptionsResponse {
        if let Some(ttl) = self.ttl {
            if let Some(cached) = self.cached.read().await.as_ref() {
                if cached.at.elapsed() < ttl {
                    debug!("Serving cached filter options");
                    return FilterOptionsResponse::ok(cached.options.clone());
                }
            }
        }

        match self.load().await {
            | Ok(Some(options)) => {
                if self.ttl.is_some() {
                    *self.cached.write().await =
                        Some(CachedOptions { at: Instant::now(), options: options.clone() });
                }
                FilterOptionsResponse::ok(options)
            }
            | Ok(None) => {
                warn!("Result store is empty, serving default filter options");
                FilterOptionsResponse::fallback("result store is empty".into())
            }
            | Err(e) => {
                warn!("Filter query failed, serving default filter options: {}", e);
                FilterOptionsResponse::fallback(e.to_string())
            }
        }
    }

    async fn load(&self) -> Result<Option<FilterOptions>> {
        if self.store.count().await? == 0 {
            return Ok(None);
        }

        let store = &self.store;
        let (assets, strategies, leverages, mut pairs, ranges) = futures::try_join!(
            store.query_distinct(DistinctField::Asset),
            store.query_distinct(DistinctField::Strategy),
            store.query_distinct(DistinctField::Leverage),
            store.distinct_threshold_pairs(),
            store.query_ranges(&MetricField::FILTERABLE),
        )?;

        let mut leverages: Vec<u32> = leverages
            .into_iter()
            .filter_map(|v| match v {
                | FieldValue::Integer(i) => u32::try_from(i).ok(),
                | FieldValue::Real(f) if f.fract() == 0.0 && f >= 0.0 => Some(f as u32),
                | _ => None,
            })
            .collect();
        leverages.sort_unstable();
        leverages.dedup();

        pairs.sort_by(|a, b| a.short.total_cmp(&b.short).then(a.long.total_cmp(&b.long)));
        pairs.dedup();

        let defaults = default_filter_options().ranges;
        let range = |field: MetricField, fallback: ValueRange| ranges.get(&field).copied().unwrap_or(fallback);

        Ok(Some(FilterOptions {
            assets: texts(assets),
            strategies: texts(strategies),
            leverages,
            threshold_ranges: pairs,
            ranges: MetricRanges {
                sharpe_ratio: range(MetricField::SharpeRatio, defaults.sharpe_ratio),
                drawdown: ranges
                    .get(&MetricField::MaxDrawdown)
                    .copied()
                    .map(drawdown_magnitude)
                    .unwrap_or(defaults.drawdown),
                win_rate: range(MetricField::WinRate, defaults.win_rate),
                time_in_market: range(MetricField::TimeInMarket, defaults.time_in_market),
                trades: range(MetricField::NumTrades, defaults.trades),
                fees: range(MetricField::Fees, defaults.fees),
                funding: range(MetricField::Funding, defaults.funding),
                total_return: range(MetricField::TotalReturn, defaults.total_return),
            },
        }))
    }
}

fn texts(values: Vec<FieldValue>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| match v {
            | FieldValue::Text(s) => Some(s),
            | _ => None,
        })
        .collect()
}
