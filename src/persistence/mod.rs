//! Durable store of completed backtest runs.
//!
//! The trait keeps the sweep runner and the dashboard queries decoupled from
//! the concrete backend. Filterable columns are addressed through enums so
//! that no caller-supplied text ever reaches SQL.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestParameters, BacktestResult, Fingerprint};
use crate::{Error, Result};

pub mod sqlite;

pub use sqlite::SqliteResultStore;

/// Internal row identifier; re-runs of one fingerprint get distinct ids.
pub type RowId = i64;

/// One completed backtest run, flattened. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub id: Option<RowId>,
    pub run_id: String,
    pub fingerprint: Option<String>,
    pub asset: String,
    pub strategy: String,
    pub timeframe: String,
    pub leverage: u32,
    pub short_threshold: f64,
    pub long_threshold: f64,
    pub max_position_ratio: f64,
    pub sharpe_ratio: f64,
    /// Signed, as produced by the backtest.
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub time_in_market: f64,
    pub num_trades: u64,
    pub fees: f64,
    pub funding: f64,
    pub total_return: f64,
    pub execution_time_ms: f64,
    pub executed_at: DateTime<Utc>,
}

impl ResultRow {
    /// Flatten a parameter set and its result into a row stamped now.
    pub fn from_run(fingerprint: &Fingerprint, params: &BacktestParameters, result: &BacktestResult) -> Self {
        let executed_at = Utc::now();
        Self {
            id: None,
            run_id: format!(
                "{}-{}",
                &fingerprint.as_str()[..12],
                executed_at.format("%Y%m%dT%H%M%S%6f")
            ),
            fingerprint: Some(fingerprint.to_string()),
            asset: params.asset().to_string(),
            strategy: params.strategy().to_string(),
            timeframe: params.timeframe().to_string(),
            leverage: params.leverage(),
            short_threshold: params.low_threshold(),
            long_threshold: params.high_threshold(),
            max_position_ratio: params.max_position_ratio(),
            sharpe_ratio: result.sharpe_ratio,
            max_drawdown: result.max_drawdown,
            win_rate: result.win_rate,
            time_in_market: result.time_in_market,
            num_trades: result.num_trades,
            fees: result.fees,
            funding: result.funding,
            total_return: result.total_return,
            execution_time_ms: result.execution_time_ms,
            executed_at,
        }
    }
}

/// Columns with distinct-value queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistinctField {
    Asset,
    Strategy,
    Timeframe,
    Leverage,
}

impl DistinctField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            | DistinctField::Asset => "asset",
            | DistinctField::Strategy => "strategy",
            | DistinctField::Timeframe => "timeframe",
            | DistinctField::Leverage => "leverage",
        }
    }
}

impl FromStr for DistinctField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            | "asset" | "assets" => Ok(DistinctField::Asset),
            | "strategy" | "strategies" => Ok(DistinctField::Strategy),
            | "timeframe" => Ok(DistinctField::Timeframe),
            | "leverage" | "leverages" => Ok(DistinctField::Leverage),
            | other => Err(Error::Validation(format!("'{other}' is not a distinct-value field"))),
        }
    }
}

/// Numeric metric columns with range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricField {
    SharpeRatio,
    MaxDrawdown,
    WinRate,
    TimeInMarket,
    NumTrades,
    Fees,
    Funding,
    TotalReturn,
    ExecutionTime,
}

impl MetricField {
    /// Metrics the dashboard builds range sliders for.
    pub const FILTERABLE: [MetricField; 8] = [
        MetricField::SharpeRatio,
        MetricField::MaxDrawdown,
        MetricField::WinRate,
        MetricField::TimeInMarket,
        MetricField::NumTrades,
        MetricField::Fees,
        MetricField::Funding,
        MetricField::TotalReturn,
    ];

    pub(crate) fn column(&self) -> &'static str {
        match self {
            | MetricField::SharpeRatio => "sharpe_ratio",
            | MetricField::MaxDrawdown => "max_drawdown",
            | MetricField::WinRate => "win_rate",
            | MetricField::TimeInMarket => "time_in_market",
            | MetricField::NumTrades => "num_trades",
            | MetricField::Fees => "fees",
            | MetricField::Funding => "funding",
            | MetricField::TotalReturn => "total_return",
            | MetricField::ExecutionTime => "execution_time_ms",
        }
    }
}

impl FromStr for MetricField {
    type Err = Error;

    /// Accepts the dashboard's names as well as the column names.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            | "sharpeRatio" | "sharpe_ratio" => Ok(MetricField::SharpeRatio),
            | "drawdown" | "maxDrawdown" | "max_drawdown" => Ok(MetricField::MaxDrawdown),
            | "winRate" | "win_rate" => Ok(MetricField::WinRate),
            | "timeInMarket" | "time_in_market" => Ok(MetricField::TimeInMarket),
            | "trades" | "numTrades" | "num_trades" => Ok(MetricField::NumTrades),
            | "fees" => Ok(MetricField::Fees),
            | "funding" => Ok(MetricField::Funding),
            | "totalReturn" | "total_return" => Ok(MetricField::TotalReturn),
            | "executionTime" | "execution_time_ms" => Ok(MetricField::ExecutionTime),
            | other => Err(Error::Validation(format!("'{other}' is not a metric field"))),
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A distinct column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Entry/exit percentile pair used by a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPair {
    pub short: f64,
    pub long: f64,
}

/// Largest page `query_runs` will return.
pub const MAX_RUN_LIMIT: usize = 10_000;

/// Multi-select and range filter over stored runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFilter {
    pub assets: Vec<String>,
    pub strategies: Vec<String>,
    pub leverages: Vec<u32>,
    pub ranges: BTreeMap<MetricField, ValueRange>,
    pub order_by: MetricField,
    pub descending: bool,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            strategies: Vec::new(),
            leverages: Vec::new(),
            ranges: BTreeMap::new(),
            order_by: MetricField::SharpeRatio,
            descending: true,
            limit: 100,
        }
    }
}

impl RunFilter {
    /// Reject malformed filters before they reach the store.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_RUN_LIMIT {
            return Err(Error::Validation(format!(
                "limit must be within 1..={MAX_RUN_LIMIT}, got {}",
                self.limit
            )));
        }
        for (field, range) in &self.ranges {
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(Error::Validation(format!("{field} range bounds must be finite")));
            }
            if range.min > range.max {
                return Err(Error::Validation(format!(
                    "{field} range is inverted: {} > {}",
                    range.min, range.max
                )));
            }
        }
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Durably insert one run and return its row id.
    async fn append(&self, row: &ResultRow) -> Result<RowId>;

    async fn count(&self) -> Result<u64>;

    /// Ascending, unique, NULLs excluded.
    async fn query_distinct(&self, field: DistinctField) -> Result<Vec<FieldValue>>;

    /// Sorted by short, then long threshold.
    async fn distinct_threshold_pairs(&self) -> Result<Vec<ThresholdPair>>;

    /// Min/max per field; fields without any value are absent from the map.
    async fn query_ranges(&self, fields: &[MetricField]) -> Result<BTreeMap<MetricField, ValueRange>>;

    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<ResultRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_field_names_parse() {
        assert_eq!("drawdown".parse::<MetricField>().unwrap(), MetricField::MaxDrawdown);
        assert_eq!("trades".parse::<MetricField>().unwrap(), MetricField::NumTrades);
        assert_eq!("leverages".parse::<DistinctField>().unwrap(), DistinctField::Leverage);
        assert_matches!("sharpe; DROP TABLE".parse::<MetricField>(), Err(Error::Validation(_)));
        assert_matches!("price".parse::<DistinctField>(), Err(Error::Validation(_)));
    }

    #[test]
    fn test_run_filter_validation() {
        assert!(RunFilter::default().validate().is_ok());

        let mut inverted = RunFilter::default();
        inverted.ranges.insert(MetricField::WinRate, ValueRange::new(80.0, 20.0));
        assert_matches!(inverted.validate(), Err(Error::Validation(_)));

        let mut unbounded = RunFilter::default();
        unbounded.ranges.insert(MetricField::Fees, ValueRange::new(f64::NEG_INFINITY, 0.0));
        assert_matches!(unbounded.validate(), Err(Error::Validation(_)));

        let too_many = RunFilter { limit: MAX_RUN_LIMIT + 1, ..Default::default() };
        assert_matches!(too_many.validate(), Err(Error::Validation(_)));
    }
}
