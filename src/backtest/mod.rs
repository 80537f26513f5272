//! Backtest parameter and result types shared by the cache, the result store
//! and the sweep runner.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub mod cache;
pub mod fingerprint;
pub mod sweep;

pub use fingerprint::{fingerprint, Fingerprint};

/// Strategy family a backtest evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Momentum,
    Contrarian,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            | Strategy::Momentum => "momentum",
            | Strategy::Contrarian => "contrarian",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            | "momentum" => Ok(Strategy::Momentum),
            | "contrarian" => Ok(Strategy::Contrarian),
            | other => Err(Error::Validation(format!("unknown strategy '{other}'"))),
        }
    }
}

/// Inclusive calendar range a backtest covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Unvalidated parameter set as received from a caller (request body, sweep grid, CLI).
///
/// Every field is optional so that absence can be reported as a validation
/// failure instead of a deserialization error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParameterSet {
    pub asset: Option<String>,
    pub strategy: Option<String>,
    pub leverage: Option<i64>,
    #[serde(alias = "shortThreshold")]
    pub low_threshold: Option<f64>,
    #[serde(alias = "longThreshold")]
    pub high_threshold: Option<f64>,
    pub timeframe: Option<String>,
    pub max_position_ratio: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Validated, normalized backtest parameters. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestParameters {
    asset: String,
    strategy: Strategy,
    leverage: u32,
    low_threshold: f64,
    high_threshold: f64,
    timeframe: String,
    max_position_ratio: f64,
    date_range: Option<DateRange>,
}

/// Thresholds are percentiles kept at two decimals.
pub(crate) const THRESHOLD_DECIMALS: i32 = 2;
/// Position ratios are kept at four decimals.
pub(crate) const RATIO_DECIMALS: i32 = 4;

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    // adding 0.0 folds -0.0 into 0.0
    (value * factor).round() / factor + 0.0
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::Validation(format!("missing required field '{field}'")))
}

fn normalize_timeframe(raw: &str) -> Result<String> {
    let tf = raw.trim().to_ascii_lowercase();
    if !tf.is_ascii() {
        return Err(Error::Validation(format!("invalid timeframe '{raw}'")));
    }
    let (digits, unit) = tf.split_at(tf.len().saturating_sub(1));
    let valid_unit = matches!(unit, "m" | "h" | "d" | "w");
    let count = digits.parse::<u32>().ok().filter(|n| *n > 0);
    match (valid_unit, count) {
        | (true, Some(n)) => Ok(format!("{n}{unit}")),
        | _ => Err(Error::Validation(format!("invalid timeframe '{raw}'"))),
    }
}

impl BacktestParameters {
    /// Validate and normalize a raw parameter set.
    pub fn new(raw: &ParameterSet) -> Result<Self> {
        let asset = require(raw.asset.as_deref(), "asset")?.trim().to_ascii_uppercase();
        if asset.is_empty() {
            return Err(Error::Validation("asset must not be empty".into()));
        }

        let strategy: Strategy = require(raw.strategy.as_deref(), "strategy")?.parse()?;

        let leverage = require(raw.leverage, "leverage")?;
        if leverage <= 0 {
            return Err(Error::Validation(format!("leverage must be positive, got {leverage}")));
        }
        let leverage = u32::try_from(leverage)
            .map_err(|_| Error::Validation(format!("leverage {leverage} is too large")))?;

        let low = threshold(require(raw.low_threshold, "lowThreshold")?, "lowThreshold")?;
        let high = threshold(require(raw.high_threshold, "highThreshold")?, "highThreshold")?;
        if low >= high {
            return Err(Error::Validation(format!(
                "low threshold {low} must be below high threshold {high}"
            )));
        }

        let timeframe = normalize_timeframe(require(raw.timeframe.as_deref(), "timeframe")?)?;

        let ratio = require(raw.max_position_ratio, "maxPositionRatio")?;
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            return Err(Error::Validation(format!(
                "max position ratio must be within [0, 1], got {ratio}"
            )));
        }

        let date_range = match (raw.start_date, raw.end_date) {
            | (None, None) => None,
            | (Some(start), Some(end)) if start <= end => Some(DateRange { start, end }),
            | (Some(start), Some(end)) => {
                return Err(Error::Validation(format!("start date {start} is after end date {end}")))
            }
            | _ => {
                return Err(Error::Validation(
                    "date range needs both startDate and endDate".into(),
                ))
            }
        };

        Ok(Self {
            asset,
            strategy,
            leverage,
            low_threshold: low,
            high_threshold: high,
            timeframe,
            max_position_ratio: round_to(ratio, RATIO_DECIMALS),
            date_range,
        })
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn leverage(&self) -> u32 {
        self.leverage
    }

    pub fn low_threshold(&self) -> f64 {
        self.low_threshold
    }

    pub fn high_threshold(&self) -> f64 {
        self.high_threshold
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn max_position_ratio(&self) -> f64 {
        self.max_position_ratio
    }

    pub fn date_range(&self) -> Option<DateRange> {
        self.date_range
    }

    /// Stable cache identity of this parameter set.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

fn threshold(value: f64, field: &str) -> Result<f64> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::Validation(format!("{field} must be within [0, 100], got {value}")));
    }
    Ok(round_to(value, THRESHOLD_DECIMALS))
}

/// Metrics produced by one backtest run.
///
/// Missing metrics decode as zero; fields this crate does not know about are
/// preserved untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BacktestResult {
    #[serde(rename = "executionTime")]
    pub execution_time_ms: f64,
    pub sharpe_ratio: f64,
    /// Signed, usually negative. Reported as a magnitude by the filter layer.
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub time_in_market: f64,
    pub num_trades: u64,
    pub fees: f64,
    pub funding: f64,
    pub total_return: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
