//! On-disk artifact format.
//!
//! Older writers stored the execution time either at the top level or inside
//! `result`, and some omitted bookkeeping fields. The decoder accepts every
//! such shape and hands back one canonical [`Artifact`]; nothing past this
//! module sees the raw layout.
//!
//! Metrics inside `result` are read one key at a time. A null or mistyped
//! metric (JS writers emit `null` for NaN) reads as zero instead of sinking
//! the whole artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CacheEntry, Tier};
use crate::backtest::{BacktestResult, Fingerprint};
use crate::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawArtifact {
    fingerprint: Option<String>,
    tier: Option<Tier>,
    result: Option<Value>,
    execution_time: Option<f64>,
    access_count: Option<u64>,
    created_at: Option<DateTime<Utc>>,
    last_accessed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactOut<'a> {
    fingerprint: &'a Fingerprint,
    tier: Tier,
    execution_time: f64,
    access_count: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    result: &'a BacktestResult,
}

/// Canonical view of one artifact file; any field may be missing.
#[derive(Debug, Clone)]
pub(crate) struct Artifact {
    pub fingerprint: Option<String>,
    pub tier: Option<Tier>,
    pub result: Option<BacktestResult>,
    pub execution_time_ms: Option<f64>,
    pub access_count: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Artifact> {
    let raw: RawArtifact = serde_json::from_slice(bytes)
        .map_err(|e| Error::Parse(format!("artifact is not a readable object: {e}")))?;

    let nested_time = raw
        .result
        .as_ref()
        .and_then(|r| r.get("executionTime"))
        .and_then(Value::as_f64);
    let result = raw.result.map(decode_result).transpose()?;

    Ok(Artifact {
        fingerprint: raw.fingerprint,
        tier: raw.tier,
        result,
        // top-level wins when both are present
        execution_time_ms: raw.execution_time.or(nested_time).filter(|t| t.is_finite()),
        access_count: raw.access_count,
        created_at: raw.created_at,
        last_accessed_at: raw.last_accessed_at,
        size_bytes: bytes.len() as u64,
    })
}

fn decode_result(value: Value) -> Result<BacktestResult> {
    let Value::Object(mut map) = value else {
        return Err(Error::Parse(format!("result is not an object: {value}")));
    };
    Ok(BacktestResult {
        execution_time_ms: take_metric(&mut map, "executionTime").unwrap_or_default(),
        sharpe_ratio: take_metric(&mut map, "sharpeRatio").unwrap_or_default(),
        max_drawdown: take_metric(&mut map, "maxDrawdown").unwrap_or_default(),
        win_rate: take_metric(&mut map, "winRate").unwrap_or_default(),
        time_in_market: take_metric(&mut map, "timeInMarket").unwrap_or_default(),
        num_trades: take_count(&mut map, "numTrades").unwrap_or_default(),
        fees: take_metric(&mut map, "fees").unwrap_or_default(),
        funding: take_metric(&mut map, "funding").unwrap_or_default(),
        total_return: take_metric(&mut map, "totalReturn").unwrap_or_default(),
        extra: map,
    })
}

/// Remove `key` and read it as a finite number. Known keys never survive into
/// `extra`, so a bad value is dropped rather than written back twice.
fn take_metric(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
    map.remove(key)?.as_f64().filter(|v| v.is_finite())
}

fn take_count(map: &mut Map<String, Value>, key: &str) -> Option<u64> {
    let value = map.remove(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as u64)
    })
}

pub(crate) fn encode(entry: &CacheEntry) -> Result<Vec<u8>> {
    let out = ArtifactOut {
        fingerprint: &entry.fingerprint,
        tier: entry.tier,
        execution_time: entry.result.execution_time_ms,
        access_count: entry.access_count,
        created_at: entry.created_at,
        last_accessed_at: entry.last_accessed_at,
        result: &entry.result,
    };
    Ok(serde_json::to_vec_pretty(&out)?)
}

impl Artifact {
    /// Build a full entry for `expected`, read from the `tier` directory.
    ///
    /// The directory decides the tier. `fallback_time` (usually the file
    /// mtime) stands in for missing timestamps.
    pub fn into_entry(
        self,
        expected: &Fingerprint,
        tier: Tier,
        fallback_time: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        if let Some(stored) = &self.fingerprint {
            if stored != expected.as_str() {
                return Err(Error::Parse(format!(
                    "artifact for {expected} claims fingerprint {stored}"
                )));
            }
        }
        let mut result = self
            .result
            .ok_or_else(|| Error::Parse(format!("artifact for {expected} has no result")))?;
        if let Some(t) = self.execution_time_ms {
            result.execution_time_ms = t;
        }
        let created_at = self.created_at.unwrap_or(fallback_time);
        Ok(CacheEntry {
            fingerprint: expected.clone(),
            tier,
            result,
            access_count: self.access_count.unwrap_or(0),
            last_accessed_at: self.last_accessed_at.unwrap_or(created_at),
            size_bytes: self.size_bytes,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::fingerprint;
    use crate::backtest::ParameterSet;

    fn fp() -> Fingerprint {
        fingerprint(&ParameterSet {
            asset: Some("SOL".into()),
            strategy: Some("contrarian".into()),
            leverage: Some(2),
            low_threshold: Some(10.0),
            high_threshold: Some(90.0),
            timeframe: Some("1d".into()),
            max_position_ratio: Some(1.0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_top_level_execution_time() {
        let a = decode(br#"{"executionTime": 420, "result": {"sharpeRatio": 1.1}}"#).unwrap();
        assert_eq!(a.execution_time_ms, Some(420.0));
    }

    #[test]
    fn test_nested_execution_time() {
        let a = decode(br#"{"result": {"executionTime": 815.5, "winRate": 61.0}}"#).unwrap();
        assert_eq!(a.execution_time_ms, Some(815.5));
        assert_eq!(a.result.unwrap().win_rate, 61.0);
    }

    #[test]
    fn test_missing_bookkeeping_is_tolerated() {
        let a = decode(br#"{"accessCount": 7}"#).unwrap();
        assert_eq!(a.access_count, Some(7));
        assert!(a.execution_time_ms.is_none());
        assert!(a.result.is_none());
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(decode(b"{not json"), Err(Error::Parse(_))));
        assert!(matches!(decode(b"[1, 2, 3]"), Err(Error::Parse(_))));
        assert!(matches!(decode(br#"{"result": [0.5]}"#), Err(Error::Parse(_))));
    }

    #[test]
    fn test_bad_metrics_read_as_zero() {
        let a = decode(
            br#"{"executionTime": 100,
                 "result": {"sharpeRatio": null, "winRate": "high", "numTrades": 12.0,
                            "fees": -3.5, "venue": "hl"}}"#,
        )
        .unwrap();
        let result = a.result.unwrap();
        assert_eq!(result.sharpe_ratio, 0.0);
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.num_trades, 12);
        assert_eq!(result.fees, -3.5);
        assert_eq!(a.execution_time_ms, Some(100.0));
        // unknown keys are kept, known ones are not duplicated
        assert_eq!(result.extra.len(), 1);
        assert_eq!(result.extra["venue"], "hl");
    }

    #[test]
    fn test_encode_writes_both_time_locations() {
        let now = Utc::now();
        let entry = CacheEntry {
            fingerprint: fp(),
            tier: Tier::Temporary,
            result: BacktestResult { execution_time_ms: 250.0, ..Default::default() },
            access_count: 3,
            last_accessed_at: now,
            size_bytes: 0,
            created_at: now,
        };
        let bytes = encode(&entry).unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["executionTime"], 250.0);
        assert_eq!(json["result"]["executionTime"], 250.0);
        assert_eq!(json["tier"], "temporary");

        let back = decode(&bytes).unwrap().into_entry(&fp(), Tier::Temporary, now).unwrap();
        assert_eq!(back.access_count, 3);
        assert_eq!(back.result.execution_time_ms, 250.0);
        assert_eq!(back.size_bytes, bytes.len() as u64);
    }

    #[test]
    fn test_into_entry_rejects_foreign_fingerprint() {
        let bytes = br#"{"fingerprint": "0000000000000000000000000000000000000000000000000000000000000000",
                        "result": {}}"#;
        let err = decode(bytes).unwrap().into_entry(&fp(), Tier::Permanent, Utc::now());
        assert!(matches!(err, Err(Error::Parse(_))));
    }
}
