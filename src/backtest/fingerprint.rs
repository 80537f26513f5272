//! Deterministic identity of a backtest parameter set.
//!
//! Fields are laid out in a fixed order with fixed numeric formatting, joined
//! and hashed with SHA-256, so the key is stable across processes and
//! independent of how the caller ordered or formatted its input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{BacktestParameters, ParameterSet, RATIO_DECIMALS, THRESHOLD_DECIMALS};
use crate::{Error, Result};

/// Bump when the canonical layout changes; old artifacts then simply miss.
const LAYOUT_VERSION: &str = "v1";

/// Hex-encoded SHA-256 of the canonical parameter layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn of(params: &BacktestParameters) -> Self {
        let canonical = canonical_layout(params);
        let mut hasher = Sha256::new();
        hasher.update(canonical.join("|").as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_layout(params: &BacktestParameters) -> Vec<String> {
    let (from, to) = match params.date_range() {
        | Some(range) => (range.start.to_string(), range.end.to_string()),
        | None => ("-".to_string(), "-".to_string()),
    };
    let t = THRESHOLD_DECIMALS as usize;
    let r = RATIO_DECIMALS as usize;
    vec![
        LAYOUT_VERSION.to_string(),
        format!("asset={}", params.asset()),
        format!("strategy={}", params.strategy()),
        format!("leverage={}", params.leverage()),
        format!("low={:.t$}", params.low_threshold()),
        format!("high={:.t$}", params.high_threshold()),
        format!("timeframe={}", params.timeframe()),
        format!("ratio={:.r$}", params.max_position_ratio()),
        format!("from={from}"),
        format!("to={to}"),
    ]
}

/// Validate `raw` and derive its fingerprint.
///
/// Fails with [`Error::Validation`] before any key is produced when a
/// required field is absent or outside its domain.
pub fn fingerprint(raw: &ParameterSet) -> Result<Fingerprint> {
    Ok(BacktestParameters::new(raw)?.fingerprint())
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Accepts only 64 lowercase hex characters, which also keeps
    /// fingerprints safe to use as file names.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let well_formed = s.len() == 64
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(Error::Validation(format!("malformed fingerprint '{s}'")));
        }
        Ok(Fingerprint(s.to_string()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}
