//! Two-tier backtest result cache.
//!
//! Artifacts live on disk as one JSON file per fingerprint under
//! `<root>/temporary` and `<root>/permanent`. The permanent tier is
//! authoritative once an entry has been promoted into it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestResult, Fingerprint};
use crate::{Error, Result};

mod artifact;
mod locks;
pub mod stats;
pub mod store;

pub use stats::{CacheCounters, CacheStatsSnapshot, StatsAggregator};
pub use store::{CacheOptions, CacheStore, EvictionPolicy};

/// Storage tier of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Temporary,
    Permanent,
}

impl Tier {
    /// Lookup order when no tier is requested: permanent entries win.
    pub const LOOKUP_ORDER: [Tier; 2] = [Tier::Permanent, Tier::Temporary];

    pub fn dir_name(&self) -> &'static str {
        match self {
            | Tier::Temporary => "temporary",
            | Tier::Permanent => "permanent",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            | "temporary" | "temp" => Ok(Tier::Temporary),
            | "permanent" | "perm" => Ok(Tier::Permanent),
            | other => Err(Error::Validation(format!("unknown cache tier '{other}'"))),
        }
    }
}

/// One cached backtest artifact in one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub tier: Tier,
    pub result: BacktestResult,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    /// Size of the serialized artifact on disk.
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_names() {
        assert_eq!("Permanent".parse::<Tier>().unwrap(), Tier::Permanent);
        assert_eq!("temp".parse::<Tier>().unwrap(), Tier::Temporary);
        assert!(matches!("cold".parse::<Tier>(), Err(Error::Validation(_))));
        assert_eq!(serde_json::to_string(&Tier::Temporary).unwrap(), "\"temporary\"");
    }
}
