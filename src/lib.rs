//! # sweepcache
//! Result cache and query layer for a parameter-sweep backtester.
//!
//! - [`backtest::fingerprint`] derives a stable key for a parameter set.
//! - [`backtest::cache::CacheStore`] keeps results in a temporary and a
//!   permanent tier and computes each fingerprint at most once.
//! - [`backtest::cache::StatsAggregator`] summarizes the cache directory.
//! - [`persistence::ResultStore`] records completed runs for querying.
//! - [`dashboard::FilterQueryEngine`] answers filter-construction queries.
//! - [`backtest::sweep::SweepRunner`] ties them together for a grid of runs.

pub use crate::utils::error::{Error, Result};

pub mod backtest;
pub mod config;
pub mod dashboard;
pub mod persistence;
pub mod utils;
