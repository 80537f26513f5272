//! Read-only queries behind the sweep dashboard.
//!
//! Cache statistics live with the cache (`backtest::cache::stats`); this
//! module answers the filter-construction side from the result store.

pub mod filters;

pub use filters::{
    default_filter_options, drawdown_magnitude, FilterOptions, FilterOptionsResponse, FilterQueryEngine,
    MetricRanges,
};
