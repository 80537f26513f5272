//! Utility functions and types shared by the cache and query layer.

pub mod error;
mod fs;
mod logging;

pub use error::Error;
pub use fs::*;
pub use logging::init_logging;
#[cfg(test)]
pub use logging::init_test_logging;

