//! Logging setup for the sweep cache.
//!
//! Lines look like `2026-01-02T10:00:00.123Z INFO  cache::store > message`.
//! Colors come from env_logger's own styling, so `SWEEPCACHE_LOG_STYLE=never`
//! (or a non-terminal stderr under `auto`) yields plain text.

use std::io::{self, Write};

use chrono::Utc;
use env_logger::fmt::Formatter;
use env_logger::{Builder, Env, Target};
use log::{info, Record};
#[cfg(test)]
use log::LevelFilter;

const CRATE_PREFIX: &str = "sweepcache::";

/// Initialize the logging system
pub fn init_logging(level: &str) {
    let env = Env::default()
        .filter_or("SWEEPCACHE_LOG", level)
        .write_style_or("SWEEPCACHE_LOG_STYLE", "auto");

    Builder::from_env(env)
        .format(write_record)
        .target(Target::Stderr)
        .try_init()
        .ok();

    info!("Logging initialized at level: {}", level);
}

fn write_record(buf: &mut Formatter, record: &Record) -> io::Result<()> {
    let level = buf.default_styled_level(record.level());
    let mut dim = buf.style();
    dim.set_dimmed(true);
    writeln!(
        buf,
        "{} {:<5} {} {}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level,
        dim.value(format!("{} >", short_target(record.target()))),
        record.args()
    )
}

/// Module path without the crate name; other crates keep their full target.
fn short_target(target: &str) -> &str {
    target.strip_prefix(CRATE_PREFIX).unwrap_or(target)
}

/// Initialize test logging (for use in tests)
#[cfg(test)]
pub fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}
