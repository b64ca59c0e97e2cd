use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::str::FromStr;

const DEFAULT_TIMEZONE_OFFSET: i32 = 3600;

/// Installs the process logger. Called once by each binary.
///
/// `TIMEZONE_OFFSET` is seconds east of UTC for the timestamp prefix,
/// `RUST_LOG` a single level filter (default `info`).
pub fn init() -> Result<()> {
    let offset_seconds = match env::var("TIMEZONE_OFFSET") {
        Ok(raw) => raw
            .trim()
            .parse::<i32>()
            .with_context(|| format!("invalid TIMEZONE_OFFSET {:?}", raw))?,
        Err(_) => DEFAULT_TIMEZONE_OFFSET,
    };
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| anyhow!("TIMEZONE_OFFSET {} out of range", offset_seconds))?;
    let level = env::var("RUST_LOG")
        .ok()
        .and_then(|v| LevelFilter::from_str(&v).ok())
        .unwrap_or(LevelFilter::Info);

    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .try_init()
        .context("logger already initialised")
}
