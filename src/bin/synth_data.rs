//! Writes a reproducible synthetic price dump for demos and smoke runs.
//!
//! Usage: `synth-data [OUTPUT]` (default `prices.jsonl`). `SYNTH_LEN` and
//! `SYNTH_SEED` override the series length and base seed.

use anyhow::{Context, Result};
use cointpair::logging;
use cointpair::ports::write_price_file;
use cointpair::synthetic::SyntheticPair;
use std::env;

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {} {:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn main() -> Result<()> {
    logging::init()?;
    let output = env::args().nth(1).unwrap_or_else(|| "prices.jsonl".to_string());
    let len = env_parsed("SYNTH_LEN", 750usize)?;
    let seed = env_parsed("SYNTH_SEED", 42u64)?;

    // (a, b, beta, intercept, lambda); lambda 0 leaves the residual a random walk
    let specs = [
        ("GLD", "SLV", 1.5, 10.0, -0.08),
        ("USO", "BNO", 0.9, 2.0, -0.04),
        ("XOM", "CVX", 1.1, -5.0, -0.15),
        ("SPY", "QQQ", 1.2, 0.0, 0.0),
    ];
    let mut series = Vec::with_capacity(specs.len() * 2);
    for (i, (a, b, beta, intercept, lambda)) in specs.iter().enumerate() {
        let (sa, sb) = SyntheticPair {
            symbol_a: a.to_string(),
            symbol_b: b.to_string(),
            hedge_ratio: *beta,
            intercept: *intercept,
            lambda: *lambda,
            len,
            seed: seed + i as u64,
            ..SyntheticPair::default()
        }
        .generate()
        .with_context(|| format!("failed to generate {}/{}", a, b))?;
        series.push(sa);
        series.push(sb);
    }

    write_price_file(&output, &series)?;
    log::info!(
        "[DATA] wrote {} symbols x {} observations to {}",
        series.len(),
        len,
        output
    );
    Ok(())
}
