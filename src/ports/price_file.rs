//! JSONL price dumps: one line per timestamp (epoch milliseconds) carrying a
//! price per symbol, either `{"price": ..}` snapshots or bare numbers.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::model::{PricePoint, PriceSeries};

// Extra snapshot fields (sizes, funding) are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DumpedPrice {
    Snapshot { price: Decimal },
    Bare(Decimal),
}

impl DumpedPrice {
    fn price(&self) -> Decimal {
        match self {
            DumpedPrice::Snapshot { price } | DumpedPrice::Bare(price) => *price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedPrice>,
}

#[derive(Debug, Serialize)]
struct WrittenSnapshot {
    price: Decimal,
}

#[derive(Debug, Serialize)]
struct WrittenEntry {
    timestamp: i64,
    prices: BTreeMap<String, WrittenSnapshot>,
}

/// Reads a dump into one series per symbol. Lines may come in any order; a
/// repeated timestamp keeps the last price seen.
pub fn load_price_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, PriceSeries>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open price file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut by_symbol: HashMap<String, BTreeMap<i64, f64>> = HashMap::new();
    let mut entries = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: DumpedDataEntry = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse price entry on line {}", lineno + 1))?;
        entries += 1;
        for (symbol, snapshot) in entry.prices {
            let price = snapshot.price().to_f64().ok_or_else(|| {
                anyhow!("price for {} on line {} is out of range", symbol, lineno + 1)
            })?;
            by_symbol
                .entry(symbol)
                .or_default()
                .insert(entry.timestamp, price);
        }
    }
    if entries == 0 {
        return Err(anyhow!("price file {} is empty", path.display()));
    }

    let mut out = HashMap::with_capacity(by_symbol.len());
    for (symbol, prices) in by_symbol {
        let points = prices
            .into_iter()
            .map(|(ms, price)| Ok(PricePoint::new(timestamp_from_millis(ms)?, price)))
            .collect::<Result<Vec<_>>>()?;
        let series = PriceSeries::new(symbol.clone(), points)?;
        out.insert(symbol, series);
    }
    log::info!(
        "[DATA] loaded {} entries for {} symbols from {}",
        entries,
        out.len(),
        path.display()
    );
    Ok(out)
}

/// Writes series as a dump, one line per distinct timestamp.
pub fn write_price_file<P: AsRef<Path>>(path: P, series: &[PriceSeries]) -> Result<()> {
    let path = path.as_ref();
    let mut rows: BTreeMap<i64, BTreeMap<String, WrittenSnapshot>> = BTreeMap::new();
    for s in series {
        for p in s.points() {
            let price = Decimal::from_f64(p.price)
                .ok_or_else(|| anyhow!("{} price {} is not representable", s.symbol(), p.price))?;
            let snapshot = WrittenSnapshot {
                price: price.round_dp(6),
            };
            rows.entry(p.timestamp.timestamp_millis())
                .or_default()
                .insert(s.symbol().to_string(), snapshot);
        }
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create price file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for (timestamp, prices) in rows {
        let line = serde_json::to_string(&WrittenEntry { timestamp, prices })?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

fn timestamp_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {}", ms))
}
