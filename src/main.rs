use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use cointpair::backtest::report::{render_markdown, write_report};
use cointpair::backtest::BacktestEngine;
use cointpair::config::StrategyConfig;
use cointpair::logging;
use cointpair::ports::{load_price_file, JsonlPairStore, PairStore};
use cointpair::scanner::Scanner;
use std::sync::Arc;

const TOP_PAIRS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let git_hash = option_env!("COINTPAIR_GIT_HASH").unwrap_or("unknown");
    log::info!("cointpair {} git: {}", env!("CARGO_PKG_VERSION"), git_hash);

    let cfg = StrategyConfig::from_env_or_yaml()?;
    let price_file = cfg
        .price_file
        .clone()
        .ok_or_else(|| anyhow!("no price file configured (price_file / PRICE_FILE)"))?;
    let prices = Arc::new(load_price_file(&price_file)?);

    let now = Utc::now();
    let scan = Scanner::new(&cfg)
        .scan(&cfg.universe, prices.clone(), now)
        .await;
    let store = JsonlPairStore::new(&cfg.pairs_file);
    let known = store.load()?;
    let summary = scan.summary(&known);
    log::info!(
        "[SCAN] scanned={} cointegrated={} new={} skipped={}",
        summary.pairs_scanned,
        summary.cointegrated_found,
        summary.new_pairs,
        summary.skipped
    );
    for (pair, score) in scan.top_pairs(TOP_PAIRS) {
        log::info!(
            "[SCAN] top {} score={:.3} p={:.4} half_life={:.1}d",
            pair.id(),
            score,
            pair.p_value,
            pair.half_life
        );
    }
    for pair in scan.pairs() {
        store
            .save_pair(pair)
            .await
            .with_context(|| format!("failed to persist {}", pair.id()))?;
    }
    log::info!(
        "[SCAN] {} pair records written to {}",
        scan.validations.len(),
        store.path().display()
    );

    let engine = BacktestEngine::new(&cfg);
    let runs = engine.run_batch(&cfg.universe, prices).await;
    let results: Vec<_> = runs
        .into_iter()
        .filter_map(|(_, run)| run.ok().map(|r| r.result))
        .collect();

    let report = render_markdown(&results, &cfg, now);
    write_report(&cfg.report_file, &report)
        .with_context(|| format!("failed to write report {}", cfg.report_file))?;
    log::info!(
        "[BACKTEST] report for {} pairs written to {}",
        results.len(),
        cfg.report_file
    );
    Ok(())
}
