//! Markdown rendering of backtest results.
//!
//! The summary table columns and the verdict labels are read by downstream
//! tooling; keep them stable.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

use super::metrics::{BacktestResult, Verdict};
use crate::config::StrategyConfig;

pub const SUMMARY_HEADER: &str =
    "| Pair | Trades | Win Rate | Profit Factor | Expectancy | Max Drawdown | Verdict |";
const SUMMARY_RULE: &str =
    "|------|--------|----------|---------------|------------|--------------|---------|";

pub fn format_profit_factor(pf: f64) -> String {
    if pf.is_infinite() && pf > 0.0 {
        "inf".to_string()
    } else {
        format!("{:.2}", pf)
    }
}

pub fn summary_row(r: &BacktestResult) -> String {
    format!(
        "| {} | {} | {:.0}% | {} | {:+.1}% | {:.1}% | {} |",
        r.pair,
        r.trade_count,
        r.win_rate * 100.0,
        format_profit_factor(r.profit_factor),
        r.expectancy_pct,
        r.max_drawdown_pct,
        r.verdict
    )
}

pub fn render_markdown(
    results: &[BacktestResult],
    cfg: &StrategyConfig,
    generated_at: DateTime<Utc>,
) -> String {
    let mut lines = vec![
        "# Pairs Trading Backtest Report".to_string(),
        String::new(),
        format!("Generated: {}", generated_at.format("%Y-%m-%d %H:%M UTC")),
        String::new(),
        "## Summary".to_string(),
        String::new(),
        SUMMARY_HEADER.to_string(),
        SUMMARY_RULE.to_string(),
    ];
    lines.extend(results.iter().map(summary_row));
    lines.extend([String::new(), "## Viable pairs".to_string(), String::new()]);

    let viable: Vec<&BacktestResult> = results
        .iter()
        .filter(|r| r.verdict == Verdict::Viable)
        .collect();
    if viable.is_empty() {
        lines.push("*No viable pairs with the current parameters.*".to_string());
    }
    for r in viable {
        lines.extend(viable_section(r));
    }

    lines.extend([
        String::new(),
        "## Parameters".to_string(),
        String::new(),
        format!("- Z-score entry: ±{}", cfg.z_entry),
        format!("- Z-score exit: ±{}", cfg.z_exit),
        format!("- Z-score stop: ±{}", cfg.z_stop),
    ]);
    if let Some(rungs) = &cfg.scaling_ladder {
        let ladder: Vec<String> = rungs
            .iter()
            .map(|r| format!("{}:{:.0}%", r.trigger_z, r.weight * 100.0))
            .collect();
        lines.push(format!("- Scaling ladder: {}", ladder.join(", ")));
    }
    lines.extend([
        format!("- P-value threshold: {}", cfg.p_value_threshold),
        format!(
            "- Half-life bounds: {} to {} days",
            cfg.min_half_life, cfg.max_half_life
        ),
        format!(
            "- Recalibration: every {} days over {} observations",
            cfg.recalibration_interval_days, cfg.calibration_lookback
        ),
        format!("- PnL convention: {}", cfg.pnl_convention),
        String::new(),
        "---".to_string(),
        format!("*Generated by cointpair {}*", env!("CARGO_PKG_VERSION")),
        String::new(),
    ]);
    lines.join("\n")
}

fn viable_section(r: &BacktestResult) -> Vec<String> {
    vec![
        format!("### {}", r.pair),
        String::new(),
        format!(
            "- **Trades**: {} ({} won, {} lost, win rate {:.0}%)",
            r.trade_count,
            r.winning_trades,
            r.losing_trades,
            r.win_rate * 100.0
        ),
        format!(
            "- **Profit Factor**: {}",
            format_profit_factor(r.profit_factor)
        ),
        format!("- **Expectancy**: {:+.2}% per trade", r.expectancy_pct),
        format!(
            "- **Average win / loss**: {:+.2}% / {:+.2}%",
            r.avg_win_pct, r.avg_loss_pct
        ),
        format!("- **Average half-life**: {:.1} days", r.avg_half_life),
        format!("- **Average holding**: {:.1} days", r.avg_holding_days),
        format!("- **Max Drawdown**: {:.1}%", r.max_drawdown_pct),
        format!(
            "- **Exits**: {} mean reversion, {} stop loss, {} end of data",
            r.exits.mean_reversion, r.exits.stop_loss, r.exits.end_of_data
        ),
        String::new(),
    ]
}

/// Writes through a temporary file so readers never see a partial report.
pub fn write_report<P: AsRef<Path>>(path: P, content: &str) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::metrics::ExitCounts;
    use crate::model::tests::day;
    use crate::model::PairSpec;

    fn result(pair: (&str, &str), trades: usize, pf: f64, verdict: Verdict) -> BacktestResult {
        BacktestResult {
            pair: PairSpec::new(pair.0, pair.1).id(),
            trade_count: trades,
            win_rate: if trades == 0 { 0.0 } else { 0.583 },
            profit_factor: pf,
            expectancy_pct: if trades == 0 { 0.0 } else { 12.345 },
            max_drawdown_pct: if trades == 0 { 0.0 } else { 3.21 },
            avg_half_life: 11.2,
            verdict,
            winning_trades: 7,
            losing_trades: 5,
            total_pnl_pct: 148.1,
            avg_win_pct: 30.0,
            avg_loss_pct: -12.4,
            best_trade_pct: 60.0,
            worst_trade_pct: -20.0,
            avg_holding_days: 6.5,
            exits: ExitCounts::default(),
            calibrations: 8,
            start: None,
            end: None,
            equity_curve: vec![],
        }
    }

    #[test]
    fn row_formatting() {
        let row = summary_row(&result(("GLD", "SLV"), 12, 1.8532, Verdict::Viable));
        assert_eq!(row, "| GLD_SLV | 12 | 58% | 1.85 | +12.3% | 3.2% | ✅ Viable |");

        let row = summary_row(&result(("XOM", "CVX"), 3, f64::INFINITY, Verdict::Viable));
        assert!(row.contains("| inf |"));

        let row = summary_row(&result(("SPY", "IWM"), 0, 0.0, Verdict::NoTrades));
        assert_eq!(row, "| SPY_IWM | 0 | 0% | 0.00 | +0.0% | 0.0% | ❌ No trades |");
    }

    #[test]
    fn report_lists_viable_pairs_and_parameters() {
        let results = vec![
            result(("GLD", "SLV"), 12, 1.85, Verdict::Viable),
            result(("USO", "BNO"), 9, 1.2, Verdict::Marginal),
        ];
        let md = render_markdown(&results, &StrategyConfig::default(), day(0));
        assert!(md.contains(SUMMARY_HEADER));
        assert!(md.contains("### GLD_SLV"));
        assert!(!md.contains("### USO_BNO"));
        assert!(md.contains("⚠️ Marginal"));
        assert!(md.contains("- Z-score entry: ±2"));
        assert!(md.contains("Generated: 2024-01-01 00:00 UTC"));
    }

    #[test]
    fn summary_table_is_contiguous_and_report_ends_with_newline() {
        let results = vec![
            result(("GLD", "SLV"), 12, 1.85, Verdict::Viable),
            result(("SPY", "IWM"), 0, 0.0, Verdict::NoTrades),
        ];
        let md = render_markdown(&results, &StrategyConfig::default(), day(0));
        let lines: Vec<&str> = md.lines().collect();
        let header = lines.iter().position(|l| *l == SUMMARY_HEADER).unwrap();
        assert_eq!(lines[header + 1], SUMMARY_RULE);
        assert_eq!(lines[header + 2], summary_row(&results[0]));
        assert_eq!(lines[header + 3], summary_row(&results[1]));
        assert_eq!(lines[header + 4], "");
        assert_eq!(lines[header + 5], "## Viable pairs");
        assert!(md.starts_with("# Pairs Trading Backtest Report\n\nGenerated: "));
        assert!(md.ends_with("*\n"));
    }

    #[test]
    fn report_without_viable_pairs_says_so() {
        let results = vec![result(("SPY", "IWM"), 0, 0.0, Verdict::NoTrades)];
        let md = render_markdown(&results, &StrategyConfig::default(), day(0));
        assert!(md.contains("*No viable pairs with the current parameters.*"));
    }

    #[test]
    fn report_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.md");
        write_report(&path, "# hi\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# hi\n");
        assert!(!path.with_extension("md.tmp").exists());
    }
}
