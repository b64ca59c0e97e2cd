use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::PairId;
use crate::trade::{ExitReason, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    NoTrades,
    NonViable,
    Marginal,
    Viable,
}

impl Verdict {
    /// Label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Viable => "✅ Viable",
            Verdict::Marginal => "⚠️ Marginal",
            Verdict::NonViable => "❌ Non viable",
            Verdict::NoTrades => "❌ No trades",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerdictCutoffs {
    pub min_profit_factor: f64,
    pub marginal_profit_factor: f64,
    /// Fraction, not percent.
    pub min_win_rate: f64,
}

impl Default for VerdictCutoffs {
    fn default() -> Self {
        Self {
            min_profit_factor: 1.0,
            marginal_profit_factor: 1.5,
            min_win_rate: 0.5,
        }
    }
}

impl VerdictCutoffs {
    pub fn classify(
        &self,
        trade_count: usize,
        profit_factor: f64,
        expectancy_pct: f64,
        win_rate: f64,
    ) -> Verdict {
        if trade_count == 0 {
            Verdict::NoTrades
        } else if profit_factor < self.min_profit_factor || expectancy_pct <= 0.0 {
            Verdict::NonViable
        } else if profit_factor < self.marginal_profit_factor || win_rate < self.min_win_rate {
            Verdict::Marginal
        } else {
            Verdict::Viable
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCounts {
    pub mean_reversion: usize,
    pub stop_loss: usize,
    pub end_of_data: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub pair: PairId,
    pub trade_count: usize,
    /// Fraction of trades with positive PnL.
    pub win_rate: f64,
    /// +inf when there are trades and none lost.
    pub profit_factor: f64,
    pub expectancy_pct: f64,
    pub max_drawdown_pct: f64,
    /// Mean half-life (days) over successful calibrations.
    pub avg_half_life: f64,
    pub verdict: Verdict,

    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
    pub avg_holding_days: f64,
    pub exits: ExitCounts,
    pub calibrations: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Cumulative PnL after each trade, in close order.
    pub equity_curve: Vec<f64>,
}

/// Ratio of gross wins to gross losses over per-trade PnL.
pub fn profit_factor(pnls: &[f64]) -> f64 {
    if pnls.is_empty() {
        return 0.0;
    }
    let gross_win: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| -p).sum();
    if gross_loss == 0.0 {
        f64::INFINITY
    } else {
        gross_win / gross_loss
    }
}

/// Largest peak-to-trough fall of the cumulative PnL curve, starting from 0.
pub fn max_drawdown(pnls: &[f64]) -> f64 {
    let mut equity = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for pnl in pnls {
        equity += pnl;
        peak = peak.max(equity);
        worst = worst.max(peak - equity);
    }
    worst
}

pub fn compute_metrics(
    pair: PairId,
    trades: &[Trade],
    half_lives: &[f64],
    cutoffs: &VerdictCutoffs,
) -> BacktestResult {
    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let n = trades.len();
    let mean = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    let win_rate = if n == 0 { 0.0 } else { wins.len() as f64 / n as f64 };
    let profit_factor = profit_factor(&pnls);
    let expectancy_pct = mean(&pnls);

    let mut exits = ExitCounts::default();
    for t in trades {
        match t.exit_reason {
            ExitReason::MeanReversion => exits.mean_reversion += 1,
            ExitReason::StopLoss => exits.stop_loss += 1,
            ExitReason::EndOfData => exits.end_of_data += 1,
        }
    }
    let holding: Vec<f64> = trades.iter().map(Trade::holding_days).collect();
    let equity_curve = pnls
        .iter()
        .scan(0.0, |acc, p| {
            *acc += p;
            Some(*acc)
        })
        .collect();

    BacktestResult {
        pair,
        trade_count: n,
        win_rate,
        profit_factor,
        expectancy_pct,
        max_drawdown_pct: max_drawdown(&pnls),
        avg_half_life: mean(half_lives),
        verdict: cutoffs.classify(n, profit_factor, expectancy_pct, win_rate),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        total_pnl_pct: pnls.iter().sum(),
        avg_win_pct: mean(&wins),
        avg_loss_pct: mean(&losses),
        best_trade_pct: pnls.iter().copied().fold(0.0, f64::max),
        worst_trade_pct: pnls.iter().copied().fold(0.0, f64::min),
        avg_holding_days: mean(&holding),
        exits,
        calibrations: half_lives.len(),
        start: None,
        end: None,
        equity_curve,
    }
}
