//! Closed round trips and the PnL convention shared by backtest and live
//! accounting.
//!
//! Each fill `i` of weight `w_i` earns `dir·(S_exit − S_i) / N_i · 100`, where
//! spreads use the hedge ratio fixed at entry and `N_i` is either the rolling
//! spread std at the fill (percent of one sigma of risk) or the fill's gross
//! notional `price_a + |β|·price_b`. A trade's `pnl_pct` is the weighted sum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::PairId;
use crate::signal::{Direction, OpenPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    MeanReversion,
    StopLoss,
    EndOfData,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::MeanReversion => f.write_str("MEAN_REVERSION"),
            ExitReason::StopLoss => f.write_str("STOP_LOSS"),
            ExitReason::EndOfData => f.write_str("END_OF_DATA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlConvention {
    #[default]
    Sigma,
    GrossExposure,
}

impl FromStr for PnlConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sigma" => Ok(PnlConvention::Sigma),
            "gross_exposure" => Ok(PnlConvention::GrossExposure),
            other => Err(format!("unknown pnl convention: {}", other)),
        }
    }
}

impl fmt::Display for PnlConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PnlConvention::Sigma => f.write_str("sigma"),
            PnlConvention::GrossExposure => f.write_str("gross_exposure"),
        }
    }
}

/// Where a position was closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitMark {
    pub timestamp: DateTime<Utc>,
    pub z_score: f64,
    pub price_a: f64,
    pub price_b: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub pair: PairId,
    pub direction: Direction,
    /// Weight-averaged over fills.
    pub entry_z: f64,
    pub exit_z: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_timestamp: DateTime<Utc>,
    pub entry_price_a: f64,
    pub entry_price_b: f64,
    pub exit_price_a: f64,
    pub exit_price_b: f64,
    pub hedge_ratio: f64,
    pub fraction: f64,
    pub fills: usize,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn close(
        pair: PairId,
        direction: Direction,
        position: &OpenPosition,
        exit: ExitMark,
        reason: ExitReason,
        convention: PnlConvention,
    ) -> Self {
        let entry = position.entry_ref();
        Self {
            pair,
            direction,
            entry_z: entry.z_score,
            exit_z: exit.z_score,
            entry_timestamp: entry.timestamp,
            exit_timestamp: exit.timestamp,
            entry_price_a: entry.price_a,
            entry_price_b: entry.price_b,
            exit_price_a: exit.price_a,
            exit_price_b: exit.price_b,
            hedge_ratio: position.hedge_ratio,
            fraction: position.fraction(),
            fills: position.fills.len(),
            pnl_pct: position_pnl_pct(direction, position, &exit, convention),
            exit_reason: reason,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }

    pub fn holding_days(&self) -> f64 {
        (self.exit_timestamp - self.entry_timestamp).num_seconds() as f64 / 86_400.0
    }
}

pub fn position_pnl_pct(
    direction: Direction,
    position: &OpenPosition,
    exit: &ExitMark,
    convention: PnlConvention,
) -> f64 {
    let beta = position.hedge_ratio;
    let exit_spread = exit.price_a - beta * exit.price_b;
    position
        .fills
        .iter()
        .map(|fill| {
            let entry_spread = fill.price_a - beta * fill.price_b;
            let norm = match convention {
                PnlConvention::Sigma => fill.spread_std,
                PnlConvention::GrossExposure => {
                    fill.price_a.abs() + beta.abs() * fill.price_b.abs()
                }
            };
            if !norm.is_finite() || norm <= 0.0 {
                return 0.0;
            }
            let ret = direction.sign() * (exit_spread - entry_spread) / norm * 100.0;
            fill.weight * ret
        })
        .sum()
}
