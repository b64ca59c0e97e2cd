//! Engle-Granger two-step cointegration test.

use std::fmt;

use crate::config::StrategyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::{check_aligned, PriceSeries};
use crate::stats::{adf, mean_std, residual_adf, simple_regression, AdfResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CointegrationResult {
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub p_value: f64,
    /// Residual ADF (no deterministic terms, Engle-Granger p-value).
    pub adf: AdfResult,
    /// ADF with a constant on A − β·B, kept as a diagnostic.
    pub spread_adf: Option<AdfResult>,
    /// A_t − intercept − β·B_t.
    pub residuals: Vec<f64>,
    pub spread_mean: f64,
    pub spread_std: f64,
}

impl CointegrationResult {
    pub fn passes(&self, p_value_threshold: f64) -> bool {
        self.p_value < p_value_threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CointegrationTester {
    min_observations: usize,
    max_lag: Option<usize>,
}

impl CointegrationTester {
    pub fn new(min_observations: usize, max_lag: Option<usize>) -> Self {
        Self {
            min_observations,
            max_lag,
        }
    }

    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self::new(cfg.min_observations, cfg.adf_max_lag)
    }

    pub fn min_observations(&self) -> usize {
        self.min_observations
    }

    pub fn test(&self, a: &PriceSeries, b: &PriceSeries) -> AnalysisResult<CointegrationResult> {
        check_aligned(a, b)?;
        self.test_prices(&a.prices(), &b.prices())
    }

    /// Same as [`test`](Self::test) for price slices that are already aligned.
    pub fn test_prices(&self, a: &[f64], b: &[f64]) -> AnalysisResult<CointegrationResult> {
        if a.len() != b.len() {
            return Err(AnalysisError::MisalignedSeries {
                index: a.len().min(b.len()),
            });
        }
        if a.len() < self.min_observations {
            return Err(AnalysisError::InsufficientData {
                expected: self.min_observations,
                actual: a.len(),
            });
        }

        let fit = simple_regression(b, a, "hedge ratio")?;
        let residuals: Vec<f64> = a
            .iter()
            .zip(b)
            .map(|(pa, pb)| pa - fit.intercept - fit.slope * pb)
            .collect();
        let adf = residual_adf(&residuals, self.max_lag)?;

        let spread: Vec<f64> = a.iter().zip(b).map(|(pa, pb)| pa - fit.slope * pb).collect();
        let (spread_mean, spread_std) = mean_std(&spread);
        let spread_adf = adf::adf_test(&spread, self.max_lag).ok();

        Ok(CointegrationResult {
            hedge_ratio: fit.slope,
            intercept: fit.intercept,
            p_value: adf.p_value,
            adf,
            spread_adf,
            residuals,
            spread_mean,
            spread_std,
        })
    }
}

/// Why a previously validated relationship is considered broken.
#[derive(Debug, Clone, PartialEq)]
pub enum Breakdown {
    PValue { p_value: f64 },
    HedgeRatioDrift { drift: f64 },
    HalfLifeTooShort { half_life: f64 },
    HalfLifeTooLong { half_life: f64 },
    Failed { message: String },
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakdown::PValue { p_value } => write!(f, "p-value breakdown: {:.3}", p_value),
            Breakdown::HedgeRatioDrift { drift } => {
                write!(f, "hedge ratio drift: {:.1}%", drift * 100.0)
            }
            Breakdown::HalfLifeTooShort { half_life } => {
                write!(f, "half-life too short: {:.1}", half_life)
            }
            Breakdown::HalfLifeTooLong { half_life } => {
                write!(f, "half-life too long: {:.1}", half_life)
            }
            Breakdown::Failed { message } => write!(f, "revalidation failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakdownPolicy {
    pub p_value_exit_threshold: f64,
    pub hedge_ratio_drift_threshold: f64,
    pub min_half_life: f64,
    pub max_half_life: f64,
}

impl BreakdownPolicy {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            p_value_exit_threshold: cfg.p_value_exit_threshold,
            hedge_ratio_drift_threshold: cfg.hedge_ratio_drift_threshold,
            min_half_life: cfg.min_half_life,
            max_half_life: cfg.max_half_life,
        }
    }

    /// Checks a fresh test against the hedge ratio the pair is trading with.
    /// `half_life` is in days.
    pub fn check(
        &self,
        p_value: f64,
        hedge_ratio: f64,
        half_life: f64,
        previous_hedge_ratio: f64,
    ) -> Option<Breakdown> {
        if p_value > self.p_value_exit_threshold {
            return Some(Breakdown::PValue { p_value });
        }
        if previous_hedge_ratio != 0.0 {
            let drift = (hedge_ratio - previous_hedge_ratio).abs() / previous_hedge_ratio.abs();
            if drift > self.hedge_ratio_drift_threshold {
                return Some(Breakdown::HedgeRatioDrift { drift });
            }
        }
        if half_life < self.min_half_life {
            return Some(Breakdown::HalfLifeTooShort { half_life });
        }
        if half_life > self.max_half_life {
            return Some(Breakdown::HalfLifeTooLong { half_life });
        }
        None
    }
}
