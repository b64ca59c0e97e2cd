use chrono::Duration;

use crate::config::StrategyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::bars_per_day;
use crate::stats::simple_regression;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfLifeEstimate {
    /// Slope of Δr_t on r_{t-1}; negative when the residual mean-reverts.
    pub lambda: f64,
    /// Half-life in observations, +inf without reversion.
    pub bars: f64,
    /// Half-life in days at the series' sampling interval.
    pub days: f64,
}

impl HalfLifeEstimate {
    pub fn is_mean_reverting(&self) -> bool {
        self.bars.is_finite()
    }

    pub fn mean_reverting(self) -> AnalysisResult<Self> {
        if self.is_mean_reverting() {
            Ok(self)
        } else {
            Err(AnalysisError::NoMeanReversion {
                lambda: self.lambda,
            })
        }
    }
}

/// Half-life in observations for an AR(1) slope on first differences.
pub fn half_life_bars(lambda: f64) -> f64 {
    if !lambda.is_finite() || lambda >= 0.0 {
        return f64::INFINITY;
    }
    if lambda <= -1.0 {
        return 0.0;
    }
    std::f64::consts::LN_2 / (1.0 / (1.0 + lambda)).ln()
}

#[derive(Debug, Clone, Copy)]
pub struct HalfLifeEstimator {
    min_observations: usize,
}

impl HalfLifeEstimator {
    pub fn new(min_observations: usize) -> Self {
        Self {
            min_observations: min_observations.max(3),
        }
    }

    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self::new(cfg.min_half_life_observations)
    }

    /// Fits Δr_t = c + λ·r_{t-1} + ε by OLS.
    pub fn estimate(
        &self,
        residuals: &[f64],
        interval: Duration,
    ) -> AnalysisResult<HalfLifeEstimate> {
        if residuals.len() < self.min_observations {
            return Err(AnalysisError::InsufficientData {
                expected: self.min_observations,
                actual: residuals.len(),
            });
        }
        let lagged = &residuals[..residuals.len() - 1];
        let diffs: Vec<f64> = residuals.windows(2).map(|w| w[1] - w[0]).collect();
        let fit = simple_regression(lagged, &diffs, "half-life")?;
        let lambda = fit.slope;
        let bars = half_life_bars(lambda);
        Ok(HalfLifeEstimate {
            lambda,
            bars,
            days: bars / bars_per_day(interval),
        })
    }
}
