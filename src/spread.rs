//! Spread and rolling z-score.
//!
//! [`RollingZScore`] is the single piece of z-score arithmetic in the crate:
//! the lazy [`observations`] iterator, the backtest replay and the live
//! monitor all feed spreads through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::error::AnalysisResult;
use crate::model::{check_aligned, PricePoint, PriceSeries};

// Relative floor under which a window counts as degenerate.
const STD_EPSILON: f64 = 1e-12;

/// Whether the regression intercept is subtracted from the spread level.
/// Z-scores do not depend on it; reported spread values do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadConvention {
    #[default]
    ExcludeIntercept,
    IncludeIntercept,
}

impl FromStr for SpreadConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclude_intercept" => Ok(SpreadConvention::ExcludeIntercept),
            "include_intercept" => Ok(SpreadConvention::IncludeIntercept),
            other => Err(format!("unknown spread convention: {}", other)),
        }
    }
}

impl fmt::Display for SpreadConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpreadConvention::ExcludeIntercept => f.write_str("exclude_intercept"),
            SpreadConvention::IncludeIntercept => f.write_str("include_intercept"),
        }
    }
}

/// Hedge parameters from the last successful validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadModel {
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub convention: SpreadConvention,
}

impl SpreadModel {
    pub fn new(hedge_ratio: f64, intercept: f64, convention: SpreadConvention) -> Self {
        Self {
            hedge_ratio,
            intercept,
            convention,
        }
    }

    pub fn spread(&self, price_a: f64, price_b: f64) -> f64 {
        let raw = price_a - self.hedge_ratio * price_b;
        match self.convention {
            SpreadConvention::ExcludeIntercept => raw,
            SpreadConvention::IncludeIntercept => raw - self.intercept,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadObservation {
    pub timestamp: DateTime<Utc>,
    pub price_a: f64,
    pub price_b: f64,
    pub spread: f64,
    pub rolling_mean: f64,
    pub rolling_std: f64,
    /// `None` while the window is filling or when the window is degenerate.
    pub z_score: Option<f64>,
}

impl SpreadObservation {
    pub fn is_defined(&self) -> bool {
        self.z_score.is_some()
    }
}

/// Rolling window length for a half-life measured in observations.
pub fn window_for_half_life(half_life_bars: f64, min_window: usize) -> usize {
    if !half_life_bars.is_finite() || half_life_bars <= 0.0 {
        return min_window;
    }
    ((half_life_bars / 2.0).round() as usize).max(min_window)
}

/// Simple moving window over the last `window` spreads.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingZScore {
    window: usize,
    values: VecDeque<f64>,
}

impl RollingZScore {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            values: VecDeque::with_capacity(window + 1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Adds a spread without producing an observation.
    pub fn prime(&mut self, spread: f64) {
        self.values.push_back(spread);
        while self.values.len() > self.window {
            self.values.pop_front();
        }
    }

    pub fn push(
        &mut self,
        timestamp: DateTime<Utc>,
        price_a: f64,
        price_b: f64,
        spread: f64,
    ) -> SpreadObservation {
        self.prime(spread);
        let (rolling_mean, rolling_std) = self.mean_std();
        let full = self.values.len() == self.window;
        let degenerate = !rolling_std.is_finite()
            || rolling_std <= STD_EPSILON * rolling_mean.abs().max(1.0);
        let z_score = if full && !degenerate && spread.is_finite() {
            Some((spread - rolling_mean) / rolling_std)
        } else {
            None
        };
        SpreadObservation {
            timestamp,
            price_a,
            price_b,
            spread,
            rolling_mean,
            rolling_std,
            z_score,
        }
    }

    fn mean_std(&self) -> (f64, f64) {
        let n = self.values.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        if n < 2 {
            return (mean, 0.0);
        }
        let var = self
            .values
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1) as f64;
        (mean, var.max(0.0).sqrt())
    }
}

/// Lazy spread/z-score sequence over two aligned series. A clone forks the
/// sequence at its current position; [`observations`] replays from the start.
#[derive(Debug, Clone)]
pub struct Observations<'a> {
    model: SpreadModel,
    a: &'a [PricePoint],
    b: &'a [PricePoint],
    index: usize,
    rolling: RollingZScore,
}

impl<'a> Iterator for Observations<'a> {
    type Item = SpreadObservation;

    fn next(&mut self) -> Option<Self::Item> {
        let (pa, pb) = (self.a.get(self.index)?, self.b.get(self.index)?);
        self.index += 1;
        let spread = self.model.spread(pa.price, pb.price);
        Some(self.rolling.push(pa.timestamp, pa.price, pb.price, spread))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.a.len().min(self.b.len()).saturating_sub(self.index);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Observations<'_> {}

pub fn observations<'a>(
    model: SpreadModel,
    a: &'a PriceSeries,
    b: &'a PriceSeries,
    window: usize,
) -> AnalysisResult<Observations<'a>> {
    check_aligned(a, b)?;
    Ok(Observations {
        model,
        a: a.points(),
        b: b.points(),
        index: 0,
        rolling: RollingZScore::new(window),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::model::tests::{day, series};

    fn model() -> SpreadModel {
        SpreadModel::new(2.0, 5.0, SpreadConvention::ExcludeIntercept)
    }

    #[test]
    fn spread_respects_convention() {
        let excl = model();
        let incl = SpreadModel::new(2.0, 5.0, SpreadConvention::IncludeIntercept);
        assert_eq!(excl.spread(30.0, 10.0), 10.0);
        assert_eq!(incl.spread(30.0, 10.0), 5.0);
        assert_eq!(
            "include_intercept".parse::<SpreadConvention>(),
            Ok(SpreadConvention::IncludeIntercept)
        );
        assert!("both".parse::<SpreadConvention>().is_err());
    }

    #[test]
    fn window_follows_half_life_with_floor() {
        assert_eq!(window_for_half_life(30.0, 10), 15);
        assert_eq!(window_for_half_life(13.0, 10), 10);
        assert_eq!(window_for_half_life(41.0, 10), 21);
        assert_eq!(window_for_half_life(f64::INFINITY, 10), 10);
    }

    #[test]
    fn z_score_undefined_until_window_fills() {
        let a = series("A", &[1.0, 2.0, 3.0, 4.0]);
        let b = series("B", &[0.0, 0.0, 0.0, 0.0]);
        let obs: Vec<_> = observations(model(), &a, &b, 3).unwrap().collect();
        assert_eq!(obs.len(), 4);
        assert!(obs[0].z_score.is_none());
        assert!(obs[1].z_score.is_none());
        // window [1,2,3]: mean 2, sample std 1
        assert_eq!(obs[2].rolling_mean, 2.0);
        assert_eq!(obs[2].rolling_std, 1.0);
        assert_eq!(obs[2].z_score, Some(1.0));
        assert_eq!(obs[3].z_score, Some(1.0));
    }

    #[test]
    fn flat_window_is_undefined_and_does_not_panic() {
        let a = series("A", &[0.1; 12]);
        let b = series("B", &[0.0; 12]);
        let obs: Vec<_> = observations(model(), &a, &b, 5).unwrap().collect();
        assert!(obs.iter().all(|o| o.z_score.is_none()));
        assert!(obs.iter().all(|o| o.rolling_std.abs() < 1e-9));
    }

    #[test]
    fn iterator_is_restartable() {
        let a = series("A", &[1.0, 3.0, 2.0, 5.0, 4.0, 6.0]);
        let b = series("B", &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let first: Vec<_> = observations(model(), &a, &b, 3).unwrap().collect();
        let second: Vec<_> = observations(model(), &a, &b, 3).unwrap().collect();
        assert_eq!(first, second);

        let mut iter = observations(model(), &a, &b, 3).unwrap();
        iter.next();
        let fork = iter.clone();
        assert_eq!(iter.collect::<Vec<_>>(), fork.collect::<Vec<_>>());
    }

    #[test]
    fn misaligned_series_are_rejected() {
        let a = series("A", &[1.0, 2.0]);
        let b = PriceSeries::new(
            "B",
            vec![PricePoint::new(day(0), 1.0), PricePoint::new(day(3), 1.0)],
        )
        .unwrap();
        assert_eq!(
            observations(model(), &a, &b, 2).err(),
            Some(AnalysisError::MisalignedSeries { index: 1 })
        );
    }
}
