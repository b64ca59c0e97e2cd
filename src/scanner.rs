use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cointegration::{CointegrationResult, CointegrationTester};
use crate::config::StrategyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::half_life::{HalfLifeEstimate, HalfLifeEstimator};
use crate::model::{
    align, check_aligned, Pair, PairId, PairSpec, PairStatus, PriceSeries, Rejection,
};
use crate::workers::run_bounded;

const SCORE_P_VALUE_WEIGHT: f64 = 0.6;
const SCORE_HALF_LIFE_WEIGHT: f64 = 0.4;
const SCORE_TARGET_HALF_LIFE: f64 = 20.0;
const SCORE_HALF_LIFE_SCALE: f64 = 50.0;

/// Outcome of validating one pair. `pair` is always filled in; `error` is set
/// when the analysis itself failed rather than a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub pair: Pair,
    pub cointegration: Option<CointegrationResult>,
    pub half_life: Option<HalfLifeEstimate>,
    pub error: Option<AnalysisError>,
}

impl Validation {
    pub fn is_cointegrated(&self) -> bool {
        self.pair.is_cointegrated()
    }

    fn failed(mut pair: Pair, error: AnalysisError) -> Self {
        pair.status = PairStatus::Rejected;
        pair.rejection = Some(Rejection::Analysis {
            message: error.to_string(),
        });
        Self {
            pair,
            cointegration: None,
            half_life: None,
            error: Some(error),
        }
    }
}

/// Cointegration test, half-life and the status thresholds in one place.
#[derive(Debug, Clone, Copy)]
pub struct PairValidator {
    tester: CointegrationTester,
    estimator: HalfLifeEstimator,
    p_value_threshold: f64,
    min_half_life: f64,
    max_half_life: f64,
}

impl PairValidator {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            tester: CointegrationTester::from_config(cfg),
            estimator: HalfLifeEstimator::from_config(cfg),
            p_value_threshold: cfg.p_value_threshold,
            min_half_life: cfg.min_half_life,
            max_half_life: cfg.max_half_life,
        }
    }

    pub fn validate(
        &self,
        spec: &PairSpec,
        a: &PriceSeries,
        b: &PriceSeries,
        at: DateTime<Utc>,
    ) -> Validation {
        if let Err(e) = check_aligned(a, b) {
            return Validation::failed(Pair::candidate(spec, at), e);
        }
        let interval = a.sampling_interval().unwrap_or_else(|| Duration::days(1));
        self.validate_prices(spec, &a.prices(), &b.prices(), interval, at)
    }

    /// Validates aligned price slices sampled every `interval`.
    pub fn validate_prices(
        &self,
        spec: &PairSpec,
        a: &[f64],
        b: &[f64],
        interval: Duration,
        at: DateTime<Utc>,
    ) -> Validation {
        let mut pair = Pair::candidate(spec, at);
        let coint = match self.tester.test_prices(a, b) {
            Ok(result) => result,
            Err(e) => return Validation::failed(pair, e),
        };
        pair.hedge_ratio = coint.hedge_ratio;
        pair.intercept = coint.intercept;
        pair.p_value = coint.p_value;

        let estimate = self.estimator.estimate(&coint.residuals, interval);
        if !coint.passes(self.p_value_threshold) {
            let estimate = estimate.ok();
            pair.half_life = estimate.map(|e| e.days).unwrap_or(f64::INFINITY);
            pair.status = PairStatus::Rejected;
            pair.rejection = Some(Rejection::PValue {
                p_value: coint.p_value,
            });
            return Validation {
                pair,
                cointegration: Some(coint),
                half_life: estimate,
                error: None,
            };
        }

        let estimate = match estimate {
            Ok(estimate) => estimate,
            Err(e) => {
                let mut failed = Validation::failed(pair, e);
                failed.cointegration = Some(coint);
                return failed;
            }
        };
        pair.half_life = estimate.days;
        if !estimate.is_mean_reverting() {
            pair.status = PairStatus::Rejected;
            pair.rejection = Some(Rejection::NoMeanReversion);
        } else if estimate.days < self.min_half_life || estimate.days > self.max_half_life {
            pair.status = PairStatus::Rejected;
            pair.rejection = Some(Rejection::HalfLifeOutOfRange {
                half_life: estimate.days,
            });
        } else {
            pair.status = PairStatus::Cointegrated;
        }
        Validation {
            pair,
            cointegration: Some(coint),
            half_life: Some(estimate),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// One entry per universe pair, in universe order.
    pub validations: Vec<Validation>,
}

impl ScanResult {
    pub fn pairs(&self) -> impl Iterator<Item = &Pair> {
        self.validations.iter().map(|v| &v.pair)
    }

    pub fn cointegrated(&self) -> impl Iterator<Item = &Pair> {
        self.pairs().filter(|p| p.is_cointegrated())
    }

    pub fn errors(&self) -> impl Iterator<Item = (&Pair, &AnalysisError)> {
        self.validations
            .iter()
            .filter_map(|v| v.error.as_ref().map(|e| (&v.pair, e)))
    }

    /// Counts against `known`, the previously stored records. A pair is new
    /// when it is cointegrated now and was not cointegrated in `known`.
    pub fn summary(&self, known: &HashMap<PairId, Pair>) -> ScanSummary {
        let pairs_scanned = self
            .validations
            .iter()
            .filter(|v| v.cointegration.is_some())
            .count();
        let new_pairs = self
            .cointegrated()
            .filter(|p| !known.get(&p.id()).is_some_and(Pair::is_cointegrated))
            .count();
        ScanSummary {
            pairs_scanned,
            cointegrated_found: self.cointegrated().count(),
            new_pairs,
            skipped: self.validations.len() - pairs_scanned,
        }
    }

    /// Best `n` cointegrated pairs by [`pair_score`], highest first.
    pub fn top_pairs(&self, n: usize) -> Vec<(&Pair, f64)> {
        let mut ranked: Vec<_> = self.cointegrated().map(|p| (p, pair_score(p))).collect();
        ranked.sort_by(|x, y| y.1.total_cmp(&x.1));
        ranked.truncate(n);
        ranked
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Pairs the cointegration test ran on.
    pub pairs_scanned: usize,
    pub cointegrated_found: usize,
    pub new_pairs: usize,
    /// Missing, short or degenerate series the test could not run on.
    pub skipped: usize,
}

/// Ranking score: 60% weight on a low p-value, 40% on a half-life close to
/// 20 days.
pub fn pair_score(pair: &Pair) -> f64 {
    let p_value_score = 1.0 - pair.p_value;
    let half_life_score =
        1.0 - (pair.half_life - SCORE_TARGET_HALF_LIFE).abs() / SCORE_HALF_LIFE_SCALE;
    SCORE_P_VALUE_WEIGHT * p_value_score + SCORE_HALF_LIFE_WEIGHT * half_life_score
}

/// Runs the validator over a universe. One pair's failure never stops the scan.
#[derive(Debug, Clone)]
pub struct Scanner {
    validator: PairValidator,
    max_concurrency: usize,
}

impl Scanner {
    pub fn new(cfg: &StrategyConfig) -> Self {
        Self {
            validator: PairValidator::from_config(cfg),
            max_concurrency: cfg.max_concurrency,
        }
    }

    pub fn validator(&self) -> &PairValidator {
        &self.validator
    }

    /// Looks both legs up in `prices`, aligns them by timestamp and validates.
    pub fn scan_pair(
        &self,
        spec: &PairSpec,
        prices: &HashMap<String, PriceSeries>,
        at: DateTime<Utc>,
    ) -> Validation {
        match lookup_pair(spec, prices) {
            Ok((a, b)) => {
                let (a, b) = align(a, b);
                self.validator.validate(spec, &a, &b, at)
            }
            Err(e) => Validation::failed(Pair::candidate(spec, at), e),
        }
    }

    pub async fn scan(
        &self,
        universe: &[PairSpec],
        prices: Arc<HashMap<String, PriceSeries>>,
        at: DateTime<Utc>,
    ) -> ScanResult {
        log::info!("[SCAN] validating {} pairs", universe.len());
        let scanner = self.clone();
        let outcomes = run_bounded(universe.to_vec(), self.max_concurrency, move |spec| {
            scanner.scan_pair(&spec, &prices, at)
        })
        .await;

        let validations: Vec<Validation> = universe
            .iter()
            .zip(outcomes)
            .map(|(spec, outcome)| match outcome {
                Ok(v) => v,
                Err(e) => {
                    let mut pair = Pair::candidate(spec, at);
                    pair.status = PairStatus::Rejected;
                    pair.rejection = Some(Rejection::Analysis {
                        message: e.to_string(),
                    });
                    Validation {
                        pair,
                        cointegration: None,
                        half_life: None,
                        error: None,
                    }
                }
            })
            .collect();

        for v in &validations {
            match (&v.pair.rejection, &v.error) {
                (_, Some(e)) => log::warn!("[SCAN] {} error: {}", v.pair.id(), e),
                (Some(reason), None) => {
                    log::info!("[SCAN] {} rejected: {}", v.pair.id(), reason)
                }
                (None, None) => log::info!(
                    "[SCAN] {} cointegrated p={:.4} beta={:.4} half_life={:.1}d",
                    v.pair.id(),
                    v.pair.p_value,
                    v.pair.hedge_ratio,
                    v.pair.half_life
                ),
            }
        }
        let result = ScanResult { validations };
        log::info!(
            "[SCAN] {} of {} pairs cointegrated",
            result.cointegrated().count(),
            universe.len()
        );
        result
    }
}

pub(crate) fn lookup_pair<'a>(
    spec: &PairSpec,
    prices: &'a HashMap<String, PriceSeries>,
) -> AnalysisResult<(&'a PriceSeries, &'a PriceSeries)> {
    let a = prices
        .get(&spec.symbol_a)
        .ok_or_else(|| AnalysisError::MissingSeries {
            symbol: spec.symbol_a.clone(),
        })?;
    let b = prices
        .get(&spec.symbol_b)
        .ok_or_else(|| AnalysisError::MissingSeries {
            symbol: spec.symbol_b.clone(),
        })?;
    Ok((a, b))
}
