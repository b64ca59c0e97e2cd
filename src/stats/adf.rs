//! Augmented Dickey-Fuller test on cointegrating-regression residuals.
//!
//! Lag order is picked by AIC on a common sample and the chosen model is refit
//! on every usable row. P-values use MacKinnon's (1994) approximate response
//! surfaces for the constant case; critical values are interpolated by sample
//! size from MacKinnon (2010).

use statrs::function::erf::erfc;

use super::ols::ols;
use crate::error::{AnalysisError, AnalysisResult};

// Per number of variables N (index N-1), constant-term surfaces.
const TAU_MAX_C: [f64; 2] = [2.74, 0.92];
const TAU_MIN_C: [f64; 2] = [-18.83, -18.86];
const TAU_STAR_C: [f64; 2] = [-1.61, -2.62];
const TAU_SMALLP_C: [[f64; 3]; 2] = [[2.1659, 1.4412, 0.038269], [2.92, 1.5012, 0.039796]];
const TAU_LARGEP_C: [[f64; 4]; 2] = [
    [1.7339, 0.93202, -0.12745, -0.010368],
    [2.1945, 0.64695, -0.29198, -0.042377],
];

// (nobs, 1%, 5%, 10%) for a single series with a constant.
const DF_CRITS: &[(usize, f64, f64, f64)] = &[
    (25, -3.75, -3.00, -2.63),
    (50, -3.58, -2.93, -2.60),
    (100, -3.51, -2.89, -2.58),
    (250, -3.46, -2.88, -2.57),
    (500, -3.44, -2.87, -2.57),
];

// Same layout, Engle-Granger residual test with two variables.
const EG_CRITS: &[(usize, f64, f64, f64)] = &[
    (25, -4.37, -3.59, -3.22),
    (50, -4.12, -3.46, -3.13),
    (100, -4.01, -3.40, -3.09),
    (250, -3.94, -3.36, -3.06),
    (500, -3.92, -3.35, -3.05),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriticalValues {
    pub one_pct: f64,
    pub five_pct: f64,
    pub ten_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub p_value: f64,
    pub used_lag: usize,
    pub nobs: usize,
    pub critical_values: CriticalValues,
}

/// Schwert's rule of thumb, bounded so every candidate model stays estimable.
pub fn default_max_lag(len: usize) -> usize {
    let rule = (12.0 * (len as f64 / 100.0).powf(0.25)).ceil() as usize;
    rule.min((len / 2).saturating_sub(2))
}

/// ADF without deterministic terms, as used on Engle-Granger residuals:
/// Δe_t = γ·e_{t-1} + Σ φ_j·Δe_{t-j} + ε_t. The statistic is the t-ratio of γ.
pub fn residual_adf(residuals: &[f64], max_lag: Option<usize>) -> AnalysisResult<AdfResult> {
    run_adf(residuals, max_lag, false, 2, EG_CRITS)
}

/// ADF with a constant on a single series: Δy_t = c + γ·y_{t-1} + Σ φ_j·Δy_{t-j} + ε_t.
pub fn adf_test(series: &[f64], max_lag: Option<usize>) -> AnalysisResult<AdfResult> {
    run_adf(series, max_lag, true, 1, DF_CRITS)
}

fn run_adf(
    levels: &[f64],
    max_lag: Option<usize>,
    constant: bool,
    n_vars: usize,
    crits: &[(usize, f64, f64, f64)],
) -> AnalysisResult<AdfResult> {
    let len = levels.len();
    if len < 8 {
        return Err(AnalysisError::InsufficientData {
            expected: 8,
            actual: len,
        });
    }
    let max_lag = max_lag
        .unwrap_or_else(|| default_max_lag(len))
        .min((len / 2).saturating_sub(2));

    let diffs: Vec<f64> = levels.windows(2).map(|w| w[1] - w[0]).collect();

    let mut best: Option<(usize, f64)> = None;
    for lag in 0..=max_lag {
        let (design, y) = adf_rows(levels, &diffs, lag, max_lag, constant);
        let fit = match ols(&design, &y, "adf lag selection") {
            Ok(fit) => fit,
            Err(AnalysisError::RegressionSingular { .. }) if lag > 0 => continue,
            Err(err) => return Err(err),
        };
        let aic = fit.aic();
        if best.map(|(_, b)| aic < b).unwrap_or(true) {
            best = Some((lag, aic));
        }
    }
    let used_lag = best.map(|(lag, _)| lag).unwrap_or(0);

    let (design, y) = adf_rows(levels, &diffs, used_lag, used_lag, constant);
    let fit = ols(&design, &y, "adf regression")?;
    let statistic = fit.t_stat(0);
    let nobs = fit.nobs;
    Ok(AdfResult {
        statistic,
        p_value: mackinnon_p(statistic, n_vars),
        used_lag,
        nobs,
        critical_values: interpolate_crits(nobs, crits),
    })
}

// Rows start at diff index `start` so models with different lags can share a sample.
fn adf_rows(
    levels: &[f64],
    diffs: &[f64],
    lag: usize,
    start: usize,
    constant: bool,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut design = Vec::with_capacity(diffs.len().saturating_sub(start));
    let mut y = Vec::with_capacity(diffs.len().saturating_sub(start));
    for j in start.max(lag)..diffs.len() {
        let mut row = Vec::with_capacity(lag + 2);
        row.push(levels[j]);
        for l in 1..=lag {
            row.push(diffs[j - l]);
        }
        if constant {
            row.push(1.0);
        }
        design.push(row);
        y.push(diffs[j]);
    }
    (design, y)
}

/// Approximate asymptotic p-value for an ADF-type statistic with a constant,
/// for `n_vars` = 1 (plain ADF) or 2 (Engle-Granger on a pair).
pub fn mackinnon_p(statistic: f64, n_vars: usize) -> f64 {
    let idx = n_vars.clamp(1, 2) - 1;
    if statistic.is_nan() {
        return 1.0;
    }
    if statistic > TAU_MAX_C[idx] {
        return 1.0;
    }
    if statistic < TAU_MIN_C[idx] {
        return 0.0;
    }
    let x = statistic;
    let poly = if x <= TAU_STAR_C[idx] {
        let c = TAU_SMALLP_C[idx];
        c[0] + c[1] * x + c[2] * x * x
    } else {
        let c = TAU_LARGEP_C[idx];
        c[0] + c[1] * x + c[2] * x * x + c[3] * x * x * x
    };
    standard_normal_cdf(poly)
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

fn interpolate_crits(n: usize, table: &[(usize, f64, f64, f64)]) -> CriticalValues {
    let pick = |(_, c1, c5, c10): (usize, f64, f64, f64)| CriticalValues {
        one_pct: c1,
        five_pct: c5,
        ten_pct: c10,
    };
    if n <= table[0].0 {
        return pick(table[0]);
    }
    for w in table.windows(2) {
        let (n1, c1_1, c5_1, c10_1) = w[0];
        let (n2, c1_2, c5_2, c10_2) = w[1];
        if n >= n1 && n <= n2 {
            let t = (n - n1) as f64 / (n2 - n1) as f64;
            let lerp = |a: f64, b: f64| a + t * (b - a);
            return CriticalValues {
                one_pct: lerp(c1_1, c1_2),
                five_pct: lerp(c5_1, c5_2),
                ten_pct: lerp(c10_1, c10_2),
            };
        }
    }
    pick(table[table.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn mackinnon_p_matches_five_percent_critical_values() {
        // asymptotic 5% points: -2.86 for N=1, -3.34 for N=2
        let p1 = mackinnon_p(-2.86, 1);
        let p2 = mackinnon_p(-3.34, 2);
        assert!((p1 - 0.05).abs() < 0.005, "p1={}", p1);
        assert!((p2 - 0.05).abs() < 0.005, "p2={}", p2);
    }

    #[test]
    fn mackinnon_p_is_monotone_and_bounded() {
        assert_eq!(mackinnon_p(5.0, 2), 1.0);
        assert_eq!(mackinnon_p(-25.0, 2), 0.0);
        let mut prev = 0.0;
        for i in 0..60 {
            let stat = -6.0 + i as f64 * 0.1;
            let p = mackinnon_p(stat, 2);
            assert!(p >= prev - 1e-3, "p-value dropped at {}", stat);
            assert!((0.0..=1.0).contains(&p));
            prev = p;
        }
    }

    #[test]
    fn stationary_residuals_reject_unit_root() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut e = vec![0.0];
        for _ in 1..500 {
            let last = *e.last().unwrap();
            e.push(0.5 * last + noise.sample(&mut rng));
        }
        let res = residual_adf(&e, None).unwrap();
        assert!(res.statistic < res.critical_values.one_pct);
        assert!(res.p_value < 0.01);
    }

    #[test]
    fn random_walk_keeps_unit_root() {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut e = vec![0.0];
        for _ in 1..500 {
            let last = *e.last().unwrap();
            e.push(last + noise.sample(&mut rng) + 0.05);
        }
        let res = residual_adf(&e, Some(4)).unwrap();
        assert!(res.p_value > 0.05, "p={}", res.p_value);
    }

    #[test]
    fn level_adf_handles_offset_series() {
        let mut rng = StdRng::seed_from_u64(3);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut y = vec![50.0];
        for _ in 1..400 {
            let last = *y.last().unwrap();
            y.push(50.0 + 0.6 * (last - 50.0) + noise.sample(&mut rng));
        }
        let res = adf_test(&y, None).unwrap();
        assert!(res.p_value < 0.01, "p={}", res.p_value);
        assert!((res.critical_values.five_pct - (-2.875)).abs() < 0.01);
    }

    #[test]
    fn short_input_is_insufficient() {
        assert!(matches!(
            residual_adf(&[1.0, 2.0, 1.0], None),
            Err(AnalysisError::InsufficientData { .. })
        ));
    }

    #[test]
    fn crits_interpolate_between_rows() {
        let c = interpolate_crits(75, EG_CRITS);
        assert!((c.five_pct - (-3.43)).abs() < 1e-9);
        let tail = interpolate_crits(10_000, EG_CRITS);
        assert_eq!(tail.one_pct, -3.92);
    }
}
