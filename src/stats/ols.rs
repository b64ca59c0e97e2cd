use crate::error::{AnalysisError, AnalysisResult};

const PIVOT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub struct OlsFit {
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub rss: f64,
    pub nobs: usize,
}

impl OlsFit {
    pub fn t_stat(&self, index: usize) -> f64 {
        let se = self.std_errors[index];
        if se > 0.0 {
            self.coefficients[index] / se
        } else {
            0.0
        }
    }

    /// Gaussian log-likelihood based AIC, as reported by common stats packages.
    pub fn aic(&self) -> f64 {
        let n = self.nobs as f64;
        let k = self.coefficients.len() as f64;
        let sigma2 = (self.rss / n).max(f64::MIN_POSITIVE);
        let llf = -0.5 * n * ((2.0 * std::f64::consts::PI).ln() + sigma2.ln() + 1.0);
        -2.0 * llf + 2.0 * k
    }
}

/// y = intercept + slope * x, fitted on centered data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleFit {
    pub intercept: f64,
    pub slope: f64,
}

pub fn simple_regression(
    x: &[f64],
    y: &[f64],
    context: &'static str,
) -> AnalysisResult<SimpleFit> {
    let n = x.len().min(y.len());
    if n < 2 {
        return Err(AnalysisError::InsufficientData {
            expected: 2,
            actual: n,
        });
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..n {
        let dx = x[i] - mean_x;
        sxy += dx * (y[i] - mean_y);
        sxx += dx * dx;
    }
    let scale = n as f64 * (1.0 + mean_x * mean_x);
    if !sxx.is_finite() || sxx <= 1e-12 * scale {
        return Err(AnalysisError::RegressionSingular { context });
    }
    let slope = sxy / sxx;
    Ok(SimpleFit {
        intercept: mean_y - slope * mean_x,
        slope,
    })
}

/// Ordinary least squares on a dense design matrix (one row per observation).
pub fn ols(design: &[Vec<f64>], y: &[f64], context: &'static str) -> AnalysisResult<OlsFit> {
    let n = design.len();
    let k = design.first().map(|row| row.len()).unwrap_or(0);
    if k == 0 || n != y.len() || n <= k {
        return Err(AnalysisError::InsufficientData {
            expected: k + 1,
            actual: n.min(y.len()),
        });
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, &yi) in design.iter().zip(y) {
        for a in 0..k {
            xty[a] += row[a] * yi;
            for b in a..k {
                xtx[a][b] += row[a] * row[b];
            }
        }
    }
    for a in 0..k {
        for b in 0..a {
            xtx[a][b] = xtx[b][a];
        }
    }

    let inverse = invert(xtx).ok_or(AnalysisError::RegressionSingular { context })?;
    let coefficients: Vec<f64> = (0..k)
        .map(|a| (0..k).map(|b| inverse[a][b] * xty[b]).sum())
        .collect();

    let rss = design
        .iter()
        .zip(y)
        .map(|(row, &yi)| {
            let fit: f64 = row.iter().zip(&coefficients).map(|(x, c)| x * c).sum();
            let err = yi - fit;
            err * err
        })
        .sum::<f64>();
    let sigma2 = rss / (n - k) as f64;
    let std_errors = (0..k)
        .map(|a| (sigma2 * inverse[a][a]).max(0.0).sqrt())
        .collect();

    Ok(OlsFit {
        coefficients,
        std_errors,
        rss,
        nobs: n,
    })
}

// Gauss-Jordan with partial pivoting. None when the matrix is (numerically) singular.
fn invert(mut m: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let k = m.len();
    let scale = (0..k).map(|i| m[i][i].abs()).fold(0.0_f64, f64::max);
    if !scale.is_finite() || scale == 0.0 {
        return None;
    }
    let mut inv: Vec<Vec<f64>> = (0..k)
        .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..k {
        let pivot_row = (col..k).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot_row][col].abs() <= PIVOT_TOLERANCE * scale {
            return None;
        }
        m.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = m[col][col];
        for j in 0..k {
            m[col][j] /= pivot;
            inv[col][j] /= pivot;
        }
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = m[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..k {
                m[row][j] -= factor * m[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_regression_recovers_line() {
        let x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 + 0.5 * v).collect();
        let fit = simple_regression(&x, &y, "test").unwrap();
        assert!((fit.slope - 0.5).abs() < 1e-12);
        assert!((fit.intercept - 3.0).abs() < 1e-10);
    }

    #[test]
    fn simple_regression_flags_constant_regressor() {
        let x = vec![7.0; 30];
        let y: Vec<f64> = (0..30).map(|i| i as f64).collect();
        assert_eq!(
            simple_regression(&x, &y, "flat"),
            Err(AnalysisError::RegressionSingular { context: "flat" })
        );
    }

    #[test]
    fn ols_matches_known_coefficients() {
        // y = 1 + 2*x1 - 3*x2 plus a small deterministic wobble
        let design: Vec<Vec<f64>> = (0..40)
            .map(|i| {
                let x1 = i as f64;
                let x2 = ((i * 7) % 11) as f64;
                vec![1.0, x1, x2]
            })
            .collect();
        let y: Vec<f64> = design
            .iter()
            .enumerate()
            .map(|(i, r)| 1.0 + 2.0 * r[1] - 3.0 * r[2] + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        let fit = ols(&design, &y, "test").unwrap();
        assert!((fit.coefficients[0] - 1.0).abs() < 0.05);
        assert!((fit.coefficients[1] - 2.0).abs() < 1e-3);
        assert!((fit.coefficients[2] + 3.0).abs() < 1e-2);
        assert!(fit.std_errors.iter().all(|se| se.is_finite() && *se > 0.0));
    }

    #[test]
    fn ols_detects_collinear_columns() {
        let design: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![1.0, i as f64, 2.0 * i as f64])
            .collect();
        let y: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert!(matches!(
            ols(&design, &y, "collinear"),
            Err(AnalysisError::RegressionSingular { .. })
        ));
    }
}
