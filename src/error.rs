use thiserror::Error;

/// Per-pair analysis failures. None of these are fatal: the scanner and the
/// backtest engine record them against the offending pair and move on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("insufficient data: expected at least {expected} observations, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("series are misaligned at index {index}")]
    MisalignedSeries { index: usize },

    #[error("series {symbol} is not strictly increasing at index {index}")]
    UnorderedSeries { symbol: String, index: usize },

    #[error("singular regression design ({context})")]
    RegressionSingular { context: &'static str },

    #[error("no mean reversion (lambda={lambda:.6})")]
    NoMeanReversion { lambda: f64 },

    #[error("no price series for {symbol}")]
    MissingSeries { symbol: String },
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;
