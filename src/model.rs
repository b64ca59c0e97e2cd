use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AnalysisError, AnalysisResult};

const SECS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// Ordered prices for one instrument. Timestamps are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    symbol: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, points: Vec<PricePoint>) -> AnalysisResult<Self> {
        let symbol = symbol.into();
        for (index, win) in points.windows(2).enumerate() {
            if win[1].timestamp <= win[0].timestamp {
                return Err(AnalysisError::UnorderedSeries {
                    symbol,
                    index: index + 1,
                });
            }
        }
        Ok(Self { symbol, points })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    /// Median spacing between consecutive observations.
    pub fn sampling_interval(&self) -> Option<Duration> {
        median_interval(&self.points)
    }
}

pub(crate) fn median_interval(points: &[PricePoint]) -> Option<Duration> {
    if points.len() < 2 {
        return None;
    }
    let mut deltas: Vec<i64> = points
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds())
        .collect();
    deltas.sort_unstable();
    Some(Duration::seconds(deltas[deltas.len() / 2]))
}

/// Observations per day for a sampling interval; daily bars give 1.0.
pub fn bars_per_day(interval: Duration) -> f64 {
    let secs = interval.num_seconds();
    if secs <= 0 {
        return 1.0;
    }
    SECS_PER_DAY / secs as f64
}

/// Checks that two series share the same timestamps one-to-one.
pub fn check_aligned(a: &PriceSeries, b: &PriceSeries) -> AnalysisResult<()> {
    for (index, (pa, pb)) in a.points.iter().zip(b.points.iter()).enumerate() {
        if pa.timestamp != pb.timestamp {
            return Err(AnalysisError::MisalignedSeries { index });
        }
    }
    if a.len() != b.len() {
        return Err(AnalysisError::MisalignedSeries {
            index: a.len().min(b.len()),
        });
    }
    Ok(())
}

/// Restricts both series to their common timestamps.
pub fn align(a: &PriceSeries, b: &PriceSeries) -> (PriceSeries, PriceSeries) {
    let (mut i, mut j) = (0, 0);
    let mut out_a = Vec::with_capacity(a.len().min(b.len()));
    let mut out_b = Vec::with_capacity(a.len().min(b.len()));
    while i < a.points.len() && j < b.points.len() {
        let (pa, pb) = (a.points[i], b.points[j]);
        if pa.timestamp == pb.timestamp {
            out_a.push(pa);
            out_b.push(pb);
            i += 1;
            j += 1;
        } else if pa.timestamp < pb.timestamp {
            i += 1;
        } else {
            j += 1;
        }
    }
    (
        PriceSeries {
            symbol: a.symbol.clone(),
            points: out_a,
        },
        PriceSeries {
            symbol: b.symbol.clone(),
            points: out_b,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairSpec {
    pub symbol_a: String,
    pub symbol_b: String,
}

impl PairSpec {
    pub fn new(symbol_a: impl Into<String>, symbol_b: impl Into<String>) -> Self {
        Self {
            symbol_a: symbol_a.into(),
            symbol_b: symbol_b.into(),
        }
    }

    pub fn id(&self) -> PairId {
        PairId(format!("{}_{}", self.symbol_a, self.symbol_b))
    }
}

/// Pair identity as rendered in reports: `SYMBOL_A_SYMBOL_B`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairStatus {
    Candidate,
    Cointegrated,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    PValue { p_value: f64 },
    HalfLifeOutOfRange { half_life: f64 },
    NoMeanReversion,
    Analysis { message: String },
    /// Retired after repeated failed revalidations.
    Breakdown { reason: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::PValue { p_value } => write!(f, "p-value {:.3} above threshold", p_value),
            Rejection::HalfLifeOutOfRange { half_life } => {
                write!(f, "half-life {:.1} days out of range", half_life)
            }
            Rejection::NoMeanReversion => write!(f, "no mean reversion"),
            Rejection::Analysis { message } => write!(f, "{}", message),
            Rejection::Breakdown { reason } => write!(f, "retired: {}", reason),
        }
    }
}

/// Validation record for one pair. `half_life` is in days and is +inf when the
/// estimator did not run or found no reversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub symbol_a: String,
    pub symbol_b: String,
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub p_value: f64,
    #[serde(with = "inf_as_null")]
    pub half_life: f64,
    pub validated_at: DateTime<Utc>,
    pub status: PairStatus,
    pub rejection: Option<Rejection>,
}

impl Pair {
    pub fn candidate(spec: &PairSpec, at: DateTime<Utc>) -> Self {
        Self {
            symbol_a: spec.symbol_a.clone(),
            symbol_b: spec.symbol_b.clone(),
            hedge_ratio: 0.0,
            intercept: 0.0,
            p_value: 1.0,
            half_life: f64::INFINITY,
            validated_at: at,
            status: PairStatus::Candidate,
            rejection: None,
        }
    }

    pub fn spec(&self) -> PairSpec {
        PairSpec::new(self.symbol_a.clone(), self.symbol_b.clone())
    }

    pub fn id(&self) -> PairId {
        self.spec().id()
    }

    pub fn is_cointegrated(&self) -> bool {
        self.status == PairStatus::Cointegrated
    }
}

// JSON has no infinity; an unbounded half-life round-trips as null.
mod inf_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(i)
    }

    pub(crate) fn series(symbol: &str, prices: &[f64]) -> PriceSeries {
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, p)| PricePoint::new(day(i as i64), *p))
            .collect();
        PriceSeries::new(symbol, points).unwrap()
    }

    #[test]
    fn rejects_unordered_timestamps() {
        let points = vec![
            PricePoint::new(day(0), 1.0),
            PricePoint::new(day(2), 1.0),
            PricePoint::new(day(2), 1.0),
        ];
        let err = PriceSeries::new("AAA", points).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::UnorderedSeries {
                symbol: "AAA".to_string(),
                index: 2
            }
        );
    }

    #[test]
    fn check_aligned_reports_first_mismatch() {
        let a = series("A", &[1.0, 2.0, 3.0]);
        let b = PriceSeries::new(
            "B",
            vec![
                PricePoint::new(day(0), 1.0),
                PricePoint::new(day(5), 1.0),
                PricePoint::new(day(6), 1.0),
            ],
        )
        .unwrap();
        assert_eq!(
            check_aligned(&a, &b),
            Err(AnalysisError::MisalignedSeries { index: 1 })
        );
        let short = series("C", &[1.0, 2.0]);
        assert_eq!(
            check_aligned(&a, &short),
            Err(AnalysisError::MisalignedSeries { index: 2 })
        );
        assert!(check_aligned(&a, &a.clone()).is_ok());
    }

    #[test]
    fn align_keeps_common_timestamps() {
        let a = series("A", &[1.0, 2.0, 3.0, 4.0]);
        let b = PriceSeries::new(
            "B",
            vec![
                PricePoint::new(day(1), 20.0),
                PricePoint::new(day(3), 40.0),
                PricePoint::new(day(9), 90.0),
            ],
        )
        .unwrap();
        let (a2, b2) = align(&a, &b);
        assert_eq!(a2.prices(), vec![2.0, 4.0]);
        assert_eq!(b2.prices(), vec![20.0, 40.0]);
        assert!(check_aligned(&a2, &b2).is_ok());
    }

    #[test]
    fn sampling_interval_uses_median_gap() {
        let points = vec![
            PricePoint::new(day(0), 1.0),
            PricePoint::new(day(1), 1.0),
            PricePoint::new(day(2), 1.0),
            PricePoint::new(day(5), 1.0),
        ];
        let s = PriceSeries::new("A", points).unwrap();
        assert_eq!(s.sampling_interval(), Some(Duration::days(1)));
        assert_eq!(bars_per_day(Duration::hours(4)), 6.0);
    }

    #[test]
    fn pair_id_joins_symbols() {
        assert_eq!(PairSpec::new("GLD", "SLV").id().to_string(), "GLD_SLV");
    }

    #[test]
    fn infinite_half_life_survives_json() {
        let mut pair = Pair::candidate(&PairSpec::new("GLD", "SLV"), day(0));
        pair.status = PairStatus::Rejected;
        pair.rejection = Some(Rejection::NoMeanReversion);
        let json = serde_json::to_string(&pair).unwrap();
        assert!(json.contains("\"half_life\":null"));
        assert!(json.contains("\"status\":\"REJECTED\""));
        let back: Pair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
    }
}
