//! Historical replay of the shared spread and signal machinery.
//!
//! [`TradeSimulator`] turns state-machine events into closed [`Trade`]s.
//! [`BacktestEngine`] walks two aligned series bar by bar, recalibrating the
//! hedge model on a trailing window and feeding the simulator.

pub mod metrics;
pub mod report;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StrategyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::{align, bars_per_day, check_aligned, PairId, PairSpec, PriceSeries};
use crate::scanner::{lookup_pair, PairValidator};
use crate::signal::{PositionState, Signal, SignalStateMachine, SignalThresholds};
use crate::spread::{
    window_for_half_life, RollingZScore, SpreadConvention, SpreadModel, SpreadObservation,
};
use crate::trade::{ExitMark, ExitReason, PnlConvention, Trade};
use crate::workers::run_bounded;

pub use metrics::{compute_metrics, BacktestResult, ExitCounts, Verdict, VerdictCutoffs};

/// Drives one [`SignalStateMachine`] and records its round trips.
#[derive(Debug, Clone)]
pub struct TradeSimulator {
    machine: SignalStateMachine,
    convention: PnlConvention,
    trades: Vec<Trade>,
    signals: Vec<Signal>,
    last_bar: Option<SpreadObservation>,
    last_z: Option<f64>,
}

impl TradeSimulator {
    pub fn new(pair: PairId, thresholds: SignalThresholds, convention: PnlConvention) -> Self {
        Self {
            machine: SignalStateMachine::new(pair, thresholds),
            convention,
            trades: Vec::new(),
            signals: Vec::new(),
            last_bar: None,
            last_z: None,
        }
    }

    pub fn state(&self) -> &PositionState {
        self.machine.state()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn on_observation(
        &mut self,
        obs: &SpreadObservation,
        hedge_ratio: f64,
        entries_allowed: bool,
    ) -> Option<&Signal> {
        self.last_bar = Some(*obs);
        if obs.z_score.is_some() {
            self.last_z = obs.z_score;
        }
        let event = self.machine.advance(obs, hedge_ratio, entries_allowed)?;
        if let Some(closed) = event.closed {
            let exit = ExitMark {
                timestamp: obs.timestamp,
                z_score: event.signal.z_score,
                price_a: obs.price_a,
                price_b: obs.price_b,
            };
            self.trades.push(Trade::close(
                self.machine.pair().clone(),
                closed.direction,
                &closed.position,
                exit,
                closed.reason,
                self.convention,
            ));
        }
        self.signals.push(event.signal);
        self.signals.last()
    }

    /// Closes any open position at the last bar seen with END_OF_DATA.
    pub fn finish(mut self) -> (Vec<Trade>, Vec<Signal>) {
        if let (Some((direction, position)), Some(bar)) =
            (self.machine.force_close(), self.last_bar)
        {
            let exit = ExitMark {
                timestamp: bar.timestamp,
                z_score: self
                    .last_z
                    .unwrap_or_else(|| position.entry_ref().z_score),
                price_a: bar.price_a,
                price_b: bar.price_b,
            };
            self.trades.push(Trade::close(
                self.machine.pair().clone(),
                direction,
                &position,
                exit,
                ExitReason::EndOfData,
                self.convention,
            ));
        }
        (self.trades, self.signals)
    }
}

/// One recalibration attempt. A rejected attempt blocks new entries until
/// the next accepted one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationAttempt {
    pub at: DateTime<Utc>,
    pub accepted: bool,
}

/// Everything one replay produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRun {
    pub trades: Vec<Trade>,
    pub signals: Vec<Signal>,
    pub calibrations: Vec<CalibrationAttempt>,
    pub result: BacktestResult,
}

#[derive(Debug, Clone)]
pub struct BacktestEngine {
    validator: PairValidator,
    thresholds: SignalThresholds,
    spread_convention: SpreadConvention,
    pnl_convention: PnlConvention,
    min_window: usize,
    lookback: usize,
    recalibration_days: f64,
    cutoffs: VerdictCutoffs,
    max_concurrency: usize,
}

struct Calibration {
    model: SpreadModel,
    window: usize,
    half_life_days: f64,
}

impl BacktestEngine {
    pub fn new(cfg: &StrategyConfig) -> Self {
        Self {
            validator: PairValidator::from_config(cfg),
            thresholds: cfg.thresholds(),
            spread_convention: cfg.spread_convention,
            pnl_convention: cfg.pnl_convention,
            min_window: cfg.min_window,
            lookback: cfg.calibration_lookback,
            recalibration_days: cfg.recalibration_interval_days,
            cutoffs: cfg.verdict_cutoffs(),
            max_concurrency: cfg.max_concurrency,
        }
    }

    /// Replays two aligned series. The first `lookback` bars only seed the
    /// first calibration.
    pub fn run(
        &self,
        spec: &PairSpec,
        a: &PriceSeries,
        b: &PriceSeries,
    ) -> AnalysisResult<BacktestRun> {
        check_aligned(a, b)?;
        let n = a.len();
        if n <= self.lookback {
            return Err(AnalysisError::InsufficientData {
                expected: self.lookback + 1,
                actual: n,
            });
        }
        let pair = spec.id();
        let interval = a.sampling_interval().unwrap_or_else(|| Duration::days(1));
        let recal_bars =
            ((self.recalibration_days * bars_per_day(interval)).round() as usize).max(1);
        let prices_a = a.prices();
        let prices_b = b.prices();

        let mut sim =
            TradeSimulator::new(pair.clone(), self.thresholds.clone(), self.pnl_convention);
        let mut model: Option<SpreadModel> = None;
        let mut rolling = RollingZScore::new(self.min_window);
        let mut entries_allowed = false;
        let mut next_calibration = self.lookback;
        let mut calibrated_once = false;
        let mut half_lives = Vec::new();
        let mut calibrations = Vec::new();

        for i in self.lookback..n {
            if i >= next_calibration {
                let from = i - self.lookback;
                let at = a.points()[i].timestamp;
                let calibration =
                    self.calibrate(spec, &prices_a[from..i], &prices_b[from..i], interval, at);
                calibrations.push(CalibrationAttempt {
                    at,
                    accepted: calibration.is_some(),
                });
                match calibration {
                    Some(cal) => {
                        rolling = RollingZScore::new(cal.window);
                        for j in i.saturating_sub(cal.window)..i {
                            rolling.prime(cal.model.spread(prices_a[j], prices_b[j]));
                        }
                        model = Some(cal.model);
                        entries_allowed = true;
                        calibrated_once = true;
                        half_lives.push(cal.half_life_days);
                    }
                    None => {
                        if entries_allowed {
                            log::info!(
                                "[BACKTEST] {} recalibration failed at bar {}, entries blocked",
                                pair,
                                i
                            );
                        }
                        entries_allowed = false;
                    }
                }
                next_calibration = if calibrated_once { i + recal_bars } else { i + 1 };
            }

            let Some(model) = model else { continue };
            let point_a = a.points()[i];
            let spread = model.spread(point_a.price, prices_b[i]);
            let obs = rolling.push(point_a.timestamp, point_a.price, prices_b[i], spread);
            if let Some(signal) = sim.on_observation(&obs, model.hedge_ratio, entries_allowed) {
                log::debug!("[BACKTEST] {}", signal.format_message());
            }
        }

        let (trades, signals) = sim.finish();
        let mut result = compute_metrics(pair.clone(), &trades, &half_lives, &self.cutoffs);
        result.start = a.points().get(self.lookback).map(|p| p.timestamp);
        result.end = a.points().last().map(|p| p.timestamp);
        log::info!(
            "[BACKTEST] {} trades={} pf={:.2} expectancy={:+.2}% calibrations={} verdict={}",
            pair,
            result.trade_count,
            result.profit_factor,
            result.expectancy_pct,
            result.calibrations,
            result.verdict
        );
        Ok(BacktestRun {
            trades,
            signals,
            calibrations,
            result,
        })
    }

    fn calibrate(
        &self,
        spec: &PairSpec,
        a: &[f64],
        b: &[f64],
        interval: Duration,
        at: DateTime<Utc>,
    ) -> Option<Calibration> {
        let validation = self.validator.validate_prices(spec, a, b, interval, at);
        if !validation.is_cointegrated() {
            return None;
        }
        let (coint, half_life) = (validation.cointegration?, validation.half_life?);
        Some(Calibration {
            model: SpreadModel::new(coint.hedge_ratio, coint.intercept, self.spread_convention),
            window: window_for_half_life(half_life.bars, self.min_window),
            half_life_days: half_life.days,
        })
    }

    /// Backtests each pair on the worker pool. Results follow `pairs` order.
    pub async fn run_batch(
        &self,
        pairs: &[PairSpec],
        prices: Arc<HashMap<String, PriceSeries>>,
    ) -> Vec<(PairSpec, anyhow::Result<BacktestRun>)> {
        log::info!("[BACKTEST] running {} pairs", pairs.len());
        let engine = self.clone();
        let outcomes = run_bounded(pairs.to_vec(), self.max_concurrency, move |spec| {
            let (a, b) = lookup_pair(&spec, &prices)?;
            let (a, b) = align(a, b);
            engine.run(&spec, &a, &b)
        })
        .await;

        pairs
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(spec, outcome)| {
                let run = match outcome {
                    Ok(Ok(run)) => Ok(run),
                    Ok(Err(e)) => {
                        log::warn!("[BACKTEST] {} skipped: {}", spec.id(), e);
                        Err(anyhow!(e))
                    }
                    Err(e) => Err(anyhow!(e)),
                };
                (spec, run)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::series;
    use crate::signal::tests::obs;
    use crate::signal::{Direction, ScaleRung, SignalKind};
    use crate::synthetic::SyntheticPair;

    fn simulate(zs: &[f64], thresholds: SignalThresholds) -> (Vec<Trade>, Vec<Signal>) {
        let mut sim =
            TradeSimulator::new(PairSpec::new("A", "B").id(), thresholds, PnlConvention::Sigma);
        for (i, z) in zs.iter().enumerate() {
            sim.on_observation(&obs(i as i64, Some(*z)), 1.0, true);
        }
        sim.finish()
    }

    #[test]
    fn long_round_trip_closes_on_mean_reversion() {
        let (trades, signals) = simulate(
            &[0.2, -1.6, -1.1, -0.5],
            SignalThresholds::new(1.5, 1.0, 3.0),
        );
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::MeanReversion);
        assert_eq!(trades[0].entry_z, -1.6);
        assert_eq!(trades[0].exit_z, -0.5);
        assert!(trades[0].pnl_pct > 0.0);
        assert_eq!(signals.len(), 2);
    }

    #[test]
    fn short_round_trip_closes_on_stop() {
        let (trades, _) = simulate(
            &[0.0, 1.6, 2.9, 3.1],
            SignalThresholds::new(1.5, 1.0, 3.0),
        );
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert!(trades[0].pnl_pct < 0.0);
    }

    #[test]
    fn scaled_position_closes_as_one_trade() {
        let thresholds = SignalThresholds::new(1.5, 1.0, 3.0).with_ladder(vec![
            ScaleRung::new(1.5, 0.40),
            ScaleRung::new(2.0, 0.35),
            ScaleRung::new(3.0, 0.25),
        ]);
        let (trades, signals) = simulate(&[-1.6, -2.1, -1.0], thresholds);
        let kinds: Vec<SignalKind> = signals.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SignalKind::EntryLong, SignalKind::ScaleIn, SignalKind::Exit]
        );
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].fills, 2);
        assert!((trades[0].entry_z - (0.40 * -1.6 + 0.35 * -2.1) / 0.75).abs() < 1e-12);
    }

    #[test]
    fn open_position_is_closed_at_end_of_data() {
        let mut sim = TradeSimulator::new(
            PairSpec::new("A", "B").id(),
            SignalThresholds::new(1.5, 1.0, 3.0),
            PnlConvention::Sigma,
        );
        sim.on_observation(&obs(0, Some(-2.0)), 1.0, true);
        sim.on_observation(&obs(1, Some(-1.8)), 1.0, true);
        sim.on_observation(&obs(2, None), 1.0, true);
        let (trades, signals) = sim.finish();
        assert_eq!(signals.len(), 1);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(trades[0].exit_z, -1.8);
        assert_eq!(trades[0].exit_timestamp, obs(2, None).timestamp);
    }

    fn engine_config() -> StrategyConfig {
        StrategyConfig {
            min_half_life: 1.0,
            max_half_life: 50.0,
            z_entry: 1.5,
            ..StrategyConfig::default()
        }
    }

    fn synthetic() -> (PriceSeries, PriceSeries) {
        SyntheticPair {
            lambda: -0.3,
            len: 600,
            seed: 11,
            ..SyntheticPair::default()
        }
        .generate()
        .unwrap()
    }

    #[test]
    fn replay_on_cointegrated_pair_trades_and_is_deterministic() {
        let (a, b) = synthetic();
        let engine = BacktestEngine::new(&engine_config());
        let spec = PairSpec::new("AAA", "BBB");
        let first = engine.run(&spec, &a, &b).unwrap();
        let second = engine.run(&spec, &a, &b).unwrap();
        assert_eq!(first, second);

        let r = &first.result;
        assert!(r.calibrations >= 1);
        assert!(r.avg_half_life > 0.0);
        assert!(r.trade_count > 0);
        assert_eq!(r.trade_count, first.trades.len());
        assert!(first
            .trades
            .windows(2)
            .all(|w| w[0].exit_timestamp <= w[1].entry_timestamp));
        assert_eq!(r.start, Some(a.points()[120].timestamp));
    }

    /// Cointegrated for 300 bars, then B freezes while A climbs 5 per bar.
    /// The climb opens a short that never reverts; once the lookback holds
    /// only frozen B the regression is singular and calibration fails.
    #[test]
    fn failed_recalibration_blocks_entries_but_manages_open_position() {
        let (a, b) = SyntheticPair {
            lambda: -0.3,
            len: 300,
            seed: 11,
            ..SyntheticPair::default()
        }
        .generate()
        .unwrap();
        let mut pa = a.prices();
        let mut pb = b.prices();
        let (last_a, last_b) = (pa[299], pb[299]);
        for j in 1..=200 {
            pa.push(last_a + 5.0 * j as f64);
            pb.push(last_b);
        }
        let (a, b) = (series("AAA", &pa), series("BBB", &pb));
        let cfg = StrategyConfig {
            z_stop: 50.0,
            ..engine_config()
        };
        let run = BacktestEngine::new(&cfg)
            .run(&PairSpec::new("AAA", "BBB"), &a, &b)
            .unwrap();

        let break_at = a.points()[300].timestamp;
        let first_rejected = run
            .calibrations
            .iter()
            .find(|c| c.at >= break_at && !c.accepted)
            .map(|c| c.at)
            .unwrap();
        assert!(run
            .calibrations
            .iter()
            .any(|c| c.at < break_at && c.accepted));

        // no entry or scale-in while the latest attempt is a rejection
        for signal in &run.signals {
            if matches!(
                signal.kind,
                SignalKind::EntryLong | SignalKind::EntryShort | SignalKind::ScaleIn
            ) {
                let latest = run
                    .calibrations
                    .iter()
                    .filter(|c| c.at <= signal.timestamp)
                    .last()
                    .unwrap();
                assert!(latest.accepted, "entry at {} while blocked", signal.timestamp);
            }
        }

        let last = run.trades.last().unwrap();
        assert_eq!(last.direction, Direction::ShortSpread);
        assert!(last.entry_timestamp < first_rejected);
        assert_eq!(last.exit_reason, ExitReason::EndOfData);
        assert_eq!(last.exit_timestamp, a.points()[499].timestamp);
        assert_eq!(run.result.trade_count, run.trades.len());
    }

    #[test]
    fn uncalibrated_pair_has_no_trades() {
        let a: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let a = series("AAA", &a);
        let b = series("FLAT", &[50.0; 200]);
        let run = BacktestEngine::new(&engine_config())
            .run(&PairSpec::new("AAA", "FLAT"), &a, &b)
            .unwrap();
        assert!(run.trades.is_empty());
        assert_eq!(run.result.verdict, Verdict::NoTrades);
        assert_eq!(run.result.calibrations, 0);
        assert_eq!(run.result.avg_half_life, 0.0);
    }

    #[test]
    fn short_history_is_insufficient() {
        let a = series("A", &[1.0; 50]);
        let b = series("B", &[2.0; 50]);
        let err = BacktestEngine::new(&engine_config())
            .run(&PairSpec::new("A", "B"), &a, &b)
            .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::InsufficientData {
                expected: 121,
                actual: 50
            }
        );
    }

    #[tokio::test]
    async fn batch_keeps_order_and_reports_missing_series() {
        let (a, b) = synthetic();
        let mut prices = HashMap::new();
        prices.insert("AAA".to_string(), a);
        prices.insert("BBB".to_string(), b);
        let pairs = vec![PairSpec::new("AAA", "BBB"), PairSpec::new("AAA", "ZZZ")];
        let out = BacktestEngine::new(&engine_config())
            .run_batch(&pairs, Arc::new(prices))
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, pairs[0]);
        assert!(out[0].1.is_ok());
        assert!(out[1].1.is_err());
    }
}
