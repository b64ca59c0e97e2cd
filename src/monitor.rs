//! Live driver for the shared signal machinery.
//!
//! An external scheduler calls [`LiveMonitor::on_tick`] with fresh prices and
//! [`LiveMonitor::revalidate`] with trailing history. Both lock the pair's
//! registry slot for the whole evaluation.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::cointegration::{Breakdown, BreakdownPolicy};
use crate::config::StrategyConfig;
use crate::model::{Pair, PairId, PairSpec, PairStatus, PriceSeries, Rejection};
use crate::ports::{PairStore, SignalSink};
use crate::registry::{PairRegistry, PairSlot};
use crate::scanner::{PairValidator, Validation};
use crate::signal::{Signal, SignalThresholds};
use crate::spread::{window_for_half_life, SpreadConvention, SpreadModel, SpreadObservation};
use crate::trade::{ExitMark, PnlConvention, Trade};

#[derive(Debug, Clone, PartialEq)]
pub enum RevalidationOutcome {
    /// First successful validation; a slot now exists.
    Activated,
    /// New pair that did not qualify; nothing registered.
    Rejected,
    /// Active pair passed; parameters refreshed and breakdown count reset.
    Refreshed,
    /// Active pair inside the exit band: model refreshed and breakdown count
    /// reset, stored record left at its last qualifying state.
    Held,
    /// Active pair failed, below the retirement limit.
    Breakdown { reason: Breakdown, count: u32 },
    /// Limit reached with a position still open; removed once flat.
    Retiring { reason: Breakdown },
    /// Limit reached while flat; removed.
    Retired { reason: Breakdown },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub observation: SpreadObservation,
    pub signal: Option<Signal>,
    /// Set when the tick closed a position.
    pub trade: Option<Trade>,
}

pub struct LiveMonitor {
    registry: PairRegistry,
    validator: PairValidator,
    policy: BreakdownPolicy,
    thresholds: SignalThresholds,
    spread_convention: SpreadConvention,
    pnl_convention: PnlConvention,
    min_window: usize,
    breakdown_checks: u32,
    sink: Arc<dyn SignalSink>,
    store: Arc<dyn PairStore>,
}

impl LiveMonitor {
    pub fn new(
        cfg: &StrategyConfig,
        registry: PairRegistry,
        sink: Arc<dyn SignalSink>,
        store: Arc<dyn PairStore>,
    ) -> Self {
        Self {
            registry,
            validator: PairValidator::from_config(cfg),
            policy: BreakdownPolicy::from_config(cfg),
            thresholds: cfg.thresholds(),
            spread_convention: cfg.spread_convention,
            pnl_convention: cfg.pnl_convention,
            min_window: cfg.min_window,
            breakdown_checks: cfg.breakdown_checks.max(1),
            sink,
            store,
        }
    }

    pub fn registry(&self) -> &PairRegistry {
        &self.registry
    }

    /// Feeds one price pair to an active pair. Unknown pairs are ignored.
    pub async fn on_tick(
        &self,
        id: &PairId,
        timestamp: DateTime<Utc>,
        price_a: f64,
        price_b: f64,
    ) -> Option<TickOutcome> {
        let Some(shared) = self.registry.get(id).await else {
            log::debug!("[MONITOR] tick for inactive pair {}", id);
            return None;
        };
        let mut slot = shared.lock().await;
        let spread = slot.model.spread(price_a, price_b);
        let observation = slot.rolling.push(timestamp, price_a, price_b, spread);
        let hedge_ratio = slot.model.hedge_ratio;
        let entries_allowed = slot.entries_allowed();
        let event = slot.machine.advance(&observation, hedge_ratio, entries_allowed);

        let mut outcome = TickOutcome {
            observation,
            signal: None,
            trade: None,
        };
        if let Some(event) = event {
            if let Some(closed) = &event.closed {
                let trade = Trade::close(
                    id.clone(),
                    closed.direction,
                    &closed.position,
                    ExitMark {
                        timestamp,
                        z_score: event.signal.z_score,
                        price_a,
                        price_b,
                    },
                    closed.reason,
                    self.pnl_convention,
                );
                log::info!(
                    "[MONITOR] {} closed {} pnl={:+.2}% reason={}",
                    id,
                    trade.direction,
                    trade.pnl_pct,
                    trade.exit_reason
                );
                outcome.trade = Some(trade);
            }
            if let Err(e) = self.sink.publish(&event.signal).await {
                log::error!("[MONITOR] failed to publish signal for {}: {:?}", id, e);
            }
            outcome.signal = Some(event.signal);
        }

        let drop_slot = slot.retiring && slot.state().is_flat();
        drop(slot);
        if drop_slot {
            self.registry.remove(id).await;
        }
        Some(outcome)
    }

    /// Re-runs validation over trailing history. New qualifying pairs are
    /// activated; active pairs are checked for breakdown.
    pub async fn revalidate(
        &self,
        spec: &PairSpec,
        a: &PriceSeries,
        b: &PriceSeries,
        at: DateTime<Utc>,
    ) -> RevalidationOutcome {
        let validation = self.validator.validate(spec, a, b, at);
        let id = spec.id();
        let Some(shared) = self.registry.get(&id).await else {
            return self.activate(&validation, a, b).await;
        };

        let mut slot = shared.lock().await;
        let breakdown = match (&validation.cointegration, &validation.error) {
            (Some(coint), None) => {
                let half_life = validation
                    .half_life
                    .map(|h| h.days)
                    .unwrap_or(f64::INFINITY);
                self.policy.check(
                    coint.p_value,
                    coint.hedge_ratio,
                    half_life,
                    slot.model.hedge_ratio,
                )
            }
            (_, Some(e)) => Some(Breakdown::Failed {
                message: e.to_string(),
            }),
            (None, None) => Some(Breakdown::Failed {
                message: "no cointegration result".to_string(),
            }),
        };

        let outcome = match breakdown {
            None => {
                // Between the entry and exit p-value thresholds the pair keeps
                // trading on the fresh model, but its stored record stays the
                // last one that fully qualified.
                let confirmed = validation.is_cointegrated();
                let pair = if confirmed {
                    validation.pair.clone()
                } else {
                    slot.pair.clone()
                };
                let (model, window) = self.model_for(&validation);
                slot.recalibrate(pair, model, window, &trailing(a, b, window));
                slot.breakdowns = 0;
                slot.retiring = false;
                log::info!(
                    "[MONITOR] {} revalidated p={:.4} beta={:.4} window={} confirmed={}",
                    id,
                    validation.pair.p_value,
                    slot.model.hedge_ratio,
                    window,
                    confirmed
                );
                if confirmed {
                    RevalidationOutcome::Refreshed
                } else {
                    RevalidationOutcome::Held
                }
            }
            Some(reason) => {
                slot.breakdowns += 1;
                log::warn!(
                    "[MONITOR] {} breakdown {}/{}: {}",
                    id,
                    slot.breakdowns,
                    self.breakdown_checks,
                    reason
                );
                if slot.breakdowns < self.breakdown_checks {
                    RevalidationOutcome::Breakdown {
                        reason,
                        count: slot.breakdowns,
                    }
                } else {
                    slot.retiring = true;
                    slot.pair.status = PairStatus::Rejected;
                    slot.pair.validated_at = at;
                    slot.pair.rejection = Some(Rejection::Breakdown {
                        reason: reason.to_string(),
                    });
                    if slot.state().is_flat() {
                        RevalidationOutcome::Retired { reason }
                    } else {
                        RevalidationOutcome::Retiring { reason }
                    }
                }
            }
        };

        let record = slot.pair.clone();
        drop(slot);
        if matches!(outcome, RevalidationOutcome::Retired { .. }) {
            self.registry.remove(&id).await;
        }
        if matches!(
            outcome,
            RevalidationOutcome::Refreshed
                | RevalidationOutcome::Retiring { .. }
                | RevalidationOutcome::Retired { .. }
        ) {
            self.save(&record).await;
        }
        outcome
    }

    async fn activate(
        &self,
        validation: &Validation,
        a: &PriceSeries,
        b: &PriceSeries,
    ) -> RevalidationOutcome {
        self.save(&validation.pair).await;
        if !validation.is_cointegrated() {
            return RevalidationOutcome::Rejected;
        }
        let (model, window) = self.model_for(validation);
        let mut slot = PairSlot::new(
            validation.pair.clone(),
            model,
            window,
            self.thresholds.clone(),
        );
        for (pa, pb) in trailing(a, b, window) {
            slot.rolling.prime(model.spread(pa, pb));
        }
        let (_, inserted) = self.registry.get_or_insert(slot).await;
        if !inserted {
            log::debug!(
                "[MONITOR] {} was activated concurrently",
                validation.pair.id()
            );
        }
        RevalidationOutcome::Activated
    }

    fn model_for(&self, validation: &Validation) -> (SpreadModel, usize) {
        let pair = &validation.pair;
        let model = SpreadModel::new(pair.hedge_ratio, pair.intercept, self.spread_convention);
        let bars = validation
            .half_life
            .map(|h| h.bars)
            .unwrap_or(f64::INFINITY);
        (model, window_for_half_life(bars, self.min_window))
    }

    async fn save(&self, pair: &Pair) {
        if let Err(e) = self.store.save_pair(pair).await {
            log::warn!("[MONITOR] failed to persist {}: {:?}", pair.id(), e);
        }
    }
}

/// Last `window` aligned price pairs.
fn trailing(a: &PriceSeries, b: &PriceSeries, window: usize) -> Vec<(f64, f64)> {
    let n = a.len().min(b.len());
    let from = n.saturating_sub(window);
    a.points()[from..n]
        .iter()
        .zip(&b.points()[from..n])
        .map(|(pa, pb)| (pa.price, pb.price))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{day, series};
    use crate::ports::sinks::tests::{MemoryPairStore, MemorySignalSink};
    use crate::signal::SignalKind;
    use crate::synthetic::SyntheticPair;
    use crate::trade::ExitReason;

    struct Harness {
        monitor: LiveMonitor,
        sink: Arc<MemorySignalSink>,
        store: Arc<MemoryPairStore>,
    }

    fn harness(cfg: StrategyConfig) -> Harness {
        let sink = Arc::new(MemorySignalSink::default());
        let store = Arc::new(MemoryPairStore::default());
        let monitor = LiveMonitor::new(&cfg, PairRegistry::new(), sink.clone(), store.clone());
        Harness {
            monitor,
            sink,
            store,
        }
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            min_half_life: 1.0,
            max_half_life: 50.0,
            breakdown_checks: 2,
            ..StrategyConfig::default()
        }
    }

    /// Registers GLD/SLV with β = 1 and a 20-wide window of spreads near 0.5.
    async fn seeded(h: &Harness) -> PairId {
        let mut pair = Pair::candidate(&PairSpec::new("GLD", "SLV"), day(0));
        pair.status = PairStatus::Cointegrated;
        pair.hedge_ratio = 1.0;
        let mut slot = PairSlot::new(
            pair,
            SpreadModel::new(1.0, 0.0, SpreadConvention::ExcludeIntercept),
            20,
            h.monitor.thresholds.clone(),
        );
        for i in 0..20 {
            slot.rolling.prime((i % 2) as f64);
        }
        let id = slot.pair.id();
        h.monitor.registry().get_or_insert(slot).await;
        id
    }

    #[tokio::test]
    async fn ticks_drive_signals_and_close_trades() {
        let h = harness(config());
        let id = seeded(&h).await;

        let entry = h.monitor.on_tick(&id, day(1), 90.0, 100.0).await.unwrap();
        assert_eq!(entry.signal.as_ref().unwrap().kind, SignalKind::EntryLong);
        assert!(entry.observation.z_score.unwrap() <= -2.0);
        assert!(entry.trade.is_none());

        let exit = h.monitor.on_tick(&id, day(2), 100.5, 100.0).await.unwrap();
        assert_eq!(exit.signal.as_ref().unwrap().kind, SignalKind::Exit);
        let trade = exit.trade.unwrap();
        assert_eq!(trade.exit_reason, ExitReason::MeanReversion);
        assert!(trade.pnl_pct > 0.0);

        let published = h.sink.signals.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert!(h
            .monitor
            .on_tick(&PairSpec::new("X", "Y").id(), day(3), 1.0, 1.0)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn repeated_breakdowns_retire_once_flat() {
        let h = harness(config());
        let id = seeded(&h).await;
        h.monitor.on_tick(&id, day(1), 90.0, 100.0).await.unwrap();

        let a = series("GLD", &(0..150).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let flat = series("SLV", &[20.0; 150]);
        let spec = PairSpec::new("GLD", "SLV");

        let first = h.monitor.revalidate(&spec, &a, &flat, day(5)).await;
        assert!(matches!(first, RevalidationOutcome::Breakdown { count: 1, .. }));
        let second = h.monitor.revalidate(&spec, &a, &flat, day(6)).await;
        assert!(matches!(second, RevalidationOutcome::Retiring { .. }));

        let stored = h.store.pairs.lock().unwrap()[&id].clone();
        assert_eq!(stored.status, PairStatus::Rejected);
        assert!(matches!(stored.rejection, Some(Rejection::Breakdown { .. })));

        // still managed to exit, then dropped
        let exit = h.monitor.on_tick(&id, day(7), 100.5, 100.0).await.unwrap();
        assert_eq!(exit.signal.unwrap().kind, SignalKind::Exit);
        assert!(h.monitor.registry().get(&id).await.is_none());
    }

    #[tokio::test]
    async fn retiring_pair_takes_no_new_entries() {
        let h = harness(StrategyConfig {
            breakdown_checks: 1,
            ..config()
        });
        let id = seeded(&h).await;
        h.monitor.on_tick(&id, day(1), 90.0, 100.0).await.unwrap();
        let a = series("GLD", &(0..150).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let flat = series("SLV", &[20.0; 150]);
        let outcome = h
            .monitor
            .revalidate(&PairSpec::new("GLD", "SLV"), &a, &flat, day(2))
            .await;
        assert!(matches!(outcome, RevalidationOutcome::Retiring { .. }));
        let slot = h.monitor.registry().get(&id).await.unwrap();
        assert!(!slot.lock().await.entries_allowed());
    }

    #[tokio::test]
    async fn first_validation_activates_and_refreshes() {
        let h = harness(config());
        let (a, b) = SyntheticPair {
            symbol_a: "GLD".to_string(),
            symbol_b: "SLV".to_string(),
            lambda: -0.3,
            len: 300,
            seed: 9,
            ..SyntheticPair::default()
        }
        .generate()
        .unwrap();
        let spec = PairSpec::new("GLD", "SLV");

        let outcome = h.monitor.revalidate(&spec, &a, &b, day(300)).await;
        assert_eq!(outcome, RevalidationOutcome::Activated);
        assert_eq!(h.monitor.registry().len().await, 1);
        assert!(h.store.pairs.lock().unwrap()[&spec.id()].is_cointegrated());

        let outcome = h.monitor.revalidate(&spec, &a, &b, day(301)).await;
        assert_eq!(outcome, RevalidationOutcome::Refreshed);
        let slot = h.monitor.registry().get(&spec.id()).await.unwrap();
        assert_eq!(slot.lock().await.breakdowns, 0);
    }

    #[tokio::test]
    async fn exit_band_keeps_trading_without_restoring_cointegrated_record() {
        let h = harness(StrategyConfig {
            p_value_threshold: 1e-300,
            p_value_exit_threshold: 0.10,
            ..config()
        });
        let spec = PairSpec::new("GLD", "SLV");
        let mut pair = Pair::candidate(&spec, day(0));
        pair.status = PairStatus::Cointegrated;
        pair.hedge_ratio = 1.5;
        pair.p_value = 0.01;
        let mut slot = PairSlot::new(
            pair,
            SpreadModel::new(1.5, 0.0, SpreadConvention::ExcludeIntercept),
            20,
            h.monitor.thresholds.clone(),
        );
        slot.breakdowns = 1;
        h.monitor.registry().get_or_insert(slot).await;

        let (a, b) = SyntheticPair {
            symbol_a: "GLD".to_string(),
            symbol_b: "SLV".to_string(),
            lambda: -0.3,
            len: 300,
            seed: 9,
            ..SyntheticPair::default()
        }
        .generate()
        .unwrap();
        let outcome = h.monitor.revalidate(&spec, &a, &b, day(300)).await;
        assert_eq!(outcome, RevalidationOutcome::Held);

        let shared = h.monitor.registry().get(&spec.id()).await.unwrap();
        let slot = shared.lock().await;
        assert_eq!(slot.breakdowns, 0);
        assert!(slot.entries_allowed());
        assert_eq!(slot.pair.status, PairStatus::Cointegrated);
        assert_eq!(slot.pair.p_value, 0.01);
        assert_eq!(slot.pair.validated_at, day(0));
        assert!(h.store.pairs.lock().unwrap().get(&spec.id()).is_none());
    }

    #[tokio::test]
    async fn unqualified_pair_is_not_registered() {
        let h = harness(config());
        let a = series("AAA", &(0..150).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let flat = series("FLAT", &[20.0; 150]);
        let outcome = h
            .monitor
            .revalidate(&PairSpec::new("AAA", "FLAT"), &a, &flat, day(0))
            .await;
        assert_eq!(outcome, RevalidationOutcome::Rejected);
        assert!(h.monitor.registry().is_empty().await);
        assert_eq!(h.store.pairs.lock().unwrap().len(), 1);
    }
}
