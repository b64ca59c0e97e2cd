//! Live per-pair state, keyed by pair identity.
//!
//! Each slot sits behind its own async mutex so a tick and a revalidation on
//! the same pair run one after the other while other pairs proceed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::model::{Pair, PairId};
use crate::signal::{PositionState, SignalStateMachine, SignalThresholds};
use crate::spread::{RollingZScore, SpreadModel};

#[derive(Debug)]
pub struct PairSlot {
    pub pair: Pair,
    pub model: SpreadModel,
    pub rolling: RollingZScore,
    pub machine: SignalStateMachine,
    /// Consecutive failed revalidations.
    pub breakdowns: u32,
    /// Set once breakdowns reach the limit; no new entries, dropped when flat.
    pub retiring: bool,
}

impl PairSlot {
    pub fn new(
        pair: Pair,
        model: SpreadModel,
        window: usize,
        thresholds: SignalThresholds,
    ) -> Self {
        let machine = SignalStateMachine::new(pair.id(), thresholds);
        Self {
            pair,
            model,
            rolling: RollingZScore::new(window),
            machine,
            breakdowns: 0,
            retiring: false,
        }
    }

    pub fn entries_allowed(&self) -> bool {
        !self.retiring
    }

    pub fn state(&self) -> &PositionState {
        self.machine.state()
    }

    /// Installs a fresh model. The rolling window restarts from `trailing`
    /// spreads computed under the new model; an open position is kept.
    pub fn recalibrate(
        &mut self,
        pair: Pair,
        model: SpreadModel,
        window: usize,
        trailing: &[(f64, f64)],
    ) {
        self.pair = pair;
        self.model = model;
        self.rolling = RollingZScore::new(window);
        for (a, b) in trailing {
            self.rolling.prime(model.spread(*a, *b));
        }
    }
}

pub type SharedSlot = Arc<Mutex<PairSlot>>;

#[derive(Debug, Clone, Default)]
pub struct PairRegistry {
    slots: Arc<RwLock<HashMap<PairId, SharedSlot>>>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &PairId) -> Option<SharedSlot> {
        self.slots.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<PairId> {
        let mut ids: Vec<PairId> = self.slots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Returns the slot for `slot.pair`, inserting `slot` if the pair is new.
    /// The bool is true on insertion.
    pub async fn get_or_insert(&self, slot: PairSlot) -> (SharedSlot, bool) {
        let id = slot.pair.id();
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.get(&id) {
            return (existing.clone(), false);
        }
        let shared = Arc::new(Mutex::new(slot));
        slots.insert(id.clone(), shared.clone());
        log::info!("[REGISTRY] activated {}", id);
        (shared, true)
    }

    pub async fn remove(&self, id: &PairId) -> bool {
        let removed = self.slots.write().await.remove(id).is_some();
        if removed {
            log::info!("[REGISTRY] removed {}", id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::day;
    use crate::model::{PairSpec, PairStatus};
    use crate::signal::tests::obs;
    use crate::spread::SpreadConvention;

    fn slot(a: &str, b: &str) -> PairSlot {
        let mut pair = Pair::candidate(&PairSpec::new(a, b), day(0));
        pair.status = PairStatus::Cointegrated;
        pair.hedge_ratio = 1.0;
        PairSlot::new(
            pair,
            SpreadModel::new(1.0, 0.0, SpreadConvention::ExcludeIntercept),
            10,
            SignalThresholds::new(1.5, 1.0, 3.0),
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_pair() {
        let registry = PairRegistry::new();
        let (first, inserted) = registry.get_or_insert(slot("GLD", "SLV")).await;
        assert!(inserted);
        first.lock().await.breakdowns = 2;

        let (again, inserted) = registry.get_or_insert(slot("GLD", "SLV")).await;
        assert!(!inserted);
        assert_eq!(again.lock().await.breakdowns, 2);

        registry.get_or_insert(slot("SPY", "QQQ")).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(
            registry.ids().await,
            vec![PairSpec::new("GLD", "SLV").id(), PairSpec::new("SPY", "QQQ").id()]
        );
        assert!(registry.remove(&PairSpec::new("GLD", "SLV").id()).await);
        assert!(!registry.remove(&PairSpec::new("GLD", "SLV").id()).await);
        assert!(registry.get(&PairSpec::new("GLD", "SLV").id()).await.is_none());
    }

    #[test]
    fn recalibration_keeps_open_position() {
        let mut s = slot("GLD", "SLV");
        s.machine.advance(&obs(0, Some(-2.0)), 1.0, true);
        let pair = s.pair.clone();
        let model = SpreadModel::new(2.0, 0.0, SpreadConvention::ExcludeIntercept);
        s.recalibrate(pair, model, 5, &[(10.0, 4.0), (11.0, 5.0)]);
        assert!(!s.state().is_flat());
        assert_eq!(s.rolling.window(), 5);
        assert_eq!(s.model.hedge_ratio, 2.0);
    }
}
