//! Per-pair signal state machine.
//!
//! [`transition`] is a pure function of the current [`PositionState`] and one
//! spread observation. [`SignalStateMachine`] wraps it for a single pair and
//! is what both the backtest replay and the live monitor drive, so the two
//! cannot disagree about when a position opens, scales or closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::PairId;
use crate::spread::SpreadObservation;
use crate::trade::ExitReason;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleRung {
    /// Magnitude of z that triggers this rung.
    pub trigger_z: f64,
    pub weight: f64,
}

impl ScaleRung {
    pub fn new(trigger_z: f64, weight: f64) -> Self {
        Self { trigger_z, weight }
    }
}

/// Ordered scale-in rungs. Rung 0 is the entry itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingLadder {
    rungs: Vec<ScaleRung>,
}

impl ScalingLadder {
    pub fn new(rungs: Vec<ScaleRung>) -> Self {
        Self { rungs }
    }

    pub fn rungs(&self) -> &[ScaleRung] {
        &self.rungs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalThresholds {
    pub entry: f64,
    pub exit: f64,
    pub stop: f64,
    pub ladder: Option<ScalingLadder>,
}

impl SignalThresholds {
    pub fn new(entry: f64, exit: f64, stop: f64) -> Self {
        Self {
            entry,
            exit,
            stop,
            ladder: None,
        }
    }

    pub fn with_ladder(mut self, rungs: Vec<ScaleRung>) -> Self {
        self.ladder = Some(ScalingLadder::new(rungs));
        self
    }

    fn entry_weight(&self) -> f64 {
        self.ladder
            .as_ref()
            .and_then(|l| l.rungs.first())
            .map(|r| r.weight)
            .unwrap_or(1.0)
    }

    fn rung(&self, index: usize) -> Option<ScaleRung> {
        self.ladder.as_ref().and_then(|l| l.rungs.get(index)).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    LongSpread,
    ShortSpread,
}

impl Direction {
    /// +1 when the position gains as the spread rises.
    pub fn sign(self) -> f64 {
        match self {
            Direction::LongSpread => 1.0,
            Direction::ShortSpread => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LongSpread => f.write_str("LONG_SPREAD"),
            Direction::ShortSpread => f.write_str("SHORT_SPREAD"),
        }
    }
}

/// One entry or scale-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub timestamp: DateTime<Utc>,
    pub z_score: f64,
    pub price_a: f64,
    pub price_b: f64,
    pub spread_std: f64,
    pub weight: f64,
}

/// Weighted entry reference of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryRef {
    pub timestamp: DateTime<Utc>,
    pub price_a: f64,
    pub price_b: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    /// Hedge ratio at entry; PnL is measured on this spread until close.
    pub hedge_ratio: f64,
    pub fills: Vec<Fill>,
    next_rung: usize,
}

impl OpenPosition {
    fn open(fill: Fill, hedge_ratio: f64) -> Self {
        Self {
            hedge_ratio,
            fills: vec![fill],
            next_rung: 1,
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fills.iter().map(|f| f.weight).sum::<f64>().min(1.0)
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.fills
            .first()
            .map(|f| f.timestamp)
            .unwrap_or_default()
    }

    /// Weight-averaged fill values, stamped with the first fill's time.
    pub fn entry_ref(&self) -> EntryRef {
        let total: f64 = self.fills.iter().map(|f| f.weight).sum();
        let avg = |value: fn(&Fill) -> f64| {
            if total > 0.0 {
                self.fills.iter().map(|f| f.weight * value(f)).sum::<f64>() / total
            } else {
                0.0
            }
        };
        EntryRef {
            timestamp: self.opened_at(),
            price_a: avg(|f| f.price_a),
            price_b: avg(|f| f.price_b),
            z_score: avg(|f| f.z_score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "position", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    #[default]
    Flat,
    LongSpread(OpenPosition),
    ShortSpread(OpenPosition),
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        matches!(self, PositionState::Flat)
    }

    pub fn position(&self) -> Option<(Direction, &OpenPosition)> {
        match self {
            PositionState::Flat => None,
            PositionState::LongSpread(p) => Some((Direction::LongSpread, p)),
            PositionState::ShortSpread(p) => Some((Direction::ShortSpread, p)),
        }
    }

    pub fn fraction(&self) -> f64 {
        self.position().map(|(_, p)| p.fraction()).unwrap_or(0.0)
    }

    fn with_position(direction: Direction, position: OpenPosition) -> Self {
        match direction {
            Direction::LongSpread => PositionState::LongSpread(position),
            Direction::ShortSpread => PositionState::ShortSpread(position),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    EntryLong,
    EntryShort,
    ScaleIn,
    Exit,
    Stop,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::EntryLong => "ENTRY_LONG",
            SignalKind::EntryShort => "ENTRY_SHORT",
            SignalKind::ScaleIn => "SCALE_IN",
            SignalKind::Exit => "EXIT",
            SignalKind::Stop => "STOP",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub pair: PairId,
    pub kind: SignalKind,
    pub timestamp: DateTime<Utc>,
    pub z_score: f64,
    pub price_a: f64,
    pub price_b: f64,
    /// Position fraction after the transition; 0 once closed.
    pub fraction: f64,
}

impl Signal {
    /// Human-readable notification text.
    pub fn format_message(&self) -> String {
        let action = match self.kind {
            SignalKind::EntryLong => "buy spread (long A, short B)",
            SignalKind::EntryShort => "sell spread (short A, long B)",
            SignalKind::ScaleIn => "add to position",
            SignalKind::Exit => "close position, spread reverted",
            SignalKind::Stop => "close position, stop hit",
        };
        format!(
            "[{}] {} z={:+.2} A={:.4} B={:.4} fraction={:.0}% {} at {}",
            self.kind,
            self.pair,
            self.z_score,
            self.price_a,
            self.price_b,
            self.fraction * 100.0,
            action,
            self.timestamp.format("%Y-%m-%d %H:%M")
        )
    }
}

/// A position closed by EXIT or STOP.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub direction: Direction,
    pub position: OpenPosition,
    pub reason: ExitReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: PositionState,
    pub kind: Option<SignalKind>,
    pub closed: Option<ClosedPosition>,
}

impl Step {
    fn unchanged(state: &PositionState) -> Self {
        Self {
            state: state.clone(),
            kind: None,
            closed: None,
        }
    }
}

/// Advances `state` by one observation. Rules in priority order: entry from
/// FLAT, stop, exit, then at most one scale-in rung. An undefined z-score and
/// a blocked entry leave the state untouched.
pub fn transition(
    state: &PositionState,
    obs: &SpreadObservation,
    hedge_ratio: f64,
    thresholds: &SignalThresholds,
    entries_allowed: bool,
) -> Step {
    let Some(z) = obs.z_score else {
        return Step::unchanged(state);
    };
    let fill = |weight: f64| Fill {
        timestamp: obs.timestamp,
        z_score: z,
        price_a: obs.price_a,
        price_b: obs.price_b,
        spread_std: obs.rolling_std,
        weight,
    };

    let Some((direction, position)) = state.position() else {
        if !entries_allowed {
            return Step::unchanged(state);
        }
        let (direction, kind) = if z <= -thresholds.entry {
            (Direction::LongSpread, SignalKind::EntryLong)
        } else if z >= thresholds.entry {
            (Direction::ShortSpread, SignalKind::EntryShort)
        } else {
            return Step::unchanged(state);
        };
        let position = OpenPosition::open(fill(thresholds.entry_weight()), hedge_ratio);
        return Step {
            state: PositionState::with_position(direction, position),
            kind: Some(kind),
            closed: None,
        };
    };

    let close = |kind: SignalKind, reason: ExitReason| Step {
        state: PositionState::Flat,
        kind: Some(kind),
        closed: Some(ClosedPosition {
            direction,
            position: position.clone(),
            reason,
        }),
    };
    if z.abs() >= thresholds.stop {
        return close(SignalKind::Stop, ExitReason::StopLoss);
    }
    let reverted = match direction {
        Direction::LongSpread => z >= -thresholds.exit,
        Direction::ShortSpread => z <= thresholds.exit,
    };
    if reverted {
        return close(SignalKind::Exit, ExitReason::MeanReversion);
    }

    if !entries_allowed {
        return Step::unchanged(state);
    }
    let Some(rung) = thresholds.rung(position.next_rung) else {
        return Step::unchanged(state);
    };
    let crossed = match direction {
        Direction::LongSpread => z <= -rung.trigger_z,
        Direction::ShortSpread => z >= rung.trigger_z,
    };
    if !crossed {
        return Step::unchanged(state);
    }
    let mut scaled = position.clone();
    scaled.fills.push(fill(rung.weight));
    scaled.next_rung += 1;
    Step {
        state: PositionState::with_position(direction, scaled),
        kind: Some(SignalKind::ScaleIn),
        closed: None,
    }
}

/// Output of one [`SignalStateMachine::advance`] that changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub signal: Signal,
    pub closed: Option<ClosedPosition>,
}

/// The state machine for one pair.
#[derive(Debug, Clone)]
pub struct SignalStateMachine {
    pair: PairId,
    thresholds: SignalThresholds,
    state: PositionState,
}

impl SignalStateMachine {
    pub fn new(pair: PairId, thresholds: SignalThresholds) -> Self {
        Self {
            pair,
            thresholds,
            state: PositionState::Flat,
        }
    }

    pub fn pair(&self) -> &PairId {
        &self.pair
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn thresholds(&self) -> &SignalThresholds {
        &self.thresholds
    }

    pub fn advance(
        &mut self,
        obs: &SpreadObservation,
        hedge_ratio: f64,
        entries_allowed: bool,
    ) -> Option<Event> {
        let step = transition(
            &self.state,
            obs,
            hedge_ratio,
            &self.thresholds,
            entries_allowed,
        );
        self.state = step.state;
        let kind = step.kind?;
        let signal = Signal {
            pair: self.pair.clone(),
            kind,
            timestamp: obs.timestamp,
            z_score: obs.z_score.unwrap_or_default(),
            price_a: obs.price_a,
            price_b: obs.price_b,
            fraction: self.state.fraction(),
        };
        Some(Event {
            signal,
            closed: step.closed,
        })
    }

    /// Drops any open position without a signal, returning it for accounting.
    pub fn force_close(&mut self) -> Option<(Direction, OpenPosition)> {
        match std::mem::take(&mut self.state) {
            PositionState::Flat => None,
            PositionState::LongSpread(p) => Some((Direction::LongSpread, p)),
            PositionState::ShortSpread(p) => Some((Direction::ShortSpread, p)),
        }
    }
}
