//! Signal Aggregator: per-strategy signal admission, mode-specific
//! confidence gating and sizing, and conflict resolution against whatever
//! that strategy (or a competing one, in one-way mode) already has open.
//! The numbered-gate shape of `admit` mirrors this codebase's own
//! strategy risk gate, generalized from a single pass/fail check to the
//! full signal lifecycle.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::config::{ResolvedConfig, SignalConfig};
use crate::errors::EngineError;
use crate::types::{
    Action, PositionMode, PositionSide, SameDirectionConflictResolution, Signal, SignalConflictResolution, StrategyMode,
};

/// A losing signal's resting orders and position should be torn down as
/// part of a `strongest_wins` flip — this names whose and on which side.
#[derive(Debug, Clone, Copy)]
pub struct CancelOpponent {
    pub side: PositionSide,
}

/// Outcome of a successful admission: the side to trade and the sized
/// quantity after mode-specific scaling, plus a human-readable note on any
/// conflict resolution that was applied, and — when a cross-strategy
/// opposite-direction flip just displaced another strategy's signal — the
/// side whose position and resting orders the dispatcher must now tear down.
#[derive(Debug, Clone)]
pub struct AdmittedSignal {
    pub side: PositionSide,
    pub quantity_scale: Decimal,
    pub note: Option<String>,
    pub cancel_opponent: Option<CancelOpponent>,
}

struct ActiveSignal {
    signal: Signal,
    side: PositionSide,
    received_at: chrono::DateTime<Utc>,
}

/// Active-signal state is keyed by symbol alone (not `(strategy_id,
/// symbol)`) because conflict resolution is a cross-strategy concern: one
/// symbol can hold at most one net direction in one-way mode regardless of
/// which strategy is asking, and hedge mode needs to see every strategy's
/// last signal on a symbol to decide whether an incoming one is
/// same-direction or opposite-direction.
pub struct SignalAggregator {
    active: RwLock<HashMap<String, ActiveSignal>>,
}

impl Default for SignalAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalAggregator {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    fn expire_stale(&self, max_age_seconds: i64) {
        let now = Utc::now();
        self.active
            .write()
            .unwrap()
            .retain(|_, v| (now - v.received_at).num_seconds() <= max_age_seconds);
    }

    /// Mode-specific confidence gate + quantity scaling. Deterministic
    /// signals scale linearly with `confidence`; ML_Light signals scale
    /// conservatively off `model_confidence`; LLM_Reasoning signals carry
    /// the strictest gate and the most conservative scaling of the three.
    fn gate_and_scale(signal: &Signal, cfg: &SignalConfig) -> Result<Decimal, EngineError> {
        match signal.strategy_mode {
            StrategyMode::Deterministic => {
                if signal.confidence < cfg.min_confidence_threshold {
                    return Err(EngineError::Validation(format!(
                        "confidence {} below threshold {}",
                        signal.confidence, cfg.min_confidence_threshold
                    )));
                }
                Ok(signal.confidence)
            }
            StrategyMode::MlLight => {
                let model_confidence = signal
                    .model_confidence
                    .ok_or_else(|| EngineError::Validation("ml_light signal missing model_confidence".into()))?;
                if model_confidence < cfg.min_confidence_threshold {
                    return Err(EngineError::Validation(format!(
                        "model_confidence {model_confidence} below threshold {}",
                        cfg.min_confidence_threshold
                    )));
                }
                Ok(Decimal::new(5, 1) + Decimal::new(5, 1) * model_confidence)
            }
            StrategyMode::LlmReasoning => {
                let model_confidence = signal
                    .model_confidence
                    .ok_or_else(|| EngineError::Validation("llm_reasoning signal missing model_confidence".into()))?;
                let strict_threshold = (cfg.min_confidence_threshold + Decimal::new(1, 1)).min(Decimal::ONE);
                if model_confidence < strict_threshold {
                    return Err(EngineError::Validation(format!(
                        "model_confidence {model_confidence} below strict threshold {strict_threshold}"
                    )));
                }
                if signal.reasoning.is_none() {
                    return Err(EngineError::Validation("llm_reasoning signal missing reasoning".into()));
                }
                Ok(Decimal::new(3, 1) + Decimal::new(3, 1) * model_confidence)
            }
        }
    }

    /// Admit one signal: expire stale state, gate and scale it, resolve any
    /// conflict against whatever is already active for this symbol, and
    /// record it as the new active signal on success.
    pub fn admit(&self, signal: &Signal, config: &ResolvedConfig) -> Result<AdmittedSignal, EngineError> {
        self.expire_stale(config.signal.max_signal_age_seconds);

        let side = PositionSide::from_action(signal.action)
            .ok_or_else(|| EngineError::Validation("HOLD signals are not admitted".into()))?;

        let quantity_scale = Self::gate_and_scale(signal, &config.signal)?;

        let key = signal.symbol.clone();
        let mut active = self.active.write().unwrap();

        let (note, cancel_opponent) = match active.get(&key) {
            None => (None, None),
            Some(existing) if existing.side == side => {
                let note = self.resolve_same_direction(signal, existing, config.signal.same_direction_conflict_resolution)?;
                (Some(note), None)
            }
            Some(existing) => {
                let (note, cancel_opponent) = self.resolve_opposite_direction(
                    signal,
                    existing,
                    config.mode.position_mode,
                    config.signal.signal_conflict_resolution,
                )?;
                (Some(note), cancel_opponent)
            }
        };

        active.insert(
            key,
            ActiveSignal {
                signal: signal.clone(),
                side,
                received_at: signal.timestamp,
            },
        );

        Ok(AdmittedSignal { side, quantity_scale, note, cancel_opponent })
    }

    fn resolve_same_direction(
        &self,
        incoming: &Signal,
        existing: &ActiveSignal,
        policy: SameDirectionConflictResolution,
    ) -> Result<String, EngineError> {
        match policy {
            SameDirectionConflictResolution::Accumulate => Ok("same_direction_accumulate".into()),
            SameDirectionConflictResolution::StrongestWins => {
                if incoming.confidence >= existing.signal.confidence {
                    Ok("same_direction_strongest_wins_incoming".into())
                } else {
                    Err(EngineError::ConflictRejection {
                        policy: "same_direction_strongest_wins".into(),
                        reason: "existing signal has higher confidence".into(),
                    })
                }
            }
            SameDirectionConflictResolution::RejectDuplicates => Err(EngineError::ConflictRejection {
                policy: "same_direction_reject_duplicates".into(),
                reason: "an active signal already covers this strategy+symbol+direction".into(),
            }),
        }
    }

    /// Opposite-direction conflicts only matter in one-way mode, where a
    /// symbol can hold at most one net position; hedge mode keeps LONG and
    /// SHORT books fully independent so no resolution is needed there. When
    /// the incoming signal wins a `strongest_wins` flip against a *different*
    /// strategy's active signal, the loser's side is handed back so the
    /// dispatcher can cancel its resting orders and close its position —
    /// the "cancel-and-replace" half of this resolution.
    fn resolve_opposite_direction(
        &self,
        incoming: &Signal,
        existing: &ActiveSignal,
        position_mode: PositionMode,
        policy: SignalConflictResolution,
    ) -> Result<(String, Option<CancelOpponent>), EngineError> {
        if position_mode == PositionMode::Hedge {
            return Ok(("opposite_direction_independent_hedge_mode".into(), None));
        }

        match policy {
            SignalConflictResolution::StrongestWins => {
                if incoming.confidence > existing.signal.confidence {
                    let opponent = (incoming.strategy_id != existing.signal.strategy_id)
                        .then_some(CancelOpponent { side: existing.side });
                    Ok(("opposite_direction_strongest_wins_incoming".into(), opponent))
                } else {
                    Err(EngineError::ConflictRejection {
                        policy: "strongest_wins".into(),
                        reason: "existing opposite-direction signal has higher or equal confidence".into(),
                    })
                }
            }
            SignalConflictResolution::FirstComeFirstServed => Err(EngineError::ConflictRejection {
                policy: "first_come_first_served".into(),
                reason: "an opposite-direction signal is already active for this symbol".into(),
            }),
            SignalConflictResolution::WeightedAverage => Ok(("opposite_direction_weighted_average".into(), None)),
            SignalConflictResolution::ManualReview => Err(EngineError::ConflictRejection {
                policy: "manual_review".into(),
                reason: "opposite-direction conflict requires manual review".into(),
            }),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedConfig;

    fn signal(strategy: &str, action: Action, confidence: Decimal, mode: StrategyMode) -> Signal {
        Signal {
            strategy_id: strategy.to_string(),
            strategy_mode: mode,
            symbol: "BTCUSDT".to_string(),
            action,
            confidence,
            strength: crate::types::Strength::Medium,
            current_price: Decimal::new(50_000, 0),
            target_price: None,
            quantity: None,
            stop_loss_pct: None,
            take_profit_pct: None,
            stop_loss: None,
            take_profit: None,
            position_size_pct: None,
            order_type: None,
            timeframe: None,
            timestamp: Utc::now(),
            model_confidence: if mode == StrategyMode::Deterministic { None } else { Some(confidence) },
            reasoning: if mode == StrategyMode::LlmReasoning { Some("reasoning".into()) } else { None },
            metadata: Default::default(),
        }
    }

    #[test]
    fn deterministic_signal_below_threshold_is_rejected() {
        let agg = SignalAggregator::new();
        let cfg = ResolvedConfig::default();
        let s = signal("momentum", Action::Buy, Decimal::new(3, 1), StrategyMode::Deterministic);
        let err = agg.admit(&s, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn hold_signal_is_never_admitted() {
        let agg = SignalAggregator::new();
        let cfg = ResolvedConfig::default();
        let s = signal("momentum", Action::Hold, Decimal::new(9, 1), StrategyMode::Deterministic);
        assert!(agg.admit(&s, &cfg).is_err());
    }

    #[test]
    fn same_direction_accumulate_always_admits() {
        let agg = SignalAggregator::new();
        let cfg = ResolvedConfig::default();
        let s1 = signal("momentum", Action::Buy, Decimal::new(8, 1), StrategyMode::Deterministic);
        let s2 = signal("momentum", Action::Buy, Decimal::new(7, 1), StrategyMode::Deterministic);
        agg.admit(&s1, &cfg).unwrap();
        let admitted = agg.admit(&s2, &cfg).unwrap();
        assert_eq!(admitted.note.unwrap(), "same_direction_accumulate");
    }

    #[test]
    fn opposite_direction_in_hedge_mode_is_independent() {
        let agg = SignalAggregator::new();
        let mut cfg = ResolvedConfig::default();
        cfg.mode.position_mode = PositionMode::Hedge;
        let long = signal("momentum", Action::Buy, Decimal::new(9, 1), StrategyMode::Deterministic);
        let short = signal("momentum", Action::Sell, Decimal::new(9, 1), StrategyMode::Deterministic);
        agg.admit(&long, &cfg).unwrap();
        let admitted = agg.admit(&short, &cfg).unwrap();
        assert_eq!(admitted.side, PositionSide::Short);
    }

    #[test]
    fn opposite_direction_one_way_strongest_wins_rejects_weaker_flip() {
        let agg = SignalAggregator::new();
        let mut cfg = ResolvedConfig::default();
        cfg.mode.position_mode = PositionMode::OneWay;
        cfg.signal.signal_conflict_resolution = SignalConflictResolution::StrongestWins;
        let long = signal("momentum", Action::Buy, Decimal::new(9, 1), StrategyMode::Deterministic);
        let short = signal("mean_reversion", Action::Sell, Decimal::new(6, 1), StrategyMode::Deterministic);
        agg.admit(&long, &cfg).unwrap();
        let err = agg.admit(&short, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::ConflictRejection { .. }));
    }

    /// Cross-strategy conflicts must be visible even though the two signals
    /// never share a `strategy_id` — the aggregator keys active state by
    /// symbol alone specifically so this case is caught.
    #[test]
    fn opposite_direction_cross_strategy_strongest_wins_cancels_loser() {
        let agg = SignalAggregator::new();
        let mut cfg = ResolvedConfig::default();
        cfg.mode.position_mode = PositionMode::OneWay;
        cfg.signal.signal_conflict_resolution = SignalConflictResolution::StrongestWins;
        let long = signal("momentum", Action::Buy, Decimal::new(6, 1), StrategyMode::Deterministic);
        let short = signal("mean_reversion", Action::Sell, Decimal::new(9, 1), StrategyMode::Deterministic);
        agg.admit(&long, &cfg).unwrap();
        let admitted = agg.admit(&short, &cfg).unwrap();
        assert_eq!(admitted.side, PositionSide::Short);
        let opponent = admitted.cancel_opponent.expect("incoming signal from a different strategy should displace momentum's long");
        assert_eq!(opponent.side, PositionSide::Long);
    }

    /// Same-strategy flips are not a cross-strategy displacement — there is
    /// no separate opponent to cancel, the strategy is just replacing its
    /// own prior signal.
    #[test]
    fn opposite_direction_same_strategy_flip_has_no_opponent() {
        let agg = SignalAggregator::new();
        let mut cfg = ResolvedConfig::default();
        cfg.mode.position_mode = PositionMode::OneWay;
        cfg.signal.signal_conflict_resolution = SignalConflictResolution::StrongestWins;
        let long = signal("momentum", Action::Buy, Decimal::new(6, 1), StrategyMode::Deterministic);
        let short = signal("momentum", Action::Sell, Decimal::new(9, 1), StrategyMode::Deterministic);
        agg.admit(&long, &cfg).unwrap();
        let admitted = agg.admit(&short, &cfg).unwrap();
        assert!(admitted.cancel_opponent.is_none());
    }

    #[test]
    fn ml_light_scales_conservatively_off_model_confidence() {
        let agg = SignalAggregator::new();
        let cfg = ResolvedConfig::default();
        let s = signal("ml_strategy", Action::Buy, Decimal::new(8, 1), StrategyMode::MlLight);
        let admitted = agg.admit(&s, &cfg).unwrap();
        assert_eq!(admitted.quantity_scale, Decimal::new(9, 1));
    }
}
