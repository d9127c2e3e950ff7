//! Dispatcher: the single pipeline every admitted signal runs through —
//! aggregate, size, risk-check, lock, place, record, protect. Mirrors this
//! codebase's own `process_signals` orchestration shape, generalized from
//! one pass over open markets to one call per inbound signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::aggregator::SignalAggregator;
use crate::audit::{AuditRow, AuditSink};
use crate::config::ConfigResolver;
use crate::errors::EngineError;
use crate::gateway::ExchangeGateway;
use crate::lock::{DistributedLock, LockGuard};
use crate::metrics::Metrics;
use crate::oco::OcoManager;
use crate::position::PositionManager;
use crate::strategy_position::StrategyPositionManager;
use crate::types::{
    CloseReason, OrderSide, OrderType, PositionSide, Signal, SignalDecision, SignalResponse, TradeOrder,
};

const RECENT_ORDER_CACHE_SIZE: usize = 1024;

/// Terminal outcome of a place-with-retry attempt that didn't yield a
/// usable ack: either the exchange placed the order but didn't accept it,
/// or every retry attempt failed.
enum PlaceOutcome {
    Rejected(crate::types::OrderAck),
    Failed(EngineError),
}

pub struct Dispatcher {
    aggregator: Arc<SignalAggregator>,
    config: Arc<ConfigResolver>,
    gateway: Arc<dyn ExchangeGateway>,
    positions: Arc<PositionManager>,
    strategy_positions: Arc<StrategyPositionManager>,
    oco: Arc<OcoManager>,
    audit: Arc<dyn AuditSink>,
    lock: Arc<dyn DistributedLock>,
    metrics: Arc<Metrics>,
    recent_signal_ids: Mutex<VecDeque<Uuid>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregator: Arc<SignalAggregator>,
        config: Arc<ConfigResolver>,
        gateway: Arc<dyn ExchangeGateway>,
        positions: Arc<PositionManager>,
        strategy_positions: Arc<StrategyPositionManager>,
        oco: Arc<OcoManager>,
        audit: Arc<dyn AuditSink>,
        lock: Arc<dyn DistributedLock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator,
            config,
            gateway,
            positions,
            strategy_positions,
            oco,
            audit,
            lock,
            metrics,
            recent_signal_ids: Mutex::new(VecDeque::with_capacity(RECENT_ORDER_CACHE_SIZE)),
        }
    }

    fn already_seen(&self, id: Uuid) -> bool {
        let mut recent = self.recent_signal_ids.lock().unwrap();
        if recent.contains(&id) {
            return true;
        }
        if recent.len() >= RECENT_ORDER_CACHE_SIZE {
            recent.pop_front();
        }
        recent.push_back(id);
        false
    }

    fn resolve_order_type(order_type: Option<OrderType>, default_order_type: OrderType) -> OrderType {
        order_type.unwrap_or(default_order_type)
    }

    fn target_price(order_type: OrderType, signal: &Signal) -> Option<Decimal> {
        if order_type.requires_target_price() {
            signal.target_price.or(Some(signal.current_price))
        } else {
            None
        }
    }

    /// Full 13-step admission-through-protection pipeline for one signal.
    /// Every stage's `Result` is classified into the engine error taxonomy;
    /// nothing here panics on a rejected or failed signal.
    pub async fn dispatch(&self, signal: Signal) -> SignalResponse {
        let signal_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}:{}", signal.strategy_id, signal.symbol, signal.timestamp).as_bytes());
        if self.already_seen(signal_id) {
            return SignalResponse {
                status: SignalDecision::Rejected,
                reason: "duplicate signal already processed".into(),
                order_id: None,
                position_id: None,
                strategy_position_id: None,
                fills: vec![],
            };
        }

        // Step 1: fail-safe — no audit sink available means no real trade.
        let forced_simulation = !self.audit.is_available().await;

        // Step 2: aggregate / conflict-resolve.
        let side_hint = PositionSide::from_action(signal.action);
        let cfg = match side_hint {
            Some(side) => self.config.resolve(&signal.symbol, side),
            None => self.config.global().clone(),
        };

        if !cfg.switches.enabled
            || (side_hint == Some(PositionSide::Long) && !cfg.switches.enable_longs)
            || (side_hint == Some(PositionSide::Short) && !cfg.switches.enable_shorts)
        {
            return self.reject(&signal, "trading disabled by config switches").await;
        }

        let admitted = match self.aggregator.admit(&signal, &cfg) {
            Ok(a) => a,
            Err(e) => return self.reject_with(&signal, e).await,
        };

        // Step 3: order conversion — quantity, order type, sl/tp resolution.
        let order_type = Self::resolve_order_type(signal.order_type, cfg.execution.default_order_type);
        let target_price = Self::target_price(order_type, &signal);
        let base_qty = signal.quantity.unwrap_or(Decimal::ONE);
        let quantity = base_qty * admitted.quantity_scale * cfg.sizing.quantity_multiplier;

        let order = TradeOrder {
            order_id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            side: if admitted.side == PositionSide::Long { OrderSide::Buy } else { OrderSide::Sell },
            order_type,
            amount: quantity,
            target_price,
            time_in_force: cfg.execution.time_in_force,
            position_id: Uuid::new_v4(),
            position_side: Some(admitted.side),
            reduce_only: false,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            strategy_id: signal.strategy_id.clone(),
            strategy_metadata: signal.metadata.clone(),
        };

        // Step 4: risk check.
        let effective_price = target_price.unwrap_or(signal.current_price);
        if cfg.switches.risk_management_enabled {
            if let Err(e) = self.positions.check_risk(&order, effective_price, &cfg.risk) {
                self.metrics.risk_rejected(e.kind());
                return self.reject_with(&signal, e).await;
            }
        }

        if forced_simulation {
            return self.simulate(&signal, &order, "audit_unavailable").await;
        }
        if cfg.switches.simulation_enabled {
            return self.simulate(&signal, &order, "simulation_enabled").await;
        }

        // Step 5: acquire the per-symbol advisory lock. Keyed by symbol alone
        // (not symbol+side) so one-way mode actually gets mutual exclusion
        // between a long and a short admission racing on the same symbol.
        let lock_key = signal.symbol.clone();
        let guard = match LockGuard::acquire(
            self.lock.as_ref(),
            &lock_key,
            Duration::from_secs(cfg.execution.lock_ttl_seconds),
            Duration::from_millis(cfg.execution.lock_acquire_timeout_ms),
        )
        .await
        {
            Ok(g) => g,
            Err(e) => return self.reject_with(&signal, e).await,
        };

        if let Some(note) = &admitted.note {
            self.metrics.signal_conflict_resolved(note);
        }

        // A cross-strategy strongest-wins flip displaced another strategy's
        // resting position — tear it down before opening the new one so the
        // exchange never carries both sides at once in one-way mode. Both
        // simulation paths already returned above, so reaching here means
        // this is a real execution.
        if let Some(opponent) = admitted.cancel_opponent {
            self.close_position_with_cleanup(&signal.symbol, opponent.side, signal.current_price).await;
        }

        let response = self.place_and_protect(&signal, &order, &cfg, forced_simulation).await;
        guard.release().await;
        response
    }

    /// Place `order`, retrying `TransientExchange` failures up to
    /// `max_retries` with `retry_delay_ms * retry_backoff_multiplier^attempt`
    /// backoff between attempts. Non-retryable failures and an exchange
    /// rejection (a placed-but-not-accepted ack) surface immediately.
    async fn place_with_retry(&self, order: &TradeOrder, cfg: &crate::config::ResolvedConfig) -> Result<crate::types::OrderAck, PlaceOutcome> {
        let max_attempts = cfg.execution.max_retries.max(1);
        let base_delay_ms = cfg.execution.retry_delay_ms as f64;
        let multiplier = cfg.execution.retry_backoff_multiplier.to_f64().unwrap_or(2.0);

        let mut last_err: Option<EngineError> = None;
        for attempt in 0..max_attempts {
            match self.gateway.place_order(order).await {
                Ok(ack) if ack.status.is_placed() => return Ok(ack),
                Ok(ack) => return Err(PlaceOutcome::Rejected(ack)),
                Err(e) => {
                    let engine_err: EngineError = e.into();
                    if !engine_err.is_retryable() || attempt + 1 >= max_attempts {
                        return Err(PlaceOutcome::Failed(engine_err));
                    }
                    last_err = Some(engine_err);
                    let backoff_ms = base_delay_ms * multiplier.powi(attempt as i32);
                    tokio::time::sleep(Duration::from_millis(backoff_ms.round().max(0.0) as u64)).await;
                }
            }
        }
        Err(PlaceOutcome::Failed(
            last_err.unwrap_or_else(|| EngineError::TransientExchange("retry loop exited without attempts".into())),
        ))
    }

    async fn place_and_protect(
        &self,
        signal: &Signal,
        order: &TradeOrder,
        cfg: &crate::config::ResolvedConfig,
        forced_simulation: bool,
    ) -> SignalResponse {
        // Step 6: audit "submitted" before the exchange call.
        let _ = self
            .audit
            .record(AuditRow {
                ts: Utc::now(),
                kind: "submitted".into(),
                symbol: Some(signal.symbol.clone()),
                strategy_id: Some(signal.strategy_id.clone()),
                order_id: Some(order.order_id.to_string()),
                reason: "signal admitted".into(),
                detail: serde_json::json!({ "order": order }),
            })
            .await;

        if forced_simulation {
            return self.simulate(signal, order, "audit_unavailable").await;
        }

        // Step 7: place, retrying transient exchange errors with exponential
        // backoff before giving up on this signal.
        let ack = match self.place_with_retry(order, cfg).await {
            Ok(ack) => ack,
            Err(PlaceOutcome::Rejected(ack)) => {
                self.metrics.order_failed(&format!("{:?}", ack.status));
                return self.reject(signal, "exchange rejected the order").await;
            }
            Err(PlaceOutcome::Failed(engine_err)) => {
                self.metrics.order_failed(engine_err.kind());
                return self.reject_with(signal, engine_err).await;
            }
        };

        let fill_price = ack.fill_price.unwrap_or(order.target_price.unwrap_or(signal.current_price));
        let fill_qty = ack.fill_qty.unwrap_or(order.amount);

        // Step 8: physical position update.
        let position_side = order.position_side.unwrap_or(PositionSide::Long);
        self.positions.update_on_fill(order, fill_price, fill_qty, ack.commission);
        self.positions.record_trade();
        self.metrics.position_opened(position_side.as_str());
        if let Err(e) = self.positions.persist(&signal.symbol, position_side).await {
            tracing::warn!(error = %e, symbol = %signal.symbol, "failed to persist position");
        }

        // Step 9: strategy-attributed virtual position.
        let (sp, contribution) = self.strategy_positions.open(
            &signal.strategy_id,
            &signal.symbol,
            position_side,
            fill_price,
            fill_qty,
            order.take_profit,
            order.stop_loss,
        );
        if let Err(e) = self.strategy_positions.persist_strategy_position(&sp).await {
            tracing::warn!(error = %e, strategy_position_id = %sp.strategy_position_id, "failed to persist strategy position");
        }
        if let Err(e) = self.strategy_positions.persist_contribution(&contribution).await {
            tracing::warn!(error = %e, contribution_id = %contribution.contribution_id, "failed to persist position contribution");
        }
        let exchange_key = crate::types::Position::key(&signal.symbol, position_side);
        if let Err(e) = self.strategy_positions.persist_exchange_position(&exchange_key).await {
            tracing::warn!(error = %e, exchange_key = %exchange_key, "failed to persist exchange position");
        }

        self.metrics.order_executed(&signal.symbol, &format!("{:?}", order.order_type), 0);

        // Step 10/11: attach OCO protection for this strategy's slice.
        let oco_result = self
            .oco
            .place_pair(
                &signal.symbol,
                sp.side,
                cfg.mode.position_mode,
                sp.strategy_position_id,
                &signal.strategy_id,
                fill_price,
                fill_qty,
                order.stop_loss,
                order.take_profit,
            )
            .await;

        let reason = match &oco_result {
            Ok(_) => "executed".to_string(),
            Err(e) => format!("executed, protective orders failed: {e}"),
        };

        // Step 12: audit "executed".
        let _ = self
            .audit
            .record(AuditRow {
                ts: Utc::now(),
                kind: "executed".into(),
                symbol: Some(signal.symbol.clone()),
                strategy_id: Some(signal.strategy_id.clone()),
                order_id: Some(order.order_id.to_string()),
                reason: reason.clone(),
                detail: serde_json::json!({ "fill_price": fill_price, "fill_qty": fill_qty }),
            })
            .await;

        SignalResponse {
            status: SignalDecision::Executed,
            reason,
            order_id: Some(order.order_id),
            position_id: Some(order.position_id),
            strategy_position_id: Some(sp.strategy_position_id),
            fills: vec![crate::types::Fill {
                price: fill_price,
                qty: fill_qty,
                commission: ack.commission,
            }],
        }
    }

    /// Record a rejection that happened before any exchange call was made.
    async fn reject(&self, signal: &Signal, reason: &str) -> SignalResponse {
        let _ = self
            .audit
            .record(AuditRow {
                ts: Utc::now(),
                kind: "rejected".into(),
                symbol: Some(signal.symbol.clone()),
                strategy_id: Some(signal.strategy_id.clone()),
                order_id: None,
                reason: reason.to_string(),
                detail: serde_json::json!({}),
            })
            .await;
        SignalResponse {
            status: SignalDecision::Rejected,
            reason: reason.to_string(),
            order_id: None,
            position_id: None,
            strategy_position_id: None,
            fills: vec![],
        }
    }

    async fn reject_with(&self, signal: &Signal, err: EngineError) -> SignalResponse {
        self.reject(signal, &err.to_string()).await
    }

    /// No real exchange call. Used when the audit sink is unavailable (the
    /// "no audit, no real trade" fail-safe) or when simulation mode is on.
    /// The attempt to audit this is made either way — if the sink is down
    /// the write itself fails, which is expected and not treated as fatal.
    async fn simulate(&self, signal: &Signal, order: &TradeOrder, reason: &str) -> SignalResponse {
        let _ = self
            .audit
            .record(AuditRow {
                ts: Utc::now(),
                kind: "simulated".into(),
                symbol: Some(signal.symbol.clone()),
                strategy_id: Some(signal.strategy_id.clone()),
                order_id: Some(order.order_id.to_string()),
                reason: reason.to_string(),
                detail: serde_json::json!({}),
            })
            .await;
        SignalResponse {
            status: SignalDecision::Simulated,
            reason: reason.to_string(),
            order_id: Some(order.order_id),
            position_id: None,
            strategy_position_id: None,
            fills: vec![],
        }
    }

    /// Cancel every protective order on a physical position before closing
    /// it manually, waiting for the cancel acknowledgements rather than
    /// racing the close against a still-resting order.
    pub async fn close_position_with_cleanup(&self, symbol: &str, side: PositionSide, exit_price: Decimal) -> Option<Decimal> {
        let key = crate::types::Position::key(symbol, side);
        self.oco.cancel_all_for_key(symbol, &key).await;
        let closed_qty = self.positions.get(symbol, side)?.quantity;
        let pnl = self.positions.close_partial(symbol, side, closed_qty, exit_price, CloseReason::Manual);
        if pnl.is_some() {
            self.metrics.position_closed(side.as_str());
            if let Err(e) = self.positions.persist(symbol, side).await {
                tracing::warn!(error = %e, symbol, "failed to persist closed position");
            }
        }
        pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::{ConfigResolver, ModeConfig, ResolvedConfig, SwitchesConfig};
    use crate::gateway::binance_futures::{BinanceFuturesGateway, GatewayConfig};
    use crate::types::{Action, PositionMode, Strength, StrategyMode, SymbolFilters};
    use std::collections::HashMap;

    fn filters() -> HashMap<String, SymbolFilters> {
        let mut f = HashMap::new();
        f.insert(
            "BTCUSDT".to_string(),
            SymbolFilters {
                step_size: Decimal::new(1, 3),
                tick_size: Decimal::new(1, 1),
                min_qty: Decimal::new(1, 3),
                min_notional: Decimal::new(20, 0),
                price_precision: 1,
                qty_precision: 3,
            },
        );
        f
    }

    fn signal(strategy_id: &str, symbol: &str, action: Action) -> Signal {
        Signal {
            strategy_id: strategy_id.to_string(),
            strategy_mode: StrategyMode::Deterministic,
            symbol: symbol.to_string(),
            action,
            confidence: Decimal::new(9, 1),
            strength: Strength::Strong,
            current_price: Decimal::new(60_000, 0),
            target_price: None,
            quantity: Some(Decimal::new(1, 1)),
            stop_loss_pct: None,
            take_profit_pct: None,
            stop_loss: Some(Decimal::new(59_000, 0)),
            take_profit: Some(Decimal::new(61_000, 0)),
            position_size_pct: None,
            order_type: Some(OrderType::Market),
            timeframe: None,
            timestamp: Utc::now(),
            model_confidence: None,
            reasoning: None,
            metadata: HashMap::new(),
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        audit: Arc<MemoryAuditSink>,
    }

    fn build(position_mode: PositionMode, simulation_enabled: bool) -> Harness {
        let gateway = Arc::new(BinanceFuturesGateway::new(GatewayConfig::default(), filters()));
        gateway.set_mark_price("BTCUSDT", Decimal::new(60_000, 0));

        let mut global = ResolvedConfig::default();
        global.mode = ModeConfig {
            position_mode,
            position_mode_aware_conflicts: true,
        };
        global.switches = SwitchesConfig {
            simulation_enabled,
            ..SwitchesConfig::default()
        };
        let config = Arc::new(ConfigResolver::with_global(global));

        let positions = Arc::new(PositionManager::new(Decimal::new(100_000, 0)));
        let strategy_positions = Arc::new(StrategyPositionManager::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(Metrics::default());
        let oco = Arc::new(OcoManager::new(
            gateway.clone(),
            strategy_positions.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let lock = Arc::new(crate::lock::InMemoryLock::new());
        let aggregator = Arc::new(SignalAggregator::new());

        let dispatcher = Dispatcher::new(
            aggregator,
            config,
            gateway,
            positions,
            strategy_positions,
            oco,
            audit.clone(),
            lock,
            metrics,
        );
        Harness { dispatcher, audit }
    }

    #[tokio::test]
    async fn hedge_mode_opposite_direction_signals_open_independent_positions() {
        let h = build(PositionMode::Hedge, false);

        let long = h.dispatcher.dispatch(signal("momentum", "BTCUSDT", Action::Buy)).await;
        assert_eq!(long.status, SignalDecision::Executed, "{}", long.reason);

        let short = h.dispatcher.dispatch(signal("mean_reversion", "BTCUSDT", Action::Sell)).await;
        assert_eq!(short.status, SignalDecision::Executed, "{}", short.reason);

        assert_ne!(long.strategy_position_id, short.strategy_position_id);
        assert_ne!(long.position_id, short.position_id);
    }

    #[tokio::test]
    async fn audit_unavailable_forces_simulation() {
        let h = build(PositionMode::Hedge, false);
        h.audit.set_forced_unavailable(true);

        let response = h.dispatcher.dispatch(signal("momentum", "BTCUSDT", Action::Buy)).await;
        assert_eq!(response.status, SignalDecision::Simulated);
        assert_eq!(response.reason, "audit_unavailable");
    }

    #[tokio::test]
    async fn simulation_switch_forces_simulation_with_distinct_reason() {
        let h = build(PositionMode::Hedge, true);

        let response = h.dispatcher.dispatch(signal("momentum", "BTCUSDT", Action::Buy)).await;
        assert_eq!(response.status, SignalDecision::Simulated);
        assert_eq!(response.reason, "simulation_enabled");
    }

    #[tokio::test]
    async fn duplicate_signal_is_rejected() {
        let h = build(PositionMode::Hedge, true);
        let s = signal("momentum", "BTCUSDT", Action::Buy);

        let first = h.dispatcher.dispatch(s.clone()).await;
        assert_eq!(first.status, SignalDecision::Simulated);

        let second = h.dispatcher.dispatch(s).await;
        assert_eq!(second.status, SignalDecision::Rejected);
        assert_eq!(second.reason, "duplicate signal already processed");
    }

    #[tokio::test]
    async fn multiple_strategies_on_same_symbol_side_each_get_a_strategy_position() {
        let h = build(PositionMode::Hedge, false);

        let a = h.dispatcher.dispatch(signal("momentum", "BTCUSDT", Action::Buy)).await;
        assert_eq!(a.status, SignalDecision::Executed, "{}", a.reason);

        let b = h.dispatcher.dispatch(signal("breakout", "BTCUSDT", Action::Buy)).await;
        assert_eq!(b.status, SignalDecision::Executed, "{}", b.reason);

        assert_ne!(a.strategy_position_id, b.strategy_position_id);
    }
}
