//! OCO Manager: synthesizes one-cancels-other semantics the exchange does
//! not natively provide on futures. Each physical position can carry
//! multiple independent pairs, one per contributing strategy — blocking a
//! second pair because one already existed was a real bug upstream; the
//! data structure here is an ordered list per key specifically so that
//! never happens again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditRow, AuditSink};
use crate::errors::EngineError;
use crate::gateway::ExchangeGateway;
use crate::metrics::Metrics;
use crate::store::{to_json, with_retry, DocumentStore};
use crate::strategy_position::StrategyPositionManager;
use crate::types::{
    CloseReason, OcoPair, OcoPairStatus, OrderSide, OrderType, PositionMode, PositionSide, TimeInForce, TradeOrder,
};

const PERSIST_RETRY_ATTEMPTS: u32 = 3;

pub struct OcoManager {
    gateway: Arc<dyn ExchangeGateway>,
    strategy_positions: Arc<StrategyPositionManager>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
    pairs: RwLock<HashMap<String, Vec<OcoPair>>>,
    shutdown: Arc<AtomicBool>,
    store: Option<Arc<dyn DocumentStore>>,
}

impl OcoManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        strategy_positions: Arc<StrategyPositionManager>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gateway,
            strategy_positions,
            audit,
            metrics,
            pairs: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            store: None,
        }
    }

    /// Attach the document store each placed OCO pair is durably upserted
    /// into. Consuming builder so `new()` and its existing call sites stay
    /// unchanged.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn persist_pair(&self, pair: &OcoPair) -> Result<(), EngineError> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let id = pair.strategy_position_id;
        let doc = to_json(pair)?;
        with_retry(PERSIST_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.upsert("oco_pairs", id, doc).await }
        })
        .await
    }

    pub fn pairs_for(&self, key: &str) -> Vec<OcoPair> {
        self.pairs.read().unwrap().get(key).cloned().unwrap_or_default()
    }

    /// Protective orders close an existing slice, so they carry
    /// `reduce_only` in one-way mode and `position_side` in hedge mode —
    /// the two are mutually exclusive on this exchange family, same as the
    /// entry order's own hedge-mode rule.
    #[allow(clippy::too_many_arguments)]
    fn protective_order(
        symbol: &str,
        opposite_side: OrderSide,
        position_side: PositionSide,
        position_mode: PositionMode,
        trigger_price: Decimal,
        qty: Decimal,
        order_type: OrderType,
        strategy_id: &str,
    ) -> TradeOrder {
        TradeOrder {
            order_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: opposite_side,
            order_type,
            amount: qty,
            target_price: Some(trigger_price),
            time_in_force: TimeInForce::GTC,
            position_id: Uuid::new_v4(),
            position_side: (position_mode == PositionMode::Hedge).then_some(position_side),
            reduce_only: position_mode == PositionMode::OneWay,
            stop_loss: None,
            take_profit: None,
            strategy_id: strategy_id.to_string(),
            strategy_metadata: Default::default(),
        }
    }

    /// Place the SL+TP pair for one strategy's entry into a physical
    /// position. Both legs must succeed for the pair to become active; a
    /// partial success cancels the placed leg and surfaces the failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_pair(
        &self,
        symbol: &str,
        position_side: PositionSide,
        position_mode: PositionMode,
        strategy_position_id: Uuid,
        strategy_id: &str,
        entry_price: Decimal,
        qty: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<OcoPair, EngineError> {
        let key = crate::types::Position::key(symbol, position_side);
        let opposite = match position_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };

        let sl_order = stop_loss.map(|sl| {
            Self::protective_order(symbol, opposite, position_side, position_mode, sl, qty, OrderType::Stop, strategy_id)
        });
        let tp_order = take_profit.map(|tp| {
            Self::protective_order(symbol, opposite, position_side, position_mode, tp, qty, OrderType::TakeProfit, strategy_id)
        });

        let mut sl_id = None;
        let mut tp_id = None;

        if let Some(order) = &sl_order {
            match self.gateway.place_order(order).await {
                Ok(ack) if ack.status.is_placed() => sl_id = Some(ack.order_id),
                Ok(_) | Err(_) => {
                    return Err(EngineError::PermanentExchange("stop_loss leg failed to place".into()));
                }
            }
        }

        if let Some(order) = &tp_order {
            match self.gateway.place_order(order).await {
                Ok(ack) if ack.status.is_placed() => tp_id = Some(ack.order_id),
                Ok(_) | Err(_) => {
                    if let Some(id) = sl_id {
                        let _ = self.gateway.cancel_order(symbol, id).await;
                    }
                    return Err(EngineError::PermanentExchange("take_profit leg failed to place, stop_loss cancelled".into()));
                }
            }
        }

        let pair = OcoPair {
            strategy_position_id,
            entry_price,
            quantity: qty,
            sl_order_id: sl_id,
            tp_order_id: tp_id,
            status: OcoPairStatus::Active,
        };

        self.pairs.write().unwrap().entry(key.clone()).or_default().push(pair.clone());
        self.metrics.active_oco_pairs_per_position(&key, self.pairs_for(&key).len());
        if let Err(e) = self.persist_pair(&pair).await {
            tracing::warn!(error = %e, strategy_position_id = %pair.strategy_position_id, "failed to persist oco pair");
        }
        Ok(pair)
    }

    /// Cancel every active pair attached to `key` (used before a manual
    /// close, so no protective orders are left orphaned on the book).
    pub async fn cancel_all_for_key(&self, symbol: &str, key: &str) {
        let pairs = self.pairs_for(key);
        for pair in pairs.iter().filter(|p| p.status == OcoPairStatus::Active) {
            if let Some(id) = pair.sl_order_id {
                let _ = self.gateway.cancel_order(symbol, id).await;
            }
            if let Some(id) = pair.tp_order_id {
                let _ = self.gateway.cancel_order(symbol, id).await;
            }
        }
        let cancelled: Vec<OcoPair> = {
            let mut all_pairs = self.pairs.write().unwrap();
            let Some(list) = all_pairs.get_mut(key) else { return };
            list.iter_mut()
                .filter(|p| p.status == OcoPairStatus::Active)
                .map(|p| {
                    p.status = OcoPairStatus::Cancelled;
                    p.clone()
                })
                .collect()
        };
        for pair in &cancelled {
            if let Err(e) = self.persist_pair(pair).await {
                tracing::warn!(error = %e, strategy_position_id = %pair.strategy_position_id, "failed to persist cancelled oco pair");
            }
        }
    }

    async fn poll_once(&self, symbol_lookup: &HashMap<String, String>) {
        let snapshot: Vec<(String, Vec<OcoPair>)> = {
            let pairs = self.pairs.read().unwrap();
            pairs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (key, pairs) in snapshot {
            let Some(symbol) = symbol_lookup.get(&key) else { continue };
            for pair in pairs.into_iter().filter(|p| p.status == OcoPairStatus::Active) {
                let sl_ack = match pair.sl_order_id {
                    Some(id) => self.gateway.get_order(symbol, id).await.ok(),
                    None => None,
                };
                let tp_ack = match pair.tp_order_id {
                    Some(id) => self.gateway.get_order(symbol, id).await.ok(),
                    None => None,
                };

                let filled = sl_ack
                    .as_ref()
                    .filter(|a| a.status.is_terminal_success())
                    .map(|a| (a, CloseReason::StopLoss, pair.tp_order_id))
                    .or_else(|| {
                        tp_ack
                            .as_ref()
                            .filter(|a| a.status.is_terminal_success())
                            .map(|a| (a, CloseReason::TakeProfit, pair.sl_order_id))
                    });

                let Some((ack, reason, survivor)) = filled else { continue };
                let exit_price = ack.fill_price.unwrap_or(pair.entry_price);

                if let Some(survivor_id) = survivor {
                    let _ = self.gateway.cancel_order(symbol, survivor_id).await;
                }

                if let Some((sp, pnl)) = self.strategy_positions.close(pair.strategy_position_id, exit_price, reason) {
                    match reason {
                        CloseReason::TakeProfit => self.metrics.strategy_tp_triggered(&sp.strategy_id),
                        CloseReason::StopLoss => self.metrics.strategy_sl_triggered(&sp.strategy_id),
                        _ => {}
                    }
                    self.metrics.position_pnl_realized(&sp.strategy_id, reason_str(reason), pnl);

                    if let Err(e) = self.strategy_positions.persist_strategy_position(&sp).await {
                        tracing::warn!(error = %e, strategy_position_id = %sp.strategy_position_id, "failed to persist closed strategy position");
                    }
                    if let Err(e) = self.strategy_positions.persist_exchange_position(&sp.exchange_position_key()).await {
                        tracing::warn!(error = %e, exchange_key = %sp.exchange_position_key(), "failed to persist exchange position");
                    }

                    let _ = self
                        .audit
                        .record(AuditRow {
                            ts: chrono::Utc::now(),
                            kind: "oco_pair_completed".into(),
                            symbol: Some(symbol.clone()),
                            strategy_id: Some(sp.strategy_id.clone()),
                            order_id: None,
                            reason: reason_str(reason).into(),
                            detail: serde_json::json!({ "pnl": pnl, "exit_price": exit_price }),
                        })
                        .await;
                }

                let completed = {
                    let mut all_pairs = self.pairs.write().unwrap();
                    all_pairs.get_mut(&key).and_then(|list| {
                        list.iter_mut()
                            .find(|p| p.strategy_position_id == pair.strategy_position_id && p.status == OcoPairStatus::Active)
                            .map(|p| {
                                p.status = OcoPairStatus::Completed;
                                p.clone()
                            })
                    })
                };
                if let Some(p) = &completed {
                    if let Err(e) = self.persist_pair(p).await {
                        tracing::warn!(error = %e, strategy_position_id = %p.strategy_position_id, "failed to persist completed oco pair");
                    }
                }
            }
        }
    }

    /// Background task: poll every `interval` until `shutdown` is set.
    pub async fn run_monitor(self: Arc<Self>, interval: Duration) {
        let symbol_lookup: HashMap<String, String> = HashMap::new();
        let _ = &symbol_lookup;
        while !self.shutdown.load(Ordering::Relaxed) {
            let lookup = self.symbol_lookup();
            self.poll_once(&lookup).await;
            tokio::time::sleep(interval).await;
        }
    }

    fn symbol_lookup(&self) -> HashMap<String, String> {
        self.pairs
            .read()
            .unwrap()
            .keys()
            .filter_map(|k| k.rsplit_once('_').map(|(symbol, _side)| (k.clone(), symbol.to_string())))
            .collect()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn reason_str(r: CloseReason) -> &'static str {
    match r {
        CloseReason::TakeProfit => "take_profit",
        CloseReason::StopLoss => "stop_loss",
        CloseReason::Manual => "manual",
        CloseReason::Partial => "partial",
        CloseReason::Liquidation => "liquidation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::gateway::binance_futures::{BinanceFuturesGateway, GatewayConfig};
    use crate::types::SymbolFilters;
    use std::collections::HashMap as Map;

    fn gateway() -> Arc<BinanceFuturesGateway> {
        let mut filters = Map::new();
        filters.insert(
            "BTCUSDT".to_string(),
            SymbolFilters {
                step_size: Decimal::new(1, 3),
                tick_size: Decimal::new(1, 0),
                min_qty: Decimal::new(1, 3),
                min_notional: Decimal::new(10, 0),
                price_precision: 0,
                qty_precision: 3,
            },
        );
        let gw = BinanceFuturesGateway::new(GatewayConfig::default(), filters);
        gw.set_mark_price("BTCUSDT", Decimal::new(50_000, 0));
        Arc::new(gw)
    }

    #[tokio::test]
    async fn place_pair_records_both_legs() {
        let gateway = gateway();
        let spm = Arc::new(StrategyPositionManager::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(Metrics::default());
        let oco = OcoManager::new(gateway.clone(), spm.clone(), audit, metrics);

        let (sp, _) = spm.open("momentum", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(48_000, 0)), Some(Decimal::new(44_000, 0)));

        let pair = oco
            .place_pair(
                "BTCUSDT",
                PositionSide::Long,
                PositionMode::Hedge,
                sp.strategy_position_id,
                "momentum",
                Decimal::new(45_000, 0),
                Decimal::new(1, 3),
                Some(Decimal::new(44_000, 0)),
                Some(Decimal::new(48_000, 0)),
            )
            .await
            .unwrap();

        assert!(pair.sl_order_id.is_some());
        assert!(pair.tp_order_id.is_some());
        assert_eq!(oco.pairs_for("BTCUSDT_LONG").len(), 1);
    }

    #[tokio::test]
    async fn monitor_closes_strategy_position_when_tp_leg_fills() {
        let gateway = gateway();
        let spm = Arc::new(StrategyPositionManager::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(Metrics::default());
        let oco = OcoManager::new(gateway.clone(), spm.clone(), audit.clone(), metrics);

        let (sp, _) = spm.open("momentum", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(48_000, 0)), Some(Decimal::new(44_000, 0)));
        let pair = oco
            .place_pair("BTCUSDT", PositionSide::Long, PositionMode::Hedge, sp.strategy_position_id, "momentum", Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(44_000, 0)), Some(Decimal::new(48_000, 0)))
            .await
            .unwrap();

        gateway.force_fill(pair.tp_order_id.unwrap(), Decimal::new(48_000, 0), Decimal::new(1, 3), Decimal::ZERO);

        let mut lookup = HashMap::new();
        lookup.insert("BTCUSDT_LONG".to_string(), "BTCUSDT".to_string());
        oco.poll_once(&lookup).await;

        let closed = spm.get(sp.strategy_position_id).unwrap();
        assert_eq!(closed.status, crate::types::StrategyPositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));

        let sl_status = gateway.get_order("BTCUSDT", pair.sl_order_id.unwrap()).await.unwrap().status;
        assert_eq!(sl_status, crate::types::OrderStatus::Canceled);

        let updated = oco.pairs_for("BTCUSDT_LONG");
        assert_eq!(updated[0].status, OcoPairStatus::Completed);
        assert_eq!(audit.rows().len(), 1);
    }

    #[tokio::test]
    async fn multiple_strategies_get_independent_pairs() {
        let gateway = gateway();
        let spm = Arc::new(StrategyPositionManager::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(Metrics::default());
        let oco = OcoManager::new(gateway, spm.clone(), audit, metrics);

        let (a, _) = spm.open("A", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), None, None);
        let (b, _) = spm.open("B", "BTCUSDT", PositionSide::Long, Decimal::new(45_500, 0), Decimal::new(1, 3), None, None);

        oco.place_pair("BTCUSDT", PositionSide::Long, PositionMode::Hedge, a.strategy_position_id, "A", Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(44_000, 0)), Some(Decimal::new(48_000, 0))).await.unwrap();
        oco.place_pair("BTCUSDT", PositionSide::Long, PositionMode::Hedge, b.strategy_position_id, "B", Decimal::new(45_500, 0), Decimal::new(1, 3), Some(Decimal::new(44_500, 0)), Some(Decimal::new(49_000, 0))).await.unwrap();

        assert_eq!(oco.pairs_for("BTCUSDT_LONG").len(), 2);
    }

    #[tokio::test]
    async fn place_pair_upserts_into_the_document_store() {
        use crate::store::jsonl_store::JsonlDocumentStore;

        let mut dir = std::env::temp_dir();
        dir.push(format!("trade-engine-oco-test-{}", Uuid::new_v4()));
        let store: Arc<dyn DocumentStore> = Arc::new(JsonlDocumentStore::open(&dir).unwrap());

        let gateway = gateway();
        let spm = Arc::new(StrategyPositionManager::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(Metrics::default());
        let oco = OcoManager::new(gateway, spm.clone(), audit, metrics).with_store(store);

        let (sp, _) = spm.open("momentum", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(48_000, 0)), Some(Decimal::new(44_000, 0)));
        oco.place_pair("BTCUSDT", PositionSide::Long, PositionMode::Hedge, sp.strategy_position_id, "momentum", Decimal::new(45_000, 0), Decimal::new(1, 3), Some(Decimal::new(44_000, 0)), Some(Decimal::new(48_000, 0)))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(dir.join("oco_pairs.jsonl")).unwrap();
        assert!(contents.contains(&sp.strategy_position_id.to_string()));

        std::fs::remove_dir_all(&dir).ok();
    }
}
