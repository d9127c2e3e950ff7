//! Strategy Position Manager: virtual per-strategy positions layered over
//! the physical `Position`, with a contributions ledger and a
//! weighted-average `ExchangePosition` aggregate. The one invariant that
//! matters more than any other here: PnL is always computed against the
//! contributing strategy's own entry price, never the aggregate VWAP —
//! see `StrategyPosition::pnl_at`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::store::{to_json, with_retry, DocumentStore};
use crate::types::{
    CloseReason, ContributionStatus, ExchangePosition, ExchangePositionStatus, Fill, PositionContribution,
    PositionSide, StrategyPosition, StrategyPositionStatus,
};

const PERSIST_RETRY_ATTEMPTS: u32 = 3;

pub struct StrategyPositionManager {
    strategy_positions: RwLock<HashMap<Uuid, StrategyPosition>>,
    contributions: RwLock<HashMap<Uuid, PositionContribution>>,
    exchange_positions: RwLock<HashMap<String, ExchangePosition>>,
    store: Option<Arc<dyn DocumentStore>>,
}

impl Default for StrategyPositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyPositionManager {
    pub fn new() -> Self {
        Self {
            strategy_positions: RwLock::new(HashMap::new()),
            contributions: RwLock::new(HashMap::new()),
            exchange_positions: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Attach the document store strategy positions, their contributions,
    /// and the exchange-position aggregate are durably upserted into.
    /// Consuming builder so `new()` and its existing call sites don't move.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn persist_strategy_position(&self, sp: &StrategyPosition) -> Result<(), EngineError> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let id = sp.strategy_position_id;
        let doc = to_json(sp)?;
        with_retry(PERSIST_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.upsert("strategy_positions", id, doc).await }
        })
        .await
    }

    pub async fn persist_contribution(&self, contribution: &PositionContribution) -> Result<(), EngineError> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let id = contribution.contribution_id;
        let doc = to_json(contribution)?;
        with_retry(PERSIST_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.upsert("position_contributions", id, doc).await }
        })
        .await
    }

    pub async fn persist_exchange_position(&self, key: &str) -> Result<(), EngineError> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let Some(agg) = self.exchange_position(key) else { return Ok(()) };
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        let doc = to_json(&agg)?;
        with_retry(PERSIST_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.upsert("exchange_positions", id, doc).await }
        })
        .await
    }

    pub fn get(&self, id: Uuid) -> Option<StrategyPosition> {
        self.strategy_positions.read().unwrap().get(&id).cloned()
    }

    pub fn exchange_position(&self, key: &str) -> Option<ExchangePosition> {
        self.exchange_positions.read().unwrap().get(key).cloned()
    }

    /// Create the StrategyPosition + ledger row for a fresh admitted order,
    /// and fold the fill into the ExchangePosition aggregate.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        strategy_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> (StrategyPosition, PositionContribution) {
        let strategy_position_id = Uuid::new_v4();
        let key = crate::types::Position::key(symbol, side);

        let sp = StrategyPosition {
            strategy_position_id,
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            entry_time: Utc::now(),
            take_profit,
            stop_loss,
            status: StrategyPositionStatus::Open,
            exit_price: None,
            exit_time: None,
            close_reason: None,
            realized_pnl: None,
        };

        let mut exchange_positions = self.exchange_positions.write().unwrap();
        let agg = exchange_positions.entry(key.clone()).or_insert_with(|| ExchangePosition {
            exchange_position_key: key.clone(),
            symbol: symbol.to_string(),
            side,
            current_quantity: Decimal::ZERO,
            weighted_avg_entry: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            contributors: Vec::new(),
            total_contributions: 0,
            status: ExchangePositionStatus::Open,
        });

        let qty_before = agg.current_quantity;
        let new_qty = qty_before + quantity;
        agg.weighted_avg_entry = if new_qty.is_zero() {
            entry_price
        } else {
            (agg.weighted_avg_entry * qty_before + entry_price * quantity) / new_qty
        };
        agg.current_quantity = new_qty;
        agg.contributors.push(strategy_id.to_string());
        agg.total_contributions += 1;
        agg.status = ExchangePositionStatus::Open;
        let sequence = agg.total_contributions;

        let contribution = PositionContribution {
            contribution_id: Uuid::new_v4(),
            strategy_position_id,
            exchange_position_key: key,
            quantity,
            entry_price,
            position_sequence: sequence,
            exchange_qty_before: qty_before,
            exchange_qty_after: new_qty,
            status: ContributionStatus::Open,
            close_exit_price: None,
            close_realized_pnl: None,
            close_reason: None,
        };

        self.strategy_positions
            .write()
            .unwrap()
            .insert(strategy_position_id, sp.clone());
        self.contributions
            .write()
            .unwrap()
            .insert(contribution.contribution_id, contribution.clone());

        (sp, contribution)
    }

    /// Close a strategy position (triggered by the OCO manager when one of
    /// its own SL/TP orders fills). PnL uses this strategy's own entry
    /// price, per the core invariant of this subsystem.
    pub fn close(
        &self,
        strategy_position_id: Uuid,
        exit_price: Decimal,
        reason: CloseReason,
    ) -> Option<(StrategyPosition, Decimal)> {
        let mut strategy_positions = self.strategy_positions.write().unwrap();
        let sp = strategy_positions.get_mut(&strategy_position_id)?;
        if sp.status == StrategyPositionStatus::Closed {
            return Some((sp.clone(), sp.realized_pnl.unwrap_or(Decimal::ZERO)));
        }
        let pnl = sp.pnl_at(exit_price);
        sp.status = StrategyPositionStatus::Closed;
        sp.exit_price = Some(exit_price);
        sp.exit_time = Some(Utc::now());
        sp.close_reason = Some(reason);
        sp.realized_pnl = Some(pnl);
        let key = sp.exchange_position_key();
        let qty = sp.quantity;
        let out = sp.clone();

        let mut contributions = self.contributions.write().unwrap();
        if let Some(contribution) = contributions
            .values_mut()
            .find(|c| c.strategy_position_id == strategy_position_id && c.status == ContributionStatus::Open)
        {
            contribution.status = ContributionStatus::Closed;
            contribution.close_exit_price = Some(exit_price);
            contribution.close_realized_pnl = Some(pnl);
            contribution.close_reason = Some(reason);
        }

        let mut exchange_positions = self.exchange_positions.write().unwrap();
        if let Some(agg) = exchange_positions.get_mut(&key) {
            agg.current_quantity -= qty;
            if agg.current_quantity <= Decimal::ZERO {
                agg.current_quantity = Decimal::ZERO;
                agg.status = ExchangePositionStatus::Closed;
            }
        }

        Some((out, pnl))
    }

    pub fn to_fill(ack_price: Decimal, ack_qty: Decimal, commission: Decimal) -> Fill {
        Fill {
            price: ack_price,
            qty: ack_qty,
            commission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_strategies_aggregate_weighted_average_entry() {
        let spm = StrategyPositionManager::new();
        spm.open("momentum", "BTCUSDT", PositionSide::Long, Decimal::new(50_000, 0), Decimal::new(1, 3), None, None);
        spm.open("meanrev", "BTCUSDT", PositionSide::Long, Decimal::new(52_000, 0), Decimal::new(1, 3), None, None);
        let agg = spm.exchange_position("BTCUSDT_LONG").unwrap();
        assert_eq!(agg.current_quantity, Decimal::new(2, 3));
        assert_eq!(agg.weighted_avg_entry, Decimal::new(51_000, 0));
        assert_eq!(agg.total_contributions, 2);
    }

    #[test]
    fn close_uses_own_entry_not_aggregate() {
        let spm = StrategyPositionManager::new();
        let (a, _) = spm.open("A", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), None, None);
        spm.open("B", "BTCUSDT", PositionSide::Long, Decimal::new(55_000, 0), Decimal::new(1, 3), None, None);
        let (_, pnl) = spm.close(a.strategy_position_id, Decimal::new(48_000, 0), CloseReason::TakeProfit).unwrap();
        assert_eq!(pnl, Decimal::new(3, 0));
        let agg = spm.exchange_position("BTCUSDT_LONG").unwrap();
        assert_eq!(agg.current_quantity, Decimal::new(1, 3));
    }

    #[test]
    fn closing_already_closed_position_is_idempotent() {
        let spm = StrategyPositionManager::new();
        let (a, _) = spm.open("A", "BTCUSDT", PositionSide::Long, Decimal::new(45_000, 0), Decimal::new(1, 3), None, None);
        let (_, first) = spm.close(a.strategy_position_id, Decimal::new(48_000, 0), CloseReason::TakeProfit).unwrap();
        let (_, second) = spm.close(a.strategy_position_id, Decimal::new(90_000, 0), CloseReason::StopLoss).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn persist_methods_upsert_into_the_document_store() {
        use crate::store::jsonl_store::JsonlDocumentStore;

        let mut dir = std::env::temp_dir();
        dir.push(format!("trade-engine-strategy-position-test-{}", Uuid::new_v4()));
        let store: Arc<dyn DocumentStore> = Arc::new(JsonlDocumentStore::open(&dir).unwrap());

        let spm = StrategyPositionManager::new().with_store(store);
        let (sp, contribution) =
            spm.open("momentum", "BTCUSDT", PositionSide::Long, Decimal::new(50_000, 0), Decimal::new(1, 3), None, None);
        spm.persist_strategy_position(&sp).await.unwrap();
        spm.persist_contribution(&contribution).await.unwrap();
        spm.persist_exchange_position(&sp.exchange_position_key()).await.unwrap();

        let strategy_positions = std::fs::read_to_string(dir.join("strategy_positions.jsonl")).unwrap();
        assert!(strategy_positions.contains("momentum"));
        let contributions = std::fs::read_to_string(dir.join("position_contributions.jsonl")).unwrap();
        assert!(contributions.contains(&contribution.contribution_id.to_string()));
        let exchange_positions = std::fs::read_to_string(dir.join("exchange_positions.jsonl")).unwrap();
        assert!(exchange_positions.contains("BTCUSDT_LONG"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
