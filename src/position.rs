//! Position Manager: physical positions keyed by `(symbol, side)`, VWAP
//! entry recomputation on every fill, and the pre-trade risk gates the
//! dispatcher consults before it ever calls the exchange. The VWAP-on-fill
//! math and the "risk rejection is local and non-fatal" shape come
//! straight from this codebase's own position tracker and risk manager,
//! generalized from a single binary-outcome market to arbitrary futures
//! symbols and sides.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::errors::EngineError;
use crate::store::{to_json, with_retry, DocumentStore};
use crate::types::{CloseReason, Position, PositionLifecycle, PositionSide, TradeOrder};

const PERSIST_RETRY_ATTEMPTS: u32 = 3;

pub struct PositionManager {
    positions: RwLock<HashMap<String, Position>>,
    daily_trade_count: RwLock<HashMap<chrono::NaiveDate, u32>>,
    portfolio_equity: RwLock<Decimal>,
    store: Option<Arc<dyn DocumentStore>>,
}

impl PositionManager {
    pub fn new(portfolio_equity: Decimal) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            daily_trade_count: RwLock::new(HashMap::new()),
            portfolio_equity: RwLock::new(portfolio_equity),
            store: None,
        }
    }

    /// Attach the document store positions are durably upserted into on
    /// every fill and close. Consuming builder so `new()` itself, and every
    /// existing call site, stays unchanged.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Upsert the current `(symbol, side)` snapshot. The document id is
    /// derived from the position key so repeated fills overwrite the same
    /// row instead of accumulating one per write.
    pub async fn persist(&self, symbol: &str, side: PositionSide) -> Result<(), EngineError> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let Some(position) = self.get(symbol, side) else { return Ok(()) };
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, Position::key(symbol, side).as_bytes());
        let doc = to_json(&position)?;
        with_retry(PERSIST_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.upsert("positions", id, doc).await }
        })
        .await
    }

    pub fn get(&self, symbol: &str, side: PositionSide) -> Option<Position> {
        self.positions.read().unwrap().get(&Position::key(symbol, side)).cloned()
    }

    pub fn get_all_for_symbol(&self, symbol: &str) -> Vec<Position> {
        self.positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn get_open(&self) -> Vec<Position> {
        self.positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.status == PositionLifecycle::Open)
            .cloned()
            .collect()
    }

    /// Apply a fill: create the position if absent, otherwise recompute the
    /// VWAP entry over the combined quantity.
    pub fn update_on_fill(&self, order: &TradeOrder, fill_price: Decimal, fill_qty: Decimal, commission: Decimal) {
        let side = order.position_side.unwrap_or(PositionSide::Long);
        let key = Position::key(&order.symbol, side);
        let mut positions = self.positions.write().unwrap();
        match positions.get_mut(&key) {
            Some(existing) if existing.status == PositionLifecycle::Open => {
                let total_qty = existing.quantity + fill_qty;
                existing.entry_price =
                    (existing.entry_price * existing.quantity + fill_price * fill_qty) / total_qty;
                existing.quantity = total_qty;
                existing.commission += commission;
            }
            _ => {
                positions.insert(
                    key,
                    Position {
                        symbol: order.symbol.clone(),
                        side,
                        entry_price: fill_price,
                        quantity: fill_qty,
                        entry_time: Utc::now(),
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                        commission,
                        status: PositionLifecycle::Open,
                        stop_loss_order_id: None,
                        take_profit_order_id: None,
                        exit_price: None,
                        exit_time: None,
                    },
                );
            }
        }
    }

    /// Close all or part of a position. Realized PnL for the closed slice
    /// is `(exit - entry) * qty` for LONG, negated for SHORT.
    pub fn close_partial(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        exit_price: Decimal,
        _reason: CloseReason,
    ) -> Option<Decimal> {
        let key = Position::key(symbol, side);
        let mut positions = self.positions.write().unwrap();
        let position = positions.get_mut(&key)?;
        let closed_qty = qty.min(position.quantity);
        let pnl = match side {
            PositionSide::Long => (exit_price - position.entry_price) * closed_qty,
            PositionSide::Short => (position.entry_price - exit_price) * closed_qty,
        };
        position.realized_pnl += pnl;
        position.quantity -= closed_qty;
        if position.quantity <= Decimal::ZERO {
            position.status = PositionLifecycle::Closed;
            position.exit_price = Some(exit_price);
            position.exit_time = Some(Utc::now());
        }
        Some(pnl)
    }

    fn realized_pnl_today(&self) -> Decimal {
        let today = Utc::now().date_naive();
        self.positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.exit_time.map(|t| t.date_naive()) == Some(today))
            .map(|p| p.realized_pnl)
            .sum()
    }

    fn trades_today(&self) -> u32 {
        let today = Utc::now().date_naive();
        *self.daily_trade_count.read().unwrap().get(&today).unwrap_or(&0)
    }

    pub fn record_trade(&self) {
        let today = Utc::now().date_naive();
        *self.daily_trade_count.write().unwrap().entry(today).or_insert(0) += 1;
    }

    fn total_exposure(&self) -> Decimal {
        self.positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.status == PositionLifecycle::Open)
            .map(|p| p.entry_price * p.quantity)
            .sum()
    }

    fn open_count(&self) -> u32 {
        self.positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.status == PositionLifecycle::Open)
            .count() as u32
    }

    /// Pre-trade risk gate. A rejection is local and non-fatal: no
    /// exchange call is made and the caller records the rejection with the
    /// specific limit name that fired.
    pub fn check_risk(&self, order: &TradeOrder, effective_price: Decimal, limits: &RiskConfig) -> Result<(), EngineError> {
        let notional = order.amount * effective_price;
        let equity = *self.portfolio_equity.read().unwrap();

        if notional < limits.min_position_size_usd {
            return Err(EngineError::RiskRejection {
                limit: "min_position_size_usd".into(),
                reason: format!("notional {notional} below minimum {}", limits.min_position_size_usd),
            });
        }
        if notional > limits.max_position_size_usd {
            return Err(EngineError::RiskRejection {
                limit: "max_position_size_usd".into(),
                reason: format!("notional {notional} exceeds maximum {}", limits.max_position_size_usd),
            });
        }
        if !equity.is_zero() && notional / equity * Decimal::ONE_HUNDRED > limits.max_position_size_pct {
            return Err(EngineError::RiskRejection {
                limit: "max_position_size_pct".into(),
                reason: "position size exceeds percent-of-portfolio limit".into(),
            });
        }
        if !equity.is_zero()
            && (self.total_exposure() + notional) / equity * Decimal::ONE_HUNDRED > limits.max_portfolio_exposure_pct
        {
            return Err(EngineError::RiskRejection {
                limit: "max_portfolio_exposure_pct".into(),
                reason: "aggregate exposure would exceed portfolio limit".into(),
            });
        }
        if !equity.is_zero() {
            let daily_loss_pct = (-self.realized_pnl_today()).max(Decimal::ZERO) / equity * Decimal::ONE_HUNDRED;
            if daily_loss_pct > limits.max_daily_loss_pct {
                return Err(EngineError::RiskRejection {
                    limit: "max_daily_loss_pct".into(),
                    reason: "daily realized loss limit already hit".into(),
                });
            }
        }
        if self.open_count() >= limits.max_concurrent_positions {
            return Err(EngineError::RiskRejection {
                limit: "max_concurrent_positions".into(),
                reason: "too many concurrent open positions".into(),
            });
        }
        if self.trades_today() >= limits.max_daily_trades {
            return Err(EngineError::RiskRejection {
                limit: "max_daily_trades".into(),
                reason: "daily trade count limit reached".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, OrderType, TimeInForce};
    use uuid::Uuid;

    fn order(amount: Decimal) -> TradeOrder {
        TradeOrder {
            order_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount,
            target_price: None,
            time_in_force: TimeInForce::GTC,
            position_id: Uuid::new_v4(),
            position_side: Some(PositionSide::Long),
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            strategy_id: "momentum".to_string(),
            strategy_metadata: Default::default(),
        }
    }

    #[test]
    fn vwap_recomputed_across_two_fills() {
        let pm = PositionManager::new(Decimal::new(100_000, 0));
        let o = order(Decimal::new(1, 3));
        pm.update_on_fill(&o, Decimal::new(50_000, 0), Decimal::new(1, 3), Decimal::ZERO);
        pm.update_on_fill(&o, Decimal::new(51_000, 0), Decimal::new(1, 3), Decimal::ZERO);
        let pos = pm.get("BTCUSDT", PositionSide::Long).unwrap();
        assert_eq!(pos.entry_price, Decimal::new(50_500, 0));
        assert_eq!(pos.quantity, Decimal::new(2, 3));
    }

    #[test]
    fn close_partial_realizes_pnl_and_reduces_qty() {
        let pm = PositionManager::new(Decimal::new(100_000, 0));
        let o = order(Decimal::new(1, 3));
        pm.update_on_fill(&o, Decimal::new(50_000, 0), Decimal::new(1, 3), Decimal::ZERO);
        let pnl = pm
            .close_partial("BTCUSDT", PositionSide::Long, Decimal::new(1, 3), Decimal::new(51_000, 0), CloseReason::TakeProfit)
            .unwrap();
        assert_eq!(pnl, Decimal::new(1, 0));
        let pos = pm.get("BTCUSDT", PositionSide::Long).unwrap();
        assert_eq!(pos.status, PositionLifecycle::Closed);
    }

    #[test]
    fn risk_rejects_below_min_notional() {
        let pm = PositionManager::new(Decimal::new(100_000, 0));
        let limits = RiskConfig::default();
        let o = order(Decimal::new(1, 6));
        let err = pm.check_risk(&o, Decimal::new(50_000, 0), &limits).unwrap_err();
        assert!(matches!(err, EngineError::RiskRejection { limit, .. } if limit == "min_position_size_usd"));
    }

    #[tokio::test]
    async fn persist_upserts_the_fill_into_the_document_store() {
        use crate::store::jsonl_store::JsonlDocumentStore;

        let mut dir = std::env::temp_dir();
        dir.push(format!("trade-engine-position-test-{}", Uuid::new_v4()));
        let store: Arc<dyn DocumentStore> = Arc::new(JsonlDocumentStore::open(&dir).unwrap());

        let pm = PositionManager::new(Decimal::new(100_000, 0)).with_store(store);
        let o = order(Decimal::new(1, 3));
        pm.update_on_fill(&o, Decimal::new(50_000, 0), Decimal::new(1, 3), Decimal::ZERO);
        pm.persist("BTCUSDT", PositionSide::Long).await.unwrap();

        let contents = std::fs::read_to_string(dir.join("positions.jsonl")).unwrap();
        assert!(contents.contains("BTCUSDT"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn persist_without_a_store_is_a_no_op() {
        let pm = PositionManager::new(Decimal::new(100_000, 0));
        let o = order(Decimal::new(1, 3));
        pm.update_on_fill(&o, Decimal::new(50_000, 0), Decimal::new(1, 3), Decimal::ZERO);
        pm.persist("BTCUSDT", PositionSide::Long).await.unwrap();
    }
}
