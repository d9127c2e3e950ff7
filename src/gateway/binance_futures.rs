//! Reference `ExchangeGateway` modeled on a binance-futures-family REST
//! contract (see the external interface notes on hedge mode parameter
//! rules). The actual HTTP client and websocket market-data plumbing are
//! external collaborators this crate does not own; this implementation
//! performs the full pre-placement validation and rounding the contract
//! requires, then synthesizes a fill locally rather than issuing a network
//! call — the same `dry_run` vs `live` split used elsewhere in this
//! codebase, generalized to the abstract gateway trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::types::{OrderAck, OrderStatus, OrderType, SymbolFilters, TradeOrder};

use super::{round_up_to_step, snap_to_tick, ExchangeGateway};

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub commission_rate: Decimal,
    pub live: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(4, 4), // 0.04%
            live: false,
        }
    }
}

pub struct BinanceFuturesGateway {
    config: GatewayConfig,
    filters: HashMap<String, SymbolFilters>,
    mark_prices: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<Uuid, OrderAck>>,
}

impl BinanceFuturesGateway {
    pub fn new(config: GatewayConfig, filters: HashMap<String, SymbolFilters>) -> Self {
        Self {
            config,
            filters,
            mark_prices: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Test/dry-run hook: seed the mark price a market order or notional
    /// check will see for a symbol.
    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.mark_prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    /// Test/dry-run hook: simulate the exchange filling a resting order
    /// (e.g. a stop or take-profit leg whose trigger price was crossed).
    /// Without a live price feed this crate has no other way to move a
    /// resting order to `FILLED`.
    pub fn force_fill(&self, order_id: Uuid, fill_price: Decimal, fill_qty: Decimal, commission: Decimal) {
        if let Some(ack) = self.orders.lock().unwrap().get_mut(&order_id) {
            synthesize_fill(ack, fill_price, fill_qty, commission);
        }
    }

    fn validate_hedge_mode(order: &TradeOrder) -> Result<(), GatewayError> {
        if order.position_side.is_some() && order.reduce_only {
            return Err(GatewayError::ReduceOnlyNotRequiredInHedgeMode);
        }
        Ok(())
    }

    fn validate_and_round(&self, order: &TradeOrder) -> Result<(Decimal, Option<Decimal>), GatewayError> {
        let filters = self
            .filters
            .get(&order.symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(order.symbol.clone()))?;

        if order.order_type.requires_target_price() && order.target_price.is_none() {
            return Err(GatewayError::InvalidPrice);
        }

        let snapped_price = order.target_price.map(|p| snap_to_tick(p, filters.tick_size));
        let effective_price = snapped_price
            .or_else(|| self.mark_prices.lock().unwrap().get(&order.symbol).copied())
            .ok_or(GatewayError::InvalidPrice)?;

        if order.amount <= Decimal::ZERO {
            return Err(GatewayError::InvalidQuantity);
        }

        let rounded_amount = if order.reduce_only {
            order.amount
        } else {
            round_up_to_step(order.amount, filters.step_size, effective_price, filters.min_notional)
        };

        if rounded_amount < filters.min_qty {
            return Err(GatewayError::InvalidQuantity);
        }
        if !order.reduce_only && rounded_amount * effective_price < filters.min_notional {
            return Err(GatewayError::NotionalBelowMinimum);
        }

        Ok((rounded_amount, snapped_price))
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesGateway {
    async fn place_order(&self, order: &TradeOrder) -> Result<OrderAck, GatewayError> {
        Self::validate_hedge_mode(order)?;
        let (amount, snapped_price) = self.validate_and_round(order)?;

        if self.config.live {
            // Real HTTP placement lives outside this crate's scope; without
            // it wired in, refuse rather than pretend to have placed a
            // live order.
            return Err(GatewayError::TransientServer(
                "live trading requires an externally-wired HTTP client".into(),
            ));
        }

        let fill_price = match order.order_type {
            OrderType::Market => self
                .mark_prices
                .lock()
                .unwrap()
                .get(&order.symbol)
                .copied()
                .ok_or(GatewayError::InvalidPrice)?,
            _ => snapped_price.unwrap_or(amount),
        };

        let status = match order.order_type {
            OrderType::Market => OrderStatus::Filled,
            _ => OrderStatus::New,
        };

        let commission = if status.is_terminal_success() {
            amount * fill_price * self.config.commission_rate
        } else {
            Decimal::ZERO
        };

        let ack = OrderAck {
            order_id: order.order_id,
            status,
            fill_price: status.is_terminal_success().then_some(fill_price),
            fill_qty: status.is_terminal_success().then_some(amount),
            commission,
        };

        self.orders.lock().unwrap().insert(order.order_id, ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: Uuid) -> Result<(), GatewayError> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(&order_id) {
            Some(ack) if ack.status.is_terminal_success() || ack.status.is_terminal_failure() => {
                Err(GatewayError::NotFound)
            }
            Some(ack) => {
                ack.status = OrderStatus::Canceled;
                Ok(())
            }
            None => Err(GatewayError::NotFound),
        }
    }

    async fn get_order(&self, _symbol: &str, order_id: Uuid) -> Result<OrderAck, GatewayError> {
        self.orders
            .lock()
            .unwrap()
            .get(&order_id)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, GatewayError> {
        self.filters
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.mark_prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }
}

/// Mark an order as filled, as if the monitoring loop or a simulated trade
/// observed the opposing side. Used by tests and by the OCO monitor's
/// dry-run fill synthesis path.
pub fn synthesize_fill(ack: &mut OrderAck, fill_price: Decimal, fill_qty: Decimal, commission: Decimal) {
    ack.status = OrderStatus::Filled;
    ack.fill_price = Some(fill_price);
    ack.fill_qty = Some(fill_qty);
    ack.commission = commission;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, PositionSide, TimeInForce};
    use std::collections::HashMap as Map;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            step_size: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::new(20, 0),
            price_precision: 2,
            qty_precision: 3,
        }
    }

    fn gateway() -> BinanceFuturesGateway {
        let mut f = Map::new();
        f.insert("ETHUSDT".to_string(), filters());
        let gw = BinanceFuturesGateway::new(GatewayConfig::default(), f);
        gw.set_mark_price("ETHUSDT", Decimal::new(391896, 2));
        gw
    }

    fn base_order() -> TradeOrder {
        TradeOrder {
            order_id: Uuid::new_v4(),
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount: Decimal::new(5, 3),
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

    #[tokio::test]
    async fn rounds_notional_up_not_down() {
        let gw = gateway();
        let ack = gw.place_order(&base_order()).await.unwrap();
        assert_eq!(ack.fill_qty.unwrap(), Decimal::new(6, 3));
    }

    #[tokio::test]
    async fn rejects_reduce_only_with_position_side() {
        let gw = gateway();
        let mut order = base_order();
        order.reduce_only = true;
        let err = gw.place_order(&order).await.unwrap_err();
        assert_eq!(err, GatewayError::ReduceOnlyNotRequiredInHedgeMode);
    }

    #[tokio::test]
    async fn duplicate_cancel_is_not_found() {
        let gw = gateway();
        let order = base_order();
        gw.place_order(&order).await.unwrap();
        let err = gw.cancel_order(&order.symbol, order.order_id).await.unwrap_err();
        assert_eq!(err, GatewayError::NotFound);
    }
}
