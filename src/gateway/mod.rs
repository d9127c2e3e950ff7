//! Exchange Gateway: the abstract capability set the dispatcher and OCO
//! manager place orders through. `binance_futures` is the one concrete,
//! dry-run-capable implementation this crate ships.

pub mod binance_futures;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::types::{OrderAck, SymbolFilters, TradeOrder};

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, order: &TradeOrder) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: Uuid) -> Result<(), GatewayError>;

    async fn get_order(&self, symbol: &str, order_id: Uuid) -> Result<OrderAck, GatewayError>;

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, GatewayError>;

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;
}

/// Round `qty` UP to the nearest multiple of `step`, then re-verify the
/// resulting notional is at least `min_notional`, adding one more step if
/// not. Rounding down below the minimum is the hard failure mode this
/// function exists to prevent — never change the rounding direction here.
pub fn round_up_to_step(qty: Decimal, step: Decimal, price: Decimal, min_notional: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    let steps = (qty / step).ceil();
    let mut rounded = steps * step;
    if !price.is_zero() && rounded * price < min_notional {
        rounded += step;
    }
    rounded
}

/// Snap `price` to the nearest `tick` below or at the input, per standard
/// exchange price-filter semantics (floor, never round to avoid crossing a
/// limit the caller didn't intend).
pub fn snap_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).floor() * tick
}
