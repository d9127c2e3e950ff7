//! Observability emission points named in the external interface contract.
//! The actual exporter (Prometheus, StatsD, whatever) is an external
//! collaborator; this module owns only the in-process counters and emits a
//! `tracing` event per observation so any subscriber can fan them out.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub orders_executed: AtomicU64,
    pub order_failures: AtomicU64,
    pub risk_rejections: AtomicU64,
    pub positions_opened: AtomicU64,
    pub positions_closed: AtomicU64,
    pub strategy_tp_triggered: AtomicU64,
    pub strategy_sl_triggered: AtomicU64,
    pub signal_conflicts_resolved: AtomicU64,
    pub dropped_overload: AtomicU64,
}

impl Metrics {
    pub fn order_executed(&self, symbol: &str, order_type: &str, latency_ms: u64) {
        self.orders_executed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "metrics",
            symbol,
            order_type,
            latency_ms,
            "orders_executed_by_type"
        );
    }

    pub fn order_failed(&self, reason: &str) {
        self.order_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(target: "metrics", reason, "order_failures");
    }

    pub fn risk_rejected(&self, limit: &str) {
        self.risk_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", limit, "risk_rejections");
    }

    pub fn position_opened(&self, side: &str) {
        self.positions_opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", side, "positions_opened");
    }

    pub fn position_closed(&self, side: &str) {
        self.positions_closed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", side, "positions_closed");
    }

    pub fn position_pnl_realized(&self, strategy_id: &str, close_reason: &str, pnl: rust_decimal::Decimal) {
        tracing::info!(
            target: "metrics",
            strategy_id,
            close_reason,
            pnl = %pnl,
            "position_pnl_realized"
        );
    }

    pub fn strategy_tp_triggered(&self, strategy_id: &str) {
        self.strategy_tp_triggered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", strategy_id, "strategy_tp_triggered");
    }

    pub fn strategy_sl_triggered(&self, strategy_id: &str) {
        self.strategy_sl_triggered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", strategy_id, "strategy_sl_triggered");
    }

    pub fn signal_conflict_resolved(&self, resolution: &str) {
        self.signal_conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "metrics", resolution, "signal_conflict_resolved");
    }

    pub fn dropped_overload(&self, symbol: &str) {
        self.dropped_overload.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(target: "metrics", symbol, "dropped_overload");
    }

    pub fn active_oco_pairs_per_position(&self, key: &str, count: usize) {
        tracing::debug!(target: "metrics", key, count, "active_oco_pairs_per_position");
    }
}
