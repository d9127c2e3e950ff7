use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};

use trade_engine_core::aggregator::SignalAggregator;
use trade_engine_core::audit::JsonlAuditSink;
use trade_engine_core::config::ConfigResolver;
use trade_engine_core::dispatcher::Dispatcher;
use trade_engine_core::gateway::binance_futures::{BinanceFuturesGateway, GatewayConfig};
use trade_engine_core::lock::InMemoryLock;
use trade_engine_core::metrics::Metrics;
use trade_engine_core::oco::OcoManager;
use trade_engine_core::position::PositionManager;
use trade_engine_core::store::csv_store::CsvTabularStore;
use trade_engine_core::store::jsonl_store::JsonlDocumentStore;
use trade_engine_core::store::{DocumentStore, TabularStore};
use trade_engine_core::strategy_position::StrategyPositionManager;
use trade_engine_core::types::{Signal, SignalDecision, SymbolFilters};

/// Bounded so a burst of signals can't grow memory without limit; once full
/// the reader drops the newest signal and counts it rather than blocking
/// stdin (which would just move the backpressure upstream).
const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// Signals arrive with `timestamp` in varying shapes (RFC3339 string, epoch
/// seconds, missing, or malformed) — normalize it to an RFC3339 string
/// before the strict `Signal` deserialize, falling back to now rather than
/// dropping an otherwise-valid signal over one bad field.
fn normalize_timestamp(value: &mut serde_json::Value) {
    let Some(obj) = value.as_object_mut() else { return };
    let needs_fallback = match obj.get("timestamp") {
        Some(serde_json::Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s).is_err(),
        Some(serde_json::Value::Number(n)) => match n.as_i64().and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)) {
            Some(dt) => {
                obj.insert("timestamp".to_string(), serde_json::Value::String(dt.to_rfc3339()));
                false
            }
            None => true,
        },
        _ => true,
    };
    if needs_fallback {
        tracing::warn!("signal timestamp missing or unparseable, falling back to now");
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
}

fn parse_signal(line: &str) -> Option<Signal> {
    let mut value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse signal json, skipping");
            return None;
        }
    };
    normalize_timestamp(&mut value);
    match serde_json::from_value(value) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!(error = %e, "failed to deserialize signal, skipping");
            None
        }
    }
}

/// Seed symbol filters for the handful of contracts this binary accepts
/// signals for. A production deployment would fetch these from the
/// exchange's `exchangeInfo` endpoint at startup instead of hardcoding them.
fn default_symbol_filters() -> HashMap<String, SymbolFilters> {
    let mut filters = HashMap::new();
    filters.insert(
        "BTCUSDT".to_string(),
        SymbolFilters {
            step_size: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 1),
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::new(100, 0),
            price_precision: 1,
            qty_precision: 3,
        },
    );
    filters.insert(
        "ETHUSDT".to_string(),
        SymbolFilters {
            step_size: Decimal::new(1, 2),
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::new(1, 2),
            min_notional: Decimal::new(20, 0),
            price_precision: 2,
            qty_precision: 2,
        },
    );
    filters
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("trading brain starting up");

    let config = Arc::new(ConfigResolver::from_env());
    let metrics = Arc::new(Metrics::default());

    let document_store_dir = std::env::var("DOCUMENT_STORE_DIR").unwrap_or_else(|_| "data/documents".to_string());
    let document_store: Arc<dyn DocumentStore> = Arc::new(
        JsonlDocumentStore::open(&document_store_dir)
            .unwrap_or_else(|e| panic!("failed to open document store at {document_store_dir}: {e}")),
    );
    let analytics_dir = std::env::var("ANALYTICS_STORE_DIR").unwrap_or_else(|_| "data/analytics".to_string());
    let tabular_store = Arc::new(
        CsvTabularStore::open(&analytics_dir).unwrap_or_else(|e| panic!("failed to open analytics store at {analytics_dir}: {e}")),
    );

    let portfolio_equity = std::env::var("PORTFOLIO_EQUITY_USD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::new(100_000, 0));
    let positions = Arc::new(PositionManager::new(portfolio_equity).with_store(document_store.clone()));
    let strategy_positions = Arc::new(StrategyPositionManager::new().with_store(document_store.clone()));

    let gateway_config = GatewayConfig {
        live: std::env::var("LIVE_TRADING").map(|v| v == "1").unwrap_or(false),
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(BinanceFuturesGateway::new(gateway_config, default_symbol_filters()));
    for (symbol, price) in [("BTCUSDT", Decimal::new(60_000, 0)), ("ETHUSDT", Decimal::new(3_000, 0))] {
        gateway.set_mark_price(symbol, price);
    }

    let audit_path = std::env::var("AUDIT_LOG_PATH").unwrap_or_else(|_| "audit.jsonl".to_string());
    let audit = Arc::new(
        JsonlAuditSink::open(&audit_path).unwrap_or_else(|e| panic!("failed to open audit log at {audit_path}: {e}")),
    );

    let lock = Arc::new(InMemoryLock::new());
    let aggregator = Arc::new(SignalAggregator::new());
    let oco = Arc::new(
        OcoManager::new(gateway.clone(), strategy_positions.clone(), audit.clone(), metrics.clone())
            .with_store(document_store.clone()),
    );

    let monitor_handle = {
        let oco = oco.clone();
        tokio::spawn(async move { oco.run_monitor(std::time::Duration::from_secs(2)).await })
    };

    let dispatcher = Dispatcher::new(
        aggregator, config, gateway, positions, strategy_positions, oco.clone(), audit, lock, metrics.clone(),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Signal>(SIGNAL_CHANNEL_CAPACITY);
    let reader_metrics = metrics.clone();
    let reader_handle = tokio::spawn(async move {
        tracing::info!("reading newline-delimited signal JSON from stdin");
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Some(signal) = parse_signal(&line) else { continue };
            match tx.try_send(signal) {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::TrySendError::Full(signal)) => {
                    reader_metrics.dropped_overload(&signal.symbol);
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });

    while let Some(signal) = rx.recv().await {
        let response = dispatcher.dispatch(signal).await;
        tracing::info!(?response, "signal processed");

        if response.status == SignalDecision::Executed {
            if let Some(fill) = response.fills.first() {
                let row = serde_json::json!({
                    "order_id": response.order_id,
                    "position_id": response.position_id,
                    "strategy_position_id": response.strategy_position_id,
                    "price": fill.price,
                    "qty": fill.qty,
                    "commission": fill.commission,
                });
                if let Err(e) = tabular_store.append_row("executed_trades", row).await {
                    tracing::warn!(error = %e, "failed to append trade to analytics store");
                }
            }
        }
    }

    let _ = reader_handle.await;
    oco.stop();
    let _ = monitor_handle.await;
    tracing::info!("trading brain shutting down");
}
