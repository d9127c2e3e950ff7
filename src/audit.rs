//! Audit Sink: durable record of every signal, order, position transition,
//! and error, written before any external side effect takes place. The
//! fail-safe invariant this crate enforces at the call sites is "no audit,
//! no real trade" — if `record` fails, the dispatcher forces simulation
//! rather than silently dropping the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::errors::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub symbol: Option<String>,
    pub strategy_id: Option<String>,
    pub order_id: Option<String>,
    pub reason: String,
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, row: AuditRow) -> Result<(), EngineError>;

    /// Cheap liveness probe used at signal receipt to decide whether real
    /// execution is even permitted this cycle.
    async fn is_available(&self) -> bool;
}

/// Append-only JSON-lines sink, one file per process. Mirrors the plain
/// buffered-file-writer idiom used by this codebase's other background
/// writer tasks, generalized from CSV rows to a single structured JSON
/// line per audit event.
pub struct JsonlAuditSink {
    file: Mutex<std::fs::File>,
    forced_unavailable: std::sync::atomic::AtomicBool,
}

impl JsonlAuditSink {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            forced_unavailable: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Test/operational hook: simulate the audit sink going offline so the
    /// dispatcher's fail-safe path can be exercised.
    pub fn set_forced_unavailable(&self, unavailable: bool) {
        self.forced_unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, row: AuditRow) -> Result<(), EngineError> {
        if self.forced_unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::Persistence("audit_unavailable".into()));
        }
        let line = serde_json::to_string(&row)
            .map_err(|e| EngineError::Persistence(format!("audit serialize failed: {e}")))?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}").map_err(|e| EngineError::Persistence(format!("audit write failed: {e}")))?;
        file.flush().ok();
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.forced_unavailable.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// In-memory sink for tests: records rows in a `Vec` instead of touching
/// disk, with the same forced-unavailable knob.
#[derive(Default)]
pub struct MemoryAuditSink {
    rows: Mutex<Vec<AuditRow>>,
    forced_unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_forced_unavailable(&self, unavailable: bool) {
        self.forced_unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<AuditRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, row: AuditRow) -> Result<(), EngineError> {
        if self.forced_unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::Persistence("audit_unavailable".into()));
        }
        self.rows.lock().unwrap().push(row);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.forced_unavailable.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &str) -> AuditRow {
        AuditRow {
            ts: Utc::now(),
            kind: kind.to_string(),
            symbol: Some("BTCUSDT".to_string()),
            strategy_id: Some("momentum".to_string()),
            order_id: None,
            reason: "test".to_string(),
            detail: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn forced_unavailable_blocks_writes() {
        let sink = MemoryAuditSink::new();
        sink.set_forced_unavailable(true);
        assert!(!sink.is_available().await);
        assert!(sink.record(row("submitted")).await.is_err());
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn records_accumulate_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(row("submitted")).await.unwrap();
        sink.record(row("executed")).await.unwrap();
        let rows = sink.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "submitted");
        assert_eq!(rows[1].kind, "executed");
    }
}
