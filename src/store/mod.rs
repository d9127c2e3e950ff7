//! Persistence contracts: a primary document store (upsert-by-UUID,
//! write-through, queued-with-backoff on failure) and a secondary tabular
//! store for analytics, whose failures never block trading. The real k/v
//! and relational backends are external collaborators; this crate ships
//! file-backed reference adapters behind the same traits.

pub mod csv_store;
pub mod jsonl_store;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::EngineError;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert(&self, collection: &str, id: Uuid, doc: serde_json::Value) -> Result<(), EngineError>;
}

#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn append_row(&self, table: &str, row: serde_json::Value) -> Result<(), EngineError>;
}

/// Write-through helper shared by both stores: serialize once, retry with
/// exponential backoff (1s, 2s, 4s by default, capped attempts), never
/// block the caller beyond that budget.
pub async fn with_retry<F, Fut>(max_attempts: u32, mut op: F) -> Result<(), EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), EngineError>>,
{
    let mut delay = std::time::Duration::from_secs(1);
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::Persistence("retry loop exited without attempts".into())))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Persistence(format!("serialize failed: {e}")))
}
