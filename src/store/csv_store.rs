//! CSV tabular store for analytics views (`strategy_performance`,
//! `contribution_summary`, ...). Grounded directly in this codebase's
//! buffered `CsvWriter` pattern used by the telemetry writer task, adapted
//! to a generic flattened-row append rather than a fixed hand-rolled
//! header.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::EngineError;

use super::TabularStore;

struct TableHandle {
    writer: csv::Writer<std::fs::File>,
    header_written: bool,
}

pub struct CsvTabularStore {
    dir: PathBuf,
    tables: Mutex<HashMap<String, TableHandle>>,
}

impl CsvTabularStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            tables: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TabularStore for CsvTabularStore {
    async fn append_row(&self, table: &str, row: serde_json::Value) -> Result<(), EngineError> {
        let obj = row
            .as_object()
            .ok_or_else(|| EngineError::Persistence("tabular row must be a JSON object".into()))?;

        let mut tables = self.tables.lock().unwrap();
        if !tables.contains_key(table) {
            let path = self.dir.join(format!("{table}.csv"));
            let exists = path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| EngineError::Persistence(format!("open {table} failed: {e}")))?;
            let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
            tables.insert(
                table.to_string(),
                TableHandle {
                    writer,
                    header_written: exists,
                },
            );
        }

        let handle = tables.get_mut(table).expect("just inserted");
        let mut keys: Vec<&String> = obj.keys().collect();
        keys.sort();

        if !handle.header_written {
            handle
                .writer
                .write_record(keys.iter().map(|k| k.as_str()))
                .map_err(|e| EngineError::Persistence(format!("header write failed: {e}")))?;
            handle.header_written = true;
        }

        let values: Vec<String> = keys.iter().map(|k| obj[*k].to_string()).collect();
        handle
            .writer
            .write_record(&values)
            .map_err(|e| EngineError::Persistence(format!("row write failed: {e}")))?;
        handle
            .writer
            .flush()
            .map_err(|e| EngineError::Persistence(format!("flush failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn append_row_writes_header_once() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("trade-engine-csv-test-{}", Uuid::new_v4()));
        let store = CsvTabularStore::open(&dir).unwrap();
        store
            .append_row("strategy_performance", serde_json::json!({"strategy_id": "momentum", "pnl": 3.0}))
            .await
            .unwrap();
        store
            .append_row("strategy_performance", serde_json::json!({"strategy_id": "meanrev", "pnl": -1.2}))
            .await
            .unwrap();
        let contents = std::fs::read_to_string(dir.join("strategy_performance.csv")).unwrap();
        assert_eq!(contents.lines().count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
