//! JSON-lines document store: one file per collection, append-only upsert
//! (the latest row for a given id wins on reload). Grounded in the same
//! plain `serde_json` load/save-to-file pattern this codebase already uses
//! for small local state snapshots, extended to a collection-keyed upsert
//! log instead of a single whole-state file.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::EngineError;

use super::DocumentStore;

pub struct JsonlDocumentStore {
    dir: PathBuf,
    files: Mutex<HashMap<String, std::fs::File>>,
}

impl JsonlDocumentStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn file_for(&self, collection: &str) -> std::io::Result<()> {
        let mut files = self.files.lock().unwrap();
        if !files.contains_key(collection) {
            let path = self.dir.join(format!("{collection}.jsonl"));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            files.insert(collection.to_string(), file);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonlDocumentStore {
    async fn upsert(&self, collection: &str, id: Uuid, doc: serde_json::Value) -> Result<(), EngineError> {
        self.file_for(collection)
            .map_err(|e| EngineError::Persistence(format!("open {collection} failed: {e}")))?;
        let record = serde_json::json!({ "id": id, "doc": doc });
        let line = serde_json::to_string(&record)
            .map_err(|e| EngineError::Persistence(format!("serialize failed: {e}")))?;
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(collection).expect("file_for just inserted it");
        writeln!(file, "{line}").map_err(|e| EngineError::Persistence(format!("write failed: {e}")))?;
        file.flush().ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_appends_a_line_per_collection() {
        let dir = tempdir();
        let store = JsonlDocumentStore::open(&dir).unwrap();
        let id = Uuid::new_v4();
        store
            .upsert("positions", id, serde_json::json!({"symbol": "BTCUSDT"}))
            .await
            .unwrap();
        let contents = std::fs::read_to_string(dir.join("positions.jsonl")).unwrap();
        assert!(contents.contains("BTCUSDT"));
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("trade-engine-test-{}", Uuid::new_v4()));
        p
    }
}
