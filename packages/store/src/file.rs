//! Directory-backed storage.
//!
//! Layout of a store directory:
//!
//! ```text
//! {controller}_{sequence}.json.gz   one merged document per logical call
//! download_log.jsonl                audit records
//! increment_log.json                watermarks: site -> taxo group -> RFC 3339
//! deleted_observations.jsonl        ids deleted on the server by incremental updates
//! ```

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use crate::{AuditRecord, StorageBackend, StoreError, count_items};

const DOWNLOAD_LOG: &str = "download_log.jsonl";
const INCREMENT_LOG: &str = "increment_log.json";
const DELETED_LOG: &str = "deleted_observations.jsonl";

type Watermarks = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

/// Stores documents as gzip-compressed JSON files under one directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Creates a store writing under `dir`. The directory is created on
    /// first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Root directory of this store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document stored for `(controller, sequence)`.
    #[must_use]
    pub fn document_path(&self, controller: &str, sequence: &str) -> PathBuf {
        self.dir.join(format!("{controller}_{sequence}.json.gz"))
    }

    async fn append_line(&self, file: &str, line: &Value) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut text = serde_json::to_string(line)?;
        text.push('\n');

        let _guard = self.lock.lock().await;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(text.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn read_watermarks(&self) -> Result<Watermarks, StoreError> {
        match tokio::fs::read(self.dir.join(INCREMENT_LOG)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Watermarks::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn store(
        &self,
        controller: &str,
        sequence: &str,
        document: &Value,
    ) -> Result<u64, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let compressed = gzip(&serde_json::to_vec(document)?)?;
        let path = self.document_path(controller, sequence);
        tokio::fs::write(&path, compressed).await?;

        let items = count_items(controller, document);
        log::debug!("Stored {items} item(s) in {}", path.display());
        Ok(items)
    }

    async fn log(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut line {
            map.insert("download_ts".to_string(), json!(Utc::now()));
        }
        self.append_line(DOWNLOAD_LOG, &line).await
    }

    async fn increment_log(
        &self,
        site: &str,
        taxo_group: &str,
        last_ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let _guard = self.lock.lock().await;

        let mut watermarks = self.read_watermarks().await?;
        watermarks
            .entry(site.to_string())
            .or_default()
            .insert(taxo_group.to_string(), last_ts);

        let text = serde_json::to_vec_pretty(&watermarks)?;
        tokio::fs::write(self.dir.join(INCREMENT_LOG), text).await?;
        Ok(())
    }

    async fn increment_get(
        &self,
        site: &str,
        taxo_group: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _guard = self.lock.lock().await;
        let watermarks = self.read_watermarks().await?;
        Ok(watermarks
            .get(site)
            .and_then(|groups| groups.get(taxo_group))
            .copied())
    }

    async fn delete_obs(&self, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let line = json!({
            "deleted_at": Utc::now(),
            "ids": ids,
        });
        self.append_line(DELETED_LOG, &line).await?;

        let mut removed = 0;
        for id in ids {
            let path = self.document_path("observations", id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("No stored sighting {id} to delete");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
