#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Storage backends for downloaded documents.
//!
//! The download orchestrator only knows the [`StorageBackend`] trait. Two
//! implementations are provided:
//!
//! * [`FileStore`]: gzip-compressed JSON files plus JSON-lines audit logs in
//!   a directory, one directory per site.
//! * [`PostgresStore`]: one JSONB row per entity, upserted by id, through
//!   `switchy_database`.

pub mod file;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use vn_sync_api_models::ControllerKind;

pub use file::FileStore;
pub use postgres::PostgresStore;

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document or log file could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// One audit record, appended after every remote call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Site short name.
    pub site: String,
    /// Controller name.
    pub controller: String,
    /// Transient error counter of the client after the call.
    pub error_count: u32,
    /// Last HTTP status received.
    pub http_status: u16,
    /// Free-form description of the call.
    pub comment: String,
    /// Items stored from the call.
    pub length: u64,
    /// Call duration, in seconds.
    pub duration: f64,
}

/// Persistence contract of the download orchestrator.
///
/// A backend instance is bound to one site for [`store`](Self::store) and
/// [`delete_obs`](Self::delete_obs); the other operations take the site
/// explicitly.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persists `document`, the merged result of one logical call, and
    /// returns the number of items it holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the document cannot be written.
    async fn store(
        &self,
        controller: &str,
        sequence: &str,
        document: &Value,
    ) -> Result<u64, StoreError>;

    /// Appends an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record cannot be written.
    async fn log(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Upserts the incremental watermark of `(site, taxo_group)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the watermark cannot be written.
    async fn increment_log(
        &self,
        site: &str,
        taxo_group: &str,
        last_ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reads the incremental watermark of `(site, taxo_group)`, `None` if it
    /// was never written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the watermark cannot be read.
    async fn increment_get(
        &self,
        site: &str,
        taxo_group: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Deletes the observations `ids` and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the deletion fails.
    async fn delete_obs(&self, ids: &[String]) -> Result<u64, StoreError>;
}

/// Number of logical items in a merged document.
///
/// Observations count `data.sightings` plus the sightings nested in
/// `data.forms`. Other controllers count the `data` array, or `1` when
/// `data` is a single object.
#[must_use]
pub fn count_items(controller: &str, document: &Value) -> u64 {
    let Some(data) = document.get("data") else {
        return 0;
    };

    if controller == ControllerKind::Observations.as_ref() {
        let sightings = array_len(data.get("sightings"));
        let in_forms: u64 = data
            .get("forms")
            .and_then(Value::as_array)
            .map_or(0, |forms| {
                forms.iter().map(|f| array_len(f.get("sightings"))).sum()
            });
        return sightings + in_forms;
    }

    match data {
        Value::Array(items) => items.len() as u64,
        Value::Object(_) => 1,
        _ => 0,
    }
}

fn array_len(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_array).map_or(0, |a| a.len() as u64)
}
