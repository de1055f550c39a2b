//! Postgres storage through `switchy_database`.
//!
//! Every controller gets a `<controller>_json` table holding one JSONB row
//! per entity, keyed by `(id, site)`. Observation forms (grouped sightings)
//! are split: their sightings go to `observations_json` like any other
//! sighting, the form header without its sightings goes to `forms_json`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use moosicbox_json_utils::database::ToValue as _;
use serde_json::Value;
use switchy_database::{Database, DatabaseValue};
use switchy_database_connection::Credentials;
use vn_sync_api_models::ControllerKind;

use crate::{AuditRecord, StorageBackend, StoreError, count_items};

const FORMS_TABLE: &str = "forms_json";

/// One row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Table name.
    pub table: String,
    /// Entity id.
    pub id: String,
    /// Entity JSON.
    pub item: Value,
}

/// Stores entities as JSONB rows in Postgres.
pub struct PostgresStore {
    db: Box<dyn Database>,
    site: String,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Wraps an open connection; rows are written for `site`.
    #[must_use]
    pub fn new(db: Box<dyn Database>, site: impl Into<String>) -> Self {
        Self {
            db,
            site: site.into(),
        }
    }

    /// Connects to `url` and sets a statement timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or the connection fails.
    pub async fn connect(
        url: &str,
        site: impl Into<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        // Credentials::from_url does not understand query parameters such as
        // `?sslmode=require`; TLS is negotiated by the connector.
        let url_base = url.split('?').next().unwrap_or(url);

        let creds = Credentials::from_url(url_base)?;
        let db = switchy_database_connection::init_postgres_raw_native_tls(creds).await?;
        db.exec_raw("SET statement_timeout = '120s'").await?;

        Ok(Self::new(db, site))
    }

    /// Creates every table this store writes to, if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in schema_statements() {
            self.db.exec_raw(&statement).await?;
        }
        log::info!("Database schema is up to date");
        Ok(())
    }

    async fn upsert(&self, row: &Row) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, site, item, update_ts)
             VALUES ($1, $2, $3::jsonb, NOW())
             ON CONFLICT (id, site) DO UPDATE SET
                 item = EXCLUDED.item,
                 update_ts = EXCLUDED.update_ts",
            row.table
        );
        self.db
            .exec_raw_params(
                &sql,
                &[
                    DatabaseValue::String(row.id.clone()),
                    DatabaseValue::String(self.site.clone()),
                    DatabaseValue::String(serde_json::to_string(&row.item)?),
                ],
            )
            .await?;
        Ok(())
    }
}

/// DDL creating every table, in order.
#[must_use]
pub fn schema_statements() -> Vec<String> {
    let mut statements: Vec<String> = ControllerKind::ALL
        .iter()
        .map(|kind| entity_table_ddl(&table_name(*kind)))
        .collect();
    statements.push(entity_table_ddl(FORMS_TABLE));
    statements.push(
        "CREATE TABLE IF NOT EXISTS download_log (
            id BIGSERIAL PRIMARY KEY,
            site TEXT NOT NULL,
            controller TEXT NOT NULL,
            download_ts TIMESTAMP NOT NULL DEFAULT NOW(),
            error_count INTEGER NOT NULL,
            http_status INTEGER NOT NULL,
            comment TEXT NOT NULL,
            length BIGINT NOT NULL,
            duration DOUBLE PRECISION NOT NULL
        )"
        .to_string(),
    );
    statements.push(
        "CREATE TABLE IF NOT EXISTS increment_log (
            site TEXT NOT NULL,
            taxo_group TEXT NOT NULL,
            last_ts TIMESTAMP NOT NULL,
            PRIMARY KEY (site, taxo_group)
        )"
        .to_string(),
    );
    statements
}

fn entity_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT NOT NULL,
            site TEXT NOT NULL,
            item JSONB NOT NULL,
            update_ts TIMESTAMP NOT NULL DEFAULT NOW(),
            PRIMARY KEY (id, site)
        )"
    )
}

fn table_name(kind: ControllerKind) -> String {
    format!("{kind}_json")
}

/// Splits a merged document into the rows to upsert.
///
/// # Errors
///
/// Returns [`StoreError::Conversion`] if a sighting has no
/// `observers[0].id_sighting` or a form has neither `@id` nor
/// `id_form_universal`.
pub fn document_rows(
    kind: ControllerKind,
    sequence: &str,
    document: &Value,
) -> Result<Vec<Row>, StoreError> {
    let Some(data) = document.get("data") else {
        return Ok(Vec::new());
    };

    if kind == ControllerKind::Observations {
        return observation_rows(data);
    }

    let table = table_name(kind);
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        _ => Vec::new(),
    };

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| Row {
            table: table.clone(),
            id: item
                .get("id")
                .and_then(id_string)
                .unwrap_or_else(|| format!("{sequence}_{index}")),
            item: item.clone(),
        })
        .collect())
}

fn observation_rows(data: &Value) -> Result<Vec<Row>, StoreError> {
    let table = table_name(ControllerKind::Observations);
    let mut rows = Vec::new();

    let sighting_row = |sighting: &Value| -> Result<Row, StoreError> {
        let id = sighting
            .pointer("/observers/0/id_sighting")
            .and_then(id_string)
            .ok_or_else(|| StoreError::Conversion {
                message: "sighting without observers[0].id_sighting".to_string(),
            })?;
        Ok(Row {
            table: table.clone(),
            id,
            item: sighting.clone(),
        })
    };

    for sighting in data
        .get("sightings")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        rows.push(sighting_row(sighting)?);
    }

    for form in data
        .get("forms")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for sighting in form
            .get("sightings")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            rows.push(sighting_row(sighting)?);
        }

        let id = form
            .get("@id")
            .or_else(|| form.get("id_form_universal"))
            .and_then(id_string)
            .ok_or_else(|| StoreError::Conversion {
                message: "form without @id or id_form_universal".to_string(),
            })?;
        let mut header = form.clone();
        if let Value::Object(map) = &mut header {
            map.remove("sightings");
        }
        rows.push(Row {
            table: FORMS_TABLE.to_string(),
            id,
            item: header,
        });
    }

    Ok(rows)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl StorageBackend for PostgresStore {
    async fn store(
        &self,
        controller: &str,
        sequence: &str,
        document: &Value,
    ) -> Result<u64, StoreError> {
        let kind: ControllerKind = controller.parse().map_err(|_| StoreError::Conversion {
            message: format!("unknown controller {controller}"),
        })?;

        let rows = document_rows(kind, sequence, document)?;
        for row in &rows {
            self.upsert(row).await?;
        }

        log::debug!(
            "Upserted {} row(s) for {controller} {sequence} ({})",
            rows.len(),
            self.site
        );
        Ok(count_items(controller, document))
    }

    async fn log(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.db
            .exec_raw_params(
                "INSERT INTO download_log
                    (site, controller, error_count, http_status, comment, length, duration)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    DatabaseValue::String(record.site.clone()),
                    DatabaseValue::String(record.controller.clone()),
                    DatabaseValue::Int32(i32::try_from(record.error_count).unwrap_or(i32::MAX)),
                    DatabaseValue::Int32(i32::from(record.http_status)),
                    DatabaseValue::String(record.comment.clone()),
                    DatabaseValue::Int64(i64::try_from(record.length).unwrap_or(i64::MAX)),
                    DatabaseValue::Real64(record.duration),
                ],
            )
            .await?;
        Ok(())
    }

    async fn increment_log(
        &self,
        site: &str,
        taxo_group: &str,
        last_ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db
            .exec_raw_params(
                "INSERT INTO increment_log (site, taxo_group, last_ts)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (site, taxo_group) DO UPDATE SET last_ts = EXCLUDED.last_ts",
                &[
                    DatabaseValue::String(site.to_string()),
                    DatabaseValue::String(taxo_group.to_string()),
                    DatabaseValue::DateTime(last_ts.naive_utc()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn increment_get(
        &self,
        site: &str,
        taxo_group: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT last_ts FROM increment_log WHERE site = $1 AND taxo_group = $2",
                &[
                    DatabaseValue::String(site.to_string()),
                    DatabaseValue::String(taxo_group.to_string()),
                ],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let naive: NaiveDateTime = row.to_value("last_ts").map_err(|e| StoreError::Conversion {
            message: format!("Failed to parse last_ts: {e}"),
        })?;
        Ok(Some(DateTime::from_naive_utc_and_offset(naive, Utc)))
    }

    async fn delete_obs(&self, ids: &[String]) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE site = $1 AND id = $2",
            table_name(ControllerKind::Observations)
        );
        let mut deleted = 0;
        for id in ids {
            deleted += self
                .db
                .exec_raw_params(
                    &sql,
                    &[
                        DatabaseValue::String(self.site.clone()),
                        DatabaseValue::String(id.clone()),
                    ],
                )
                .await?;
        }
        log::debug!("Deleted {deleted} observation(s) of {}", self.site);
        Ok(deleted)
    }
}
