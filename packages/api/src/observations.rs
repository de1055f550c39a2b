//! Observation-specific operations: per-group listing, search, diff and
//! batch deletion.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Value, json};
use vn_sync_api_models::{ControllerKind, DiffEntry, MergeStrategy, ModificationType};

use crate::ApiError;
use crate::client::{TransferClient, get_request};
use crate::request::{ApiRequest, Method};
use crate::transport::Transport;

/// Date format of the search query body.
pub const SEARCH_DATE_FORMAT: &str = "%d.%m.%Y";

/// Date format of the diff `date` parameter.
pub const DIFF_DATE_FORMAT: &str = "%H:%M:%S %d.%m.%Y";

const OBSERVATIONS: &str = "observations";

/// Inclusive date range of one search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    /// First day of the range.
    pub start: NaiveDate,
    /// Last day of the range.
    pub end: NaiveDate,
}

impl SearchWindow {
    /// Search body selecting every species of `id_taxo_group` observed in
    /// this window.
    #[must_use]
    pub fn query(&self, id_taxo_group: &str) -> Value {
        json!({
            "period_choice": "range",
            "date_from": self.start.format(SEARCH_DATE_FORMAT).to_string(),
            "date_to": self.end.format(SEARCH_DATE_FORMAT).to_string(),
            "species_choice": "all",
            "taxonomic_group": id_taxo_group,
        })
    }
}

/// Observation operations bound to one client.
#[derive(Debug)]
pub struct ObservationsApi<'a, T: Transport> {
    client: &'a TransferClient<T>,
}

impl<'a, T: Transport> ObservationsApi<'a, T> {
    pub(crate) const fn new(client: &'a TransferClient<T>) -> Self {
        Self { client }
    }

    /// Lists every observation of a taxonomic group, optionally restricted to
    /// one species.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn list_taxo(
        &self,
        id_taxo_group: &str,
        id_species: Option<&str>,
        short_version: bool,
    ) -> Result<Value, ApiError> {
        let mut request = get_request(
            OBSERVATIONS,
            &[
                ("id_taxo_group", id_taxo_group),
                ("short_version", short_flag(short_version)),
            ],
        );
        if let Some(id_species) = id_species {
            request = request.with_param("id_species", id_species);
        }
        self.client.request(&request, MergeStrategy::Sightings).await
    }

    /// Posts `query` to the search endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn search(&self, query: &Value, short_version: bool) -> Result<Value, ApiError> {
        let request = ApiRequest::new(Method::Post, "observations/search")
            .with_param("short_version", short_flag(short_version))
            .with_body(query.clone());
        self.client.request(&request, MergeStrategy::Sightings).await
    }

    /// Lists the sightings of `id_taxo_group` changed since `since`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails or the response is not a
    /// list of change records.
    pub async fn diff(
        &self,
        id_taxo_group: &str,
        since: DateTime<Utc>,
        modification_type: ModificationType,
    ) -> Result<Vec<DiffEntry>, ApiError> {
        let date = since.format(DIFF_DATE_FORMAT).to_string();
        let request = get_request(
            "observations/diff",
            &[
                ("id_taxo_group", id_taxo_group),
                ("modification_type", modification_type.as_ref()),
                ("date", date.as_str()),
            ],
        );

        let document = self.client.request(&request, MergeStrategy::List).await?;
        let records = match document {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => Value::Array(items),
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            other => {
                return Err(ApiError::NotImplemented(format!(
                    "unexpected diff response: {other}"
                )));
            }
        };
        if records.is_null() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_value(records)?)
    }

    /// Fetches one sighting.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn get(&self, id_sighting: &str, short_version: bool) -> Result<Value, ApiError> {
        self.client
            .controller(ControllerKind::Observations)
            .get(id_sighting, &[("short_version", short_flag(short_version))])
            .await
    }

    /// Deletes every sighting matched by `body`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn delete_list(&self, body: Value) -> Result<Value, ApiError> {
        let request = ApiRequest::new(Method::Post, "observations/delete_list").with_body(body);
        self.client.request(&request, MergeStrategy::List).await
    }
}

const fn short_flag(short_version: bool) -> &'static str {
    if short_version { "1" } else { "0" }
}
