//! In-memory transport and storage used by the orchestrator tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use vn_sync_api::credentials::NoCredentials;
use vn_sync_api::{ApiError, ApiRequest, ApiResponse, TransferClient, Transport};
use vn_sync_api_models::{SiteConfig, Tuning};
use vn_sync_config::ObservationsConfig;
use vn_sync_store::{AuditRecord, StorageBackend, StoreError, count_items};

use crate::Downloader;

type Responder = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync>;

struct Route {
    path: String,
    filter: Option<(String, String)>,
    responder: Responder,
}

/// Answers requests by path (and optionally one query parameter). The
/// first matching route wins; unmatched requests get a 404.
#[derive(Default)]
pub struct RouteTransport {
    routes: Vec<Route>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl RouteTransport {
    pub fn route(&mut self, path: &str, body: Value) {
        self.respond(path, None, move |_| Ok(json_response(&body)));
    }

    pub fn route_with(&mut self, path: &str, key: &str, value: &str, body: Value) {
        self.respond(
            path,
            Some((key, value)),
            move |_| Ok(json_response(&body)),
        );
    }

    pub fn respond(
        &mut self,
        path: &str,
        filter: Option<(&str, &str)>,
        responder: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) {
        self.routes.push(Route {
            path: path.to_string(),
            filter: filter.map(|(k, v)| (k.to_string(), v.to_string())),
            responder: Box::new(responder),
        });
    }

    pub fn sent(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.path).collect()
    }
}

#[async_trait]
impl Transport for RouteTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());

        let route = self.routes.iter().find(|route| {
            route.path == request.path
                && route
                    .filter
                    .as_ref()
                    .is_none_or(|(k, v)| request.param(k) == Some(v.as_str()))
        });

        match route {
            Some(route) => (route.responder)(request),
            None => Ok(ApiResponse {
                status: 404,
                ..ApiResponse::default()
            }),
        }
    }
}

pub fn json_response(body: &Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        headers: BTreeMap::new(),
        body: body.to_string(),
    }
}

/// Something the orchestrator asked the store to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Store { controller: String, sequence: String },
    Log(AuditRecord),
    IncrementLog { taxo_group: String, last_ts: DateTime<Utc> },
    DeleteObs(Vec<String>),
}

/// Records every call and keeps watermarks in memory.
#[derive(Default)]
pub struct RecordingStore {
    events: Mutex<Vec<Event>>,
    documents: Mutex<Vec<Value>>,
    watermarks: Mutex<BTreeMap<(String, String), DateTime<Utc>>>,
}

impl RecordingStore {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn documents(&self) -> Vec<Value> {
        self.documents.lock().unwrap().clone()
    }

    /// `(controller, sequence)` of every stored document, in order.
    pub fn stored(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Store {
                    controller,
                    sequence,
                } => Some((controller, sequence)),
                _ => None,
            })
            .collect()
    }

    /// Events other than audit records.
    pub fn effects(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Log(_)))
            .collect()
    }

    pub fn set_watermark(&self, site: &str, taxo_group: &str, ts: DateTime<Utc>) {
        self.watermarks
            .lock()
            .unwrap()
            .insert((site.to_string(), taxo_group.to_string()), ts);
    }
}

#[async_trait]
impl StorageBackend for RecordingStore {
    async fn store(
        &self,
        controller: &str,
        sequence: &str,
        document: &Value,
    ) -> Result<u64, StoreError> {
        self.events.lock().unwrap().push(Event::Store {
            controller: controller.to_string(),
            sequence: sequence.to_string(),
        });
        self.documents.lock().unwrap().push(document.clone());
        Ok(count_items(controller, document))
    }

    async fn log(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(Event::Log(record.clone()));
        Ok(())
    }

    async fn increment_log(
        &self,
        site: &str,
        taxo_group: &str,
        last_ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(Event::IncrementLog {
            taxo_group: taxo_group.to_string(),
            last_ts,
        });
        self.set_watermark(site, taxo_group, last_ts);
        Ok(())
    }

    async fn increment_get(
        &self,
        site: &str,
        taxo_group: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .watermarks
            .lock()
            .unwrap()
            .get(&(site.to_string(), taxo_group.to_string()))
            .copied())
    }

    async fn delete_obs(&self, ids: &[String]) -> Result<u64, StoreError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::DeleteObs(ids.to_vec()));
        Ok(ids.len() as u64)
    }
}

/// Groups 1 and 3 are readable, group 2 has access mode "none".
pub fn taxo_groups_body() -> Value {
    json!({"data": [
        {"id": "1", "name": "Oiseaux", "access_mode": "full", "name_constant": "TAXO_GROUP_BIRD"},
        {"id": "2", "name": "Chauves-souris", "access_mode": "none", "name_constant": "TAXO_GROUP_BAT"},
        {"id": "3", "name": "Reptiles", "access_mode": "limited", "name_constant": "TAXO_GROUP_REPTILIA"}
    ]})
}

pub fn test_tuning() -> Tuning {
    Tuning {
        max_retry: 1,
        retry_delay: 0,
        unavailable_delay: 0,
        ..Tuning::default()
    }
}

pub fn site() -> SiteConfig {
    SiteConfig {
        name: "tst".to_string(),
        base_url: "https://www.faune-test.org/".to_string(),
        user_email: String::new(),
        user_pw: String::new(),
        client_key: String::new(),
        client_secret: String::new(),
        tuning: test_tuning(),
    }
}

pub fn downloader_with(
    observations: ObservationsConfig,
    tuning: Tuning,
    configure: impl FnOnce(&mut RouteTransport),
) -> Downloader<RouteTransport, RecordingStore> {
    let mut transport = RouteTransport::default();
    configure(&mut transport);
    let client = TransferClient::new(transport, NoCredentials, tuning);
    Downloader::new(&site(), client, RecordingStore::default(), observations)
}

pub fn downloader(
    configure: impl FnOnce(&mut RouteTransport),
) -> Downloader<RouteTransport, RecordingStore> {
    downloader_with(ObservationsConfig::default(), test_tuning(), configure)
}
