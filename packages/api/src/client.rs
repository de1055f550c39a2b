//! The chunked, retrying transfer client.
//!
//! # Retry behaviour
//!
//! Each chunk request is classified by status:
//!
//! * 2xx: success. The transient error counter is reset and the body decoded.
//!   An undecodable body counts as a transient failure.
//! * 503: the server asks us to slow down. Sleep `unavailable_delay` and
//!   retry without touching the error counter. Only `max_requests` bounds
//!   this.
//! * other 4xx: terminal, returned immediately as [`ApiError::Http`].
//! * anything else (3xx, 5xx, no response): transient. The counter is
//!   incremented and the same chunk retried after `retry_delay`; once it
//!   exceeds `max_retry` the failure is returned. With `max_retry = k` that is
//!   at most `k + 1` attempts per chunk.
//!
//! The counter is per chunk: a chunk that eventually succeeds clears the
//! failures that preceded it.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::Value;
use vn_sync_api_models::{ControllerKind, MergeStrategy, TaxoGroup, Tuning};

use crate::ApiError;
use crate::cache::TaxoGroupCache;
use crate::controller::Controller;
use crate::credentials::CredentialProvider;
use crate::merge::{PAGINATION_KEY_PARAM, merge_chunk, next_pagination_key};
use crate::observations::ObservationsApi;
use crate::request::{ApiRequest, ApiResponse, Method};
use crate::transport::Transport;

/// HTTP status the server uses to ask for a pause.
const SERVICE_UNAVAILABLE: u16 = 503;

/// Cache key of the unfiltered taxonomic group list.
const ALL_TAXO_GROUPS_KEY: &str = "taxo_groups";

/// A decoded chunk and the response it came from.
struct Chunk {
    document: Value,
    response: ApiResponse,
}

/// Transfer client for one site.
///
/// Holds the transient error counter, the request counter and the taxonomic
/// group cache. Every pipeline should own its own instance.
pub struct TransferClient<T: Transport> {
    transport: T,
    credentials: Box<dyn CredentialProvider>,
    tuning: Tuning,
    cache: TaxoGroupCache,
    transfer_errors: AtomicU32,
    http_status: AtomicU16,
    nb_requests: AtomicU64,
}

impl<T: Transport> std::fmt::Debug for TransferClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("tuning", &self.tuning)
            .field("cache", &self.cache)
            .field("transfer_errors", &self.transfer_errors())
            .field("http_status", &self.http_status())
            .field("nb_requests", &self.nb_requests())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> TransferClient<T> {
    /// Creates a client sending through `transport`, signing every request
    /// with `credentials`.
    #[must_use]
    pub fn new(
        transport: T,
        credentials: impl CredentialProvider + 'static,
        tuning: Tuning,
    ) -> Self {
        let cache = TaxoGroupCache::new(tuning.lru_maxsize);
        Self {
            transport,
            credentials: Box::new(credentials),
            tuning,
            cache,
            transfer_errors: AtomicU32::new(0),
            http_status: AtomicU16::new(0),
            nb_requests: AtomicU64::new(0),
        }
    }

    /// Transport requests are sent through.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Tuning this client was built with.
    #[must_use]
    pub const fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Consecutive transient failures of the chunk in progress (or of the
    /// last failed chunk).
    #[must_use]
    pub fn transfer_errors(&self) -> u32 {
        self.transfer_errors.load(Ordering::Relaxed)
    }

    /// Last HTTP status received, `0` before the first response.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.http_status.load(Ordering::Relaxed)
    }

    /// Requests issued by this client since creation.
    #[must_use]
    pub fn nb_requests(&self) -> u64 {
        self.nb_requests.load(Ordering::Relaxed)
    }

    /// Handle for the generic operations of one controller.
    #[must_use]
    pub const fn controller(&self, kind: ControllerKind) -> Controller<'_, T> {
        Controller::new(self, kind)
    }

    /// Handle for the observation-specific operations.
    #[must_use]
    pub const fn observations(&self) -> ObservationsApi<'_, T> {
        ObservationsApi::new(self)
    }

    /// Lists the taxonomic groups of the site, served from the client's
    /// cache after the first call.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the list call fails or the response does not
    /// hold a list of groups.
    pub async fn taxo_groups(&self) -> Result<Vec<TaxoGroup>, ApiError> {
        if let Some(groups) = self.cache.get(ALL_TAXO_GROUPS_KEY) {
            log::debug!("Taxo groups served from cache ({} groups)", groups.len());
            return Ok(groups);
        }

        let document = self.controller(ControllerKind::TaxoGroups).list(&[]).await?;
        let groups: Vec<TaxoGroup> =
            serde_json::from_value(document.get("data").cloned().unwrap_or(Value::Null))?;

        log::debug!("Fetched {} taxo groups", groups.len());
        self.cache.insert(ALL_TAXO_GROUPS_KEY, groups.clone());
        Ok(groups)
    }

    /// Drops the cached taxonomic groups so the next call refetches them.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// Issues `request`, following pagination until the server stops
    /// declaring more chunks, and returns the merged document.
    ///
    /// # Errors
    ///
    /// * [`ApiError::Http`] on a terminal status or exhausted retries.
    /// * [`ApiError::MaxChunks`] if the response is still chunked after
    ///   `max_chunks` chunks.
    /// * [`ApiError::MaxRequests`] if the lifetime request budget runs out.
    pub async fn request(
        &self,
        request: &ApiRequest,
        strategy: MergeStrategy,
    ) -> Result<Value, ApiError> {
        let mut accumulator: Option<Value> = None;
        let mut pagination_key: Option<String> = None;
        let mut chunks: u32 = 0;

        while chunks < self.tuning.max_chunks {
            let chunk_request = match &pagination_key {
                Some(key) => request.clone().with_param(PAGINATION_KEY_PARAM, key.clone()),
                None => request.clone(),
            };

            let chunk = self.send_chunk(&chunk_request).await?;
            chunks += 1;

            pagination_key = next_pagination_key(&chunk.response);
            merge_chunk(&mut accumulator, chunk.document, strategy);

            if pagination_key.is_none() {
                log::debug!(
                    "{} complete after {chunks} chunk(s)",
                    request.path
                );
                return Ok(accumulator.unwrap_or(Value::Null));
            }

            log::debug!("{} chunk {chunks} received, more to come", request.path);
        }

        log::error!(
            "{} still chunked after {} chunks",
            request.path,
            self.tuning.max_chunks
        );
        Err(ApiError::MaxChunks {
            max_chunks: self.tuning.max_chunks,
        })
    }

    /// Issues `request` once (no pagination) and requires `expected_status`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the final status differs from
    /// `expected_status`, or any error of the retry loop.
    pub async fn request_expecting(
        &self,
        request: &ApiRequest,
        expected_status: u16,
    ) -> Result<Value, ApiError> {
        let chunk = self.send_chunk(request).await?;
        if chunk.response.status == expected_status {
            Ok(chunk.document)
        } else {
            Err(ApiError::Http {
                status: chunk.response.status,
                url: request.path.clone(),
            })
        }
    }

    /// Sends one chunk request, retrying transient failures.
    async fn send_chunk(&self, request: &ApiRequest) -> Result<Chunk, ApiError> {
        let mut errors: u32 = 0;

        loop {
            self.count_request()?;

            let signed = self.credentials.sign(request.clone());
            let started = Instant::now();
            let outcome = self.transport.send(&signed).await;

            let failure = match outcome {
                Err(e) => {
                    self.http_status.store(0, Ordering::Relaxed);
                    log::warn!("{} {:?} failed: {e}", request.path, request.method);
                    e
                }
                Ok(response) => {
                    let status = response.status;
                    self.http_status.store(status, Ordering::Relaxed);
                    log::debug!(
                        "{} {:?} -> {status} in {:.1}s ({} bytes, errors={errors})",
                        request.path,
                        request.method,
                        started.elapsed().as_secs_f64(),
                        response.body.len(),
                    );

                    if (200..300).contains(&status) {
                        match decode_body(&response.body) {
                            Ok(document) => {
                                self.transfer_errors.store(0, Ordering::Relaxed);
                                return Ok(Chunk { document, response });
                            }
                            Err(e) => {
                                log::warn!("{}: undecodable body: {e}", request.path);
                                ApiError::Json(e)
                            }
                        }
                    } else if status == SERVICE_UNAVAILABLE {
                        log::warn!(
                            "{}: service unavailable, waiting {}s",
                            request.path,
                            self.tuning.unavailable_delay
                        );
                        tokio::time::sleep(self.tuning.unavailable_delay()).await;
                        continue;
                    } else if (400..500).contains(&status) {
                        log::error!(
                            "{}: HTTP {status}, not retrying: {}",
                            request.path,
                            preview(&response.body)
                        );
                        return Err(ApiError::Http {
                            status,
                            url: request.path.clone(),
                        });
                    } else {
                        ApiError::Http {
                            status,
                            url: request.path.clone(),
                        }
                    }
                }
            };

            errors += 1;
            self.transfer_errors.store(errors, Ordering::Relaxed);

            if errors > self.tuning.max_retry {
                log::error!(
                    "{}: giving up after {errors} attempt(s): {failure}",
                    request.path
                );
                return Err(ApiError::Http {
                    status: self.http_status(),
                    url: request.path.clone(),
                });
            }

            log::warn!(
                "{}: retry {errors}/{} in {}s ({failure})",
                request.path,
                self.tuning.max_retry,
                self.tuning.retry_delay
            );
            tokio::time::sleep(self.tuning.retry_delay()).await;
        }
    }

    fn count_request(&self) -> Result<(), ApiError> {
        let issued = self.nb_requests.fetch_add(1, Ordering::Relaxed) + 1;
        let max_requests = self.tuning.max_requests;
        if max_requests > 0 && issued > max_requests {
            log::error!("Request budget of {max_requests} exhausted");
            return Err(ApiError::MaxRequests { max_requests });
        }
        Ok(())
    }
}

/// Empty bodies (e.g. `DELETE` answers) decode to `null`.
fn decode_body(body: &str) -> Result<Value, serde_json::Error> {
    if body.trim().is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_str(body)
    }
}

fn preview(body: &str) -> &str {
    const PREVIEW_LEN: usize = 200;
    match body.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Builds a `GET` request for `path`.
pub(crate) fn get_request(path: impl Into<String>, params: &[(&str, &str)]) -> ApiRequest {
    ApiRequest::new(Method::Get, path).with_params(params)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::credentials::NoCredentials;

    /// Scripted transport: pops one outcome per request and records every
    /// request it was given.
    #[derive(Default)]
    pub struct MockTransport {
        pub outcomes: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
        pub requests: Mutex<Vec<ApiRequest>>,
        pub fallback: Option<ApiResponse>,
    }

    impl MockTransport {
        pub fn with(outcomes: Vec<Result<ApiResponse, ApiError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        pub fn repeating(response: ApiResponse) -> Self {
            Self {
                fallback: Some(response),
                ..Self::default()
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn sent(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome,
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| ApiError::Transport("script exhausted".to_string())),
            }
        }
    }

    pub fn ok(body: &Value) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse {
            status: 200,
            headers: std::collections::BTreeMap::new(),
            body: body.to_string(),
        })
    }

    pub fn chunked(body: &Value, key: &str) -> Result<ApiResponse, ApiError> {
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("transfer-encoding".to_string(), "chunked".to_string());
        headers.insert("pagination_key".to_string(), key.to_string());
        Ok(ApiResponse {
            status: 200,
            headers,
            body: body.to_string(),
        })
    }

    pub fn status(status: u16) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse {
            status,
            headers: std::collections::BTreeMap::new(),
            body: String::new(),
        })
    }

    pub fn fast_tuning() -> Tuning {
        Tuning {
            max_retry: 3,
            max_chunks: 10,
            retry_delay: 0,
            unavailable_delay: 0,
            ..Tuning::default()
        }
    }

    fn client(transport: MockTransport, tuning: Tuning) -> TransferClient<MockTransport> {
        TransferClient::new(transport, NoCredentials, tuning)
    }

    fn list_request() -> ApiRequest {
        get_request("places", &[("id_commune", "12")])
    }

    #[tokio::test]
    async fn merges_chunks_in_arrival_order() {
        let transport = MockTransport::with(vec![
            chunked(&json!({"data": [{"id": 1}, {"id": 2}]}), "k1"),
            chunked(&json!({"data": [{"id": 3}]}), "k2"),
            ok(&json!({"data": [{"id": 4}, {"id": 5}, {"id": 6}]})),
        ]);
        let client = client(transport, fast_tuning());

        let doc = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap();

        let ids: Vec<i64> = doc["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

        let sent = client.transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].param("pagination_key"), None);
        assert_eq!(sent[1].param("pagination_key"), Some("k1"));
        assert_eq!(sent[2].param("pagination_key"), Some("k2"));
        // The original filter survives on every chunk and the key never
        // accumulates.
        assert!(sent.iter().all(|r| r.param("id_commune") == Some("12")));
        assert!(
            sent.iter()
                .all(|r| r.params.iter().filter(|(k, _)| k == "pagination_key").count() <= 1)
        );
    }

    #[tokio::test]
    async fn transient_errors_stop_after_max_retry_plus_one_attempts() {
        let tuning = Tuning {
            max_retry: 2,
            ..fast_tuning()
        };
        let client = client(
            MockTransport::repeating(ApiResponse {
                status: 500,
                ..ApiResponse::default()
            }),
            tuning,
        );

        let err = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(client.transport.request_count(), 3);
        assert_eq!(client.transfer_errors(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let client = client(MockTransport::with(vec![status(403)]), fast_tuning());

        let err = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Http { status: 403, .. }));
        assert_eq!(client.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn max_chunks_is_reported_after_exactly_max_chunks_requests() {
        let tuning = Tuning {
            max_chunks: 4,
            ..fast_tuning()
        };
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("transfer-encoding".to_string(), "chunked".to_string());
        headers.insert("pagination_key".to_string(), "again".to_string());
        let client = client(
            MockTransport::repeating(ApiResponse {
                status: 200,
                headers,
                body: json!({"data": [1]}).to_string(),
            }),
            tuning,
        );

        let err = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::MaxChunks { max_chunks: 4 }));
        assert_eq!(client.transport.request_count(), 4);
    }

    #[tokio::test]
    async fn exhausted_network_failures_surface_as_status_zero() {
        let tuning = Tuning {
            max_retry: 1,
            ..fast_tuning()
        };
        let transport = MockTransport::with(vec![
            Err(ApiError::Transport("refused".to_string())),
            Err(ApiError::Transport("refused".to_string())),
        ]);
        let client = client(transport, tuning);

        let err = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Http { status: 0, ref url } if url == "places"));
        assert_eq!(client.transport.request_count(), 2);
    }

    #[tokio::test]
    async fn success_resets_the_error_counter_per_chunk() {
        // Two failures on chunk 1, two on chunk 2: never more than
        // max_retry (3) in a row, so the call succeeds.
        let transport = MockTransport::with(vec![
            status(502),
            status(500),
            chunked(&json!({"data": ["a"]}), "k"),
            status(500),
            Err(ApiError::Transport("reset".to_string())),
            ok(&json!({"data": ["b"]})),
        ]);
        let client = client(transport, fast_tuning());

        let doc = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap();

        assert_eq!(doc["data"], json!(["a", "b"]));
        assert_eq!(client.transfer_errors(), 0);
        assert_eq!(client.transport.request_count(), 6);
    }

    #[tokio::test]
    async fn service_unavailable_does_not_consume_retries() {
        let tuning = Tuning {
            max_retry: 0,
            ..fast_tuning()
        };
        let transport = MockTransport::with(vec![
            status(503),
            status(503),
            status(503),
            ok(&json!({"data": []})),
        ]);
        let client = client(transport, tuning);

        let doc = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap();

        assert_eq!(doc["data"], json!([]));
        assert_eq!(client.transport.request_count(), 4);
    }

    #[tokio::test]
    async fn request_budget_bounds_unavailable_loop() {
        let tuning = Tuning {
            max_requests: 5,
            ..fast_tuning()
        };
        let client = client(
            MockTransport::repeating(ApiResponse {
                status: 503,
                ..ApiResponse::default()
            }),
            tuning,
        );

        let err = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::MaxRequests { max_requests: 5 }));
        assert_eq!(client.transport.request_count(), 5);
    }

    #[tokio::test]
    async fn undecodable_body_is_retried() {
        let transport = MockTransport::with(vec![
            Ok(ApiResponse {
                status: 200,
                headers: std::collections::BTreeMap::new(),
                body: "{\"data\": [".to_string(),
            }),
            ok(&json!({"data": [7]})),
        ]);
        let client = client(transport, fast_tuning());

        let doc = client
            .request(&list_request(), MergeStrategy::List)
            .await
            .unwrap();
        assert_eq!(doc["data"], json!([7]));
    }

    #[tokio::test]
    async fn request_expecting_rejects_other_success_codes() {
        let client = client(MockTransport::with(vec![status(200)]), fast_tuning());
        let req = ApiRequest::new(Method::Post, "observations").with_body(json!({}));

        let err = client.request_expecting(&req, 201).await.unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 200, .. }));
    }

    #[tokio::test]
    async fn taxo_groups_are_fetched_once() {
        let transport = MockTransport::with(vec![ok(&json!({"data": [
            {"id": "1", "name": "Oiseaux", "access_mode": "full", "name_constant": "TAXO_GROUP_BIRD"},
            {"id": "2", "name": "Chauves-souris", "access_mode": "none", "name_constant": "TAXO_GROUP_BAT"}
        ]}))]);
        let client = client(transport, fast_tuning());

        let first = client.taxo_groups().await.unwrap();
        let second = client.taxo_groups().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(client.transport.request_count(), 1);

        client.invalidate_cache();
        // Script is exhausted, so a refetch now surfaces a transport error.
        assert!(client.taxo_groups().await.is_err());
    }
}
