//! Generic per-controller operations.

use serde_json::Value;
use vn_sync_api_models::ControllerKind;

use crate::ApiError;
use crate::client::{TransferClient, get_request};
use crate::request::{ApiRequest, Method};
use crate::transport::Transport;

/// HTTP status the API answers a successful creation with.
const CREATED: u16 = 201;

/// Operations shared by every controller, bound to one client.
#[derive(Debug)]
pub struct Controller<'a, T: Transport> {
    client: &'a TransferClient<T>,
    kind: ControllerKind,
}

impl<'a, T: Transport> Controller<'a, T> {
    pub(crate) const fn new(client: &'a TransferClient<T>, kind: ControllerKind) -> Self {
        Self { client, kind }
    }

    /// Controller this handle talks to.
    #[must_use]
    pub const fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Fetches one entity by id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn get(&self, id: &str, params: &[(&str, &str)]) -> Result<Value, ApiError> {
        if id.is_empty() {
            return Err(ApiError::IncorrectParameter(format!(
                "empty id for {}",
                self.kind
            )));
        }
        let request = get_request(format!("{}/{id}", self.kind.path()), params);
        self.client
            .request(&request, self.kind.merge_strategy())
            .await
    }

    /// Lists entities, optionally filtered by `params`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn list(&self, params: &[(&str, &str)]) -> Result<Value, ApiError> {
        let request = get_request(self.kind.path(), params);
        self.client
            .request(&request, self.kind.merge_strategy())
            .await
    }

    /// Creates an entity. The server must answer `201 Created`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] on any other final status.
    pub async fn create(&self, body: Value) -> Result<Value, ApiError> {
        let request = ApiRequest::new(Method::Post, self.kind.path()).with_body(body);
        self.client.request_expecting(&request, CREATED).await
    }

    /// Replaces the entity `id` with `body`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn update(&self, id: &str, body: Value) -> Result<Value, ApiError> {
        let request =
            ApiRequest::new(Method::Put, format!("{}/{id}", self.kind.path())).with_body(body);
        self.client
            .request(&request, self.kind.merge_strategy())
            .await
    }

    /// Deletes the entity `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the transfer fails.
    pub async fn delete(&self, id: &str) -> Result<Value, ApiError> {
        let request = ApiRequest::new(Method::Delete, format!("{}/{id}", self.kind.path()));
        self.client
            .request(&request, self.kind.merge_strategy())
            .await
    }
}
