#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Transfer client for the VisioNature (Biolovision) REST API.
//!
//! The remote API pages large responses with an opaque pagination key. A
//! [`TransferClient`] hides that: each logical call is issued as one or more
//! chunk requests, transient failures are retried with a fixed delay, and the
//! chunks are merged back into a single JSON document according to the
//! controller's [`MergeStrategy`](vn_sync_api_models::MergeStrategy).
//!
//! All network I/O goes through the [`Transport`] trait so the retry and
//! merge logic can be exercised without a live server.
//!
//! ```rust,no_run
//! # async fn example(site: vn_sync_api_models::SiteConfig) -> Result<(), vn_sync_api::ApiError> {
//! use vn_sync_api::{ReqwestTransport, TransferClient, UserCredentials};
//! use vn_sync_api_models::ControllerKind;
//!
//! let transport = ReqwestTransport::new(&site)?;
//! let client = TransferClient::new(transport, UserCredentials::from_site(&site), site.tuning.clone());
//! let species = client
//!     .controller(ControllerKind::Species)
//!     .list(&[("id_taxo_group", "1")])
//!     .await?;
//! println!("{} species", species["data"].as_array().map_or(0, Vec::len));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod controller;
pub mod credentials;
pub mod merge;
pub mod observations;
pub mod request;
pub mod transport;

pub use client::TransferClient;
pub use controller::Controller;
pub use credentials::{CredentialProvider, UserCredentials};
pub use observations::{ObservationsApi, SearchWindow};
pub use request::{ApiRequest, ApiResponse, Method};
pub use transport::{ReqwestTransport, Transport};

/// Errors raised by the transfer client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server answered with a terminal status, or transient failures
    /// exceeded the retry budget.
    #[error("HTTP status {status} from {url}")]
    Http {
        /// Last HTTP status received (`0` if no response was received).
        status: u16,
        /// Request path, relative to the API root.
        url: String,
    },

    /// The response was still declaring more chunks after `max_chunks`
    /// chunks; the query must be narrowed.
    #[error("response still chunked after {max_chunks} chunks, narrow the query")]
    MaxChunks {
        /// Configured chunk budget.
        max_chunks: u32,
    },

    /// The lifetime request budget of this client was exhausted.
    #[error("request budget of {max_requests} exhausted")]
    MaxRequests {
        /// Configured request budget.
        max_requests: u64,
    },

    /// The server sent something this client does not understand.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The caller passed an argument the API cannot accept.
    #[error("incorrect parameter: {0}")]
    IncorrectParameter(String),

    /// A response body could not be decoded.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request never produced a response (DNS, TLS, timeout, reset).
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    /// HTTP status carried by this error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
