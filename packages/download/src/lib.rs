#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Download orchestrator.
//!
//! One [`Downloader`] drives one site: it owns the site's transfer client
//! (and with it the retry counter and taxonomic group cache) and hands every
//! merged document to a [`StorageBackend`] as soon as it arrives.
//!
//! * Simple controllers are listed once, or once per taxonomic group for
//!   species.
//! * Observations are walked either per taxonomic group / species (list
//!   method) or backward through time with a regulator-sized window (search
//!   method).
//! * Incremental updates replay the server-side diff since a per-group
//!   watermark.

mod entities;
mod observations;
pub mod progress;
mod update;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use vn_sync_api::{ApiError, TransferClient, Transport};
use vn_sync_api_models::{ControllerKind, SiteConfig, TaxoGroup};
use vn_sync_config::{ConfigError, ObservationsConfig};
use vn_sync_regulator::RegulatorError;
use vn_sync_store::{AuditRecord, StorageBackend, StoreError};

pub use progress::{NullProgress, ProgressCallback, null_progress};

/// Errors raised while downloading a site.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Remote call failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid regulator settings.
    #[error(transparent)]
    Regulator(#[from] RegulatorError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of one controller run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Controller that was downloaded.
    pub controller: ControllerKind,
    /// Logical remote calls issued (chunks excluded).
    pub calls: u64,
    /// Items stored.
    pub items: u64,
}

impl DownloadSummary {
    const fn new(controller: ControllerKind) -> Self {
        Self {
            controller,
            calls: 0,
            items: 0,
        }
    }

    const fn record(&mut self, items: u64) {
        self.calls += 1;
        self.items += items;
    }
}

/// Per-site download pipeline.
pub struct Downloader<T: Transport, S: StorageBackend> {
    client: TransferClient<T>,
    store: S,
    site: String,
    observations: ObservationsConfig,
    progress: Arc<dyn ProgressCallback>,
}

impl<T: Transport, S: StorageBackend> std::fmt::Debug for Downloader<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("site", &self.site)
            .field("client", &self.client)
            .field("observations", &self.observations)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, S: StorageBackend> Downloader<T, S> {
    /// Creates the pipeline of `site`.
    #[must_use]
    pub fn new(
        site: &SiteConfig,
        client: TransferClient<T>,
        store: S,
        observations: ObservationsConfig,
    ) -> Self {
        Self {
            client,
            store,
            site: site.name.clone(),
            observations,
            progress: null_progress(),
        }
    }

    /// Reports progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Site short name.
    #[must_use]
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Transfer client of this site.
    #[must_use]
    pub const fn client(&self) -> &TransferClient<T> {
        &self.client
    }

    /// Storage backend of this site.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Fully downloads every controller of `controllers`, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing controller and returns its error.
    pub async fn download_all(
        &self,
        controllers: &[ControllerKind],
    ) -> Result<Vec<DownloadSummary>, DownloadError> {
        let mut summaries = Vec::with_capacity(controllers.len());
        for kind in controllers {
            summaries.push(self.download(*kind).await?);
        }
        Ok(summaries)
    }

    /// Fully downloads one controller.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if a remote call, the regulator or the
    /// storage backend fails.
    pub async fn download(&self, kind: ControllerKind) -> Result<DownloadSummary, DownloadError> {
        let started = Instant::now();
        log::info!("{}: downloading {kind}", self.site);
        self.progress.set_message(format!("{} {kind}", self.site));

        let summary = match kind {
            ControllerKind::Observations => self.download_observations().await?,
            ControllerKind::Species => self.download_species().await?,
            ControllerKind::Fields => self.download_fields().await?,
            _ => self.download_simple(kind).await?,
        };

        log::info!(
            "{}: {kind} done, {} item(s) in {} call(s), {:.1}s",
            self.site,
            summary.items,
            summary.calls,
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    /// Taxonomic groups the account can read.
    async fn accessible_taxo_groups(&self) -> Result<Vec<TaxoGroup>, DownloadError> {
        let groups = self.client.taxo_groups().await?;
        Ok(groups
            .into_iter()
            .filter(|group| {
                let accessible = group.is_accessible();
                if !accessible {
                    log::debug!("{}: no access to taxo group {}", self.site, group.id);
                }
                accessible
            })
            .collect())
    }

    /// Accessible taxonomic groups minus the observation exclusions.
    async fn taxo_groups_in_scope(&self) -> Result<Vec<TaxoGroup>, DownloadError> {
        let groups = self.accessible_taxo_groups().await?;
        Ok(groups
            .into_iter()
            .filter(|group| {
                if self.observations.is_excluded(group) {
                    log::info!(
                        "{}: taxo group {} ({}) excluded",
                        self.site,
                        group.id,
                        group.name
                    );
                    return false;
                }
                true
            })
            .collect())
    }

    /// Stores `document`, appends the audit record of the call that produced
    /// it and advances progress.
    async fn persist(
        &self,
        kind: ControllerKind,
        sequence: &str,
        document: &Value,
        comment: String,
        started: Instant,
    ) -> Result<u64, DownloadError> {
        let items = self.store.store(kind.as_ref(), sequence, document).await?;
        self.audit(kind, comment, items, started).await?;
        self.progress.inc(items);
        Ok(items)
    }

    async fn audit(
        &self,
        kind: ControllerKind,
        comment: String,
        length: u64,
        started: Instant,
    ) -> Result<(), DownloadError> {
        let record = AuditRecord {
            site: self.site.clone(),
            controller: kind.to_string(),
            error_count: self.client.transfer_errors(),
            http_status: self.client.http_status(),
            comment,
            length,
            duration: started.elapsed().as_secs_f64(),
        };
        self.store.log(&record).await?;
        Ok(())
    }
}
