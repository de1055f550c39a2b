//! Incremental observation update.
//!
//! For each taxonomic group in scope the server-side diff since the group's
//! watermark is replayed: updated sightings are fetched again and stored,
//! deleted ones are removed in one batch. The new watermark is taken before
//! the diff call and written only once the whole group succeeded, so a
//! failure leaves the previous watermark in place and the next run retries
//! the same range.

use std::time::Instant;

use chrono::{DateTime, SubsecRound as _, Utc};
use vn_sync_api::{ApiError, Transport};
use vn_sync_api_models::{ControllerKind, DiffEntry, ModificationType, TaxoGroup};
use vn_sync_store::StorageBackend;

use crate::{DownloadError, DownloadSummary, Downloader};

const KIND: ControllerKind = ControllerKind::Observations;

/// Diff records split by change type, in server order without duplicates.
#[derive(Debug, Default, PartialEq, Eq)]
struct Changes {
    updated: Vec<String>,
    deleted: Vec<String>,
}

fn classify(entries: &[DiffEntry]) -> Result<Changes, ApiError> {
    let mut changes = Changes::default();
    for entry in entries {
        let target = match entry.modification_type.parse::<ModificationType>() {
            Ok(ModificationType::Updated) => &mut changes.updated,
            Ok(ModificationType::Deleted) => &mut changes.deleted,
            Ok(ModificationType::All) | Err(_) => {
                return Err(ApiError::NotImplemented(format!(
                    "modification type '{}' for sighting {}",
                    entry.modification_type, entry.id_sighting
                )));
            }
        };
        if !target.contains(&entry.id_sighting) {
            target.push(entry.id_sighting.clone());
        }
    }
    Ok(changes)
}

impl<T: Transport, S: StorageBackend> Downloader<T, S> {
    /// Applies the changes made on the server since each group's watermark,
    /// or since `since` for every group when given.
    ///
    /// Groups without a watermark are skipped when `since` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on the first failing group. Its watermark is
    /// left untouched.
    pub async fn update(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<DownloadSummary, DownloadError> {
        let mut summary = DownloadSummary::new(KIND);
        self.progress
            .set_message(format!("{} observations update", self.site));

        for group in &self.taxo_groups_in_scope().await? {
            self.update_group(group, since, &mut summary).await?;
        }

        log::info!(
            "{}: update done, {} item(s) in {} call(s)",
            self.site,
            summary.items,
            summary.calls
        );
        Ok(summary)
    }

    async fn update_group(
        &self,
        group: &TaxoGroup,
        since: Option<DateTime<Utc>>,
        summary: &mut DownloadSummary,
    ) -> Result<(), DownloadError> {
        let watermark = match since {
            Some(since) => Some(since),
            None => self.store.increment_get(&self.site, &group.id).await?,
        };
        let Some(watermark) = watermark else {
            log::warn!(
                "{}: taxo group {} has no watermark, run a full download first",
                self.site,
                group.id
            );
            return Ok(());
        };

        let next_watermark = Utc::now().trunc_subsecs(0);
        let api = self.client.observations();

        let started = Instant::now();
        let entries = api.diff(&group.id, watermark, ModificationType::All).await?;
        self.audit(
            KIND,
            format!("diff taxo group {} since {watermark}", group.id),
            entries.len() as u64,
            started,
        )
        .await?;
        summary.calls += 1;

        let changes = classify(&entries)?;
        log::info!(
            "{}: taxo group {}: {} updated, {} deleted since {watermark}",
            self.site,
            group.id,
            changes.updated.len(),
            changes.deleted.len()
        );

        for id in &changes.updated {
            let started = Instant::now();
            let document = api.get(id, self.observations.short_version).await?;
            let items = self
                .persist(KIND, id, &document, format!("update sighting {id}"), started)
                .await?;
            summary.record(items);
        }

        if !changes.deleted.is_empty() {
            let deleted = self.store.delete_obs(&changes.deleted).await?;
            log::debug!(
                "{}: taxo group {}: removed {deleted} sighting(s)",
                self.site,
                group.id
            );
        }

        self.store
            .increment_log(&self.site, &group.id, next_watermark)
            .await?;
        Ok(())
    }
}
