//! Simple controllers: one list call, one call per taxonomic group
//! (species), or a list followed by per-item details (fields).

use std::time::Instant;

use serde_json::Value;
use vn_sync_api::Transport;
use vn_sync_api_models::ControllerKind;
use vn_sync_store::StorageBackend;

use crate::{DownloadError, DownloadSummary, Downloader};

impl<T: Transport, S: StorageBackend> Downloader<T, S> {
    pub(crate) async fn download_simple(
        &self,
        kind: ControllerKind,
    ) -> Result<DownloadSummary, DownloadError> {
        let mut summary = DownloadSummary::new(kind);

        let started = Instant::now();
        let document = self.client.controller(kind).list(&[]).await?;
        let items = self
            .persist(kind, "1", &document, format!("list {kind}"), started)
            .await?;
        summary.record(items);

        Ok(summary)
    }

    pub(crate) async fn download_species(&self) -> Result<DownloadSummary, DownloadError> {
        let kind = ControllerKind::Species;
        let mut summary = DownloadSummary::new(kind);
        let groups = self.accessible_taxo_groups().await?;

        for group in &groups {
            let started = Instant::now();
            let document = self
                .client
                .controller(kind)
                .list(&[("id_taxo_group", group.id.as_str())])
                .await?;
            let sequence = format!("{}_1", group.id);
            let items = self
                .persist(
                    kind,
                    &sequence,
                    &document,
                    format!("list species of taxo group {}", group.id),
                    started,
                )
                .await?;
            log::debug!("{}: taxo group {} has {items} species", self.site, group.id);
            summary.record(items);
        }

        Ok(summary)
    }

    pub(crate) async fn download_fields(&self) -> Result<DownloadSummary, DownloadError> {
        let kind = ControllerKind::Fields;
        let mut summary = DownloadSummary::new(kind);
        let controller = self.client.controller(kind);

        let started = Instant::now();
        let groups = controller.list(&[]).await?;
        let items = self
            .persist(kind, "1", &groups, "list field groups".to_string(), started)
            .await?;
        summary.record(items);

        for id in field_group_ids(&groups) {
            let started = Instant::now();
            let details = controller.get(&id, &[]).await?;
            let items = self
                .persist(
                    kind,
                    &format!("details_{id}"),
                    &details,
                    format!("field group {id} details"),
                    started,
                )
                .await?;
            summary.record(items);
        }

        Ok(summary)
    }
}

fn field_group_ids(document: &Value) -> Vec<String> {
    document
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|group| match group.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
        .collect()
}
