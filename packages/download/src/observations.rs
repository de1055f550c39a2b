//! Full observation download.
//!
//! The list method issues one call per taxonomic group, or per species of
//! the group with `by_specie`. The search method walks each group backward
//! from the end date to the floor date, one search per window, and lets a
//! PID regulator resize the window so that each search returns about
//! `pid_setpoint` observations.

use std::time::Instant;

use chrono::{Days, NaiveDate, Utc};
use vn_sync_api::{SearchWindow, Transport};
use vn_sync_api_models::{ControllerKind, Species, TaxoGroup};
use vn_sync_config::{ConfigError, ObservationsMethod};
use vn_sync_regulator::Pid;
use vn_sync_store::StorageBackend;

use crate::{DownloadError, DownloadSummary, Downloader};

const KIND: ControllerKind = ControllerKind::Observations;

impl<T: Transport, S: StorageBackend> Downloader<T, S> {
    pub(crate) async fn download_observations(&self) -> Result<DownloadSummary, DownloadError> {
        let mut summary = DownloadSummary::new(KIND);
        let groups = self.taxo_groups_in_scope().await?;
        log::info!(
            "{}: observations by {} over {} taxo group(s)",
            self.site,
            self.observations.method,
            groups.len()
        );

        for group in &groups {
            match self.observations.method {
                ObservationsMethod::List => self.list_group(group, &mut summary).await?,
                ObservationsMethod::Search => self.search_group(group, &mut summary).await?,
            }
        }

        Ok(summary)
    }

    async fn list_group(
        &self,
        group: &TaxoGroup,
        summary: &mut DownloadSummary,
    ) -> Result<(), DownloadError> {
        let short_version = self.observations.short_version;
        let api = self.client.observations();

        if !self.observations.by_specie {
            let started = Instant::now();
            let document = api.list_taxo(&group.id, None, short_version).await?;
            let items = self
                .persist(
                    KIND,
                    &format!("{}_1", group.id),
                    &document,
                    format!("list taxo group {}", group.id),
                    started,
                )
                .await?;
            summary.record(items);
            return Ok(());
        }

        for species in self.species_in_use(group).await? {
            let started = Instant::now();
            let document = api
                .list_taxo(&group.id, Some(&species.id), short_version)
                .await?;
            let items = self
                .persist(
                    KIND,
                    &format!("{}_{}", group.id, species.id),
                    &document,
                    format!("list taxo group {} species {}", group.id, species.id),
                    started,
                )
                .await?;
            summary.record(items);
        }

        Ok(())
    }

    async fn species_in_use(&self, group: &TaxoGroup) -> Result<Vec<Species>, DownloadError> {
        let document = self
            .client
            .controller(ControllerKind::Species)
            .list(&[("id_taxo_group", group.id.as_str())])
            .await?;
        let species: Vec<Species> = serde_json::from_value(
            document
                .get("data")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        )
        .map_err(vn_sync_api::ApiError::from)?;

        let in_use: Vec<Species> = species.into_iter().filter(Species::is_in_use).collect();
        log::debug!(
            "{}: taxo group {} has {} species in use",
            self.site,
            group.id,
            in_use.len()
        );
        Ok(in_use)
    }

    async fn search_group(
        &self,
        group: &TaxoGroup,
        summary: &mut DownloadSummary,
    ) -> Result<(), DownloadError> {
        let tuning = self.client.tuning();
        let mut pid = Pid::new(
            tuning.pid_kp,
            tuning.pid_ki,
            tuning.pid_kd,
            tuning.pid_setpoint,
            (tuning.pid_limit_min, tuning.pid_limit_max),
        )?;

        let floor = self.floor_date()?;
        let mut end = self
            .observations
            .end_date
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut delta_days = u64::try_from(tuning.pid_delta_days.max(1)).unwrap_or(1);
        let mut seq: u64 = 0;
        let api = self.client.observations();

        while end >= floor {
            let start = end
                .checked_sub_days(Days::new(delta_days.saturating_sub(1)))
                .map_or(floor, |start| start.max(floor));
            seq += 1;

            let window = SearchWindow { start, end };
            let started = Instant::now();
            let document = api
                .search(&window.query(&group.id), self.observations.short_version)
                .await?;
            let items = self
                .persist(
                    KIND,
                    &format!("{}_{seq}", group.id),
                    &document,
                    format!("search taxo group {} from {start} to {end}", group.id),
                    started,
                )
                .await?;
            summary.record(items);

            delta_days = window_days(pid.compute(count_as_f64(items)));
            log::debug!(
                "{}: taxo group {} window {start}..{end} -> {items} observation(s), next window {delta_days} day(s)",
                self.site,
                group.id
            );

            let Some(next_end) = start.pred_opt() else {
                break;
            };
            end = next_end;
        }

        Ok(())
    }

    /// Earliest day the search method may request.
    fn floor_date(&self) -> Result<NaiveDate, DownloadError> {
        let min_year = self.client.tuning().min_year;
        let year_floor =
            NaiveDate::from_ymd_opt(min_year, 1, 1).ok_or_else(|| ConfigError::Invalid {
                message: format!("min_year {min_year} is out of range"),
            })?;
        Ok(self
            .observations
            .start_date
            .map_or(year_floor, |start| start.max(year_floor)))
    }
}

#[allow(clippy::cast_precision_loss)]
const fn count_as_f64(items: u64) -> f64 {
    items as f64
}

/// Whole days of the next window, at least one.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn window_days(output: f64) -> u64 {
    if output.is_finite() && output >= 1.0 {
        output.floor() as u64
    } else {
        1
    }
}
