#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Controller, taxonomy and site configuration types shared by the
//! VisioNature transfer client, the storage backends and the download
//! orchestrator.
//!
//! A "controller" is one remote resource collection (observations, species,
//! places, ...). [`ControllerKind`] is the closed set of controllers the
//! client knows how to talk to, together with the URL segment and the
//! response shape each one uses.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Remote resource collections exposed by the VisioNature API.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControllerKind {
    /// Local entities (associations, partners).
    Entities,
    /// Taxonomic families.
    Families,
    /// Field groups and their possible values.
    Fields,
    /// Communes / municipalities.
    LocalAdminUnits,
    /// Sightings and grouped-sighting forms.
    Observations,
    /// Registered observers.
    Observers,
    /// Named localities.
    Places,
    /// Species of every taxonomic group.
    Species,
    /// Top-level taxonomic groups.
    TaxoGroups,
    /// Departments / counties.
    TerritorialUnits,
    /// Validation rules.
    Validations,
}

/// How the variable-length part of a chunked response is merged into the
/// document accumulated from earlier chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// `data` is a flat array of entity objects.
    List,
    /// `data` is an object holding `sightings` and optional `forms` arrays.
    Sightings,
}

impl ControllerKind {
    /// Every controller, in download order.
    pub const ALL: &[Self] = &[
        Self::Entities,
        Self::Families,
        Self::Fields,
        Self::LocalAdminUnits,
        Self::Observations,
        Self::Observers,
        Self::Places,
        Self::Species,
        Self::TaxoGroups,
        Self::TerritorialUnits,
        Self::Validations,
    ];

    /// URL path segment of this controller, relative to the API root.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Families => "families",
            Self::Fields => "fields",
            Self::LocalAdminUnits => "local_admin_units",
            Self::Observations => "observations",
            Self::Observers => "observers",
            Self::Places => "places",
            Self::Species => "species",
            Self::TaxoGroups => "taxo_groups",
            Self::TerritorialUnits => "territorial_units",
            Self::Validations => "validations",
        }
    }

    /// Response merge strategy used when a request spans several chunks.
    #[must_use]
    pub const fn merge_strategy(self) -> MergeStrategy {
        match self {
            Self::Observations => MergeStrategy::Sightings,
            Self::Entities
            | Self::Families
            | Self::Fields
            | Self::LocalAdminUnits
            | Self::Observers
            | Self::Places
            | Self::Species
            | Self::TaxoGroups
            | Self::TerritorialUnits
            | Self::Validations => MergeStrategy::List,
        }
    }
}

/// Access rights of the current account on a taxonomic group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessMode {
    /// Full read access.
    Full,
    /// Restricted read access.
    Limited,
    /// No access; the group is skipped by every download.
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    NoAccess,
    /// Any mode this client does not know about.
    #[serde(other)]
    Other,
}

/// A top-level taxonomic group (birds, mammals, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxoGroup {
    /// Remote identifier.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Localized display name.
    #[serde(default)]
    pub name: String,
    /// Access rights of the current account.
    pub access_mode: AccessMode,
    /// Language-independent constant name (e.g. `"TAXO_GROUP_BIRD"`).
    #[serde(default)]
    pub name_constant: String,
}

impl TaxoGroup {
    /// Returns `true` unless the account has no access to this group.
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        self.access_mode != AccessMode::NoAccess
    }

    /// Returns `true` if `key` names this group by id, name or constant.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key || self.name_constant == key
    }
}

/// A species entry as returned by the `species` controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Species {
    /// Remote identifier.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Owning taxonomic group.
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id_taxo_group: Option<String>,
    /// `"1"` when the species is currently in use on the site.
    #[serde(default)]
    pub is_used: String,
    /// Latin name.
    #[serde(default)]
    pub latin_name: String,
}

impl Species {
    /// Returns `true` if the species is flagged as currently in use.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        matches!(self.is_used.as_str(), "1" | "true")
    }
}

/// Change classification attached to each diff record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModificationType {
    /// Record was created or modified.
    Updated,
    /// Record was removed.
    Deleted,
    /// Both kinds, used only as a diff request filter.
    All,
}

/// One record of an observations diff response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Identifier of the changed sighting.
    #[serde(deserialize_with = "deserialize_id")]
    pub id_sighting: String,
    /// Raw modification tag; parsed by the orchestrator so unknown tags can
    /// be reported instead of dropped.
    pub modification_type: String,
}

/// Transfer and regulator tuning knobs, shared by all sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Consecutive transient failures tolerated per chunk.
    pub max_retry: u32,
    /// Lifetime request cap for one client; `0` means unlimited.
    pub max_requests: u64,
    /// Chunks accepted for one logical request before giving up.
    pub max_chunks: u32,
    /// Delay in seconds before retrying a transient failure.
    pub retry_delay: u64,
    /// Delay in seconds before retrying a "service unavailable" response.
    pub unavailable_delay: u64,
    /// Capacity of the taxonomic group cache.
    pub lru_maxsize: usize,
    /// PID proportional gain.
    pub pid_kp: f64,
    /// PID integral gain.
    pub pid_ki: f64,
    /// PID derivative gain.
    pub pid_kd: f64,
    /// Target number of observations per search request.
    pub pid_setpoint: f64,
    /// Lower bound of the search window, in days.
    pub pid_limit_min: f64,
    /// Upper bound of the search window, in days.
    pub pid_limit_max: f64,
    /// Initial search window, in days.
    pub pid_delta_days: i64,
    /// Earliest year requested by the search method.
    pub min_year: i32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_retry: 5,
            max_requests: 0,
            max_chunks: 10,
            retry_delay: 5,
            unavailable_delay: 600,
            lru_maxsize: 32,
            pid_kp: 0.0,
            pid_ki: 0.003,
            pid_kd: 0.0,
            pid_setpoint: 10_000.0,
            pid_limit_min: 5.0,
            pid_limit_max: 2_000.0,
            pid_delta_days: 15,
            min_year: 1901,
        }
    }
}

impl Tuning {
    /// [`Self::retry_delay`] as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    /// [`Self::unavailable_delay`] as a [`Duration`].
    #[must_use]
    pub const fn unavailable_delay(&self) -> Duration {
        Duration::from_secs(self.unavailable_delay)
    }
}

/// Everything needed to talk to one remote site. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Short site name used as the storage partition key (e.g. `"tst"`).
    pub name: String,
    /// Base URL of the site, e.g. `https://www.faune-xxx.org/`.
    pub base_url: String,
    /// Account e-mail.
    pub user_email: String,
    /// Account password.
    pub user_pw: String,
    /// API consumer key.
    pub client_key: String,
    /// API consumer secret.
    pub client_secret: String,
    /// Transfer and regulator tuning.
    pub tuning: Tuning,
}

impl SiteConfig {
    /// Root URL of the REST API (`{base_url}api/`).
    #[must_use]
    pub fn api_root(&self) -> String {
        if self.base_url.ends_with('/') {
            format!("{}api/", self.base_url)
        } else {
            format!("{}/api/", self.base_url)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Int(i64),
}

impl From<IdRepr> for String {
    fn from(value: IdRepr) -> Self {
        match value {
            IdRepr::Text(s) => s,
            IdRepr::Int(i) => i.to_string(),
        }
    }
}

/// Remote ids are sent as strings by most controllers and as integers by a
/// few; both are normalized to `String`.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRepr::deserialize(deserializer).map(String::from)
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<IdRepr>::deserialize(deserializer).map(|id| id.map(String::from))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn controller_names_round_trip_through_strum() {
        for kind in ControllerKind::ALL {
            let name = kind.to_string();
            assert_eq!(ControllerKind::from_str(&name).unwrap(), *kind);
            assert_eq!(name, kind.path());
        }
    }

    #[test]
    fn only_observations_merge_sightings() {
        assert_eq!(
            ControllerKind::Observations.merge_strategy(),
            MergeStrategy::Sightings
        );
        assert_eq!(ControllerKind::Species.merge_strategy(), MergeStrategy::List);
        assert_eq!(ControllerKind::Fields.merge_strategy(), MergeStrategy::List);
    }

    #[test]
    fn parses_taxo_group_with_numeric_id() {
        let group: TaxoGroup = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "Oiseaux",
            "access_mode": "full",
            "name_constant": "TAXO_GROUP_BIRD"
        }))
        .unwrap();
        assert_eq!(group.id, "1");
        assert!(group.is_accessible());
        assert!(group.matches("TAXO_GROUP_BIRD"));
        assert!(group.matches("1"));
    }

    #[test]
    fn no_access_group_is_not_accessible() {
        let group: TaxoGroup = serde_json::from_value(serde_json::json!({
            "id": "19",
            "name": "Hidden",
            "access_mode": "none"
        }))
        .unwrap();
        assert_eq!(group.access_mode, AccessMode::NoAccess);
        assert!(!group.is_accessible());
    }

    #[test]
    fn unknown_access_mode_is_kept_accessible() {
        let group: TaxoGroup = serde_json::from_value(serde_json::json!({
            "id": "2",
            "access_mode": "partner"
        }))
        .unwrap();
        assert_eq!(group.access_mode, AccessMode::Other);
        assert!(group.is_accessible());
    }

    #[test]
    fn species_in_use_flag() {
        let used: Species =
            serde_json::from_value(serde_json::json!({"id": "518", "is_used": "1"})).unwrap();
        let unused: Species =
            serde_json::from_value(serde_json::json!({"id": "519", "is_used": "0"})).unwrap();
        assert!(used.is_in_use());
        assert!(!unused.is_in_use());
    }

    #[test]
    fn modification_type_rejects_unknown_tags() {
        assert_eq!(
            ModificationType::from_str("updated").unwrap(),
            ModificationType::Updated
        );
        assert_eq!(
            ModificationType::from_str("deleted").unwrap(),
            ModificationType::Deleted
        );
        assert!(ModificationType::from_str("merged").is_err());
    }

    #[test]
    fn api_root_handles_trailing_slash() {
        let mut site = SiteConfig {
            name: "tst".to_string(),
            base_url: "https://example.org/".to_string(),
            user_email: String::new(),
            user_pw: String::new(),
            client_key: String::new(),
            client_secret: String::new(),
            tuning: Tuning::default(),
        };
        assert_eq!(site.api_root(), "https://example.org/api/");
        site.base_url = "https://example.org".to_string();
        assert_eq!(site.api_root(), "https://example.org/api/");
    }
}
