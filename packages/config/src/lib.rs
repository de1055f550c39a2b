#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! TOML configuration.
//!
//! One file describes every site to synchronize, the shared transfer and
//! regulator tuning, which controllers to download and how observations are
//! walked. It is parsed and validated once by [`Config::load`] and treated as
//! immutable afterwards.
//!
//! ```toml
//! [main]
//! file_store = "data"
//!
//! [controllers.observations]
//! enabled = true
//!
//! [observations]
//! method = "search"
//! taxo_exclude = ["TAXO_GROUP_ALIEN"]
//!
//! [site.tst]
//! site = "https://www.faune-test.org/"
//! user_email = "me@example.org"
//! user_pw = "secret"
//! client_key = "key"
//! client_secret = "secret"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;

use chrono::NaiveDate;
use serde::Deserialize;
use vn_sync_api_models::{ControllerKind, SiteConfig, TaxoGroup, Tuning};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "vn_sync.toml";

/// Environment variable consulted when `main.db_url` is not set.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Errors raised while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or does not match the expected shape.
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// The file parsed but its content is inconsistent.
    #[error("invalid config: {message}")]
    Invalid {
        /// What is wrong.
        message: String,
    },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// `[main]`: where results go.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// Directory of the file storage backend.
    pub file_store: PathBuf,
    /// Postgres connection URL. Falls back to `DATABASE_URL`.
    pub db_url: Option<String>,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            file_store: PathBuf::from("vn_sync_data"),
            db_url: None,
        }
    }
}

impl MainConfig {
    /// Postgres URL from the file or the environment.
    #[must_use]
    pub fn db_url(&self) -> Option<String> {
        self.db_url
            .clone()
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok())
            .filter(|url| !url.is_empty())
    }
}

/// `[controllers.<name>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ControllerConfig {
    /// Whether the controller is downloaded by `full`.
    #[serde(default)]
    pub enabled: bool,
}

/// How the full observation download walks the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObservationsMethod {
    /// One list call per taxonomic group, or per species with `by_specie`.
    List,
    /// Backward walk over date windows sized by the regulator.
    #[default]
    Search,
}

/// `[observations]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObservationsConfig {
    /// Full download method.
    pub method: ObservationsMethod,
    /// With the list method, issue one call per species.
    pub by_specie: bool,
    /// Taxonomic groups (id, name or constant) never downloaded.
    pub taxo_exclude: Vec<String>,
    /// Ask the server for the abridged observation format.
    pub short_version: bool,
    /// Earliest day requested by the search method (`"YYYY-MM-DD"`).
    pub start_date: Option<NaiveDate>,
    /// Latest day requested by the search method; defaults to today.
    pub end_date: Option<NaiveDate>,
}

impl ObservationsConfig {
    /// Returns `true` if `group` is listed in `taxo_exclude`.
    #[must_use]
    pub fn is_excluded(&self, group: &TaxoGroup) -> bool {
        self.taxo_exclude.iter().any(|key| group.matches(key))
    }
}

/// `[site.<name>]`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SiteSection {
    /// Whether this site is processed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the site.
    pub site: String,
    /// Account e-mail.
    pub user_email: String,
    /// Account password.
    pub user_pw: String,
    /// API consumer key.
    #[serde(default)]
    pub client_key: String,
    /// API consumer secret.
    #[serde(default)]
    pub client_secret: String,
}

impl std::fmt::Debug for SiteSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteSection")
            .field("enabled", &self.enabled)
            .field("site", &self.site)
            .field("user_email", &self.user_email)
            .finish_non_exhaustive()
    }
}

const fn default_true() -> bool {
    true
}

// ── Top level ────────────────────────────────────────────────────────────

/// The whole configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `[main]`.
    pub main: MainConfig,
    /// `[tuning]`, shared by every site.
    pub tuning: Tuning,
    /// `[controllers.<name>]`.
    pub controllers: BTreeMap<String, ControllerConfig>,
    /// `[observations]`.
    pub observations: ObservationsConfig,
    /// `[site.<name>]`.
    pub site: BTreeMap<String, SiteSection>,
}

impl Config {
    /// Reads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        log::debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document cannot be parsed or
    /// validated.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for name in self.controllers.keys() {
            if ControllerKind::from_str(name).is_err() {
                return Err(ConfigError::invalid(format!("unknown controller '{name}'")));
            }
        }

        for (name, site) in &self.site {
            if site.site.trim().is_empty() {
                return Err(ConfigError::invalid(format!("site '{name}' has no URL")));
            }
        }

        let tuning = &self.tuning;
        if !tuning.pid_limit_min.is_finite() || !tuning.pid_limit_max.is_finite() {
            return Err(ConfigError::invalid(format!(
                "pid limits must be finite, got min {} and max {}",
                tuning.pid_limit_min, tuning.pid_limit_max
            )));
        }
        if tuning.pid_limit_max < tuning.pid_limit_min {
            return Err(ConfigError::invalid(format!(
                "pid_limit_max ({}) is lower than pid_limit_min ({})",
                tuning.pid_limit_max, tuning.pid_limit_min
            )));
        }
        if tuning.pid_delta_days < 1 {
            return Err(ConfigError::invalid("pid_delta_days must be at least 1"));
        }
        if tuning.max_chunks == 0 {
            return Err(ConfigError::invalid("max_chunks must be at least 1"));
        }
        if NaiveDate::from_ymd_opt(tuning.min_year, 1, 1).is_none() {
            return Err(ConfigError::invalid(format!(
                "min_year {} is out of range",
                tuning.min_year
            )));
        }

        if let (Some(start), Some(end)) =
            (self.observations.start_date, self.observations.end_date)
            && end < start
        {
            return Err(ConfigError::invalid(format!(
                "observations end_date {end} is before start_date {start}"
            )));
        }

        Ok(())
    }

    /// Returns `true` if `kind` has an enabled `[controllers.<name>]`
    /// section. Controllers without a section are disabled.
    #[must_use]
    pub fn is_enabled(&self, kind: ControllerKind) -> bool {
        self.controllers
            .get(kind.as_ref())
            .is_some_and(|c| c.enabled)
    }

    /// Enabled controllers, in download order.
    #[must_use]
    pub fn enabled_controllers(&self) -> Vec<ControllerKind> {
        ControllerKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    /// One immutable [`SiteConfig`] per enabled site, in name order.
    #[must_use]
    pub fn site_configs(&self) -> Vec<SiteConfig> {
        self.site
            .iter()
            .filter(|(_, site)| site.enabled)
            .map(|(name, site)| SiteConfig {
                name: name.clone(),
                base_url: site.site.clone(),
                user_email: site.user_email.clone(),
                user_pw: site.user_pw.clone(),
                client_key: site.client_key.clone(),
                client_secret: site.client_secret.clone(),
                tuning: self.tuning.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use vn_sync_api_models::AccessMode;

    use super::*;

    const SAMPLE: &str = r#"
[main]
file_store = "/tmp/vn"

[tuning]
max_retry = 2
pid_setpoint = 5000

[controllers.observations]
enabled = true

[controllers.species]
enabled = true

[controllers.places]
enabled = false

[observations]
method = "list"
by_specie = true
taxo_exclude = ["TAXO_GROUP_ALIEN", "3"]
start_date = "2015-01-01"

[site.tst]
site = "https://www.faune-test.org/"
user_email = "me@example.org"
user_pw = "pw"
client_key = "k"
client_secret = "s"

[site.off]
enabled = false
site = "https://www.faune-off.org/"
user_email = "x"
user_pw = "y"
"#;

    #[test]
    fn parses_sample() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.main.file_store, PathBuf::from("/tmp/vn"));
        assert_eq!(config.tuning.max_retry, 2);
        assert!((config.tuning.pid_setpoint - 5000.0).abs() < f64::EPSILON);
        // Untouched knobs keep their defaults.
        assert_eq!(config.tuning.max_chunks, 10);
        assert_eq!(config.observations.method, ObservationsMethod::List);
        assert!(config.observations.by_specie);
        assert_eq!(
            config.observations.start_date,
            NaiveDate::from_ymd_opt(2015, 1, 1)
        );
    }

    #[test]
    fn enabled_controllers_follow_sections() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(
            config.enabled_controllers(),
            vec![ControllerKind::Observations, ControllerKind::Species]
        );
        assert!(!config.is_enabled(ControllerKind::Places));
        assert!(!config.is_enabled(ControllerKind::Fields));
    }

    #[test]
    fn site_configs_skip_disabled_sites_and_share_tuning() {
        let config = Config::parse(SAMPLE).unwrap();
        let sites = config.site_configs();

        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].name, "tst");
        assert_eq!(sites[0].api_root(), "https://www.faune-test.org/api/");
        assert_eq!(sites[0].tuning.max_retry, 2);
    }

    #[test]
    fn unknown_controller_is_rejected() {
        let err = Config::parse("[controllers.birds]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn inverted_pid_limits_are_rejected() {
        let err =
            Config::parse("[tuning]\npid_limit_min = 10.0\npid_limit_max = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn non_finite_pid_limits_are_rejected() {
        let err = Config::parse("[tuning]\npid_limit_min = nan\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = Config::parse("[tuning]\npid_limit_max = inf\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn inverted_observation_dates_are_rejected() {
        let err = Config::parse(
            "[observations]\nstart_date = \"2020-01-01\"\nend_date = \"2019-01-01\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.tuning, Tuning::default());
        assert_eq!(config.observations.method, ObservationsMethod::Search);
        assert!(config.site_configs().is_empty());
    }

    #[test]
    fn exclusion_matches_name_id_or_constant() {
        let config = Config::parse(SAMPLE).unwrap();
        let group = |id: &str, constant: &str| TaxoGroup {
            id: id.to_string(),
            name: "n".to_string(),
            access_mode: AccessMode::Full,
            name_constant: constant.to_string(),
        };

        assert!(config.observations.is_excluded(&group("9", "TAXO_GROUP_ALIEN")));
        assert!(config.observations.is_excluded(&group("3", "TAXO_GROUP_X")));
        assert!(!config.observations.is_excluded(&group("1", "TAXO_GROUP_BIRD")));
    }

    #[test]
    fn site_debug_hides_password() {
        let config = Config::parse(SAMPLE).unwrap();
        let debug = format!("{:?}", config.site["tst"]);
        assert!(!debug.contains("\"pw\""));
    }
}
