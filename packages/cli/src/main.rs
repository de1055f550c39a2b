#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the VisioNature synchronization tool.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::MultiProgress;
use vn_sync_api::{ReqwestTransport, TransferClient, UserCredentials};
use vn_sync_api_models::{ControllerKind, SiteConfig};
use vn_sync_config::{Config, DEFAULT_CONFIG_FILE};
use vn_sync_download::{DownloadSummary, Downloader, ProgressCallback};
use vn_sync_store::{FileStore, PostgresStore, StorageBackend};

use crate::progress::{IndicatifProgress, init_logger};

#[derive(Parser)]
#[command(name = "vn_sync", about = "VisioNature (Biolovision) data synchronization")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Storage backend
    #[arg(long, value_enum, default_value_t = StoreKind::File)]
    store: StoreKind,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Gzip JSON files under `main.file_store/<site>`
    File,
    /// Postgres at `main.db_url` or `DATABASE_URL`
    Postgres,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every enabled controller of every enabled site
    Full {
        /// Comma-separated controllers to download instead of the enabled ones
        #[arg(long, value_delimiter = ',')]
        controllers: Vec<ControllerKind>,
    },
    /// Apply observation changes since the last run
    Update {
        /// Replay changes since this RFC 3339 timestamp instead of the stored
        /// watermarks
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// List controllers and whether they are enabled
    Controllers,
    /// Create the Postgres schema
    InitDb,
    /// Print the parsed configuration
    ShowConfig,
}

/// What to run against each site.
#[derive(Debug, Clone)]
enum Action {
    Full(Vec<ControllerKind>),
    Update(Option<DateTime<Utc>>),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = init_logger();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let action = match cli.command {
        Commands::Controllers => {
            println!("{:<20} ENABLED", "CONTROLLER");
            println!("{}", "-".repeat(30));
            for kind in ControllerKind::ALL {
                println!("{:<20} {}", kind.to_string(), config.is_enabled(*kind));
            }
            return Ok(());
        }
        Commands::ShowConfig => {
            show_config(&config);
            return Ok(());
        }
        Commands::InitDb => {
            let url = config
                .main
                .db_url()
                .ok_or("no database URL: set main.db_url or DATABASE_URL")?;
            let store = PostgresStore::connect(&url, "").await?;
            store.ensure_schema().await?;
            log::info!("Schema created");
            return Ok(());
        }
        Commands::Full { controllers } => {
            let controllers = if controllers.is_empty() {
                config.enabled_controllers()
            } else {
                controllers
            };
            Action::Full(controllers)
        }
        Commands::Update { since } => Action::Update(since),
    };

    let sites = config.site_configs();
    if sites.is_empty() {
        log::warn!("No enabled site in {}", cli.config.display());
        return Ok(());
    }

    let start = Instant::now();
    let mut failed = 0_usize;

    for site in &sites {
        let result = match cli.store {
            StoreKind::File => {
                let store = FileStore::new(config.main.file_store.join(&site.name));
                run_site(site, &config, store, &action, &multi).await
            }
            StoreKind::Postgres => match config.main.db_url() {
                Some(url) => match PostgresStore::connect(&url, &site.name).await {
                    Ok(store) => run_site(site, &config, store, &action, &multi).await,
                    Err(e) => Err(e),
                },
                None => Err("no database URL: set main.db_url or DATABASE_URL".into()),
            },
        };

        if let Err(e) = result {
            failed += 1;
            log::error!("{}: {e}", site.name);
        }
    }

    log::info!(
        "{} site(s) processed, {failed} failed, in {:.1}s",
        sites.len(),
        start.elapsed().as_secs_f64()
    );

    if failed > 0 {
        return Err(format!("{failed} site(s) failed").into());
    }
    Ok(())
}

async fn run_site<S: StorageBackend>(
    site: &SiteConfig,
    config: &Config,
    store: S,
    action: &Action,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = ReqwestTransport::new(site)?;
    let client = TransferClient::new(
        transport,
        UserCredentials::from_site(site),
        site.tuning.clone(),
    );
    let progress: Arc<dyn ProgressCallback> = IndicatifProgress::items_bar(multi, &site.name);
    let downloader = Downloader::new(site, client, store, config.observations.clone())
        .with_progress(Arc::clone(&progress));

    let summaries: Vec<DownloadSummary> = match action {
        Action::Full(controllers) => downloader.download_all(controllers).await?,
        Action::Update(since) => vec![downloader.update(*since).await?],
    };

    let items: u64 = summaries.iter().map(|s| s.items).sum();
    for summary in &summaries {
        log::info!(
            "{}: {} {} item(s) in {} call(s)",
            site.name,
            summary.controller,
            summary.items,
            summary.calls
        );
    }
    progress.finish(format!(
        "{}: {items} item(s), {} request(s)",
        site.name,
        downloader.client().nb_requests()
    ));
    Ok(())
}

fn show_config(config: &Config) {
    println!("file_store: {}", config.main.file_store.display());
    println!(
        "database:   {}",
        if config.main.db_url().is_some() {
            "configured"
        } else {
            "not configured"
        }
    );
    println!();

    println!("{:<10} {:<8} {:<40} USER", "SITE", "ENABLED", "URL");
    println!("{}", "-".repeat(80));
    for (name, site) in &config.site {
        println!(
            "{name:<10} {:<8} {:<40} {}",
            site.enabled, site.site, site.user_email
        );
    }
    println!();

    let enabled: Vec<String> = config
        .enabled_controllers()
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("controllers:  {}", enabled.join(", "));
    println!(
        "observations: method={} by_specie={} short_version={} exclude=[{}]",
        config.observations.method,
        config.observations.by_specie,
        config.observations.short_version,
        config.observations.taxo_exclude.join(", ")
    );
    println!();
    println!("{:#?}", config.tuning);
}
