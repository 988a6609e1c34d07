use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vtrend_core::DuplicatePolicy;
use vtrend_storage::{VideoStore, DEFAULT_TOP_CHANNELS};
use vtrend_sync::{AppConfig, ExportOutcome, ParamsUpdate, StdoutLog, TrendService};

#[derive(Debug, Parser)]
#[command(name = "vtrend-cli")]
#[command(about = "Collect trending YouTube videos into a local database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, clap::Args)]
struct ParamsArgs {
    /// Region code or country name (US, Canada, ...).
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    max_results: Option<u32>,
    /// skip, overwrite or ignore.
    #[arg(long)]
    policy: Option<DuplicatePolicy>,
    /// Use this key instead of the saved one.
    #[arg(long)]
    api_key: Option<String>,
}

impl From<ParamsArgs> for ParamsUpdate {
    fn from(args: ParamsArgs) -> Self {
        Self {
            api_key: args.api_key,
            country: args.country,
            max_results: args.max_results,
            policy: args.policy,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one acquisition cycle.
    Scrape(ParamsArgs),
    /// Run a cycle every N minutes until interrupted.
    Watch {
        #[arg(long)]
        every: u32,
        #[command(flatten)]
        params: ParamsArgs,
    },
    /// Write every stored row to a CSV file.
    Export { path: PathBuf },
    List,
    Stats {
        kind: StatsKind,
        #[arg(long, default_value_t = DEFAULT_TOP_CHANNELS)]
        limit: u32,
    },
    /// Encrypt and store the API key for later runs.
    SaveKey { key: String },
    Migrate,
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatsKind {
    TopChannels,
    Countries,
    ViewsByDate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

async fn open_service(config: &AppConfig) -> Result<TrendService> {
    TrendService::from_config_with_log(config, Arc::new(StdoutLog)).await
}

async fn open_store(config: &AppConfig) -> Result<VideoStore> {
    VideoStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape(ParamsArgs::default())) {
        Commands::Scrape(params) => {
            let service = open_service(&config).await?;
            service.update_params(params.into());
            let result = service.start_scraping().await;
            service.shutdown().await?;
            let report = result?;
            println!(
                "scrape complete: run_id={} country={} fetched={} outcomes={:?}",
                report.run_id, report.country, report.fetched, report.outcomes
            );
        }
        Commands::Watch { every, params } => {
            let service = open_service(&config).await?;
            service.update_params(params.into());
            let entry = service.schedule_every(every).await?;
            println!("next run at {}; press Ctrl-C to stop", entry.next_fire_time);
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            service.shutdown().await?;
        }
        Commands::Export { path } => {
            let store = open_store(&config).await?;
            match vtrend_sync::export_to_csv(&store, &path).await? {
                ExportOutcome::NoData => println!("No data available to export."),
                ExportOutcome::Written { path, rows } => {
                    println!("Data exported to {} ({rows} rows)", path.display())
                }
            }
        }
        Commands::List => {
            let store = open_store(&config).await?;
            for row in store.all_rows().await? {
                let r = &row.record;
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    row.row_id,
                    r.country,
                    r.published_at,
                    r.channel_title,
                    r.view_count,
                    r.like_count,
                    r.title,
                    row.watch_url()
                );
            }
        }
        Commands::Stats { kind, limit } => {
            let store = open_store(&config).await?;
            match kind {
                StatsKind::TopChannels => {
                    for row in store.top_channels_by_views(limit).await? {
                        println!("{}\t{}", row.channel_title, row.total_views);
                    }
                }
                StatsKind::Countries => {
                    for row in store.counts_by_country().await? {
                        println!("{}\t{}", row.country, row.video_count);
                    }
                }
                StatsKind::ViewsByDate => {
                    for row in store.views_by_publish_date().await? {
                        println!("{}\t{}", row.date, row.total_views);
                    }
                }
            }
        }
        Commands::SaveKey { key } => {
            config
                .credential_store()
                .save_api_key(&key)
                .await
                .context("saving API key")?;
            println!("API Key saved and encrypted successfully!");
        }
        Commands::Migrate => {
            open_store(&config).await?;
            info!(path = %config.database_path.display(), "schema is up to date");
        }
        Commands::Serve => {
            vtrend_web::serve_from_env().await?;
        }
    }

    Ok(())
}
