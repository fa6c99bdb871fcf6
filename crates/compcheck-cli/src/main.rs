use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use compcheck_core::{VehicleSpec, DEFAULT_RADIUS, DEFAULT_ZIPCODE};
use compcheck_storage::{connect_pool, run_migrations, PgCompStore, PgInventory};
use compcheck_sync::{maybe_build_scheduler, CompConfig, CompServices, RefreshJob};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "compcheck")]
#[command(about = "Used-vehicle market comp aggregation and refresh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Aggregate comps for one vehicle and print the result as JSON.
    Search {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        make: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        trim: Option<String>,
        #[arg(long, default_value = DEFAULT_ZIPCODE)]
        zipcode: String,
        #[arg(long, default_value_t = DEFAULT_RADIUS)]
        radius: u32,
    },
    /// Refresh stored comps for every inventory vehicle once.
    Refresh,
    /// Run the refresh on the configured cron until interrupted.
    Schedule,
    /// Serve the HTTP API.
    Serve,
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("compcheck=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Flips the stop flag on Ctrl-C so workers finish their current vehicle and exit.
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight vehicles");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn refresh_job(config: &CompConfig) -> Result<RefreshJob> {
    let pool = connect_pool(config.require_database_url()?).await?;
    let services = CompServices::new(config.clone())?;
    Ok(services.refresh_job(
        Arc::new(PgInventory::new(pool.clone())),
        Arc::new(PgCompStore::new(pool)),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = CompConfig::from_env();

    match cli.command {
        Commands::Search {
            year,
            make,
            model,
            trim,
            zipcode,
            radius,
        } => {
            let services = CompServices::new(config)?;
            let spec = VehicleSpec::new(year, make, model)
                .with_trim(trim)
                .with_location(zipcode, radius);
            let aggregation = services.search_aggregator().aggregate(&spec).await;
            println!("{}", serde_json::to_string_pretty(&aggregation)?);
        }
        Commands::Refresh => {
            let job = refresh_job(&config).await?;
            let summary = job.run(stop_on_ctrl_c()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            let config = CompConfig {
                scheduler_enabled: true,
                ..config
            };
            let job = refresh_job(&config).await?;
            let stop = stop_on_ctrl_c();
            let Some(mut sched) = maybe_build_scheduler(&config, job, stop.clone()).await? else {
                return Ok(());
            };
            sched.start().await?;
            info!(cron = %config.refresh_cron, "scheduler running; Ctrl-C to stop");
            let mut stop = stop;
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
            sched.shutdown().await?;
        }
        Commands::Serve => {
            compcheck_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let pool = connect_pool(config.require_database_url()?).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
