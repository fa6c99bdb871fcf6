//! Comp aggregation and refresh orchestration: configuration, the source
//! registry, the [`Aggregator`] and the batch [`RefreshJob`].

pub mod aggregate;
pub mod config;
pub mod refresh;

use std::sync::Arc;

use anyhow::{Context, Result};
use compcheck_adapters::AdapterContext;
use compcheck_storage::{CompStore, HttpFetcher, InventorySource};
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub use aggregate::{aggregate_comps, AggregateOptions, Aggregation, Aggregator};
pub use config::{CompConfig, SourceConfig, SourceRegistry};
pub use refresh::{RefreshJob, RefreshOptions, RefreshSummary, VehicleOutcome, VehicleState};

pub const CRATE_NAME: &str = "compcheck-sync";

/// Shared HTTP client and source registry built once per process.
#[derive(Debug, Clone)]
pub struct CompServices {
    pub config: CompConfig,
    pub registry: SourceRegistry,
    pub http: Arc<HttpFetcher>,
}

impl CompServices {
    pub fn new(config: CompConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        Ok(Self {
            config,
            registry,
            http,
        })
    }

    fn context(&self) -> AdapterContext {
        AdapterContext::new(self.http.clone(), self.config.artifact_store())
    }

    pub fn search_aggregator(&self) -> Aggregator {
        Aggregator::new(
            self.registry.search_adapters(),
            self.context(),
            self.config.aggregate_options(),
        )
    }

    pub fn refresh_aggregator(&self) -> Aggregator {
        Aggregator::new(
            self.registry.refresh_adapters(),
            self.context(),
            self.config.aggregate_options(),
        )
    }

    pub fn refresh_job(
        &self,
        inventory: Arc<dyn InventorySource>,
        store: Arc<dyn CompStore>,
    ) -> RefreshJob {
        RefreshJob::new(
            Arc::new(self.refresh_aggregator()),
            inventory,
            store,
            self.config.refresh_options(),
        )
    }
}

/// Registers the refresh job on `config.refresh_cron` when the scheduler is
/// enabled. The caller starts and owns the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &CompConfig,
    job: RefreshJob,
    stop: watch::Receiver<bool>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.as_str();
    let scheduled = Job::new_async(cron, move |_uuid, _l| {
        let job = job.clone();
        let stop = stop.clone();
        Box::pin(async move {
            info!("scheduled refresh triggered");
            if let Err(err) = job.run(stop).await {
                error!(error = %err, "scheduled refresh failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    info!(cron, "refresh scheduled");
    Ok(Some(sched))
}
