use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use compcheck_adapters::{adapter_for_source, SourceAdapter, AUTOTRADER, CARGURUS, CARS_COM};
use compcheck_core::outliers::DEFAULT_TRIM_PERCENT;
use compcheck_core::DEFAULT_RADIUS;
use compcheck_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::aggregate::AggregateOptions;
use crate::refresh::RefreshOptions;

pub const DEFAULT_REFRESH_ZIPCODE: &str = "76502";
pub const DEFAULT_REFRESH_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_REFRESH_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Included in the refresh job's adapter set.
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub refresh_page_size: Option<u32>,
}

impl SourceRegistry {
    /// All three marketplaces for interactive search; Cars.com alone for refresh.
    pub fn builtin() -> Self {
        let source = |id: &str, name: &str, refresh: bool| SourceConfig {
            source_id: id.to_string(),
            display_name: name.to_string(),
            enabled: true,
            refresh,
            page_size: None,
            refresh_page_size: refresh.then_some(DEFAULT_REFRESH_PAGE_SIZE),
        };
        Self {
            sources: vec![
                source(CARS_COM, "Cars.com", true),
                source(CARGURUS, "CarGurus", false),
                source(AUTOTRADER, "Autotrader", false),
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Falls back to [`SourceRegistry::builtin`] when `path` does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "source registry not found; using built-in sources");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Adapters for interactive search, in registry order.
    pub fn search_adapters(&self) -> Vec<Arc<dyn SourceAdapter>> {
        self.build_adapters(|source| source.enabled.then_some(source.page_size))
    }

    pub fn refresh_adapters(&self) -> Vec<Arc<dyn SourceAdapter>> {
        self.build_adapters(|source| {
            (source.enabled && source.refresh).then(|| {
                source
                    .refresh_page_size
                    .or(Some(DEFAULT_REFRESH_PAGE_SIZE))
            })
        })
    }

    /// `select` returns `None` to skip a source, `Some(page_size)` to include it.
    fn build_adapters(
        &self,
        select: impl Fn(&SourceConfig) -> Option<Option<u32>>,
    ) -> Vec<Arc<dyn SourceAdapter>> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in &self.sources {
            let Some(page_size) = select(source) else {
                continue;
            };
            let Some(adapter) = adapter_for_source(&source.source_id) else {
                warn!(source_id = %source.source_id, "no adapter registered; skipping");
                continue;
            };
            let adapter = match page_size {
                Some(size) => adapter.with_page_size(size),
                None => adapter,
            };
            debug!(
                source_id = %source.source_id,
                display_name = %source.display_name,
                page_size = adapter.page_size(),
                "adapter enabled"
            );
            adapters.push(Arc::new(adapter));
        }
        adapters
    }
}

#[derive(Debug, Clone)]
pub struct CompConfig {
    pub database_url: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub workers: usize,
    pub max_attempts: usize,
    pub block_base_delay_secs: u64,
    pub vehicle_delay_secs: u64,
    pub vehicle_jitter_secs: u64,
    pub trim_percent: f64,
    pub refresh_zipcode: String,
    pub artifacts_dir: Option<PathBuf>,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
}

impl Default for CompConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            http_timeout_secs: 30,
            user_agent: None,
            global_concurrency: 8,
            per_domain_concurrency: 1,
            workers: 2,
            max_attempts: 3,
            block_base_delay_secs: 5,
            vehicle_delay_secs: 2,
            vehicle_jitter_secs: 3,
            trim_percent: DEFAULT_TRIM_PERCENT,
            refresh_zipcode: DEFAULT_REFRESH_ZIPCODE.to_string(),
            artifacts_dir: None,
            sources_file: PathBuf::from("sources.yaml"),
            scheduler_enabled: false,
            refresh_cron: DEFAULT_REFRESH_CRON.to_string(),
            web_port: 8000,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable value; using default");
            default
        }),
        None => default,
    }
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl CompConfig {
    /// Reads `COMPS_*` variables; call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            http_timeout_secs: env_parse("COMPS_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            user_agent: env_string("COMPS_USER_AGENT"),
            global_concurrency: env_parse("COMPS_GLOBAL_CONCURRENCY", d.global_concurrency),
            per_domain_concurrency: env_parse(
                "COMPS_PER_DOMAIN_CONCURRENCY",
                d.per_domain_concurrency,
            ),
            workers: env_parse("COMPS_WORKERS", d.workers),
            max_attempts: env_parse("COMPS_MAX_ATTEMPTS", d.max_attempts),
            block_base_delay_secs: env_parse("COMPS_BLOCK_BASE_DELAY_SECS", d.block_base_delay_secs),
            vehicle_delay_secs: env_parse("COMPS_VEHICLE_DELAY_SECS", d.vehicle_delay_secs),
            vehicle_jitter_secs: env_parse("COMPS_VEHICLE_JITTER_SECS", d.vehicle_jitter_secs),
            trim_percent: env_parse("COMPS_TRIM_PERCENT", d.trim_percent),
            refresh_zipcode: env_string("COMPS_REFRESH_ZIPCODE").unwrap_or(d.refresh_zipcode),
            artifacts_dir: env_string("COMPS_ARTIFACTS_DIR").map(PathBuf::from),
            sources_file: env_string("COMPS_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.sources_file),
            scheduler_enabled: env_flag("COMPS_SCHEDULER_ENABLED"),
            refresh_cron: env_string("COMPS_REFRESH_CRON").unwrap_or(d.refresh_cron),
            web_port: env_parse("COMPS_WEB_PORT", d.web_port),
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            global_concurrency: self.global_concurrency,
            per_domain_concurrency: self.per_domain_concurrency,
            ..HttpClientConfig::default()
        }
    }

    pub fn artifact_store(&self) -> Option<ArtifactStore> {
        self.artifacts_dir.clone().map(ArtifactStore::new)
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            trim_percent: self.trim_percent,
            ..AggregateOptions::default()
        }
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions {
            workers: self.workers.max(1),
            backoff: BackoffPolicy::linear(
                self.max_attempts.max(1),
                Duration::from_secs(self.block_base_delay_secs),
            )
            .with_jitter(Duration::from_secs(1)),
            vehicle_delay: Duration::from_secs(self.vehicle_delay_secs),
            vehicle_jitter: Duration::from_secs(self.vehicle_jitter_secs),
            fallback_zipcode: self.refresh_zipcode.clone(),
            radius: DEFAULT_RADIUS,
        }
    }
}
