//! HTTP fetch utilities, debug page storage and comp persistence for compcheck.

pub mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;
pub use store::{
    connect_pool, run_migrations, CompStore, InventorySource, MemoryCompStore, MemoryInventory,
    PgCompStore, PgInventory, StoreError,
};

pub const CRATE_NAME: &str = "compcheck-storage";

pub const BROWSER_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 10; SM-G975F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Mobile Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed dump of marketplace pages that parsed to zero cards.
/// Selector drift shows up here first.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(source_id)
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.html"))
    }

    /// Writes through a temp file + rename so readers never see a partial page.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        body: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = body.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating page directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking page path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp page {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(stored(false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffGrowth {
    /// `base * (attempt_index + 1)`
    Linear,
    /// `base * 2^attempt_index`
    Exponential,
}

/// Retry schedule shared by the HTTP fetcher and the refresh job.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub growth: BackoffGrowth,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            growth: BackoffGrowth::Exponential,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_retries: max_attempts.saturating_sub(1),
            base_delay,
            max_delay: base_delay.saturating_mul(max_attempts.max(1) as u32),
            growth: BackoffGrowth::Linear,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = match self.growth {
            BackoffGrowth::Linear => u32::try_from(attempt_index + 1).unwrap_or(u32::MAX),
            BackoffGrowth::Exponential => 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX),
        };
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        self.delay_for_attempt(attempt_index) + random_jitter(self.jitter)
    }
}

/// Uniform extra delay in `0..=max`.
pub fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Fixed user agent; when unset one of [`BROWSER_USER_AGENTS`] is picked per request.
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_domain_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: Option<String>,
    global_limit: Arc<Semaphore>,
    per_domain_limit: usize,
    per_domain: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    /// Error pages still carry a body worth scanning for challenge text.
    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { body, .. } => Some(body),
            FetchError::Request(_) => None,
        }
    }
}

pub fn domain_of(url: &Url) -> String {
    url.host_str().unwrap_or("unknown-host").to_ascii_lowercase()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_domain_limit: config.per_domain_concurrency.max(1),
            per_domain: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.per_domain.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit)))
            .clone()
    }

    pub fn browser_headers(&self, url: &Url) -> HeaderMap {
        let user_agent = self
            .user_agent
            .as_deref()
            .or_else(|| BROWSER_USER_AGENTS.choose(&mut rand::thread_rng()).copied())
            .unwrap_or(BROWSER_USER_AGENTS[0]);

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        if let Ok(value) = HeaderValue::from_str(&format!("{}://{}/", url.scheme(), domain_of(url))) {
            headers.insert(REFERER, value);
        }
        headers
    }

    /// GET `url` as text. Transient failures (timeouts, 429, 5xx) are retried
    /// with the configured backoff while holding the per-domain permit.
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        let domain = domain_of(url);
        let span = info_span!("http_fetch", %run_id, source_id, %domain, url = %url);
        self.fetch_with_retries(&domain, url).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        domain: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        // Domain permit first: a request queued behind a slow host must not hold
        // a global slot that another host could use.
        let per_domain = self.per_domain_semaphore(domain).await;
        let _domain = per_domain.acquire().await.expect("semaphore not closed");
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            let last_attempt = attempt >= self.backoff.max_retries;
            let resp_result = self
                .client
                .get(url.clone())
                .headers(self.browser_headers(url))
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    debug!(status = status.as_u16(), attempt, "response received");

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && !last_attempt {
                        warn!(status = status.as_u16(), attempt, "retryable status");
                        tokio::time::sleep(self.backoff.jittered_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && !last_attempt {
                        warn!(attempt, error = %err, "retryable request error");
                        tokio::time::sleep(self.backoff.jittered_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
