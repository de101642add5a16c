//! Store collaborator + HTTP fetch utilities for Tenderscope.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tenderscope_core::Tender;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "tenderscope-storage";

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Blocking-per-call GET client with bounded retries. Source feeds are polled
/// sequentially within a run, so there is no concurrency limiting here; each
/// request carries its own timeout.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            debug!(url, attempt, "http fetch");
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tender {0} already exists")]
    AlreadyExists(String),
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// True when any field an adapter can produce differs between the two
/// records. Enrichment fields are excluded: they are attached out of band and
/// an adapter re-fetch that lacks them must not count as a change.
pub fn tracked_fields_differ(stored: &Tender, incoming: &Tender) -> bool {
    stored.expediente != incoming.expediente
        || stored.title != incoming.title
        || stored.summary != incoming.summary
        || stored.contracting_body != incoming.contracting_body
        || stored.contract_type != incoming.contract_type
        || stored.procedure != incoming.procedure
        || stored.base_budget != incoming.base_budget
        || stored.estimated_value != incoming.estimated_value
        || stored.publication_date != incoming.publication_date
        || stored.deadline_date != incoming.deadline_date
        || stored.updated_at != incoming.updated_at
        || stored.execution_location != incoming.execution_location
        || stored.nuts_code != incoming.nuts_code
        || stored.funding_eu != incoming.funding_eu
        || stored.cpv_codes != incoming.cpv_codes
        || stored.source_url != incoming.source_url
        || stored.status != incoming.status
        || stored.documents != incoming.documents
        || stored.extra_sources != incoming.extra_sources
}

/// Overlay the incoming adapter-produced fields onto a stored record,
/// preserving whatever enrichment the stored record already carries.
pub fn apply_tracked_fields(stored: &Tender, incoming: &Tender) -> Tender {
    let mut merged = incoming.clone();
    merged.analysis = stored.analysis.clone();
    merged.analyzed_at = stored.analyzed_at;
    merged
}

/// Persistence collaborator. Single writer per run; no consistency model
/// beyond that is assumed.
#[async_trait]
pub trait TenderStore: Send + Sync {
    /// Fails only when the store is unreachable; an unreachable store aborts
    /// the whole run.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Tender>, StoreError>;

    async fn create(&self, tender: &Tender) -> Result<(), StoreError>;

    /// Diff-aware update: writes (and bumps the modified marker) only when a
    /// tracked field differs. Returns whether anything was written.
    async fn update(&self, external_id: &str, incoming: &Tender) -> Result<bool, StoreError>;

    /// Attach enrichment output to an existing record. Best-effort from the
    /// caller's point of view; a missing record is not an error.
    async fn attach_analysis(
        &self,
        external_id: &str,
        analysis: &tenderscope_core::TenderAnalysis,
        analyzed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    tender: Tender,
    modified_at: DateTime<Utc>,
}

/// HashMap-backed store for tests and offline runs.
#[derive(Default)]
pub struct MemoryTenderStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn last_modified(&self, external_id: &str) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .await
            .get(external_id)
            .map(|e| e.modified_at)
    }
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Tender>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(external_id)
            .map(|e| e.tender.clone()))
    }

    async fn create(&self, tender: &Tender) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&tender.external_id) {
            return Err(StoreError::AlreadyExists(tender.external_id.clone()));
        }
        entries.insert(
            tender.external_id.clone(),
            MemoryEntry {
                tender: tender.clone(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update(&self, external_id: &str, incoming: &Tender) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(external_id) else {
            return Ok(false);
        };
        if !tracked_fields_differ(&entry.tender, incoming) {
            return Ok(false);
        }
        entry.tender = apply_tracked_fields(&entry.tender, incoming);
        entry.modified_at = Utc::now();
        Ok(true)
    }

    async fn attach_analysis(
        &self,
        external_id: &str,
        analysis: &tenderscope_core::TenderAnalysis,
        analyzed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(external_id) {
            entry.tender.analysis = Some(analysis.clone());
            entry.tender.analyzed_at = Some(analyzed_at);
            entry.modified_at = Utc::now();
        }
        Ok(())
    }
}

/// Postgres-backed store. The record travels as a jsonb payload keyed by
/// external id; schema migrations beyond the bootstrap table are out of scope.
pub struct PgTenderStore {
    pool: PgPool,
}

impl PgTenderStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenders (
                external_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                modified_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(payload: serde_json::Value) -> Result<Tender, StoreError> {
        Ok(serde_json::from_value(payload)?)
    }
}

#[async_trait]
impl TenderStore for PgTenderStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Tender>, StoreError> {
        let row = sqlx::query("SELECT payload FROM tenders WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::decode(row.get::<serde_json::Value, _>(0))?)),
            None => Ok(None),
        }
    }

    async fn create(&self, tender: &Tender) -> Result<(), StoreError> {
        let payload = serde_json::to_value(tender)?;
        let result = sqlx::query(
            "INSERT INTO tenders (external_id, source, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(&tender.external_id)
        .bind(&tender.source)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(tender.external_id.clone()));
        }
        Ok(())
    }

    async fn update(&self, external_id: &str, incoming: &Tender) -> Result<bool, StoreError> {
        let Some(stored) = self.get_by_external_id(external_id).await? else {
            return Ok(false);
        };
        if !tracked_fields_differ(&stored, incoming) {
            return Ok(false);
        }
        let merged = apply_tracked_fields(&stored, incoming);
        let payload = serde_json::to_value(&merged)?;
        sqlx::query(
            "UPDATE tenders SET payload = $2, modified_at = now() WHERE external_id = $1",
        )
        .bind(external_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn attach_analysis(
        &self,
        external_id: &str,
        analysis: &tenderscope_core::TenderAnalysis,
        analyzed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut stored) = self.get_by_external_id(external_id).await? else {
            return Ok(());
        };
        stored.analysis = Some(analysis.clone());
        stored.analyzed_at = Some(analyzed_at);
        let payload = serde_json::to_value(&stored)?;
        sqlx::query(
            "UPDATE tenders SET payload = $2, modified_at = now() WHERE external_id = $1",
        )
        .bind(external_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Document collaborator: resolves an attachment URL to extracted text.
/// Extraction internals (PDF parsing, object storage) live outside this
/// pipeline; failures are reported as `Ok(None)` where possible and are never
/// fatal to ingestion.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> anyhow::Result<Option<String>>;
}

/// Default collaborator when no document service is wired up.
#[derive(Default)]
pub struct NoopDocumentFetcher;

#[async_trait]
impl DocumentFetcher for NoopDocumentFetcher {
    async fn fetch_text(&self, _url: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
