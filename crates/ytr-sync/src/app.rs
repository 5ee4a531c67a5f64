//! Wires configuration into providers, clients, stores and sinks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use ytr_reporting::{
    CapabilityProvider, OAuthCredentialsProvider, StaticTokenProvider, YouTubeDataClient,
    YouTubeReportingClient,
};
use ytr_storage::{
    BackoffPolicy, FileWatermarkStore, HttpClientConfig, HttpFetcher, ReportStore, TokenBucketConfig,
};

use crate::config::{PipelineConfig, WarehouseConfig};
use crate::enrich::{enrich_metadata, load_processed_reports, EnrichmentSummary, MetadataTables};
use crate::fetch::{FetchSettings, ReportFetcher};
use crate::normalize::ReportNormalizer;
use crate::pipeline::{ExtractionPipeline, ExtractionSettings, RunError, RunState, RunSummary};
use crate::sink::{ParquetSnapshotSink, PostgresSink, WarehouseSink};

/// Bearer token that bypasses the OAuth credentials files.
pub const ACCESS_TOKEN_ENV: &str = "YTR_ACCESS_TOKEN";

#[derive(Debug, Clone, Serialize)]
pub struct FullRunSummary {
    pub extraction: RunSummary,
    pub loaded_rows: Option<usize>,
    pub enrichment: Option<EnrichmentSummary>,
}

pub struct SyncApp {
    config: PipelineConfig,
    http: Arc<HttpFetcher>,
    auth: Arc<dyn CapabilityProvider>,
    backoff: BackoffPolicy,
}

impl SyncApp {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http.timeout_secs),
            user_agent: Some(config.http.user_agent.clone()),
            global_concurrency: config.http.global_concurrency.max(1),
            token_bucket: config.http.requests_per_second.map(|rps| TokenBucketConfig {
                capacity: rps,
                refill_every: Duration::from_secs(1) / rps.max(1),
            }),
            ..HttpClientConfig::default()
        })?);
        let auth: Arc<dyn CapabilityProvider> = match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => {
                info!("using static access token from {ACCESS_TOKEN_ENV}");
                Arc::new(StaticTokenProvider::new(token))
            }
            _ => Arc::new(OAuthCredentialsProvider::new(
                config.auth.client_secrets_file.clone(),
                config.auth.credentials_file.clone(),
                http.clone(),
            )),
        };
        Ok(Self {
            config,
            http,
            auth,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_provider(mut self, auth: Arc<dyn CapabilityProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn report_store(&self) -> ReportStore {
        ReportStore::new(&self.config.reporting.reports_dir)
    }

    async fn sink(&self) -> Result<Box<dyn WarehouseSink>> {
        Ok(match &self.config.warehouse {
            WarehouseConfig::Parquet { dir } => Box::new(ParquetSnapshotSink::new(dir)),
            WarehouseConfig::Postgres { url } => Box::new(
                PostgresSink::connect(url)
                    .await
                    .context("connecting to warehouse database")?,
            ),
        })
    }

    /// One watermark-windowed extraction run.
    pub async fn extract(&self) -> Result<RunSummary, RunError> {
        let reporting = &self.config.reporting;
        let handle = self
            .auth
            .authenticate(&self.config.auth.reporting_service())
            .await?;
        let client = Arc::new(YouTubeReportingClient::new(handle, self.http.clone()));
        let store = self.report_store();

        let fetcher = ReportFetcher::new(
            client.clone(),
            store.clone(),
            reporting.report_family.clone(),
            FetchSettings {
                chunk_size: reporting.chunk_size_bytes,
                chunk_backoff: self.backoff,
                timeout: Some(Duration::from_secs(reporting.download_timeout_secs)),
            },
        );
        let normalizer = ReportNormalizer::new(store, self.config.tables.reports.schema.clone());
        let settings = ExtractionSettings {
            job_id: reporting.job_id.clone(),
            content_owner_id: self.config.content_owner_id.clone(),
            report_family: reporting.report_family.clone(),
            start_date: reporting.start_date,
            max_in_flight: reporting.max_in_flight,
            manifest_dir: self.config.manifest_dir(),
        };
        let pipeline = ExtractionPipeline::new(
            settings,
            client,
            fetcher,
            normalizer,
            Arc::new(FileWatermarkStore::new(&reporting.watermark_path)),
        );
        pipeline.run_once().await
    }

    /// Replaces the reports table with every processed report on disk.
    /// `None` when no processed report exists and the table was left alone.
    pub async fn load_reports(&self) -> Result<Option<usize>> {
        let sink = self.sink().await?;
        load_processed_reports(
            &self.report_store(),
            &self.config.reporting.report_family,
            &self.config.tables.reports,
            sink.as_ref(),
        )
        .await
    }

    pub async fn enrich(&self) -> Result<EnrichmentSummary> {
        let handle = self
            .auth
            .authenticate(&self.config.auth.data_service())
            .await
            .context("authenticating data api")?;
        let api = YouTubeDataClient::new(handle, self.http.clone());
        let sink = self.sink().await?;
        let tables = MetadataTables {
            channels: self.config.tables.channels.name.clone(),
            videos: self.config.tables.videos.name.clone(),
            video_categories: self.config.tables.video_categories.name.clone(),
        };
        enrich_metadata(
            &api,
            &self.config.content_owner_id,
            &self.report_store(),
            &self.config.reporting.report_family,
            &tables,
            sink.as_ref(),
            &self.backoff,
        )
        .await
    }

    /// Extraction, then the reports load, then metadata enrichment.
    pub async fn run_all(&self) -> Result<FullRunSummary> {
        let extraction = self.extract().await?;
        if extraction.final_state == RunState::Skipped {
            return Ok(FullRunSummary {
                extraction,
                loaded_rows: None,
                enrichment: None,
            });
        }
        let loaded_rows = self.load_reports().await?;
        let enrichment = self.enrich().await?;
        Ok(FullRunSummary {
            extraction,
            loaded_rows,
            enrichment: Some(enrichment),
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.schedule.enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.schedule.crons {
            let app = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let app = Arc::clone(&app);
                Box::pin(async move {
                    match app.run_all().await {
                        Ok(summary) if summary.extraction.is_complete() => {
                            info!(run_id = %summary.extraction.run_id, "scheduled run complete")
                        }
                        Ok(summary) => warn!(
                            run_id = %summary.extraction.run_id,
                            failures = summary.extraction.failures.len(),
                            "scheduled run finished incomplete"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
