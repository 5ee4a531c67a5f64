//! Watermark-windowed extraction run: list, reconcile, fetch, normalize, advance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use ytr_core::{ReportDescriptor, Watermark};
use ytr_reporting::{list_reports, AuthError, CatalogQuery, RemoteApiError, ReportCatalog};
use ytr_storage::{sha256_hex, WatermarkStore};

use crate::fetch::ReportFetcher;
use crate::normalize::{ProcessedReportFile, RawReportFile, ReportNormalizer};
use crate::reconcile::reconcile;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub job_id: String,
    pub content_owner_id: String,
    pub report_family: String,
    /// Earliest coverage date ever extracted; also the window start before any watermark exists.
    pub start_date: NaiveDate,
    pub max_in_flight: usize,
    /// Run manifests land here as `<run_id>.json`.
    pub manifest_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    CatalogListed,
    Reconciled,
    Fetching,
    Normalizing,
    /// Every report of the window succeeded and the watermark moved.
    WatermarkAdvanced,
    /// Some report failed; the watermark was left untouched.
    WatermarkHeld,
    /// The stored watermark lies in the future; nothing was extracted.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Normalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFailure {
    pub report_id: String,
    pub coverage_date: NaiveDate,
    pub stage: FailureStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: Watermark,
    pub previous_watermark: Option<Watermark>,
    pub new_watermark: Option<Watermark>,
    pub final_state: RunState,
    pub listed: usize,
    pub reconciled: usize,
    pub raw: Vec<RawReportFile>,
    pub processed: Vec<ProcessedReportFile>,
    pub failures: Vec<ReportFailure>,
    pub manifest_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.final_state != RunState::Skipped
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("reading watermark: {0:#}")]
    WatermarkRead(#[source] anyhow::Error),
    #[error("listing reports: {0}")]
    Catalog(#[from] RemoteApiError),
    #[error("writing run manifest: {0:#}")]
    Manifest(#[source] anyhow::Error),
    #[error("writing watermark: {0:#}")]
    WatermarkWrite(#[source] anyhow::Error),
}

#[derive(Serialize)]
struct RunManifest<'a> {
    schema_version: u32,
    run_id: Uuid,
    report_family: &'a str,
    window_start: Watermark,
    raw: &'a [RawReportFile],
    processed: &'a [ProcessedReportFile],
    failures: &'a [ReportFailure],
}

/// One incremental extraction over the window `(watermark, now]`.
pub struct ExtractionPipeline {
    settings: ExtractionSettings,
    catalog: Arc<dyn ReportCatalog>,
    fetcher: ReportFetcher,
    normalizer: ReportNormalizer,
    watermark: Arc<dyn WatermarkStore>,
    clock: Clock,
}

impl ExtractionPipeline {
    pub fn new(
        settings: ExtractionSettings,
        catalog: Arc<dyn ReportCatalog>,
        fetcher: ReportFetcher,
        normalizer: ReportNormalizer,
        watermark: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            settings,
            catalog,
            fetcher,
            normalizer,
            watermark,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn enter(&self, state: RunState) {
        debug!(?state, "run state");
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("extraction_run", %run_id, family = %self.settings.report_family);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = (self.clock)();
        self.enter(RunState::Start);

        let previous = self
            .watermark
            .read()
            .await
            .map_err(RunError::WatermarkRead)?;
        let window_start = previous.unwrap_or_else(|| Watermark::start_of(self.settings.start_date));
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            window_start,
            previous_watermark: previous,
            new_watermark: None,
            final_state: RunState::Start,
            listed: 0,
            reconciled: 0,
            raw: Vec::new(),
            processed: Vec::new(),
            failures: Vec::new(),
            manifest_path: None,
        };

        if window_start.at() > started_at {
            warn!(watermark = %window_start, now = %started_at, "watermark is in the future, skipping extraction");
            summary.final_state = RunState::Skipped;
            summary.finished_at = (self.clock)();
            return Ok(summary);
        }

        let query = CatalogQuery {
            job_id: self.settings.job_id.clone(),
            content_owner_id: self.settings.content_owner_id.clone(),
            created_after: window_start,
        };
        let listed = list_reports(self.catalog.as_ref(), &query, self.settings.start_date).await?;
        summary.listed = listed.len();
        self.enter(RunState::CatalogListed);

        let reconciled = reconcile(listed);
        summary.reconciled = reconciled.len();
        self.enter(RunState::Reconciled);
        info!(listed = summary.listed, reconciled = summary.reconciled, "reports reconciled");

        self.enter(RunState::Fetching);
        let (raw, mut failures) = self.fetch_all(reconciled.into_descriptors()).await;

        self.enter(RunState::Normalizing);
        let (processed, normalize_failures) = self.normalize_all(&raw).await;
        failures.extend(normalize_failures);
        failures.sort_by_key(|f| f.coverage_date);

        summary.raw = raw;
        summary.processed = processed;
        summary.failures = failures;
        summary.manifest_path = Some(self.write_manifest(&summary).await.map_err(RunError::Manifest)?);

        if summary.failures.is_empty() {
            let next = match previous {
                Some(previous) => previous.advance_to(started_at),
                None => Watermark::new(started_at),
            };
            self.watermark
                .write(next)
                .await
                .map_err(RunError::WatermarkWrite)?;
            summary.new_watermark = Some(next);
            summary.final_state = RunState::WatermarkAdvanced;
            info!(watermark = %next, processed = summary.processed.len(), "extraction complete, watermark advanced");
        } else {
            summary.final_state = RunState::WatermarkHeld;
            warn!(
                failed = summary.failures.len(),
                processed = summary.processed.len(),
                "extraction finished with failures, watermark not advanced"
            );
        }
        self.enter(summary.final_state);
        summary.finished_at = (self.clock)();
        Ok(summary)
    }

    async fn fetch_all(&self, descriptors: Vec<ReportDescriptor>) -> (Vec<RawReportFile>, Vec<ReportFailure>) {
        let outcomes: Vec<_> = stream::iter(descriptors)
            .map(|descriptor| async move {
                let outcome = self.fetcher.fetch(&descriptor).await;
                (descriptor, outcome)
            })
            .buffer_unordered(self.settings.max_in_flight.max(1))
            .collect()
            .await;

        let mut raw = Vec::new();
        let mut failures = Vec::new();
        for (descriptor, outcome) in outcomes {
            match outcome {
                Ok(file) => raw.push(file),
                Err(err) => {
                    warn!(report_id = %descriptor.id, coverage_date = %descriptor.coverage_date, error = %err, "report download failed");
                    failures.push(ReportFailure {
                        report_id: descriptor.id,
                        coverage_date: descriptor.coverage_date,
                        stage: FailureStage::Fetch,
                        error: err.to_string(),
                    });
                }
            }
        }
        raw.sort_by_key(|f| f.name.coverage_date);
        (raw, failures)
    }

    async fn normalize_all(&self, raw: &[RawReportFile]) -> (Vec<ProcessedReportFile>, Vec<ReportFailure>) {
        let mut processed = Vec::new();
        let mut failures = Vec::new();
        for file in raw {
            match self.normalizer.normalize(file).await {
                Ok(done) => processed.push(done),
                Err(err) => {
                    warn!(report = %file.name, error = %err, "report normalization failed");
                    failures.push(ReportFailure {
                        report_id: file.report_id.clone(),
                        coverage_date: file.name.coverage_date,
                        stage: FailureStage::Normalize,
                        error: err.to_string(),
                    });
                }
            }
        }
        (processed, failures)
    }

    async fn write_manifest(&self, summary: &RunSummary) -> anyhow::Result<PathBuf> {
        let manifest = RunManifest {
            schema_version: 1,
            run_id: summary.run_id,
            report_family: &self.settings.report_family,
            window_start: summary.window_start,
            raw: &summary.raw,
            processed: &summary.processed,
            failures: &summary.failures,
        };
        let dir = &self.settings.manifest_dir;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        let path = dir.join(format!("{}.json", summary.run_id));
        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), sha256 = %sha256_hex(&bytes), "run manifest written");
        Ok(path)
    }
}
