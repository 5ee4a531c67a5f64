//! Chunked, resumable-per-chunk report downloads into the report store.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use ytr_core::{ReportDescriptor, ReportFileName, ReportStage};
use ytr_reporting::{RemoteApiError, ReportDownloader};
use ytr_storage::{retry_with_backoff, BackoffPolicy, ByteRange, PartialReport, ReportStore};

use crate::normalize::RawReportFile;

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub chunk_size: u64,
    pub chunk_backoff: BackoffPolicy,
    /// Upper bound for one whole report download.
    pub timeout: Option<Duration>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_backoff: BackoffPolicy::default(),
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("chunk at byte {offset} failed: {source}")]
    Chunk {
        offset: u64,
        #[source]
        source: RemoteApiError,
    },
    #[error("transfer stalled at byte {offset} of {total}")]
    Stalled { offset: u64, total: u64 },
    #[error("download did not finish within {0:?}")]
    Timeout(Duration),
    #[error("local report storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Downloads report media chunk by chunk. Nothing appears under the final raw
/// file name unless every chunk arrived.
#[derive(Clone)]
pub struct ReportFetcher {
    downloader: Arc<dyn ReportDownloader>,
    store: ReportStore,
    family: String,
    settings: FetchSettings,
}

impl ReportFetcher {
    pub fn new(
        downloader: Arc<dyn ReportDownloader>,
        store: ReportStore,
        family: impl Into<String>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            downloader,
            store,
            family: family.into(),
            settings,
        }
    }

    pub fn raw_name(&self, descriptor: &ReportDescriptor) -> ReportFileName {
        ReportFileName::new(ReportStage::Raw, self.family.clone(), descriptor.coverage_date)
    }

    pub async fn fetch(&self, descriptor: &ReportDescriptor) -> Result<RawReportFile, DownloadError> {
        let name = self.raw_name(descriptor);
        match self.settings.timeout {
            // Dropping the timed-out transfer drops its partial file too.
            Some(limit) => tokio::time::timeout(limit, self.transfer(descriptor, name))
                .await
                .map_err(|_| DownloadError::Timeout(limit))?,
            None => self.transfer(descriptor, name).await,
        }
    }

    async fn transfer(
        &self,
        descriptor: &ReportDescriptor,
        name: ReportFileName,
    ) -> Result<RawReportFile, DownloadError> {
        info!(report = %name, report_id = %descriptor.id, "download started");
        let chunk_size = self.settings.chunk_size.max(1);
        let mut partial = self.begin(name.clone()).await?;
        let mut offset = 0u64;
        let mut total: Option<u64> = None;

        loop {
            if matches!(total, Some(total) if offset >= total) {
                break;
            }
            let range = ByteRange::starting_at(offset, chunk_size);
            let chunk = retry_with_backoff(
                &self.settings.chunk_backoff,
                RemoteApiError::is_retryable,
                |_| self.downloader.fetch_chunk(&descriptor.download_url, range),
            )
            .await
            .map_err(|source| DownloadError::Chunk { offset, source })?;

            if chunk.whole_resource {
                // Range was ignored: the body is the complete report.
                if offset > 0 {
                    partial.abort().await;
                    partial = self.begin(name.clone()).await?;
                }
                partial
                    .write_chunk(&chunk.body)
                    .await
                    .map_err(DownloadError::Storage)?;
                break;
            }

            let received = chunk.body.len() as u64;
            if let Some(declared) = chunk.total_len {
                total = Some(declared);
            }
            if received == 0 {
                match total {
                    Some(total) if offset < total => {
                        return Err(DownloadError::Stalled { offset, total })
                    }
                    _ => break,
                }
            }
            partial
                .write_chunk(&chunk.body)
                .await
                .map_err(DownloadError::Storage)?;
            offset += received;

            match total {
                Some(total) => info!(
                    report = %name,
                    bytes = offset,
                    total,
                    progress = format!("{:.0}%", 100.0 * offset as f64 / total.max(1) as f64),
                    "download progress"
                ),
                None => debug!(report = %name, bytes = offset, "download progress"),
            }
            if total.is_none() && received < chunk_size {
                break;
            }
        }

        let stored = partial.commit().await.map_err(DownloadError::Storage)?;
        info!(report = %stored.name, bytes = stored.byte_size, "download complete");
        Ok(RawReportFile {
            name: stored.name,
            path: stored.path,
            report_id: descriptor.id.clone(),
            byte_size: stored.byte_size,
            sha256: stored.content_hash,
        })
    }

    async fn begin(&self, name: ReportFileName) -> Result<PartialReport, DownloadError> {
        self.store.begin(name).await.map_err(DownloadError::Storage)
    }
}
