//! YouTube Reporting API: job report catalog and report media download.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use ytr_core::ReportDescriptor;
use ytr_storage::{ByteRange, HttpFetcher, RangeChunk};

use crate::{
    ApiHandle, CatalogQuery, Page, PageCursor, RemoteApiError, ReportCatalog, ReportDownloader,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListReportsResponse {
    #[serde(default)]
    reports: Vec<RemoteReport>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteReport {
    id: String,
    start_time: String,
    create_time: String,
    download_url: Option<String>,
}

fn parse_remote_time(endpoint: &str, field: &str, value: &str) -> Result<DateTime<Utc>, RemoteApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RemoteApiError::Protocol {
            endpoint: endpoint.to_string(),
            message: format!("report {field} {value:?} is not RFC 3339: {e}"),
        })
}

fn into_descriptor(endpoint: &str, report: RemoteReport) -> Result<ReportDescriptor, RemoteApiError> {
    let download_url = report
        .download_url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| RemoteApiError::Protocol {
            endpoint: endpoint.to_string(),
            message: format!("report {} has no downloadUrl", report.id),
        })?;
    let created_at = parse_remote_time(endpoint, "createTime", &report.create_time)?;
    let coverage_date = parse_remote_time(endpoint, "startTime", &report.start_time)?.date_naive();
    Ok(ReportDescriptor {
        id: report.id,
        download_url,
        created_at,
        coverage_date,
    })
}

/// Client for `jobs.reports.list` and report media downloads.
#[derive(Debug, Clone)]
pub struct YouTubeReportingClient {
    handle: ApiHandle,
    http: Arc<HttpFetcher>,
}

impl YouTubeReportingClient {
    pub fn new(handle: ApiHandle, http: Arc<HttpFetcher>) -> Self {
        Self { handle, http }
    }

    fn reports_url(&self, job_id: &str) -> String {
        format!("{}jobs/{}/reports", self.handle.base_url, job_id)
    }
}

#[async_trait]
impl ReportCatalog for YouTubeReportingClient {
    async fn list_page(
        &self,
        query: &CatalogQuery,
        page_token: Option<&str>,
    ) -> Result<Page<ReportDescriptor>, RemoteApiError> {
        let url = self.reports_url(&query.job_id);
        let mut params = vec![
            ("onBehalfOfContentOwner", query.content_owner_id.clone()),
            ("createdAfter", query.created_after.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response: ListReportsResponse = self
            .http
            .get_json(&self.handle.service_name, &url, &params, &self.handle.access_token)
            .await?;
        let items = response
            .reports
            .into_iter()
            .map(|report| into_descriptor(&url, report))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl ReportDownloader for YouTubeReportingClient {
    async fn fetch_chunk(
        &self,
        download_url: &str,
        range: ByteRange,
    ) -> Result<RangeChunk, RemoteApiError> {
        Ok(self
            .http
            .get_range(
                &self.handle.service_name,
                download_url,
                &self.handle.access_token,
                range,
            )
            .await?)
    }
}

/// Every report of the job created after the query watermark whose coverage date is on or
/// after `start_date`, across all catalog pages.
pub async fn list_reports(
    catalog: &dyn ReportCatalog,
    query: &CatalogQuery,
    start_date: NaiveDate,
) -> Result<Vec<ReportDescriptor>, RemoteApiError> {
    info!(job_id = %query.job_id, created_after = %query.created_after, "retrieving reports");
    let mut reports = Vec::new();
    let mut listed = 0usize;
    let mut cursor = PageCursor::new("jobs.reports.list");
    let mut pages = 0usize;

    loop {
        let page = catalog.list_page(query, cursor.token()).await?;
        pages += 1;
        listed += page.items.len();
        reports.extend(
            page.items
                .into_iter()
                .filter(|report| report.coverage_date >= start_date),
        );
        debug!(page = pages, listed, kept = reports.len(), "catalog page received");

        if !cursor.advance(page.next_page_token)? {
            break;
        }
    }

    info!(pages, listed, kept = reports.len(), "reports retrieved");
    Ok(reports)
}
