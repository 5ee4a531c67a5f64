//! Warehouse loads of processed reports plus channel, video and category metadata.

use std::collections::{BTreeSet, HashMap};

use anyhow::Context;
use serde::Serialize;
use tracing::info;
use ytr_core::{
    CellValue, Channel, OutputSchema, ReportStage, TableDescriptor, TabularDataset, Video,
    VideoCategory,
};
use ytr_reporting::{list_all_channels, list_categories_for, list_videos_in_batches, MetadataApi};
use ytr_storage::{BackoffPolicy, ReportStore};

use crate::normalize::{read_processed, MalformedReportError, ESTIMATED_AD_REVENUE_COLUMN};
use crate::sink::WarehouseSink;

/// Videos looked up per processed report, ranked by estimated ad revenue.
pub const TOP_VIDEOS_PER_REPORT: usize = 50;
pub const VIDEO_ID_COLUMN: &str = "video_id";

/// Target tables for the metadata listings.
#[derive(Debug, Clone)]
pub struct MetadataTables {
    pub channels: String,
    pub videos: String,
    pub video_categories: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentSummary {
    pub skipped: bool,
    pub channels: usize,
    pub videos: usize,
    pub video_categories: usize,
}

pub fn channel_table(name: &str) -> anyhow::Result<TableDescriptor> {
    Ok(TableDescriptor {
        name: name.to_string(),
        schema: OutputSchema::strings(&["id", "name"])?,
    })
}

pub fn video_table(name: &str) -> anyhow::Result<TableDescriptor> {
    Ok(TableDescriptor {
        name: name.to_string(),
        schema: OutputSchema::strings(&["id", "name", "category_id"])?,
    })
}

pub fn video_category_table(name: &str) -> anyhow::Result<TableDescriptor> {
    Ok(TableDescriptor {
        name: name.to_string(),
        schema: OutputSchema::strings(&["id", "name"])?,
    })
}

fn string_dataset<'a>(
    schema: &OutputSchema,
    rows: impl Iterator<Item = Vec<&'a str>>,
) -> anyhow::Result<TabularDataset> {
    let mut dataset = TabularDataset::new(schema.clone());
    for row in rows {
        dataset.push_row(row.into_iter().map(|v| CellValue::String(v.to_string())).collect())?;
    }
    Ok(dataset)
}

pub fn channels_dataset(table: &TableDescriptor, channels: &[Channel]) -> anyhow::Result<TabularDataset> {
    string_dataset(
        &table.schema,
        channels.iter().map(|c| vec![c.id.as_str(), c.name.as_str()]),
    )
}

pub fn videos_dataset(table: &TableDescriptor, videos: &[Video]) -> anyhow::Result<TabularDataset> {
    string_dataset(
        &table.schema,
        videos
            .iter()
            .map(|v| vec![v.id.as_str(), v.name.as_str(), v.category_id.as_str()]),
    )
}

pub fn categories_dataset(
    table: &TableDescriptor,
    categories: &[VideoCategory],
) -> anyhow::Result<TabularDataset> {
    string_dataset(
        &table.schema,
        categories.iter().map(|c| vec![c.id.as_str(), c.name.as_str()]),
    )
}

/// Concatenates every processed report of `family` and replaces `table` with the result.
/// Returns `None` without touching the table when there is nothing to load.
pub async fn load_processed_reports(
    store: &ReportStore,
    family: &str,
    table: &TableDescriptor,
    sink: &dyn WarehouseSink,
) -> anyhow::Result<Option<usize>> {
    let names = store.list(ReportStage::Processed, family).await?;
    if names.is_empty() {
        info!(family, table = %table.name, "no processed reports to load, table left as is");
        return Ok(None);
    }
    let mut dataset = TabularDataset::new(table.schema.clone());
    for name in &names {
        let bytes = store.read(name).await?;
        let part = read_processed(&name.file_name(), &bytes, &table.schema)?;
        dataset.append(part)?;
    }
    info!(files = names.len(), rows = dataset.len(), table = %table.name, "loading processed reports");
    sink.load(&dataset, table)
        .await
        .with_context(|| format!("loading {}", table.name))?;
    Ok(Some(dataset.len()))
}

/// Highest-revenue video ids of one processed report.
pub fn top_video_ids_in(file: &str, bytes: &[u8], limit: usize) -> Result<Vec<String>, MalformedReportError> {
    let csv_err = |source: csv::Error| MalformedReportError::Csv {
        file: file.to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(bytes);
    let headers = reader.headers().map_err(csv_err)?.clone();
    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| MalformedReportError::MissingColumn {
                file: file.to_string(),
                column: column.to_string(),
            })
    };
    let video_idx = position(VIDEO_ID_COLUMN)?;
    let revenue_idx = position(ESTIMATED_AD_REVENUE_COLUMN)?;

    let mut revenue_by_video: HashMap<String, f64> = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let video = record.get(video_idx).unwrap_or("").trim();
        if video.is_empty() {
            continue;
        }
        let revenue = record
            .get(revenue_idx)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        *revenue_by_video.entry(video.to_string()).or_insert(0.0) += revenue;
    }

    let mut ranked: Vec<(String, f64)> = revenue_by_video.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(ranked.into_iter().take(limit).map(|(id, _)| id).collect())
}

/// Union of every processed report's top videos, sorted by id.
pub async fn top_video_ids(store: &ReportStore, family: &str, limit: usize) -> anyhow::Result<Vec<String>> {
    let mut ids = BTreeSet::new();
    for name in store.list(ReportStage::Processed, family).await? {
        let bytes = store.read(&name).await?;
        ids.extend(top_video_ids_in(&name.file_name(), &bytes, limit)?);
    }
    Ok(ids.into_iter().collect())
}

/// Loads channel, video and category tables for the reports currently on disk.
pub async fn enrich_metadata(
    api: &dyn MetadataApi,
    content_owner_id: &str,
    store: &ReportStore,
    family: &str,
    tables: &MetadataTables,
    sink: &dyn WarehouseSink,
    backoff: &BackoffPolicy,
) -> anyhow::Result<EnrichmentSummary> {
    if store.list(ReportStage::Processed, family).await?.is_empty() {
        info!(dir = %store.root().display(), "no processed reports, skipping metadata enrichment");
        return Ok(EnrichmentSummary {
            skipped: true,
            ..EnrichmentSummary::default()
        });
    }

    let channel_table = channel_table(&tables.channels)?;
    let channels = list_all_channels(api, content_owner_id, backoff).await?;
    sink.load(&channels_dataset(&channel_table, &channels)?, &channel_table)
        .await?;

    let video_ids = top_video_ids(store, family, TOP_VIDEOS_PER_REPORT).await?;
    let video_table = video_table(&tables.videos)?;
    let videos = list_videos_in_batches(api, content_owner_id, &video_ids, backoff).await?;
    sink.load(&videos_dataset(&video_table, &videos)?, &video_table)
        .await?;

    let category_table = video_category_table(&tables.video_categories)?;
    let categories = list_categories_for(api, &videos, backoff).await?;
    sink.load(&categories_dataset(&category_table, &categories)?, &category_table)
        .await?;

    Ok(EnrichmentSummary {
        skipped: false,
        channels: channels.len(),
        videos: videos.len(),
        video_categories: categories.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use ytr_core::{ColumnSpec, ColumnType, ReportFileName};
    use ytr_reporting::{Page, RemoteApiError};

    #[derive(Default)]
    struct RecordingSink {
        loads: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl WarehouseSink for RecordingSink {
        async fn load(&self, dataset: &TabularDataset, table: &TableDescriptor) -> Result<(), SinkError> {
            self.loads
                .lock()
                .unwrap()
                .push((table.name.clone(), dataset.len()));
            Ok(())
        }
    }

    struct StubApi;

    #[async_trait]
    impl MetadataApi for StubApi {
        async fn list_channels_page(
            &self,
            _owner: &str,
            _page_token: Option<&str>,
        ) -> Result<Page<Channel>, RemoteApiError> {
            Ok(Page {
                items: vec![Channel {
                    id: "UC1".into(),
                    name: "Main".into(),
                }],
                next_page_token: None,
            })
        }

        async fn list_videos(&self, _owner: &str, ids: &[String]) -> Result<Vec<Video>, RemoteApiError> {
            Ok(ids
                .iter()
                .map(|id| Video {
                    id: id.clone(),
                    name: format!("title {id}"),
                    category_id: "10".into(),
                })
                .collect())
        }

        async fn list_categories(&self, ids: &[String]) -> Result<Vec<VideoCategory>, RemoteApiError> {
            Ok(ids
                .iter()
                .map(|id| VideoCategory {
                    id: id.clone(),
                    name: "Music".into(),
                })
                .collect())
        }
    }

    fn processed_name(day: u32) -> ReportFileName {
        ReportFileName::new(
            ReportStage::Processed,
            "revenue",
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
        )
    }

    fn tables() -> MetadataTables {
        MetadataTables {
            channels: "youtube.channels".into(),
            videos: "youtube.videos".into(),
            video_categories: "youtube.video_categories".into(),
        }
    }

    #[test]
    fn top_videos_rank_by_summed_revenue() {
        let body = b"date,video_id,estimated_ad_revenue\n\
2024-01-01,a,1.0\n2024-01-01,b,5.0\n2024-01-01,a,4.5\n2024-01-01,c,\n";
        assert_eq!(top_video_ids_in("f", body, 2).unwrap(), vec!["a", "b"]);
        assert_eq!(top_video_ids_in("f", body, 10).unwrap(), vec!["a", "b", "c"]);
        assert!(top_video_ids_in("f", b"date,views\n", 5).is_err());
    }

    #[tokio::test]
    async fn processed_reports_load_as_one_table() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        store
            .write(processed_name(1), b"date,video_id\n2024-01-01,a\n2024-01-01,b\n")
            .await
            .unwrap();
        store
            .write(processed_name(2), b"date,video_id\n2024-01-02,c\n")
            .await
            .unwrap();
        let table = TableDescriptor {
            name: "youtube.reports".into(),
            schema: OutputSchema::new(vec![
                ColumnSpec::new("date", ColumnType::Date),
                ColumnSpec::new("video_id", ColumnType::String),
            ])
            .unwrap(),
        };
        let sink = RecordingSink::default();

        let rows = load_processed_reports(&store, "revenue", &table, &sink).await.unwrap();
        assert_eq!(rows, Some(3));
        assert_eq!(*sink.loads.lock().unwrap(), vec![("youtube.reports".to_string(), 3)]);
    }

    #[tokio::test]
    async fn reports_table_is_left_alone_without_processed_files() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        store
            .write(
                ReportFileName::new(
                    ReportStage::Raw,
                    "revenue",
                    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                ),
                b"date,video_id\n20240101,a\n",
            )
            .await
            .unwrap();
        let table = TableDescriptor {
            name: "youtube.reports".into(),
            schema: OutputSchema::new(vec![ColumnSpec::new("date", ColumnType::Date)]).unwrap(),
        };
        let sink = RecordingSink::default();

        let rows = load_processed_reports(&store, "revenue", &table, &sink).await.unwrap();
        assert_eq!(rows, None);
        assert!(sink.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrichment_loads_three_metadata_tables() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        store
            .write(
                processed_name(1),
                b"video_id,estimated_ad_revenue\nv1,2\nv2,1\n",
            )
            .await
            .unwrap();
        store
            .write(processed_name(2), b"video_id,estimated_ad_revenue\nv2,3\n")
            .await
            .unwrap();
        let sink = RecordingSink::default();

        let summary = enrich_metadata(&StubApi, "owner", &store, "revenue", &tables(), &sink, &BackoffPolicy::none())
            .await
            .unwrap();
        assert_eq!(
            summary,
            EnrichmentSummary {
                skipped: false,
                channels: 1,
                videos: 2,
                video_categories: 1,
            }
        );
        let loads = sink.loads.lock().unwrap().clone();
        assert_eq!(
            loads,
            vec![
                ("youtube.channels".to_string(), 1),
                ("youtube.videos".to_string(), 2),
                ("youtube.video_categories".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn enrichment_skips_without_processed_reports() {
        let dir = tempdir().expect("tempdir");
        let sink = RecordingSink::default();
        let summary = enrich_metadata(
            &StubApi,
            "owner",
            &ReportStore::new(dir.path()),
            "revenue",
            &tables(),
            &sink,
            &BackoffPolicy::none(),
        )
        .await
        .unwrap();
        assert!(summary.skipped);
        assert!(sink.loads.lock().unwrap().is_empty());
    }
}
