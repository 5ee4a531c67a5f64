//! Incremental YouTube Reporting extraction, normalization and warehouse loading.

pub mod app;
pub mod config;
pub mod enrich;
pub mod fetch;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod sink;

pub use app::{FullRunSummary, SyncApp, ACCESS_TOKEN_ENV};
pub use config::{PipelineConfig, WarehouseConfig};
pub use enrich::{
    enrich_metadata, load_processed_reports, top_video_ids, EnrichmentSummary, MetadataTables,
};
pub use fetch::{DownloadError, FetchSettings, ReportFetcher};
pub use normalize::{
    normalize_csv, read_processed, MalformedReportError, NormalizeError, ProcessedReportFile,
    RawReportFile, ReportNormalizer,
};
pub use pipeline::{
    Clock, ExtractionPipeline, ExtractionSettings, FailureStage, ReportFailure, RunError, RunState,
    RunSummary,
};
pub use reconcile::{reconcile, ReconciledReportSet};
pub use sink::{ParquetSnapshotSink, PostgresSink, SinkError, WarehouseSink};

pub const CRATE_NAME: &str = "ytr-sync";
