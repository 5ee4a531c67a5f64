//! Local report storage, watermark persistence and HTTP plumbing for the ETL.

pub mod http;
pub mod reports;
pub mod watermark;

pub use http::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, ByteRange,
    FetchError, HttpClientConfig, HttpFetcher, RangeChunk, RetryDisposition, TokenBucketConfig,
};
pub use reports::{sha256_hex, PartialReport, ReportStore, StoredReport};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};

pub const CRATE_NAME: &str = "ytr-storage";
