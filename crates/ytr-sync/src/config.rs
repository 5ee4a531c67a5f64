//! YAML pipeline configuration with environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use ytr_core::TableDescriptor;
use ytr_reporting::{ServiceSpec, DATA_SERVICE, REPORTING_SERVICE};

pub const DEFAULT_CONFIG_PATH: &str = "ytr.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub content_owner_id: String,
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub tables: TablesConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    pub job_id: String,
    pub report_family: String,
    pub start_date: NaiveDate,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_watermark_path")]
    pub watermark_path: PathBuf,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_watermark_path() -> PathBuf {
    PathBuf::from("./state/watermark.json")
}

fn default_chunk_size_bytes() -> u64 {
    crate::fetch::DEFAULT_CHUNK_SIZE
}

fn default_max_in_flight() -> usize {
    1
}

fn default_download_timeout_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_secrets_file: PathBuf,
    pub credentials_file: PathBuf,
    pub scopes: Vec<String>,
    pub reporting_api: ApiConfig,
    pub data_api: ApiConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_secrets_file: PathBuf::from("client_secrets.json"),
            credentials_file: PathBuf::from("youtube-extraction.json"),
            scopes: vec![
                "https://www.googleapis.com/auth/yt-analytics-monetary.readonly".to_string(),
                "https://www.googleapis.com/auth/youtube.readonly".to_string(),
                "https://www.googleapis.com/auth/youtubepartner".to_string(),
            ],
            reporting_api: ApiConfig {
                service: REPORTING_SERVICE.to_string(),
                version: "v1".to_string(),
                base_url: None,
            },
            data_api: ApiConfig {
                service: DATA_SERVICE.to_string(),
                version: "v3".to_string(),
                base_url: None,
            },
        }
    }
}

impl AuthConfig {
    fn service_spec(&self, api: &ApiConfig) -> ServiceSpec {
        ServiceSpec {
            base_url: api.base_url.clone(),
            ..ServiceSpec::new(&api.service, &api.version, self.scopes.clone())
        }
    }

    pub fn reporting_service(&self) -> ServiceSpec {
        self.service_spec(&self.reporting_api)
    }

    pub fn data_service(&self) -> ServiceSpec {
        self.service_spec(&self.data_api)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub global_concurrency: usize,
    /// Sustained request rate across all services; unlimited when unset.
    pub requests_per_second: Option<u32>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "ytr-etl/0.1".to_string(),
            timeout_secs: 60,
            global_concurrency: 8,
            requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableName {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablesConfig {
    pub reports: TableDescriptor,
    #[serde(default = "default_channels_table")]
    pub channels: TableName,
    #[serde(default = "default_videos_table")]
    pub videos: TableName,
    #[serde(default = "default_video_categories_table")]
    pub video_categories: TableName,
}

fn default_channels_table() -> TableName {
    TableName {
        name: "youtube.channels".to_string(),
    }
}

fn default_videos_table() -> TableName {
    TableName {
        name: "youtube.videos".to_string(),
    }
}

fn default_video_categories_table() -> TableName {
    TableName {
        name: "youtube.video_categories".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WarehouseConfig {
    Parquet { dir: PathBuf },
    Postgres { url: String },
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::Parquet {
            dir: PathBuf::from("./warehouse"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub crons: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 6 * * *".to_string()],
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(text).context("parsing pipeline config")?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading config {}", path.display()))
    }

    /// `--config` wins over `YTR_CONFIG`, which wins over `./ytr.yaml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var("YTR_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("YTR_REPORTS_DIR") {
            self.reporting.reports_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("YTR_WATERMARK_PATH") {
            self.reporting.watermark_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            self.warehouse = WarehouseConfig::Postgres { url };
        }
        if let Some(agent) = lookup("YTR_USER_AGENT") {
            self.http.user_agent = agent;
        }
        if let Some(secs) = lookup("YTR_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http.timeout_secs = secs;
        }
        if let Some(enabled) = lookup("YTR_SCHEDULER_ENABLED") {
            self.schedule.enabled = matches!(enabled.as_str(), "1" | "true" | "TRUE" | "True");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.content_owner_id.trim().is_empty() {
            bail!("content_owner_id must not be empty");
        }
        if self.reporting.job_id.trim().is_empty() {
            bail!("reporting.job_id must not be empty");
        }
        let family = &self.reporting.report_family;
        if family.trim().is_empty() || family.contains(['/', '\\']) {
            bail!("reporting.report_family {family:?} must be a non-empty file name fragment");
        }
        if self.reporting.chunk_size_bytes == 0 {
            bail!("reporting.chunk_size_bytes must be positive");
        }
        if self.reporting.max_in_flight == 0 {
            bail!("reporting.max_in_flight must be at least 1");
        }
        if self.http.requests_per_second == Some(0) {
            bail!("http.requests_per_second must be positive when set");
        }
        if self.schedule.enabled && self.schedule.crons.is_empty() {
            bail!("schedule.enabled requires at least one cron expression");
        }
        for table in [
            &self.tables.reports.name,
            &self.tables.channels.name,
            &self.tables.videos.name,
            &self.tables.video_categories.name,
        ] {
            if table.trim().is_empty() {
                bail!("table names must not be empty");
            }
        }
        Ok(())
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.reporting.reports_dir.join("manifests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ytr_core::ColumnType;

    const MINIMAL: &str = r#"
content_owner_id: owner-1
reporting:
  job_id: job-1
  report_family: content_owner_estimated_revenue_a1
  start_date: 2024-01-01
tables:
  reports:
    name: youtube.reports
    schema:
      - { name: date, type: DATE }
      - { name: video_id, type: STRING }
      - { name: estimated_ad_revenue, type: FLOAT64 }
"#;

    fn parse(text: &str) -> Result<PipelineConfig> {
        let mut config: PipelineConfig = serde_yaml::from_str(text)?;
        config.apply_overrides(|_| None);
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.reporting.max_in_flight, 1);
        assert_eq!(config.reporting.reports_dir, PathBuf::from("./reports"));
        assert_eq!(config.tables.reports.schema.columns()[2].column_type, ColumnType::Float);
        assert_eq!(config.tables.channels.name, "youtube.channels");
        assert_eq!(config.warehouse, WarehouseConfig::default());
        assert_eq!(
            config.auth.reporting_service().resolved_base_url(),
            "https://youtubereporting.googleapis.com/v1/"
        );
        assert!(!config.schedule.enabled);
    }

    #[test]
    fn environment_overrides_apply() {
        let yaml = format!("{MINIMAL}warehouse:\n  kind: postgres\n  url: postgres://local/db\n");
        let mut config: PipelineConfig = serde_yaml::from_str(&yaml).unwrap();
        config.apply_overrides(|key| match key {
            "YTR_REPORTS_DIR" => Some("/data/reports".to_string()),
            "DATABASE_URL" => Some("postgres://prod/db".to_string()),
            "YTR_HTTP_TIMEOUT_SECS" => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(config.reporting.reports_dir, PathBuf::from("/data/reports"));
        assert_eq!(
            config.warehouse,
            WarehouseConfig::Postgres {
                url: "postgres://prod/db".into()
            }
        );
        assert_eq!(config.http.timeout_secs, 5);
        assert_eq!(config.manifest_dir(), PathBuf::from("/data/reports/manifests"));
    }

    #[test]
    fn database_url_switches_parquet_to_postgres() {
        let mut config = parse(MINIMAL).unwrap();
        config.apply_overrides(|key| (key == "DATABASE_URL").then(|| "postgres://ci/db".to_string()));
        assert_eq!(
            config.warehouse,
            WarehouseConfig::Postgres {
                url: "postgres://ci/db".into()
            }
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let duplicate = MINIMAL.replace("video_id, type: STRING", "date, type: STRING");
        assert!(parse(&duplicate).is_err());

        let bad_family = MINIMAL.replace("content_owner_estimated_revenue_a1", "a/b");
        assert!(parse(&bad_family).is_err());

        let zero = MINIMAL.replace("start_date: 2024-01-01", "start_date: 2024-01-01\n  max_in_flight: 0");
        assert!(parse(&zero).is_err());

        let no_rate = format!("{MINIMAL}http:\n  requests_per_second: 0\n");
        assert!(parse(&no_rate).is_err());
    }
}
