//! Raw report CSV to schema-shaped processed CSV.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use ytr_core::{
    CellParseError, CellValue, ColumnType, DatasetError, OutputSchema, ReportFileName, ReportStage,
    TabularDataset, REPORT_DATE_FORMAT,
};
use ytr_storage::ReportStore;

pub const DATE_COLUMN: &str = "date";
pub const AD_IMPRESSIONS_COLUMN: &str = "ad_impressions";
pub const ESTIMATED_CPM_COLUMN: &str = "estimated_cpm";
pub const UPLOADER_TYPE_COLUMN: &str = "uploader_type";

/// Derived: `ad_impressions * estimated_cpm / 1000`.
pub const ESTIMATED_AD_REVENUE_COLUMN: &str = "estimated_ad_revenue";
/// Derived: `uploader_type == "self"`.
pub const IS_SELF_UPLOADED_COLUMN: &str = "is_self_uploaded";

/// A raw report written during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawReportFile {
    pub name: ReportFileName,
    pub path: PathBuf,
    pub report_id: String,
    pub byte_size: u64,
    pub sha256: String,
}

/// A processed report written during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedReportFile {
    pub name: ReportFileName,
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum MalformedReportError {
    #[error("{file}: required column {column:?} is missing")]
    MissingColumn { file: String, column: String },
    #[error("{file}: row {row}, column {column:?}: {source}")]
    BadValue {
        file: String,
        row: usize,
        column: String,
        #[source]
        source: CellParseError,
    },
    #[error("{file}: unreadable CSV: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("{file}: {source}")]
    Shape {
        file: String,
        #[source]
        source: DatasetError,
    },
    #[error("{file}: not a raw report file")]
    NotRaw { file: String },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Malformed(#[from] MalformedReportError),
    #[error("report storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Where one output column takes its value from.
#[derive(Debug, Clone, Copy)]
enum ColumnSource {
    Copy(usize),
    ReportDate(usize),
    AdRevenue { impressions: usize, cpm: usize },
    SelfUploaded(usize),
}

fn plan_columns(
    file: &str,
    headers: &csv::StringRecord,
    schema: &OutputSchema,
) -> Result<Vec<ColumnSource>, MalformedReportError> {
    let find = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| MalformedReportError::MissingColumn {
                file: file.to_string(),
                column: column.to_string(),
            })
    };

    schema
        .columns()
        .iter()
        .map(|spec| match spec.name.as_str() {
            ESTIMATED_AD_REVENUE_COLUMN => Ok(ColumnSource::AdRevenue {
                impressions: find(AD_IMPRESSIONS_COLUMN)?,
                cpm: find(ESTIMATED_CPM_COLUMN)?,
            }),
            IS_SELF_UPLOADED_COLUMN => Ok(ColumnSource::SelfUploaded(find(UPLOADER_TYPE_COLUMN)?)),
            DATE_COLUMN => Ok(ColumnSource::ReportDate(find(DATE_COLUMN)?)),
            other => Ok(ColumnSource::Copy(find(other)?)),
        })
        .collect()
}

fn report_date_cell(raw: &str, column_type: ColumnType) -> Result<CellValue, CellParseError> {
    let err = || CellParseError {
        raw: raw.to_string(),
        column_type,
    };
    let text = raw.trim();
    if text.is_empty() {
        return Ok(CellValue::Null);
    }
    let date = chrono::NaiveDate::parse_from_str(text, REPORT_DATE_FORMAT)
        .or_else(|_| chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d"))
        .map_err(|_| err())?;
    match column_type {
        ColumnType::Date => Ok(CellValue::Date(date)),
        ColumnType::String => Ok(CellValue::String(date.format("%Y-%m-%d").to_string())),
        ColumnType::Timestamp => Ok(CellValue::Timestamp(
            date.and_time(chrono::NaiveTime::MIN).and_utc(),
        )),
        _ => Err(err()),
    }
}

fn derived_cell(
    source: ColumnSource,
    record: &csv::StringRecord,
    column_type: ColumnType,
) -> Result<CellValue, CellParseError> {
    let field = |idx: usize| record.get(idx).unwrap_or("");
    match source {
        ColumnSource::Copy(idx) => CellValue::parse(field(idx), column_type),
        ColumnSource::ReportDate(idx) => report_date_cell(field(idx), column_type),
        ColumnSource::AdRevenue { impressions, cpm } => {
            let impressions = CellValue::parse(field(impressions), ColumnType::Float)?;
            let cpm = CellValue::parse(field(cpm), ColumnType::Float)?;
            match (impressions.as_f64(), cpm.as_f64()) {
                (Some(impressions), Some(cpm)) => {
                    CellValue::parse(&(impressions * cpm / 1000.0).to_string(), column_type)
                }
                _ => Ok(CellValue::Null),
            }
        }
        ColumnSource::SelfUploaded(idx) => {
            let is_self = field(idx).trim() == "self";
            CellValue::parse(&is_self.to_string(), column_type)
        }
    }
}

/// Normalizes one raw report's bytes into processed CSV bytes.
/// Output column order follows `schema`; source columns outside it are dropped.
pub fn normalize_csv(
    file: &str,
    raw: &[u8],
    schema: &OutputSchema,
) -> Result<(Vec<u8>, usize), MalformedReportError> {
    let csv_err = |source: csv::Error| MalformedReportError::Csv {
        file: file.to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(raw);
    let headers = reader.headers().map_err(csv_err)?.clone();
    let plan = plan_columns(file, &headers, schema)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema.names()).map_err(csv_err)?;

    let mut rows = 0usize;
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record).map_err(csv_err)? {
        rows += 1;
        let mut out = Vec::with_capacity(plan.len());
        for (source, spec) in plan.iter().zip(schema.columns()) {
            let cell = derived_cell(*source, &record, spec.column_type).map_err(|source| {
                MalformedReportError::BadValue {
                    file: file.to_string(),
                    row: rows,
                    column: spec.name.clone(),
                    source,
                }
            })?;
            out.push(cell.to_field());
        }
        writer.write_record(&out).map_err(csv_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| csv_err(csv::Error::from(e.into_error())))?;
    Ok((bytes, rows))
}

/// Parses a processed report back into typed rows of `schema`.
pub fn read_processed(
    file: &str,
    bytes: &[u8],
    schema: &OutputSchema,
) -> Result<TabularDataset, MalformedReportError> {
    let csv_err = |source: csv::Error| MalformedReportError::Csv {
        file: file.to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(bytes);
    let headers = reader.headers().map_err(csv_err)?.clone();
    let positions = schema
        .columns()
        .iter()
        .map(|spec| {
            headers
                .iter()
                .position(|h| h == spec.name)
                .ok_or_else(|| MalformedReportError::MissingColumn {
                    file: file.to_string(),
                    column: spec.name.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut dataset = TabularDataset::new(schema.clone());
    for (row_no, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let row = positions
            .iter()
            .zip(schema.columns())
            .map(|(&idx, spec)| {
                CellValue::parse(record.get(idx).unwrap_or(""), spec.column_type).map_err(
                    |source| MalformedReportError::BadValue {
                        file: file.to_string(),
                        row: row_no + 1,
                        column: spec.name.clone(),
                        source,
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        dataset
            .push_row(row)
            .map_err(|source| MalformedReportError::Shape {
                file: file.to_string(),
                source,
            })?;
    }
    Ok(dataset)
}

/// Turns raw files in the report store into their processed counterparts.
#[derive(Debug, Clone)]
pub struct ReportNormalizer {
    store: ReportStore,
    schema: OutputSchema,
}

impl ReportNormalizer {
    pub fn new(store: ReportStore, schema: OutputSchema) -> Self {
        Self { store, schema }
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    pub async fn normalize(&self, raw: &RawReportFile) -> Result<ProcessedReportFile, NormalizeError> {
        if raw.name.stage != ReportStage::Raw {
            return Err(MalformedReportError::NotRaw {
                file: raw.name.file_name(),
            }
            .into());
        }
        let bytes = self
            .store
            .read(&raw.name)
            .await
            .map_err(NormalizeError::Storage)?;
        let (processed, rows) = normalize_csv(&raw.name.file_name(), &bytes, &self.schema)?;

        let name = raw.name.with_stage(ReportStage::Processed);
        let stored = self
            .store
            .write(name, &processed)
            .await
            .map_err(NormalizeError::Storage)?;
        info!(report = %stored.name, rows, "processed report written");
        Ok(ProcessedReportFile {
            name: stored.name,
            path: stored.path,
            rows,
            byte_size: stored.byte_size,
            sha256: stored.content_hash,
        })
    }
}
