//! Core domain model for the YouTube reports ETL.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ytr-core";

/// Timestamp layout used for the watermark and TIMESTAMP cells.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Compact date layout used by the remote reports and by report file names.
pub const REPORT_DATE_FORMAT: &str = "%Y%m%d";

/// One remote report instance as listed by the reporting job catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDescriptor {
    pub id: String,
    pub download_url: String,
    pub created_at: DateTime<Utc>,
    pub coverage_date: NaiveDate,
}

/// "Processed up to" boundary, kept at whole-second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(0))
    }

    pub fn start_of(date: NaiveDate) -> Self {
        Self(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Next watermark for a successful run finishing the window at `now`.
    /// Never moves backwards.
    pub fn advance_to(self, now: DateTime<Utc>) -> Self {
        self.max(Self::new(now))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(WATERMARK_FORMAT))
    }
}

#[derive(Debug, Error)]
#[error("invalid watermark {value:?}: {source}")]
pub struct WatermarkParseError {
    value: String,
    source: chrono::ParseError,
}

impl FromStr for Watermark {
    type Err = WatermarkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Self::new(dt.with_timezone(&Utc)))
            .map_err(|source| WatermarkParseError {
                value: s.to_string(),
                source,
            })
    }
}

impl From<Watermark> for String {
    fn from(value: Watermark) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Watermark {
    type Error = WatermarkParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Warehouse column types accepted in the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    #[serde(alias = "INT64")]
    Integer,
    #[serde(alias = "FLOAT64", alias = "NUMERIC")]
    Float,
    #[serde(alias = "BOOL")]
    Boolean,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema declares no columns")]
    Empty,
    #[error("schema column #{0} has an empty name")]
    EmptyColumnName(usize),
    #[error("schema declares column {0:?} more than once")]
    DuplicateColumn(String),
}

/// Ordered, validated list of output columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<ColumnSpec>", try_from = "Vec<ColumnSpec>")]
pub struct OutputSchema {
    columns: Vec<ColumnSpec>,
}

impl OutputSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (idx, column) in columns.iter().enumerate() {
            if column.name.trim().is_empty() {
                return Err(SchemaError::EmptyColumnName(idx));
            }
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    /// Schema where every column is a STRING.
    pub fn strings(names: &[&str]) -> Result<Self, SchemaError> {
        Self::new(
            names
                .iter()
                .map(|name| ColumnSpec::new(*name, ColumnType::String))
                .collect(),
        )
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

impl From<OutputSchema> for Vec<ColumnSpec> {
    fn from(value: OutputSchema) -> Self {
        value.columns
    }
}

impl TryFrom<Vec<ColumnSpec>> for OutputSchema {
    type Error = SchemaError;

    fn try_from(value: Vec<ColumnSpec>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read {raw:?} as {column_type:?}")]
pub struct CellParseError {
    pub raw: String,
    pub column_type: ColumnType,
}

/// One typed cell of a dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    /// Reads a textual cell as `column_type`. Empty text is NULL for every type.
    pub fn parse(raw: &str, column_type: ColumnType) -> Result<Self, CellParseError> {
        let err = || CellParseError {
            raw: raw.to_string(),
            column_type,
        };
        let text = raw.trim();
        if text.is_empty() {
            return Ok(Self::Null);
        }

        match column_type {
            ColumnType::String => Ok(Self::String(raw.to_string())),
            ColumnType::Integer => text.parse().map(Self::Integer).map_err(|_| err()),
            ColumnType::Float => text.parse().map(Self::Float).map_err(|_| err()),
            ColumnType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Self::Boolean(true)),
                "false" | "0" => Ok(Self::Boolean(false)),
                _ => Err(err()),
            },
            ColumnType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(text, REPORT_DATE_FORMAT))
                .map(Self::Date)
                .map_err(|_| err()),
            ColumnType::Timestamp => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
                })
                .map(Self::Timestamp)
                .map_err(|_| err()),
        }
    }

    /// Canonical text form written to processed CSV files.
    pub fn to_field(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(v) => v.clone(),
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Boolean(v) => v.to_string(),
            Self::Date(v) => v.format("%Y-%m-%d").to_string(),
            Self::Timestamp(v) => v.format(WATERMARK_FORMAT).to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    #[error("row has {actual} cells but the schema has {expected} columns")]
    RowWidth { expected: usize, actual: usize },
    #[error("cannot append a dataset with a different schema")]
    SchemaMismatch,
}

/// Schema-shaped rows handed to a warehouse sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularDataset {
    schema: OutputSchema,
    rows: Vec<Vec<CellValue>>,
}

impl TabularDataset {
    pub fn new(schema: OutputSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<(), DatasetError> {
        if row.len() != self.schema.len() {
            return Err(DatasetError::RowWidth {
                expected: self.schema.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn append(&mut self, other: TabularDataset) -> Result<(), DatasetError> {
        if other.schema != self.schema {
            return Err(DatasetError::SchemaMismatch);
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Cells of one named column, in row order.
    pub fn column<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a CellValue> + 'a> {
        let idx = self.schema.position(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }
}

/// Warehouse target: table name plus its declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub schema: OutputSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStage {
    Raw,
    Processed,
}

impl ReportStage {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Processed => "processed",
        }
    }
}

/// Deterministic `<stage>-<family>-<YYYYMMDD>.csv` report file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportFileName {
    pub stage: ReportStage,
    pub family: String,
    pub coverage_date: NaiveDate,
}

impl ReportFileName {
    pub fn new(stage: ReportStage, family: impl Into<String>, coverage_date: NaiveDate) -> Self {
        Self {
            stage,
            family: family.into(),
            coverage_date,
        }
    }

    /// Same family and date under another stage prefix.
    pub fn with_stage(&self, stage: ReportStage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.csv",
            self.stage.prefix(),
            self.family,
            self.coverage_date.format(REPORT_DATE_FORMAT)
        )
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".csv")?;
        let (prefix, rest) = stem.split_once('-')?;
        let stage = match prefix {
            "raw" => ReportStage::Raw,
            "processed" => ReportStage::Processed,
            _ => return None,
        };
        let (family, date) = rest.rsplit_once('-')?;
        if family.is_empty() || date.len() != 8 {
            return None;
        }
        let coverage_date = NaiveDate::parse_from_str(date, REPORT_DATE_FORMAT).ok()?;
        Some(Self::new(stage, family, coverage_date))
    }
}

impl fmt::Display for ReportFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub name: String,
    pub category_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCategory {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn report_file_names_round_trip_with_dashed_family() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let name = ReportFileName::new(ReportStage::Raw, "content-owner-revenue", date);
        assert_eq!(name.file_name(), "raw-content-owner-revenue-20240101.csv");

        let parsed = ReportFileName::parse("raw-content-owner-revenue-20240101.csv").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(
            parsed.with_stage(ReportStage::Processed).file_name(),
            "processed-content-owner-revenue-20240101.csv"
        );
        assert!(ReportFileName::parse("notes-foo-20240101.csv").is_none());
        assert!(ReportFileName::parse("raw-foo-2024011.csv").is_none());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let prior = Watermark::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        let earlier = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 4, 1, 12, 30, 0).unwrap();

        assert_eq!(prior.advance_to(earlier), prior);
        assert_eq!(prior.advance_to(later).at(), later);
        assert_eq!(prior.advance_to(later).to_string(), "2024-04-01T12:30:00Z");
        assert_eq!("2024-04-01T12:30:00Z".parse::<Watermark>().unwrap().at(), later);
    }

    #[test]
    fn schema_rejects_duplicate_columns() {
        let err = OutputSchema::new(vec![
            ColumnSpec::new("date", ColumnType::Date),
            ColumnSpec::new("date", ColumnType::String),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateColumn("date".into()));
        assert_eq!(OutputSchema::new(vec![]).unwrap_err(), SchemaError::Empty);
    }

    #[test]
    fn cells_parse_per_column_type() {
        assert_eq!(
            CellValue::parse("20240101", ColumnType::Date).unwrap(),
            CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert_eq!(CellValue::parse("", ColumnType::Integer).unwrap(), CellValue::Null);
        assert_eq!(CellValue::parse("True", ColumnType::Boolean).unwrap(), CellValue::Boolean(true));
        assert_eq!(CellValue::Float(2.5).to_field(), "2.5");
        assert!(CellValue::parse("abc", ColumnType::Float).is_err());
    }
}
