//! Warehouse sinks: full-replace loads of one table at a time.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::info;
use ytr_core::{CellValue, ColumnSpec, ColumnType, TableDescriptor, TabularDataset};

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;
/// Postgres caps a statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("dataset columns do not match the declared schema of {table}")]
    SchemaMismatch { table: String },
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("row {row} of {table}: column {column:?} holds a value of the wrong type")]
    CellType {
        table: String,
        row: usize,
        column: String,
    },
    #[error("writing snapshot for {table}: {source:#}")]
    Snapshot {
        table: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("loading {table} into postgres: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Replaces the whole content of `table` with `dataset`.
    async fn load(&self, dataset: &TabularDataset, table: &TableDescriptor) -> Result<(), SinkError>;
}

fn check_schema(dataset: &TabularDataset, table: &TableDescriptor) -> Result<(), SinkError> {
    if dataset.schema() != &table.schema {
        return Err(SinkError::SchemaMismatch {
            table: table.name.clone(),
        });
    }
    Ok(())
}

fn log_loaded(dataset: &TabularDataset, table: &TableDescriptor) {
    info!(
        table = %table.name,
        rows = dataset.len(),
        columns = dataset.schema().len(),
        "loaded rows into table"
    );
}

/// Writes one Parquet file per table under `dir`, replaced atomically on each load.
#[derive(Debug, Clone)]
pub struct ParquetSnapshotSink {
    dir: PathBuf,
}

impl ParquetSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, table_name: &str) -> PathBuf {
        let file_stem: String = table_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_stem}.parquet"))
    }
}

#[async_trait]
impl WarehouseSink for ParquetSnapshotSink {
    async fn load(&self, dataset: &TabularDataset, table: &TableDescriptor) -> Result<(), SinkError> {
        check_schema(dataset, table)?;
        if table.name.trim().is_empty() {
            return Err(SinkError::InvalidTableName(table.name.clone()));
        }
        let batch = record_batch(dataset, &table.name)?;
        let path = self.path_for(&table.name);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::Snapshot {
                table: table.name.clone(),
                source: anyhow::Error::new(e).context(format!("creating {}", self.dir.display())),
            })?;
        write_parquet_atomically(&path, batch).map_err(|source| SinkError::Snapshot {
            table: table.name.clone(),
            source,
        })?;
        log_loaded(dataset, table);
        Ok(())
    }
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::String => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

fn column_array(
    dataset: &TabularDataset,
    idx: usize,
    spec: &ColumnSpec,
    table: &str,
) -> Result<ArrayRef, SinkError> {
    let wrong_type = |row: usize| SinkError::CellType {
        table: table.to_string(),
        row,
        column: spec.name.clone(),
    };
    let cells = dataset.rows().iter().map(|row| &row[idx]).enumerate();

    let array: ArrayRef = match spec.column_type {
        ColumnType::String => Arc::new(StringArray::from(
            cells
                .map(|(_, cell)| match cell {
                    CellValue::Null => None,
                    other => Some(other.to_field()),
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Integer => Arc::new(Int64Array::from(
            cells
                .map(|(row, cell)| match cell {
                    CellValue::Null => Ok(None),
                    CellValue::Integer(v) => Ok(Some(*v)),
                    _ => Err(wrong_type(row)),
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnType::Float => Arc::new(Float64Array::from(
            cells
                .map(|(row, cell)| match cell {
                    CellValue::Null => Ok(None),
                    other => other.as_f64().map(Some).ok_or_else(|| wrong_type(row)),
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            cells
                .map(|(row, cell)| match cell {
                    CellValue::Null => Ok(None),
                    CellValue::Boolean(v) => Ok(Some(*v)),
                    _ => Err(wrong_type(row)),
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnType::Date => Arc::new(Date32Array::from(
            cells
                .map(|(row, cell)| match cell {
                    CellValue::Null => Ok(None),
                    CellValue::Date(d) => Ok(Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)),
                    _ => Err(wrong_type(row)),
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                cells
                    .map(|(row, cell)| match cell {
                        CellValue::Null => Ok(None),
                        CellValue::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                        _ => Err(wrong_type(row)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
            .with_timezone("UTC"),
        ),
    };
    Ok(array)
}

fn record_batch(dataset: &TabularDataset, table: &str) -> Result<RecordBatch, SinkError> {
    let columns = dataset.schema().columns();
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|spec| ArrowField::new(spec.name.as_str(), arrow_type(spec.column_type), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = columns
        .iter()
        .enumerate()
        .map(|(idx, spec)| column_array(dataset, idx, spec, table))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, arrays).map_err(|e| SinkError::Snapshot {
        table: table.to_string(),
        source: anyhow::Error::new(e).context("building record batch"),
    })
}

fn write_parquet_atomically(path: &Path, batch: RecordBatch) -> anyhow::Result<()> {
    use anyhow::Context;

    let temp_path = path.with_extension("parquet.part");
    let file = File::create(&temp_path).with_context(|| format!("creating {}", temp_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", temp_path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", temp_path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
    Ok(())
}

/// Loads tables into Postgres, creating them on first use.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|source| SinkError::Database {
                table: "<connect>".to_string(),
                source,
            })?;
        Ok(Self { pool })
    }
}

/// `youtube.reports` -> `"youtube"."reports"`; at most schema and table.
pub fn quoted_table_name(name: &str) -> Result<(Option<String>, String), SinkError> {
    let invalid = || SinkError::InvalidTableName(name.to_string());
    let parts: Vec<&str> = name.split('.').collect();
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(invalid());
    }
    let quote = |part: &str| format!("\"{}\"", part.replace('"', "\"\""));
    match parts.as_slice() {
        [table] => Ok((None, quote(table))),
        [schema, table] => {
            let schema = quote(schema);
            Ok((Some(schema.clone()), format!("{schema}.{}", quote(table))))
        }
        _ => Err(invalid()),
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

fn quoted_column(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql(qualified: &str, columns: &[ColumnSpec]) -> String {
    let defs = columns
        .iter()
        .map(|c| format!("{} {}", quoted_column(&c.name), sql_type(c.column_type)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {qualified} ({defs})")
}

fn push_cell(values: &mut Separated<'_, '_, Postgres, &'static str>, cell: &CellValue, column_type: ColumnType) {
    match column_type {
        ColumnType::String => values.push_bind(match cell {
            CellValue::Null => None,
            other => Some(other.to_field()),
        }),
        ColumnType::Integer => values.push_bind(match cell {
            CellValue::Integer(v) => Some(*v),
            _ => None,
        }),
        ColumnType::Float => values.push_bind(cell.as_f64()),
        ColumnType::Boolean => values.push_bind(match cell {
            CellValue::Boolean(v) => Some(*v),
            _ => None,
        }),
        ColumnType::Date => values.push_bind(match cell {
            CellValue::Date(d) => Some(*d),
            _ => None,
        }),
        ColumnType::Timestamp => values.push_bind(match cell {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }),
    };
}

#[async_trait]
impl WarehouseSink for PostgresSink {
    async fn load(&self, dataset: &TabularDataset, table: &TableDescriptor) -> Result<(), SinkError> {
        check_schema(dataset, table)?;
        let (schema, qualified) = quoted_table_name(&table.name)?;
        let db_err = |source: sqlx::Error| SinkError::Database {
            table: table.name.clone(),
            source,
        };
        let columns = table.schema.columns();
        let column_list = columns
            .iter()
            .map(|c| quoted_column(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if let Some(schema) = schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query(&create_table_sql(&qualified, columns))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(&format!("TRUNCATE TABLE {qualified}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let rows_per_insert = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        for rows in dataset.rows().chunks(rows_per_insert) {
            let mut insert: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {qualified} ({column_list}) "));
            insert.push_values(rows, |mut values, row| {
                for (cell, spec) in row.iter().zip(columns) {
                    push_cell(&mut values, cell, spec.column_type);
                }
            });
            insert.build().execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        log_loaded(dataset, table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;
    use ytr_core::OutputSchema;

    fn table() -> TableDescriptor {
        TableDescriptor {
            name: "youtube.reports".into(),
            schema: OutputSchema::new(vec![
                ColumnSpec::new("date", ColumnType::Date),
                ColumnSpec::new("video_id", ColumnType::String),
                ColumnSpec::new("views", ColumnType::Integer),
                ColumnSpec::new("estimated_ad_revenue", ColumnType::Float),
                ColumnSpec::new("is_self_uploaded", ColumnType::Boolean),
            ])
            .unwrap(),
        }
    }

    fn dataset() -> TabularDataset {
        let mut dataset = TabularDataset::new(table().schema);
        for (video, views) in [("v1", 10), ("v2", 20)] {
            dataset
                .push_row(vec![
                    CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                    CellValue::String(video.into()),
                    CellValue::Integer(views),
                    CellValue::Float(1.5),
                    CellValue::Null,
                ])
                .unwrap();
        }
        dataset
    }

    #[tokio::test]
    async fn parquet_snapshot_replaces_previous_load() {
        let dir = tempdir().expect("tempdir");
        let sink = ParquetSnapshotSink::new(dir.path());
        sink.load(&dataset(), &table()).await.expect("first load");
        sink.load(&dataset(), &table()).await.expect("second load");

        let path = sink.path_for("youtube.reports");
        assert!(path.ends_with("youtube.reports.parquet"));
        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn schema_mismatch_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let sink = ParquetSnapshotSink::new(dir.path());
        let other = TableDescriptor {
            name: "youtube.reports".into(),
            schema: OutputSchema::strings(&["date"]).unwrap(),
        };
        let err = sink.load(&dataset(), &other).await.unwrap_err();
        assert!(matches!(err, SinkError::SchemaMismatch { .. }));
    }

    #[test]
    fn epoch_day_offset_matches_arrow() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(epoch.num_days_from_ce(), UNIX_EPOCH_DAYS_FROM_CE);
    }

    #[test]
    fn table_names_are_quoted_and_validated() {
        let (schema, qualified) = quoted_table_name("youtube.reports").unwrap();
        assert_eq!(schema.as_deref(), Some("\"youtube\""));
        assert_eq!(qualified, "\"youtube\".\"reports\"");
        assert_eq!(quoted_table_name("we\"ird").unwrap().1, "\"we\"\"ird\"");
        assert!(quoted_table_name("a.b.c").is_err());
        assert!(quoted_table_name("a..b").is_err());
    }

    #[test]
    fn create_table_uses_declared_types() {
        let sql = create_table_sql("\"youtube\".\"reports\"", table().schema.columns());
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"youtube\".\"reports\" (\"date\" DATE, \"video_id\" TEXT, \
\"views\" BIGINT, \"estimated_ad_revenue\" DOUBLE PRECISION, \"is_self_uploaded\" BOOLEAN)"
        );
    }
}
