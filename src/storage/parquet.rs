//! Write a [`QueryResult`] to a Parquet file.
//!
//! Backends without a native export path (SQLite, BigQuery, memory) run the
//! query and hand the rows here. Rows arrive as nullable strings, so each
//! column's Arrow type is inferred: `Int64` when every value parses as an
//! integer, `Float64` when every value parses as a number, `Utf8` otherwise.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use super::QueryResult;

/// Errors that can occur during Parquet conversion or writing.
#[derive(Debug, thiserror::Error)]
pub enum ParquetExportError {
    #[error("Arrow conversion error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet write error: {0}")]
    Write(#[from] parquet::errors::ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn infer_type(rows: &[Vec<Option<String>>], col: usize) -> DataType {
    let mut values = rows
        .iter()
        .filter_map(|row| row.get(col).and_then(|v| v.as_deref()))
        .peekable();
    if values.peek().is_none() {
        return DataType::Utf8;
    }
    let values: Vec<&str> = values.collect();
    if values.iter().all(|v| v.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if values.iter().all(|v| v.parse::<f64>().is_ok()) {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

fn build_array(rows: &[Vec<Option<String>>], col: usize, data_type: &DataType) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(col).and_then(|v| v.as_deref()));
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.and_then(|s| s.parse::<i64>().ok()));
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.and_then(|s| s.parse::<f64>().ok()));
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for cell in cells {
                builder.append_option(cell);
            }
            Arc::new(builder.finish())
        }
    }
}

/// Convert a [`QueryResult`] into an Arrow [`RecordBatch`].
pub fn result_to_record_batch(result: &QueryResult) -> Result<RecordBatch, ParquetExportError> {
    let types: Vec<DataType> = (0..result.columns.len())
        .map(|col| infer_type(&result.rows, col))
        .collect();
    let schema = Arc::new(Schema::new(
        result
            .columns
            .iter()
            .zip(&types)
            .map(|(name, data_type)| Field::new(name, data_type.clone(), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = types
        .iter()
        .enumerate()
        .map(|(col, data_type)| build_array(&result.rows, col, data_type))
        .collect();
    Ok(RecordBatch::try_new(schema, arrays)?)
}

/// Write `result` to `path` with Zstd compression. Returns the row count.
pub fn write_parquet(result: &QueryResult, path: &Path) -> Result<u64, ParquetExportError> {
    let batch = result_to_record_batch(result)?;
    let row_count = batch.num_rows() as u64;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    debug!(path = %path.display(), rows = row_count, "Wrote Parquet file");
    Ok(row_count)
}
