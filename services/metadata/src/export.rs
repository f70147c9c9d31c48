//! Columnar snapshot export.
//!
//! Exports lay a catalog out column by column with the catalog's persisted
//! field names and typed columns: identifiers and tags as UTF-8, integer
//! payload fields as Int64 and instants as microsecond timestamps in UTC.
//! Written exports are Parquet files, the HTTP API returns the same table
//! as JSON.

use crate::error::{CatalogError, Result};
use crate::record::{Payload, TemporalRecord};
use crate::version::{CatalogKind, VersionId};
use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Logical type of an export column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Utf8,
    Timestamp,
}

impl ColumnType {
    fn arrow_type(self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }
}

/// One cell of an export row
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Int64(Option<i64>),
    Utf8(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Utf8(Vec<Option<String>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
}

impl ColumnData {
    fn with_capacity(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            ColumnType::Utf8 => ColumnData::Utf8(Vec::with_capacity(capacity)),
            ColumnType::Timestamp => ColumnData::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Utf8(_) => ColumnType::Utf8,
            ColumnData::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(values) => values.len(),
            ColumnData::Utf8(values) => values.len(),
            ColumnData::Timestamp(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, value: Cell) {
        match (self, value) {
            (ColumnData::Int64(values), Cell::Int64(v)) => values.push(v),
            (ColumnData::Utf8(values), Cell::Utf8(v)) => values.push(v),
            (ColumnData::Timestamp(values), Cell::Timestamp(v)) => values.push(v),
            (column, value) => {
                warn!(?value, expected = ?column.column_type(), "Export value of the wrong type, stored as null");
                column.push_null();
            }
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnData::Int64(values) => values.push(None),
            ColumnData::Utf8(values) => values.push(None),
            ColumnData::Timestamp(values) => values.push(None),
        }
    }

    fn to_array(&self) -> ArrayRef {
        match self {
            ColumnData::Int64(values) => Arc::new(Int64Array::from(values.clone())),
            ColumnData::Utf8(values) => Arc::new(StringArray::from(values.clone())),
            ColumnData::Timestamp(values) => {
                let micros: Vec<Option<i64>> = values
                    .iter()
                    .map(|v| v.map(|t| t.timestamp_micros()))
                    .collect();
                Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub data: ColumnData,
}

/// A catalog snapshot in columnar form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotTable {
    pub catalog: CatalogKind,
    /// Version exported, `None` for the current pointer
    pub version: Option<String>,
    pub columns: Vec<Column>,
}

impl SnapshotTable {
    pub fn from_records<P: Payload>(
        version: Option<&VersionId>,
        records: &[TemporalRecord<P>],
    ) -> Self {
        let kind = P::KIND;

        let mut layout: Vec<(&str, ColumnType)> = vec![
            (kind.record_id_field(), ColumnType::Utf8),
            (kind.key_field(), ColumnType::Utf8),
        ];
        layout.extend_from_slice(P::COLUMNS);
        layout.extend_from_slice(&[
            ("effective_from", ColumnType::Timestamp),
            ("effective_to", ColumnType::Timestamp),
            (kind.tag_field(), ColumnType::Utf8),
            ("created_at", ColumnType::Timestamp),
        ]);

        let mut columns: Vec<Column> = layout
            .into_iter()
            .map(|(name, column_type)| Column {
                name: name.to_string(),
                data: ColumnData::with_capacity(column_type, records.len()),
            })
            .collect();

        for record in records {
            let mut row: Vec<Cell> = vec![
                Cell::Utf8(Some(record.record_id.clone())),
                Cell::Utf8(Some(record.key.clone())),
            ];
            row.extend(record.payload.column_values());
            row.push(Cell::Timestamp(Some(record.effective_from)));
            row.push(Cell::Timestamp(record.effective_to));
            row.push(Cell::Utf8(Some(record.tag.clone())));
            row.push(Cell::Timestamp(Some(record.created_at)));

            for (column, value) in columns.iter_mut().zip(row) {
                column.data.push(value);
            }
        }

        Self {
            catalog: kind,
            version: version.map(|v| v.to_string()),
            columns,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(c.name.as_str(), c.data.column_type().arrow_type(), true))
                .collect::<Vec<_>>(),
        )
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let arrays: Vec<ArrayRef> = self.columns.iter().map(|c| c.data.to_array()).collect();

        RecordBatch::try_new(Arc::new(self.schema()), arrays).map_err(|e| CatalogError::Export {
            what: "snapshot record batch",
            source: ParquetError::External(Box::new(e)),
        })
    }

    /// Snappy-compressed Parquet file holding the table as one row group
    pub fn to_parquet(&self) -> Result<Vec<u8>> {
        let batch = self.to_record_batch()?;
        let export_error = |source: ParquetError| CatalogError::Export {
            what: "snapshot export",
            source,
        };

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let mut buffer = Vec::new();
        let mut writer =
            ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).map_err(export_error)?;
        writer.write(&batch).map_err(export_error)?;
        writer.close().map_err(export_error)?;

        Ok(buffer)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| CatalogError::Serialization {
            what: "snapshot export",
            source,
        })
    }
}
