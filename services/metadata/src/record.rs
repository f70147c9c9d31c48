//! Time-bounded records and the snapshot codec.
//!
//! A snapshot is a JSON array holding every record of a catalog. Each
//! catalog keeps its own persisted field names (`correction_id`/`rule_id`
//! for corrections, `mapping_id`/`map_version` for mappings), so the codec
//! maps between those names and the generic [`TemporalRecord`] fields.

use crate::error::{CatalogError, Result};
use crate::export::{Cell, ColumnType};
use crate::version::{CatalogKind, VersionRef};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Type-specific content of a catalog record
pub trait Payload: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Catalog this payload belongs to
    const KIND: CatalogKind;

    /// Export columns contributed by the payload, in order
    const COLUMNS: &'static [(&'static str, ColumnType)];

    /// Cells for [`Payload::COLUMNS`], in the same order
    fn column_values(&self) -> Vec<Cell>;

    /// Reject malformed payloads before anything is written
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// A record valid over an inclusive time interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalRecord<P> {
    pub record_id: String,
    pub key: String,
    pub payload: P,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

impl<P> TemporalRecord<P> {
    /// Whether `at` falls inside `[effective_from, effective_to]`
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |to| at <= to)
    }

    /// Whether two records' intervals share at least one instant
    pub fn overlaps(&self, other: &TemporalRecord<P>) -> bool {
        let starts_before_other_ends = other.effective_to.map_or(true, |to| self.effective_from <= to);
        let other_starts_before_end = self.effective_to.map_or(true, |to| other.effective_from <= to);
        starts_before_other_ends && other_starts_before_end
    }
}

/// A record selected by point-in-time resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<P> {
    #[serde(flatten)]
    pub record: TemporalRecord<P>,
    /// Snapshot the record was resolved from
    pub source: VersionRef,
}

impl<P> Resolved<P> {
    pub fn payload(&self) -> &P {
        &self.record.payload
    }
}

/// Pick the record for `lookup` at `at`, using `key_fn` to read each record's key
///
/// Among several matches the latest `created_at` wins; on equal `created_at`
/// the record appended last wins.
pub fn resolve_in<'a, P, F>(
    records: &'a [TemporalRecord<P>],
    lookup: &str,
    at: DateTime<Utc>,
    key_fn: F,
) -> Option<&'a TemporalRecord<P>>
where
    F: Fn(&TemporalRecord<P>) -> &str,
{
    records
        .iter()
        .filter(|r| key_fn(*r) == lookup && r.contains(at))
        .max_by_key(|r| r.created_at)
}

/// One winning record per distinct key at `at`, ordered by key
pub fn active_in<P>(records: &[TemporalRecord<P>], at: DateTime<Utc>) -> Vec<&TemporalRecord<P>> {
    let mut winners: BTreeMap<&str, &TemporalRecord<P>> = BTreeMap::new();

    for record in records.iter().filter(|r| r.contains(at)) {
        match winners.get(record.key.as_str()) {
            Some(existing) if existing.created_at > record.created_at => {}
            _ => {
                winners.insert(record.key.as_str(), record);
            }
        }
    }

    winners.into_values().collect()
}

/// Validate the caller-supplied parts of a new record
pub fn validate_new<P: Payload>(
    key: &str,
    payload: &P,
    effective_from: DateTime<Utc>,
    effective_to: Option<DateTime<Utc>>,
    tag: &str,
) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CatalogError::Validation(format!(
            "{} must not be empty",
            P::KIND.key_field()
        )));
    }

    if tag.trim().is_empty() {
        return Err(CatalogError::Validation(format!(
            "{} must not be empty",
            P::KIND.tag_field()
        )));
    }

    if let Some(to) = effective_to {
        if to <= effective_from {
            return Err(CatalogError::Validation(format!(
                "effective_to ({}) must be after effective_from ({})",
                to.to_rfc3339(),
                effective_from.to_rfc3339()
            )));
        }
    }

    payload.validate().map_err(CatalogError::Validation)
}

/// Record id for a new record, unique among `existing`
pub fn next_record_id<P>(
    kind: CatalogKind,
    key: &str,
    effective_from: DateTime<Utc>,
    existing: &[TemporalRecord<P>],
) -> String {
    let base = format!(
        "{}_{}_{}",
        kind.record_id_prefix(),
        key,
        effective_from.timestamp()
    );

    if !existing.iter().any(|r| r.record_id == base) {
        return base;
    }

    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !existing.iter().any(|r| &r.record_id == candidate))
        .unwrap_or(base)
}

/// Parse a persisted instant, normalizing to UTC
///
/// Accepts RFC 3339 with any offset; a timestamp without offset is read as UTC.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serialize a full record set in the catalog's persisted layout
pub fn encode_snapshot<P: Payload>(records: &[TemporalRecord<P>]) -> Result<Vec<u8>> {
    let kind = P::KIND;
    let mut rows = Vec::with_capacity(records.len());

    for record in records {
        let payload = serde_json::to_value(&record.payload).map_err(|source| {
            CatalogError::Serialization {
                what: "record payload",
                source,
            }
        })?;

        let mut row = match payload {
            Value::Object(fields) => fields,
            _ => {
                return Err(CatalogError::Serialization {
                    what: "record payload",
                    source: <serde_json::Error as serde::ser::Error>::custom(
                        "payload must serialize to a JSON object",
                    ),
                })
            }
        };

        row.insert(kind.record_id_field().to_string(), Value::String(record.record_id.clone()));
        row.insert(kind.key_field().to_string(), Value::String(record.key.clone()));
        row.insert(
            "effective_from".to_string(),
            Value::String(record.effective_from.to_rfc3339()),
        );
        row.insert(
            "effective_to".to_string(),
            record
                .effective_to
                .map(|to| Value::String(to.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        row.insert(kind.tag_field().to_string(), Value::String(record.tag.clone()));
        row.insert(
            "created_at".to_string(),
            Value::String(record.created_at.to_rfc3339()),
        );

        rows.push(Value::Object(row));
    }

    serde_json::to_vec_pretty(&rows).map_err(|source| CatalogError::Serialization {
        what: "snapshot",
        source,
    })
}

/// Parse a snapshot blob stored at `path`
///
/// Any structural problem fails the whole snapshot; records are never skipped.
pub fn decode_snapshot<P: Payload>(path: &str, bytes: &[u8]) -> Result<Vec<TemporalRecord<P>>> {
    let corrupt = |source: serde_json::Error| CatalogError::Corrupt {
        path: path.to_string(),
        source,
    };

    let rows: Vec<Map<String, Value>> = serde_json::from_slice(bytes).map_err(corrupt)?;

    rows.into_iter()
        .enumerate()
        .map(|(index, row)| decode_row::<P>(row).map_err(|msg| corrupt(invalid(index, msg))))
        .collect()
}

fn invalid(index: usize, msg: String) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom(format!("record {index}: {msg}"))
}

fn decode_row<P: Payload>(mut row: Map<String, Value>) -> std::result::Result<TemporalRecord<P>, String> {
    let kind = P::KIND;

    let record_id = take_string(&mut row, kind.record_id_field())?;
    let key = take_string(&mut row, kind.key_field())?;
    let tag = take_string(&mut row, kind.tag_field())?;
    let effective_from = take_instant(&mut row, "effective_from")?
        .ok_or_else(|| "missing effective_from".to_string())?;
    let effective_to = take_instant(&mut row, "effective_to")?;
    let created_at = take_instant(&mut row, "created_at")?
        .ok_or_else(|| "missing created_at".to_string())?;

    let payload = serde_json::from_value(Value::Object(row))
        .map_err(|e| format!("invalid payload: {e}"))?;

    Ok(TemporalRecord {
        record_id,
        key,
        payload,
        effective_from,
        effective_to,
        tag,
        created_at,
    })
}

fn take_string(row: &mut Map<String, Value>, field: &str) -> std::result::Result<String, String> {
    match row.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("{field} must be a string, got {other}")),
        None => Err(format!("missing {field}")),
    }
}

fn take_instant(
    row: &mut Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<DateTime<Utc>>, String> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_instant(&s)
            .map(Some)
            .ok_or_else(|| format!("{field} is not a timestamp: {s}")),
        Some(other) => Err(format!("{field} must be a string, got {other}")),
    }
}
