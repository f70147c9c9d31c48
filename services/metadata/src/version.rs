//! Catalog identities, version identifiers and blob path layout.
//!
//! ```text
//! {prefix}/
//! ├── manifest.json
//! ├── current/
//! │   ├── corrections.json
//! │   ├── corrections.head.json
//! │   ├── mapping.json
//! │   └── mapping.head.json
//! ├── v1735689600/
//! │   └── corrections.json
//! ├── v1735689600-1/
//! │   └── corrections.json
//! └── exports/
//!     └── corrections_v1735689600.parquet
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two catalogs kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    ExifCorrections,
    CameraMapping,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 2] = [CatalogKind::ExifCorrections, CatalogKind::CameraMapping];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "exif_corrections",
            CatalogKind::CameraMapping => "camera_mapping",
        }
    }

    /// File stem of version and current blobs
    pub fn artifact(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "corrections",
            CatalogKind::CameraMapping => "mapping",
        }
    }

    /// File stem of exported snapshots
    pub fn export_name(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "corrections",
            CatalogKind::CameraMapping => "mappings",
        }
    }

    /// Prefix of generated record ids
    pub fn record_id_prefix(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "correction",
            CatalogKind::CameraMapping => "mapping",
        }
    }

    /// Persisted field name of the record id
    pub fn record_id_field(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "correction_id",
            CatalogKind::CameraMapping => "mapping_id",
        }
    }

    /// Persisted field name of the primary key
    pub fn key_field(&self) -> &'static str {
        "camera_id"
    }

    /// Persisted field name of the tag
    pub fn tag_field(&self) -> &'static str {
        match self {
            CatalogKind::ExifCorrections => "rule_id",
            CatalogKind::CameraMapping => "map_version",
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exif_corrections" | "corrections" => Ok(CatalogKind::ExifCorrections),
            "camera_mapping" | "mapping" | "mappings" => Ok(CatalogKind::CameraMapping),
            other => Err(format!("unknown catalog: {other}")),
        }
    }
}

/// Identifier of an immutable catalog version
///
/// Rendered as the unix second of the write, with a `-{seq}` suffix when
/// more than one version was written within that second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    secs: i64,
    seq: u32,
}

impl VersionId {
    pub fn new(secs: i64, seq: u32) -> Self {
        Self { secs, seq }
    }

    /// First candidate id for a write at `at`
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::new(at.timestamp(), 0)
    }

    /// Smallest id strictly greater than this one within the same second
    pub fn bump(&self) -> Self {
        Self::new(self.secs, self.seq + 1)
    }

    /// Smallest id for a write at `at` that sorts after `latest`
    pub fn next_after(latest: Option<VersionId>, at: DateTime<Utc>) -> Self {
        let candidate = Self::at(at);
        match latest {
            Some(latest) if latest >= candidate => latest.bump(),
            _ => candidate,
        }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{}", self.secs)
        } else {
            write!(f, "{}-{}", self.secs, self.seq)
        }
    }
}

impl FromStr for VersionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let (secs, seq) = match s.split_once('-') {
            Some((secs, seq)) => (secs, Some(seq)),
            None => (s, None),
        };

        let secs = secs
            .parse::<i64>()
            .map_err(|_| format!("invalid version id: {s}"))?;
        let seq = match seq {
            Some(seq) => seq
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid version sequence: {s}"))?,
            None => 0,
        };

        Ok(Self::new(secs, seq))
    }
}

impl Serialize for VersionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which snapshot a read targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionRef {
    Current,
    Pinned(VersionId),
}

impl From<Option<VersionId>> for VersionRef {
    fn from(version: Option<VersionId>) -> Self {
        version.map(VersionRef::Pinned).unwrap_or(VersionRef::Current)
    }
}

impl Serialize for VersionRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Current => f.write_str("current"),
            VersionRef::Pinned(id) => write!(f, "{id}"),
        }
    }
}

/// A persisted version discovered by listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDescriptor {
    pub version_id: VersionId,
    pub path: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// Blob path layout of one catalog under a shared prefix
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    prefix: String,
    kind: CatalogKind,
}

impl CatalogPaths {
    pub fn new(prefix: impl Into<String>, kind: CatalogKind) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            kind,
        }
    }

    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self, version_id: &VersionId) -> String {
        format!("{}/v{}/{}.json", self.prefix, version_id, self.kind.artifact())
    }

    pub fn current(&self) -> String {
        format!("{}/current/{}.json", self.prefix, self.kind.artifact())
    }

    /// Newest reserved version id and the record count it holds
    pub fn head(&self) -> String {
        format!("{}/current/{}.head.json", self.prefix, self.kind.artifact())
    }

    pub fn for_ref(&self, version: VersionRef) -> String {
        match version {
            VersionRef::Current => self.current(),
            VersionRef::Pinned(id) => self.version(&id),
        }
    }

    /// Listing prefix covering every version of every catalog
    pub fn versions_prefix(&self) -> String {
        format!("{}/v", self.prefix)
    }

    pub fn export(&self, version: Option<&VersionId>) -> String {
        match version {
            Some(id) => format!("{}/exports/{}_v{}.parquet", self.prefix, self.kind.export_name(), id),
            None => format!("{}/exports/{}.parquet", self.prefix, self.kind.export_name()),
        }
    }

    /// Extract the version id from a version blob path of this catalog
    pub fn parse_version_path(&self, path: &str) -> Option<VersionId> {
        let rest = path.strip_prefix(&self.versions_prefix())?;
        let (id, file) = rest.split_once('/')?;
        if file != format!("{}.json", self.kind.artifact()) {
            return None;
        }
        id.parse().ok()
    }
}

/// Manifest location for a prefix
pub fn manifest_path(prefix: &str) -> String {
    format!("{}/manifest.json", prefix.trim_end_matches('/'))
}
