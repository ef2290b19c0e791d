//! Snapshot naming protocol.
//!
//! Maps a structured [`Snapshot`] to its object path and back. Two naming
//! generations exist and both must stay parseable:
//!
//! - `v1`: `{base}/v1/Backup-{unix}/{snapName}`
//! - `v2`: `{base}/v2/{snapName}`
//!
//! where `snapName` is `{Kind}-{start:08}-{last:08}-{unix}[.gz|.zlib|.lzw][.final]`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapstoreError};

/// Legacy naming-version tag.
pub const BACKUP_VERSION_V1: &str = "v1";
/// Current naming-version tag.
pub const BACKUP_VERSION_V2: &str = "v2";

pub const FINAL_SUFFIX: &str = ".final";
const SNAPSHOT_DIR_PREFIX: &str = "Backup-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SnapshotKind {
    Full,
    Incr,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Full => "Full",
            SnapshotKind::Incr => "Incr",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Full" => Ok(SnapshotKind::Full),
            "Incr" => Ok(SnapshotKind::Incr),
            other => Err(format!("unknown snapshot kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompressionSuffix {
    #[serde(rename = ".gz")]
    Gzip,
    #[serde(rename = ".zlib")]
    Zlib,
    #[serde(rename = ".lzw")]
    Lzw,
}

impl CompressionSuffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionSuffix::Gzip => ".gz",
            CompressionSuffix::Zlib => ".zlib",
            CompressionSuffix::Lzw => ".lzw",
        }
    }

    /// Match a file extension given without its leading dot.
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(CompressionSuffix::Gzip),
            "zlib" => Some(CompressionSuffix::Zlib),
            "lzw" => Some(CompressionSuffix::Lzw),
            _ => None,
        }
    }
}

/// One stored backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    pub start_revision: u64,
    pub last_revision: u64,
    /// Second precision; sub-second parts are dropped on construction.
    pub created_on: DateTime<Utc>,
    pub compression_suffix: Option<CompressionSuffix>,
    pub is_final: bool,
    pub prefix: String,
    pub snap_dir: String,
    pub snap_name: String,
}

/// Snapshots ordered by [`compare_snapshots`].
pub type SnapList = Vec<Snapshot>;

impl Snapshot {
    /// Create a `v2` style snapshot with a generated name and no directory.
    pub fn new(
        kind: SnapshotKind,
        start_revision: u64,
        last_revision: u64,
        created_on: DateTime<Utc>,
    ) -> Self {
        let created_on =
            DateTime::<Utc>::from_timestamp(created_on.timestamp(), 0).unwrap_or(created_on);
        let mut snap = Self {
            kind,
            start_revision,
            last_revision,
            created_on,
            compression_suffix: None,
            is_final: false,
            prefix: String::new(),
            snap_dir: String::new(),
            snap_name: String::new(),
        };
        snap.generate_snapshot_name();
        snap
    }

    pub fn with_compression(mut self, suffix: CompressionSuffix) -> Self {
        self.compression_suffix = Some(suffix);
        self.generate_snapshot_name();
        self
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self.generate_snapshot_name();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Regenerate `snap_name` from the structured fields.
    pub fn generate_snapshot_name(&mut self) {
        self.snap_name = format!(
            "{}-{:08}-{:08}-{}{}{}",
            self.kind,
            self.start_revision,
            self.last_revision,
            self.created_on.timestamp(),
            self.compression_suffix.map(|c| c.as_str()).unwrap_or(""),
            if self.is_final { FINAL_SUFFIX } else { "" },
        );
    }

    /// Set the legacy `v1` grouping directory, `Backup-{unix}`.
    pub fn generate_snapshot_directory(&mut self) {
        self.snap_dir = format!("{}{}", SNAPSHOT_DIR_PREFIX, self.created_on.timestamp());
    }

    /// Full object path of this snapshot.
    pub fn path(&self) -> String {
        snapshot_path(&self.prefix, &self.snap_dir, &self.snap_name)
    }
}

impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_on
            .cmp(&other.created_on)
            .then(self.start_revision.cmp(&other.start_revision))
            .then(self.last_revision.cmp(&other.last_revision))
            .then(self.kind.cmp(&other.kind))
            .then_with(|| self.snap_name.cmp(&other.snap_name))
            .then_with(|| self.snap_dir.cmp(&other.snap_dir))
            .then_with(|| self.prefix.cmp(&other.prefix))
            .then(self.compression_suffix.cmp(&other.compression_suffix))
            .then(self.is_final.cmp(&other.is_final))
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order used to sort a [`SnapList`]: creation time, then revision
/// range, then kind (full before incremental), then name.
pub fn compare_snapshots(a: &Snapshot, b: &Snapshot) -> Ordering {
    a.cmp(b)
}

/// Join the non-empty path components with `/`.
pub fn snapshot_path(prefix: &str, snap_dir: &str, snap_name: &str) -> String {
    [prefix, snap_dir, snap_name]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// True when some segment of `object_path` is a naming-version tag.
pub fn has_version_tag(object_path: &str) -> bool {
    object_path
        .split('/')
        .any(|t| t == BACKUP_VERSION_V1 || t == BACKUP_VERSION_V2)
}

/// Parse an object path into a [`Snapshot`].
pub fn parse_snapshot(object_path: &str) -> Result<Snapshot> {
    let invalid = |reason: String| SnapstoreError::InvalidSnapshotName {
        name: object_path.to_string(),
        reason,
    };

    let tokens: Vec<&str> = object_path.split('/').collect();
    let tag_index = tokens
        .iter()
        .rposition(|t| *t == BACKUP_VERSION_V1 || *t == BACKUP_VERSION_V2)
        .ok_or_else(|| invalid("missing naming-version tag".to_string()))?;

    let (snap_dir, snap_name) = match (tokens[tag_index], &tokens[tag_index + 1..]) {
        (BACKUP_VERSION_V2, [name]) => ("", *name),
        (BACKUP_VERSION_V1, [dir, name]) => {
            let ts = dir
                .strip_prefix(SNAPSHOT_DIR_PREFIX)
                .ok_or_else(|| invalid(format!("invalid snapshot directory: {}", dir)))?;
            if parse_digits(ts).is_none() {
                return Err(invalid(format!("invalid snapshot directory: {}", dir)));
            }
            (*dir, *name)
        }
        (tag, rest) => {
            return Err(invalid(format!(
                "expected {} path segment(s) after {}, found {}",
                if tag == BACKUP_VERSION_V1 { 2 } else { 1 },
                tag,
                rest.len()
            )))
        }
    };

    let parts: Vec<&str> = snap_name.split('-').collect();
    if parts.len() != 4 {
        return Err(invalid(format!("expected 4 name tokens, found {}", parts.len())));
    }

    let kind: SnapshotKind = parts[0].parse().map_err(invalid)?;
    let start_revision = parse_digits(parts[1])
        .ok_or_else(|| invalid(format!("invalid start revision: {}", parts[1])))?;
    let last_revision = parse_digits(parts[2])
        .ok_or_else(|| invalid(format!("invalid last revision: {}", parts[2])))?;
    if start_revision > last_revision {
        return Err(invalid(format!(
            "last revision ({}) should be at least start revision ({})",
            last_revision, start_revision
        )));
    }

    let mut time_and_suffixes = parts[3].split('.');
    let unix = time_and_suffixes
        .next()
        .and_then(parse_digits)
        .and_then(|t| i64::try_from(t).ok())
        .ok_or_else(|| invalid(format!("invalid creation time: {}", parts[3])))?;
    let created_on = DateTime::<Utc>::from_timestamp(unix, 0)
        .ok_or_else(|| invalid(format!("creation time out of range: {}", unix)))?;

    let extensions: Vec<&str> = time_and_suffixes.collect();
    let final_ext = &FINAL_SUFFIX[1..];
    let (compression_suffix, is_final) = match extensions.as_slice() {
        [] => (None, false),
        [ext] if *ext == final_ext => (None, true),
        [ext] => (Some(compression(ext).ok_or_else(|| invalid(unknown_ext(ext)))?), false),
        [ext, fin] if *fin == final_ext => {
            (Some(compression(ext).ok_or_else(|| invalid(unknown_ext(ext)))?), true)
        }
        _ => return Err(invalid(format!("unexpected suffix in {}", parts[3]))),
    };

    Ok(Snapshot {
        kind,
        start_revision,
        last_revision,
        created_on,
        compression_suffix,
        is_final,
        prefix: tokens[..=tag_index].join("/"),
        snap_dir: snap_dir.to_string(),
        snap_name: snap_name.to_string(),
    })
}

fn compression(ext: &str) -> Option<CompressionSuffix> {
    CompressionSuffix::from_extension(ext)
}

fn unknown_ext(ext: &str) -> String {
    format!("unknown compression suffix: .{}", ext)
}

/// Strict unsigned decimal: non-empty, ASCII digits only (no sign).
fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Prefix used to list every generation of a store.
///
/// The last segment of a store prefix is its naming-version tag, so listing
/// happens one level up: `etcd-main/v2` lists `etcd-main/`. A single-segment
/// prefix lists the whole container.
pub fn listing_prefix(store_prefix: &str) -> String {
    match store_prefix.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => format!("{}/", parent),
        _ => String::new(),
    }
}

/// Prefix a snapshot is written under by a store configured with `store_prefix`.
///
/// Snapshots that were listed under the legacy generation are written back
/// under the legacy generation of the same base.
pub fn adapt_prefix(snap: &Snapshot, store_prefix: &str) -> String {
    if snap.prefix.rsplit('/').next() != Some(BACKUP_VERSION_V1) {
        return store_prefix.to_string();
    }
    match store_prefix.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) => format!("{}/{}", parent, BACKUP_VERSION_V1),
        None => BACKUP_VERSION_V1.to_string(),
    }
}

/// Latest full snapshot and the incremental snapshots taken after it.
///
/// `list` must already be sorted.
pub fn latest_chain(list: &[Snapshot]) -> Option<(Snapshot, SnapList)> {
    let full_index = list.iter().rposition(|s| s.kind == SnapshotKind::Full)?;
    let full = list[full_index].clone();
    let deltas = list[full_index + 1..]
        .iter()
        .filter(|s| s.kind == SnapshotKind::Incr && s.start_revision > full.last_revision)
        .cloned()
        .collect();
    Some((full, deltas))
}
