//! Disk-backed transcript cache.
//!
//! Each entry is a JSON file holding the raw transcription segments for one
//! content key. Entries are written to a temporary file and renamed into
//! place, so concurrent writers for the same key resolve last-writer-wins and
//! readers never observe a half-written record. Anything that fails
//! validation on read is reported as [`CacheLookup::Corrupt`] and rebuilt.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::Segment;

const RECORD_VERSION: u32 = 1;

static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.|m\.)?(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|embed/|shorts/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[&?#/].*)?$",
    )
    .expect("valid regex")
});

/// Derive the stable cache key for a media reference.
///
/// Recognised video URLs map to their 11-character video id, so every URL
/// form of the same video shares one entry. Anything else maps to an md5
/// digest of the trimmed reference.
pub fn cache_key(reference: &str) -> String {
    let reference = reference.trim();
    match VIDEO_ID.captures(reference).and_then(|c| c.get(1)) {
        Some(id) => id.as_str().to_string(),
        None => format!("ref-{:x}", md5::compute(reference.as_bytes())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    version: u32,
    key: String,
    segments: Vec<Segment>,
}

/// Outcome of a cache read.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Vec<Segment>),
    Miss,
    Corrupt(Error),
}

#[derive(Debug, Clone)]
pub struct TranscriptCache {
    dir: PathBuf,
}

impl TranscriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub async fn lookup(&self, key: &str) -> CacheLookup {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheLookup::Miss,
            Err(e) => return CacheLookup::Corrupt(corrupt(key, format!("read failed: {e}"))),
        };

        let record: CacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => return CacheLookup::Corrupt(corrupt(key, format!("invalid JSON: {e}"))),
        };

        match validate(key, record) {
            Ok(segments) => {
                debug!(key, segments = segments.len(), "transcript cache hit");
                CacheLookup::Hit(segments)
            }
            Err(e) => CacheLookup::Corrupt(e),
        }
    }

    /// Persist segments for `key`, replacing any existing entry.
    pub async fn store(&self, key: &str, segments: &[Segment]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = CacheRecord {
            version: RECORD_VERSION,
            key: key.to_string(),
            segments: segments.to_vec(),
        };
        let json = serde_json::to_vec(&record)?;

        let dest = self.entry_path(key);
        let tmp = dest.with_extension(format!("json.{}.part", uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_then_rename(&tmp, &dest, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        info!(key, segments = segments.len(), path = %dest.display(), "transcript cached");
        Ok(())
    }

    /// Drop the entry for `key`, if any.
    pub async fn invalidate(&self, key: &str) {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(key, "cache entry removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(key, path = %path.display(), error = %e, "failed to remove cache entry"),
        }
    }
}

async fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(tmp, bytes).await?;
    tokio::fs::rename(tmp, dest).await?;
    Ok(())
}

fn corrupt(key: &str, reason: String) -> Error {
    Error::CacheCorrupt {
        key: key.to_string(),
        reason,
    }
}

fn validate(key: &str, record: CacheRecord) -> Result<Vec<Segment>> {
    if record.version != RECORD_VERSION {
        return Err(corrupt(key, format!("unsupported version {}", record.version)));
    }
    if record.key != key {
        return Err(corrupt(key, format!("entry belongs to key {}", record.key)));
    }
    if record.segments.is_empty() {
        return Err(corrupt(key, "no segments".into()));
    }
    for (i, seg) in record.segments.iter().enumerate() {
        if !seg.start.is_finite() || !seg.end.is_finite() || seg.start < 0.0 || seg.end < seg.start
        {
            return Err(corrupt(
                key,
                format!("segment {i} has invalid times {}..{}", seg.start, seg.end),
            ));
        }
    }
    Ok(record.segments)
}
