use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Logical kind of a session artifact. Each kind gets its own subdirectory
/// under the session root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Video,
    Audio,
    Subtitle,
    Frame,
}

impl ArtifactKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Subtitle => "subtitle",
            ArtifactKind::Frame => "frame",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// A downloaded video or audio file owned by a session.
#[derive(Debug, Clone)]
pub struct MediaArtifact {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub reference: String,
    pub size: u64,
    pub title: Option<String>,
}

/// Raw transcription output; also the schema of a transcript cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// One timestamped caption cue.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionRecord {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// An ordered caption track plus its canonical identifier.
///
/// Records are kept in chronological order regardless of the order they
/// were produced in.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionFile {
    pub id: String,
    records: Vec<CaptionRecord>,
}

impl CaptionFile {
    pub fn new(id: impl Into<String>, mut records: Vec<CaptionRecord>) -> Self {
        records.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            id: id.into(),
            records,
        }
    }

    /// Build a caption track from transcription segments. Text is trimmed and
    /// segments with no text are dropped.
    pub fn from_segments(id: impl Into<String>, segments: &[Segment]) -> Self {
        let records = segments
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| CaptionRecord {
                start: s.start.max(0.0),
                end: s.end.max(s.start.max(0.0)),
                text: s.text.trim().to_string(),
            })
            .collect();
        Self::new(id, records)
    }

    pub fn records(&self) -> &[CaptionRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One sampled video frame materialized on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub session_id: String,
    /// Seconds, rounded to millisecond precision.
    pub timestamp: f64,
    pub path: PathBuf,
}

/// Per-video table of contents: detector label → ascending timestamps.
pub type ObjectToc = BTreeMap<String, Vec<f64>>;

/// A single detection returned by an external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
}

/// A transcript search match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptionHit {
    pub timestamp: f64,
    pub text: String,
}

/// An object search or index match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectHit {
    pub timestamp: f64,
    pub object: String,
}
