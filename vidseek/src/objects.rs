use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{DetectionThresholds, DetectorKind};
use crate::error::{Error, Result};
use crate::frames::FrameBatches;
use crate::process;
use crate::types::{Detection, ObjectToc};

/// An object detection model, consumed per frame.
#[async_trait]
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Detect objects in `frame`. Open-vocabulary detectors look for
    /// `labels`; closed-set detectors ignore them.
    async fn detect(&self, frame: &Path, labels: Option<&[String]>) -> Result<Vec<Detection>>;
}

/// Runs an external program once per frame:
/// `<program> [args] <frame> [--labels L...]`, which must print a JSON
/// array of `{"label": .., "score": ..}` objects on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    kind: DetectorKind,
    timeout: Option<Duration>,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>, kind: DetectorKind) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            kind,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Detector for CommandDetector {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    async fn detect(&self, frame: &Path, labels: Option<&[String]>) -> Result<Vec<Detection>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(frame);
        if let Some(labels) = labels {
            cmd.arg("--labels").args(labels);
        }

        let output = process::run(cmd, "detector", self.timeout)
            .await
            .map_err(|e| match e {
                Error::Io(e) => Error::Detection(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                )),
                other => other,
            })?;

        if !output.status.success() {
            return Err(Error::Detection(format!(
                "{} failed: {}",
                self.program.display(),
                process::stderr_excerpt(&output)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Detection(format!("invalid detector output: {e}")))
    }
}

/// Run `detector` over every remaining frame and collect, per label, the
/// timestamps where it scored at or above the detector kind's threshold.
///
/// Labels keep the detector's casing. A label seen several times in one
/// frame records that frame once.
pub async fn build_toc(
    detector: &dyn Detector,
    frames: &mut FrameBatches<'_>,
    thresholds: &DetectionThresholds,
) -> Result<ObjectToc> {
    let threshold = thresholds.index_threshold(detector.kind());
    let mut toc = ObjectToc::new();

    while let Some(batch) = frames.next_batch().await? {
        for frame in batch {
            let detections = detector.detect(&frame.path, None).await?;
            for detection in detections.into_iter().filter(|d| d.score >= threshold) {
                let times = toc.entry(detection.label).or_default();
                if times.last() != Some(&frame.timestamp) {
                    times.push(frame.timestamp);
                }
            }
        }
    }

    info!(labels = toc.len(), threshold, "object index built");
    Ok(toc)
}

/// Timestamps of frames where `query` is detected at or above the search
/// threshold, ascending. An empty query matches nothing.
///
/// The detector must be open-vocabulary. Only detections whose label equals
/// the query, ignoring case, count as hits.
pub async fn search_objects(
    detector: &dyn Detector,
    frames: &mut FrameBatches<'_>,
    query: &str,
    thresholds: &DetectionThresholds,
) -> Result<Vec<f64>> {
    if detector.kind() != DetectorKind::OpenVocabulary {
        return Err(Error::Detection(format!(
            "object search needs an open-vocabulary detector, got {:?}",
            detector.kind()
        )));
    }

    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let wanted = query.to_lowercase();

    let labels = [query.to_string()];
    let mut hits = Vec::new();

    while let Some(batch) = frames.next_batch().await? {
        for frame in batch {
            let detections = detector.detect(&frame.path, Some(labels.as_slice())).await?;
            let found = detections
                .iter()
                .any(|d| d.score >= thresholds.search && d.label.trim().to_lowercase() == wanted);
            if found {
                debug!(query, timestamp = frame.timestamp, "object found");
                hits.push(frame.timestamp);
            }
        }
    }

    Ok(hits)
}
