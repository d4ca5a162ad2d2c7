//! Scene-change frame sampling in memory-bounded batches.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::arena::Session;
use crate::error::{Error, Result};
use crate::process;
use crate::types::{ArtifactKind, Frame, MediaArtifact};

static PTS_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pts_time:\s*(-?[\d.]+)").expect("valid regex"));

/// Decodes candidate frames out of a video file.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Timestamps (seconds) of the first frame and of every frame whose
    /// scene-change score exceeds `threshold`.
    async fn scene_timestamps(&self, video: &Path, threshold: f64) -> Result<Vec<f64>>;

    /// Write the frame at `timestamp` to `dest` as an image file.
    async fn materialize(&self, video: &Path, timestamp: f64, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegFrameSource {
    timeout: Option<Duration>,
}

impl FfmpegFrameSource {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    async fn ffmpeg(&self, cmd: Command) -> Result<std::process::Output> {
        let output = process::run(cmd, "ffmpeg", self.timeout)
            .await
            .map_err(into_decode_error)?;
        if !output.status.success() {
            return Err(Error::Decode(format!(
                "ffmpeg failed: {}",
                process::stderr_excerpt(&output)
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn scene_timestamps(&self, video: &Path, threshold: f64) -> Result<Vec<f64>> {
        let filter = format!("select='eq(n\\,0)+gt(scene\\,{threshold})',showinfo");
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostdin", "-i"])
            .arg(video)
            .args(["-vf", filter.as_str(), "-fps_mode", "vfr", "-f", "null", "-"]);

        let output = self.ffmpeg(cmd).await?;
        Ok(parse_showinfo(&String::from_utf8_lossy(&output.stderr)))
    }

    async fn materialize(&self, video: &Path, timestamp: f64, dest: &Path) -> Result<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostdin", "-y", "-ss"])
            .arg(format!("{timestamp:.3}"))
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1", "-q:v", "2"])
            .arg(dest);

        self.ffmpeg(cmd).await?;
        if !dest.exists() {
            return Err(Error::Decode(format!(
                "ffmpeg produced no frame at {timestamp:.3}s"
            )));
        }
        Ok(())
    }
}

fn into_decode_error(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::Decode(format!("failed to run ffmpeg: {e}")),
        Error::Timeout { after, .. } => {
            Error::Decode(format!("ffmpeg timed out after {after:?}"))
        }
        other => other,
    }
}

/// Pull `pts_time` values out of ffmpeg's showinfo log lines. Edit lists can
/// put the first frame slightly before zero; it is reported at 0.
fn parse_showinfo(stderr: &str) -> Vec<f64> {
    stderr
        .lines()
        .filter(|line| line.contains("showinfo"))
        .filter_map(|line| PTS_TIME.captures(line))
        .filter_map(|c| c[1].parse::<f64>().ok())
        .map(|t| t.max(0.0))
        .collect()
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

pub fn frame_file_name(timestamp: f64) -> String {
    format!("frame_{timestamp:.3}.jpg")
}

#[derive(Clone)]
pub struct FrameExtractor {
    source: Arc<dyn FrameSource>,
    batch_size: usize,
    scene_threshold: f64,
}

impl FrameExtractor {
    pub fn new(source: Arc<dyn FrameSource>, batch_size: usize, scene_threshold: f64) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            scene_threshold,
        }
    }

    /// Find candidate frames in `video` and return a lazy batch iterator.
    ///
    /// Candidates are sorted and rounded to milliseconds. Two candidates that
    /// round to the same timestamp are a [`Error::FrameCollision`].
    pub async fn extract_frames<'s>(
        &self,
        video: &MediaArtifact,
        session: &'s Session,
    ) -> Result<FrameBatches<'s>> {
        let mut timestamps: Vec<f64> = self
            .source
            .scene_timestamps(&video.path, self.scene_threshold)
            .await?
            .into_iter()
            .map(round_ms)
            .collect();

        if timestamps.is_empty() {
            return Err(Error::Decode(format!(
                "no frames decoded from {}",
                video.path.display()
            )));
        }

        timestamps.sort_by(f64::total_cmp);
        if let Some(pair) = timestamps.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::FrameCollision { timestamp: pair[0] });
        }

        info!(
            video = %video.path.display(),
            candidates = timestamps.len(),
            batch_size = self.batch_size,
            "scene-change frames selected"
        );

        Ok(FrameBatches {
            source: self.source.clone(),
            video: video.path.clone(),
            session,
            timestamps,
            next: 0,
            batch_size: self.batch_size,
            current: Vec::new(),
            peak: 0,
        })
    }
}

/// Lazily materializes frames `batch_size` at a time.
///
/// Each call to [`FrameBatches::next_batch`] deletes the previous batch's
/// files before writing the next, so at most `batch_size` frames exist on
/// disk at once. Not resumable: start over with a new extraction.
pub struct FrameBatches<'s> {
    source: Arc<dyn FrameSource>,
    video: std::path::PathBuf,
    session: &'s Session,
    timestamps: Vec<f64>,
    next: usize,
    batch_size: usize,
    current: Vec<Frame>,
    peak: usize,
}

impl FrameBatches<'_> {
    pub fn candidates(&self) -> usize {
        self.timestamps.len()
    }

    /// Largest number of frames that were on disk at the same time.
    pub fn peak_materialized(&self) -> usize {
        self.peak
    }

    pub async fn next_batch(&mut self) -> Result<Option<&[Frame]>> {
        self.release_current();
        if self.next >= self.timestamps.len() {
            return Ok(None);
        }

        let end = (self.next + self.batch_size).min(self.timestamps.len());
        for &timestamp in &self.timestamps[self.next..end] {
            let path = self
                .session
                .alloc_path(ArtifactKind::Frame, &frame_file_name(timestamp));
            self.source.materialize(&self.video, timestamp, &path).await?;
            self.current.push(Frame {
                session_id: self.session.id().to_string(),
                timestamp,
                path,
            });
            self.peak = self.peak.max(self.current.len());
        }
        debug!(from = self.next, to = end, "frame batch materialized");
        self.next = end;

        Ok(Some(self.current.as_slice()))
    }

    fn release_current(&mut self) {
        for frame in self.current.drain(..) {
            self.session.discard(&frame.path);
        }
    }
}

impl Drop for FrameBatches<'_> {
    fn drop(&mut self) {
        self.release_current();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::arena::Arena;
    use crate::types::MediaKind;

    /// Writes tiny placeholder frames and records how many exist at once.
    pub(crate) struct FakeFrameSource {
        pub timestamps: Vec<f64>,
        pub fail_decode: bool,
        pub max_on_disk: AtomicUsize,
    }

    impl FakeFrameSource {
        pub fn new(timestamps: Vec<f64>) -> Self {
            Self {
                timestamps,
                fail_decode: false,
                max_on_disk: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSource for FakeFrameSource {
        async fn scene_timestamps(&self, _video: &Path, _threshold: f64) -> Result<Vec<f64>> {
            if self.fail_decode {
                return Err(Error::Decode("invalid data found when processing input".into()));
            }
            Ok(self.timestamps.clone())
        }

        async fn materialize(&self, _video: &Path, timestamp: f64, dest: &Path) -> Result<()> {
            tokio::fs::write(dest, format!("{timestamp}")).await?;
            let dir = dest.parent().unwrap_or(Path::new("."));
            let on_disk = std::fs::read_dir(dir)?.count();
            self.max_on_disk.fetch_max(on_disk, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn video(session: &Session) -> MediaArtifact {
        MediaArtifact {
            path: session.dir(ArtifactKind::Video).join("v.mp4"),
            kind: MediaKind::Video,
            reference: "https://example.com/v".into(),
            size: 0,
            title: None,
        }
    }

    #[test]
    fn test_parse_showinfo() {
        let stderr = "\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'v.mp4':
[Parsed_showinfo_1 @ 0x55d] n:   0 pts:      0 pts_time:0       duration:512
[Parsed_showinfo_1 @ 0x55d] n:   1 pts: 137216 pts_time:10.72   duration:512
[Parsed_showinfo_1 @ 0x55d] n:   2 pts: 262144 pts_time:20.48   duration:512
frame=    3 fps=0.0 q=-0.0 Lsize=N/A time=00:00:20.48
";
        assert_eq!(parse_showinfo(stderr), vec![0.0, 10.72, 20.48]);
        assert!(parse_showinfo("no frames here").is_empty());
    }

    #[test]
    fn test_parse_showinfo_negative_first_frame() {
        let stderr = "\
[Parsed_showinfo_1 @ 0x55d] n:   0 pts:  -1024 pts_time:-0.021333 duration:512
[Parsed_showinfo_1 @ 0x55d] n:   1 pts: 137216 pts_time:10.72   duration:512
";
        assert_eq!(parse_showinfo(stderr), vec![0.0, 10.72]);
    }

    #[test]
    fn test_ffmpeg_failures_are_decode_errors() {
        let timeout = Error::Timeout {
            operation: "ffmpeg",
            after: Duration::from_secs(5),
        };
        assert!(matches!(into_decode_error(timeout), Error::Decode(_)));

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(into_decode_error(io), Error::Decode(_)));
    }

    #[test]
    fn test_frame_file_name() {
        assert_eq!(frame_file_name(0.0), "frame_0.000.jpg");
        assert_eq!(frame_file_name(12.3456), "frame_12.346.jpg");
    }

    #[tokio::test]
    async fn test_batches_bound_materialized_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arena::new(tmp.path()).open_session().unwrap();
        let timestamps: Vec<f64> = (0..95).map(|i| i as f64 * 1.5).collect();
        let source = Arc::new(FakeFrameSource::new(timestamps));
        let extractor = FrameExtractor::new(source.clone(), 10, 0.3);

        let mut batches = extractor.extract_frames(&video(&session), &session).await.unwrap();
        assert_eq!(batches.candidates(), 95);

        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        while let Some(batch) = batches.next_batch().await.unwrap() {
            sizes.push(batch.len());
            seen.extend(batch.iter().map(|f| f.timestamp));
        }

        assert_eq!(seen.len(), 95);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes.last(), Some(&5));
        assert!(batches.peak_materialized() <= 10);
        assert!(source.max_on_disk.load(Ordering::SeqCst) <= 10);

        // Exhausted: the last batch has been released too.
        assert_eq!(std::fs::read_dir(session.dir(ArtifactKind::Frame)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_candidates_sorted_and_named_by_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arena::new(tmp.path()).open_session().unwrap();
        let source = Arc::new(FakeFrameSource::new(vec![7.25, 0.0, 3.1234]));
        let extractor = FrameExtractor::new(source, 10, 0.3);

        let mut batches = extractor.extract_frames(&video(&session), &session).await.unwrap();
        let batch = batches.next_batch().await.unwrap().unwrap();
        let names: Vec<String> = batch
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["frame_0.000.jpg", "frame_3.123.jpg", "frame_7.250.jpg"]
        );
        assert!(batch.iter().all(|f| f.session_id == session.id()));
    }

    #[tokio::test]
    async fn test_collision_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arena::new(tmp.path()).open_session().unwrap();
        let source = Arc::new(FakeFrameSource::new(vec![0.0, 1.0001, 1.0004]));
        let extractor = FrameExtractor::new(source, 10, 0.3);

        let err = extractor
            .extract_frames(&video(&session), &session)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::FrameCollision { timestamp } if timestamp == 1.0));
    }

    #[tokio::test]
    async fn test_decode_failure_yields_no_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arena::new(tmp.path()).open_session().unwrap();
        let mut source = FakeFrameSource::new(vec![0.0]);
        source.fail_decode = true;
        let extractor = FrameExtractor::new(Arc::new(source), 10, 0.3);

        let err = extractor
            .extract_frames(&video(&session), &session)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(std::fs::read_dir(session.dir(ArtifactKind::Frame)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_batches_releases_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arena::new(tmp.path()).open_session().unwrap();
        let source = Arc::new(FakeFrameSource::new(vec![0.0, 1.0, 2.0]));
        let extractor = FrameExtractor::new(source, 2, 0.3);

        let mut batches = extractor.extract_frames(&video(&session), &session).await.unwrap();
        assert_eq!(batches.next_batch().await.unwrap().unwrap().len(), 2);
        drop(batches);

        assert_eq!(std::fs::read_dir(session.dir(ArtifactKind::Frame)).unwrap().count(), 0);
    }
}
