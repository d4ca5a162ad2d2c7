use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::arena::Session;
use crate::caption;
use crate::error::{Error, Result};
use crate::process;
use crate::types::{ArtifactKind, CaptionFile, MediaArtifact, MediaKind};

/// Acquires raw media for a reference into a session.
///
/// Implementations place everything they write under the session's
/// directories so a failed fetch is still cleaned up with the session.
/// No retries happen here.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_video(&self, reference: &str, session: &Session) -> Result<MediaArtifact>;

    async fn fetch_audio(&self, reference: &str, session: &Session) -> Result<MediaArtifact>;

    /// Published captions in `lang`, or `None` when the source has none.
    async fn fetch_captions(
        &self,
        reference: &str,
        lang: &str,
        session: &Session,
    ) -> Result<Option<CaptionFile>>;
}

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "m4a", "opus", "flac", "webm"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "mov"];

// Single-file formats only, so no merge step is needed.
const VIDEO_FORMAT_ARGS: &[&str] = &["--format", "b[ext=mp4]/b"];
const AUDIO_FORMAT_ARGS: &[&str] = &[
    "--extract-audio",
    "--audio-format",
    "wav",
    "--audio-quality",
    "0",
];

/// [`MediaFetcher`] backed by the `yt-dlp` command-line tool.
///
/// # Security
/// - References must start with http:// or https://
/// - Arguments are passed via `.arg()` (no shell expansion)
/// - `--no-exec` prevents yt-dlp from running post-processing commands
/// - Reported output paths must lie inside the session directory
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            timeout: None,
        }
    }
}

impl YtDlpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, reference: &str, args: Vec<OsString>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg(reference.trim());

        let output = process::run(cmd, "yt-dlp", self.timeout)
            .await
            .map_err(|e| {
                if process::is_not_found(&e) {
                    Error::YtDlpNotFound
                } else {
                    e
                }
            })?;

        if !output.status.success() {
            return Err(Error::fetch(
                reference,
                format!("yt-dlp failed: {}", process::stderr_excerpt(&output)),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn download(
        &self,
        reference: &str,
        session: &Session,
        kind: MediaKind,
    ) -> Result<MediaArtifact> {
        validate_reference(reference)?;

        let (artifact_kind, extensions, format_args) = match kind {
            MediaKind::Video => (ArtifactKind::Video, VIDEO_EXTENSIONS, VIDEO_FORMAT_ARGS),
            MediaKind::Audio => (ArtifactKind::Audio, AUDIO_EXTENSIONS, AUDIO_FORMAT_ARGS),
        };
        let output_dir = session.dir(artifact_kind);
        info!(reference, kind = ?kind, dir = %output_dir.display(), "downloading media");

        let mut args: Vec<OsString> = format_args.iter().copied().map(OsString::from).collect();
        args.extend(
            [
                "--no-playlist",
                "--no-exec",
                "--print",
                "after_move:filepath",
                "--print",
                "after_move:title",
                "--output",
            ]
            .map(OsString::from),
        );
        args.push(output_dir.join("%(id)s.%(ext)s").into_os_string());

        let stdout = self.run(reference, args).await?;
        let (printed_path, title) = parse_printed(&stdout);

        // yt-dlp --print after_move:filepath gives us the final path
        let path = match printed_path {
            Some(candidate) => {
                validate_path_in_dir(&candidate, &output_dir)
                    .map_err(|reason| Error::fetch(reference, reason))?;
                candidate
            }
            None => find_media_file(&output_dir, extensions)
                .ok_or_else(|| Error::fetch(reference, "no media file found after download"))?,
        };

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(Error::fetch(
                    reference,
                    format!("downloaded file not found at {}", path.display()),
                ))
            }
        };
        session.adopt(&path);
        debug!(path = %path.display(), size, "media downloaded");

        Ok(MediaArtifact {
            path,
            kind,
            reference: reference.to_string(),
            size,
            title,
        })
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch_video(&self, reference: &str, session: &Session) -> Result<MediaArtifact> {
        self.download(reference, session, MediaKind::Video).await
    }

    async fn fetch_audio(&self, reference: &str, session: &Session) -> Result<MediaArtifact> {
        self.download(reference, session, MediaKind::Audio).await
    }

    async fn fetch_captions(
        &self,
        reference: &str,
        lang: &str,
        session: &Session,
    ) -> Result<Option<CaptionFile>> {
        validate_reference(reference)?;

        let output_dir = session.dir(ArtifactKind::Subtitle);
        info!(reference, lang, "fetching published captions");

        // Manual subtitles win over automatic captions for the same language.
        let langs = caption_langs(lang);
        let mut args: Vec<OsString> = [
            "--skip-download",
            "--write-subs",
            "--write-auto-subs",
            "--sub-format",
            "vtt",
            "--sub-langs",
            langs.as_str(),
            "--no-playlist",
            "--no-exec",
            "--output",
        ]
        .map(OsString::from)
        .to_vec();
        args.push(output_dir.join("%(id)s.%(ext)s").into_os_string());

        self.run(reference, args).await?;

        let Some(path) = pick_caption_file(&output_dir, lang) else {
            debug!(reference, lang, "no published captions");
            return Ok(None);
        };
        session.adopt(&path);

        let file = caption::read_caption_file(&path).await?;
        if file.is_empty() {
            warn!(path = %path.display(), "published captions contain no cues");
            return Ok(None);
        }
        Ok(Some(file))
    }
}

/// Only http(s) references are handed to yt-dlp.
fn validate_reference(reference: &str) -> Result<()> {
    let trimmed = reference.trim();
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Ok(())
    } else {
        Err(Error::fetch(
            reference,
            "invalid reference (must start with http:// or https://)",
        ))
    }
}

/// Split `--print` output into the final file path and the media title.
fn parse_printed(stdout: &str) -> (Option<PathBuf>, Option<String>) {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let path = lines.next().map(PathBuf::from);
    let title = lines.next().filter(|t| *t != "NA").map(str::to_string);
    (path, title)
}

/// Normalize a path by resolving `.` and `..` components without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

fn validate_path_in_dir(path: &Path, expected_dir: &Path) -> std::result::Result<(), String> {
    let canonical_dir = expected_dir
        .canonicalize()
        .unwrap_or_else(|_| normalize_path(expected_dir));
    let canonical_path = path.canonicalize().unwrap_or_else(|_| normalize_path(path));

    if canonical_path.starts_with(&canonical_dir) {
        Ok(())
    } else {
        warn!(
            path = %path.display(),
            expected_dir = %expected_dir.display(),
            "downloaded file path outside session directory"
        );
        Err("downloaded file path is outside the session directory".into())
    }
}

/// yt-dlp `--sub-langs` selector for `lang` and its regional variants
/// (`en` also accepts `en-US`, `en-GB`, ...).
fn caption_langs(lang: &str) -> String {
    format!("{lang}.*,{lang}")
}

/// The `.vtt` track yt-dlp wrote for `lang`: the exact language when
/// present, otherwise the first variant by name.
fn pick_caption_file(dir: &Path, lang: &str) -> Option<PathBuf> {
    let mut tracks: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "vtt"))
        .collect();
    tracks.sort();

    let exact = format!(".{lang}");
    let position = tracks
        .iter()
        .position(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with(&exact))
        })
        .unwrap_or(0);
    (!tracks.is_empty()).then(|| tracks.swap_remove(position))
}

/// Most recently modified file in `dir` with one of `extensions`.
fn find_media_file(dir: &Path, extensions: &[&str]) -> Option<PathBuf> {
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;

    for entry in std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !extensions.contains(&ext) {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if best.as_ref().is_none_or(|(_, t)| modified > *t) {
                best = Some((path, modified));
            }
        }
    }

    best.map(|(p, _)| p)
}
