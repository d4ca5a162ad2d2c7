use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::process;

/// Sample rate whisper.cpp expects.
pub const WHISPER_SAMPLE_RATE: u32 = 16_000;

/// Turns an audio artifact into samples a speech model accepts.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, path: &Path) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegDecoder {
    pub timeout: Option<Duration>,
}

#[async_trait]
impl AudioDecoder for FfmpegDecoder {
    async fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        load_audio(path, self.timeout).await
    }
}

/// Decode an audio (or video) file into 16 kHz mono f32 samples via ffmpeg.
///
/// The ffmpeg child is killed if the returned future is dropped.
pub async fn load_audio(path: &Path, timeout: Option<Duration>) -> Result<Vec<f32>> {
    info!(path = %path.display(), "loading audio");

    if !path.exists() {
        return Err(Error::Decode(format!(
            "audio file not found: {}",
            path.display()
        )));
    }

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-nostdin", "-threads", "0", "-i"])
        .arg(path)
        .args(["-f", "s16le", "-ac", "1", "-acodec", "pcm_s16le", "-ar"])
        .arg(WHISPER_SAMPLE_RATE.to_string())
        .arg("-");

    let output = process::run(cmd, "ffmpeg", timeout).await.map_err(|e| {
        if process::is_not_found(&e) {
            Error::Decode("ffmpeg not found, install with: apt install ffmpeg".into())
        } else if let Error::Io(e) = e {
            Error::Decode(format!("failed to run ffmpeg: {e}"))
        } else {
            e
        }
    })?;

    if !output.status.success() {
        return Err(Error::Decode(format!(
            "ffmpeg failed: {}",
            process::stderr_excerpt(&output)
        )));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    if samples.is_empty() {
        return Err(Error::Decode("ffmpeg produced no audio".into()));
    }

    let duration = samples.len() as f64 / WHISPER_SAMPLE_RATE as f64;
    debug!(samples = samples.len(), duration_secs = format!("{duration:.1}"), "audio ready");

    Ok(samples)
}

/// Convert little-endian signed 16-bit PCM into f32 samples in [-1.0, 1.0).
fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}
