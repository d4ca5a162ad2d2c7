use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Model;
use crate::error::{Error, Result};

const MODEL_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Smallest plausible ggml file; anything below is an error page.
const MIN_MODEL_BYTES: u64 = 1_000_000;

/// Ensure the model weights exist in `model_dir`, downloading them if needed.
/// Returns the path to the weights file.
pub async fn ensure_model(model: &Model, model_dir: &Path) -> Result<PathBuf> {
    if let Model::Custom(path) = model {
        return if path.exists() {
            Ok(path.clone())
        } else {
            Err(Error::ModelNotFound { path: path.clone() })
        };
    }

    let filename = model.filename();
    let model_path = model_dir.join(&filename);

    if model_path.exists() {
        debug!(path = %model_path.display(), "model already cached");
        return Ok(model_path);
    }

    tokio::fs::create_dir_all(model_dir).await.map_err(|e| {
        Error::ModelDownload(format!("failed to create model dir {}: {e}", model_dir.display()))
    })?;

    let url = format!("{MODEL_BASE_URL}/{filename}");
    info!(model = model.name(), %url, "downloading model weights");
    download_model(&url, &model_path).await?;

    Ok(model_path)
}

/// Stream `url` into `dest` through a uniquely named `.part` file, so
/// concurrent pipelines fetching the same model never share a partial file.
async fn download_model(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| Error::ModelDownload(format!("HTTP error: {e}")))?;

    let expected = response.content_length();
    let name = dest
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pb = progress_bar(expected, &name);

    let part = dest.with_file_name(format!("{name}.{}.part", uuid::Uuid::new_v4().simple()));
    let written = match stream_to_file(response, &part, &pb).await {
        Ok(n) => n,
        Err(e) => {
            pb.abandon();
            discard_part(&part).await;
            return Err(e);
        }
    };

    if let Err(reason) = check_size(written, expected) {
        pb.abandon();
        discard_part(&part).await;
        return Err(Error::ModelDownload(reason));
    }

    tokio::fs::rename(&part, dest).await?;
    pb.finish_and_clear();
    info!(path = %dest.display(), bytes = written, "model saved");
    Ok(())
}

fn check_size(written: u64, expected: Option<u64>) -> std::result::Result<(), String> {
    if written < MIN_MODEL_BYTES {
        return Err(format!("downloaded file too small ({written} bytes), likely an error page"));
    }
    match expected {
        Some(total) if total != written => {
            Err(format!("truncated download: got {written} of {total} bytes"))
        }
        _ => Ok(()),
    }
}

fn progress_bar(total: Option<u64>, name: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total.unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb.set_message(format!("model {name}"));
    pb
}

async fn discard_part(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove partial model download");
    }
}

async fn stream_to_file(response: reqwest::Response, path: &Path, pb: &ProgressBar) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        pb.set_position(written);
    }

    file.flush().await?;
    Ok(written)
}

/// List model weight files in `model_dir`.
pub fn list_cached_models(model_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(model_dir) else {
        return Vec::new();
    };

    let mut models: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
        .collect();
    models.sort();
    models
}
