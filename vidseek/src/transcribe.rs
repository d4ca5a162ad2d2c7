use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::WHISPER_SAMPLE_RATE;
use crate::config::{Language, Model, PipelineOptions};
use crate::error::{Error, Result};
use crate::model;
use crate::types::Segment;

/// A loaded speech-to-text model. Calls block; run them off the async runtime.
pub trait SpeechModel: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe 16 kHz mono samples into timestamped segments.
    fn transcribe(&self, samples: &[f32]) -> Result<Vec<Segment>>;
}

/// Produces a [`SpeechModel`]. Called at most once per load by the
/// model handle manager.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn SpeechModel>>;
}

/// Loads whisper.cpp weights, downloading them first if they are missing.
pub struct WhisperLoader {
    model: Model,
    model_dir: PathBuf,
    language: Language,
    gpu: bool,
    n_threads: Option<u32>,
}

impl WhisperLoader {
    pub fn new(options: &PipelineOptions) -> Self {
        Self {
            model: options.model.clone(),
            model_dir: options.resolve_model_dir(),
            language: options.language.clone(),
            gpu: options.gpu,
            n_threads: options.n_threads,
        }
    }
}

#[async_trait]
impl ModelLoader for WhisperLoader {
    async fn load(&self) -> Result<Arc<dyn SpeechModel>> {
        let model_path = model::ensure_model(&self.model, &self.model_dir).await?;
        info!(model = %model_path.display(), "loading whisper model");

        let gpu = self.gpu;
        let ctx = tokio::task::spawn_blocking(move || {
            let mut ctx_params = WhisperContextParameters::new();
            ctx_params.use_gpu(gpu);

            let path = model_path
                .to_str()
                .ok_or_else(|| Error::ModelUnavailable("model path contains invalid UTF-8".into()))?;
            Ok::<_, Error>(WhisperContext::new_with_params(path, ctx_params)?)
        })
        .await
        .map_err(|e| Error::ModelUnavailable(format!("model load task failed: {e}")))??;

        Ok(Arc::new(WhisperModel {
            name: self.model.name().to_string(),
            ctx,
            language: self.language.clone(),
            n_threads: self.n_threads,
        }))
    }
}

pub struct WhisperModel {
    name: String,
    ctx: WhisperContext,
    language: Language,
    n_threads: Option<u32>,
}

impl SpeechModel for WhisperModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe(&self, samples: &[f32]) -> Result<Vec<Segment>> {
        let mut state = self.ctx.create_state()?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 5 });
        match &self.language {
            Language::Auto => params.set_detect_language(true),
            Language::Code { code, .. } => params.set_language(Some(code)),
        }
        if let Some(n) = self.n_threads {
            params.set_n_threads(n as i32);
        }
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        let duration = samples.len() as f64 / WHISPER_SAMPLE_RATE as f64;
        info!(samples = samples.len(), duration_secs = format!("{duration:.1}"), "running transcription");
        state.full(params, samples)?;

        let num_segments = state.full_n_segments();
        debug!(num_segments, "transcription complete");

        let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
        for i in 0..num_segments {
            let segment = state
                .get_segment(i)
                .ok_or_else(|| Error::Decode(format!("segment {i} not found")))?;
            let text = segment
                .to_str_lossy()
                .map_err(|e| Error::Decode(format!("segment text error: {e}")))?
                .into_owned();

            // whisper timestamps are in centiseconds.
            segments.push(Segment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text,
            });
        }

        Ok(segments)
    }
}
