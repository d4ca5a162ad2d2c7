//! Request-level orchestration.
//!
//! Every request opens its own [`Session`](crate::arena::Session), which is
//! released when the request future completes or is dropped. Errors from the
//! stages are classified with [`Error::kind`] into a [`Response`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::arena::Arena;
use crate::audio::{AudioDecoder, FfmpegDecoder};
use crate::cache::{cache_key, TranscriptCache};
use crate::caption;
use crate::config::PipelineOptions;
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{MediaFetcher, YtDlpFetcher};
use crate::frames::{FfmpegFrameSource, FrameExtractor, FrameSource};
use crate::handle::{HandleState, ModelHandleManager};
use crate::objects::{self, Detector};
use crate::transcribe::{ModelLoader, WhisperLoader};
use crate::transcript::TranscriptBuilder;
use crate::types::{CaptionFile, CaptionHit, ObjectHit, ObjectToc};

pub const MSG_DOWNLOAD_FAILED: &str = "Not able to download the video.";
pub const MSG_TRANSCRIPT_UNAVAILABLE: &str = "Not able to fetch transcript.";
pub const MSG_FRAMES_UNAVAILABLE: &str = "Not able to extract frames from the video.";
pub const MSG_NO_MATCH: &str = "No matches found.";
pub const MSG_SEARCH_OK: &str = "Search completed successfully.";
pub const MSG_INDEX_OK: &str = "Object index built successfully.";
pub const MSG_INTERNAL: &str = "Internal server error.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TranscriptSearch,
    ObjectSearch,
    Index,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::TranscriptSearch => "transcript-search",
            Mode::ObjectSearch => "object-search",
            Mode::Index => "index",
        })
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transcript-search" => Ok(Mode::TranscriptSearch),
            "object-search" => Ok(Mode::ObjectSearch),
            "index" => Ok(Mode::Index),
            other => Err(Error::InvalidOption(format!("unknown mode: {other}"))),
        }
    }
}

/// A validated request handed in by the outer layer.
#[derive(Debug, Clone)]
pub struct Request {
    pub reference: String,
    pub keyword: Option<String>,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Results {
    Captions(Vec<CaptionHit>),
    Objects(Vec<ObjectHit>),
}

impl Results {
    pub fn is_empty(&self) -> bool {
        match self {
            Results::Captions(hits) => hits.is_empty(),
            Results::Objects(hits) => hits.is_empty(),
        }
    }
}

/// Structured outcome of a request. Serializes to
/// `{message, results}`, `{message, results: null}` or `{message, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Found {
        message: String,
        results: Results,
    },
    NotFound {
        message: String,
        results: Option<Results>,
    },
    Failed {
        message: String,
        error: String,
    },
}

impl Response {
    fn found(message: &str, results: Results) -> Self {
        if results.is_empty() {
            return Self::not_found(MSG_NO_MATCH);
        }
        Response::Found {
            message: message.into(),
            results,
        }
    }

    fn not_found(message: &str) -> Self {
        Response::NotFound {
            message: message.into(),
            results: None,
        }
    }

    /// Map a pipeline error onto the response the caller sees.
    pub fn from_error(mode: Mode, err: &Error) -> Self {
        match err.kind() {
            ErrorKind::Allocation | ErrorKind::Fetch => Self::not_found(MSG_DOWNLOAD_FAILED),
            ErrorKind::ModelUnavailable | ErrorKind::TranscriptionEmpty => {
                Self::not_found(MSG_TRANSCRIPT_UNAVAILABLE)
            }
            // Audio decode failures surface in transcript mode.
            ErrorKind::Decode if mode == Mode::TranscriptSearch => {
                Self::not_found(MSG_TRANSCRIPT_UNAVAILABLE)
            }
            ErrorKind::Decode => Self::not_found(MSG_FRAMES_UNAVAILABLE),
            ErrorKind::CacheCorrupt | ErrorKind::Internal => {
                warn!(%mode, error = %err, "request failed");
                Response::Failed {
                    message: MSG_INTERNAL.into(),
                    error: err.to_string(),
                }
            }
        }
    }

    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            Response::Found { .. } => 200,
            Response::NotFound { .. } => 404,
            Response::Failed { .. } => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Response::Found { message, .. }
            | Response::NotFound { message, .. }
            | Response::Failed { message, .. } => message,
        }
    }
}

/// Model handle state plus outstanding leases, as reported by
/// [`Pipeline::health`].
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub model: HandleState,
    pub active_leases: usize,
    pub idle_timeout_secs: u64,
    pub unloaded_now: bool,
}

pub struct PipelineBuilder {
    options: PipelineOptions,
    fetcher: Option<Arc<dyn MediaFetcher>>,
    decoder: Option<Arc<dyn AudioDecoder>>,
    loader: Option<Arc<dyn ModelLoader>>,
    frame_source: Option<Arc<dyn FrameSource>>,
    index_detector: Option<Arc<dyn Detector>>,
    search_detector: Option<Arc<dyn Detector>>,
}

impl PipelineBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn frame_source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.frame_source = Some(source);
        self
    }

    /// Detector used to build object indexes.
    pub fn index_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.index_detector = Some(detector);
        self
    }

    /// Detector used for object search. Searches fail with
    /// [`Error::Detection`] unless its kind is open-vocabulary.
    pub fn search_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.search_detector = Some(detector);
        self
    }

    pub fn build(self) -> Pipeline {
        let options = self.options;
        let timeout = options.call_timeout;

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(YtDlpFetcher::new().timeout(timeout)));
        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(FfmpegDecoder { timeout }));
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(WhisperLoader::new(&options)));
        let frame_source = self
            .frame_source
            .unwrap_or_else(|| Arc::new(FfmpegFrameSource::new(timeout)));

        let models = ModelHandleManager::new(loader, options.idle_timeout);
        let transcripts = TranscriptBuilder::new(
            TranscriptCache::new(options.resolve_cache_dir()),
            fetcher.clone(),
            decoder,
            models.clone(),
        );

        Pipeline {
            arena: Arena::new(options.resolve_temp_root()),
            frames: FrameExtractor::new(frame_source, options.batch_size, options.scene_threshold),
            fetcher,
            transcripts,
            models,
            index_detector: self.index_detector,
            search_detector: self.search_detector,
            options,
        }
    }
}

/// The media acquisition and search pipeline. Cheap to share behind an
/// `Arc`; every method is safe to call concurrently.
pub struct Pipeline {
    options: PipelineOptions,
    arena: Arena,
    fetcher: Arc<dyn MediaFetcher>,
    transcripts: TranscriptBuilder,
    models: ModelHandleManager,
    frames: FrameExtractor,
    index_detector: Option<Arc<dyn Detector>>,
    search_detector: Option<Arc<dyn Detector>>,
}

impl Pipeline {
    pub fn builder(options: PipelineOptions) -> PipelineBuilder {
        PipelineBuilder {
            options,
            fetcher: None,
            decoder: None,
            loader: None,
            frame_source: None,
            index_detector: None,
            search_detector: None,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run one request and translate the outcome into a [`Response`].
    pub async fn handle(&self, request: &Request) -> Response {
        let keyword = request.keyword.as_deref().unwrap_or("");
        info!(mode = %request.mode, reference = %request.reference, "request received");

        match request.mode {
            Mode::TranscriptSearch => {
                match self.transcript_search(&request.reference, keyword).await {
                    Ok(hits) => Response::found(MSG_SEARCH_OK, Results::Captions(hits)),
                    Err(e) => Response::from_error(request.mode, &e),
                }
            }
            Mode::ObjectSearch => match self.object_search(&request.reference, keyword).await {
                Ok(times) => {
                    let hits = times
                        .into_iter()
                        .map(|timestamp| ObjectHit {
                            timestamp,
                            object: keyword.trim().to_string(),
                        })
                        .collect();
                    Response::found(MSG_SEARCH_OK, Results::Objects(hits))
                }
                Err(e) => Response::from_error(request.mode, &e),
            },
            Mode::Index => match self.object_index(&request.reference).await {
                Ok(toc) => Response::found(MSG_INDEX_OK, Results::Objects(flatten_toc(&toc))),
                Err(e) => Response::from_error(request.mode, &e),
            },
        }
    }

    /// Keyword search over the reference's captions: published captions in
    /// the configured language when available, otherwise the cached or
    /// freshly built transcript.
    pub async fn transcript_search(&self, reference: &str, keyword: &str) -> Result<Vec<CaptionHit>> {
        let file = self.caption_file(reference).await?;
        let hits = caption::search(&file, keyword);
        info!(reference, keyword, hits = hits.len(), "transcript search done");
        Ok(hits)
    }

    /// The caption file for `reference`, built inside a throwaway session.
    pub async fn caption_file(&self, reference: &str) -> Result<CaptionFile> {
        self.models.release_if_idle();
        let session = self.arena.open_session()?;

        let lang = &self.options.caption_language;
        match self.fetcher.fetch_captions(reference, lang, &session).await {
            Ok(Some(file)) => {
                info!(reference, lang, cues = file.records().len(), "using published captions");
                return Ok(file);
            }
            Ok(None) => info!(reference, lang, "no published captions, transcribing"),
            Err(e) => warn!(reference, lang, error = %e, "caption fetch failed, transcribing"),
        }

        let key = cache_key(reference);
        let file = self
            .transcripts
            .get_or_build_transcript(reference, &key, &session)
            .await?;
        Ok(file)
    }

    /// Timestamps of scene-change frames where `query` is detected.
    pub async fn object_search(&self, reference: &str, query: &str) -> Result<Vec<f64>> {
        self.models.release_if_idle();
        let detector = self
            .search_detector
            .as_deref()
            .ok_or_else(|| Error::Detection("no search detector configured".into()))?;

        let session = self.arena.open_session()?;
        let video = self
            .fetcher
            .fetch_video(reference, &session)
            .await
            .map_err(|e| e.into_fetch(reference))?;
        let mut frames = self.frames.extract_frames(&video, &session).await?;
        let hits =
            objects::search_objects(detector, &mut frames, query, &self.options.thresholds).await?;
        Ok(hits)
    }

    /// Label → timestamps table of contents for the reference's video.
    pub async fn object_index(&self, reference: &str) -> Result<ObjectToc> {
        self.models.release_if_idle();
        let detector = self
            .index_detector
            .as_deref()
            .ok_or_else(|| Error::Detection("no index detector configured".into()))?;

        let session = self.arena.open_session()?;
        let video = self
            .fetcher
            .fetch_video(reference, &session)
            .await
            .map_err(|e| e.into_fetch(reference))?;
        let mut frames = self.frames.extract_frames(&video, &session).await?;
        let toc = objects::build_toc(detector, &mut frames, &self.options.thresholds).await?;
        Ok(toc)
    }

    /// Run the idle-unload check and report the model handle.
    pub fn health(&self) -> Health {
        let unloaded_now = self.models.release_if_idle();
        Health {
            model: self.models.state(),
            active_leases: self.models.active_leases(),
            idle_timeout_secs: self.models.idle_timeout().as_secs(),
            unloaded_now,
        }
    }
}

/// One `{timestamp, object}` entry per TOC occurrence, ordered by time then
/// label.
fn flatten_toc(toc: &ObjectToc) -> Vec<ObjectHit> {
    let mut hits: Vec<ObjectHit> = toc
        .iter()
        .flat_map(|(label, times)| {
            times.iter().map(move |&timestamp| ObjectHit {
                timestamp,
                object: label.clone(),
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        a.timestamp
            .total_cmp(&b.timestamp)
            .then_with(|| a.object.cmp(&b.object))
    });
    hits
}
