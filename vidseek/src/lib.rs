//! Video search pipeline: reference in, timestamped answers out.
//!
//! **vidseek** acquires a video (via yt-dlp), derives a time-coded transcript
//! (published captions, a disk cache, or whisper.cpp) and scene-change frames
//! (via ffmpeg), and answers keyword queries against either with timestamps.
//! All temporary files of a request live in one session directory that is
//! removed when the request ends, however it ends.
//!
//! # Quick start
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> vidseek::Result<()> {
//! use vidseek::{Mode, Pipeline, PipelineOptions, Request};
//!
//! let pipeline = Pipeline::builder(PipelineOptions::new()).build();
//!
//! let response = pipeline
//!     .handle(&Request {
//!         reference: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
//!         keyword: Some("never".into()),
//!         mode: Mode::TranscriptSearch,
//!     })
//!     .await;
//! println!("{}", serde_json::to_string(&response)?);
//! # Ok(())
//! # }
//! ```
//!
//! Object search and indexing need detectors, see [`objects::CommandDetector`].

pub mod arena;
pub mod audio;
pub mod cache;
pub mod caption;
pub mod config;
pub mod error;
pub mod fetch;
pub mod frames;
pub mod handle;
pub mod model;
pub mod objects;
pub mod pipeline;
pub(crate) mod process;
pub mod transcribe;
pub mod transcript;
pub mod types;

pub use cache::{cache_key, CacheLookup, TranscriptCache};
pub use config::{DetectionThresholds, DetectorKind, Language, Model, PipelineOptions};
pub use error::{Error, ErrorKind, Result};
pub use handle::{HandleState, ModelHandleManager, ModelLease};
pub use pipeline::{Health, Mode, Pipeline, PipelineBuilder, Request, Response, Results};
pub use types::{
    ArtifactKind, CaptionFile, CaptionHit, CaptionRecord, Detection, Frame, MediaArtifact,
    MediaKind, ObjectHit, ObjectToc, Segment,
};
