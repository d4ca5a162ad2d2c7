use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::arena::Session;
use crate::audio::AudioDecoder;
use crate::cache::{CacheLookup, TranscriptCache};
use crate::caption;
use crate::error::{Error, Result};
use crate::fetch::MediaFetcher;
use crate::handle::ModelHandleManager;
use crate::types::{ArtifactKind, CaptionFile};

/// Produces caption files for references, from the transcript cache when
/// possible and from the speech model otherwise.
#[derive(Clone)]
pub struct TranscriptBuilder {
    cache: TranscriptCache,
    fetcher: Arc<dyn MediaFetcher>,
    decoder: Arc<dyn AudioDecoder>,
    models: ModelHandleManager,
}

impl TranscriptBuilder {
    pub fn new(
        cache: TranscriptCache,
        fetcher: Arc<dyn MediaFetcher>,
        decoder: Arc<dyn AudioDecoder>,
        models: ModelHandleManager,
    ) -> Self {
        Self {
            cache,
            fetcher,
            decoder,
            models,
        }
    }

    pub fn cache(&self) -> &TranscriptCache {
        &self.cache
    }

    /// Return the caption file for `reference`, keyed by `cache_key`.
    ///
    /// A valid cache entry is used without touching the fetcher or the model.
    /// A corrupt entry is logged and rebuilt. The caption file is also written
    /// to the session's subtitle directory as `<cache_key>.vtt`.
    pub async fn get_or_build_transcript(
        &self,
        reference: &str,
        cache_key: &str,
        session: &Session,
    ) -> Result<CaptionFile> {
        match self.cache.lookup(cache_key).await {
            CacheLookup::Hit(segments) => {
                info!(cache_key, "using cached transcript");
                let file = CaptionFile::from_segments(cache_key, &segments);
                if !file.is_empty() {
                    self.write_subtitle(&file, session).await?;
                    return Ok(file);
                }
                warn!(cache_key, "cached transcript has no usable text, rebuilding");
            }
            CacheLookup::Corrupt(e) => {
                warn!(cache_key, error = %e, "discarding corrupt cache entry");
                self.cache.invalidate(cache_key).await;
            }
            CacheLookup::Miss => debug!(cache_key, "transcript cache miss"),
        }

        self.build(reference, cache_key, session).await
    }

    async fn build(&self, reference: &str, cache_key: &str, session: &Session) -> Result<CaptionFile> {
        let audio = self
            .fetcher
            .fetch_audio(reference, session)
            .await
            .map_err(|e| e.into_fetch(reference))?;

        let samples = self.decoder.decode(&audio.path).await?;

        let lease = self.models.acquire().await?;
        let segments = tokio::task::spawn_blocking(move || lease.transcribe(&samples))
            .await
            .map_err(|e| Error::ModelUnavailable(format!("transcription task failed: {e}")))??;

        let file = CaptionFile::from_segments(cache_key, &segments);
        if file.is_empty() {
            warn!(reference, "transcription produced no usable segments");
            session.discard(&audio.path);
            return Err(Error::TranscriptionEmpty);
        }

        self.write_subtitle(&file, session).await?;

        if let Err(e) = self.cache.store(cache_key, &segments).await {
            warn!(cache_key, error = %e, "failed to write transcript cache");
        }

        session.discard(&audio.path);
        info!(cache_key, cues = file.records().len(), "transcript built");
        Ok(file)
    }

    async fn write_subtitle(&self, file: &CaptionFile, session: &Session) -> Result<()> {
        let path = session.alloc_path(ArtifactKind::Subtitle, &format!("{}.vtt", file.id));
        caption::write_vtt(file, &path).await?;
        Ok(())
    }
}
