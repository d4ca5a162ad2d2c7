use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default idle period after which the transcription model is unloaded.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of frames materialized at once.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default scene-change score above which a frame becomes a candidate.
pub const DEFAULT_SCENE_THRESHOLD: f64 = 0.3;

/// Language passed to whisper for transcription.
///
/// Accepts short codes ("en", "de") or full names ("english", "german"),
/// validated against whisper.cpp's language table.
#[derive(Debug, Clone, Default)]
pub enum Language {
    #[default]
    Auto,
    Code { code: String, id: i32 },
}

impl Language {
    pub fn new(lang: &str) -> Result<Self> {
        let lower = lang.to_lowercase();
        if lower == "auto" {
            return Ok(Language::Auto);
        }

        match whisper_rs::get_lang_id(&lower) {
            Some(id) => {
                let code = whisper_rs::get_lang_str(id).unwrap_or(&lower).to_string();
                Ok(Language::Code { code, id })
            }
            None => Err(Error::InvalidOption(format!(
                "unsupported transcription language: {lang}"
            ))),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Language::Auto => None,
            Language::Code { code, .. } => Some(code),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Auto => write!(f, "auto"),
            Language::Code { code, .. } => write!(f, "{code}"),
        }
    }
}

/// Whisper model sizes.
#[derive(Debug, Clone)]
pub enum Model {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    LargeV3,
    LargeV3Turbo,
    /// User-provided .ggml file path.
    Custom(PathBuf),
}

impl Model {
    /// Model filename as published in the whisper.cpp model repository.
    pub fn filename(&self) -> String {
        match self {
            Model::Custom(path) => path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "custom-model".into()),
            other => format!("ggml-{}.bin", other.name()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Model::Tiny => "tiny",
            Model::TinyEn => "tiny.en",
            Model::Base => "base",
            Model::BaseEn => "base.en",
            Model::Small => "small",
            Model::SmallEn => "small.en",
            Model::Medium => "medium",
            Model::MediumEn => "medium.en",
            Model::LargeV3 => "large-v3",
            Model::LargeV3Turbo => "large-v3-turbo",
            Model::Custom(_) => "custom",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tiny" => Some(Model::Tiny),
            "tiny.en" => Some(Model::TinyEn),
            "base" => Some(Model::Base),
            "base.en" => Some(Model::BaseEn),
            "small" => Some(Model::Small),
            "small.en" => Some(Model::SmallEn),
            "medium" => Some(Model::Medium),
            "medium.en" => Some(Model::MediumEn),
            "large-v3" => Some(Model::LargeV3),
            "large-v3-turbo" => Some(Model::LargeV3Turbo),
            _ => None,
        }
    }
}

/// Which external detector a threshold applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// Closed label set (e.g. COCO classes).
    Common,
    /// Free-text labels supplied per call.
    OpenVocabulary,
}

/// Minimum detection scores. Index thresholds are per detector kind;
/// `search` applies to free-text object queries and is stricter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    pub common: f32,
    pub open_vocabulary: f32,
    pub search: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            common: 0.3,
            open_vocabulary: 0.3,
            search: 0.6,
        }
    }
}

impl DetectionThresholds {
    pub fn index_threshold(&self, kind: DetectorKind) -> f32 {
        match kind {
            DetectorKind::Common => self.common,
            DetectorKind::OpenVocabulary => self.open_vocabulary,
        }
    }
}

/// Builder for pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub temp_root: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub model: Model,
    pub language: Language,
    pub caption_language: String,
    pub idle_timeout: Duration,
    pub batch_size: usize,
    pub scene_threshold: f64,
    pub thresholds: DetectionThresholds,
    pub gpu: bool,
    pub n_threads: Option<u32>,
    pub call_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            temp_root: None,
            cache_dir: None,
            model_dir: None,
            model: Model::Base,
            language: Language::Auto,
            caption_language: "en".into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            scene_threshold: DEFAULT_SCENE_THRESHOLD,
            thresholds: DetectionThresholds::default(),
            gpu: true,
            n_threads: None,
            call_timeout: None,
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temp_root(mut self, dir: PathBuf) -> Self {
        self.temp_root = Some(dir);
        self
    }

    pub fn cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    pub fn model_dir(mut self, dir: PathBuf) -> Self {
        self.model_dir = Some(dir);
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.model = model;
        self
    }

    pub fn language(mut self, lang: &str) -> Result<Self> {
        self.language = Language::new(lang)?;
        Ok(self)
    }

    pub fn caption_language(mut self, lang: impl Into<String>) -> Self {
        self.caption_language = lang.into();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidOption("batch_size must be at least 1".into()));
        }
        self.batch_size = size;
        Ok(self)
    }

    pub fn scene_threshold(mut self, threshold: f64) -> Result<Self> {
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(Error::InvalidOption(format!(
                "scene_threshold must be between 0 and 1 (exclusive), got {threshold}"
            )));
        }
        self.scene_threshold = threshold;
        Ok(self)
    }

    pub fn thresholds(mut self, thresholds: DetectionThresholds) -> Result<Self> {
        for (name, value) in [
            ("common", thresholds.common),
            ("open_vocabulary", thresholds.open_vocabulary),
            ("search", thresholds.search),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidOption(format!(
                    "{name} threshold must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        self.thresholds = thresholds;
        Ok(self)
    }

    pub fn gpu(mut self, enabled: bool) -> Self {
        self.gpu = enabled;
        self
    }

    pub fn n_threads(mut self, n: u32) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidOption("n_threads must be at least 1".into()));
        }
        self.n_threads = Some(n);
        Ok(self)
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Session temp root, defaulting to `<system temp>/vidseek`.
    pub fn resolve_temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vidseek"))
    }

    /// Transcript cache directory, defaulting to ~/.cache/vidseek/transcripts.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| base_cache_dir().join("transcripts"))
    }

    /// Model weight directory, defaulting to ~/.cache/vidseek/models.
    pub fn resolve_model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| base_cache_dir().join("models"))
    }
}

fn base_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("vidseek")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = PipelineOptions::default();
        assert_eq!(opts.idle_timeout, Duration::from_secs(300));
        assert_eq!(opts.batch_size, 10);
        assert_eq!(opts.caption_language, "en");
        assert!((opts.scene_threshold - 0.3).abs() < f64::EPSILON);
        assert!(opts.thresholds.search > opts.thresholds.common);
    }

    #[test]
    fn test_batch_size_rejects_zero() {
        assert!(PipelineOptions::new().batch_size(0).is_err());
        assert_eq!(PipelineOptions::new().batch_size(4).unwrap().batch_size, 4);
    }

    #[test]
    fn test_scene_threshold_bounds() {
        assert!(PipelineOptions::new().scene_threshold(0.0).is_err());
        assert!(PipelineOptions::new().scene_threshold(1.0).is_err());
        assert!(PipelineOptions::new().scene_threshold(f64::NAN).is_err());
        assert!(PipelineOptions::new().scene_threshold(0.45).is_ok());
    }

    #[test]
    fn test_thresholds_validated() {
        let bad = DetectionThresholds {
            search: 1.5,
            ..DetectionThresholds::default()
        };
        assert!(PipelineOptions::new().thresholds(bad).is_err());
    }

    #[test]
    fn test_index_threshold_is_per_kind() {
        let t = DetectionThresholds {
            common: 0.25,
            open_vocabulary: 0.35,
            search: 0.6,
        };
        assert_eq!(t.index_threshold(DetectorKind::Common), 0.25);
        assert_eq!(t.index_threshold(DetectorKind::OpenVocabulary), 0.35);
    }

    #[test]
    fn test_model_filename() {
        assert_eq!(Model::Base.filename(), "ggml-base.bin");
        assert_eq!(Model::LargeV3Turbo.filename(), "ggml-large-v3-turbo.bin");
        assert_eq!(
            Model::Custom(PathBuf::from("/m/my-model.bin")).filename(),
            "my-model.bin"
        );
    }

    #[test]
    fn test_model_parse_name_roundtrips() {
        for name in ["tiny", "base.en", "medium", "large-v3"] {
            assert_eq!(Model::parse_name(name).unwrap().name(), name);
        }
        assert!(Model::parse_name("huge").is_none());
    }

    #[test]
    fn test_resolve_dirs_honor_overrides() {
        let opts = PipelineOptions::new()
            .temp_root(PathBuf::from("/x/tmp"))
            .cache_dir(PathBuf::from("/x/cache"));
        assert_eq!(opts.resolve_temp_root(), PathBuf::from("/x/tmp"));
        assert_eq!(opts.resolve_cache_dir(), PathBuf::from("/x/cache"));
    }

    #[test]
    fn test_language_auto() {
        assert!(matches!(Language::new("AUTO").unwrap(), Language::Auto));
        assert_eq!(Language::Auto.to_string(), "auto");
    }
}
