use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use vidseek::objects::CommandDetector;
use vidseek::{DetectionThresholds, DetectorKind, Mode, Model, Pipeline, PipelineOptions, Request};

#[derive(Parser)]
#[command(name = "vidseek", about = "Search videos by spoken words or visible objects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find where a keyword is spoken.
    Search {
        /// Video reference (URL).
        reference: String,
        /// Keyword to look for in the transcript.
        keyword: String,
        #[command(flatten)]
        opts: PipelineArgs,
    },
    /// Find where an object is visible.
    FindObject {
        reference: String,
        /// Free-text description of the object.
        query: String,
        #[command(flatten)]
        opts: PipelineArgs,
    },
    /// List every detected object with its timestamps.
    Index {
        reference: String,
        #[command(flatten)]
        opts: PipelineArgs,
    },
    /// List available and cached whisper models.
    ListModels {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Download a whisper model without running a search.
    DownloadModel {
        name: String,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Whisper model name or path to a .ggml file.
    #[arg(short, long, default_value = "base")]
    model: String,

    /// Transcription language code (e.g. "en", "de") or "auto".
    #[arg(short, long, default_value = "auto")]
    language: String,

    /// Language of published captions to prefer.
    #[arg(long, default_value = "en")]
    caption_language: String,

    /// Disable GPU acceleration.
    #[arg(long)]
    no_gpu: bool,

    /// Number of threads (default: auto).
    #[arg(long)]
    threads: Option<u32>,

    /// Transcript cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Model weight directory.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Root for per-request temporary files.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Frames materialized at once.
    #[arg(long, default_value_t = vidseek::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Scene-change score for frame selection, between 0 and 1.
    #[arg(long, default_value_t = vidseek::config::DEFAULT_SCENE_THRESHOLD)]
    scene_threshold: f64,

    /// Deadline in seconds for each external call.
    #[arg(long)]
    timeout: Option<u64>,

    /// Closed-set detector program used by `index`.
    #[arg(long)]
    detector: Option<PathBuf>,

    /// Extra argument for the index detector (repeatable).
    #[arg(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// Open-vocabulary detector program used by `find-object`.
    #[arg(long)]
    search_detector: Option<PathBuf>,

    /// Extra argument for the search detector (repeatable).
    #[arg(long = "search-detector-arg", allow_hyphen_values = true)]
    search_detector_args: Vec<String>,

    /// Minimum score for closed-set index detections.
    #[arg(long, default_value_t = 0.3)]
    common_threshold: f32,

    /// Minimum score for open-vocabulary index detections.
    #[arg(long, default_value_t = 0.3)]
    open_vocabulary_threshold: f32,

    /// Minimum score for object search hits.
    #[arg(long, default_value_t = 0.6)]
    search_threshold: f32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidseek=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let (request, args) = match cli.command {
        Command::ListModels { model_dir } => {
            list_models(model_dir);
            return;
        }
        Command::DownloadModel { name, model_dir } => {
            download_model(&name, model_dir).await;
            return;
        }
        Command::Search {
            reference,
            keyword,
            opts,
        } => (new_request(reference, Some(keyword), Mode::TranscriptSearch), opts),
        Command::FindObject {
            reference,
            query,
            opts,
        } => (new_request(reference, Some(query), Mode::ObjectSearch), opts),
        Command::Index { reference, opts } => (new_request(reference, None, Mode::Index), opts),
    };

    let pipeline = match build_pipeline(args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let response = pipeline.handle(&request).await;
    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("JSON error: {e}");
            std::process::exit(1);
        }
    }

    match response.status() {
        200 => {}
        404 => std::process::exit(1),
        _ => std::process::exit(2),
    }
}

fn new_request(reference: String, keyword: Option<String>, mode: Mode) -> Request {
    Request {
        reference,
        keyword,
        mode,
    }
}

fn parse_model(name: &str) -> Option<Model> {
    Model::parse_name(name).or_else(|| {
        let path = PathBuf::from(name);
        path.exists().then_some(Model::Custom(path))
    })
}

fn build_pipeline(args: PipelineArgs) -> vidseek::Result<Pipeline> {
    let model = parse_model(&args.model).ok_or_else(|| {
        vidseek::Error::InvalidOption(format!(
            "unknown model: {} (use list-models, or provide a path to a .ggml file)",
            args.model
        ))
    })?;

    let mut opts = PipelineOptions::new()
        .model(model)
        .language(&args.language)?
        .caption_language(args.caption_language)
        .gpu(!args.no_gpu)
        .batch_size(args.batch_size)?
        .scene_threshold(args.scene_threshold)?
        .thresholds(DetectionThresholds {
            common: args.common_threshold,
            open_vocabulary: args.open_vocabulary_threshold,
            search: args.search_threshold,
        })?;

    if let Some(n) = args.threads {
        opts = opts.n_threads(n)?;
    }
    if let Some(dir) = args.cache_dir {
        opts = opts.cache_dir(dir);
    }
    if let Some(dir) = args.model_dir {
        opts = opts.model_dir(dir);
    }
    if let Some(dir) = args.temp_dir {
        opts = opts.temp_root(dir);
    }
    if let Some(secs) = args.timeout {
        opts = opts.call_timeout(Duration::from_secs(secs));
    }

    let timeout = opts.call_timeout;
    let mut builder = Pipeline::builder(opts);
    if let Some(program) = args.detector {
        builder = builder.index_detector(Arc::new(
            CommandDetector::new(program, DetectorKind::Common)
                .args(args.detector_args)
                .timeout(timeout),
        ));
    }
    if let Some(program) = args.search_detector {
        builder = builder.search_detector(Arc::new(
            CommandDetector::new(program, DetectorKind::OpenVocabulary)
                .args(args.search_detector_args)
                .timeout(timeout),
        ));
    }

    Ok(builder.build())
}

fn list_models(model_dir: Option<PathBuf>) {
    let models = [
        ("tiny", "75 MB"),
        ("tiny.en", "75 MB"),
        ("base", "142 MB"),
        ("base.en", "142 MB"),
        ("small", "466 MB"),
        ("small.en", "466 MB"),
        ("medium", "1.5 GB"),
        ("medium.en", "1.5 GB"),
        ("large-v3", "2.9 GB"),
        ("large-v3-turbo", "~1.6 GB"),
    ];
    println!("{:<16} SIZE", "MODEL");
    println!("{:<16} ----", "-----");
    for (name, size) in models {
        println!("{name:<16} {size}");
    }

    let dir = model_dir.unwrap_or_else(|| PipelineOptions::default().resolve_model_dir());
    let cached = vidseek::model::list_cached_models(&dir);
    if !cached.is_empty() {
        println!("\nCached models in {}:", dir.display());
        for path in cached {
            let size = std::fs::metadata(&path)
                .map(|m| format_bytes(m.len()))
                .unwrap_or_default();
            println!(
                "  {} ({})",
                path.file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size
            );
        }
    }
}

async fn download_model(name: &str, model_dir: Option<PathBuf>) {
    let Some(model) = Model::parse_name(name) else {
        eprintln!("Unknown model: {name}");
        eprintln!("Use list-models to see available models");
        std::process::exit(1);
    };
    let dir = model_dir.unwrap_or_else(|| PipelineOptions::default().resolve_model_dir());
    match vidseek::model::ensure_model(&model, &dir).await {
        Ok(path) => println!("Model ready: {}", path.display()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.0} MB", bytes as f64 / 1_000_000.0)
    } else {
        format!("{:.0} KB", bytes as f64 / 1_000.0)
    }
}
