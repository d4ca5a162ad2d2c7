//! Build an object index with an external detector and custom options.
//!
//! Usage: cargo run --example options -- <video-url> <detector-program>

use std::sync::Arc;
use std::time::Duration;

use vidseek::objects::CommandDetector;
use vidseek::{DetectorKind, Model, Pipeline, PipelineOptions};

#[tokio::main]
async fn main() -> vidseek::Result<()> {
    let mut args = std::env::args().skip(1);
    let reference = args.next().expect("usage: options <video-url> <detector>");
    let detector = args.next().expect("usage: options <video-url> <detector>");

    let opts = PipelineOptions::new()
        .model(Model::Small)
        .language("en")?
        .batch_size(5)?
        .scene_threshold(0.4)?
        .call_timeout(Duration::from_secs(600));

    let pipeline = Pipeline::builder(opts)
        .index_detector(Arc::new(CommandDetector::new(detector, DetectorKind::Common)))
        .build();

    let toc = pipeline.object_index(&reference).await?;
    for (label, times) in &toc {
        let times: Vec<String> = times.iter().map(|t| format!("{t:.1}s")).collect();
        println!("{label:<16} {}", times.join(", "));
    }

    Ok(())
}
