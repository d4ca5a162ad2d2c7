//! Find where a keyword is spoken in a video.
//!
//! Usage: cargo run --example search -- <video-url> <keyword>

use vidseek::{Pipeline, PipelineOptions};

#[tokio::main]
async fn main() -> vidseek::Result<()> {
    let mut args = std::env::args().skip(1);
    let reference = args.next().expect("usage: search <video-url> <keyword>");
    let keyword = args.next().expect("usage: search <video-url> <keyword>");

    let pipeline = Pipeline::builder(PipelineOptions::new()).build();
    let hits = pipeline.transcript_search(&reference, &keyword).await?;

    for hit in hits {
        println!("{}  {}", vidseek::caption::format_timestamp(hit.timestamp), hit.text);
    }

    Ok(())
}
