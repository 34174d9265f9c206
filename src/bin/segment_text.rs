//! segment-text: split text from stdin into TTS-ready blocks.
//!
//! Prints the blocks as JSON. Segments locally by default; with `--server`
//! it asks a running reader-speech instance instead and falls back to local
//! segmentation if the server is unreachable.

use std::io::Read;
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use reader_speech::segmenter::{SegmentMode, Segmenter, SegmenterConfig, DEFAULT_MAX_BLOCK_CHARS};

#[derive(Parser, Debug)]
#[command(name = "segment-text", about = "Split text on stdin into TTS-ready blocks")]
struct Args {
    /// Paragraph mode: pdf (blank-line paragraphs) or epub (every newline)
    #[arg(short, long, default_value = "pdf")]
    mode: SegmentMode,

    /// Maximum characters per block
    #[arg(long, default_value_t = DEFAULT_MAX_BLOCK_CHARS)]
    max_chars: usize,

    /// Base URL of a running reader-speech server, e.g. http://127.0.0.1:8780
    #[arg(long)]
    server: Option<String>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    text: &'a str,
    mode: SegmentMode,
    max_block_chars: usize,
}

#[derive(Serialize, Deserialize)]
struct SegmentOutput {
    blocks: Vec<String>,
    count: usize,
}

async fn segment_remote(server: &str, request: &SegmentRequest<'_>) -> Option<SegmentOutput> {
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;
    let response = client
        .post(format!("{}/segment", server.trim_end_matches('/')))
        .json(request)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}

fn segment_local(request: &SegmentRequest<'_>) -> SegmentOutput {
    let blocks = Segmenter::new(SegmenterConfig {
        max_block_chars: request.max_block_chars,
        mode: request.mode,
    })
    .segment(request.text);
    SegmentOutput {
        count: blocks.len(),
        blocks,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let request = SegmentRequest {
        text: &input,
        mode: args.mode,
        max_block_chars: args.max_chars.max(1),
    };

    let output = match &args.server {
        Some(server) => match segment_remote(server, &request).await {
            Some(output) => output,
            None => {
                eprintln!("segment-text: {server} unreachable, segmenting locally");
                segment_local(&request)
            }
        },
        None => segment_local(&request),
    };

    let json = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{json}");
    Ok(())
}
