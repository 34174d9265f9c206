//! reader-speech: HTTP service for segmentation, speech and document previews.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use reader_speech::api::{self, AppState};
use reader_speech::config::Config;
use reader_speech::documents::DocumentLibrary;
use reader_speech::preview::{CommandRenderer, FsBlobStore, PreviewQueue, PreviewStore};
use reader_speech::segmenter::SegmenterConfig;
use reader_speech::speech::{AudioCache, OpenAiSpeechProvider, SpeechService};
use reader_speech::usage::UsageLedger;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "reader-speech",
    about = "Text segmentation, speech synthesis and document previews"
)]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port from the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP client/server internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,hyper_util=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,hyper_util=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("reader-speech starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let root = config.storage.root_dir();
    std::fs::create_dir_all(&root)?;
    let database = config.storage.database_path();
    info!("Storage root {}, database {}", root.display(), database.display());

    // Speech synthesis
    let api_key = std::env::var(&config.tts.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
        warn!(
            "{} is not set, upstream speech requests will be unauthenticated",
            config.tts.api_key_env
        );
    }
    let provider = Arc::new(OpenAiSpeechProvider::new(&config.tts, api_key)?);
    let cache = Arc::new(AudioCache::new(
        config.cache.max_bytes,
        Duration::from_secs(config.cache.ttl_secs),
    ));
    let usage = if config.usage.daily_char_limit > 0 {
        Some(Arc::new(UsageLedger::open(
            &database,
            config.usage.daily_char_limit,
        )?))
    } else {
        info!("Daily character quota disabled");
        None
    };
    let speech = Arc::new(SpeechService::new(
        provider,
        cache.clone(),
        usage,
        config.tts.max_input_chars,
    ));
    info!(
        "Speech provider {} at {} (model: {}, voice: {})",
        config.tts.provider, config.tts.base_url, config.tts.model, config.tts.voice
    );

    // Document previews
    let store = Arc::new(PreviewStore::open(&database)?);
    let blobs = Arc::new(FsBlobStore::new(root.join("blobs")));
    let renderer = Arc::new(CommandRenderer::new(
        config.preview.pdftoppm_path.clone(),
        config.preview.ffmpeg_path.clone(),
        Duration::from_millis(config.preview.lease_ms.max(0) as u64),
    ));
    let previews = PreviewQueue::new(store, blobs, renderer, config.preview.clone());

    let state = AppState {
        segmenter: SegmenterConfig {
            max_block_chars: config.segmenter.max_block_chars,
            mode: config.segmenter.mode,
        },
        speech,
        tts: Arc::new(config.tts.clone()),
        documents: Arc::new(DocumentLibrary::new(&root)),
        previews: previews.clone(),
        namespace: config.storage.namespace.clone(),
    };

    let shutdown = CancellationToken::new();

    // Expired audio would otherwise only be dropped when looked up again
    tokio::spawn({
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut tick = tokio::time::interval(CACHE_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!("Purged {purged} expired audio cache entries");
                        }
                    }
                }
            }
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("Received Ctrl+C, shutting down");
            shutdown.cancel();
        }
    });

    api::start_api(state, &config.server.host, config.server.port, shutdown).await?;
    previews.shutdown();

    Ok(())
}
