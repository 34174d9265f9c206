//! Configuration management for reader-speech-rs.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so a missing file or a partial file is always usable.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::segmenter::{SegmentMode, DEFAULT_MAX_BLOCK_CHARS};
use crate::speech::AudioFormat;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8780,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    pub max_block_chars: usize,
    pub mode: SegmentMode,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            max_block_chars: DEFAULT_MAX_BLOCK_CHARS,
            mode: SegmentMode::Pdf,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Provider label, part of the cache key.
    pub provider: String,
    pub base_url: String,
    /// Name of the environment variable holding the provider API key.
    pub api_key_env: String,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    /// Default output format; an unknown name fails the config parse.
    pub format: AudioFormat,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_input_chars: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "TTS_API_KEY".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            format: AudioFormat::Mp3,
            timeout_secs: 60,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            max_input_chars: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Characters a single user may synthesize per UTC day. 0 disables the quota.
    pub daily_char_limit: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            daily_char_limit: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub width: u32,
    pub variant: String,
    pub lease_ms: i64,
    pub queued_retry_after_ms: u64,
    pub processing_retry_after_ms: u64,
    pub failed_retry_after_ms: u64,
    pub max_attempts: i64,
    pub pdftoppm_path: String,
    pub ffmpeg_path: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            width: 240,
            variant: "card-240-jpeg".into(),
            lease_ms: 60_000,
            queued_retry_after_ms: 1500,
            processing_retry_after_ms: 1500,
            failed_retry_after_ms: 15_000,
            max_attempts: 5,
            pdftoppm_path: "pdftoppm".into(),
            ffmpeg_path: "ffmpeg".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for documents and blobs. Empty means `<data dir>/reader-speech`.
    pub root: String,
    /// SQLite database file. Empty means `<root>/reader-speech.db`.
    pub database: String,
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            database: String::new(),
            namespace: "default".into(),
        }
    }
}

impl StorageConfig {
    pub fn root_dir(&self) -> PathBuf {
        if self.root.is_empty() {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("reader-speech")
        } else {
            PathBuf::from(&self.root)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        if self.database.is_empty() {
            self.root_dir().join("reader-speech.db")
        } else {
            PathBuf::from(&self.database)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub segmenter: SegmenterSettings,
    pub tts: TtsConfig,
    pub cache: CacheConfig,
    pub usage: UsageConfig,
    pub preview: PreviewConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/reader-speech/config.yaml
    /// 3. /etc/reader-speech/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/reader-speech/config.yaml")),
                Some(PathBuf::from("/etc/reader-speech/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
