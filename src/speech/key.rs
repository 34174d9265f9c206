//! Content-addressed cache keys for synthesis requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Opus,
    Aac,
    Flac,
    Wav,
    Pcm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Pcm => "pcm",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Opus => "audio/ogg",
            Self::Aac => "audio/aac",
            Self::Flac => "audio/flac",
            Self::Wav => "audio/wav",
            Self::Pcm => "audio/pcm",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "opus" => Ok(Self::Opus),
            "aac" => Ok(Self::Aac),
            "flac" => Ok(Self::Flac),
            "wav" => Ok(Self::Wav),
            "pcm" => Ok(Self::Pcm),
            other => Err(format!("unsupported audio format: {other}")),
        }
    }
}

/// One synthesis call, exactly as it would be sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub provider: String,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub format: AudioFormat,
    pub text: String,
    pub instructions: Option<String>,
}

/// Lowercase hex SHA-256 of the canonical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round a speed to the three decimals the cache key distinguishes.
///
/// Requests must carry the rounded value upstream, otherwise two speeds that
/// share a key could produce different audio.
pub fn quantize_speed(speed: f32) -> f32 {
    (speed * 1000.0).round() / 1000.0
}

/// Lowercase hex of a digest.
pub(crate) fn hex_digest(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Derive the cache key for a request.
///
/// Fields are hashed in a fixed order, each as `name`, little-endian byte
/// length, bytes, so no two distinct requests share an encoding. Speed is
/// rendered with three decimals so `1.0` and `1.000` agree.
pub fn cache_key(request: &SpeechRequest) -> CacheKey {
    let speed = format!("{:.3}", quantize_speed(request.speed));
    let fields: [(&str, &str); 7] = [
        ("provider", request.provider.as_str()),
        ("model", request.model.as_str()),
        ("voice", request.voice.as_str()),
        ("speed", speed.as_str()),
        ("format", request.format.as_str()),
        ("text", request.text.as_str()),
        ("instructions", request.instructions.as_deref().unwrap_or("")),
    ];

    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    CacheKey(hex_digest(&hasher.finalize()))
}
