//! Speech synthesis: cache keys, audio cache, in-flight de-duplication and
//! the upstream provider client.
//!
//! Components:
//! - `key`: canonical request hashing (SHA-256)
//! - `cache`: byte-bounded LRU with TTL for synthesized audio
//! - `inflight`: joins concurrent identical requests onto one upstream call
//! - `provider`: OpenAI-compatible HTTP client with retry/backoff
//! - `service`: the facade route handlers call

pub mod cache;
pub mod inflight;
pub mod key;
pub mod provider;
pub mod service;

use std::time::Duration;

pub use axum::body::Bytes;
use thiserror::Error;

pub use cache::{AudioCache, CacheStats};
pub use inflight::{InflightRequests, Role};
pub use key::{cache_key, quantize_speed, AudioFormat, CacheKey, SpeechRequest};
pub use provider::{OpenAiSpeechProvider, RetryPolicy, SpeechProvider};
pub use service::{SpeechService, SynthesisOutput};

use crate::usage::UsageError;

/// Errors surfaced by the synthesis path.
///
/// `Clone` so a single in-flight outcome can be handed to every joined caller.
#[derive(Debug, Clone, Error)]
pub enum SpeechError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's own daily character quota, not the provider's.
    #[error("daily character quota exceeded ({used}/{limit})")]
    QuotaExceeded {
        limit: u64,
        used: u64,
        retry_after: Duration,
    },

    #[error("upstream speech provider is rate limiting requests")]
    UpstreamRateLimited { retry_after: Option<Duration> },

    #[error("upstream speech provider returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("request aborted")]
    Aborted,

    #[error("usage ledger error: {0}")]
    Usage(String),
}

impl From<UsageError> for SpeechError {
    fn from(e: UsageError) -> Self {
        match e {
            UsageError::DailyLimitExceeded {
                limit,
                used,
                retry_after,
            } => Self::QuotaExceeded {
                limit,
                used,
                retry_after,
            },
            other => Self::Usage(other.to_string()),
        }
    }
}
