//! Upstream speech provider client.
//!
//! Speaks the OpenAI-compatible `/audio/speech` contract, which most hosted
//! and self-hosted TTS servers implement. Retries with exponential backoff,
//! but only on 429 and 5xx; cancellation is never retried.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Bytes, SpeechError, SpeechRequest};
use crate::config::TtsConfig;

const MAX_ERROR_BODY_CHARS: usize = 300;

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SpeechError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `initial * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

pub struct OpenAiSpeechProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
    retry: RetryPolicy,
}

impl OpenAiSpeechProvider {
    pub fn new(config: &TtsConfig, api_key: Option<String>) -> Result<Self, SpeechError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SpeechError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: config.provider.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn body(request: &SpeechRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "voice": request.voice,
            "input": request.text,
            "speed": request.speed,
            "response_format": request.format.as_str(),
        });
        if let Some(instructions) = request.instructions.as_deref().filter(|s| !s.is_empty()) {
            body["instructions"] = json!(instructions);
        }
        body
    }
}

/// A non-success response, reduced to what the retry loop needs.
struct Rejection {
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
}

impl Rejection {
    fn into_error(self) -> SpeechError {
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            SpeechError::UpstreamRateLimited {
                retry_after: self.retry_after,
            }
        } else {
            SpeechError::Upstream {
                status: self.status.as_u16(),
                message: self.message,
            }
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn describe_transport(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("cannot connect: {e}")
    } else {
        e.to_string()
    }
}

#[async_trait]
impl SpeechProvider for OpenAiSpeechProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SpeechError> {
        let url = format!("{}/audio/speech", self.base_url);
        let body = Self::body(request);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let t0 = Instant::now();

            let mut builder = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(SpeechError::Aborted),
                sent = builder.send() => sent.map_err(|e| SpeechError::Transport(describe_transport(&e)))?,
            };

            let status = response.status();
            if status.is_success() {
                let audio = tokio::select! {
                    _ = cancel.cancelled() => return Err(SpeechError::Aborted),
                    read = response.bytes() => read.map_err(|e| SpeechError::Transport(describe_transport(&e)))?,
                };
                debug!(
                    "{} synthesized {} chars -> {} bytes in {:.0}ms (attempt {attempt})",
                    self.name,
                    request.text.chars().count(),
                    audio.len(),
                    t0.elapsed().as_secs_f64() * 1000.0,
                );
                return Ok(audio);
            }

            let retry_after = parse_retry_after(&response);
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(SpeechError::Aborted),
                read = response.text() => read.unwrap_or_default(),
            };
            let message: String = body
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            let rejection = Rejection {
                status,
                retry_after,
                message,
            };

            if !RetryPolicy::is_retryable(status) || attempt >= self.retry.max_attempts {
                warn!(
                    "{} rejected synthesis with {status} after {attempt} attempt(s)",
                    self.name
                );
                return Err(rejection.into_error());
            }

            let delay = rejection
                .retry_after
                .unwrap_or_else(|| self.retry.backoff(attempt - 1))
                .min(self.retry.max_backoff);
            warn!(
                "{} returned {status}, retrying in {}ms (attempt {attempt}/{})",
                self.name,
                delay.as_millis(),
                self.retry.max_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(SpeechError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};

    use crate::speech::AudioFormat;

    #[derive(Clone)]
    struct Upstream {
        statuses: Arc<Vec<u16>>,
        calls: Arc<AtomicUsize>,
    }

    async fn speech(
        State(upstream): State<Upstream>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        let n = upstream.calls.fetch_add(1, Ordering::SeqCst);
        let code = upstream.statuses.get(n).or(upstream.statuses.last()).copied().unwrap_or(200);
        let status = axum::http::StatusCode::from_u16(code).unwrap();
        if code != 200 {
            return (status, "busy").into_response();
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let input = body["input"].as_str().unwrap_or("").to_string();
        (status, format!("audio:{input}:{auth}")).into_response()
    }

    async fn spawn_upstream(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = Upstream {
            statuses: Arc::new(statuses),
            calls: calls.clone(),
        };
        let app = Router::new()
            .route("/v1/audio/speech", post(speech))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1"), calls)
    }

    fn provider(base_url: String, max_attempts: u32, backoff: Duration) -> OpenAiSpeechProvider {
        let config = TtsConfig {
            base_url,
            max_attempts,
            ..TtsConfig::default()
        };
        OpenAiSpeechProvider::new(&config, Some("secret".into()))
            .unwrap()
            .with_retry(RetryPolicy {
                max_attempts,
                initial_backoff: backoff,
                max_backoff: backoff * 4,
            })
    }

    fn request() -> SpeechRequest {
        SpeechRequest {
            provider: "openai".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            format: AudioFormat::Mp3,
            text: "hello".into(),
            instructions: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn body_includes_instructions_only_when_present() {
        let mut req = request();
        assert!(OpenAiSpeechProvider::body(&req).get("instructions").is_none());
        req.instructions = Some("calm".into());
        assert_eq!(OpenAiSpeechProvider::body(&req)["instructions"], "calm");
        assert_eq!(OpenAiSpeechProvider::body(&req)["response_format"], "mp3");
    }

    #[tokio::test]
    async fn retries_rate_limits_and_server_errors_then_succeeds() {
        let (base, calls) = spawn_upstream(vec![429, 503, 200]).await;
        let provider = provider(base, 3, Duration::from_millis(1));
        let audio = provider
            .synthesize(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&audio[..], b"audio:hello:Bearer secret");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_is_distinguishable() {
        let (base, calls) = spawn_upstream(vec![429]).await;
        let provider = provider(base, 2, Duration::from_millis(1));
        let err = provider
            .synthesize(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::UpstreamRateLimited { .. }), "{err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (base, calls) = spawn_upstream(vec![400]).await;
        let provider = provider(base, 5, Duration::from_millis(1));
        let err = provider
            .synthesize(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SpeechError::Upstream { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts_without_retry() {
        let (base, calls) = spawn_upstream(vec![503]).await;
        let provider = provider(base, 5, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = provider.synthesize(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, SpeechError::Aborted));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_while_reading_error_body_aborts() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Sends headers for a 500 and then stalls partway through the body.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let provider = provider(format!("http://{addr}/v1"), 1, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = provider.synthesize(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, SpeechError::Aborted), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
