//! Speech synthesis facade used by the HTTP layer.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    cache_key, quantize_speed, AudioCache, AudioFormat, Bytes, CacheKey, InflightRequests, Role,
    SpeechError, SpeechProvider, SpeechRequest,
};
use crate::usage::UsageLedger;

const MIN_SPEED: f32 = 0.25;
const MAX_SPEED: f32 = 4.0;

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: Bytes,
    pub format: AudioFormat,
    pub cache_hit: bool,
    /// Served by an upstream call another caller had already started.
    pub joined: bool,
    pub key: CacheKey,
}

pub struct SpeechService {
    provider: Arc<dyn SpeechProvider>,
    cache: Arc<AudioCache>,
    inflight: Arc<InflightRequests>,
    usage: Option<Arc<UsageLedger>>,
    max_input_chars: usize,
}

impl SpeechService {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        cache: Arc<AudioCache>,
        usage: Option<Arc<UsageLedger>>,
        max_input_chars: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            inflight: Arc::new(InflightRequests::new()),
            usage,
            max_input_chars,
        }
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    pub fn inflight(&self) -> &Arc<InflightRequests> {
        &self.inflight
    }

    pub fn usage(&self) -> Option<&Arc<UsageLedger>> {
        self.usage.as_ref()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn validate(&self, request: &SpeechRequest) -> Result<(), SpeechError> {
        if request.text.trim().is_empty() {
            return Err(SpeechError::InvalidRequest("text must not be empty".into()));
        }
        let chars = request.text.chars().count();
        if chars > self.max_input_chars {
            return Err(SpeechError::InvalidRequest(format!(
                "text is {chars} characters, limit is {}",
                self.max_input_chars
            )));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&request.speed) {
            return Err(SpeechError::InvalidRequest(format!(
                "speed must be between {MIN_SPEED} and {MAX_SPEED}"
            )));
        }
        if request.voice.trim().is_empty() || request.model.trim().is_empty() {
            return Err(SpeechError::InvalidRequest("voice and model are required".into()));
        }
        Ok(())
    }

    /// Synthesize `request` for `user_id`.
    ///
    /// Cache hits are free. Misses are charged against the user's daily quota
    /// before the upstream call, including misses that end up joining a call
    /// already in flight.
    pub async fn synthesize(
        &self,
        user_id: &str,
        mut request: SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, SpeechError> {
        self.validate(&request)?;
        // upstream gets exactly the speed the key was derived from
        request.speed = quantize_speed(request.speed);
        let key = cache_key(&request);
        let format = request.format;

        if let Some(audio) = self.cache.get(&key) {
            debug!("Audio cache hit {key} for {user_id}");
            return Ok(SynthesisOutput {
                audio,
                format,
                cache_hit: true,
                joined: false,
                key,
            });
        }

        if let Some(ledger) = &self.usage {
            let ledger = Arc::clone(ledger);
            let user = user_id.to_string();
            let chars = request.text.chars().count() as u64;
            tokio::task::spawn_blocking(move || ledger.charge(&user, chars, Utc::now()))
                .await
                .map_err(|e| SpeechError::Usage(format!("usage task failed: {e}")))??;
        }

        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let task_key = key.clone();
        let (audio, role) = self
            .inflight
            .run(key.clone(), cancel, move |shared_cancel| async move {
                let audio = provider.synthesize(&request, &shared_cancel).await?;
                cache.insert(task_key, audio.clone());
                Ok(audio)
            })
            .await?;

        info!(
            "Synthesized {} bytes for {user_id} via {} ({:?})",
            audio.len(),
            self.provider.name(),
            role
        );
        Ok(SynthesisOutput {
            audio,
            format,
            cache_hit: false,
            joined: role == Role::Joined,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    struct MockProvider {
        calls: AtomicUsize,
        speeds: parking_lot::Mutex<Vec<f32>>,
        delay: Duration,
    }

    impl MockProvider {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                speeds: parking_lot::Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl SpeechProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn synthesize(
            &self,
            request: &SpeechRequest,
            cancel: &CancellationToken,
        ) -> Result<Bytes, SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.speeds.lock().push(request.speed);
            tokio::select! {
                _ = cancel.cancelled() => Err(SpeechError::Aborted),
                _ = tokio::time::sleep(self.delay) => {
                    Ok(Bytes::from(format!("audio:{}", request.text)))
                }
            }
        }
    }

    fn request(text: &str) -> SpeechRequest {
        SpeechRequest {
            provider: "mock".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            format: AudioFormat::Mp3,
            text: text.into(),
            instructions: None,
        }
    }

    fn service(provider: Arc<MockProvider>, usage: Option<Arc<UsageLedger>>) -> Arc<SpeechService> {
        let cache = Arc::new(AudioCache::new(1024 * 1024, Duration::from_secs(60)));
        Arc::new(SpeechService::new(provider, cache, usage, 100))
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let provider = MockProvider::new(Duration::from_millis(5));
        let service = service(provider.clone(), None);
        let cancel = CancellationToken::new();

        let first = service.synthesize("u1", request("Hello."), &cancel).await.unwrap();
        let second = service.synthesize("u1", request("Hello."), &cancel).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.audio, second.audio);
        assert_eq!(first.key, second.key);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_make_one_upstream_call() {
        let provider = MockProvider::new(Duration::from_millis(150));
        let service = service(provider.clone(), None);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    service.synthesize("u1", request("Same text."), &cancel).await
                })
            })
            .collect();

        let mut joined = 0;
        for handle in handles {
            let out = handle.await.unwrap().unwrap();
            assert_eq!(&out.audio[..], b"audio:Same text.");
            if out.joined {
                joined += 1;
            }
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 5);
        assert!(service.inflight().is_empty());
    }

    #[tokio::test]
    async fn upstream_speed_matches_the_keyed_speed() {
        let provider = MockProvider::new(Duration::ZERO);
        let service = service(provider.clone(), None);
        let cancel = CancellationToken::new();

        let mut slow = request("Speed.");
        slow.speed = 1.0;
        let mut nearly = request("Speed.");
        nearly.speed = 1.0004;
        let mut faster = request("Speed.");
        faster.speed = 1.2345;

        let a = service.synthesize("u1", slow, &cancel).await.unwrap();
        let b = service.synthesize("u1", nearly, &cancel).await.unwrap();
        let c = service.synthesize("u1", faster, &cancel).await.unwrap();

        // 1.0004 is sent as 1.0, so sharing the 1.0 audio is correct
        assert_eq!(a.key, b.key);
        assert!(b.cache_hit);
        assert_ne!(a.key, c.key);
        assert!(!c.cache_hit);

        let speeds = provider.speeds.lock().clone();
        assert_eq!(speeds.len(), 2);
        for (speed, key) in speeds.iter().zip([&a.key, &c.key]) {
            let mut sent = request("Speed.");
            sent.speed = *speed;
            assert_eq!(&cache_key(&sent), key);
            assert_eq!(quantize_speed(*speed), *speed);
        }
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_upstream() {
        let provider = MockProvider::new(Duration::ZERO);
        let service = service(provider.clone(), None);
        let cancel = CancellationToken::new();

        let mut fast = request("Hi.");
        fast.speed = 5.0;
        for bad in [request("   "), request(&"x".repeat(101)), fast] {
            let err = service.synthesize("u1", bad, &cancel).await.unwrap_err();
            assert!(matches!(err, SpeechError::InvalidRequest(_)), "{err:?}");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn quota_is_charged_on_misses_only() {
        let provider = MockProvider::new(Duration::ZERO);
        let ledger = Arc::new(UsageLedger::in_memory(12).unwrap());
        let service = service(provider.clone(), Some(ledger.clone()));
        let cancel = CancellationToken::new();

        service.synthesize("u1", request("Ten chars."), &cancel).await.unwrap();
        // cache hit, not charged
        service.synthesize("u1", request("Ten chars."), &cancel).await.unwrap();
        assert_eq!(ledger.usage("u1", Utc::now()).unwrap().used, 10);

        let err = service
            .synthesize("u1", request("Different."), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::QuotaExceeded { limit: 12, used: 10, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_caller_gets_aborted_and_nothing_is_cached() {
        let provider = MockProvider::new(Duration::from_secs(10));
        let service = service(provider.clone(), None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = service
            .synthesize("u1", request("Slow."), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Aborted));
        assert_eq!(service.cache().stats().entries, 0);
    }
}
