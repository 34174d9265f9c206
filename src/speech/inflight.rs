//! In-flight request de-duplication.
//!
//! Concurrent callers asking for the same cache key share one upstream
//! call. Each caller holds a reference; the shared cancellation token fires
//! only when the last caller has gone away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Bytes, CacheKey, SpeechError};

type Outcome = Result<Bytes, SpeechError>;

/// How a caller took part in an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the upstream call.
    Leader,
    /// Awaited a call another caller had already started.
    Joined,
}

struct Entry {
    id: u64,
    refs: usize,
    cancel: CancellationToken,
    result: watch::Receiver<Option<Outcome>>,
}

#[derive(Default)]
pub struct InflightRequests {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    next_id: AtomicU64,
}

/// Drops one caller reference when the caller finishes or its future is dropped.
struct CallerGuard {
    owner: Arc<InflightRequests>,
    key: CacheKey,
    id: u64,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        self.owner.release(&self.key, self.id);
    }
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start` for `key` unless an identical request is already running,
    /// in which case wait for that one instead.
    ///
    /// `start` receives the shared token, which is cancelled only after every
    /// caller has cancelled or disconnected. The operation runs on its own
    /// task, so the leader leaving does not stop it while others still wait.
    pub async fn run<F, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        caller_cancel: &CancellationToken,
        start: F,
    ) -> Result<(Bytes, Role), SpeechError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let (mut result, guard, role) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.refs += 1;
                debug!("Joined in-flight synthesis {key} ({} callers)", entry.refs);
                let guard = CallerGuard {
                    owner: Arc::clone(self),
                    key: key.clone(),
                    id: entry.id,
                };
                (entry.result.clone(), guard, Role::Joined)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let (tx, rx) = watch::channel(None);
                entries.insert(
                    key.clone(),
                    Entry {
                        id,
                        refs: 1,
                        cancel: cancel.clone(),
                        result: rx.clone(),
                    },
                );

                let operation = start(cancel);
                let owner = Arc::clone(self);
                let task_key = key.clone();
                tokio::spawn(async move {
                    let outcome = operation.await;
                    tx.send_replace(Some(outcome));
                    owner.finish(&task_key, id);
                });

                let guard = CallerGuard {
                    owner: Arc::clone(self),
                    key: key.clone(),
                    id,
                };
                (rx, guard, Role::Leader)
            }
        };

        let outcome = tokio::select! {
            _ = caller_cancel.cancelled() => Err(SpeechError::Aborted),
            published = result.wait_for(Option::is_some) => match published {
                Ok(value) => (*value).clone().unwrap_or(Err(SpeechError::Aborted)),
                Err(_) => Err(SpeechError::Transport(
                    "synthesis task ended without a result".into(),
                )),
            },
        };
        drop(guard);

        outcome.map(|audio| (audio, role))
    }

    /// Number of callers attached to `key`, if a request is running.
    pub fn callers(&self, key: &CacheKey) -> Option<usize> {
        self.entries.lock().get(key).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &CacheKey, id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.id != id {
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            entry.cancel.cancel();
            entries.remove(key);
            debug!("Last caller left in-flight synthesis {key}, cancelled upstream");
        }
    }

    fn finish(&self, key: &CacheKey, id: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.id == id) {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use crate::speech::{cache_key, AudioFormat, SpeechRequest};

    fn key(text: &str) -> CacheKey {
        cache_key(&SpeechRequest {
            provider: "test".into(),
            model: "m".into(),
            voice: "v".into(),
            speed: 1.0,
            format: AudioFormat::Mp3,
            text: text.into(),
            instructions: None,
        })
    }

    async fn wait_for_callers(inflight: &InflightRequests, key: &CacheKey, n: usize) {
        for _ in 0..200 {
            if inflight.callers(key) == Some(n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached {n} callers");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_upstream_call() {
        let inflight = Arc::new(InflightRequests::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key("shared");

        let mut handles = Vec::new();
        for _ in 0..5 {
            let inflight = inflight.clone();
            let calls = calls.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                inflight
                    .run(k, &token, move |_shared| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Bytes::from_static(b"audio"))
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (audio, role) = handle.await.unwrap().unwrap();
            assert_eq!(&audio[..], b"audio");
            if role == Role::Leader {
                leaders += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn errors_are_shared_with_joined_callers() {
        let inflight = Arc::new(InflightRequests::new());
        let k = key("failing");

        let first = {
            let inflight = inflight.clone();
            let k = k.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                inflight
                    .run(k, &token, |_| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(SpeechError::UpstreamRateLimited { retry_after: None })
                    })
                    .await
            })
        };
        wait_for_callers(&inflight, &k, 1).await;

        let token = CancellationToken::new();
        let second = inflight
            .run(k, &token, |_| async { Ok(Bytes::from_static(b"unused")) })
            .await;

        assert!(matches!(second, Err(SpeechError::UpstreamRateLimited { .. })));
        assert!(matches!(
            first.await.unwrap(),
            Err(SpeechError::UpstreamRateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn upstream_is_cancelled_only_after_last_caller_leaves() {
        let inflight = Arc::new(InflightRequests::new());
        let upstream_cancelled = Arc::new(AtomicBool::new(false));
        let k = key("abandoned");

        let spawn_caller = |token: CancellationToken| {
            let inflight = inflight.clone();
            let flag = upstream_cancelled.clone();
            let k = k.clone();
            tokio::spawn(async move {
                inflight
                    .run(k, &token, move |shared| async move {
                        shared.cancelled().await;
                        flag.store(true, Ordering::SeqCst);
                        Err(SpeechError::Aborted)
                    })
                    .await
            })
        };

        let first_token = CancellationToken::new();
        let second_token = CancellationToken::new();
        let first = spawn_caller(first_token.clone());
        wait_for_callers(&inflight, &k, 1).await;
        let second = spawn_caller(second_token.clone());
        wait_for_callers(&inflight, &k, 2).await;

        first_token.cancel();
        assert!(matches!(first.await.unwrap(), Err(SpeechError::Aborted)));
        assert_eq!(inflight.callers(&k), Some(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!upstream_cancelled.load(Ordering::SeqCst));

        second_token.cancel();
        assert!(matches!(second.await.unwrap(), Err(SpeechError::Aborted)));
        for _ in 0..100 {
            if upstream_cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(upstream_cancelled.load(Ordering::SeqCst));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn dropped_caller_future_releases_its_reference() {
        let inflight = Arc::new(InflightRequests::new());
        let k = key("dropped");

        let handle = {
            let inflight = inflight.clone();
            let k = k.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                inflight
                    .run(k, &token, |shared| async move {
                        shared.cancelled().await;
                        Err(SpeechError::Aborted)
                    })
                    .await
            })
        };
        wait_for_callers(&inflight, &k, 1).await;

        // Aborting the task drops the caller future, like a client disconnect.
        handle.abort();
        let _ = handle.await;
        assert!(inflight.is_empty());
    }
}
