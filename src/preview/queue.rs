//! Lease-based preview queue.
//!
//! `request` never waits for a render. The caller that wins the claim spawns
//! generation in the background and everyone, the winner included, gets the
//! current state with a retry hint to poll on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::blob::{BlobError, BlobStore};
use super::render::PreviewRenderer;
use super::store::{PreviewStore, StoreError};
use super::types::{PreviewKey, PreviewRow, PreviewStatus, ReadyMeta};
use super::PreviewError;
use crate::config::PreviewConfig;
use crate::documents::DocumentSource;
use crate::speech::Bytes;

/// What a caller should do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PreviewState {
    Queued {
        retry_after_ms: u64,
    },
    Processing {
        retry_after_ms: u64,
    },
    Ready(ReadyMeta),
    Failed {
        retry_after_ms: u64,
        error: Option<String>,
        /// Attempts are used up; only a new document version retries.
        terminal: bool,
    },
}

impl PreviewState {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Queued { retry_after_ms }
            | Self::Processing { retry_after_ms }
            | Self::Failed { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            Self::Ready(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum PreviewFetch {
    Image { bytes: Bytes, meta: ReadyMeta },
    Pending(PreviewState),
}

#[derive(Clone)]
pub struct PreviewQueue {
    store: Arc<PreviewStore>,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn PreviewRenderer>,
    config: Arc<PreviewConfig>,
    worker_id: String,
    shutdown: CancellationToken,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl PreviewQueue {
    pub fn new(
        store: Arc<PreviewStore>,
        blobs: Arc<dyn BlobStore>,
        renderer: Arc<dyn PreviewRenderer>,
        config: PreviewConfig,
    ) -> Self {
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4().simple());
        info!("Preview queue {worker_id} ready (variant {})", config.variant);
        Self {
            store,
            blobs,
            renderer,
            config: Arc::new(config),
            worker_id,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn default_variant(&self) -> &str {
        &self.config.variant
    }

    /// Cancel renders this process started. Their leases expire and another
    /// worker picks the rows up.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, PreviewError>
    where
        T: Send + 'static,
        F: FnOnce(&PreviewStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let out = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PreviewError::Task(e.to_string()))??;
        Ok(out)
    }

    fn key_for(&self, source: &DocumentSource, variant: &str) -> Result<PreviewKey, PreviewError> {
        if variant != self.config.variant {
            return Err(PreviewError::UnknownVariant(variant.to_string()));
        }
        Ok(PreviewKey::new(&source.id, &source.namespace, variant))
    }

    fn failed_state(&self, row: &PreviewRow) -> PreviewState {
        PreviewState::Failed {
            retry_after_ms: self.config.failed_retry_after_ms,
            error: row.last_error.clone(),
            terminal: row.attempt_count >= self.config.max_attempts,
        }
    }

    /// Report the preview state for `source`, starting generation if this
    /// caller wins the claim.
    pub async fn request(
        &self,
        source: &DocumentSource,
        variant: &str,
    ) -> Result<PreviewState, PreviewError> {
        let key = self.key_for(source, variant)?;
        let object_key = key.object_key();

        let mut row = {
            let key = key.clone();
            let modified = source.last_modified_ms;
            self.with_store(move |s| s.ensure(&key, modified, &object_key, now_ms()))
                .await?
        };

        if row.status == PreviewStatus::Ready {
            match self.verify_ready(&row).await? {
                Some(meta) => return Ok(PreviewState::Ready(meta)),
                None => {
                    let k = key.clone();
                    row = self
                        .with_store(move |s| {
                            s.requeue(&k, now_ms())?;
                            s.get(&k)?.ok_or_else(|| StoreError::Missing(k.to_string()))
                        })
                        .await?;
                }
            }
        }

        if row.status == PreviewStatus::Failed && row.attempt_count >= self.config.max_attempts {
            return Ok(self.failed_state(&row));
        }

        let owner = format!("{}-{}", self.worker_id, uuid::Uuid::new_v4().simple());
        let claimed = {
            let k = key.clone();
            let owner = owner.clone();
            let lease_ms = self.config.lease_ms;
            let failed_backoff = i64::try_from(self.config.failed_retry_after_ms).unwrap_or(i64::MAX);
            let max_attempts = self.config.max_attempts;
            self.with_store(move |s| {
                let now = now_ms();
                s.try_claim(
                    &k,
                    &owner,
                    now.saturating_add(lease_ms),
                    now.saturating_sub(failed_backoff),
                    max_attempts,
                    now,
                )
            })
            .await?
        };

        if claimed {
            debug!("Claimed preview {key} as {owner}");
            let queue = self.clone();
            let source = source.clone();
            tokio::spawn(async move { queue.generate(key, owner, source).await });
            return Ok(PreviewState::Queued {
                retry_after_ms: self.config.queued_retry_after_ms,
            });
        }

        let k = key.clone();
        let row = self
            .with_store(move |s| s.get(&k)?.ok_or_else(|| StoreError::Missing(k.to_string())))
            .await?;
        Ok(match row.status {
            PreviewStatus::Processing => PreviewState::Processing {
                retry_after_ms: self.config.processing_retry_after_ms,
            },
            PreviewStatus::Failed => self.failed_state(&row),
            PreviewStatus::Queued => PreviewState::Queued {
                retry_after_ms: self.config.queued_retry_after_ms,
            },
            // finished between our ensure and now; the next poll verifies the blob
            PreviewStatus::Ready => match row.ready_meta() {
                Some(meta) => PreviewState::Ready(meta),
                None => PreviewState::Processing {
                    retry_after_ms: self.config.processing_retry_after_ms,
                },
            },
        })
    }

    /// Confirm the blob behind a ready row still exists. `None` means it is
    /// gone and the row must be regenerated.
    async fn verify_ready(&self, row: &PreviewRow) -> Result<Option<ReadyMeta>, PreviewError> {
        match self.blobs.head(&row.object_key).await {
            Ok(blob) => Ok(Some(row.ready_meta().unwrap_or(ReadyMeta {
                content_type: blob.content_type,
                width: row.width.unwrap_or(0),
                height: row.height.unwrap_or(0),
                byte_size: blob.size,
                etag: blob.etag,
            }))),
            Err(BlobError::NotFound(_)) => {
                warn!("Preview {} is ready but its blob is missing, requeueing", row.key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return the image if it is ready, else the state to poll on.
    pub async fn fetch(
        &self,
        source: &DocumentSource,
        variant: &str,
    ) -> Result<PreviewFetch, PreviewError> {
        let meta = match self.request(source, variant).await? {
            PreviewState::Ready(meta) => meta,
            pending => return Ok(PreviewFetch::Pending(pending)),
        };

        let key = self.key_for(source, variant)?;
        match self.blobs.get(&key.object_key()).await {
            Ok((bytes, _)) => Ok(PreviewFetch::Image { bytes, meta }),
            // deleted between head and get
            Err(BlobError::NotFound(_)) => {
                warn!("Preview blob for {key} vanished during fetch, requeueing");
                self.with_store(move |s| s.requeue(&key, now_ms())).await?;
                Ok(PreviewFetch::Pending(self.request(source, variant).await?))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn generate(self, key: PreviewKey, owner: String, source: DocumentSource) {
        let lease = Duration::from_millis(self.config.lease_ms.max(0) as u64);
        let rendered = tokio::time::timeout(
            lease,
            self.renderer.render(&source, self.config.width, &self.shutdown),
        )
        .await;

        let outcome = match rendered {
            Ok(Ok(image)) => {
                let object_key = key.object_key();
                match self
                    .blobs
                    .put(&object_key, image.bytes.clone(), image.content_type)
                    .await
                {
                    Ok(blob) => Ok(ReadyMeta {
                        content_type: image.content_type.to_string(),
                        width: image.width,
                        height: image.height,
                        byte_size: blob.size,
                        etag: blob.etag,
                    }),
                    Err(e) => Err(format!("upload failed: {e}")),
                }
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("render exceeded lease of {}ms", self.config.lease_ms)),
        };

        if self.shutdown.is_cancelled() {
            debug!("Shutting down, leaving {key} for lease expiry");
            return;
        }

        let k = key.clone();
        let o = owner.clone();
        let recorded = match outcome {
            Ok(meta) => {
                info!("Preview {key} ready ({} bytes, {}x{})", meta.byte_size, meta.width, meta.height);
                self.with_store(move |s| s.mark_ready(&k, &o, &meta, now_ms())).await
            }
            Err(error) => {
                warn!("Preview {key} failed: {error}");
                self.with_store(move |s| s.mark_failed(&k, &o, &error, now_ms())).await
            }
        };

        match recorded {
            Ok(true) => {}
            Ok(false) => warn!("Lease on {key} was lost before {owner} finished"),
            Err(e) => warn!("Failed to record preview result for {key}: {e}"),
        }
    }
}
