//! Document preview generation.
//!
//! Thumbnails are rendered at most once per document version. Concurrent
//! requests coordinate through a lease stored on the preview row; losers
//! poll instead of waiting.
//!
//! Components:
//! - `types`: row model and status
//! - `store`: SQLite row persistence with conditional transitions
//! - `blob`: object storage for the rendered images
//! - `render`: pdftoppm/ffmpeg thumbnail rendering
//! - `queue`: the claim/poll protocol callers use

pub mod blob;
pub mod queue;
pub mod render;
pub mod store;
pub mod types;

use thiserror::Error;

pub use blob::{BlobError, BlobMeta, BlobStore, FsBlobStore};
pub use queue::{PreviewFetch, PreviewQueue, PreviewState};
pub use render::{CommandRenderer, PreviewRenderer, RenderError, RenderedImage};
pub use store::{PreviewStore, StoreError};
pub use types::{PreviewKey, PreviewRow, PreviewStatus, ReadyMeta};

use crate::documents::DocumentError;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("unknown preview variant: {0}")]
    UnknownVariant(String),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("preview store: {0}")]
    Store(#[from] StoreError),

    #[error("preview storage: {0}")]
    Blob(#[from] BlobError),

    #[error("preview render: {0}")]
    Render(#[from] RenderError),

    #[error("preview task failed: {0}")]
    Task(String),
}
