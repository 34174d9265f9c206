//! Preview row model.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

impl PreviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown preview status: {other}")),
        }
    }
}

/// Identifies one preview: at most one row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewKey {
    pub document_id: String,
    pub namespace: String,
    pub variant: String,
}

impl PreviewKey {
    pub fn new(
        document_id: impl Into<String>,
        namespace: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            namespace: namespace.into(),
            variant: variant.into(),
        }
    }

    /// Object storage key the rendered image is written to.
    pub fn object_key(&self) -> String {
        format!(
            "{}/previews/{}/{}.jpg",
            self.namespace, self.document_id, self.variant
        )
    }
}

impl fmt::Display for PreviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.document_id, self.variant)
    }
}

/// Metadata recorded when a preview becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyMeta {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRow {
    pub key: PreviewKey,
    pub status: PreviewStatus,
    pub source_last_modified_ms: i64,
    pub object_key: String,
    pub content_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub byte_size: Option<u64>,
    pub etag: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until_ms: Option<i64>,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PreviewRow {
    pub fn ready_meta(&self) -> Option<ReadyMeta> {
        Some(ReadyMeta {
            content_type: self.content_type.clone()?,
            width: self.width?,
            height: self.height?,
            byte_size: self.byte_size?,
            etag: self.etag.clone()?,
        })
    }

    /// True while another worker may still be rendering this row.
    pub fn lease_is_live(&self, now_ms: i64) -> bool {
        self.status == PreviewStatus::Processing
            && self.lease_until_ms.is_some_and(|until| until > now_ms)
    }
}
