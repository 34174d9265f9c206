//! Document library on the local filesystem.
//!
//! Layout: `{root}/documents/{namespace}/{id}.{pdf|epub}`.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid document id: {0}")]
    InvalidId(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("document {0} not found")]
    NotFound(String),

    #[error("unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Epub,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Pdf, DocumentKind::Epub];

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Epub => "epub",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "epub" => Some(Self::Epub),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub namespace: String,
    pub id: String,
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub last_modified_ms: i64,
}

pub struct DocumentLibrary {
    root: PathBuf,
}

impl DocumentLibrary {
    /// `root` is the storage root; documents live in its `documents/` dir.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join("documents"),
        }
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    pub fn resolve(&self, namespace: &str, id: &str) -> Result<DocumentSource, DocumentError> {
        if !ID_PATTERN.is_match(namespace) {
            return Err(DocumentError::InvalidNamespace(namespace.to_string()));
        }
        if !ID_PATTERN.is_match(id) {
            return Err(DocumentError::InvalidId(id.to_string()));
        }

        let dir = self.namespace_dir(namespace);
        for kind in DocumentKind::ALL {
            let path = dir.join(format!("{id}.{}", kind.extension()));
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    let last_modified_ms = meta
                        .modified()?
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0);
                    return Ok(DocumentSource {
                        namespace: namespace.to_string(),
                        id: id.to_string(),
                        path,
                        kind,
                        last_modified_ms,
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // present, but in a format we cannot preview
        if let Some(ext) = find_other_extension(&dir, id)? {
            return Err(DocumentError::UnsupportedType(ext));
        }
        Err(DocumentError::NotFound(id.to_string()))
    }
}

fn find_other_extension(dir: &Path, id: &str) -> Result<Option<String>, DocumentError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.file_stem().and_then(|s| s.to_str()) != Some(id) {
            continue;
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if DocumentKind::from_extension(ext).is_none() {
                return Ok(Some(ext.to_string()));
            }
        }
    }
    Ok(None)
}
