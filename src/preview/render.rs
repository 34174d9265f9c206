//! Thumbnail rendering through external tools.
//!
//! PDFs are rasterized with `pdftoppm`. EPUB covers are pulled out of the
//! archive and scaled with `ffmpeg`. Both produce a fixed-width JPEG.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{CommandError, ExternalCommand};
use crate::documents::{DocumentKind, DocumentSource};
use crate::speech::Bytes;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

static CONTAINER_ROOTFILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<rootfile\b[^>]*\bfull-path\s*=\s*["']([^"']+)["']"#).unwrap());
static ITEM_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?:opf:)?item\b[^>]*>").unwrap());
static META_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?:opf:)?meta\b[^>]*>").unwrap());
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("epub: {0}")]
    Epub(String),

    #[error("renderer produced an invalid image: {0}")]
    InvalidImage(String),

    #[error("render io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
}

impl RenderedImage {
    /// Wrap JPEG bytes, reading the dimensions from the frame header.
    pub fn from_jpeg(bytes: Bytes) -> Result<Self, RenderError> {
        let (width, height) = jpeg_dimensions(&bytes)
            .ok_or_else(|| RenderError::InvalidImage("no JPEG frame header".into()))?;
        Ok(Self {
            bytes,
            width,
            height,
            content_type: JPEG_CONTENT_TYPE,
        })
    }
}

#[async_trait]
pub trait PreviewRenderer: Send + Sync {
    async fn render(
        &self,
        source: &DocumentSource,
        width: u32,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage, RenderError>;
}

pub struct CommandRenderer {
    pdftoppm: String,
    ffmpeg: String,
    timeout: Duration,
    work_root: PathBuf,
}

impl CommandRenderer {
    pub fn new(pdftoppm: impl Into<String>, ffmpeg: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pdftoppm: pdftoppm.into(),
            ffmpeg: ffmpeg.into(),
            timeout,
            work_root: std::env::temp_dir(),
        }
    }

    /// Directory the per-render scratch directories are created in.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    async fn render_pdf(
        &self,
        source: &Path,
        work: &Path,
        width: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError> {
        let prefix = work.join("page");
        ExternalCommand::new(&self.pdftoppm)
            .args(["-jpeg", "-f", "1", "-l", "1"])
            .args(["-scale-to-x".to_string(), width.to_string()])
            .args(["-scale-to-y", "-1", "-singlefile"])
            .arg(source.as_os_str())
            .arg(prefix.as_os_str())
            .run(self.timeout, cancel)
            .await?;
        Ok(tokio::fs::read(work.join("page.jpg")).await?)
    }

    async fn render_epub(
        &self,
        source: &Path,
        work: &Path,
        width: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError> {
        let archive = source.to_path_buf();
        let cover = tokio::task::spawn_blocking(move || {
            let data = std::fs::read(&archive)?;
            extract_epub_cover(&data)
        })
        .await
        .map_err(|e| RenderError::Epub(format!("cover extraction task failed: {e}")))??;

        let input = work.join(format!("cover.{}", cover.extension));
        let output = work.join("cover.jpg");
        tokio::fs::write(&input, &cover.data).await?;

        ExternalCommand::new(&self.ffmpeg)
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(input.as_os_str())
            .args(["-vf".to_string(), format!("scale={width}:-2")])
            .args(["-frames:v", "1", "-q:v", "3"])
            .arg(output.as_os_str())
            .run(self.timeout, cancel)
            .await?;
        Ok(tokio::fs::read(&output).await?)
    }
}

#[async_trait]
impl PreviewRenderer for CommandRenderer {
    async fn render(
        &self,
        source: &DocumentSource,
        width: u32,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage, RenderError> {
        tokio::fs::create_dir_all(&self.work_root).await?;
        // Removed on drop, so a caller timing this future out leaves nothing behind.
        let work = tempfile::Builder::new()
            .prefix("reader-speech-preview-")
            .tempdir_in(&self.work_root)?;

        let rendered = match source.kind {
            DocumentKind::Pdf => self.render_pdf(&source.path, work.path(), width, cancel).await,
            DocumentKind::Epub => self.render_epub(&source.path, work.path(), width, cancel).await,
        };
        let work_path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            debug!("Failed to remove {}: {e}", work_path.display());
        }

        RenderedImage::from_jpeg(Bytes::from(rendered?))
    }
}

#[derive(Debug)]
pub struct EpubCover {
    pub path: String,
    pub extension: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

fn attributes(tag: &str) -> impl Iterator<Item = (String, String)> + '_ {
    ATTRIBUTE.captures_iter(tag).map(|c| {
        let value = c.get(2).or_else(|| c.get(3)).map(|m| m.as_str()).unwrap_or("");
        (c[1].to_ascii_lowercase(), value.to_string())
    })
}

fn read_entry(
    zip: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, RenderError> {
    let mut entry = zip
        .by_name(name)
        .map_err(|e| RenderError::Epub(format!("missing {name}: {e}")))?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Resolve `href` relative to the directory of `base`, dropping `.` and `..`.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut parts: Vec<&str> = match base.rfind('/') {
        Some(i) => base[..i].split('/').collect(),
        None => Vec::new(),
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Find the cover image of an EPUB archive.
///
/// Looks for a manifest item marked `cover-image`, then the item named by
/// `<meta name="cover">`, then the first image in the manifest.
pub fn extract_epub_cover(archive: &[u8]) -> Result<EpubCover, RenderError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| RenderError::Epub(format!("not a zip archive: {e}")))?;

    let container = read_entry(&mut zip, "META-INF/container.xml")?;
    let container = String::from_utf8_lossy(&container);
    let opf_path = CONTAINER_ROOTFILE
        .captures(&container)
        .map(|c| c[1].to_string())
        .ok_or_else(|| RenderError::Epub("container.xml has no rootfile".into()))?;

    let opf = read_entry(&mut zip, &opf_path)?;
    let opf = String::from_utf8_lossy(&opf);

    let items: Vec<ManifestItem> = ITEM_TAG
        .find_iter(&opf)
        .map(|m| {
            let mut item = ManifestItem::default();
            for (name, value) in attributes(m.as_str()) {
                match name.as_str() {
                    "id" => item.id = value,
                    "href" => item.href = value,
                    "media-type" => item.media_type = value,
                    "properties" => item.properties = value,
                    _ => {}
                }
            }
            item
        })
        .collect();

    let meta_cover_id = META_TAG.find_iter(&opf).find_map(|m| {
        let attrs: Vec<(String, String)> = attributes(m.as_str()).collect();
        let is_cover = attrs.iter().any(|(n, v)| n == "name" && v == "cover");
        is_cover
            .then(|| attrs.into_iter().find(|(n, _)| n == "content").map(|(_, v)| v))
            .flatten()
    });

    let is_image = |item: &&ManifestItem| item.media_type.starts_with("image/");
    let cover = items
        .iter()
        .filter(is_image)
        .find(|item| item.properties.split_whitespace().any(|p| p == "cover-image"))
        .or_else(|| {
            let id = meta_cover_id.as_deref()?;
            items.iter().filter(is_image).find(|item| item.id == id)
        })
        .or_else(|| items.iter().find(is_image))
        .ok_or_else(|| RenderError::Epub("no cover image in manifest".into()))?;

    let path = resolve_href(&opf_path, &cover.href);
    let data = read_entry(&mut zip, &path)?;
    let extension = match cover.media_type.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "img",
    }
    .to_string();

    debug!("EPUB cover {path} ({} bytes)", data.len());
    Ok(EpubCover {
        path,
        extension,
        data,
    })
}

/// Width and height from the first SOF marker of a JPEG stream.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }
    let mut i = 2;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            // fill byte
            i += 1;
            continue;
        }
        if marker == 0x01 || (0xD0..=0xD8).contains(&marker) {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let frame = data.get(i + 4..i + 9)?;
            let height = u16::from_be_bytes([frame[1], frame[2]]) as u32;
            let width = u16::from_be_bytes([frame[3], frame[4]]) as u32;
            return Some((width, height));
        }
        if marker == 0xDA || len < 2 {
            return None;
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    /// Minimal JPEG header: SOI, an APP0 segment, then SOF0.
    pub(crate) fn tiny_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46]);
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn epub(opf: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?><container><rootfiles>
            <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
            </rootfiles></container>"#,
        )
        .unwrap();
        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(opf.as_bytes()).unwrap();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_dimensions_from_sof() {
        assert_eq!(jpeg_dimensions(&tiny_jpeg(240, 320)), Some((240, 320)));
        assert_eq!(jpeg_dimensions(b"\x89PNG\r\n"), None);
        assert_eq!(jpeg_dimensions(&[0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02]), None);
    }

    #[test]
    fn cover_image_property_wins() {
        let opf = r#"<package><metadata><meta name="cover" content="other"/></metadata>
            <manifest>
              <item id="first" href="images/first.png" media-type="image/png"/>
              <item id="other" href="images/other.png" media-type="image/png"/>
              <item id="c" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
            </manifest></package>"#;
        let archive = epub(
            opf,
            &[
                ("OEBPS/images/first.png", b"first"),
                ("OEBPS/images/other.png", b"other"),
                ("OEBPS/images/cover.jpg", b"cover"),
            ],
        );
        let cover = extract_epub_cover(&archive).unwrap();
        assert_eq!(cover.path, "OEBPS/images/cover.jpg");
        assert_eq!(cover.extension, "jpg");
        assert_eq!(cover.data, b"cover");
    }

    #[test]
    fn meta_cover_then_first_image() {
        let opf = r#"<package><metadata><meta content="c2" name="cover" /></metadata>
            <manifest>
              <item id="c1" href="../a.png" media-type="image/png"/>
              <item id='c2' href='img/b.gif' media-type='image/gif'/>
            </manifest></package>"#;
        let archive = epub(opf, &[("a.png", b"a"), ("OEBPS/img/b.gif", b"b")]);
        assert_eq!(extract_epub_cover(&archive).unwrap().data, b"b");

        let opf = r#"<package><manifest>
              <item id="text" href="ch1.xhtml" media-type="application/xhtml+xml"/>
              <item id="c1" href="../a.png" media-type="image/png"/>
            </manifest></package>"#;
        let archive = epub(opf, &[("a.png", b"a")]);
        let cover = extract_epub_cover(&archive).unwrap();
        assert_eq!(cover.path, "a.png");
        assert_eq!(cover.extension, "png");
    }

    #[test]
    fn epub_without_images_is_an_error() {
        let opf = r#"<package><manifest>
              <item id="text" href="ch1.xhtml" media-type="application/xhtml+xml"/>
            </manifest></package>"#;
        let archive = epub(opf, &[]);
        assert!(matches!(extract_epub_cover(&archive), Err(RenderError::Epub(_))));
        assert!(matches!(extract_epub_cover(b"not a zip"), Err(RenderError::Epub(_))));
    }

    #[tokio::test]
    async fn missing_rasterizer_surfaces_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let source = DocumentSource {
            namespace: "default".into(),
            id: "doc".into(),
            path,
            kind: DocumentKind::Pdf,
            last_modified_ms: 1,
        };
        let renderer = CommandRenderer::new(
            "definitely-missing-pdftoppm",
            "definitely-missing-ffmpeg",
            Duration::from_secs(5),
        );
        let err = renderer
            .render(&source, 240, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Command(CommandError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_render_removes_its_work_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let slow = dir.path().join("slow-pdftoppm");
        std::fs::write(&slow, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&slow, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let source = DocumentSource {
            namespace: "default".into(),
            id: "doc".into(),
            path,
            kind: DocumentKind::Pdf,
            last_modified_ms: 1,
        };

        let work_root = dir.path().join("work");
        let renderer = CommandRenderer::new(
            slow.to_string_lossy().into_owned(),
            "ffmpeg",
            Duration::from_secs(30),
        )
        .with_work_root(&work_root);
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_millis(300),
            renderer.render(&source, 240, &cancel),
        )
        .await;

        assert!(outcome.is_err(), "render should still be running");
        let left: Vec<_> = std::fs::read_dir(&work_root).unwrap().collect();
        assert!(left.is_empty(), "leaked work dirs: {left:?}");
    }
}
