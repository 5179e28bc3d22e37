//! Page rendering.
//!
//! The [`Converter`] turns a fetched document into an ordered list of page
//! images, stores each page in the content store, and records a
//! `CONVERTED` event listing them in page order.
//!
//! Rendering is delegated to a [`ConvertEngine`]:
//!
//! | Engine | Formats | How |
//! |--------|---------|-----|
//! | [`PdftoppmEngine`] | PDF | Poppler `pdftoppm` at a fixed DPI, PNG output |
//! | [`ImagePassthrough`] | PNG, JPEG, TIFF | the image is its own single page |
//!
//! Output must be deterministic: the same bytes and settings yield
//! byte-identical pages, so re-converting never creates new artifacts.

use async_trait::async_trait;
use serde_json::json;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::ConverterConfig;
use crate::content_store::ContentStore;
use crate::error::{ConversionError, PipelineError};
use crate::ledger::Ledger;
use crate::models::{ArtifactRef, EventStatus, NewEvent, Stage};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Pdf,
    Png,
    Jpeg,
    Tiff,
}

impl SourceFormat {
    /// Identify a document by its magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<SourceFormat> {
        const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
        if bytes.starts_with(PNG) {
            return Some(SourceFormat::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(SourceFormat::Jpeg);
        }
        if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            return Some(SourceFormat::Tiff);
        }
        // Readers tolerate junk before the header, within the first KiB.
        let head = &bytes[..bytes.len().min(1024)];
        if head.windows(5).any(|w| w == b"%PDF-") {
            return Some(SourceFormat::Pdf);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Pdf => "pdf",
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Tiff => "tiff",
        }
    }
}

/// A rendering backend.
#[async_trait]
pub trait ConvertEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, format: SourceFormat) -> bool;

    /// Render every page, in order.
    async fn render(
        &self,
        bytes: &[u8],
        format: SourceFormat,
    ) -> Result<Vec<Vec<u8>>, ConversionError>;
}

/// Renders PDFs with Poppler's `pdftoppm`.
pub struct PdftoppmEngine {
    binary: String,
    dpi: u32,
}

impl PdftoppmEngine {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            binary: config.pdftoppm.clone(),
            dpi: config.dpi,
        }
    }
}

#[async_trait]
impl ConvertEngine for PdftoppmEngine {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    fn supports(&self, format: SourceFormat) -> bool {
        format == SourceFormat::Pdf
    }

    async fn render(
        &self,
        bytes: &[u8],
        _format: SourceFormat,
    ) -> Result<Vec<Vec<u8>>, ConversionError> {
        let expected = pdf_page_count(bytes)?;

        let scratch = tempfile::tempdir()
            .map_err(|e| ConversionError::ResourceExhausted(format!("scratch dir: {}", e)))?;
        let input = scratch.path().join("input.pdf");
        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| ConversionError::ResourceExhausted(format!("scratch write: {}", e)))?;
        let prefix = scratch.path().join("page");

        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(&input)
            .arg(&prefix)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ConversionError::EngineUnavailable(format!(
                    "{} not found; install poppler-utils",
                    self.binary
                )),
                _ => ConversionError::ResourceExhausted(format!("spawn {}: {}", self.binary, e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // No exit code means a signal, most often the OOM killer.
            return Err(match output.status.code() {
                None => ConversionError::ResourceExhausted(format!(
                    "pdftoppm killed: {}",
                    stderr.trim()
                )),
                Some(code) => {
                    ConversionError::Corrupt(format!("pdftoppm exit {}: {}", code, stderr.trim()))
                }
            });
        }

        let pages = collect_pages(scratch.path()).await?;
        if pages.len() != expected {
            return Err(ConversionError::Corrupt(format!(
                "document declares {} pages, renderer produced {}",
                expected,
                pages.len()
            )));
        }
        Ok(pages)
    }
}

/// Page count from the PDF's own page tree.
pub fn pdf_page_count(bytes: &[u8]) -> Result<usize, ConversionError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ConversionError::Corrupt(format!("unparseable PDF: {}", e)))?;
    let count = doc.get_pages().len();
    if count == 0 {
        return Err(ConversionError::Corrupt("PDF has no pages".to_string()));
    }
    Ok(count)
}

/// Read `page-N.png` files back in page order.
async fn collect_pages(dir: &Path) -> Result<Vec<Vec<u8>>, ConversionError> {
    let scratch_err = |e: std::io::Error| ConversionError::ResourceExhausted(e.to_string());

    let mut numbered = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(scratch_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(scratch_err)? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name
            .strip_prefix("page-")
            .and_then(|s| s.strip_suffix(".png"))
        else {
            continue;
        };
        if let Ok(n) = stem.parse::<u32>() {
            numbered.push((n, entry.path()));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);

    let mut pages = Vec::with_capacity(numbered.len());
    for (_, path) in numbered {
        pages.push(tokio::fs::read(&path).await.map_err(scratch_err)?);
    }
    Ok(pages)
}

/// Images are already a page.
pub struct ImagePassthrough;

#[async_trait]
impl ConvertEngine for ImagePassthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn supports(&self, format: SourceFormat) -> bool {
        matches!(
            format,
            SourceFormat::Png | SourceFormat::Jpeg | SourceFormat::Tiff
        )
    }

    async fn render(
        &self,
        bytes: &[u8],
        _format: SourceFormat,
    ) -> Result<Vec<Vec<u8>>, ConversionError> {
        Ok(vec![bytes.to_vec()])
    }
}

pub struct Converter {
    engines: Vec<Arc<dyn ConvertEngine>>,
    store: Arc<ContentStore>,
    ledger: Arc<Ledger>,
    retry: RetryPolicy,
}

impl Converter {
    pub fn new(
        engines: Vec<Arc<dyn ConvertEngine>>,
        store: Arc<ContentStore>,
        ledger: Arc<Ledger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engines,
            store,
            ledger,
            retry,
        }
    }

    /// Default engine set: `pdftoppm` for PDFs, passthrough for images.
    pub fn default_engines(config: &ConverterConfig) -> Vec<Arc<dyn ConvertEngine>> {
        vec![
            Arc::new(PdftoppmEngine::new(config)),
            Arc::new(ImagePassthrough),
        ]
    }

    /// Render the current version of `document_id` and ledger its pages.
    pub async fn convert(&self, document_id: &str) -> Result<Vec<ArtifactRef>, PipelineError> {
        let custody = self.ledger.custody(document_id).await?;
        let source_hash = custody
            .fetched_hash
            .clone()
            .ok_or_else(|| PipelineError::UnknownDocument(document_id.to_string()))?;
        let bytes = self.store.get(&source_hash)?;

        let format = SourceFormat::sniff(&bytes).ok_or_else(|| {
            ConversionError::UnsupportedFormat("unrecognized file signature".to_string())
        })?;
        let engine = self
            .engines
            .iter()
            .find(|e| e.supports(format))
            .ok_or_else(|| {
                ConversionError::UnsupportedFormat(format!("no engine for {}", format.as_str()))
            })?;

        let rendered = self
            .retry
            .run("convert", ConversionError::is_retryable, |_| {
                engine.render(&bytes, format)
            })
            .await?;

        let mut pages = Vec::with_capacity(rendered.len());
        for (i, page) in rendered.iter().enumerate() {
            let hash = self.store.put(page)?;
            pages.push(ArtifactRef {
                stage: Stage::Convert,
                sequence: i as u32 + 1,
                content_hash: hash,
                confidence: None,
            });
        }

        self.ledger
            .append(
                NewEvent::new(document_id, Stage::Convert, EventStatus::Succeeded)
                    .with_hash(source_hash)
                    .with_artifacts(pages.clone())
                    .with_metadata(json!({
                        "page_count": pages.len(),
                        "engine": engine.name(),
                        "format": format.as_str(),
                    })),
            )
            .await?;

        tracing::info!(
            document_id,
            pages = pages.len(),
            engine = engine.name(),
            "converted"
        );
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Document, Object};

    fn minimal_pdf(pages: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::new();
        for _ in 0..pages {
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0i64.into(), 0i64.into(), 612i64.into(), 792i64.into()],
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn sniff_magic_bytes() {
        assert_eq!(SourceFormat::sniff(b"%PDF-1.7\n"), Some(SourceFormat::Pdf));
        assert_eq!(
            SourceFormat::sniff(b"\x89PNG\r\n\x1a\n...."),
            Some(SourceFormat::Png)
        );
        assert_eq!(
            SourceFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(SourceFormat::Jpeg)
        );
        assert_eq!(SourceFormat::sniff(b"II*\0rest"), Some(SourceFormat::Tiff));
        assert_eq!(SourceFormat::sniff(b"PK\x03\x04zip"), None);
    }

    #[test]
    fn page_count_from_page_tree() {
        assert_eq!(pdf_page_count(&minimal_pdf(3)).unwrap(), 3);
    }

    #[test]
    fn garbage_pdf_is_corrupt() {
        let err = pdf_page_count(b"%PDF-1.4\nthis is not a pdf").unwrap_err();
        assert!(matches!(err, ConversionError::Corrupt(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_renderer_is_engine_unavailable() {
        let engine = PdftoppmEngine::new(&ConverterConfig {
            pdftoppm: "pdftoppm-not-installed-here".to_string(),
            dpi: 150,
        });
        let err = engine
            .render(&minimal_pdf(1), SourceFormat::Pdf)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::EngineUnavailable(_)));
        assert!(err.to_string().contains("pdftoppm-not-installed-here not found"));
    }

    #[tokio::test]
    async fn passthrough_is_single_page() {
        let pages = ImagePassthrough
            .render(b"\x89PNG\r\n\x1a\nimage", SourceFormat::Png)
            .await
            .unwrap();
        assert_eq!(pages, vec![b"\x89PNG\r\n\x1a\nimage".to_vec()]);
    }
}
