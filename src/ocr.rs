//! Optical character recognition.
//!
//! [`OcrAdapter`] reads a page image from the content store, runs it
//! through an [`OcrEngine`] with bounded retries, and stores the recognized
//! text as an artifact of its own. Low confidence is not an error: it is
//! carried on the artifact and flagged against the configured threshold.
//!
//! The default engine, [`TesseractEngine`], shells out to the `tesseract`
//! CLI and reads its TSV output. Page confidence is the mean word
//! confidence scaled to `[0, 1]`; a page with no words has confidence 0.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::OcrConfig;
use crate::content_store::ContentStore;
use crate::error::{OcrError, PipelineError};
use crate::models::{ArtifactRef, Stage};
use crate::retry::RetryPolicy;

/// Engine output for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognized {
    pub text: String,
    pub confidence: f32,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, image: &[u8]) -> Result<Recognized, OcrError>;
}

pub struct TesseractEngine {
    binary: String,
    language: String,
    psm: u8,
}

impl TesseractEngine {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            binary: config.tesseract.clone(),
            language: config.language.clone(),
            psm: config.psm,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image: &[u8]) -> Result<Recognized, OcrError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| OcrError::EngineFailure(format!("scratch dir: {}", e)))?;
        let input = scratch.path().join("page");
        tokio::fs::write(&input, image)
            .await
            .map_err(|e| OcrError::EngineFailure(format!("scratch write: {}", e)))?;

        let output = Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .args(["-l", &self.language])
            .args(["--psm", &self.psm.to_string()])
            .arg("tsv")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => OcrError::EngineUnavailable(format!(
                    "{} not found; install tesseract-ocr",
                    self.binary
                )),
                _ => OcrError::EngineFailure(format!("spawn {}: {}", self.binary, e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("pixRead") || stderr.contains("cannot be read") {
                return Err(OcrError::Unreadable(stderr));
            }
            return Err(OcrError::EngineFailure(stderr));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Rebuild text and mean confidence from tesseract's TSV output.
///
/// Word rows (level 5) with a non-negative confidence carry text. Words on
/// one line are joined with spaces; lines break with `\n`; a new paragraph
/// or block starts after a blank line.
pub fn parse_tsv(tsv: &str) -> Recognized {
    // (block, paragraph, line) -> words, in reading order
    let mut lines: BTreeMap<(u32, u32, u32), Vec<String>> = BTreeMap::new();
    let mut conf_sum = 0.0f64;
    let mut words = 0u32;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let conf: f64 = match cols[10].trim().parse() {
            Ok(c) if c >= 0.0 => c,
            _ => continue,
        };
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        lines.entry(key).or_default().push(word.to_string());
        conf_sum += conf;
        words += 1;
    }

    if words == 0 {
        return Recognized {
            text: String::new(),
            confidence: 0.0,
        };
    }

    let mut text = String::new();
    let mut last_para: Option<(u32, u32)> = None;
    for ((block, para, _), line_words) in &lines {
        if let Some(prev) = last_para {
            text.push_str(if prev == (*block, *para) { "\n" } else { "\n\n" });
        }
        text.push_str(&line_words.join(" "));
        last_para = Some((*block, *para));
    }

    let confidence = (conf_sum / words as f64 / 100.0).clamp(0.0, 1.0) as f32;
    Recognized { text, confidence }
}

/// One recognized page, stored.
#[derive(Debug, Clone)]
pub struct PageOcr {
    pub page: u32,
    pub text: String,
    pub confidence: f32,
    pub low_confidence: bool,
    pub artifact: ArtifactRef,
}

pub struct OcrAdapter {
    engine: Arc<dyn OcrEngine>,
    store: Arc<ContentStore>,
    retry: RetryPolicy,
    low_confidence_threshold: f32,
}

impl OcrAdapter {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        store: Arc<ContentStore>,
        retry: RetryPolicy,
        low_confidence_threshold: f32,
    ) -> Self {
        Self {
            engine,
            store,
            retry,
            low_confidence_threshold,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn is_low(&self, confidence: f32) -> bool {
        confidence < self.low_confidence_threshold
    }

    /// Recognize one page image and store its text.
    ///
    /// Engine failures come back as [`PipelineError::Ocr`] naming the page
    /// once the retry budget is spent.
    pub async fn recognize(&self, page: &ArtifactRef) -> Result<PageOcr, PipelineError> {
        let image = self.store.get(&page.content_hash)?;

        let recognized = self
            .retry
            .run("ocr", OcrError::is_retryable, |_| {
                self.engine.recognize(&image)
            })
            .await
            .map_err(|source| PipelineError::Ocr {
                page: page.sequence,
                source,
            })?;

        let hash = self.store.put(recognized.text.as_bytes())?;
        let low_confidence = self.is_low(recognized.confidence);
        if low_confidence {
            tracing::warn!(
                page = page.sequence,
                confidence = recognized.confidence,
                "low OCR confidence"
            );
        }

        Ok(PageOcr {
            page: page.sequence,
            confidence: recognized.confidence,
            low_confidence,
            artifact: ArtifactRef {
                stage: Stage::Ocr,
                sequence: page.sequence,
                content_hash: hash,
                confidence: Some(recognized.confidence),
            },
            text: recognized.text,
        })
    }

    /// Load previously recognized text back from the store.
    pub fn load_text(&self, artifact: &ArtifactRef) -> Result<String, PipelineError> {
        let bytes = self.store.get(&artifact.content_hash)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
