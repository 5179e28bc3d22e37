//! Text assembly.
//!
//! Merges per-page OCR output into one normalized text with an explicit
//! page-offset index. Pure: no I/O, no ledger access. The orchestrator
//! chooses the [`PagePolicy`] and stores the result.
//!
//! ```text
//! page 1 text
//!
//! [page 2 unavailable: OCR engine failure: segfault]
//!
//! page 3 text
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::{ContentHash, PageSpan};

/// What to do about a page OCR could not produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePolicy {
    /// Abort assembly.
    Strict,
    /// Insert a gap marker and continue.
    Lenient,
}

impl PagePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            PagePolicy::Strict
        } else {
            PagePolicy::Lenient
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageInput {
    Recognized {
        page: u32,
        text: String,
        confidence: f32,
    },
    Missing {
        page: u32,
        reason: String,
    },
}

impl PageInput {
    fn page(&self) -> u32 {
        match self {
            PageInput::Recognized { page, .. } | PageInput::Missing { page, .. } => *page,
        }
    }
}

/// The stored text artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledText {
    pub document_id: String,
    pub source_hash: ContentHash,
    pub version: u32,
    pub text: String,
    pub pages: Vec<PageSpan>,
}

impl AssembledText {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn page_text(&self, span: &PageSpan) -> &str {
        self.text.get(span.start..span.end).unwrap_or("")
    }

    pub fn min_confidence(&self) -> Option<f32> {
        self.pages
            .iter()
            .filter_map(|p| p.confidence)
            .fold(None, |acc, c| Some(acc.map_or(c, |m: f32| m.min(c))))
    }

    pub fn low_confidence_pages(&self, threshold: f32) -> Vec<u32> {
        self.pages
            .iter()
            .filter(|p| p.confidence.is_some_and(|c| c < threshold))
            .map(|p| p.page)
            .collect()
    }
}

pub fn gap_marker(page: u32, reason: &str) -> String {
    format!("[page {} unavailable: {}]", page, reason)
}

/// Line endings to `\n`, trailing whitespace trimmed per line, runs of
/// three or more newlines collapsed to two, outer whitespace trimmed.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0;
    for line in unified.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

pub fn assemble(
    document_id: &str,
    source_hash: &ContentHash,
    version: u32,
    pages: &[PageInput],
    policy: PagePolicy,
) -> Result<AssembledText, PipelineError> {
    if pages.is_empty() {
        return Err(PipelineError::Assembly("no pages to assemble".to_string()));
    }

    let mut ordered: Vec<&PageInput> = pages.iter().collect();
    ordered.sort_by_key(|p| p.page());
    for (i, p) in ordered.iter().enumerate() {
        if p.page() as usize != i + 1 {
            return Err(PipelineError::Assembly(format!(
                "page sequence broken at page {}",
                p.page()
            )));
        }
    }

    let mut text = String::new();
    let mut spans = Vec::with_capacity(ordered.len());
    for input in ordered {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let start = text.len();
        let (confidence, missing) = match input {
            PageInput::Recognized {
                text: page_text,
                confidence,
                ..
            } => {
                text.push_str(&normalize(page_text));
                (Some(*confidence), false)
            }
            PageInput::Missing { page, reason } => {
                if policy == PagePolicy::Strict {
                    return Err(PipelineError::Assembly(format!(
                        "page {} missing: {}",
                        page, reason
                    )));
                }
                text.push_str(&gap_marker(*page, reason));
                (None, true)
            }
        };
        spans.push(PageSpan {
            page: input.page(),
            start,
            end: text.len(),
            confidence,
            missing,
        });
    }

    Ok(AssembledText {
        document_id: document_id.to_string(),
        source_hash: source_hash.clone(),
        version,
        text,
        pages: spans,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognized(page: u32, text: &str, confidence: f32) -> PageInput {
        PageInput::Recognized {
            page,
            text: text.to_string(),
            confidence,
        }
    }

    fn hash() -> ContentHash {
        ContentHash::compute(b"raw")
    }

    #[test]
    fn normalize_whitespace() {
        assert_eq!(normalize("a  \r\nb\r\rc\n\n\n\n\nd  \n\n"), "a\nb\n\nc\n\nd");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn offsets_map_back_to_pages() {
        let pages = vec![
            recognized(2, "second page", 0.4),
            recognized(1, "first page\r\n", 0.95),
            recognized(3, "third", 0.88),
        ];
        let out = assemble("doc-a", &hash(), 1, &pages, PagePolicy::Strict).unwrap();

        assert_eq!(out.text, "first page\n\nsecond page\n\nthird");
        assert_eq!(out.pages.len(), 3);
        assert_eq!(out.page_text(&out.pages[0]), "first page");
        assert_eq!(out.page_text(&out.pages[1]), "second page");
        assert_eq!(out.page_text(&out.pages[2]), "third");
        assert_eq!(out.low_confidence_pages(0.6), vec![2]);
        assert_eq!(out.min_confidence(), Some(0.4));
    }

    #[test]
    fn strict_policy_aborts_on_gap() {
        let pages = vec![
            recognized(1, "one", 0.9),
            PageInput::Missing {
                page: 2,
                reason: "engine failure".into(),
            },
        ];
        let err = assemble("doc-a", &hash(), 1, &pages, PagePolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("page 2"));
    }

    #[test]
    fn lenient_policy_inserts_marker() {
        let pages = vec![
            recognized(1, "one", 0.9),
            PageInput::Missing {
                page: 2,
                reason: "engine failure".into(),
            },
        ];
        let out = assemble("doc-a", &hash(), 1, &pages, PagePolicy::Lenient).unwrap();
        assert_eq!(out.text, "one\n\n[page 2 unavailable: engine failure]");
        assert!(out.pages[1].missing);
        assert_eq!(out.pages[1].confidence, None);
    }

    #[test]
    fn output_is_deterministic() {
        let pages = vec![recognized(1, "same", 0.7)];
        let a = assemble("doc-a", &hash(), 1, &pages, PagePolicy::Strict).unwrap();
        let b = assemble("doc-a", &hash(), 1, &pages, PagePolicy::Strict).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(AssembledText::from_bytes(&a.to_bytes().unwrap()).unwrap(), a);
    }

    #[test]
    fn gaps_in_page_numbers_rejected() {
        let pages = vec![recognized(1, "a", 0.9), recognized(3, "c", 0.9)];
        assert!(assemble("doc-a", &hash(), 1, &pages, PagePolicy::Lenient).is_err());
    }
}
