//! Pipeline progress reporting.
//!
//! Reports which document is in which stage during `vault ingest`,
//! `vault resume` and friends, so users can see how far a batch has come.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::{PipelineState, Stage};

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A stage is starting (attempt 1) or being re-run.
    Stage {
        document_id: String,
        stage: Stage,
        attempt: u32,
    },
    /// OCR finished one page.
    Page {
        document_id: String,
        page: u32,
        total: u32,
        confidence: f32,
    },
    /// A document reached a state where the driver stops.
    Finished {
        document_id: String,
        state: PipelineState,
    },
    /// Batch position: n documents done out of total.
    Batch { n: u64, total: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "doc-1a2b  ocr  page 2 / 3  (0.40)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Stage {
                document_id,
                stage,
                attempt,
            } => {
                if *attempt > 1 {
                    format!("{}  {}  (attempt {})\n", document_id, stage, attempt)
                } else {
                    format!("{}  {}\n", document_id, stage)
                }
            }
            ProgressEvent::Page {
                document_id,
                page,
                total,
                confidence,
            } => format!(
                "{}  ocr  page {} / {}  ({:.2})\n",
                document_id, page, total, confidence
            ),
            ProgressEvent::Finished { document_id, state } => {
                format!("{}  {}\n", document_id, state)
            }
            ProgressEvent::Batch { n, total } => format!(
                "batch  {} / {} documents\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Stage {
                document_id,
                stage,
                attempt,
            } => serde_json::json!({
                "event": "stage",
                "document_id": document_id,
                "stage": stage,
                "attempt": attempt
            }),
            ProgressEvent::Page {
                document_id,
                page,
                total,
                confidence,
            } => serde_json::json!({
                "event": "page",
                "document_id": document_id,
                "page": page,
                "total": total,
                "confidence": confidence
            }),
            ProgressEvent::Finished { document_id, state } => serde_json::json!({
                "event": "finished",
                "document_id": document_id,
                "state": state
            }),
            ProgressEvent::Batch { n, total } => serde_json::json!({
                "event": "batch",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode. The pipeline holds it for its lifetime.
    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
