//! Output types: what a conversion or optimization run hands back.
//!
//! Per file the orchestrator produces a [`FileResult`]: the input's position,
//! its name, and either the output artifact or the fatal [`InkError`] that
//! stopped it. A [`BatchReport`] gathers them in input order together with
//! aggregate [`BatchStats`].

use crate::archive::{ArchiveEntry, Archiver};
use crate::error::{FailureKind, InkError};
use crate::optimize::OptimizationReport;
use serde::{Deserialize, Serialize};

// ── Book content ─────────────────────────────────────────────────────────

/// Title and author carried in the container's metadata section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
}

/// A table-of-contents entry: chapter title and its first page (absolute, 0-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterEntry {
    pub title: String,
    pub start_page: u32,
}

impl ChapterEntry {
    pub fn new(title: impl Into<String>, start_page: u32) -> Self {
        Self {
            title: title.into(),
            start_page,
        }
    }
}

// ── Artifacts ────────────────────────────────────────────────────────────

/// Timings and sizes for one container conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub page_count: usize,
    pub chapter_count: usize,
    pub output_bytes: usize,
    pub render_ms: u64,
    pub quantize_ms: u64,
    pub encode_ms: u64,
    pub total_ms: u64,
}

/// A finished page container.
#[derive(Debug, Clone)]
pub struct ConvertedFile {
    /// Output file name (input stem + `.xtc`/`.xtch`).
    pub name: String,
    pub metadata: BookMetadata,
    pub bytes: Vec<u8>,
    pub stats: ConversionStats,
}

/// A restructured EPUB.
#[derive(Debug, Clone)]
pub struct OptimizedFile {
    /// Output file name (input stem + `.epub`).
    pub name: String,
    pub bytes: Vec<u8>,
    pub report: OptimizationReport,
}

/// Anything the orchestrator can hand to an [`Archiver`] or write to disk.
pub trait OutputArtifact {
    fn file_name(&self) -> &str;
    fn bytes(&self) -> &[u8];
}

impl OutputArtifact for ConvertedFile {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl OutputArtifact for OptimizedFile {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ── Per-file state ───────────────────────────────────────────────────────

/// Lifecycle of one input file inside a batch.
///
/// ```text
/// Queued ──▶ Rendering ──▶ Processing ──▶ Complete
///    │           │              │
///    └───────────┴──────────────┴──────▶ Failed
/// ```
///
/// `Rendering` only occurs on the container path; the optimizer goes straight
/// from `Queued` to `Processing`. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Queued,
    Rendering,
    Processing,
    Complete,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Complete | FileState::Failed)
    }

    /// Whether `self → next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Queued, Rendering)
                | (Queued, Processing)
                | (Rendering, Processing)
                | (Queued | Rendering | Processing, Failed)
                | (Processing, Complete)
        )
    }
}

/// Outcome for one input, tagged with its input position.
#[derive(Debug)]
pub struct FileResult<T> {
    /// 0-based position in the input list.
    pub index: usize,
    /// Display name of the input.
    pub name: String,
    pub outcome: Result<T, InkError>,
}

impl<T> FileResult<T> {
    pub fn state(&self) -> FileState {
        match self.outcome {
            Ok(_) => FileState::Complete,
            Err(_) => FileState::Failed,
        }
    }

    pub fn output(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&InkError> {
        self.outcome.as_ref().err()
    }
}

impl<T: OutputArtifact> FileResult<T> {
    /// Flat, serializable view used by the CLI's `--json` output.
    pub fn summary(&self) -> FileSummary {
        let (output, bytes) = match &self.outcome {
            Ok(artifact) => (
                Some(artifact.file_name().to_string()),
                Some(artifact.bytes().len()),
            ),
            Err(_) => (None, None),
        };
        FileSummary {
            index: self.index,
            input: self.name.clone(),
            state: self.state(),
            output,
            bytes,
            error_kind: self.error().map(InkError::kind),
            error: self.error().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub index: usize,
    pub input: String,
    pub state: FileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Batch ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_files: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

/// All per-file results of a batch, in input order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<FileResult<T>>,
    pub stats: BatchStats,
}

impl<T> BatchReport<T> {
    pub(crate) fn from_results(mut results: Vec<FileResult<T>>, duration_ms: u64) -> Self {
        results.sort_by_key(|r| r.index);
        let completed = results.iter().filter(|r| r.outcome.is_ok()).count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r.outcome, Err(InkError::Cancelled)))
            .count();
        let stats = BatchStats {
            total_files: results.len(),
            completed,
            failed: results.len() - completed,
            cancelled,
            duration_ms,
        };
        Self { results, stats }
    }

    /// Successful outputs in input order.
    pub fn outputs(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(FileResult::output)
    }

    pub fn all_succeeded(&self) -> bool {
        self.stats.failed == 0
    }
}

impl<T: OutputArtifact> BatchReport<T> {
    /// Bundle every successful output into one archive buffer.
    pub fn bundle(&self, archiver: &dyn Archiver) -> Result<Vec<u8>, InkError> {
        let entries: Vec<ArchiveEntry> = self
            .outputs()
            .map(|o| ArchiveEntry::stored(o.file_name(), o.bytes().to_vec()))
            .collect();
        archiver.assemble(&entries)
    }

    pub fn summaries(&self) -> Vec<FileSummary> {
        self.results.iter().map(FileResult::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;

    fn converted(name: &str) -> ConvertedFile {
        ConvertedFile {
            name: name.into(),
            metadata: BookMetadata::default(),
            bytes: vec![1, 2, 3],
            stats: ConversionStats::default(),
        }
    }

    #[test]
    fn legal_transitions() {
        use FileState::*;
        assert!(Queued.can_transition_to(Rendering));
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Complete));
        assert!(Rendering.can_transition_to(Failed));
        assert!(!Rendering.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Queued));
        assert!(Complete.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn report_is_sorted_and_counted() {
        let results = vec![
            FileResult {
                index: 2,
                name: "c".into(),
                outcome: Ok(converted("c.xtch")),
            },
            FileResult {
                index: 0,
                name: "a".into(),
                outcome: Err(InkError::Cancelled),
            },
            FileResult {
                index: 1,
                name: "b".into(),
                outcome: Err(RenderError::NoPages.into()),
            },
        ];
        let report = BatchReport::from_results(results, 5);
        let order: Vec<usize> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report.stats.completed, 1);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.stats.cancelled, 1);
        assert!(!report.all_succeeded());
        assert_eq!(report.outputs().count(), 1);
    }

    #[test]
    fn summary_serializes_error_kind() {
        let r: FileResult<ConvertedFile> = FileResult {
            index: 1,
            name: "broken.cbz".into(),
            outcome: Err(RenderError::NoPages.into()),
        };
        let json = serde_json::to_string(&r.summary()).unwrap();
        assert!(json.contains("\"state\":\"failed\""), "got: {json}");
        assert!(json.contains("\"error_kind\":\"render\""), "got: {json}");
        assert!(!json.contains("\"output\""));
    }
}
