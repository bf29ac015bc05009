//! Error types for the inkpress library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`InkError`]: **Fatal for one file**: the file cannot be converted or
//!   optimized (malformed source, broken index, integrity failure after
//!   rewriting). The batch orchestrator stores it in that file's
//!   [`crate::output::FileResult`] and carries on with the other files.
//!
//! * [`ResourceWarning`]: **Non-fatal**: a single embedded resource could not
//!   be transformed (unsupported image format, content document without a
//!   `<head>`). The resource passes through untouched and the warning is
//!   recorded in the [`crate::optimize::OptimizationReport`].
//!
//! The fatal side is further split into a taxonomy ([`RenderError`],
//! [`IndexInconsistency`], [`EncodingError`], [`OptimizationError`]) so callers
//! can tell *which* stage rejected a file via [`InkError::kind`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal per-file errors returned by the inkpress library.
#[derive(Debug, Error)]
pub enum InkError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a zip-based package.
    #[error("File is not a zip package (EPUB/CBZ): '{path}'\nFirst bytes: {magic:?}")]
    NotAPackage { path: PathBuf, magic: [u8; 4] },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The renderer rejected the source document.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Pages or chapters reached the index builder in an impossible order.
    #[error(transparent)]
    Index(#[from] IndexInconsistency),

    /// The container encoder refused to assemble the buffer.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The structural optimizer could not produce a valid package.
    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    /// A container buffer handed to the reader is truncated or inconsistent.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// The archiver failed to assemble the output package.
    #[error("Archive assembly failed: {0}")]
    Archive(String),

    /// The batch was cancelled before this file finished.
    #[error("Cancelled before completion")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not read an input file.
    #[error("Failed to read input file '{path}': {source}")]
    InputReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (worker panic, dropped channel).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InkError {
    /// Coarse classification used in reports and `--json` output.
    pub fn kind(&self) -> FailureKind {
        match self {
            InkError::FileNotFound { .. }
            | InkError::PermissionDenied { .. }
            | InkError::NotAPackage { .. }
            | InkError::InputReadFailed { .. }
            | InkError::OutputWriteFailed { .. } => FailureKind::Io,
            InkError::Render(_) => FailureKind::Render,
            InkError::Index(_) => FailureKind::IndexInconsistency,
            InkError::Encoding(_) | InkError::MalformedContainer(_) => FailureKind::Encoding,
            InkError::Optimization(_) | InkError::Archive(_) => FailureKind::Optimization,
            InkError::Cancelled => FailureKind::Cancelled,
            InkError::InvalidConfig(_) => FailureKind::InvalidConfig,
            InkError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Serializable failure category of an [`InkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Render,
    IndexInconsistency,
    Encoding,
    Optimization,
    Cancelled,
    InvalidConfig,
    Io,
    Internal,
}

// ── Taxonomy ─────────────────────────────────────────────────────────────

/// The source document could not be turned into page bitmaps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Source package is malformed: {0}")]
    MalformedPackage(String),

    #[error("Source package contains no renderable pages")]
    NoPages,

    #[error("Image '{name}' could not be decoded: {detail}")]
    UndecodableImage { name: String, detail: String },

    /// The renderer produced a page at the wrong size for the device.
    #[error("Page {page} is {actual_width}×{actual_height}, expected {expected_width}×{expected_height}")]
    DimensionMismatch {
        page: usize,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// Pixel buffer length does not equal width × height.
    #[error("Page {page} buffer holds {actual} bytes, expected {expected}")]
    InvalidBitmap {
        page: usize,
        expected: usize,
        actual: usize,
    },
}

/// Pages or chapters arrived at the index builder in an impossible order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexInconsistency {
    #[error("Page {got} arrived out of order (expected page {expected})")]
    OutOfOrder { expected: usize, got: usize },

    #[error("Page {page} belongs to chapter {got} after chapter {previous}")]
    ChapterRegression {
        page: usize,
        previous: usize,
        got: usize,
    },

    #[error("Chapter '{title}' references page {start}, which was never submitted ({page_count} pages)")]
    ChapterOutOfRange {
        title: String,
        start: u32,
        page_count: usize,
    },

    #[error("Chapter '{title}' starts at page {start}, which is not a chapter boundary")]
    ChapterNotAtBoundary { title: String, start: u32 },

    #[error("Chapter starts must be strictly increasing ({previous} then {got})")]
    ChaptersNotIncreasing { previous: u32, got: u32 },
}

/// The container encoder refused to assemble a buffer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Container has no pages")]
    NoPages,

    #[error("Declared dimensions {width}×{height} contain a zero")]
    ZeroDimension { width: u32, height: u32 },

    #[error("Declared dimensions {width}×{height} do not fit the 16-bit header fields")]
    DimensionTooLarge { width: u32, height: u32 },

    #[error("Page {page} plane is {actual} bytes, header implies {expected}")]
    PlaneMismatch {
        page: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Page index covers {indexed} bytes but {actual} bytes of page data were accumulated")]
    PageBytesMismatch { indexed: usize, actual: usize },

    #[error("Page index holds {indexed} pages but {planes} planes were accumulated")]
    PageCountMismatch { indexed: usize, planes: usize },

    #[error("{what} does not fit in a 32-bit field ({value})")]
    FieldOverflow { what: &'static str, value: u64 },
}

/// The structural optimizer could not produce a valid package.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptimizationError {
    #[error("Package could not be read: {0}")]
    MalformedPackage(String),

    #[error("Package has no package document (OPF)")]
    MissingPackageDocument,

    #[error("Manifest item '{id}' points at '{href}', which is not in the package")]
    DanglingManifestEntry { id: String, href: String },

    #[error("Spine references '{idref}', which is not in the manifest")]
    SpineEntryMissing { idref: String },

    #[error("Package document could not be rewritten: {0}")]
    Serialization(String),
}

/// A non-fatal problem with a single embedded resource.
///
/// The resource is left as it was; the rest of the package is still processed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{href}: {message}")]
pub struct ResourceWarning {
    pub href: String,
    pub message: String,
}

impl ResourceWarning {
    pub fn new(href: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            message: message.into(),
        }
    }
}
