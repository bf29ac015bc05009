//! # inkpress
//!
//! Prepare books for small monochrome e-ink readers.
//!
//! Two independent paths:
//!
//! * **Container conversion**: a source package is rendered into page
//!   bitmaps, reduced to 1-bit or 2-bit planes, and packed into an XTC/XTCH
//!   container that reader firmware can page through, look up chapters in and
//!   read metadata from without scanning the whole file.
//! * **EPUB optimization**: an EPUB is restructured for the panel. Layout CSS
//!   the device cannot honour is dropped, embedded fonts are removed, images
//!   are turned gray and shrunk, and an e-paper stylesheet is linked in.
//!
//! ## Pipeline Overview
//!
//! ```text
//! package (zip)
//!  │
//!  ├─ 1. Render    PageRenderer → 8-bit page bitmaps (spawn_blocking)
//!  ├─ 2. Quantize  Floyd–Steinberg / threshold on the DitherPool
//!  ├─ 3. Index     page spans + chapter boundaries, strictly in page order
//!  └─ 4. Encode    two-pass XTC/XTCH writer
//!
//! epub
//!  └─ Optimizer    fonts → CSS → images → inject → validate → Archiver
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inkpress::{
//!     convert_batch, BatchInput, BatchOptions, ConversionConfig, ImageArchiveRenderer,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inputs = vec![BatchInput::new("vol1.cbz", std::fs::read("vol1.cbz")?)];
//!     let report = convert_batch(
//!         inputs,
//!         Arc::new(ImageArchiveRenderer),
//!         &ConversionConfig::default(),
//!         &BatchOptions::default(),
//!     )
//!     .await;
//!     for file in report.outputs() {
//!         std::fs::write(&file.name, &file.bytes)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `inkpress` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! inkpress = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod batch;
pub mod config;
pub mod convert;
pub mod error;
pub mod optimize;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use archive::{ArchiveEntry, Archiver, EntryCompression, ZipArchiver};
pub use batch::{convert_batch, optimize_batch, BatchInput, CancelToken};
pub use config::{
    BatchOptions, BatchOptionsBuilder, BitDepth, ConversionConfig, ConversionConfigBuilder,
    CssStripRules, DeviceProfile, OptimizationProfile, OptimizationProfileBuilder, Orientation,
};
pub use convert::{
    convert_book, convert_book_sync, inspect, optimize_package, optimize_package_sync,
    write_output, ContainerSummary,
};
pub use error::{
    EncodingError, FailureKind, IndexInconsistency, InkError, OptimizationError, RenderError,
    ResourceWarning,
};
pub use optimize::{OptimizationReport, Optimizer};
pub use output::{
    BatchReport, BatchStats, BookMetadata, ChapterEntry, ConversionStats, ConvertedFile,
    FileResult, FileState, FileSummary, OptimizedFile, OutputArtifact,
};
pub use pipeline::container::ContainerReader;
pub use pipeline::quantize::{DitherPool, QuantizeOptions, QuantizedPlane, PLANE_LAYOUT};
pub use pipeline::render::{ImageArchiveRenderer, PageBitmap, PageRenderer, RenderedBook};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_stream, optimize_stream, FileResultStream};
