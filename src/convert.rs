//! Single-file entry points.
//!
//! [`convert_book`] turns one source package into a page container;
//! [`optimize_package`] turns one EPUB into a restructured EPUB. Both are
//! what the batch orchestrator runs per file, and both are usable on their
//! own. Use [`crate::batch`] for many files with bounded concurrency, or
//! [`crate::stream`] to receive results as they finish.

use crate::batch::{BatchInput, CancelToken};
use crate::config::ConversionConfig;
use crate::error::InkError;
use crate::optimize::Optimizer;
use crate::output::{ConversionStats, ConvertedFile, FileState, OptimizedFile, OutputArtifact};
use crate::pipeline::container::ContainerReader;
use crate::pipeline::encode::ContainerDocument;
use crate::pipeline::input::output_stem;
use crate::pipeline::quantize::DitherPool;
use crate::pipeline::render::{render_book, PageRenderer};
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Where a file sits in its batch, for cancellation and progress events.
#[derive(Clone, Default)]
pub(crate) struct FileContext {
    pub index: usize,
    pub name: String,
    /// Output file name without extension, unique within the batch.
    pub output_stem: String,
    pub cancel: CancelToken,
    pub progress: Option<ProgressCallback>,
}

impl FileContext {
    pub(crate) fn enter(&self, state: FileState) {
        if let Some(ref cb) = self.progress {
            cb.on_file_state(self.index, &self.name, state);
        }
    }

    fn check_cancelled(&self) -> Result<(), InkError> {
        if self.cancel.is_cancelled() {
            debug!("{}: cancelled", self.name);
            return Err(InkError::Cancelled);
        }
        Ok(())
    }
}

/// Convert one source package into a page container.
///
/// Pages are rendered by `renderer`, quantized on a private [`DitherPool`]
/// sized to the machine, and encoded in page order.
///
/// # Example
/// ```rust,no_run
/// use inkpress::{convert_book, BatchInput, ConversionConfig, ImageArchiveRenderer};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes = std::fs::read("comic.cbz")?;
/// let out = convert_book(
///     BatchInput::new("comic.cbz", bytes),
///     Arc::new(ImageArchiveRenderer),
///     &ConversionConfig::default(),
/// )
/// .await?;
/// std::fs::write(&out.name, &out.bytes)?;
/// # Ok(())
/// # }
/// ```
pub async fn convert_book(
    input: BatchInput,
    renderer: Arc<dyn PageRenderer>,
    config: &ConversionConfig,
) -> Result<ConvertedFile, InkError> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let ctx = FileContext {
        name: input.name.clone(),
        output_stem: output_stem(&input.name),
        ..FileContext::default()
    };
    convert_with_pool(input, renderer, config, &DitherPool::new(workers), &ctx).await
}

pub(crate) async fn convert_with_pool(
    input: BatchInput,
    renderer: Arc<dyn PageRenderer>,
    config: &ConversionConfig,
    pool: &DitherPool,
    ctx: &FileContext,
) -> Result<ConvertedFile, InkError> {
    let total_start = Instant::now();
    info!("Converting {}", input.name);
    let device = config.device;

    // ── Step 1: Render ───────────────────────────────────────────────────
    ctx.enter(FileState::Rendering);
    let render_start = Instant::now();
    let book = render_book(renderer, input.bytes, device).await?;
    let render_ms = render_start.elapsed().as_millis() as u64;
    let total_pages = book.pages.len();
    debug!(
        "{}: rendered {} pages, {} chapters in {}ms",
        input.name,
        total_pages,
        book.chapters.len(),
        render_ms
    );
    ctx.check_cancelled()?;

    // ── Step 2: Quantize in parallel, collect in page order ──────────────
    ctx.enter(FileState::Processing);
    let quantize_start = Instant::now();
    let chapter_count = book.chapters.len();
    let metadata = book.metadata.clone();
    let mut doc = ContainerDocument::for_device(&device, book.metadata, book.chapters);

    let options = config.quantize_options();
    let planes = stream::iter(book.pages)
        .map(|page| pool.quantize(page, options))
        .buffered(pool.workers());
    futures::pin_mut!(planes);

    while let Some(plane) = planes.next().await {
        // Abandoned mid-file: pending planes and the partial document drop here.
        ctx.check_cancelled()?;
        let plane = plane?;
        let page = plane.page_number;
        doc.push_page(plane)?;
        if let Some(ref cb) = ctx.progress {
            cb.on_page_complete(ctx.index, page + 1, total_pages);
        }
    }
    let quantize_ms = quantize_start.elapsed().as_millis() as u64;

    // ── Step 3: Encode ───────────────────────────────────────────────────
    let encode_start = Instant::now();
    let bytes = doc.finalize()?;
    let encode_ms = encode_start.elapsed().as_millis() as u64;

    let stats = ConversionStats {
        page_count: total_pages,
        chapter_count,
        output_bytes: bytes.len(),
        render_ms,
        quantize_ms,
        encode_ms,
        total_ms: total_start.elapsed().as_millis() as u64,
    };
    info!(
        "{}: {} pages → {} bytes in {}ms",
        input.name, total_pages, stats.output_bytes, stats.total_ms
    );

    Ok(ConvertedFile {
        name: format!("{}.{}", ctx.output_stem, config.output_extension()),
        metadata,
        bytes,
        stats,
    })
}

/// Optimize one EPUB on the blocking pool.
pub async fn optimize_package(
    input: BatchInput,
    optimizer: &Optimizer,
) -> Result<OptimizedFile, InkError> {
    let ctx = FileContext {
        name: input.name.clone(),
        output_stem: output_stem(&input.name),
        ..FileContext::default()
    };
    optimize_with(input, optimizer, &ctx).await
}

pub(crate) async fn optimize_with(
    input: BatchInput,
    optimizer: &Optimizer,
    ctx: &FileContext,
) -> Result<OptimizedFile, InkError> {
    ctx.enter(FileState::Processing);
    info!("Optimizing {}", input.name);
    let optimizer = optimizer.clone();
    let bytes = input.bytes;

    let (bytes, report) = tokio::task::spawn_blocking(move || optimizer.optimize_bytes(&bytes))
        .await
        .map_err(|e| InkError::Internal(format!("Optimizer task panicked: {e}")))??;
    ctx.check_cancelled()?;

    Ok(OptimizedFile {
        name: format!("{}.epub", ctx.output_stem),
        bytes,
        report,
    })
}

/// Synchronous wrapper around [`convert_book`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_book_sync(
    input: BatchInput,
    renderer: Arc<dyn PageRenderer>,
    config: &ConversionConfig,
) -> Result<ConvertedFile, InkError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InkError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert_book(input, renderer, config))
}

/// Synchronous wrapper around [`optimize_package`].
pub fn optimize_package_sync(
    input: BatchInput,
    optimizer: &Optimizer,
) -> Result<OptimizedFile, InkError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InkError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(optimize_package(input, optimizer))
}

/// Write an artifact into `dir` under its own file name.
///
/// Uses atomic write (temp file + rename) so readers never see a partial file.
pub async fn write_output(dir: &Path, artifact: &impl OutputArtifact) -> Result<PathBuf, InkError> {
    let path = dir.join(artifact.file_name());
    let write_err = |e: std::io::Error| InkError::OutputWriteFailed {
        path: path.clone(),
        source: e,
    };

    tokio::fs::create_dir_all(dir).await.map_err(write_err)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, artifact.bytes())
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(write_err)?;

    debug!("Wrote {} ({} bytes)", path.display(), artifact.bytes().len());
    Ok(path)
}

/// Everything `inspect` reports about a container, without its page data.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub header: crate::pipeline::container::ContainerHeader,
    pub metadata: crate::output::BookMetadata,
    pub chapters: Vec<crate::output::ChapterEntry>,
    pub page_count: usize,
    pub file_size: usize,
}

/// Read the header, metadata and TOC of a container buffer.
pub fn inspect(bytes: &[u8]) -> Result<ContainerSummary, InkError> {
    let reader = ContainerReader::parse(bytes)?;
    Ok(ContainerSummary {
        header: *reader.header(),
        metadata: reader.metadata().clone(),
        chapters: reader.chapters().to_vec(),
        page_count: reader.page_count(),
        file_size: bytes.len(),
    })
}
