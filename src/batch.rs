//! Batch orchestration: many inputs, bounded concurrency, per-file isolation.
//!
//! Every file runs its own pipeline; a failure is recorded against that file
//! and the rest carry on. At most [`BatchOptions::concurrency`] files are in
//! flight; the others wait their turn. Results come back in completion order
//! internally and are sorted to input order in the [`BatchReport`].
//!
//! ## Cancellation
//!
//! Cancelling the [`CancelToken`] stops dispatch of files not yet started
//! (they report [`InkError::Cancelled`]). Files in flight notice it between
//! pages and are abandoned; files already complete keep their output.

use crate::config::{BatchOptions, ConversionConfig};
use crate::convert::FileContext;
use crate::error::InkError;
use crate::optimize::Optimizer;
use crate::output::{BatchReport, ConvertedFile, FileResult, FileState, OptimizedFile, OutputArtifact};
use crate::pipeline::input::unique_stems;
use crate::pipeline::render::PageRenderer;
use crate::stream::{convert_stream, optimize_stream};
use futures::stream::{self, Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One input package held in memory.
#[derive(Clone)]
pub struct BatchInput {
    /// Display name, usually the input file name.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl BatchInput {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

impl std::fmt::Debug for BatchInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInput")
            .field("name", &self.name)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

/// Convert every input into a page container.
///
/// Never fails as a whole: per-file errors are in the report.
pub async fn convert_batch(
    inputs: Vec<BatchInput>,
    renderer: Arc<dyn PageRenderer>,
    config: &ConversionConfig,
    options: &BatchOptions,
) -> BatchReport<ConvertedFile> {
    let start = Instant::now();
    info!("Converting batch of {} files", inputs.len());
    let results = convert_stream(inputs, renderer, config, options)
        .collect()
        .await;
    finish_batch(results, options, start)
}

/// Optimize every input EPUB.
pub async fn optimize_batch(
    inputs: Vec<BatchInput>,
    optimizer: &Optimizer,
    options: &BatchOptions,
) -> BatchReport<OptimizedFile> {
    let start = Instant::now();
    info!("Optimizing batch of {} files", inputs.len());
    let results = optimize_stream(inputs, optimizer, options).collect().await;
    finish_batch(results, options, start)
}

fn finish_batch<T>(
    results: Vec<FileResult<T>>,
    options: &BatchOptions,
    start: Instant,
) -> BatchReport<T> {
    let report = BatchReport::from_results(results, start.elapsed().as_millis() as u64);
    if let Some(ref cb) = options.progress_callback {
        cb.on_batch_complete(report.stats.total_files, report.stats.completed);
    }
    info!(
        "Batch complete: {}/{} files, {} cancelled, {}ms",
        report.stats.completed,
        report.stats.total_files,
        report.stats.cancelled,
        report.stats.duration_ms
    );
    report
}

/// Run `job` over `inputs` with at most `options.concurrency` in flight,
/// yielding results in completion order.
pub(crate) fn dispatch<T, F, Fut>(
    inputs: Vec<BatchInput>,
    options: &BatchOptions,
    job: F,
) -> impl Stream<Item = FileResult<T>> + Send + 'static
where
    T: OutputArtifact + Send + 'static,
    F: Fn(BatchInput, FileContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, InkError>> + Send + 'static,
{
    if let Some(ref cb) = options.progress_callback {
        cb.on_batch_start(inputs.len());
    }

    let stems = unique_stems(inputs.iter().map(|i| i.name.as_str()));
    let queued: Vec<(BatchInput, FileContext)> = inputs
        .into_iter()
        .zip(stems)
        .enumerate()
        .map(|(index, (input, output_stem))| {
            let ctx = FileContext {
                index,
                name: input.name.clone(),
                output_stem,
                cancel: options.cancel.clone(),
                progress: options.progress_callback.clone(),
            };
            ctx.enter(FileState::Queued);
            (input, ctx)
        })
        .collect();

    stream::iter(queued)
        .map(move |(input, ctx)| {
            // Evaluated only when a slot frees up, so a cancel stops dispatch here.
            let job = (!ctx.cancel.is_cancelled()).then(|| job(input, ctx.clone()));
            async move {
                let outcome = match job {
                    Some(fut) => fut.await,
                    None => Err(InkError::Cancelled),
                };
                report_outcome(&ctx, &outcome);
                FileResult {
                    index: ctx.index,
                    name: ctx.name,
                    outcome,
                }
            }
        })
        .buffer_unordered(options.concurrency.max(1))
}

fn report_outcome<T: OutputArtifact>(ctx: &FileContext, outcome: &Result<T, InkError>) {
    match outcome {
        Ok(artifact) => {
            ctx.enter(FileState::Complete);
            if let Some(ref cb) = ctx.progress {
                cb.on_file_complete(ctx.index, &ctx.name, artifact.bytes().len());
            }
        }
        Err(e) => {
            warn!("{} failed: {}", ctx.name, e);
            ctx.enter(FileState::Failed);
            if let Some(ref cb) = ctx.progress {
                cb.on_file_error(ctx.index, &ctx.name, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizationProfile;
    use crate::error::FailureKind;
    use crate::progress::BatchProgressCallback;
    use std::sync::Mutex;

    #[test]
    fn cancel_token_is_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn input_debug_hides_bytes() {
        let input = BatchInput::new("a.epub", vec![0; 1024]);
        assert_eq!(
            format!("{input:?}"),
            "BatchInput { name: \"a.epub\", bytes: <1024 bytes> }"
        );
    }

    #[derive(Default)]
    struct StateLog(Mutex<Vec<(usize, FileState)>>);

    impl BatchProgressCallback for StateLog {
        fn on_file_state(&self, index: usize, _name: &str, state: FileState) {
            self.0.lock().unwrap().push((index, state));
        }
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let log = Arc::new(StateLog::default());
        let options = BatchOptions::builder()
            .cancel_token(cancel)
            .progress_callback(log.clone())
            .build()
            .unwrap();
        let inputs = vec![
            BatchInput::new("a.epub", b"junk".to_vec()),
            BatchInput::new("b.epub", b"junk".to_vec()),
        ];
        let report = optimize_batch(
            inputs,
            &Optimizer::new(OptimizationProfile::default()),
            &options,
        )
        .await;
        assert_eq!(report.stats.cancelled, 2);
        assert!(report
            .results
            .iter()
            .all(|r| r.error().map(InkError::kind) == Some(FailureKind::Cancelled)));

        let states = log.0.lock().unwrap();
        assert!(!states.iter().any(|(_, s)| *s == FileState::Processing));
        assert_eq!(states.iter().filter(|(_, s)| *s == FileState::Failed).count(), 2);
    }

    #[tokio::test]
    async fn bad_input_fails_alone() {
        let good = crate::optimize::package::tests::sample_epub(&[]);
        let inputs = vec![
            BatchInput::new("good.epub", good),
            BatchInput::new("bad.epub", b"PK\x03\x04 not really".to_vec()),
        ];
        let report = optimize_batch(
            inputs,
            &Optimizer::new(OptimizationProfile::default()),
            &BatchOptions::default(),
        )
        .await;
        assert_eq!(report.stats.completed, 1);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.results[0].name, "good.epub");
        assert_eq!(
            report.results[1].error().map(InkError::kind),
            Some(FailureKind::Optimization)
        );
    }

    #[tokio::test]
    async fn oversized_zip64_entry_fails_alone() {
        let bomb = crate::archive::tests::oversized_zip64_entry("page.png");

        let report = convert_batch(
            vec![BatchInput::new("bomb.cbz", bomb.clone())],
            Arc::new(crate::pipeline::render::ImageArchiveRenderer),
            &ConversionConfig::default(),
            &BatchOptions::default(),
        )
        .await;
        assert_eq!(report.stats.failed, 1);
        assert_eq!(
            report.results[0].error().map(InkError::kind),
            Some(FailureKind::Render)
        );

        let inputs = vec![
            BatchInput::new("good.epub", crate::optimize::package::tests::sample_epub(&[])),
            BatchInput::new("bomb.epub", bomb),
        ];
        let report = optimize_batch(
            inputs,
            &Optimizer::new(OptimizationProfile::default()),
            &BatchOptions::default(),
        )
        .await;
        assert_eq!(report.stats.completed, 1);
        assert_eq!(
            report.results[1].error().map(InkError::kind),
            Some(FailureKind::Optimization)
        );
    }

    #[tokio::test]
    async fn same_stem_inputs_get_distinct_outputs() {
        let epub = crate::optimize::package::tests::sample_epub(&[]);
        let inputs = vec![
            BatchInput::new("shelf/novel.epub", epub.clone()),
            BatchInput::new("other/novel.epub", epub),
        ];
        let report = optimize_batch(
            inputs,
            &Optimizer::new(OptimizationProfile::default()),
            &BatchOptions::default(),
        )
        .await;
        let names: Vec<&str> = report.outputs().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["novel.epub", "novel-2.epub"]);
        assert!(report.bundle(&crate::archive::ZipArchiver).is_ok());
    }
}
