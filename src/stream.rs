//! Streaming batch API: emit per-file results as they complete.
//!
//! [`crate::batch::convert_batch`] waits for every file and returns a sorted
//! report. The functions here yield each [`FileResult`] the moment its file
//! reaches a terminal state, so callers can write outputs to disk (or update
//! a UI) while the rest of the batch is still running. Results arrive in
//! completion order; use [`FileResult::index`] to restore input order.

use crate::batch::{dispatch, BatchInput};
use crate::config::{BatchOptions, ConversionConfig};
use crate::convert::{convert_with_pool, optimize_with};
use crate::optimize::Optimizer;
use crate::output::{ConvertedFile, FileResult, OptimizedFile};
use crate::pipeline::quantize::DitherPool;
use crate::pipeline::render::PageRenderer;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

/// A boxed stream of per-file results.
pub type FileResultStream<T> = Pin<Box<dyn Stream<Item = FileResult<T>> + Send>>;

/// Convert `inputs` to page containers, streaming results as files finish.
///
/// All files share one [`DitherPool`] of `options.dither_workers` workers.
pub fn convert_stream(
    inputs: Vec<BatchInput>,
    renderer: Arc<dyn PageRenderer>,
    config: &ConversionConfig,
    options: &BatchOptions,
) -> FileResultStream<ConvertedFile> {
    let config = *config;
    let pool = DitherPool::new(options.dither_workers);
    Box::pin(dispatch(inputs, options, move |input, ctx| {
        let renderer = Arc::clone(&renderer);
        let pool = pool.clone();
        async move { convert_with_pool(input, renderer, &config, &pool, &ctx).await }
    }))
}

/// Optimize `inputs`, streaming results as files finish.
pub fn optimize_stream(
    inputs: Vec<BatchInput>,
    optimizer: &Optimizer,
    options: &BatchOptions,
) -> FileResultStream<OptimizedFile> {
    let optimizer = optimizer.clone();
    Box::pin(dispatch(inputs, options, move |input, ctx| {
        let optimizer = optimizer.clone();
        async move { optimize_with(input, &optimizer, &ctx).await }
    }))
}
