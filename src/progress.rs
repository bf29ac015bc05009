//! Progress-callback trait for per-file batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchOptionsBuilder::progress_callback`] to follow each
//! file through its state machine (`Queued → Rendering → Processing →
//! Complete | Failed`).
//!
//! # Example
//!
//! ```rust
//! use inkpress::{BatchOptions, BatchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, index: usize, name: &str, output_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("#{index} {name}: {output_len} bytes");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let options = BatchOptions::builder()
//!     .progress_callback(counter as Arc<dyn BatchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::FileState;
use std::sync::Arc;

/// Called by the batch orchestrator as files move through the pipeline.
///
/// Files run concurrently, so methods may be called from several tasks at
/// once. All methods default to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any file is dispatched.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called on every state transition of a file.
    ///
    /// # Arguments
    /// * `index`: 0-based position of the file in the input list
    /// * `name`: display name of the input
    /// * `state`: the state just entered
    fn on_file_state(&self, index: usize, name: &str, state: FileState) {
        let _ = (index, name, state);
    }

    /// Called after each page of a container conversion is quantized.
    fn on_page_complete(&self, index: usize, page: usize, total_pages: usize) {
        let _ = (index, page, total_pages);
    }

    /// Called when a file reaches `Complete`.
    fn on_file_complete(&self, index: usize, name: &str, output_len: usize) {
        let _ = (index, name, output_len);
    }

    /// Called when a file reaches `Failed`.
    fn on_file_error(&self, index: usize, name: &str, error: &str) {
        let _ = (index, name, error);
    }

    /// Called once after every file is terminal.
    fn on_batch_complete(&self, total_files: usize, success_count: usize) {
        let _ = (total_files, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchOptions`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallback {
        states: Mutex<Vec<(usize, FileState)>>,
        errors: Mutex<Vec<String>>,
    }

    impl BatchProgressCallback for RecordingCallback {
        fn on_file_state(&self, index: usize, _name: &str, state: FileState) {
            self.states.lock().unwrap().push((index, state));
        }

        fn on_file_error(&self, _index: usize, _name: &str, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_file_state(0, "a.cbz", FileState::Rendering);
        cb.on_page_complete(0, 1, 3);
        cb.on_file_complete(0, "a.cbz", 1024);
        cb.on_file_error(1, "b.cbz", "boom");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn recording_callback_receives_states() {
        let cb = RecordingCallback::default();
        cb.on_file_state(0, "a", FileState::Queued);
        cb.on_file_state(0, "a", FileState::Processing);
        cb.on_file_error(0, "a", "bad");
        let states = cb.states.lock().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1], (0, FileState::Processing));
        assert_eq!(cb.errors.lock().unwrap()[0], "bad");
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_file_complete(3, "x", 7);
    }
}
