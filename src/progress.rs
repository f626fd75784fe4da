//! Progress-callback trait for per-image batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as [`crate::extract::extract_batch`] works through the images.
//!
//! # Example
//!
//! ```rust
//! use receipt2json::{BatchProgressCallback, ExtractionConfig};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_item_complete(&self, index: usize, total: usize, image: &Path) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} {}", index + 1, total, image.display());
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::BatchStats;
use std::path::Path;
use std::sync::Arc;

/// Called by the batch driver as it processes each image.
///
/// Implementations must be `Send + Sync`: with `concurrency > 1` the item
/// methods are called concurrently from different tasks. All methods have
/// default no-op implementations so callers only override what they need.
///
/// `index` is the 0-based position of the image in the input list.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any image is processed.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called just before an image is normalised and sent.
    fn on_item_start(&self, index: usize, total: usize, image: &Path) {
        let _ = (index, total, image);
    }

    /// Called after the record has been validated and written.
    fn on_item_complete(&self, index: usize, total: usize, image: &Path) {
        let _ = (index, total, image);
    }

    /// Called when an image is skipped because its output already exists.
    fn on_item_skipped(&self, index: usize, total: usize, image: &Path) {
        let _ = (index, total, image);
    }

    /// Called when an image fails; the batch continues.
    fn on_item_error(&self, index: usize, total: usize, image: &Path, error: &str) {
        let _ = (index, total, image, error);
    }

    /// Called once after every image has been attempted.
    fn on_batch_complete(&self, stats: &BatchStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
