//! Streaming batch API: emit images as they complete.
//!
//! Unlike the eager [`crate::extract::extract_batch`], which returns only
//! after every image finishes, [`extract_stream`] yields [`BatchItem`]s via a
//! `Stream` as each image completes. With `concurrency > 1` items may arrive
//! out of order; sort by `index` if order matters.
//!
//! Skip-if-exists, output conflicts, per-item failure isolation and progress
//! callbacks behave exactly as in the eager API. The batch-level callbacks
//! (`on_batch_start` / `on_batch_complete`) are not fired; the caller owns
//! the end of the stream.

use crate::config::ExtractionConfig;
use crate::error::InvoiceError;
use crate::extract::{output_claims, process_item};
use crate::output::BatchItem;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of batch items.
pub type ItemStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Extract a batch of images, streaming items as they are ready.
///
/// # Returns
/// - `Ok(ItemStream)`: one item per input image
/// - `Err(InvoiceError)`: fatal error resolving the client (missing API key)
///
/// # Example
/// ```rust,no_run
/// use receipt2json::{extract_stream, ExtractionConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::default();
/// let mut items = extract_stream(vec!["receipt.jpg".into()], &config)?;
/// while let Some(item) = items.next().await {
///     match item.error() {
///         None => println!("{} done", item.image.display()),
///         Some(e) => eprintln!("{e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn extract_stream(
    images: Vec<PathBuf>,
    config: &ExtractionConfig,
) -> Result<ItemStream, InvoiceError> {
    let client = config.resolve_client()?;
    let total = images.len();
    info!("Starting streaming batch: {} images", total);

    let concurrency = config.concurrency;
    let config = config.clone();
    let claims = output_claims(&images);
    let s = stream::iter(images.into_iter().zip(claims).enumerate().map(
        move |(index, (image, claimed_by))| {
            let client = Arc::clone(&client);
            let cfg = config.clone();
            async move { process_item(&client, index, total, image, claimed_by, &cfg).await }
        },
    ))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}
