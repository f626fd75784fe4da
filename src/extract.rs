//! Eager extraction entry points.
//!
//! One extraction is strictly sequential:
//!
//! ```text
//! normalize (spawn_blocking) ──▶ complete (HTTP) ──▶ coerce ──▶ accept
//! ```
//!
//! Batches run many of those side by side through `buffer_unordered`, each
//! unit returning its own [`BatchItem`] so that no state is shared between
//! workers. Use [`crate::stream::extract_stream`] instead when you want
//! results as they finish.

use crate::config::ExtractionConfig;
use crate::error::{InvoiceError, ItemError};
use crate::output::{BatchItem, BatchReport, BatchStats, Extraction, InvoiceRecord, ItemOutcome};
use crate::pipeline::encode::{self, EncodedImage, NormalizeOptions};
use crate::pipeline::input::ImageInput;
use crate::pipeline::llm::{InferenceRequest, VisionClient};
use crate::pipeline::{postprocess, schema};
use crate::prompts::{PromptCatalog, PromptKey};
use futures::stream::{self, StreamExt};
use std::collections::hash_map::{Entry, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract the invoice shown in one image.
///
/// This is the primary entry point for the library.
///
/// # Errors
/// Any stage failure: unreadable image, API error, unparseable reply or a
/// reply that does not match the invoice schema.
pub async fn extract_invoice(
    input: impl Into<ImageInput>,
    config: &ExtractionConfig,
) -> Result<InvoiceRecord, InvoiceError> {
    extract_invoice_from(vec![input.into()], config).await
}

/// Extract one invoice photographed across several images.
///
/// All images go into a single request, in the order given.
pub async fn extract_invoice_from(
    inputs: Vec<ImageInput>,
    config: &ExtractionConfig,
) -> Result<InvoiceRecord, InvoiceError> {
    let client = config.resolve_client()?;
    let extraction = extract_with_client(&client, inputs, config).await?;
    Ok(extraction.record)
}

/// Extract with an explicit client, returning token accounting too.
pub async fn extract_with_client(
    client: &Arc<dyn VisionClient>,
    inputs: Vec<ImageInput>,
    config: &ExtractionConfig,
) -> Result<Extraction, InvoiceError> {
    let start = Instant::now();
    let image_count = inputs.len();
    let images = normalize_blocking(inputs, config.normalize_options()).await?;

    let request = invoice_request(images, config);
    let completion = client.complete(&request).await?;
    debug!(
        "{}: {} images → {} chars, {} in / {} out tokens",
        client.name(),
        image_count,
        completion.text.len(),
        completion.input_tokens,
        completion.output_tokens
    );

    let value = postprocess::coerce(completion.text.into())?;
    let record = schema::accept(value)?;

    Ok(Extraction {
        record,
        input_tokens: completion.input_tokens,
        output_tokens: completion.output_tokens,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Transcribe every visible character of an image as plain text.
pub async fn transcribe(
    input: impl Into<ImageInput>,
    config: &ExtractionConfig,
) -> Result<String, InvoiceError> {
    let client = config.resolve_client()?;
    let images = normalize_blocking(vec![input.into()], config.normalize_options()).await?;
    let spec = PromptCatalog::get(PromptKey::Transcription);
    let request = InferenceRequest {
        model: config.model_name(),
        system: spec.system_prompt(),
        text: None,
        images,
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };
    let completion = client.complete(&request).await?;
    Ok(postprocess::clean_transcript(&completion.text))
}

/// Extract an image and write the record next to it.
///
/// The output goes to [`output_path_for`] via an atomic write (temp file +
/// rename) so that an interrupted run never leaves a half-written JSON file
/// that a later run would mistake for a finished one.
pub async fn extract_to_file(
    image: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<InvoiceRecord, InvoiceError> {
    let image = image.as_ref();
    let record = extract_invoice(image, config).await?;
    let output = output_path_for(image);
    write_record(&output, &record).await?;
    info!("Wrote {}", output.display());
    Ok(record)
}

/// Synchronous wrapper around [`extract_invoice`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input: impl Into<ImageInput>,
    config: &ExtractionConfig,
) -> Result<InvoiceRecord, InvoiceError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InvoiceError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_invoice(input, config))
}

/// Extract every image, writing one JSON file per image.
///
/// The client is resolved once up front, so a missing API key fails the
/// whole call before any work starts. After that nothing is fatal: each
/// image ends up `Completed`, `Skipped` (its JSON already exists and
/// `overwrite` is off) or `Failed`, and the report lists them in input order.
/// An image whose output file is already claimed by an earlier image in the
/// same batch fails with [`InvoiceError::OutputConflict`] without a model call.
pub async fn extract_batch(
    images: &[PathBuf],
    config: &ExtractionConfig,
) -> Result<BatchReport, InvoiceError> {
    let start = Instant::now();
    let client = config.resolve_client()?;
    let total = images.len();
    info!(
        "Starting batch: {} images, concurrency {}",
        total, config.concurrency
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    let claims = output_claims(images);
    let mut items: Vec<BatchItem> = stream::iter(
        images.iter().cloned().zip(claims).enumerate().map(|(index, (image, claimed_by))| {
            let client = Arc::clone(&client);
            let config = config.clone();
            async move { process_item(&client, index, total, image, claimed_by, &config).await }
        }),
    )
    .buffer_unordered(config.concurrency)
    .collect()
    .await;
    items.sort_by_key(|item| item.index);

    let stats = BatchStats::from_items(&items, start.elapsed().as_millis() as u64);
    info!(
        "Batch complete: {} completed, {} skipped, {} failed of {} ({}ms)",
        stats.completed, stats.skipped, stats.failed, stats.total, stats.total_duration_ms
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_complete(&stats);
    }

    Ok(BatchReport { items, stats })
}

/// Where the record for `image` is written: same directory and base name,
/// `.json` extension.
pub fn output_path_for(image: &Path) -> PathBuf {
    image.with_extension("json")
}

/// For each image, the earlier image in the batch that writes the same output
/// file (`r.jpg` and `r.png` both map to `r.json`).
pub(crate) fn output_claims(images: &[PathBuf]) -> Vec<Option<PathBuf>> {
    let mut owners: HashMap<PathBuf, &PathBuf> = HashMap::new();
    images
        .iter()
        .map(|image| match owners.entry(output_path_for(image)) {
            Entry::Occupied(owner) => Some(owner.get().to_path_buf()),
            Entry::Vacant(slot) => {
                slot.insert(image);
                None
            }
        })
        .collect()
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Run one batch slot. Never fails; failures become [`ItemOutcome::Failed`].
pub(crate) async fn process_item(
    client: &Arc<dyn VisionClient>,
    index: usize,
    total: usize,
    image: PathBuf,
    claimed_by: Option<PathBuf>,
    config: &ExtractionConfig,
) -> BatchItem {
    let output = output_path_for(&image);
    let cb = config.progress_callback.as_ref();

    if let Some(claimed_by) = claimed_by {
        let e = InvoiceError::OutputConflict {
            output: output.clone(),
            claimed_by,
        };
        warn!("Not extracting {}: {}", image.display(), e);
        if let Some(cb) = cb {
            cb.on_item_error(index, total, &image, &e.to_string());
        }
        return BatchItem {
            index,
            outcome: ItemOutcome::Failed {
                error: ItemError::new(&image, &e),
            },
            image,
            output,
        };
    }

    if !config.overwrite && output.exists() {
        info!("Skipping {}: {} exists", image.display(), output.display());
        if let Some(cb) = cb {
            cb.on_item_skipped(index, total, &image);
        }
        return BatchItem {
            index,
            image,
            output,
            outcome: ItemOutcome::Skipped,
        };
    }

    if let Some(cb) = cb {
        cb.on_item_start(index, total, &image);
    }

    let result: Result<Extraction, InvoiceError> = async {
        let extraction =
            extract_with_client(client, vec![ImageInput::Path(image.clone())], config).await?;
        write_record(&output, &extraction.record).await?;
        Ok(extraction)
    }
    .await;

    let outcome = match result {
        Ok(extraction) => {
            info!(
                "Extracted {} → {} ({} items, {}ms)",
                image.display(),
                output.display(),
                extraction.record.items().len(),
                extraction.duration_ms
            );
            if let Some(cb) = cb {
                cb.on_item_complete(index, total, &image);
            }
            ItemOutcome::Completed {
                record: extraction.record,
                input_tokens: extraction.input_tokens,
                output_tokens: extraction.output_tokens,
                duration_ms: extraction.duration_ms,
            }
        }
        Err(e) => {
            warn!("{}: {}", image.display(), e);
            if let Some(cb) = cb {
                cb.on_item_error(index, total, &image, &e.to_string());
            }
            ItemOutcome::Failed {
                error: ItemError::new(&image, &e),
            }
        }
    };

    BatchItem {
        index,
        image,
        output,
        outcome,
    }
}

/// Normalise on the blocking pool; decoding a 12 MP JPEG takes long enough
/// to stall the runtime.
async fn normalize_blocking(
    inputs: Vec<ImageInput>,
    opts: NormalizeOptions,
) -> Result<Vec<EncodedImage>, InvoiceError> {
    if inputs.is_empty() {
        return Err(InvoiceError::UnsupportedInput {
            detail: "no images given".into(),
        });
    }
    tokio::task::spawn_blocking(move || encode::normalize_all(inputs, &opts))
        .await
        .map_err(|e| InvoiceError::Internal(format!("Image task failed: {e}")))?
}

fn invoice_request(images: Vec<EncodedImage>, config: &ExtractionConfig) -> InferenceRequest {
    let spec = PromptCatalog::get(PromptKey::Invoice);
    let system = match config.system_prompt.as_deref() {
        Some(instruction) => spec.with_instruction(instruction),
        None => spec.system_prompt(),
    };
    let text = (images.len() > 1).then(|| {
        format!(
            "These {} photos show different parts of the same invoice.",
            images.len()
        )
    });
    InferenceRequest {
        model: config.model_name(),
        system,
        text,
        images,
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}

async fn write_record(path: &Path, record: &InvoiceRecord) -> Result<(), InvoiceError> {
    let write_err = |e: std::io::Error| InvoiceError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, record.to_pretty_json())
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}
