//! # receipt2json
//!
//! Extract structured invoice data from receipt photos using vision LLMs.
//!
//! ## Why this crate?
//!
//! Classic OCR turns a crumpled thermal-paper receipt into a soup of
//! characters; you still need rules for every store layout to find the
//! total, the seller's tax ID and the line items. Instead this crate sends
//! the photo to a vision-capable model with a strict prompt, then refuses to
//! trust the reply until it parses as JSON and matches the invoice schema.
//!
//! ## Pipeline Overview
//!
//! ```text
//! photo
//!  │
//!  ├─ 1. Input      classify path / bytes / base64 / data URI
//!  ├─ 2. Normalize  EXIF orientation, bounded resize, JPEG → base64 (spawn_blocking)
//!  ├─ 3. Infer      one call to gpt-4o-mini / claude / any compatible endpoint
//!  ├─ 4. Coerce     strip fences and invisible characters, parse JSON
//!  ├─ 5. Validate   required fields and types, every violation reported
//!  └─ 6. Output     pretty JSON written next to the photo
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use receipt2json::{extract_invoice, ExtractionConfig, Provider};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads OPENAI_API_KEY / OPENAI_MODEL / OPENAI_API_ENDPOINT
//!     let config = ExtractionConfig::from_env(Provider::OpenAi);
//!     let record = extract_invoice(Path::new("receipt.jpg"), &config).await?;
//!     println!("{} {:?}", record.seller_name().unwrap_or("?"), record.total_amount());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `receipt2json` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! receipt2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ErrorKind, InvoiceError, ItemError};
pub use extract::{
    extract_batch, extract_invoice, extract_invoice_from, extract_sync, extract_to_file,
    extract_with_client, output_path_for, transcribe,
};
pub use output::{BatchItem, BatchReport, BatchStats, Extraction, InvoiceRecord, ItemOutcome};
pub use pipeline::encode::{normalize, EncodedImage, NormalizeOptions};
pub use pipeline::input::{discover_images, ImageInput};
pub use pipeline::llm::{
    Completion, HttpVisionClient, InferenceRequest, Provider, StaticClient, VisionClient,
};
pub use pipeline::postprocess::{coerce, Reply};
pub use pipeline::schema::{Violation, ViolationKind};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::{PromptCatalog, PromptKey, PromptSpec};
pub use stream::{extract_stream, ItemStream};
