//! Error types for the receipt2json library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`InvoiceError`] is **fatal for one extraction**. The image could not be
//!   read, the API call failed, or the reply was not a valid invoice. Returned
//!   as `Err(InvoiceError)` from the `extract*` functions.
//!
//! * [`ItemError`] is **non-fatal for a batch**. A single image failed but the
//!   rest of the batch continues. Stored inside
//!   [`crate::output::BatchItem`] so callers can inspect partial success and
//!   serialise the whole report as JSON.

use crate::pipeline::schema::Violation;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Longest raw-reply excerpt kept in error messages.
const SNIPPET_CHARS: usize = 400;

/// All errors returned by a single extraction.
#[derive(Debug, Error)]
pub enum InvoiceError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    NotFound { path: PathBuf },

    /// The input is not something the normalizer can turn into an image.
    #[error("Unsupported image input: {detail}")]
    UnsupportedInput { detail: String },

    /// Decoding, resizing or encoding the image failed.
    #[error("Image processing failed for {origin}: {detail}")]
    ImageProcessing { origin: String, detail: String },

    // ── Inference errors ──────────────────────────────────────────────────
    /// Transport failure, non-2xx status, or an envelope without content.
    #[error("API request failed{}: {message}", fmt_status(.status))]
    ApiRequest {
        status: Option<u16>,
        message: String,
    },

    /// The model reply was not valid JSON after fence stripping.
    #[error("Failed to parse model response: {detail}\nResponse content: {}", snippet(.raw))]
    ResponseParse { detail: String, raw: String },

    /// The reply parsed as JSON but does not match the invoice schema.
    #[error("Invoice failed schema validation ({} violation(s)): {}", .violations.len(), join_violations(.violations))]
    SchemaValidation { violations: Vec<Violation> },

    // ── Config errors ─────────────────────────────────────────────────────
    /// No API key configured and no client injected.
    #[error("Missing API key for provider '{provider}'.\nSet {env_var} or pass --api-key.")]
    MissingApiKey { provider: String, env_var: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two images in one batch map to the same output file.
    #[error("Output file '{output}' is already claimed by '{claimed_by}' in this batch")]
    OutputConflict { output: PathBuf, claimed_by: PathBuf },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InvoiceError {
    /// The serialisable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvoiceError::NotFound { .. } => ErrorKind::NotFound,
            InvoiceError::UnsupportedInput { .. } => ErrorKind::UnsupportedInput,
            InvoiceError::ImageProcessing { .. } => ErrorKind::ImageProcessing,
            InvoiceError::ApiRequest { .. } => ErrorKind::ApiRequest,
            InvoiceError::ResponseParse { .. } => ErrorKind::ResponseParse,
            InvoiceError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            InvoiceError::MissingApiKey { .. } | InvoiceError::InvalidConfig(_) => {
                ErrorKind::Config
            }
            InvoiceError::OutputWriteFailed { .. } | InvoiceError::OutputConflict { .. } => {
                ErrorKind::OutputWrite
            }
            InvoiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn image(origin: impl Into<String>, err: impl std::fmt::Display) -> Self {
        InvoiceError::ImageProcessing {
            origin: origin.into(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn api(message: impl Into<String>) -> Self {
        InvoiceError::ApiRequest {
            status: None,
            message: message.into(),
        }
    }
}

/// Category of an [`InvoiceError`], stable across serialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    UnsupportedInput,
    ImageProcessing,
    ApiRequest,
    ResponseParse,
    SchemaValidation,
    Config,
    OutputWrite,
    Internal,
}

/// A non-fatal error for a single image in a batch.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{image}: {message}")]
pub struct ItemError {
    pub image: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(image: impl Into<PathBuf>, err: &InvoiceError) -> Self {
        Self {
            image: image.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Truncate a model reply for display, on a char boundary.
pub(crate) fn snippet(raw: &str) -> String {
    if raw.chars().count() <= SNIPPET_CHARS {
        raw.to_string()
    } else {
        let cut: String = raw.chars().take(SNIPPET_CHARS).collect();
        format!("{cut}\u{2026}")
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
