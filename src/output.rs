//! Result types: the accepted invoice record and batch reports.

use crate::error::{InvoiceError, ItemError};
use crate::pipeline::schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// A schema-validated invoice.
///
/// Wraps the exact JSON object the model produced so that no field is lost
/// on the way to disk, including keys the schema does not know about.
/// Arbitrary JSON becomes a record only through
/// [`crate::pipeline::schema::accept`], which deserialisation also goes
/// through; the record is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct InvoiceRecord(Value);

impl TryFrom<Value> for InvoiceRecord {
    type Error = InvoiceError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        schema::accept(value)
    }
}

impl From<InvoiceRecord> for Value {
    fn from(record: InvoiceRecord) -> Self {
        record.0
    }
}

impl InvoiceRecord {
    pub(crate) fn new_unchecked(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn invoice_number(&self) -> Option<&str> {
        self.0.get("invoice_number").and_then(Value::as_str)
    }

    pub fn date(&self) -> Option<&str> {
        self.0.get("date").and_then(Value::as_str)
    }

    pub fn total_amount(&self) -> Option<f64> {
        self.0.get("total_amount").and_then(Value::as_f64)
    }

    pub fn seller_name(&self) -> Option<&str> {
        self.0.pointer("/seller/name").and_then(Value::as_str)
    }

    pub fn seller_tax_id(&self) -> Option<&str> {
        self.0.pointer("/seller/tax_id").and_then(Value::as_str)
    }

    /// Line items in document order.
    pub fn items(&self) -> &[Value] {
        self.0
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pretty-printed JSON with a trailing newline, as written to disk.
    pub fn to_pretty_json(&self) -> String {
        let mut s = serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.0.to_string());
        s.push('\n');
        s
    }
}

impl PartialEq<Value> for InvoiceRecord {
    fn eq(&self, other: &Value) -> bool {
        &self.0 == other
    }
}

/// One successful extraction with its cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub record: InvoiceRecord,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Normalisation plus inference, wall clock.
    pub duration_ms: u64,
}

/// What happened to one image of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Extracted, validated and written to `output`.
    Completed {
        record: InvoiceRecord,
        input_tokens: u32,
        output_tokens: u32,
        duration_ms: u64,
    },
    /// `output` already existed; the image was not sent to the model.
    Skipped,
    /// Extraction failed; nothing was written.
    Failed { error: ItemError },
}

/// One result slot per input image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    /// Position of the image in the input list.
    pub index: usize,
    pub image: PathBuf,
    pub output: PathBuf,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl BatchItem {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Skipped)
    }

    pub fn error(&self) -> Option<&ItemError> {
        match &self.outcome {
            ItemOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<&InvoiceRecord> {
        match &self.outcome {
            ItemOutcome::Completed { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn image(&self) -> &Path {
        &self.image
    }
}

/// Aggregate counters for a batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

impl BatchStats {
    pub fn from_items(items: &[BatchItem], total_duration_ms: u64) -> Self {
        let mut stats = BatchStats {
            total: items.len(),
            total_duration_ms,
            ..Default::default()
        };
        for item in items {
            match &item.outcome {
                ItemOutcome::Completed {
                    input_tokens,
                    output_tokens,
                    ..
                } => {
                    stats.completed += 1;
                    stats.total_input_tokens += u64::from(*input_tokens);
                    stats.total_output_tokens += u64::from(*output_tokens);
                }
                ItemOutcome::Skipped => stats.skipped += 1,
                ItemOutcome::Failed { .. } => stats.failed += 1,
            }
        }
        stats
    }
}

/// Everything a batch run produced, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &ItemError> {
        self.items.iter().filter_map(BatchItem::error)
    }
}
