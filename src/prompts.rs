//! System prompts for receipt extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing what the model is asked for (a new
//!    field, a stricter numeric rule) means editing exactly one place, and the
//!    version string records that it changed.
//!
//! 2. **Testability**: unit tests can inspect prompts directly without
//!    spinning up a real model, so prompt regressions are easy to catch.
//!
//! The catalog is a fixed table of `&'static` entries. Callers can replace the
//! instruction text via [`crate::config::ExtractionConfig::system_prompt`];
//! the JSON shape documentation is always appended so the reply still matches
//! [`crate::pipeline::schema`].

use serde::Serialize;

/// Identifies one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKey {
    /// Structured invoice extraction (JSON reply).
    Invoice,
    /// Verbatim text transcription (plain-text reply).
    Transcription,
}

/// A versioned system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromptSpec {
    pub key: PromptKey,
    pub version: &'static str,
    /// What the model should do and the rules it must follow.
    pub instruction: &'static str,
    /// Documentation of the exact reply shape; empty for free-text prompts.
    pub shape: &'static str,
}

impl PromptSpec {
    /// Instruction followed by the shape documentation.
    pub fn system_prompt(&self) -> String {
        self.with_instruction(self.instruction)
    }

    /// Replace the instruction, keeping the shape documentation.
    pub fn with_instruction(&self, instruction: &str) -> String {
        if self.shape.is_empty() {
            instruction.to_string()
        } else {
            format!("{}\n\n{}", instruction.trim_end(), self.shape)
        }
    }
}

/// Lookup for the fixed set of prompts.
pub struct PromptCatalog;

impl PromptCatalog {
    pub fn get(key: PromptKey) -> &'static PromptSpec {
        match key {
            PromptKey::Invoice => &INVOICE_PROMPT,
            PromptKey::Transcription => &TRANSCRIPTION_PROMPT,
        }
    }

    pub fn all() -> &'static [&'static PromptSpec] {
        &ALL_PROMPTS
    }
}

static ALL_PROMPTS: [&PromptSpec; 2] = [&INVOICE_PROMPT, &TRANSCRIPTION_PROMPT];

/// Canonical invoice extraction prompt.
pub static INVOICE_PROMPT: PromptSpec = PromptSpec {
    key: PromptKey::Invoice,
    version: "v1",
    instruction: INVOICE_INSTRUCTION,
    shape: INVOICE_SHAPE,
};

/// Transcribe every visible character.
pub static TRANSCRIPTION_PROMPT: PromptSpec = PromptSpec {
    key: PromptKey::Transcription,
    version: "v1",
    instruction: TRANSCRIPTION_INSTRUCTION,
    shape: "",
};

const INVOICE_INSTRUCTION: &str = r#"You are an expert invoice and receipt reader. Read the attached photo(s) of a single receipt or invoice and convert its content into structured JSON.

Follow these rules precisely:

1. NUMBERS
   - Amounts, quantities and prices are plain JSON numbers
   - No currency symbols, no units, no thousands separators
   - Use a decimal point for fractions (12.50, not 12,50)

2. MISSING VALUES
   - Every field of the shape below must be present
   - If a value is absent or unreadable, use null; never omit the key
   - Except "total_amount", "seller.name" and each item "name", which are
     never null: use 0 for an unreadable total and "" for an unreadable name
   - "items" is always an array, even when empty

3. DATES
   - Convert the invoice date to YYYY-MM-DD
   - Convert non-Gregorian calendars (e.g. ROC year 113 → 2024)

4. LANGUAGE
   - Copy names and addresses exactly as printed
   - Do NOT translate or romanise any text

5. LINE ITEMS
   - One entry per visually distinct line item, in printed order
   - Never merge separate items, even if they share a name
   - "amount" is the line subtotal as printed

6. OUTPUT FORMAT
   - Respond with the JSON object ONLY
   - Do NOT wrap in ```json fences
   - Do NOT add commentary or explanations"#;

const INVOICE_SHAPE: &str = r#"Respond with exactly this JSON shape:
{
  "invoice_number": "AB12345678",   // string or null; usually 2 letters + 8 digits
  "date": "2024-02-26",             // YYYY-MM-DD or null
  "total_amount": 100,              // number, never null
  "seller": {
    "name": "Store name",           // string, never null
    "tax_id": "12345678",           // string or null
    "address": "Store address"      // string or null
  },
  "items": [
    {
      "name": "Item name",          // string, never null
      "quantity": 1,                // number or null
      "unit_price": 50,             // number or null
      "amount": 50                  // number or null
    }
  ]
}"#;

const TRANSCRIPTION_INSTRUCTION: &str = "Write down all the text visible in this image, \
including spaces and line breaks. Output the text only, without commentary.";
