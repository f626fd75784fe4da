//! Pipeline stages for receipt-to-JSON extraction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. a canned client instead of HTTP) without
//! touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ encode ──▶ llm ──▶ postprocess ──▶ schema
//! (classify) (JPEG/b64) (VLM)  (fences→JSON)   (validate)
//! ```
//!
//! 1. [`input`]: classify the caller's path/bytes/base64/data URI once
//! 2. [`encode`]: decode, apply EXIF orientation, bound the size, re-encode
//!    as JPEG and base64-wrap; runs in `spawn_blocking`
//! 3. [`llm`]: one multimodal HTTP call; the only stage with network I/O
//! 4. [`postprocess`]: strip fences and invisible characters, parse JSON
//! 5. [`schema`]: check the invoice shape and collect every violation

pub mod encode;
pub mod input;
pub mod llm;
pub mod postprocess;
pub mod schema;
