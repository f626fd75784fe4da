//! End-to-end pipeline tests.
//!
//! Everything except the live tests at the bottom runs offline: images are
//! generated with the `image` crate into a temp directory and the model is a
//! canned or recording [`VisionClient`].
//!
//! The live tests make real API calls and are gated behind `E2E_ENABLED`:
//!   E2E_ENABLED=1 OPENAI_API_KEY=sk-... cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use receipt2json::{
    extract_batch, extract_invoice_from, extract_stream, extract_sync, extract_to_file,
    extract_with_client, transcribe, BatchProgressCallback, BatchStats, Completion, ErrorKind,
    ExtractionConfig, ImageInput, InferenceRequest, InvoiceError, ItemOutcome, Provider,
    StaticClient, VisionClient,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn sample_invoice() -> Value {
    json!({
        "invoice_number": "AB123456",
        "date": "2024-02-26",
        "total_amount": 100,
        "seller": { "name": "測試商店", "tax_id": "12345678", "address": "台北市" },
        "items": [
            { "name": "商品A", "quantity": 1, "unit_price": 50, "amount": 50 },
            { "name": "商品B", "quantity": 2, "unit_price": 25, "amount": 50 }
        ]
    })
}

fn fenced(value: &Value) -> String {
    format!("```json\n{}\n```", serde_json::to_string_pretty(value).unwrap())
}

/// Write a small PNG "receipt" and return its path.
fn write_receipt(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
    let path = dir.join(name);
    DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([250, 250, 245])))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

fn config_with(client: Arc<dyn VisionClient>) -> ExtractionConfig {
    ExtractionConfig::builder()
        .client(client)
        .concurrency(2)
        .build()
        .unwrap()
}

/// Records every request it receives and replies with a fixed text.
struct RecordingClient {
    reply: String,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl RecordingClient {
    fn new(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionClient for RecordingClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, InvoiceError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(Completion {
            text: self.reply.clone(),
            input_tokens: 1000,
            output_tokens: 200,
        })
    }
}

/// Always fails like an HTTP 500 would.
struct FailingClient;

#[async_trait]
impl VisionClient for FailingClient {
    async fn complete(&self, _request: &InferenceRequest) -> Result<Completion, InvoiceError> {
        Err(InvoiceError::ApiRequest {
            status: Some(500),
            message: "internal server error".into(),
        })
    }
}

// ── Single image ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn stubbed_extraction_writes_json_next_to_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "receipt.png", 120, 300);
    let config = config_with(Arc::new(StaticClient::new(fenced(&sample_invoice()))));

    let record = extract_to_file(&image, &config).await.unwrap();
    assert_eq!(record, sample_invoice());
    assert_eq!(record.invoice_number(), Some("AB123456"));
    assert_eq!(record.seller_name(), Some("測試商店"));
    assert_eq!(record.items().len(), 2);

    let written = dir.path().join("receipt.json");
    let text = std::fs::read_to_string(&written).unwrap();
    let on_disk: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(on_disk, sample_invoice());
    assert!(text.contains("測試商店"));
}

#[tokio::test]
async fn request_carries_prompt_model_and_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "r.png", 400, 200);
    let client = RecordingClient::new(sample_invoice().to_string());
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .model("test-model")
        .max_width(100)
        .build()
        .unwrap();

    let dyn_client: Arc<dyn VisionClient> = client.clone();
    let extraction = extract_with_client(&dyn_client, vec![ImageInput::Path(image)], &config)
        .await
        .unwrap();
    assert_eq!(extraction.input_tokens, 1000);
    assert_eq!(extraction.output_tokens, 200);

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.model, "test-model");
    assert_eq!(req.images.len(), 1);
    assert_eq!(req.images[0].media_type, "image/jpeg");
    assert!(req.system.contains("\"invoice_number\""));
    assert!(req.text.is_none());

    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.images[0].data)
        .unwrap();
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (100, 50));
}

#[tokio::test]
async fn several_photos_go_into_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let top = write_receipt(dir.path(), "top.png", 60, 60);
    let bottom = write_receipt(dir.path(), "bottom.png", 60, 60);
    let client = RecordingClient::new(sample_invoice().to_string());
    let config = config_with(client.clone());

    let record = extract_invoice_from(vec![top.into(), bottom.into()], &config)
        .await
        .unwrap();
    assert_eq!(record.total_amount(), Some(100.0));

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].images.len(), 2);
    assert!(requests[0].text.as_deref().unwrap_or("").contains("same invoice"));
}

#[tokio::test]
async fn unparseable_reply_is_response_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "r.png", 40, 40);
    let config = config_with(Arc::new(StaticClient::new("I can't read this receipt, sorry.")));

    let err = extract_to_file(&image, &config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResponseParse);
    assert!(!dir.path().join("r.json").exists());
}

#[tokio::test]
async fn missing_items_is_schema_error_but_empty_items_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "r.png", 40, 40);

    let mut missing = sample_invoice();
    missing.as_object_mut().unwrap().remove("items");
    let config = config_with(Arc::new(StaticClient::new(missing.to_string())));
    match extract_to_file(&image, &config).await.unwrap_err() {
        InvoiceError::SchemaValidation { violations } => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].path, "items");
        }
        other => panic!("expected SchemaValidation, got {other:?}"),
    }

    let mut empty = sample_invoice();
    empty["items"] = json!([]);
    let config = config_with(Arc::new(StaticClient::new(empty.to_string())));
    let record = extract_to_file(&image, &config).await.unwrap();
    assert!(record.items().is_empty());
}

#[tokio::test]
async fn transcription_returns_cleaned_text() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "r.png", 40, 40);
    let client = RecordingClient::new("```\r\n統一發票  \r\nTOTAL 100\r\n```");
    let config = config_with(client.clone());

    let text = transcribe(image.as_path(), &config).await.unwrap();
    assert_eq!(text, "統一發票\nTOTAL 100\n");
    assert!(client.requests()[0].system.contains("spaces and line breaks"));
}

#[test]
fn sync_wrapper_runs_without_a_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "r.png", 40, 40);
    let config = config_with(Arc::new(StaticClient::new(sample_invoice().to_string())));
    let record = extract_sync(image.as_path(), &config).unwrap();
    assert_eq!(record.date(), Some("2024-02-26"));
}

// ── Batches ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingCallback {
    started: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    finished: Mutex<Option<BatchStats>>,
}

impl BatchProgressCallback for CountingCallback {
    fn on_item_start(&self, _index: usize, _total: usize, _image: &Path) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_item_complete(&self, _index: usize, _total: usize, _image: &Path) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_item_skipped(&self, _index: usize, _total: usize, _image: &Path) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_item_error(&self, _index: usize, _total: usize, _image: &Path, _error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_batch_complete(&self, stats: &BatchStats) {
        *self.finished.lock().unwrap() = Some(stats.clone());
    }
}

#[tokio::test]
async fn batch_skips_existing_and_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_receipt(dir.path(), "a.png", 80, 80);
    let b = write_receipt(dir.path(), "b.png", 80, 80);
    let c = dir.path().join("c.png");
    std::fs::write(&c, b"\x89PNG\r\n\x1a\nthis is not really a png").unwrap();

    let existing = "{\"already\": true}\n";
    std::fs::write(dir.path().join("b.json"), existing).unwrap();

    let client = Arc::new(StaticClient::new(fenced(&sample_invoice())));
    let callback = Arc::new(CountingCallback::default());
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .concurrency(3)
        .progress_callback(callback.clone())
        .build()
        .unwrap();

    let report = extract_batch(&[a.clone(), b.clone(), c.clone()], &config)
        .await
        .unwrap();

    // Input order is preserved regardless of completion order.
    let images: Vec<&Path> = report.items.iter().map(|i| i.image()).collect();
    assert_eq!(images, vec![a.as_path(), b.as_path(), c.as_path()]);

    assert!(report.items[0].is_completed());
    assert!(report.items[1].is_skipped());
    let failure = report.items[2].error().expect("c.png should fail");
    assert_eq!(failure.image, c);
    assert_eq!(failure.kind, ErrorKind::ImageProcessing);

    // Only the completed image reached the model.
    assert_eq!(client.calls(), 1);

    let a_json: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("a.json")).unwrap()).unwrap();
    assert_eq!(a_json, sample_invoice());
    assert_eq!(std::fs::read_to_string(dir.path().join("b.json")).unwrap(), existing);
    assert!(!dir.path().join("c.json").exists());

    assert_eq!(report.stats.total, 3);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.failures().count(), 1);

    assert_eq!(callback.started.load(Ordering::SeqCst), 2);
    assert_eq!(callback.completed.load(Ordering::SeqCst), 1);
    assert_eq!(callback.skipped.load(Ordering::SeqCst), 1);
    assert_eq!(callback.failed.load(Ordering::SeqCst), 1);
    assert_eq!(callback.finished.lock().unwrap().as_ref().map(|s| s.total), Some(3));
}

#[tokio::test]
async fn images_sharing_an_output_file_conflict_instead_of_skipping() {
    let dir = tempfile::tempdir().unwrap();
    let jpg = write_receipt(dir.path(), "r.jpg", 40, 40);
    let png = write_receipt(dir.path(), "r.png", 40, 40);

    let client = Arc::new(StaticClient::new(fenced(&sample_invoice())));
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .concurrency(1)
        .build()
        .unwrap();

    let report = extract_batch(&[jpg.clone(), png.clone()], &config).await.unwrap();
    assert!(report.items[0].is_completed());
    assert!(!report.items[1].is_skipped());
    let conflict = report.items[1].error().expect("r.png shares r.json with r.jpg");
    assert_eq!(conflict.image, png);
    assert_eq!(conflict.kind, ErrorKind::OutputWrite);
    assert!(conflict.message.contains("r.jpg"));
    assert_eq!(client.calls(), 1);
    assert_eq!(report.stats.failed, 1);
}

#[tokio::test]
async fn overwrite_reprocesses_existing_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_receipt(dir.path(), "a.png", 30, 30);
    std::fs::write(dir.path().join("a.json"), "{}").unwrap();

    let client = Arc::new(StaticClient::new(sample_invoice().to_string()));
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .overwrite(true)
        .build()
        .unwrap();

    let report = extract_batch(&[a], &config).await.unwrap();
    assert_eq!(report.stats.completed, 1);
    assert_eq!(client.calls(), 1);
    let on_disk: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("a.json")).unwrap()).unwrap();
    assert_eq!(on_disk, sample_invoice());
}

#[tokio::test]
async fn api_failures_do_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..4)
        .map(|i| write_receipt(dir.path(), &format!("r{i}.png"), 20, 20))
        .collect();
    let config = config_with(Arc::new(FailingClient));

    let report = extract_batch(&paths, &config).await.unwrap();
    assert_eq!(report.stats.failed, 4);
    for (i, item) in report.items.iter().enumerate() {
        assert_eq!(item.index, i);
        match &item.outcome {
            ItemOutcome::Failed { error } => {
                assert_eq!(error.kind, ErrorKind::ApiRequest);
                assert!(error.message.contains("HTTP 500"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn missing_api_key_fails_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_receipt(dir.path(), "a.png", 20, 20);
    let config = ExtractionConfig::builder()
        .provider(Provider::Anthropic)
        .api_key("   ")
        .build()
        .unwrap();

    // Only meaningful when the variable is not set in the environment.
    if std::env::var("ANTHROPIC_API_KEY").map_or(false, |v| !v.trim().is_empty()) {
        return;
    }
    let err = extract_batch(&[a], &config).await.unwrap_err();
    assert!(matches!(err, InvoiceError::MissingApiKey { .. }));
    assert!(!dir.path().join("a.json").exists());
}

#[tokio::test]
async fn stream_yields_one_item_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..5)
        .map(|i| write_receipt(dir.path(), &format!("s{i}.png"), 20, 20))
        .collect();
    let client = Arc::new(StaticClient::new(sample_invoice().to_string()));
    let config = config_with(client.clone());

    let stream = extract_stream(paths.clone(), &config).unwrap();
    let mut items: Vec<_> = stream.collect().await;
    items.sort_by_key(|i| i.index);

    assert_eq!(items.len(), 5);
    assert!(items.iter().all(|i| i.is_completed()));
    assert_eq!(client.calls(), 5);
    for path in &paths {
        assert!(path.with_extension("json").exists());
    }
}

// ── Live API (gated) ─────────────────────────────────────────────────────────

/// Skip unless E2E_ENABLED is set and the provider's key is available.
macro_rules! e2e_skip_unless_ready {
    ($provider:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run live tests");
            return;
        }
        let provider: Provider = $provider;
        if std::env::var(provider.api_key_env()).is_err() {
            println!("SKIP: {} not set", provider.api_key_env());
            return;
        }
        ExtractionConfig::from_env(provider)
    }};
}

#[tokio::test]
async fn live_openai_blank_receipt_round_trip() {
    let config = e2e_skip_unless_ready!(Provider::OpenAi);
    live_round_trip(config).await;
}

#[tokio::test]
async fn live_anthropic_blank_receipt_round_trip() {
    let config = e2e_skip_unless_ready!(Provider::Anthropic);
    live_round_trip(config).await;
}

/// A blank image has no invoice on it; the model must still answer with the
/// full shape: nulls where allowed, `0` / `""` for the never-null fields and
/// an empty items array.
async fn live_round_trip(config: ExtractionConfig) {
    let dir = tempfile::tempdir().unwrap();
    let image = write_receipt(dir.path(), "blank.png", 400, 600);
    let record = match extract_to_file(&image, &config).await {
        Ok(record) => record,
        Err(e) => panic!("live call failed: {e}"),
    };
    println!("{}", record.to_pretty_json());
    assert!(dir.path().join("blank.json").exists());
    assert!(record.total_amount().is_some());
    assert!(record.seller_name().is_some());
}
