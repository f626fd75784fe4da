//! CLI binary for receipt2json.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use receipt2json::{
    discover_images, extract_batch, extract_invoice, extract_invoice_from, transcribe,
    BatchProgressCallback, BatchReport, BatchStats, ExtractionConfig, ImageInput, ProgressCallback,
    Provider,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per image.
/// Images complete out of order when `--concurrency > 1`.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-image wall-clock start times, keyed by input index.
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total} images…"))
        ));
    }

    fn on_item_start(&self, index: usize, _total: usize, image: &Path) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(display_name(image));
    }

    fn on_item_complete(&self, index: usize, total: usize, image: &Path) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            green("✓"),
            index + 1,
            total,
            display_name(image),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_item_skipped(&self, index: usize, total: usize, image: &Path) {
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            yellow("↷"),
            index + 1,
            total,
            display_name(image),
            dim("exists, skipped"),
        ));
        self.bar.inc(1);
    }

    fn on_item_error(&self, index: usize, total: usize, image: &Path, error: &str) {
        let secs = self.elapsed_secs(index);
        // Keep one line per image; the full message is in the report.
        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}  {}",
            red("✗"),
            index + 1,
            total,
            display_name(image),
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _stats: &BatchStats) {
        self.bar.finish_and_clear();
    }
}

fn display_name(image: &Path) -> String {
    image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.display().to_string())
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every receipt in a folder (writes IMG_0001.json next to IMG_0001.jpg)
  receipt2json ~/receipts/

  # Re-run after a failure: finished images are skipped
  receipt2json ~/receipts/

  # Force re-extraction with a smaller upload size
  receipt2json --overwrite --max-width 1600 --max-height 1600 ~/receipts/

  # Print one receipt's JSON instead of writing a file
  receipt2json --stdout receipt.jpg

  # Two photos of one long receipt
  receipt2json --same-invoice top.jpg bottom.jpg -o receipt.json

  # Plain-text transcription
  receipt2json --transcribe receipt.jpg

  # Use Claude
  receipt2json --provider anthropic ~/receipts/

  # Machine-readable batch report
  receipt2json --json ~/receipts/ > report.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI (or compatible) API key
  OPENAI_API_ENDPOINT     Chat-completions URL (default: https://api.openai.com/v1/chat/completions)
  OPENAI_MODEL            Model ID (default: gpt-4o-mini)
  ANTHROPIC_API_KEY       Anthropic API key
  ANTHROPIC_API_ENDPOINT  Messages URL (default: https://api.anthropic.com/v1/messages)
  ANTHROPIC_MODEL         Model ID (default: claude-3-7-sonnet-20250219)
  RECEIPT2JSON_PROVIDER   Provider when --provider is not given
  RUST_LOG                Log filter, overrides --verbose / --quiet

  A .env file in the working directory is loaded first.
"#;

/// Extract structured invoice JSON from receipt photos using vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "receipt2json",
    version,
    about = "Extract structured invoice JSON from receipt photos using vision LLMs",
    long_about = "Send receipt and invoice photos to a vision LLM (OpenAI-compatible or Anthropic) \
and write the validated invoice JSON next to each image. Images whose JSON already exists are \
skipped, so an interrupted batch resumes where it stopped.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image files, directories, base64 payloads or data URIs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// LLM provider: openai or anthropic.
    #[arg(long, env = "RECEIPT2JSON_PROVIDER", default_value = "openai")]
    provider: String,

    /// API key (default: the provider's key variable).
    #[arg(long)]
    api_key: Option<String>,

    /// Model ID (default: the provider's model variable, then its default).
    #[arg(long)]
    model: Option<String>,

    /// Full endpoint URL (default: the provider's endpoint variable).
    #[arg(long)]
    endpoint: Option<String>,

    /// Downscale images wider than this many pixels.
    #[arg(long, env = "RECEIPT2JSON_MAX_WIDTH")]
    max_width: Option<u32>,

    /// Downscale images taller than this many pixels.
    #[arg(long, env = "RECEIPT2JSON_MAX_HEIGHT")]
    max_height: Option<u32>,

    /// JPEG quality (1–100).
    #[arg(long, env = "RECEIPT2JSON_QUALITY", default_value_t = 90,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Number of images extracted at once.
    #[arg(short, long, env = "RECEIPT2JSON_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Re-extract images whose JSON already exists.
    #[arg(long, env = "RECEIPT2JSON_OVERWRITE")]
    overwrite: bool,

    /// Path to a text file replacing the built-in extraction instructions.
    #[arg(long, env = "RECEIPT2JSON_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per image.
    #[arg(long, env = "RECEIPT2JSON_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: u32,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "RECEIPT2JSON_TEMPERATURE", default_value_t = 0.1)]
    temperature: f64,

    /// Whole-request timeout in seconds.
    #[arg(long, env = "RECEIPT2JSON_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Connect timeout in seconds.
    #[arg(long, env = "RECEIPT2JSON_CONNECT_TIMEOUT", default_value_t = 30)]
    connect_timeout: u64,

    /// Print each record to stdout instead of writing JSON files.
    #[arg(long, conflicts_with_all = ["same_invoice", "transcribe"])]
    stdout: bool,

    /// Treat all inputs as photos of one invoice.
    #[arg(long, conflicts_with = "transcribe")]
    same_invoice: bool,

    /// Output file for --same-invoice (default: stdout).
    #[arg(short, long, requires = "same_invoice")]
    output: Option<PathBuf>,

    /// Print a plain-text transcription instead of invoice JSON.
    #[arg(long)]
    transcribe: bool,

    /// Print the batch report as JSON on stdout.
    #[arg(long, env = "RECEIPT2JSON_JSON")]
    json: bool,

    /// List what a batch would do without calling the API.
    #[arg(long)]
    dry_run: bool,

    /// Disable progress bar.
    #[arg(long, env = "RECEIPT2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "RECEIPT2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "RECEIPT2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing so `env = ...` fallbacks see .env values.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let batch_mode = !(cli.stdout || cli.same_invoice || cli.transcribe);
    let show_progress = batch_mode && !cli.quiet && !cli.no_progress && !cli.json && !cli.dry_run;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    if cli.transcribe {
        for arg in &cli.inputs {
            let text = transcribe(ImageInput::from_arg(arg), &config)
                .await
                .with_context(|| format!("Transcription failed for {}", short_arg(arg)))?;
            print!("{text}");
        }
        return Ok(());
    }

    if cli.same_invoice {
        let inputs = cli.inputs.iter().map(|a| ImageInput::from_arg(a)).collect();
        let record = extract_invoice_from(inputs, &config)
            .await
            .context("Extraction failed")?;
        match cli.output {
            Some(ref path) => {
                tokio::fs::write(path, record.to_pretty_json())
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                if !cli.quiet {
                    eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
                }
            }
            None => print!("{}", record.to_pretty_json()),
        }
        return Ok(());
    }

    if cli.stdout {
        let stdout = io::stdout();
        for arg in &cli.inputs {
            let record = extract_invoice(ImageInput::from_arg(arg), &config)
                .await
                .with_context(|| format!("Extraction failed for {}", short_arg(arg)))?;
            let mut handle = stdout.lock();
            handle
                .write_all(record.to_pretty_json().as_bytes())
                .context("Failed to write to stdout")?;
        }
        return Ok(());
    }

    // ── Batch mode ───────────────────────────────────────────────────────
    let paths = batch_paths(&cli.inputs)?;
    let images = discover_images(&paths).context("Failed to list images")?;
    if images.is_empty() {
        bail!("No images found in {}", cli.inputs.join(", "));
    }

    if cli.dry_run {
        for image in &images {
            let output = receipt2json::output_path_for(image);
            let action = if output.exists() && !cli.overwrite {
                yellow("skip")
            } else {
                green("extract")
            };
            println!("{action:<18} {}  →  {}", image.display(), output.display());
        }
        return Ok(());
    }

    let report = extract_batch(&images, &config)
        .await
        .context("Batch failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&report);
    }

    if report.stats.failed > 0 {
        bail!(
            "{} of {} images failed",
            report.stats.failed,
            report.stats.total
        );
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let provider: Provider = cli.provider.parse().context("Invalid --provider")?;

    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = ExtractionConfig::builder()
        .provider(provider)
        .quality(cli.quality)
        .concurrency(cli.concurrency)
        .overwrite(cli.overwrite)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .request_timeout_secs(cli.timeout)
        .connect_timeout_secs(cli.connect_timeout);

    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref url) = cli.endpoint {
        builder = builder.endpoint(url);
    }
    if let Some(w) = cli.max_width {
        builder = builder.max_width(w);
    }
    if let Some(h) = cli.max_height {
        builder = builder.max_height(h);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Batch mode writes next to each image, so every input must be a path.
fn batch_paths(inputs: &[String]) -> Result<Vec<PathBuf>> {
    inputs
        .iter()
        .map(|arg| match ImageInput::from_arg(arg) {
            ImageInput::Path(p) => Ok(p),
            _ => bail!(
                "{} is not a file path; use --stdout for base64 or data URI input",
                short_arg(arg)
            ),
        })
        .collect()
}

/// Base64 arguments can be megabytes long.
fn short_arg(arg: &str) -> String {
    if arg.chars().count() > 60 {
        format!("{}\u{2026}", arg.chars().take(59).collect::<String>())
    } else {
        arg.to_string()
    }
}

fn print_summary(report: &BatchReport) {
    let stats = &report.stats;
    let mark = if stats.failed == 0 {
        green("✔")
    } else if stats.failed == stats.total {
        red("✘")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  {} extracted, {} skipped, {} failed  {}ms",
        mark,
        bold(&stats.completed.to_string()),
        stats.skipped,
        if stats.failed == 0 {
            stats.failed.to_string()
        } else {
            red(&stats.failed.to_string())
        },
        stats.total_duration_ms,
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out",
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
    );
    for failure in report.failures() {
        eprintln!("   {} {}", red("✗"), failure);
    }
}
