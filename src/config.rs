//! Configuration types for receipt extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across worker tasks and to log exactly what a
//! run used (with the API key redacted).
//!
//! Provider settings fall back to the environment when not set explicitly:
//!
//! | Provider | Key | Endpoint | Model (default) |
//! |----------|-----|----------|-----------------|
//! | `openai` | `OPENAI_API_KEY` | `OPENAI_API_ENDPOINT` | `OPENAI_MODEL` (`gpt-4o-mini`) |
//! | `anthropic` | `ANTHROPIC_API_KEY` | `ANTHROPIC_API_ENDPOINT` | `ANTHROPIC_MODEL` (`claude-3-7-sonnet-20250219`) |

use crate::error::InvoiceError;
use crate::pipeline::encode::{NormalizeOptions, DEFAULT_QUALITY};
use crate::pipeline::llm::{HttpVisionClient, Provider, VisionClient};
use crate::progress::ProgressCallback;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for receipt extraction.
///
/// Built via [`ExtractionConfig::builder()`], [`ExtractionConfig::from_env()`]
/// or [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use receipt2json::{ExtractionConfig, Provider};
///
/// let config = ExtractionConfig::builder()
///     .provider(Provider::Anthropic)
///     .max_width(2048)
///     .concurrency(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Wire format and environment variable family. Default: OpenAI.
    pub provider: Provider,

    /// API key. If None, read from the provider's key variable.
    pub api_key: Option<String>,

    /// Model identifier. If None, the provider's model variable, then its default.
    pub model: Option<String>,

    /// Full endpoint URL. If None, the provider's endpoint variable, then its default.
    pub endpoint: Option<String>,

    /// Pre-constructed client. Takes precedence over every provider setting.
    pub client: Option<Arc<dyn VisionClient>>,

    /// Replaces the instruction part of the invoice prompt.
    pub system_prompt: Option<String>,

    /// Bound on the encoded image width in pixels. Default: none.
    pub max_width: Option<u32>,

    /// Bound on the encoded image height in pixels. Default: none.
    pub max_height: Option<u32>,

    /// JPEG quality, 1–100. Default: 90.
    ///
    /// Receipt text stays legible well below 90, but thermal-paper photos are
    /// low contrast and artefacts around small digits cost accuracy.
    pub quality: u8,

    /// Maximum tokens the model may generate. Default: 4096.
    ///
    /// Long supermarket receipts with 60+ lines need well over 2 000 output
    /// tokens; a truncated reply is unparseable JSON.
    pub max_tokens: u32,

    /// Sampling temperature, 0–2. Default: 0.1.
    pub temperature: f64,

    /// Whole-request timeout in seconds. Default: 300.
    pub request_timeout_secs: u64,

    /// TCP/TLS connect timeout in seconds. Default: 30.
    pub connect_timeout_secs: u64,

    /// Number of images extracted at once in a batch. Default: 4.
    pub concurrency: usize,

    /// Re-extract images whose JSON output already exists. Default: false.
    pub overwrite: bool,

    /// Batch progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: None,
            model: None,
            endpoint: None,
            client: None,
            system_prompt: None,
            max_width: None,
            max_height: None,
            quality: DEFAULT_QUALITY,
            max_tokens: 4096,
            temperature: 0.1,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
            concurrency: 4,
            overwrite: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("client", &self.client.as_ref().map(|c| c.name().to_string()))
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("max_width", &self.max_width)
            .field("max_height", &self.max_height)
            .field("quality", &self.quality)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("overwrite", &self.overwrite)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults with the provider's key, endpoint and model taken from the
    /// environment.
    pub fn from_env(provider: Provider) -> Self {
        Self {
            provider,
            api_key: env_var(provider.api_key_env()),
            endpoint: env_var(provider.endpoint_env()),
            model: env_var(provider.model_env()),
            ..Self::default()
        }
    }

    /// Model to request: explicit, then environment, then provider default.
    pub fn model_name(&self) -> String {
        self.model
            .clone()
            .or_else(|| env_var(self.provider.model_env()))
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            max_width: self.max_width,
            max_height: self.max_height,
            quality: self.quality,
        }
    }

    /// The client every request of a run goes through.
    ///
    /// Resolution order:
    ///
    /// 1. **Pre-built client** (`client`): used as-is. Tests and dry runs
    ///    inject a canned client here.
    /// 2. **Explicit key** (`api_key`) with `endpoint` / provider defaults.
    /// 3. **Environment**: the provider's key and endpoint variables.
    ///
    /// Fails with [`InvoiceError::MissingApiKey`] naming the variable when no
    /// key is found.
    pub fn resolve_client(&self) -> Result<Arc<dyn VisionClient>, InvoiceError> {
        self.resolve_client_with(env_var)
    }

    pub(crate) fn resolve_client_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn VisionClient>, InvoiceError> {
        if let Some(ref client) = self.client {
            return Ok(Arc::clone(client));
        }

        let provider = self.provider;
        let api_key = self
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| lookup(provider.api_key_env()))
            .ok_or_else(|| InvoiceError::MissingApiKey {
                provider: provider.name().to_string(),
                env_var: provider.api_key_env().to_string(),
            })?;
        let endpoint = self
            .endpoint
            .clone()
            .or_else(|| lookup(provider.endpoint_env()));

        let client = HttpVisionClient::new(
            provider,
            api_key,
            endpoint,
            Duration::from_secs(self.request_timeout_secs),
            Duration::from_secs(self.connect_timeout_secs),
        )?;
        Ok(Arc::new(client))
    }
}

/// Non-empty environment variable.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn provider(mut self, provider: Provider) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = Some(url.into());
        self
    }

    pub fn client(mut self, client: Arc<dyn VisionClient>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_width(mut self, px: u32) -> Self {
        self.config.max_width = Some(px);
        self
    }

    pub fn max_height(mut self, px: u32) -> Self {
        self.config.max_height = Some(px);
        self
    }

    pub fn quality(mut self, q: u8) -> Self {
        self.config.quality = q.clamp(1, 100);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f64) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn overwrite(mut self, v: bool) -> Self {
        self.config.overwrite = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, InvoiceError> {
        let c = &self.config;
        if !(1..=100).contains(&c.quality) {
            return Err(InvoiceError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.quality
            )));
        }
        if c.max_width == Some(0) || c.max_height == Some(0) {
            return Err(InvoiceError::InvalidConfig(
                "Maximum width/height must be ≥ 1 pixel".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(InvoiceError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.request_timeout_secs == 0 || c.connect_timeout_secs == 0 {
            return Err(InvoiceError::InvalidConfig("Timeouts must be ≥ 1 second".into()));
        }
        if c.concurrency == 0 {
            return Err(InvoiceError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if let Some(ref url) = c.endpoint {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(InvoiceError::InvalidConfig(format!(
                    "Endpoint must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(self.config)
    }
}
