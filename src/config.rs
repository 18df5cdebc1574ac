use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::cli::ProviderArgs;

pub const API_KEY_ENV_VARS: &[&str] = &["NOVEL_TRANSLATOR_API_KEY", "OPENAI_API_KEY"];

const COMPLETION_MODEL_KEYWORDS: &[&str] =
    &["base", "completions", "davinci", "curie", "babbage", "ada"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Any OpenAI-compatible endpoint.
    #[default]
    Openai,
    /// DeepSeek official API, including the beta prefix/FIM modes.
    Deepseek,
    /// Local Ollama server; no API key required.
    Ollama,
}

impl Provider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Openai => "https://api.siliconflow.cn/v1",
            Self::Deepseek => "https://api.deepseek.com",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Openai => "deepseek-ai/DeepSeek-V3.2",
            Self::Deepseek => "deepseek-chat",
            Self::Ollama => "qwen3:8b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Chat,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeepseekMode {
    #[default]
    Chat,
    /// Chat prefix completion (beta).
    Prefix,
    /// Fill-in-the-middle completion (beta).
    Fim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum GlossaryPlacement {
    #[default]
    System,
    AssistantPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Epub,
    Txt,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Epub => "epub",
            Self::Txt => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub provider: Provider,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// `None` detects the kind from the model name.
    pub model_kind: Option<ModelKind>,
    pub deepseek_mode: DeepseekMode,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
    /// Characters per request; 0 sends each chapter whole.
    pub chunk_size: usize,
    pub workers: usize,
    pub retry_count: u32,
    pub context_lines: usize,
    pub stream: bool,
    pub custom_prompt: Option<String>,
    pub few_shot_examples: Option<String>,
    pub glossary_file: Option<PathBuf>,
    pub glossary_placement: GlossaryPlacement,
    /// 1-based inclusive chapter range; 0 leaves that end open.
    pub start_chapter: usize,
    pub end_chapter: usize,
    pub output_format: OutputFormat,
    pub request_timeout_secs: u64,
    pub backoff_unit_ms: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: None,
            base_url: None,
            model: None,
            model_kind: None,
            deepseek_mode: DeepseekMode::default(),
            temperature: 0.7,
            top_p: 0.9,
            frequency_penalty: 0.1,
            presence_penalty: 0.0,
            max_tokens: 8192,
            chunk_size: 1500,
            workers: 1,
            retry_count: 3,
            context_lines: 5,
            stream: false,
            custom_prompt: None,
            few_shot_examples: None,
            glossary_file: None,
            glossary_placement: GlossaryPlacement::default(),
            start_chapter: 0,
            end_chapter: 0,
            output_format: OutputFormat::default(),
            request_timeout_secs: 300,
            backoff_unit_ms: 1000,
        }
    }
}

impl TranslationConfig {
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    /// Defaults, then the optional config file, then flags, then the API key environment.
    pub fn from_args(args: &ProviderArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load_file(Path::new(path))?,
            None => Self::default(),
        };
        config.apply_args(args)?;

        if config.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            config.api_key = API_KEY_ENV_VARS
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .filter(|k| !k.trim().is_empty());
        }
        Ok(config)
    }

    fn apply_args(&mut self, args: &ProviderArgs) -> anyhow::Result<()> {
        if let Some(provider) = args.provider {
            self.provider = provider;
        }
        if let Some(api_key) = &args.api_key {
            self.api_key = Some(api_key.clone());
        }
        if let Some(base_url) = &args.base_url {
            self.base_url = Some(base_url.clone());
        }
        if let Some(model) = &args.model {
            self.model = Some(model.clone());
        }
        if let Some(kind) = args.model_kind {
            self.model_kind = Some(kind);
        }
        if let Some(mode) = args.deepseek_mode {
            self.deepseek_mode = mode;
        }
        if let Some(temperature) = args.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = args.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(chunk_size) = args.chunk_size {
            self.chunk_size = chunk_size;
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(retries) = args.retries {
            self.retry_count = retries;
        }
        if let Some(lines) = args.context_lines {
            self.context_lines = lines;
        }
        if args.stream {
            self.stream = true;
        }
        if let Some(path) = &args.prompt_file {
            let prompt = std::fs::read_to_string(path)
                .with_context(|| format!("read prompt file: {path}"))?;
            self.custom_prompt = Some(prompt);
        }
        if let Some(glossary) = &args.glossary {
            self.glossary_file = Some(PathBuf::from(glossary));
        }
        if let Some(placement) = args.glossary_placement {
            self.glossary_placement = placement;
        }
        if let Some(start) = args.start_chapter {
            self.start_chapter = start;
        }
        if let Some(end) = args.end_chapter {
            self.end_chapter = end;
        }
        if let Some(format) = args.format {
            self.output_format = format;
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        match self.model.as_deref().map(str::trim) {
            Some(model) if !model.is_empty() => model,
            _ => self.provider.default_model(),
        }
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model_kind
            .unwrap_or_else(|| detect_model_kind(self.model()))
    }

    /// Whether DeepSeek beta continuation modes are active.
    pub fn uses_deepseek_beta(&self) -> bool {
        self.provider == Provider::Deepseek && self.deepseek_mode != DeepseekMode::Chat
    }

    pub fn base_url(&self) -> String {
        if let Some(url) = self.base_url.as_deref().map(str::trim)
            && !url.is_empty()
        {
            return url.trim_end_matches('/').to_owned();
        }
        if self.uses_deepseek_beta() {
            return "https://api.deepseek.com/beta".to_owned();
        }
        self.provider.default_base_url().to_owned()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    /// 0-based, end-exclusive chapter indices selected out of `total`.
    pub fn chapter_range(&self, total: usize) -> Range<usize> {
        let start = self.start_chapter.saturating_sub(1).min(total);
        let end = if self.end_chapter == 0 {
            total
        } else {
            self.end_chapter.min(total)
        };
        start..end.max(start)
    }

    /// Fatal configuration checks, run before any translation work.
    pub fn validate(&self) -> anyhow::Result<()> {
        let has_key = self
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key && self.provider != Provider::Ollama {
            anyhow::bail!(
                "API key is required: pass --api-key or set {}",
                API_KEY_ENV_VARS.join(" / ")
            );
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be >= 1");
        }

        if self.start_chapter > 0 && self.end_chapter > 0 && self.end_chapter < self.start_chapter
        {
            anyhow::bail!(
                "invalid chapter range: end chapter {} is before start chapter {}",
                self.end_chapter,
                self.start_chapter
            );
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("temperature must be within 0.0..=2.0: {}", self.temperature);
        }

        let base_url = self.base_url();
        let parsed = url::Url::parse(&base_url)
            .with_context(|| format!("invalid base url: {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("base url must be http/https: {base_url}");
        }

        Ok(())
    }
}

/// Completion-only names are recognized by keyword; everything else is a chat model.
pub fn detect_model_kind(model: &str) -> ModelKind {
    let lower = model.to_ascii_lowercase();
    if COMPLETION_MODEL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return ModelKind::Completion;
    }
    ModelKind::Chat
}
