use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;

use crate::completion::{Completion, CompletionRequest, CompletionResult, describe_status};
use crate::config::{DeepseekMode, ModelKind, Provider, TranslationConfig};

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think block regex"));

const ERROR_DETAIL_MAX_CHARS: usize = 200;

pub fn chat_completions_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/chat/completions")
}

pub fn completions_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/completions")
}

/// How a single request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestMode {
    Chat,
    /// DeepSeek chat prefix completion.
    Prefix,
    /// DeepSeek fill-in-the-middle completion.
    Fim,
    Completion,
}

impl RequestMode {
    fn uses_completions_endpoint(self) -> bool {
        matches!(self, Self::Fim | Self::Completion)
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub model_kind: ModelKind,
    pub deepseek_mode: Option<DeepseekMode>,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub timeout: Duration,
}

impl OpenAiSettings {
    pub fn from_config(config: &TranslationConfig) -> Self {
        let deepseek_mode = (config.provider == Provider::Deepseek).then_some(config.deepseek_mode);
        Self {
            base_url: config.base_url(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model().to_owned(),
            model_kind: config.model_kind(),
            deepseek_mode,
            temperature: config.temperature,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            max_tokens: config.max_tokens,
            stream: config.stream,
            timeout: config.request_timeout(),
        }
    }
}

/// Client for any OpenAI-compatible API (OpenAI, SiliconFlow, DeepSeek, Ollama, ...).
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    client: reqwest::Client,
    settings: OpenAiSettings,
    name: String,
}

impl OpenAiCompatible {
    pub fn new(settings: OpenAiSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("build http client")?;
        let name = format!("openai-compatible:{}", settings.model);
        Ok(Self {
            client,
            settings,
            name,
        })
    }

    pub fn from_config(config: &TranslationConfig) -> anyhow::Result<Self> {
        Self::new(OpenAiSettings::from_config(config))
    }

    fn mode_for(&self, request: &CompletionRequest) -> RequestMode {
        if self.settings.model_kind == ModelKind::Completion {
            return RequestMode::Completion;
        }
        match self.settings.deepseek_mode {
            Some(DeepseekMode::Prefix) if request.allow_prefix => RequestMode::Prefix,
            Some(DeepseekMode::Fim) if request.allow_prefix => RequestMode::Fim,
            _ => RequestMode::Chat,
        }
    }

    async fn send(
        &self,
        mode: RequestMode,
        request: &CompletionRequest,
        max_tokens: u32,
        stream: bool,
    ) -> CompletionResult {
        let endpoint = if mode.uses_completions_endpoint() {
            completions_endpoint(&self.settings.base_url)
        } else {
            chat_completions_endpoint(&self.settings.base_url)
        };
        let body = request_body(&self.settings, mode, request, max_tokens, stream);

        let mut builder = self.client.post(&endpoint).json(&body);
        if let Some(api_key) = &self.settings.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return classify_transport_error(&endpoint, &err),
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let request_id = response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let raw = response.text().await.unwrap_or_default();
            let detail = format_api_error(status.as_u16(), &raw, request_id.as_deref());
            if crate::completion::is_retryable_status(status.as_u16()) {
                return CompletionResult::Retryable {
                    detail,
                    retry_after,
                };
            }
            return CompletionResult::Terminal { detail };
        }

        let text = if stream {
            match read_stream(response, mode, request).await {
                Ok(text) => text,
                Err(err) => return CompletionResult::retryable(format!("{err:#}")),
            }
        } else {
            let raw = match response.text().await {
                Ok(raw) => raw,
                Err(err) => {
                    return CompletionResult::retryable(format!("read response body: {err}"));
                }
            };
            match extract_text(&raw, mode) {
                Ok(text) => text,
                Err(err) => return CompletionResult::retryable(format!("{err:#}")),
            }
        };

        let text = strip_think_blocks(&text);
        if text.is_empty() {
            return CompletionResult::retryable("empty completion");
        }
        CompletionResult::Ok(text)
    }
}

#[async_trait]
impl Completion for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        let mode = self.mode_for(request);
        tracing::trace!(?mode, ?request, "send completion request");
        self.send(mode, request, self.settings.max_tokens, self.settings.stream)
            .await
    }

    async fn test_connection(&self) -> anyhow::Result<String> {
        let request = CompletionRequest {
            user_content: "你好".to_owned(),
            ..Default::default()
        };
        let mode = if self.settings.model_kind == ModelKind::Completion {
            RequestMode::Completion
        } else {
            RequestMode::Chat
        };
        match self.send(mode, &request, 16, false).await {
            CompletionResult::Ok(text) => Ok(text.chars().take(50).collect()),
            CompletionResult::Retryable { detail, .. } | CompletionResult::Terminal { detail } => {
                anyhow::bail!("connection test failed ({}): {detail}", self.settings.base_url)
            }
        }
    }
}

fn request_body(
    settings: &OpenAiSettings,
    mode: RequestMode,
    request: &CompletionRequest,
    max_tokens: u32,
    stream: bool,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": settings.model,
        "temperature": settings.temperature,
        "top_p": settings.top_p,
        "frequency_penalty": settings.frequency_penalty,
        "presence_penalty": settings.presence_penalty,
        "max_tokens": max_tokens,
        "stream": stream,
    });

    let prefix = request
        .assistant_prefix
        .as_deref()
        .filter(|p| !p.trim().is_empty());

    let extra = match mode {
        RequestMode::Chat => {
            // Without a continuation mode the prefix has nowhere to go but the system prompt.
            let system = join_nonempty(&[request.system_prompt.as_str(), prefix.unwrap_or("")]);
            let mut messages = Vec::new();
            if !system.is_empty() {
                messages.push(serde_json::json!({ "role": "system", "content": system }));
            }
            messages.push(serde_json::json!({ "role": "user", "content": request.user_content }));
            serde_json::json!({ "messages": messages })
        }
        RequestMode::Prefix => {
            let mut messages = Vec::new();
            if !request.system_prompt.is_empty() {
                messages.push(
                    serde_json::json!({ "role": "system", "content": request.system_prompt }),
                );
            }
            messages.push(serde_json::json!({ "role": "user", "content": request.user_content }));
            if let Some(prefix) = prefix {
                messages.push(serde_json::json!({ "role": "assistant", "content": prefix }));
            }
            // Only the final message may carry `prefix: true`.
            messages.push(serde_json::json!({ "role": "assistant", "content": "", "prefix": true }));
            serde_json::json!({ "messages": messages })
        }
        RequestMode::Fim => {
            let head = join_nonempty(&[request.system_prompt.as_str(), prefix.unwrap_or("")]);
            let prompt = format!("{head}\n\n[原文]\n{}\n\n[译文]\n", request.user_content);
            serde_json::json!({ "prompt": prompt, "suffix": "" })
        }
        RequestMode::Completion => {
            let prompt = join_nonempty(&[
                request.system_prompt.as_str(),
                prefix.unwrap_or(""),
                request.user_content.as_str(),
            ]);
            serde_json::json!({ "prompt": prompt })
        }
    };

    if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            obj.insert(key.clone(), value.clone());
        }
    }
    body
}

fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn classify_transport_error(endpoint: &str, err: &reqwest::Error) -> CompletionResult {
    let detail = if err.is_timeout() {
        format!("[Timeout] POST {endpoint}: {err}")
    } else if err.is_connect() {
        format!("[ConnectionError] POST {endpoint}: {err}")
    } else {
        format!("[RequestError] POST {endpoint}: {err}")
    };
    if err.is_builder() {
        return CompletionResult::Terminal { detail };
    }
    CompletionResult::retryable(detail)
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs = raw.trim().parse::<f64>().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Human-readable description of a failed API call: status, error type, message, request id.
pub fn format_api_error(status: u16, raw_body: &str, request_id: Option<&str>) -> String {
    let mut parts = Vec::new();
    match describe_status(status) {
        Some(description) => parts.push(format!("HTTP {status} ({description})")),
        None => parts.push(format!("HTTP {status}")),
    }

    match serde_json::from_str::<serde_json::Value>(raw_body) {
        Ok(value) => {
            let error = value.get("error");
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(|v| v.as_str())
                    .or_else(|| error.and_then(|e| e.get(name)).and_then(|v| v.as_str()))
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
            };
            if let Some(kind) = field("type") {
                parts.push(format!("类型={kind}"));
            }
            if let Some(message) = field("message").or_else(|| {
                error
                    .and_then(|e| e.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
            }) {
                parts.push(truncate_chars(&message, ERROR_DETAIL_MAX_CHARS));
            }
        }
        Err(_) => {
            let raw = raw_body.trim();
            if !raw.is_empty() {
                parts.push(truncate_chars(raw, ERROR_DETAIL_MAX_CHARS));
            }
        }
    }

    if let Some(request_id) = request_id.filter(|id| !id.is_empty()) {
        parts.push(format!("请求ID={request_id}"));
    }
    parts.join(" | ")
}

/// First `max_chars` of `input` on a single line.
fn truncate_chars(input: &str, max_chars: usize) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}

fn extract_text(raw: &str, mode: RequestMode) -> anyhow::Result<String> {
    let value: serde_json::Value = serde_json::from_str(raw).context("parse completion response")?;
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .ok_or_else(|| anyhow::anyhow!("missing `choices` in response"))?;

    let text = if mode.uses_completions_endpoint() {
        choice.get("text").and_then(|v| v.as_str())
    } else {
        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
    };
    Ok(text.unwrap_or_default().to_owned())
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str, mode: RequestMode) -> SseEvent {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return SseEvent::Ignore;
    };
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
    else {
        return SseEvent::Ignore;
    };

    let delta = if mode.uses_completions_endpoint() {
        choice.get("text").and_then(|v| v.as_str())
    } else {
        choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .or_else(|| {
                choice
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|v| v.as_str())
            })
    };
    match delta {
        Some(delta) if !delta.is_empty() => SseEvent::Delta(delta.to_owned()),
        _ => SseEvent::Ignore,
    }
}

async fn read_stream(
    mut response: reqwest::Response,
    mode: RequestMode,
    request: &CompletionRequest,
) -> anyhow::Result<String> {
    let mut pending = Vec::new();
    let mut text = String::new();

    'outer: while let Some(bytes) = response.chunk().await.context("read stream chunk")? {
        pending.extend_from_slice(&bytes);
        while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
            let line = pending.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(&line, mode) {
                SseEvent::Delta(delta) => {
                    if let Some(sink) = &request.on_delta {
                        sink(&delta);
                    }
                    text.push_str(&delta);
                }
                SseEvent::Done => break 'outer,
                SseEvent::Ignore => {}
            }
        }
    }

    if let SseEvent::Delta(delta) = parse_sse_line(&String::from_utf8_lossy(&pending), mode) {
        text.push_str(&delta);
    }
    Ok(text)
}

pub fn strip_think_blocks(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_owned()
}
