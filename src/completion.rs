use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Receives incremental text while a streamed completion is in flight.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_content: String,
    pub assistant_prefix: Option<String>,
    /// Whether provider prefix/FIM continuation modes may be used for this request.
    pub allow_prefix: bool,
    pub on_delta: Option<DeltaSink>,
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("system_prompt_chars", &self.system_prompt.chars().count())
            .field("user_content_chars", &self.user_content.chars().count())
            .field("assistant_prefix", &self.assistant_prefix.is_some())
            .field("allow_prefix", &self.allow_prefix)
            .field("stream", &self.on_delta.is_some())
            .finish()
    }
}

/// Outcome of one completion call. Retry decisions are made by matching on this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Ok(String),
    Retryable {
        detail: String,
        retry_after: Option<Duration>,
    },
    Terminal {
        detail: String,
    },
}

impl CompletionResult {
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::Retryable {
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn terminal(detail: impl Into<String>) -> Self {
        Self::Terminal {
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Completion: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> CompletionResult;

    /// Sends a minimal request and returns a short sample of the reply.
    async fn test_connection(&self) -> anyhow::Result<String>;
}

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || (500..=599).contains(&status)
}

pub fn describe_status(status: u16) -> Option<&'static str> {
    let description = match status {
        400 => "请求格式错误",
        401 => "认证失败(Key无效)",
        402 => "余额不足",
        403 => "权限不足",
        404 => "模型/端点不存在",
        429 => "请求限速(触发速率限制)",
        500 => "服务器内部错误",
        502 => "网关错误",
        503 => "服务暂不可用",
        _ => return None,
    };
    Some(description)
}
