use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use crate::completion::{Completion, CompletionResult, DeltaSink};
use crate::config::TranslationConfig;
use crate::context;
use crate::control::{ProgressEvent, TaskControl};
use crate::prompt::PromptBuilder;
use crate::sanitize;

pub const CANCELLED_MARKER: &str = "[翻译已取消]";
const FAILURE_MARKER_PREFIX: &str = "[翻译失败: ";

/// Always a single line, so it occupies exactly one paragraph slot on reassembly.
pub fn failure_marker(detail: &str) -> String {
    let detail = detail.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{FAILURE_MARKER_PREFIX}{detail}]")
}

/// Whether a chunk result is a failure or cancellation marker rather than a translation.
pub fn is_marker(text: &str) -> bool {
    let text = text.trim();
    text == CANCELLED_MARKER || (text.starts_with(FAILURE_MARKER_PREFIX) && text.ends_with(']'))
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub retry_count: u32,
    pub context_lines: usize,
    pub backoff_unit: Duration,
    pub stream: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &TranslationConfig) -> Self {
        Self {
            workers: config.workers,
            retry_count: config.retry_count,
            context_lines: config.context_lines,
            backoff_unit: config.backoff_unit(),
            stream: config.stream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Translated(String),
    Failed { detail: String },
    Cancelled,
}

impl ChunkOutcome {
    pub fn into_text(self) -> String {
        match self {
            Self::Translated(text) => text,
            Self::Failed { detail } => failure_marker(&detail),
            Self::Cancelled => CANCELLED_MARKER.to_owned(),
        }
    }

    fn translated_chars(&self) -> Option<usize> {
        match self {
            Self::Translated(text) => Some(text.chars().count()),
            _ => None,
        }
    }
}

/// Per-chunk results in input order, with failures already replaced by markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub texts: Vec<String>,
    pub failed: usize,
    pub cancelled: usize,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.texts.len() - self.failed - self.cancelled
    }

    pub fn joined(&self) -> String {
        self.texts.join("\n")
    }
}

/// Backoff before retry number `attempt` (1-based), raised to any server hint.
pub fn backoff_delay(unit: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let delay = unit.saturating_mul(2 * attempt);
    match retry_after {
        Some(hint) => delay.max(hint),
        None => delay,
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    completion: Arc<dyn Completion>,
    prompts: Arc<PromptBuilder>,
    settings: DispatchSettings,
    control: TaskControl,
}

impl Dispatcher {
    pub fn new(
        completion: Arc<dyn Completion>,
        prompts: Arc<PromptBuilder>,
        settings: DispatchSettings,
        control: TaskControl,
    ) -> Self {
        Self {
            completion,
            prompts,
            settings,
            control,
        }
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Translates every chunk. `previous_translation` seeds the context of the first chunk.
    pub async fn translate_chunks(
        &self,
        chunks: &[String],
        previous_translation: &str,
    ) -> anyhow::Result<DispatchReport> {
        let context = context::tail(previous_translation, self.settings.context_lines);
        let workers = self.settings.workers.max(1).min(chunks.len().max(1));
        self.control.add_chunks(chunks.len());
        tracing::debug!(
            chunks = chunks.len(),
            workers = workers,
            retries = self.settings.retry_count,
            "dispatch: start"
        );

        let outcomes = if workers == 1 {
            self.run_sequential(chunks, context).await
        } else {
            self.run_batched(chunks, context, workers).await?
        };

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Failed { .. } => report.failed += 1,
                ChunkOutcome::Cancelled => report.cancelled += 1,
                ChunkOutcome::Translated(_) => {}
            }
            report.texts.push(outcome.into_text());
        }
        if report.failed > 0 {
            tracing::warn!(
                failed = report.failed,
                total = chunks.len(),
                "dispatch: completed with failures; output contains failure markers"
            );
        }
        Ok(report)
    }

    async fn run_sequential(&self, chunks: &[String], mut context: String) -> Vec<ChunkOutcome> {
        let mut progress = ProgressLog::new(chunks.len());
        let mut outcomes = Vec::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            if self.control.is_cancelled() {
                outcomes.resize(chunks.len(), ChunkOutcome::Cancelled);
                break;
            }
            let outcome = self.translate_chunk(chunk_index, chunk, &context).await;
            if let ChunkOutcome::Translated(text) = &outcome {
                context = context::tail(text, self.settings.context_lines);
            }
            self.finish_chunk(chunk_index, &outcome, &mut progress);
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_batched(
        &self,
        chunks: &[String],
        mut context: String,
        workers: usize,
    ) -> anyhow::Result<Vec<ChunkOutcome>> {
        let mut progress = ProgressLog::new(chunks.len());
        let mut results: Vec<Option<ChunkOutcome>> = vec![None; chunks.len()];

        for batch_start in (0..chunks.len()).step_by(workers) {
            if self.control.is_cancelled() {
                break;
            }
            let batch_end = (batch_start + workers).min(chunks.len());
            let mut join_set = tokio::task::JoinSet::new();
            for chunk_index in batch_start..batch_end {
                let this = self.clone();
                let chunk = chunks[chunk_index].clone();
                // Only the head of a batch sees the previous batch's tail.
                let chunk_context = if chunk_index == batch_start {
                    context.clone()
                } else {
                    String::new()
                };
                join_set.spawn(async move {
                    let outcome = this
                        .translate_chunk(chunk_index, &chunk, &chunk_context)
                        .await;
                    (chunk_index, outcome)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (chunk_index, outcome) = joined.context("join chunk translation task")?;
                self.finish_chunk(chunk_index, &outcome, &mut progress);
                results[chunk_index] = Some(outcome);
            }

            // A failed or cancelled batch tail leaves the last good context in place.
            if let Some(Some(ChunkOutcome::Translated(text))) = results.get(batch_end - 1) {
                context = context::tail(text, self.settings.context_lines);
            }
        }

        Ok(results
            .into_iter()
            .map(|item| item.unwrap_or(ChunkOutcome::Cancelled))
            .collect())
    }

    fn finish_chunk(&self, chunk_index: usize, outcome: &ChunkOutcome, progress: &mut ProgressLog) {
        let snapshot = self.control.record_chunk(outcome.translated_chars());
        let ok = matches!(outcome, ChunkOutcome::Translated(_));
        if let ChunkOutcome::Failed { detail } = outcome {
            tracing::warn!(chunk_index = chunk_index, error = %detail, "chunk translation failed");
        }
        self.control.emit(ProgressEvent::ChunkFinished {
            chunk_index,
            ok,
            snapshot,
        });
        progress.record(ok);
    }

    /// Drives one chunk through retries, sanitizing and the echo fallback.
    pub async fn translate_chunk(&self, chunk_index: usize, text: &str, context: &str) -> ChunkOutcome {
        if text.trim().is_empty() {
            return ChunkOutcome::Translated(String::new());
        }

        let max_attempts = self.settings.retry_count.max(1);
        let mut failures = 0u32;
        let mut allow_prefix = true;
        let mut fallback_used = false;

        loop {
            if !self.control.wait_if_paused().await {
                return ChunkOutcome::Cancelled;
            }

            let mut request = self.prompts.request(text, context, allow_prefix);
            request.on_delta = self.delta_sink(chunk_index);
            tracing::debug!(chunk_index = chunk_index, ?request, "translate chunk");
            let result = self.completion.complete(&request).await;
            if self.control.is_cancelled() {
                return ChunkOutcome::Cancelled;
            }

            match result {
                CompletionResult::Ok(raw) => {
                    let cleaned = sanitize::clean(&raw, text);
                    let Some(reason) = sanitize::looks_like_echo(&cleaned, text) else {
                        return ChunkOutcome::Translated(cleaned);
                    };
                    if fallback_used {
                        tracing::warn!(
                            chunk_index = chunk_index,
                            reason = %reason,
                            "output still looks like source echo after fallback; accepting it"
                        );
                        return ChunkOutcome::Translated(cleaned);
                    }
                    tracing::warn!(
                        chunk_index = chunk_index,
                        reason = %reason,
                        "output looks like source echo; retrying without prefix mode"
                    );
                    self.control.emit(ProgressEvent::LeakageFallback {
                        chunk_index,
                        reason: reason.to_string(),
                    });
                    fallback_used = true;
                    allow_prefix = false;
                }
                CompletionResult::Terminal { detail } => {
                    return ChunkOutcome::Failed { detail };
                }
                CompletionResult::Retryable {
                    detail,
                    retry_after,
                } => {
                    failures += 1;
                    if failures >= max_attempts {
                        return ChunkOutcome::Failed { detail };
                    }
                    let wait = backoff_delay(self.settings.backoff_unit, failures, retry_after);
                    tracing::warn!(
                        chunk_index = chunk_index,
                        attempt = failures,
                        max_attempts = max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %detail,
                        "chunk request failed; retrying"
                    );
                    self.control.emit(ProgressEvent::ChunkRetry {
                        chunk_index,
                        attempt: failures,
                        max_attempts,
                        detail,
                        wait,
                    });
                    if !self.control.sleep(wait).await {
                        return ChunkOutcome::Cancelled;
                    }
                }
            }
        }
    }

    fn delta_sink(&self, chunk_index: usize) -> Option<DeltaSink> {
        if !self.settings.stream {
            return None;
        }
        let control = self.control.clone();
        Some(Arc::new(move |delta: &str| {
            control.emit(ProgressEvent::StreamDelta {
                chunk_index,
                text: delta.to_owned(),
            });
        }))
    }
}

struct ProgressLog {
    total: usize,
    done: usize,
    failed: usize,
    started_at: Instant,
    last_log_at: Instant,
}

impl ProgressLog {
    fn new(total: usize) -> Self {
        let now = Instant::now();
        Self {
            total,
            done: 0,
            failed: 0,
            started_at: now,
            last_log_at: now,
        }
    }

    fn record(&mut self, ok: bool) {
        self.done += 1;
        if !ok {
            self.failed += 1;
        }
        if self.done == self.total || self.last_log_at.elapsed() >= Duration::from_secs(2) {
            tracing::info!(
                done = self.done,
                total = self.total,
                failed = self.failed,
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "translate: progress"
            );
            self.last_log_at = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::completion::CompletionRequest;
    use crate::config::{GlossaryPlacement, ModelKind};
    use crate::control::task_channel;
    use crate::glossary::Glossary;
    use crate::prompt::SOURCE_HEADER;

    type Reply = dyn Fn(&CompletionRequest, usize) -> CompletionResult + Send + Sync;

    #[derive(Debug, Clone)]
    struct Call {
        user_content: String,
        allow_prefix: bool,
    }

    struct ScriptedCompletion {
        reply: Box<Reply>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedCompletion {
        fn new(
            reply: impl Fn(&CompletionRequest, usize) -> CompletionResult + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                reply: Box::new(reply),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl Completion for ScriptedCompletion {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
            let call_no = {
                let mut calls = self.calls.lock().expect("calls lock");
                calls.push(Call {
                    user_content: request.user_content.clone(),
                    allow_prefix: request.allow_prefix,
                });
                calls.len()
            };
            (self.reply)(request, call_no)
        }

        async fn test_connection(&self) -> anyhow::Result<String> {
            Ok("ok".to_owned())
        }
    }

    fn source_of(request: &CompletionRequest) -> &str {
        match request.user_content.split_once(SOURCE_HEADER) {
            Some((_, source)) => source.trim(),
            None => request.user_content.trim(),
        }
    }

    fn chunk_number(request: &CompletionRequest) -> usize {
        source_of(request)
            .trim_start_matches('第')
            .split('段')
            .next()
            .and_then(|n| n.parse().ok())
            .expect("chunk number in source")
    }

    fn source_chunks(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("第{i}段の本文です。")).collect()
    }

    fn settings(workers: usize) -> DispatchSettings {
        DispatchSettings {
            workers,
            retry_count: 3,
            context_lines: 5,
            backoff_unit: Duration::ZERO,
            stream: false,
        }
    }

    fn dispatcher(
        completion: Arc<dyn Completion>,
        settings: DispatchSettings,
        control: TaskControl,
    ) -> Dispatcher {
        let prompts = PromptBuilder::new(
            None,
            Glossary::default(),
            GlossaryPlacement::System,
            ModelKind::Chat,
            None,
        );
        Dispatcher::new(completion, Arc::new(prompts), settings, control)
    }

    #[tokio::test]
    async fn concurrent_results_keep_input_order_and_mark_failures() {
        let completion = ScriptedCompletion::new(|request, _| {
            let n = chunk_number(request);
            if n == 7 {
                CompletionResult::retryable("HTTP 503")
            } else {
                CompletionResult::Ok(format!("第{n}段的正文。"))
            }
        });
        let (handle, control, _events) = task_channel();
        let dispatcher = dispatcher(completion.clone(), settings(4), control);

        let report = dispatcher
            .translate_chunks(&source_chunks(10), "")
            .await
            .expect("dispatch");

        assert_eq!(report.texts.len(), 10);
        for (i, text) in report.texts.iter().enumerate() {
            if i == 7 {
                assert_eq!(text, "[翻译失败: HTTP 503]");
            } else {
                assert_eq!(text, &format!("第{i}段的正文。"));
            }
        }
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded(), 9);

        let chunk_7_calls = completion
            .calls()
            .iter()
            .filter(|call| call.user_content.contains("第7段"))
            .count();
        assert_eq!(chunk_7_calls, 3);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.chunks_done, 10);
        assert_eq!(snapshot.chunks_total, 10);
    }

    #[tokio::test]
    async fn sequential_mode_threads_context_between_chunks() {
        let completion = ScriptedCompletion::new(|request, _| {
            CompletionResult::Ok(format!("第{}段的正文。", chunk_number(request)))
        });
        let dispatcher = dispatcher(completion.clone(), settings(1), TaskControl::detached());

        dispatcher
            .translate_chunks(&source_chunks(3), "")
            .await
            .expect("dispatch");

        let calls = completion.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].user_content, "第0段の本文です。");
        assert!(calls[1].user_content.contains("第0段的正文。"));
        assert!(calls[2].user_content.contains("第1段的正文。"));
    }

    #[tokio::test]
    async fn batches_seed_only_their_first_chunk() {
        let completion = ScriptedCompletion::new(|request, _| {
            CompletionResult::Ok(format!("第{}段的正文。", chunk_number(request)))
        });
        let dispatcher = dispatcher(completion.clone(), settings(2), TaskControl::detached());

        dispatcher
            .translate_chunks(&source_chunks(4), "上一章的结尾。")
            .await
            .expect("dispatch");

        let calls = completion.calls();
        let request_for = |n: usize| {
            calls
                .iter()
                .find(|call| call.user_content.contains(&format!("第{n}段の")))
                .expect("call for chunk")
                .user_content
                .clone()
        };
        assert!(request_for(0).contains("上一章的结尾。"));
        assert_eq!(request_for(1), "第1段の本文です。");
        assert!(request_for(2).contains("第1段的正文。"));
        assert_eq!(request_for(3), "第3段の本文です。");
    }

    #[tokio::test]
    async fn failed_batch_tail_keeps_earlier_context() {
        let completion = ScriptedCompletion::new(|request, _| match chunk_number(request) {
            3 => CompletionResult::terminal("HTTP 401 认证失败(Key无效)"),
            n => CompletionResult::Ok(format!("第{n}段的正文。")),
        });
        let dispatcher = dispatcher(completion.clone(), settings(2), TaskControl::detached());

        let report = dispatcher
            .translate_chunks(&source_chunks(5), "上一章的结尾。")
            .await
            .expect("dispatch");

        assert_eq!(report.texts[3], "[翻译失败: HTTP 401 认证失败(Key无效)]");
        let calls = completion.calls();
        let chunk_3_calls = calls
            .iter()
            .filter(|call| call.user_content.contains("第3段"))
            .count();
        assert_eq!(chunk_3_calls, 1);
        let request_for = |n: usize| {
            calls
                .iter()
                .find(|call| call.user_content.contains(&format!("第{n}段の")))
                .expect("call for chunk")
                .user_content
                .clone()
        };
        // Batch [2, 3] ended in a failure, so chunk 4 still sees the tail of batch [0, 1].
        assert!(request_for(2).contains("第1段的正文。"));
        let last = request_for(4);
        assert!(last.contains("第1段的正文。"));
        assert!(!last.contains("第2段的正文。"));
        assert!(!last.contains("上一章的结尾。"));
    }

    #[tokio::test]
    async fn echoed_output_gets_one_fallback_without_prefix() {
        let echo = "彼はゆっくりと歩き出した。そして二度と振り返らなかった。";
        let completion = ScriptedCompletion::new(move |_, call_no| {
            if call_no == 1 {
                CompletionResult::Ok(echo.to_owned())
            } else {
                CompletionResult::Ok("他慢慢迈开脚步，再也没有回头。".to_owned())
            }
        });
        let dispatcher = dispatcher(completion.clone(), settings(1), TaskControl::detached());

        let outcome = dispatcher
            .translate_chunk(0, "第0段の本文です。", "")
            .await;

        assert_eq!(
            outcome,
            ChunkOutcome::Translated("他慢慢迈开脚步，再也没有回头。".to_owned())
        );
        let calls = completion.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].allow_prefix);
        assert!(!calls[1].allow_prefix);
    }

    #[tokio::test]
    async fn fallback_result_is_accepted_even_if_flagged() {
        let echo = "彼はゆっくりと歩き出した。そして二度と振り返らなかった。";
        let completion = ScriptedCompletion::new(move |_, _| CompletionResult::Ok(echo.to_owned()));
        let dispatcher = dispatcher(completion.clone(), settings(1), TaskControl::detached());

        let outcome = dispatcher
            .translate_chunk(0, "第0段の本文です。", "")
            .await;

        assert!(matches!(outcome, ChunkOutcome::Translated(_)));
        assert_eq!(completion.calls().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_task_sends_nothing() {
        let completion =
            ScriptedCompletion::new(|_, _| CompletionResult::Ok("译文".to_owned()));
        let (handle, control, _events) = task_channel();
        handle.cancel();
        let dispatcher = dispatcher(completion.clone(), settings(2), control);

        let report = dispatcher
            .translate_chunks(&source_chunks(3), "")
            .await
            .expect("dispatch");

        assert_eq!(report.cancelled, 3);
        assert!(report.texts.iter().all(|text| text == CANCELLED_MARKER));
        assert!(completion.calls().is_empty());
    }

    #[tokio::test]
    async fn paused_task_waits_for_resume() {
        let completion =
            ScriptedCompletion::new(|_, _| CompletionResult::Ok("译文".to_owned()));
        let (handle, control, _events) = task_channel();
        handle.pause();
        let dispatcher = dispatcher(completion.clone(), settings(1), control);

        let task = tokio::spawn(async move {
            dispatcher
                .translate_chunks(&source_chunks(1), "")
                .await
                .expect("dispatch")
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(completion.calls().is_empty());

        handle.resume();
        let report = task.await.expect("join dispatch");
        assert_eq!(report.texts, vec!["译文".to_owned()]);
    }

    #[tokio::test]
    async fn streaming_forwards_deltas_as_events() {
        let completion = ScriptedCompletion::new(|request, _| {
            if let Some(sink) = &request.on_delta {
                sink("译");
                sink("文");
            }
            CompletionResult::Ok("译文".to_owned())
        });
        let (_handle, control, mut events) = task_channel();
        let mut settings = settings(1);
        settings.stream = true;
        let dispatcher = dispatcher(completion, settings, control);

        dispatcher.translate_chunk(0, "本文", "").await;

        let mut deltas = String::new();
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::StreamDelta { text, .. } = event {
                deltas.push_str(&text);
            }
        }
        assert_eq!(deltas, "译文");
    }

    #[test]
    fn backoff_grows_and_honors_retry_after() {
        let unit = Duration::from_secs(1);
        assert_eq!(backoff_delay(unit, 1, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(unit, 2, None), Duration::from_secs(4));
        assert_eq!(
            backoff_delay(unit, 1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn markers_are_recognized() {
        assert!(is_marker("[翻译失败: HTTP 500]"));
        assert!(is_marker(CANCELLED_MARKER));
        assert!(!is_marker("[注意] 正文"));
    }

    #[test]
    fn failure_marker_stays_on_one_line() {
        let marker = failure_marker("HTTP 502 | <html>\n<body>\nBad gateway</body>\n</html>");
        assert!(!marker.contains('\n'));
        assert_eq!(marker, "[翻译失败: HTTP 502 | <html> <body> Bad gateway</body> </html>]");
        assert!(is_marker(&marker));
    }
}
