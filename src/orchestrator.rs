use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use crate::checkpoint::{self, Checkpoint};
use crate::chunk;
use crate::completion::Completion;
use crate::config::{OutputFormat, TranslationConfig};
use crate::control::{ProgressEvent, TaskControl};
use crate::dispatch::{DispatchSettings, Dispatcher, is_marker};
use crate::epub::{ChapterDocument, SourceBook};
use crate::export::{self, OutputChapter};
use crate::glossary::Glossary;
use crate::openai::OpenAiCompatible;
use crate::prompt::PromptBuilder;
use crate::segment;

const PLACEHOLDER_EXCERPT_CHARS: usize = 200;
pub const EMPTY_RESULT_MARKER: &str = "[翻译结果为空，以下为原文节选]";

/// `{input_stem}_translated.{ext}` next to the input.
pub fn default_output_path(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_owned());
    input.with_file_name(format!("{stem}_translated.{}", format.extension()))
}

/// Stand-in text for a chapter whose every chunk came back empty or failed.
pub fn empty_result_placeholder(original: &str) -> String {
    let excerpt = original
        .trim()
        .chars()
        .take(PLACEHOLDER_EXCERPT_CHARS)
        .collect::<String>();
    format!("{EMPTY_RESULT_MARKER}\n{excerpt}")
}

#[derive(Debug, Clone)]
pub struct TranslateJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub force: bool,
    /// Resume from and record into `{output_stem}.checkpoint.json`.
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub translated: usize,
    pub cached: usize,
    pub failed: usize,
    pub chars: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
    pub written: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RetranslateJob {
    pub input: PathBuf,
    pub checkpoint: PathBuf,
    /// Archive paths or bare file names.
    pub chapters: Vec<String>,
    pub output: Option<PathBuf>,
    pub force: bool,
}

/// The translated text of one chapter plus how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterTranslation {
    pub text: String,
    pub failed_chunks: usize,
    /// Every chunk failed or came back blank; `text` is a placeholder.
    pub empty: bool,
    pub cancelled: bool,
}

/// Runs chapters through segmentation, chunking, dispatch and checkpointing.
pub struct Orchestrator {
    config: TranslationConfig,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(
        config: TranslationConfig,
        completion: Arc<dyn Completion>,
        control: TaskControl,
    ) -> anyhow::Result<Self> {
        let glossary = Glossary::load(config.glossary_file.as_deref()).context("load glossary")?;
        if !glossary.is_empty() {
            tracing::info!(terms = glossary.len(), "glossary loaded");
        }
        let prompts = PromptBuilder::new(
            config.custom_prompt.as_deref(),
            glossary,
            config.glossary_placement,
            config.model_kind(),
            config.few_shot_examples.clone(),
        );
        let dispatcher = Dispatcher::new(
            completion,
            Arc::new(prompts),
            DispatchSettings::from_config(&config),
            control,
        );
        Ok(Self { config, dispatcher })
    }

    /// Validates the configuration and connects the OpenAI-compatible provider.
    pub fn from_config(config: TranslationConfig, control: TaskControl) -> anyhow::Result<Self> {
        config.validate()?;
        let completion = OpenAiCompatible::from_config(&config).context("create provider")?;
        tracing::info!(
            provider = completion.name(),
            model = config.model(),
            base_url = %config.base_url(),
            "provider ready"
        );
        Self::new(config, Arc::new(completion), control)
    }

    fn control(&self) -> &TaskControl {
        self.dispatcher.control()
    }

    /// Translates one chapter. `previous` is the translation of the chapter before it;
    /// `index` is 1-based within `total`.
    pub async fn translate_chapter(
        &self,
        chapter: &ChapterDocument,
        previous: &str,
        index: usize,
        total: usize,
    ) -> anyhow::Result<ChapterTranslation> {
        let segmented = segment::segment_chapter(&chapter.html);
        let chunks = chunk::split_text(&segmented.plain_text, self.config.chunk_size);
        self.control().emit(ProgressEvent::ChapterStarted {
            index,
            total,
            name: chapter.name.clone(),
            chunks: chunks.len(),
        });
        tracing::debug!(
            chapter = %chapter.name,
            segments = segmented.segments.len(),
            translatable = segmented.translatable_count(),
            media = segmented.media_count(),
            chunks = chunks.len(),
            "chapter segmented"
        );
        if chunks.is_empty() {
            return Ok(ChapterTranslation {
                text: String::new(),
                failed_chunks: 0,
                empty: false,
                cancelled: false,
            });
        }

        let report = self
            .dispatcher
            .translate_chunks(&chunks, previous)
            .await
            .with_context(|| format!("translate chapter {}", chapter.name))?;
        let cancelled = report.cancelled > 0;
        let has_text = report
            .texts
            .iter()
            .any(|t| !t.trim().is_empty() && !is_marker(t));
        if !has_text && !cancelled {
            tracing::warn!(
                chapter = %chapter.name,
                failed = report.failed,
                "every chunk failed or came back empty; writing a placeholder"
            );
            return Ok(ChapterTranslation {
                text: empty_result_placeholder(&segmented.plain_text),
                failed_chunks: report.failed,
                empty: true,
                cancelled,
            });
        }
        Ok(ChapterTranslation {
            text: report.joined(),
            failed_chunks: report.failed,
            empty: false,
            cancelled,
        })
    }

    /// Translates the selected chapter range of a book and writes the output.
    pub async fn translate_book(&self, job: &TranslateJob) -> anyhow::Result<RunSummary> {
        let started_at = Instant::now();
        if job.output.exists() && !job.force {
            anyhow::bail!(
                "output already exists: {} (pass --force to overwrite)",
                job.output.display()
            );
        }

        let book = open_book(&job.input).await?;
        let range = self.config.chapter_range(book.chapters.len());
        let selected = &book.chapters[range.clone()];
        tracing::info!(
            input = %job.input.display(),
            title = %book.title,
            chapters = book.chapters.len(),
            first = range.start + 1,
            last = range.end,
            format = ?self.config.output_format,
            chunk_size = self.config.chunk_size,
            workers = self.config.workers,
            "translate: start"
        );
        if selected.is_empty() {
            anyhow::bail!(
                "no chapters selected: the book has {} chapters",
                book.chapters.len()
            );
        }

        let control = self.control();
        control.set_chapters_total(selected.len());
        control.emit(ProgressEvent::RunStarted {
            chapters: selected.len(),
        });

        let checkpoint_path = checkpoint::checkpoint_path(&job.output);
        let mut checkpoint = if job.checkpoint {
            let hash = checkpoint::fingerprint(
                &job.input,
                self.config.model(),
                self.config.chunk_size,
            );
            Checkpoint::resume(&checkpoint_path, &hash).await?
        } else {
            Checkpoint::default()
        };

        let mut summary = RunSummary::default();
        let mut outputs = Vec::with_capacity(selected.len());
        let mut previous = String::new();

        for (idx, chapter) in selected.iter().enumerate() {
            if !control.wait_if_paused().await {
                summary.cancelled = true;
                break;
            }

            if let Some(cached) = checkpoint.get(&chapter.name) {
                tracing::info!(
                    chapter = %chapter.name,
                    index = idx + 1,
                    total = selected.len(),
                    "chapter already translated; using checkpoint"
                );
                summary.cached += 1;
                summary.chars += cached.chars().count();
                previous = cached.to_owned();
                outputs.push(OutputChapter {
                    name: chapter.name.clone(),
                    text: cached.to_owned(),
                });
                control.record_chapter();
                control.emit(ProgressEvent::ChapterSkipped {
                    name: chapter.name.clone(),
                });
                continue;
            }

            let chapter_started = Instant::now();
            tracing::info!(
                chapter = %chapter.name,
                index = idx + 1,
                total = selected.len(),
                chars = chapter.char_count(),
                "chapter: start"
            );

            let translation = match self
                .translate_chapter(chapter, &previous, idx + 1, selected.len())
                .await
            {
                Ok(translation) => translation,
                Err(err) => {
                    tracing::error!(chapter = %chapter.name, error = %format!("{err:#}"), "chapter failed");
                    control.emit(ProgressEvent::ChapterFailed {
                        name: chapter.name.clone(),
                        error: format!("{err:#}"),
                    });
                    summary.failed += 1;
                    continue;
                }
            };
            if translation.cancelled {
                summary.cancelled = true;
                break;
            }

            let chars = translation.text.chars().count();
            let elapsed = chapter_started.elapsed();
            if translation.empty {
                summary.failed += 1;
                control.emit(ProgressEvent::ChapterFailed {
                    name: chapter.name.clone(),
                    error: "every chunk failed or came back empty".to_owned(),
                });
            } else {
                summary.translated += 1;
                summary.chars += chars;
                previous = translation.text.clone();
                if job.checkpoint {
                    checkpoint.record(&chapter.name, translation.text.clone());
                    checkpoint.save(&checkpoint_path).await?;
                }
                tracing::info!(
                    chapter = %chapter.name,
                    chars = chars,
                    failed_chunks = translation.failed_chunks,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "chapter: done"
                );
                control.emit(ProgressEvent::ChapterFinished {
                    name: chapter.name.clone(),
                    chars,
                    elapsed,
                });
            }
            control.record_chapter();
            outputs.push(OutputChapter {
                name: chapter.name.clone(),
                text: translation.text,
            });
        }

        if summary.cancelled {
            tracing::warn!(
                done = summary.translated + summary.cached,
                total = selected.len(),
                "translation cancelled; output not written"
            );
        } else if outputs.is_empty() {
            tracing::warn!("no chapters translated; output not written");
        } else {
            write_output_blocking(
                self.config.output_format,
                job.output.clone(),
                book.title.clone(),
                Some(Arc::clone(&book)),
                outputs,
                job.force,
            )
            .await?;
            summary.written = Some(job.output.clone());
        }

        summary.elapsed = started_at.elapsed();
        tracing::info!(
            translated = summary.translated,
            cached = summary.cached,
            failed = summary.failed,
            chars = summary.chars,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            cancelled = summary.cancelled,
            "translate: done"
        );
        control.emit(ProgressEvent::RunFinished {
            chapters: summary.translated + summary.cached,
            chars: summary.chars,
            elapsed: summary.elapsed,
            cancelled: summary.cancelled,
        });
        Ok(summary)
    }

    /// Translates the named chapters again and replaces them in the checkpoint.
    pub async fn retranslate(&self, job: &RetranslateJob) -> anyhow::Result<RunSummary> {
        let started_at = Instant::now();
        let mut checkpoint = Checkpoint::load(&job.checkpoint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {}", job.checkpoint.display()))?;
        if checkpoint.is_empty() {
            anyhow::bail!("checkpoint has no translated chapters: {}", job.checkpoint.display());
        }
        if let Some(output) = &job.output
            && output.exists()
            && !job.force
        {
            anyhow::bail!(
                "output already exists: {} (pass --force to overwrite)",
                output.display()
            );
        }

        let book = open_book(&job.input).await?;
        let mut targets = Vec::new();
        for requested in &job.chapters {
            match book.find_chapter(requested) {
                Some(chapter) if checkpoint.get(&chapter.name).is_some() => {
                    if !targets.iter().any(|c: &&ChapterDocument| c.name == chapter.name) {
                        targets.push(chapter);
                    }
                }
                _ => tracing::warn!(chapter = %requested, "not in both the book and the checkpoint; skipped"),
            }
        }
        if targets.is_empty() {
            anyhow::bail!("none of the requested chapters are in both the book and the checkpoint");
        }

        let control = self.control();
        control.set_chapters_total(targets.len());
        control.emit(ProgressEvent::RunStarted {
            chapters: targets.len(),
        });
        tracing::info!(chapters = targets.len(), "retranslate: start");

        let mut summary = RunSummary::default();
        for (idx, chapter) in targets.iter().enumerate() {
            if !control.wait_if_paused().await {
                summary.cancelled = true;
                break;
            }
            let previous = book
                .chapters
                .iter()
                .position(|c| c.name == chapter.name)
                .and_then(|pos| pos.checked_sub(1))
                .and_then(|pos| checkpoint.get(&book.chapters[pos].name))
                .unwrap_or_default()
                .to_owned();

            let chapter_started = Instant::now();
            let translation = match self
                .translate_chapter(chapter, &previous, idx + 1, targets.len())
                .await
            {
                Ok(translation) => translation,
                Err(err) => {
                    tracing::error!(chapter = %chapter.name, error = %format!("{err:#}"), "chapter failed");
                    control.emit(ProgressEvent::ChapterFailed {
                        name: chapter.name.clone(),
                        error: format!("{err:#}"),
                    });
                    summary.failed += 1;
                    continue;
                }
            };
            if translation.cancelled {
                summary.cancelled = true;
                break;
            }
            if translation.empty {
                summary.failed += 1;
                control.emit(ProgressEvent::ChapterFailed {
                    name: chapter.name.clone(),
                    error: "every chunk failed or came back empty".to_owned(),
                });
                continue;
            }

            let chars = translation.text.chars().count();
            summary.translated += 1;
            summary.chars += chars;
            checkpoint.record(&chapter.name, translation.text);
            control.record_chapter();
            control.emit(ProgressEvent::ChapterFinished {
                name: chapter.name.clone(),
                chars,
                elapsed: chapter_started.elapsed(),
            });
        }

        if summary.translated > 0 {
            checkpoint.save(&job.checkpoint).await?;
            tracing::info!(path = %job.checkpoint.display(), "checkpoint updated");
        }
        if let Some(output) = &job.output
            && !summary.cancelled
        {
            let chapters = book_ordered(&book, &checkpoint);
            write_output_blocking(
                self.config.output_format,
                output.clone(),
                book.title.clone(),
                Some(Arc::clone(&book)),
                chapters,
                job.force,
            )
            .await?;
            summary.written = Some(output.clone());
        }

        summary.elapsed = started_at.elapsed();
        control.emit(ProgressEvent::RunFinished {
            chapters: summary.translated,
            chars: summary.chars,
            elapsed: summary.elapsed,
            cancelled: summary.cancelled,
        });
        tracing::info!(
            translated = summary.translated,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "retranslate: done"
        );
        Ok(summary)
    }
}

/// Checkpointed chapters in the book's reading order.
fn book_ordered(book: &SourceBook, checkpoint: &Checkpoint) -> Vec<OutputChapter> {
    book.chapters
        .iter()
        .filter_map(|chapter| {
            Some(OutputChapter {
                name: chapter.name.clone(),
                text: checkpoint.get(&chapter.name)?.to_owned(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RestoreJob {
    pub checkpoint: PathBuf,
    /// Source book used for structure and ordering, when available.
    pub source: Option<PathBuf>,
    pub output: PathBuf,
    pub format: OutputFormat,
    pub force: bool,
}

/// Rebuilds the output from a checkpoint without calling the provider. Returns the number
/// of chapters written.
pub async fn restore(job: &RestoreJob) -> anyhow::Result<usize> {
    let checkpoint = Checkpoint::load(&job.checkpoint)
        .await?
        .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {}", job.checkpoint.display()))?;
    if checkpoint.is_empty() {
        anyhow::bail!("checkpoint has no translated chapters: {}", job.checkpoint.display());
    }
    tracing::info!(
        path = %job.checkpoint.display(),
        chapters = checkpoint.len(),
        "restore: checkpoint loaded"
    );

    let book = match &job.source {
        Some(source) => match open_book(source).await {
            Ok(book) => Some(book),
            Err(err) => {
                tracing::warn!(
                    source = %source.display(),
                    error = %format!("{err:#}"),
                    "cannot read source book; ordering chapters by file name"
                );
                None
            }
        },
        None => None,
    };

    let (title, chapters) = match &book {
        Some(book) => {
            let chapters = book_ordered(book, &checkpoint);
            let missing = book.chapters.len() - chapters.len();
            if missing > 0 {
                tracing::warn!(missing = missing, "chapters missing from checkpoint; skipped");
            }
            (book.title.clone(), chapters)
        }
        None => {
            let mut chapters = checkpoint
                .chapters()
                .into_iter()
                .map(|(name, text)| OutputChapter {
                    name: name.to_owned(),
                    text: text.to_owned(),
                })
                .collect::<Vec<_>>();
            export::sort_chapters(&mut chapters);
            let title = job
                .output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Book".to_owned());
            (title, chapters)
        }
    };
    if chapters.is_empty() {
        anyhow::bail!("no checkpointed chapters belong to the source book");
    }

    let written = chapters.len();
    write_output_blocking(job.format, job.output.clone(), title, book, chapters, job.force).await?;
    tracing::info!(
        out = %job.output.display(),
        chapters = written,
        "restore: done"
    );
    Ok(written)
}

/// Reads the whole archive on the blocking pool.
async fn open_book(path: &Path) -> anyhow::Result<Arc<SourceBook>> {
    let path = path.to_path_buf();
    let book = tokio::task::spawn_blocking(move || SourceBook::open(&path))
        .await
        .context("join epub reader task")??;
    Ok(Arc::new(book))
}

async fn write_output_blocking(
    format: OutputFormat,
    out_path: PathBuf,
    title: String,
    source: Option<Arc<SourceBook>>,
    chapters: Vec<OutputChapter>,
    force: bool,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || {
        export::write_output(format, &out_path, &title, source.as_deref(), &chapters, force)
    })
    .await
    .context("join output writer task")?
}

/// Keyword to look for in translated chapters, with a note on what it indicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRule {
    pub keyword: String,
    pub hint: String,
}

impl ScanRule {
    /// Parses `keyword=hint`; the hint may be empty.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (keyword, hint) = raw.split_once('=').unwrap_or((raw, ""));
        let keyword = keyword.trim();
        if keyword.is_empty() {
            anyhow::bail!("scan rule has an empty keyword: {raw:?}");
        }
        Ok(Self {
            keyword: keyword.to_owned(),
            hint: hint.trim().to_owned(),
        })
    }
}

/// Loads `{keyword: hint}` rules from a YAML or JSON object, keeping file order.
pub fn load_scan_rules(path: &Path) -> anyhow::Result<Vec<ScanRule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read scan rules: {}", path.display()))?;
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse scan rules: {}", path.display()))?;
    let mut rules = Vec::with_capacity(mapping.len());
    for (keyword, hint) in mapping {
        let Some(keyword) = keyword.as_str().map(str::trim).filter(|k| !k.is_empty()) else {
            anyhow::bail!("scan rule keys must be non-empty strings: {}", path.display());
        };
        let hint = match hint {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::String(hint) => hint,
            other => anyhow::bail!("scan rule hint for {keyword:?} must be a string, got {other:?}"),
        };
        rules.push(ScanRule {
            keyword: keyword.to_owned(),
            hint,
        });
    }
    Ok(rules)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
    pub keyword: String,
    pub count: usize,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterFindings {
    pub chapter: String,
    pub findings: Vec<ScanFinding>,
}

/// Counts rule keywords in every checkpointed chapter. Chapters without hits are omitted.
pub fn scan_checkpoint(checkpoint: &Checkpoint, rules: &[ScanRule]) -> Vec<ChapterFindings> {
    checkpoint
        .chapters()
        .into_iter()
        .filter_map(|(name, text)| {
            let findings = rules
                .iter()
                .filter_map(|rule| {
                    let count = text.matches(rule.keyword.as_str()).count();
                    (count > 0).then(|| ScanFinding {
                        keyword: rule.keyword.clone(),
                        count,
                        hint: rule.hint.clone(),
                    })
                })
                .collect::<Vec<_>>();
            (!findings.is_empty()).then(|| ChapterFindings {
                chapter: name.to_owned(),
                findings,
            })
        })
        .collect()
}

pub async fn scan(checkpoint_path: &Path, rules: &[ScanRule]) -> anyhow::Result<Vec<ChapterFindings>> {
    if rules.is_empty() {
        anyhow::bail!("no scan rules given: pass --rules FILE or --rule keyword=hint");
    }
    let checkpoint = Checkpoint::load(checkpoint_path)
        .await?
        .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {}", checkpoint_path.display()))?;
    let findings = scan_checkpoint(&checkpoint, rules);
    tracing::info!(
        chapters = checkpoint.len(),
        flagged = findings.len(),
        rules = rules.len(),
        "scan: done"
    );
    Ok(findings)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterListing {
    pub index: usize,
    pub name: String,
    pub chars: usize,
}

pub async fn list_chapters(input: &Path) -> anyhow::Result<(String, Vec<ChapterListing>)> {
    let book = open_book(input).await?;
    let listing = book
        .chapters
        .iter()
        .enumerate()
        .map(|(idx, chapter)| ChapterListing {
            index: idx + 1,
            name: chapter.name.clone(),
            chars: chapter.char_count(),
        })
        .collect();
    Ok((book.title.clone(), listing))
}
