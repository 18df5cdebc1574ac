use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use novel_translator::cli::{Cli, Command};
use novel_translator::completion::Completion as _;
use novel_translator::config::TranslationConfig;
use novel_translator::control::{self, ProgressEvent, TaskHandle};
use novel_translator::openai::OpenAiCompatible;
use novel_translator::orchestrator::{self, Orchestrator};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    novel_translator::logging::init(cli.verbosity()).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Translate(args) => {
            let config = TranslationConfig::from_args(&args.provider).context("load config")?;
            let output = match &args.output {
                Some(output) => PathBuf::from(output),
                None => orchestrator::default_output_path(Path::new(&args.input), config.output_format),
            };
            let job = orchestrator::TranslateJob {
                input: PathBuf::from(&args.input),
                output,
                force: args.force,
                checkpoint: !args.no_checkpoint,
            };

            let (handle, control, events) = control::task_channel();
            let orchestrator = Orchestrator::from_config(config, control)?;
            let reporter = watch_task(handle, events);
            let summary = orchestrator.translate_book(&job).await;
            drop(orchestrator);
            reporter.await.context("join progress reporter")?;
            let summary = summary.context("translate")?;
            if summary.cancelled {
                anyhow::bail!("translation cancelled");
            }
        }
        Command::Retranslate(args) => {
            let config = TranslationConfig::from_args(&args.provider).context("load config")?;
            let job = orchestrator::RetranslateJob {
                input: PathBuf::from(&args.input),
                checkpoint: PathBuf::from(&args.checkpoint),
                chapters: args.chapters,
                output: args.output.map(PathBuf::from),
                force: args.force,
            };

            let (handle, control, events) = control::task_channel();
            let orchestrator = Orchestrator::from_config(config, control)?;
            let reporter = watch_task(handle, events);
            let summary = orchestrator.retranslate(&job).await;
            drop(orchestrator);
            reporter.await.context("join progress reporter")?;
            let summary = summary.context("retranslate")?;
            if summary.cancelled {
                anyhow::bail!("retranslation cancelled");
            }
        }
        Command::Restore(args) => {
            let job = orchestrator::RestoreJob {
                checkpoint: PathBuf::from(&args.checkpoint),
                source: args.source.map(PathBuf::from),
                output: PathBuf::from(&args.output),
                format: args.format,
                force: args.force,
            };
            let written = orchestrator::restore(&job).await.context("restore")?;
            println!("{written} chapters written to {}", job.output.display());
        }
        Command::Scan(args) => {
            let mut rules = match &args.rules {
                Some(path) => orchestrator::load_scan_rules(Path::new(path))?,
                None => Vec::new(),
            };
            for raw in &args.rule {
                rules.push(orchestrator::ScanRule::parse(raw)?);
            }
            let findings = orchestrator::scan(Path::new(&args.checkpoint), &rules)
                .await
                .context("scan")?;
            for chapter in &findings {
                println!("{}", chapter.chapter);
                for finding in &chapter.findings {
                    println!("  {} x{}  {}", finding.keyword, finding.count, finding.hint);
                }
            }
            if findings.is_empty() {
                println!("no issues found");
            }
        }
        Command::TestConnection(args) => {
            let config = TranslationConfig::from_args(&args.provider).context("load config")?;
            config.validate()?;
            let completion = OpenAiCompatible::from_config(&config).context("create provider")?;
            let reply = completion
                .test_connection()
                .await
                .context("test connection")?;
            println!("ok ({} / {}): {reply}", completion.name(), config.model());
        }
        Command::Chapters(args) => {
            let (title, chapters) = orchestrator::list_chapters(Path::new(&args.input))
                .await
                .context("list chapters")?;
            println!("{title}");
            for chapter in &chapters {
                println!("{:>4}  {:>7}  {}", chapter.index, chapter.chars, chapter.name);
            }
        }
    }

    Ok(())
}

/// Cancels on Ctrl-C and renders progress events as log lines until the worker side is
/// dropped.
fn watch_task(
    handle: TaskHandle,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling after in-flight requests");
            handle.cancel();
        }
        // Keeps the pause gate open until the task ends.
        std::future::pending::<()>().await;
    });

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
        signal.abort();
    })
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::RunStarted { chapters } => {
            tracing::debug!(chapters = chapters, "run started");
        }
        ProgressEvent::ChapterStarted {
            index,
            total,
            name,
            chunks,
        } => {
            tracing::info!(
                chapter = %name,
                index = index,
                total = total,
                chunks = chunks,
                "translating chapter"
            );
        }
        ProgressEvent::ChapterSkipped { name } => {
            tracing::debug!(chapter = %name, "chapter skipped");
        }
        ProgressEvent::ChunkFinished {
            chunk_index,
            ok,
            snapshot,
        } => {
            tracing::debug!(
                chunk_index = chunk_index,
                ok = ok,
                chunks_done = snapshot.chunks_done,
                chunks_total = snapshot.chunks_total,
                chars = snapshot.chars_translated,
                "chunk finished"
            );
        }
        ProgressEvent::StreamDelta { chunk_index, text } => {
            tracing::trace!(chunk_index = chunk_index, delta = %text, "stream");
        }
        ProgressEvent::ChapterFailed { name, error } => {
            tracing::warn!(chapter = %name, error = %error, "chapter not translated");
        }
        // Retries, fallbacks and completions are already logged where they happen.
        ProgressEvent::ChunkRetry { .. }
        | ProgressEvent::LeakageFallback { .. }
        | ProgressEvent::ChapterFinished { .. }
        | ProgressEvent::RunFinished { .. } => {}
    }
}
