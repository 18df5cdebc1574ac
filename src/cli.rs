use clap::{Args, Parser, Subcommand};

use crate::config::{DeepseekMode, GlossaryPlacement, ModelKind, OutputFormat, Provider};
use crate::logging::Verbosity;

#[derive(Debug, Parser)]
#[command(author, version, about = "Translate Japanese light-novel EPUBs into Chinese with LLM APIs")]
pub struct Cli {
    /// More log output (`-v` debug, `-vv` trace); `RUST_LOG` overrides.
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity {
            verbose: self.verbose,
            quiet: self.quiet,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Translate an EPUB, resuming from its checkpoint when present.
    Translate(TranslateArgs),
    /// Rebuild the output from a checkpoint without calling the provider.
    Restore(RestoreArgs),
    /// Report keyword hits in the translated chapters of a checkpoint.
    Scan(ScanArgs),
    /// Translate selected chapters again and update the checkpoint.
    Retranslate(RetranslateArgs),
    /// Send one small request to check the provider settings.
    TestConnection(TestConnectionArgs),
    /// List the narrative chapters of an EPUB.
    Chapters(ChaptersArgs),
}

/// Provider and translation settings shared by every command that calls the model.
#[derive(Debug, Clone, Default, Args)]
pub struct ProviderArgs {
    /// YAML config file; flags override its values.
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// API key (falls back to NOVEL_TRANSLATOR_API_KEY / OPENAI_API_KEY).
    #[arg(long)]
    pub api_key: Option<String>,

    /// OpenAI-compatible base URL, e.g. `https://api.siliconflow.cn/v1`.
    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    /// Chat or completion model; detected from the model name when omitted.
    #[arg(long, value_enum)]
    pub model_kind: Option<ModelKind>,

    /// DeepSeek request mode (beta prefix/FIM continuation).
    #[arg(long, value_enum)]
    pub deepseek_mode: Option<DeepseekMode>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Characters per chunk; 0 sends each chapter whole.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Concurrent chunk requests.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Attempts per chunk for transient errors.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Lines of the previous translation passed along as context; 0 disables.
    #[arg(long)]
    pub context_lines: Option<usize>,

    /// Stream model output.
    #[arg(long)]
    pub stream: bool,

    /// File holding a system prompt that replaces the built-in one.
    #[arg(long)]
    pub prompt_file: Option<String>,

    /// Glossary JSON file (`{"source": "target"}`).
    #[arg(long)]
    pub glossary: Option<String>,

    #[arg(long, value_enum)]
    pub glossary_placement: Option<GlossaryPlacement>,

    /// First chapter to translate (1-based).
    #[arg(long = "start")]
    pub start_chapter: Option<usize>,

    /// Last chapter to translate (1-based, inclusive).
    #[arg(long = "end")]
    pub end_chapter: Option<usize>,

    /// Output format.
    #[arg(long, short = 'f', value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Args)]
pub struct TranslateArgs {
    /// Source EPUB.
    pub input: String,

    /// Output file (default: `<input>_translated.<format>`).
    #[arg(long, short = 'o')]
    pub output: Option<String>,

    /// Overwrite the output file if it exists.
    #[arg(long)]
    pub force: bool,

    /// Neither resume from nor write a checkpoint.
    #[arg(long)]
    pub no_checkpoint: bool,

    #[command(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Checkpoint file (`<output>.checkpoint.json`).
    #[arg(long)]
    pub checkpoint: String,

    /// Source EPUB, used for chapter order and document structure.
    #[arg(long)]
    pub source: Option<String>,

    #[arg(long, short = 'o')]
    pub output: String,

    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Epub)]
    pub format: OutputFormat,

    /// Overwrite the output file if it exists.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    #[arg(long)]
    pub checkpoint: String,

    /// YAML or JSON object of `keyword: hint` rules.
    #[arg(long)]
    pub rules: Option<String>,

    /// Extra rule as `keyword=hint` (repeatable).
    #[arg(long = "rule")]
    pub rule: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RetranslateArgs {
    /// Source EPUB.
    pub input: String,

    #[arg(long)]
    pub checkpoint: String,

    /// Chapter to translate again, by archive path or file name (repeatable).
    #[arg(long = "chapter", required = true)]
    pub chapters: Vec<String>,

    /// Rewrite this output file after updating the checkpoint.
    #[arg(long, short = 'o')]
    pub output: Option<String>,

    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Debug, Args)]
pub struct TestConnectionArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Debug, Args)]
pub struct ChaptersArgs {
    /// Source EPUB.
    pub input: String,
}
