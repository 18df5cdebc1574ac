//! Cleanup of raw model output before it is accepted as a chunk translation.
//!
//! Models echo parts of the request back: the glossary block, section headers of the
//! context envelope, or lines of the Japanese source. [`clean`] strips those heuristically
//! and [`looks_like_echo`] decides whether what is left is still unusable.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

const OUTPUT_MARKERS: &[&str] = &["【译文】", "[译文]", "［译文］"];

const META_MARKERS: &[&str] = &[
    "【译文】",
    "[译文]",
    "【待翻译原文】",
    "[待翻译原文]",
    "【强制术语表】",
    "【术语表",
    "[前文翻译参考",
    "【前文译文参考",
    "翻译要求",
];

/// Shortest source line treated as evidence of verbatim copying.
pub const VERBATIM_MIN_CHARS: usize = 8;

const GLOSSARY_BURST: usize = 4;
const GLOSSARY_ECHO_LINES: usize = 3;
const SOURCE_SCRIPT_RATIO: f64 = 0.10;
const SOURCE_SCRIPT_MIN_LETTERS: usize = 20;

static GLOSSARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•·]\s*)?\S.{0,40}?\s*(?:->|→|=>|⇒)\s*\S.{0,40}$")
        .expect("glossary line regex")
});

static HEADER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[【\[［](?:强制术语表|术语表|前文翻译参考|前文译文参考|待翻译原文|待翻译|原文|译文)[^】\]］]*[】\]］]|(?:原文|待翻译|译文)\s*[:：])\s*",
    )
    .expect("header prefix regex")
});

static REQUIREMENTS_LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•·]|\d+[.、)）]|[（(]\d+[)）])").expect("requirements list regex")
});

/// Why an output was judged to still echo the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoReason {
    MetaMarker(String),
    GlossaryLines(usize),
    VerbatimSource(String),
    SourceScript { kana: usize, letters: usize },
}

impl fmt::Display for EchoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetaMarker(marker) => write!(f, "meta marker {marker:?}"),
            Self::GlossaryLines(count) => write!(f, "{count} glossary-style lines"),
            Self::VerbatimSource(line) => write!(f, "verbatim source line {line:?}"),
            Self::SourceScript { kana, letters } => {
                write!(f, "source script ratio {kana}/{letters}")
            }
        }
    }
}

/// Strips prompt, glossary and source echo from `raw`.
///
/// Never returns an empty string for non-empty input: when every line would be removed,
/// the raw output is returned instead.
pub fn clean(raw: &str, original: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let text = truncate_through_output_marker(&text);
    let lines = text.split('\n').map(str::to_owned).collect::<Vec<_>>();
    let lines = strip_glossary_lines(lines);
    let lines = strip_header_lines(lines);
    let lines = strip_verbatim_source(lines, original);
    let lines = strip_requirements_block(lines);
    let cleaned = normalize(&lines);

    if cleaned.is_empty() {
        let fallback = raw.trim();
        if fallback.is_empty() {
            return raw.to_owned();
        }
        return fallback.to_owned();
    }
    cleaned
}

/// Checks cleaned output for leftover echo.
pub fn looks_like_echo(output: &str, original: &str) -> Option<EchoReason> {
    if let Some(marker) = META_MARKERS.iter().find(|m| output.contains(*m)) {
        return Some(EchoReason::MetaMarker((*marker).to_owned()));
    }

    let glossary_lines = output
        .lines()
        .filter(|line| GLOSSARY_LINE.is_match(line))
        .count();
    if glossary_lines >= GLOSSARY_ECHO_LINES {
        return Some(EchoReason::GlossaryLines(glossary_lines));
    }

    if let Some(line) = source_lines(original).find(|line| output.contains(line)) {
        return Some(EchoReason::VerbatimSource(line.to_owned()));
    }

    let letters = output.chars().filter(|c| c.is_alphabetic()).count();
    let kana = output.chars().filter(|c| is_kana(*c)).count();
    if letters >= SOURCE_SCRIPT_MIN_LETTERS && kana as f64 / letters as f64 > SOURCE_SCRIPT_RATIO {
        return Some(EchoReason::SourceScript { kana, letters });
    }

    None
}

/// Hiragana and katakana letters, excluding the middle dot and prolonged sound mark that
/// Chinese text also uses.
pub fn is_kana(c: char) -> bool {
    matches!(c, '\u{3041}'..='\u{3096}' | '\u{30A1}'..='\u{30FA}')
}

fn truncate_through_output_marker(text: &str) -> &str {
    let cut = OUTPUT_MARKERS
        .iter()
        .filter_map(|marker| text.rfind(marker).map(|pos| pos + marker.len()))
        .max();
    match cut {
        Some(cut) => &text[cut..],
        None => text,
    }
}

/// The text after a header prefix, once markdown emphasis and list noise before the
/// header are ignored. `None` when the line is not a header.
fn header_rest(line: &str) -> Option<&str> {
    let trimmed = line.trim().trim_start_matches(is_leading_noise);
    let found = HEADER_PREFIX.find(trimmed)?;
    Some(trimmed[found.end()..].trim_start_matches(is_leading_noise).trim_end())
}

fn is_header_line(line: &str) -> bool {
    header_rest(line).is_some()
}

fn strip_glossary_lines(lines: Vec<String>) -> Vec<String> {
    let total = lines
        .iter()
        .filter(|line| GLOSSARY_LINE.is_match(line))
        .count();
    if total >= GLOSSARY_BURST {
        return lines
            .into_iter()
            .filter(|line| !GLOSSARY_LINE.is_match(line))
            .collect();
    }

    let leading = lines
        .iter()
        .take_while(|line| {
            line.trim().is_empty() || is_header_line(line) || GLOSSARY_LINE.is_match(line)
        })
        .count();
    lines
        .into_iter()
        .enumerate()
        .filter(|(idx, line)| *idx >= leading || !GLOSSARY_LINE.is_match(line))
        .map(|(_, line)| line)
        .collect()
}

fn strip_header_lines(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter_map(|line| match header_rest(&line) {
            Some(rest) => (!rest.is_empty()).then(|| rest.to_owned()),
            None => Some(line),
        })
        .collect()
}

fn source_lines(original: &str) -> impl Iterator<Item = &str> {
    original.lines().map(str::trim).filter(|line| {
        line.chars().count() >= VERBATIM_MIN_CHARS && line.chars().any(is_kana)
    })
}

fn strip_verbatim_source(lines: Vec<String>, original: &str) -> Vec<String> {
    let sources = source_lines(original).collect::<Vec<_>>();
    if sources.is_empty() {
        return lines;
    }
    lines
        .into_iter()
        .filter_map(|line| {
            if sources.contains(&line.trim()) {
                return None;
            }
            let mut line = line;
            for source in &sources {
                if line.contains(source) {
                    line = line.replace(source, "");
                }
            }
            Some(line)
        })
        .collect()
}

fn strip_requirements_block(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut in_block = false;
    for line in lines {
        if line.contains("翻译要求") {
            in_block = true;
            continue;
        }
        if in_block {
            if line.trim().is_empty() || REQUIREMENTS_LIST_ITEM.is_match(&line) {
                continue;
            }
            in_block = false;
        }
        out.push(line);
    }
    out
}

fn is_leading_noise(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            ':' | '：' | '*' | '#' | '`' | '>' | '=' | '_' | '~' | '-'
        )
}

fn normalize(lines: &[String]) -> String {
    let mut out = Vec::with_capacity(lines.len());
    let mut previous_blank = true;
    for line in lines {
        let line = line
            .replace(['\u{feff}', '\u{200b}', '\u{fffd}'], "")
            .trim_end()
            .to_owned();
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        previous_blank = blank;
        out.push(if blank { String::new() } else { line });
    }
    while out.last().is_some_and(|line| line.is_empty()) {
        out.pop();
    }
    out.join("\n").trim_start_matches(is_leading_noise).to_owned()
}
