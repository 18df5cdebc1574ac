use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;

use crate::config::OutputFormat;
use crate::epub::{SourceBook, TextChapter, TranslatedChapter, text_to_xhtml_body, write_text_epub};
use crate::reassemble;
use crate::segment;

const TITLE_MAX_CHARS: usize = 30;
const RULE_WIDTH: usize = 40;

/// One finished chapter as handed to the writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChapter {
    /// Source document name.
    pub name: String,
    /// Translated plain text, one paragraph per line.
    pub text: String,
}

/// Reading-order key derived from a document name: front matter first, then by the first
/// number in the file name, then everything else.
pub fn chapter_order_key(name: &str) -> (u8, u64) {
    let base = name.rsplit('/').next().unwrap_or(name).to_lowercase();
    if matches!(base.as_str(), "nav.xhtml" | "toc.xhtml" | "cover.xhtml") {
        return (0, 0);
    }
    let digits = base
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    match digits.parse() {
        Ok(n) => (1, n),
        Err(_) => (2, 0),
    }
}

pub fn sort_chapters(chapters: &mut [OutputChapter]) {
    chapters.sort_by_key(|c| chapter_order_key(&c.name));
}

/// Puts a translated chapter back into its source document's markup.
///
/// A document with no body content at all gets simple paragraphs instead.
pub fn chapter_body(source_html: &str, translated: &str, number: usize) -> String {
    let segmented = segment::segment_chapter(source_html);
    if segmented.segments.is_empty() {
        let (title, body) = split_title(translated, number);
        return text_to_xhtml_body(&title, &body);
    }
    reassemble::rebuild(&segmented.segments, translated)
}

/// Splits a chapter into its title and body.
///
/// A short first line is the title; otherwise the chapter is numbered and keeps its whole text.
pub fn split_title(text: &str, number: usize) -> (String, String) {
    let trimmed = text.trim();
    let Some(first_line) = trimmed.lines().next().map(str::trim) else {
        return (format!("第{number}章"), String::new());
    };
    if !first_line.is_empty() && first_line.chars().count() <= TITLE_MAX_CHARS {
        let body = trimmed
            .lines()
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_owned();
        return (first_line.to_owned(), body);
    }
    (format!("第{number}章"), trimmed.to_owned())
}

pub fn chapter_title(text: &str, number: usize) -> String {
    split_title(text, number).0
}

pub fn render_txt(chapters: &[OutputChapter]) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();
    for (idx, chapter) in chapters.iter().enumerate() {
        let (title, body) = split_title(&chapter.text, idx + 1);
        out.push_str(&format!("\n{rule}\n  {title}\n{rule}\n\n"));
        out.push_str(&body);
        out.push_str("\n\n");
    }
    out
}

pub fn write_txt(out_path: &Path, chapters: &[OutputChapter], force: bool) -> anyhow::Result<()> {
    create_parent_dir(out_path)?;
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = options
        .open(out_path)
        .with_context(|| format!("open output: {}", out_path.display()))?;
    file.write_all(render_txt(chapters).as_bytes())
        .with_context(|| format!("write output: {}", out_path.display()))?;
    file.flush()
        .with_context(|| format!("flush output: {}", out_path.display()))?;
    Ok(())
}

/// Writes the finished chapters in the requested format.
///
/// EPUB output copies the source archive when one is available, rebuilding each chapter
/// inside its original markup, and falls back to a generated book otherwise.
pub fn write_output(
    format: OutputFormat,
    out_path: &Path,
    title: &str,
    source: Option<&SourceBook>,
    chapters: &[OutputChapter],
    force: bool,
) -> anyhow::Result<()> {
    tracing::info!(
        format = ?format,
        out = %out_path.display(),
        chapters = chapters.len(),
        "write output"
    );
    match (format, source) {
        (OutputFormat::Txt, _) => write_txt(out_path, chapters, force),
        (OutputFormat::Epub, Some(book)) => {
            let mut translated = Vec::with_capacity(chapters.len());
            for (idx, chapter) in chapters.iter().enumerate() {
                let Some(source) = book.chapter(&chapter.name) else {
                    tracing::warn!(chapter = %chapter.name, "chapter not in source book; skipped");
                    continue;
                };
                translated.push(TranslatedChapter {
                    name: chapter.name.clone(),
                    body_html: chapter_body(&source.html, &chapter.text, idx + 1),
                });
            }
            if translated.is_empty() {
                anyhow::bail!("none of the chapters belong to the source book");
            }
            book.write_translated(out_path, &translated, force)
        }
        (OutputFormat::Epub, None) => {
            let text_chapters = chapters
                .iter()
                .enumerate()
                .map(|(idx, c)| {
                    let (title, text) = split_title(&c.text, idx + 1);
                    TextChapter { title, text }
                })
                .collect::<Vec<_>>();
            write_text_epub(out_path, title, &text_chapters, force)
        }
    }
}

fn create_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(text: &str) -> OutputChapter {
        OutputChapter {
            name: "ch.xhtml".to_owned(),
            text: text.to_owned(),
        }
    }

    #[test]
    fn short_first_line_becomes_title() {
        assert_eq!(
            split_title("第一章　出发\n早晨来了。\n少年出发了。", 1),
            (
                "第一章　出发".to_owned(),
                "早晨来了。\n少年出发了。".to_owned()
            )
        );
    }

    #[test]
    fn long_first_line_gets_numbered_title() {
        let text = "这".repeat(31);
        assert_eq!(split_title(&text, 3), ("第3章".to_owned(), text.clone()));
        assert_eq!(split_title("  ", 2), ("第2章".to_owned(), String::new()));
    }

    #[test]
    fn txt_frames_each_title() {
        let out = render_txt(&[chapter("序章\n正文。")]);
        let rule = "=".repeat(40);
        assert_eq!(out, format!("\n{rule}\n  序章\n{rule}\n\n正文。\n\n"));
    }

    #[test]
    fn txt_refuses_to_overwrite_without_force() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let out = temp.path().join("nested").join("book.txt");
        write_txt(&out, &[chapter("序章\n正文。")], false)?;
        assert!(write_txt(&out, &[chapter("序章\n正文。")], false).is_err());
        write_txt(&out, &[chapter("第二版\n正文。")], true)?;
        assert!(std::fs::read_to_string(&out)?.contains("第二版"));
        Ok(())
    }

    #[test]
    fn order_key_follows_file_numbers() {
        let mut chapters = ["text/p-010.xhtml", "text/extra.xhtml", "text/p-002.xhtml", "cover.xhtml"]
            .into_iter()
            .map(|name| OutputChapter {
                name: name.to_owned(),
                text: String::new(),
            })
            .collect::<Vec<_>>();
        sort_chapters(&mut chapters);
        let names = chapters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["cover.xhtml", "text/p-002.xhtml", "text/p-010.xhtml", "text/extra.xhtml"]
        );
    }

    #[test]
    fn chapter_body_reuses_source_markup() {
        let html = r#"<html><body><h1>第一章</h1><p class="a">朝が来た。</p><img src="a.png"/></body></html>"#;
        let body = chapter_body(html, "早晨来了。", 1);
        assert!(body.contains("<h1>第一章</h1>"));
        assert!(body.contains(r#"<p class="a">早晨来了。</p>"#));
        assert!(body.contains("a.png"));
    }

    #[test]
    fn epub_without_source_builds_a_text_book() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let out = temp.path().join("book.epub");
        write_output(
            OutputFormat::Epub,
            &out,
            "小说",
            None,
            &[chapter("序章\n正文。")],
            false,
        )?;
        assert!(out.exists());
        Ok(())
    }
}
