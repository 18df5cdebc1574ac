use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read as _, Seek, Write};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context as _;
use chrono::Utc;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use regex::Regex;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::export::chapter_title;
use crate::segment;

/// Documents with fewer characters of text than this are treated as front/back matter.
pub const MIN_CHAPTER_CHARS: usize = 50;
pub const TITLE_SUFFIX: &str = " (中文翻译)";
pub const TARGET_LANG: &str = "zh";

const EXCLUDED_NAME_PARTS: &[&str] = &["nav", "toc", "cover", "titlepage", "copyright"];

/// One content document of the source book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterDocument {
    /// Archive path, unique within the book.
    pub name: String,
    pub html: String,
    pub plain_text: String,
}

impl ChapterDocument {
    pub fn char_count(&self) -> usize {
        self.plain_text.chars().count()
    }

    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// A translated chapter body ready to be written back into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedChapter {
    pub name: String,
    pub body_html: String,
}

#[derive(Debug, Clone)]
struct EpubEntry {
    name: String,
    data: Vec<u8>,
    compression: CompressionMethod,
    last_modified: zip::DateTime,
    unix_mode: Option<u32>,
    is_dir: bool,
}

#[derive(Debug, Clone, Default)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

#[derive(Debug, Clone, Default)]
struct Package {
    title: Option<String>,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
}

/// An opened source EPUB with its narrative chapters in reading order.
#[derive(Debug, Clone)]
pub struct SourceBook {
    pub title: String,
    pub chapters: Vec<ChapterDocument>,
    opf_path: String,
    nav_path: Option<String>,
    entries: Vec<EpubEntry>,
}

impl SourceBook {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("open epub: {}", path.display()))?;
        let mut zip = ZipArchive::new(file)
            .with_context(|| format!("read epub archive: {}", path.display()))?;

        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut file = zip.by_index(index).context("zip entry")?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .with_context(|| format!("read zip entry: {}", file.name()))?;
            entries.push(EpubEntry {
                name: file.name().to_owned(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }

        let lookup = entries
            .iter()
            .map(|e| (e.name.as_str(), e.data.as_slice()))
            .collect::<HashMap<_, _>>();

        let container = lookup
            .get("META-INF/container.xml")
            .ok_or_else(|| anyhow::anyhow!("epub has no META-INF/container.xml"))?;
        let opf_path = parse_container(container).context("parse container.xml")?;
        let opf = lookup
            .get(opf_path.as_str())
            .ok_or_else(|| anyhow::anyhow!("package document not found: {opf_path}"))?;
        let package = parse_package(opf).with_context(|| format!("parse {opf_path}"))?;
        let opf_dir = parent_dir(&opf_path);

        let nav_path = package
            .manifest
            .iter()
            .find(|item| has_property(item, "nav"))
            .map(|item| resolve_href(opf_dir, &item.href));

        let items = package
            .manifest
            .iter()
            .map(|item| (item.id.as_str(), item))
            .collect::<HashMap<_, _>>();
        let mut seen = HashSet::new();
        let mut chapters = Vec::new();
        for idref in &package.spine {
            let Some(item) = items.get(idref.as_str()) else {
                tracing::warn!(idref = %idref, "spine item missing from manifest");
                continue;
            };
            if !item.media_type.contains("html") || has_property(item, "nav") {
                continue;
            }
            let name = resolve_href(opf_dir, &item.href);
            if is_excluded_name(&name) || !seen.insert(name.clone()) {
                continue;
            }
            let Some(data) = lookup.get(name.as_str()) else {
                tracing::warn!(chapter = %name, "spine document missing from archive");
                continue;
            };
            let html = String::from_utf8_lossy(data).into_owned();
            let plain_text = segment::document_text(&html);
            if plain_text.chars().count() < MIN_CHAPTER_CHARS {
                tracing::debug!(chapter = %name, "skip short document");
                continue;
            }
            chapters.push(ChapterDocument {
                name,
                html,
                plain_text,
            });
        }

        let title = package
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "Book".to_owned());

        tracing::debug!(
            title = %title,
            chapters = chapters.len(),
            entries = entries.len(),
            "epub opened"
        );

        Ok(Self {
            title,
            chapters,
            opf_path,
            nav_path,
            entries,
        })
    }

    pub fn chapter(&self, name: &str) -> Option<&ChapterDocument> {
        self.chapters.iter().find(|c| c.name == name)
    }

    /// Finds a chapter by archive path or bare file name.
    pub fn find_chapter(&self, name: &str) -> Option<&ChapterDocument> {
        self.chapter(name)
            .or_else(|| self.chapters.iter().find(|c| c.file_name() == name))
    }

    fn entry(&self, name: &str) -> Option<&EpubEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Writes a copy of the source archive with translated chapters swapped in.
    pub fn write_translated(
        &self,
        out_path: &Path,
        translated: &[TranslatedChapter],
        force: bool,
    ) -> anyhow::Result<()> {
        let replacements = translated
            .iter()
            .map(|c| (c.name.as_str(), c.body_html.as_str()))
            .collect::<HashMap<_, _>>();
        let nav_replacement = self.rebuilt_nav(translated)?;

        write_archive_atomic(out_path, force, |zip| {
            write_mimetype(zip)?;
            for entry in &self.entries {
                if entry.name == "mimetype" {
                    continue;
                }
                let mut options = SimpleFileOptions::default()
                    .compression_method(entry.compression)
                    .last_modified_time(entry.last_modified);
                if let Some(mode) = entry.unix_mode {
                    options = options.unix_permissions(mode);
                }
                if entry.is_dir || entry.name.ends_with('/') {
                    zip.add_directory(entry.name.as_str(), options)
                        .with_context(|| format!("add zip dir: {}", entry.name))?;
                    continue;
                }

                let data = if let Some(body) = replacements.get(entry.name.as_str()) {
                    let original = String::from_utf8_lossy(&entry.data);
                    render_translated_document(&original, body)
                        .with_context(|| format!("render {}", entry.name))?
                        .into_bytes()
                } else if entry.name == self.opf_path {
                    let opf = String::from_utf8_lossy(&entry.data);
                    patch_package_document(&opf)
                        .with_context(|| format!("patch {}", entry.name))?
                        .into_bytes()
                } else if let Some((nav_path, nav)) = &nav_replacement
                    && *nav_path == entry.name
                {
                    tracing::info!(nav = %nav_path, "navigation document was empty; regenerated");
                    nav.clone().into_bytes()
                } else {
                    entry.data.clone()
                };

                zip.start_file(entry.name.as_str(), options)
                    .with_context(|| format!("start zip file: {}", entry.name))?;
                zip.write_all(&data)
                    .with_context(|| format!("write zip file: {}", entry.name))?;
            }
            Ok(())
        })
    }

    /// A replacement navigation document when the source one has no entries.
    fn rebuilt_nav(
        &self,
        translated: &[TranslatedChapter],
    ) -> anyhow::Result<Option<(String, String)>> {
        let Some(nav_path) = &self.nav_path else {
            return Ok(None);
        };
        let Some(entry) = self.entry(nav_path) else {
            return Ok(None);
        };
        if !nav_is_empty(&String::from_utf8_lossy(&entry.data)) {
            return Ok(None);
        }

        let nav_dir = parent_dir(nav_path);
        let links = self
            .chapters
            .iter()
            .enumerate()
            .map(|(idx, chapter)| {
                let text = translated
                    .iter()
                    .find(|t| t.name == chapter.name)
                    .map(|t| segment::document_text(&format!("<body>{}</body>", t.body_html)))
                    .unwrap_or_else(|| chapter.plain_text.clone());
                NavLink {
                    href: relative_href(nav_dir, &chapter.name),
                    title: chapter_title(&text, idx + 1),
                }
            })
            .collect::<Vec<_>>();
        let title = format!("{}{TITLE_SUFFIX}", self.title);
        Ok(Some((
            nav_path.clone(),
            render_nav_xhtml(&title, &links)?,
        )))
    }
}

/// Chapter of a book generated from plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChapter {
    pub title: String,
    pub text: String,
}

/// Builds a minimal EPUB 3 book from plain-text chapters.
pub fn write_text_epub(
    out_path: &Path,
    title: &str,
    chapters: &[TextChapter],
    force: bool,
) -> anyhow::Result<()> {
    if chapters.is_empty() {
        anyhow::bail!("no chapters to write");
    }

    let uid = format!("urn:uuid:{}", uuid::Uuid::new_v4());
    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let documents = chapters
        .iter()
        .enumerate()
        .map(|(idx, chapter)| BookDocument {
            id: format!("chapter-{:03}", idx + 1),
            title: chapter.title.clone(),
            body_html: text_to_xhtml_body(&chapter.title, &chapter.text),
        })
        .collect::<Vec<_>>();
    let links = documents
        .iter()
        .map(|d| NavLink {
            href: format!("{}.xhtml", d.id),
            title: d.title.clone(),
        })
        .collect::<Vec<_>>();

    let container_xml = render_container_xml()?;
    let nav_xhtml = render_nav_xhtml(title, &links)?;
    let toc_ncx = render_toc_ncx(title, &uid, &links)?;
    let content_opf = render_content_opf(title, &uid, &modified, &documents)?;
    let chapter_files = documents
        .iter()
        .map(|d| render_text_document(d).map(|xhtml| (format!("OEBPS/{}.xhtml", d.id), xhtml)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    write_archive_atomic(out_path, force, |zip| {
        write_mimetype(zip)?;
        let deflated = deflated_options();
        let fixed = [
            ("META-INF/container.xml", container_xml.as_str()),
            ("OEBPS/content.opf", content_opf.as_str()),
            ("OEBPS/nav.xhtml", nav_xhtml.as_str()),
            ("OEBPS/toc.ncx", toc_ncx.as_str()),
            ("OEBPS/style.css", STYLE_CSS),
        ];
        for (name, contents) in fixed {
            zip.start_file(name, deflated)
                .with_context(|| format!("epub start_file {name}"))?;
            zip.write_all(contents.as_bytes())
                .with_context(|| format!("epub write {name}"))?;
        }
        for (name, xhtml) in &chapter_files {
            zip.start_file(name.as_str(), deflated)
                .with_context(|| format!("epub start_file {name}"))?;
            zip.write_all(xhtml.as_bytes())
                .with_context(|| format!("epub write {name}"))?;
        }
        Ok(())
    })
}

#[derive(Debug)]
struct BookDocument {
    id: String,
    title: String,
    body_html: String,
}

#[derive(Debug)]
struct NavLink {
    href: String,
    title: String,
}

fn deflated_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
}

fn write_mimetype<W: Write + Seek>(zip: &mut ZipWriter<W>) -> anyhow::Result<()> {
    // `mimetype` must be the first entry and must be stored uncompressed.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;
    Ok(())
}

/// Writes the archive into a temp file next to `out_path`, then moves it into place.
fn write_archive_atomic(
    out_path: &Path,
    force: bool,
    build: impl FnOnce(&mut ZipWriter<&mut File>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    if out_path.exists() && !force {
        anyhow::bail!("output already exists: {}", out_path.display());
    }
    let parent = out_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("create output dir: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        build(&mut zip)?;
        zip.finish().context("finish epub zip")?;
    }
    let persisted = if force {
        tmp.persist(out_path)
    } else {
        tmp.persist_noclobber(out_path)
    };
    persisted.with_context(|| format!("move epub into place: {}", out_path.display()))?;
    Ok(())
}

/// Wraps a translated body in the fixed XHTML prologue and the source document's `<head>`.
pub fn render_translated_document(original_html: &str, body_html: &str) -> anyhow::Result<String> {
    let head = extract_element(original_html, "head")
        .unwrap_or("<head>\n<meta charset=\"utf-8\" />\n</head>");
    let body_open = extract_open_tag(original_html, "body").unwrap_or("<body>");

    let mut doc = XmlDoc::xhtml()?;
    doc.open(
        "html",
        &[
            ("xmlns", XHTML_NS),
            ("xmlns:epub", OPS_NS),
            ("lang", TARGET_LANG),
            ("xml:lang", TARGET_LANG),
        ],
    )?;
    doc.raw(&format!(
        "\n{}\n{body_open}\n{}\n</body>\n",
        close_void_tags(head),
        xhtml_fragment(body_html).trim_end()
    ))?;
    doc.close("html")?;
    doc.finish()
}

/// HTML serialization quirks that are not well-formed XML.
fn xhtml_fragment(html: &str) -> String {
    close_void_tags(html).replace("&nbsp;", "&#160;")
}

fn find_tag_start(lower: &str, tag: &str, from: usize) -> Option<usize> {
    let needle = format!("<{tag}");
    let mut cursor = from;
    while let Some(rel) = lower[cursor..].find(&needle) {
        let start = cursor + rel;
        let after = lower[start + needle.len()..].chars().next();
        if matches!(after, Some('>' | '/')) || after.is_some_and(char::is_whitespace) {
            return Some(start);
        }
        cursor = start + needle.len();
    }
    None
}

fn extract_open_tag<'a>(html: &'a str, tag: &str) -> Option<&'a str> {
    let lower = html.to_ascii_lowercase();
    let start = find_tag_start(&lower, tag, 0)?;
    let end = start + lower[start..].find('>')?;
    Some(&html[start..=end])
}

fn extract_element<'a>(html: &'a str, tag: &str) -> Option<&'a str> {
    let lower = html.to_ascii_lowercase();
    let start = find_tag_start(&lower, tag, 0)?;
    let close = format!("</{tag}>");
    let end = start + lower[start..].find(&close)? + close.len();
    Some(&html[start..end])
}

fn nav_is_empty(nav_html: &str) -> bool {
    let lower = nav_html.to_ascii_lowercase();
    !lower.contains("<a ") && !lower.contains("<a>")
}

/// Sets `dc:language` to the target language and marks the title as translated.
pub fn patch_package_document(opf: &str) -> anyhow::Result<String> {
    #[derive(PartialEq)]
    enum Field {
        Language,
        Title,
    }

    let mut reader = Reader::from_str(opf);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::new());
    let mut current = None;
    let mut title_patched = false;

    loop {
        let event = reader.read_event().context("read opf event")?;
        match event {
            Event::Eof => break,
            Event::Start(start) => {
                current = match start.local_name().as_ref() {
                    b"language" => Some(Field::Language),
                    b"title" if !title_patched => Some(Field::Title),
                    _ => None,
                };
                writer
                    .write_event(Event::Start(start))
                    .context("write opf start")?;
            }
            Event::Text(_) if current == Some(Field::Language) => {
                writer
                    .write_event(Event::Text(BytesText::new(TARGET_LANG)))
                    .context("write opf language")?;
            }
            Event::Text(text) if current == Some(Field::Title) => {
                let title = text.unescape().context("unescape opf title")?;
                let title = title.trim();
                let patched = if title.ends_with(TITLE_SUFFIX.trim()) {
                    title.to_owned()
                } else {
                    format!("{title}{TITLE_SUFFIX}")
                };
                writer
                    .write_event(Event::Text(BytesText::new(&patched)))
                    .context("write opf title")?;
                title_patched = true;
            }
            Event::End(end) => {
                current = None;
                writer
                    .write_event(Event::End(end))
                    .context("write opf end")?;
            }
            other => writer.write_event(other).context("write opf event")?,
        }
    }

    String::from_utf8(writer.into_inner()).context("opf is not utf-8")
}

fn parse_container(xml: &[u8]) -> anyhow::Result<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).context("read xml event")? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path")? {
                    return Ok(path);
                }
            }
            _ => {}
        }
    }
    anyhow::bail!("container.xml has no rootfile")
}

fn parse_package(xml: &[u8]) -> anyhow::Result<Package> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut package = Package::default();
    let mut in_title = false;

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).context("read xml event")? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"item" => package.manifest.push(ManifestItem {
                    id: attribute(&e, b"id")?.unwrap_or_default(),
                    href: attribute(&e, b"href")?.unwrap_or_default(),
                    media_type: attribute(&e, b"media-type")?.unwrap_or_default(),
                    properties: attribute(&e, b"properties")?.unwrap_or_default(),
                }),
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref")? {
                        package.spine.push(idref);
                    }
                }
                b"title" => in_title = package.title.is_none(),
                _ => {}
            },
            Event::Text(t) if in_title => {
                let text = t.unescape().context("unescape title")?;
                package.title = Some(text.trim().to_owned());
                in_title = false;
            }
            Event::End(_) => in_title = false,
            _ => {}
        }
    }
    Ok(package)
}

fn attribute(start: &BytesStart<'_>, key: &[u8]) -> anyhow::Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.context("attr")?;
        if attr.key.local_name().as_ref() == key {
            let value = attr.unescape_value().context("unescape attr")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn has_property(item: &ManifestItem, property: &str) -> bool {
    item.properties.split_whitespace().any(|p| p == property)
}

fn is_excluded_name(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase();
    EXCLUDED_NAME_PARTS.iter().any(|part| file.contains(part))
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolves a manifest href against the package document directory.
fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut parts = base_dir
        .split('/')
        .filter(|p| !p.is_empty())
        .map(Cow::Borrowed)
        .collect::<Vec<_>>();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(decode_segment(other)),
        }
    }
    parts.join("/")
}

/// Manifest hrefs are URLs; zip entry names are not.
fn decode_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains('%') {
        return Cow::Borrowed(segment);
    }
    urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment))
}

fn relative_href(from_dir: &str, target: &str) -> String {
    let from = from_dir
        .split('/')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    let to = target.split('/').collect::<Vec<_>>();
    let common = from
        .iter()
        .zip(&to)
        .take_while(|(a, b)| a == b)
        .count()
        .min(to.len().saturating_sub(1));
    let mut parts = vec![".."; from.len() - common];
    parts.extend(&to[common..]);
    parts.join("/")
}

pub(crate) fn text_to_xhtml_body(title: &str, text: &str) -> String {
    let mut out = format!("<h2>{}</h2>\n", escape(title));
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        out.push_str(&format!("<p>{}</p>\n", escape(line)));
    }
    out
}

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";
const OPS_NS: &str = "http://www.idpf.org/2007/ops";

const STYLE_CSS: &str = "@charset \"utf-8\";\n\
body { margin: 0 1em; line-height: 1.8; }\n\
h2 { text-align: center; margin: 2em 0 1em; }\n\
p { text-indent: 2em; margin: 0.4em 0; }\n\
img { max-width: 100%; height: auto; }\n";

/// Indented XML document written through quick-xml events.
struct XmlDoc {
    writer: Writer<Vec<u8>>,
}

impl XmlDoc {
    fn new() -> anyhow::Result<Self> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .context("write xml declaration")?;
        Ok(Self { writer })
    }

    fn xhtml() -> anyhow::Result<Self> {
        let mut doc = Self::new()?;
        doc.writer
            .write_event(Event::DocType(BytesText::from_escaped("html")))
            .context("write doctype")?;
        Ok(doc)
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> anyhow::Result<()> {
        let start = BytesStart::new(name).with_attributes(attrs.iter().copied());
        self.writer
            .write_event(Event::Start(start))
            .with_context(|| format!("write <{name}>"))
    }

    fn close(&mut self, name: &str) -> anyhow::Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .with_context(|| format!("write </{name}>"))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> anyhow::Result<()> {
        let start = BytesStart::new(name).with_attributes(attrs.iter().copied());
        self.writer
            .write_event(Event::Empty(start))
            .with_context(|| format!("write <{name}/>"))
    }

    fn leaf(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> anyhow::Result<()> {
        self.open(name, attrs)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .with_context(|| format!("write <{name}> text"))?;
        self.close(name)
    }

    /// Markup that is already serialized.
    fn raw(&mut self, markup: &str) -> anyhow::Result<()> {
        self.writer
            .write_event(Event::Text(BytesText::from_escaped(markup)))
            .context("write markup")
    }

    fn finish(self) -> anyhow::Result<String> {
        let mut bytes = self.writer.into_inner();
        bytes.push(b'\n');
        String::from_utf8(bytes).context("xml output is not utf-8")
    }
}

fn render_container_xml() -> anyhow::Result<String> {
    let mut doc = XmlDoc::new()?;
    doc.open(
        "container",
        &[
            ("version", "1.0"),
            ("xmlns", "urn:oasis:names:tc:opendocument:xmlns:container"),
        ],
    )?;
    doc.open("rootfiles", &[])?;
    doc.empty(
        "rootfile",
        &[
            ("full-path", "OEBPS/content.opf"),
            ("media-type", "application/oebps-package+xml"),
        ],
    )?;
    doc.close("rootfiles")?;
    doc.close("container")?;
    doc.finish()
}

fn open_xhtml_head(doc: &mut XmlDoc, title: &str) -> anyhow::Result<()> {
    doc.open(
        "html",
        &[
            ("xmlns", XHTML_NS),
            ("xmlns:epub", OPS_NS),
            ("lang", TARGET_LANG),
            ("xml:lang", TARGET_LANG),
        ],
    )?;
    doc.open("head", &[])?;
    doc.leaf("title", &[], title)?;
    doc.empty("meta", &[("charset", "utf-8")])
}

fn render_nav_xhtml(title: &str, links: &[NavLink]) -> anyhow::Result<String> {
    let mut doc = XmlDoc::xhtml()?;
    open_xhtml_head(&mut doc, title)?;
    doc.close("head")?;
    doc.open("body", &[])?;
    doc.open("nav", &[("epub:type", "toc"), ("id", "toc")])?;
    doc.leaf("h1", &[], title)?;
    doc.open("ol", &[])?;
    for link in links {
        doc.open("li", &[])?;
        doc.leaf("a", &[("href", &link.href)], &link.title)?;
        doc.close("li")?;
    }
    doc.close("ol")?;
    doc.close("nav")?;
    doc.close("body")?;
    doc.close("html")?;
    doc.finish()
}

fn render_toc_ncx(title: &str, uid: &str, links: &[NavLink]) -> anyhow::Result<String> {
    let mut doc = XmlDoc::new()?;
    doc.open(
        "ncx",
        &[
            ("xmlns", "http://www.daisy.org/z3986/2005/ncx/"),
            ("version", "2005-1"),
        ],
    )?;
    doc.open("head", &[])?;
    doc.empty("meta", &[("name", "dtb:uid"), ("content", uid)])?;
    doc.empty("meta", &[("name", "dtb:depth"), ("content", "1")])?;
    doc.close("head")?;
    doc.open("docTitle", &[])?;
    doc.leaf("text", &[], title)?;
    doc.close("docTitle")?;
    doc.open("navMap", &[])?;
    for (idx, link) in links.iter().enumerate() {
        let id = format!("np-{}", idx + 1);
        let order = (idx + 1).to_string();
        doc.open("navPoint", &[("id", &id), ("playOrder", &order)])?;
        doc.open("navLabel", &[])?;
        doc.leaf("text", &[], &link.title)?;
        doc.close("navLabel")?;
        doc.empty("content", &[("src", &link.href)])?;
        doc.close("navPoint")?;
    }
    doc.close("navMap")?;
    doc.close("ncx")?;
    doc.finish()
}

fn render_content_opf(
    title: &str,
    uid: &str,
    modified: &str,
    documents: &[BookDocument],
) -> anyhow::Result<String> {
    let mut doc = XmlDoc::new()?;
    doc.open(
        "package",
        &[
            ("xmlns", "http://www.idpf.org/2007/opf"),
            ("version", "3.0"),
            ("unique-identifier", "bookid"),
            ("xml:lang", TARGET_LANG),
        ],
    )?;
    doc.open(
        "metadata",
        &[("xmlns:dc", "http://purl.org/dc/elements/1.1/")],
    )?;
    doc.leaf("dc:identifier", &[("id", "bookid")], uid)?;
    doc.leaf("dc:title", &[], title)?;
    doc.leaf("dc:language", &[], TARGET_LANG)?;
    doc.leaf("meta", &[("property", "dcterms:modified")], modified)?;
    doc.close("metadata")?;

    doc.open("manifest", &[])?;
    doc.empty(
        "item",
        &[
            ("id", "nav"),
            ("href", "nav.xhtml"),
            ("media-type", "application/xhtml+xml"),
            ("properties", "nav"),
        ],
    )?;
    doc.empty(
        "item",
        &[
            ("id", "ncx"),
            ("href", "toc.ncx"),
            ("media-type", "application/x-dtbncx+xml"),
        ],
    )?;
    doc.empty(
        "item",
        &[("id", "css"), ("href", "style.css"), ("media-type", "text/css")],
    )?;
    for document in documents {
        let href = format!("{}.xhtml", document.id);
        doc.empty(
            "item",
            &[
                ("id", &document.id),
                ("href", &href),
                ("media-type", "application/xhtml+xml"),
            ],
        )?;
    }
    doc.close("manifest")?;

    doc.open("spine", &[("toc", "ncx")])?;
    for document in documents {
        doc.empty("itemref", &[("idref", &document.id)])?;
    }
    doc.close("spine")?;
    doc.close("package")?;
    doc.finish()
}

fn render_text_document(document: &BookDocument) -> anyhow::Result<String> {
    let mut doc = XmlDoc::xhtml()?;
    open_xhtml_head(&mut doc, &document.title)?;
    doc.empty(
        "link",
        &[("rel", "stylesheet"), ("type", "text/css"), ("href", "style.css")],
    )?;
    doc.close("head")?;
    doc.open("body", &[])?;
    doc.raw(&document.body_html)?;
    doc.close("body")?;
    doc.close("html")?;
    doc.finish()
}

static VOID_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<(area|base|br|col|embed|hr|img|input|link|meta|param|source|track|wbr)\b((?:"[^"]*"|'[^']*'|[^'">])*?)\s*/?>"#,
    )
    .expect("void tag regex")
});

/// Self-closes HTML void elements so the markup parses as XML.
fn close_void_tags(html: &str) -> Cow<'_, str> {
    VOID_TAG.replace_all(html, |caps: &regex::Captures<'_>| {
        let tag = &caps[0];
        if tag.ends_with("/>") {
            tag.to_owned()
        } else {
            format!("<{}{} />", &caps[1], &caps[2])
        }
    })
}
