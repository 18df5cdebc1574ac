use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Node};

/// Block-level containers that produce one translatable paragraph each.
pub(crate) const BLOCK_TAGS: &[&str] = &[
    "p",
    "div",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "blockquote",
    "li",
    "dt",
    "dd",
    "figcaption",
];

pub(crate) const SKIP_TAGS: &[&str] = &[
    "img", "image", "svg", "br", "hr", "table", "thead", "tbody", "tr", "td", "th", "script",
    "style",
];

/// Ruby readings are never part of the translatable text.
pub(crate) const RUBY_ANNOTATION_TAGS: &[&str] = &["rt", "rp"];

const MEDIA_TAGS: &[&str] = &["img", "image", "svg"];

// Children with one of these tags turn their parent into a transparent wrapper.
const SECTIONING_TAGS: &[&str] = &[
    "section", "article", "aside", "header", "footer", "main", "nav", "figure", "ul", "ol", "dl",
    "table",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Heading,
    Image,
    Skip,
}

/// One structural unit of a chapter body.
///
/// Concatenating `original_html` of every segment in order reproduces the body markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Originating tag name; empty for bare text and comments.
    pub source_tag: String,
    pub translatable_text: String,
    pub original_html: String,
    pub attributes: BTreeMap<String, String>,
    pub translate_flag: bool,
    pub contains_media: bool,
}

impl Segment {
    fn passthrough(
        kind: SegmentKind,
        source_tag: &str,
        original_html: String,
        attributes: BTreeMap<String, String>,
        contains_media: bool,
    ) -> Self {
        Self {
            kind,
            source_tag: source_tag.to_owned(),
            translatable_text: String::new(),
            original_html,
            attributes,
            translate_flag: false,
            contains_media,
        }
    }

    pub fn is_translatable(&self) -> bool {
        matches!(self.kind, SegmentKind::Text | SegmentKind::Heading) && self.translate_flag
    }

    pub fn has_ruby(&self) -> bool {
        self.original_html.contains("<ruby")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentedChapter {
    /// Translatable text of every flagged segment, one paragraph per line.
    pub plain_text: String,
    pub segments: Vec<Segment>,
}

impl SegmentedChapter {
    pub fn translatable_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_translatable()).count()
    }

    pub fn media_count(&self) -> usize {
        self.segments.iter().filter(|s| s.contains_media).count()
    }
}

/// Splits one chapter document into ordered segments.
///
/// Never fails: malformed markup goes through the HTML parser's error recovery and is
/// segmented on a best-effort basis.
pub fn segment_chapter(html: &str) -> SegmentedChapter {
    let document = Html::parse_document(html);
    let root = find_body(&document).unwrap_or_else(|| document.root_element());

    let mut segments = Vec::new();
    segment_children(root, &mut segments);

    let plain_text = segments
        .iter()
        .filter(|s| s.translate_flag)
        .map(|s| s.translatable_text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    SegmentedChapter {
        plain_text,
        segments,
    }
}

/// Plain text of a whole document, one line per text node. Used for length filters and
/// placeholders where structure does not matter.
pub fn document_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = find_body(&document).unwrap_or_else(|| document.root_element());
    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let in_script = node
                .ancestors()
                .filter_map(|a| a.value().as_element())
                .any(|e| matches!(e.name(), "script" | "style"));
            if in_script {
                return None;
            }
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn find_body(document: &Html) -> Option<ElementRef<'_>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "body")
}

fn segment_children(parent: ElementRef<'_>, out: &mut Vec<Segment>) {
    for child in parent.children() {
        match child.value() {
            Node::Text(text) => out.push(text_node_segment(text)),
            Node::Comment(comment) => out.push(Segment::passthrough(
                SegmentKind::Skip,
                "",
                format!("<!--{}-->", &**comment),
                BTreeMap::new(),
                false,
            )),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    segment_element(el, out);
                }
            }
            _ => {}
        }
    }
}

fn text_node_segment(raw: &str) -> Segment {
    let original_html = escape_text(raw);
    let text = join_text_pieces([raw]);
    if text.is_empty() {
        return Segment::passthrough(
            SegmentKind::Skip,
            "",
            original_html,
            BTreeMap::new(),
            false,
        );
    }
    Segment {
        kind: SegmentKind::Text,
        source_tag: String::new(),
        translatable_text: text,
        original_html,
        attributes: BTreeMap::new(),
        translate_flag: true,
        contains_media: false,
    }
}

fn segment_element(el: ElementRef<'_>, out: &mut Vec<Segment>) {
    let tag = el.value().name().to_ascii_lowercase();
    let attributes = el
        .value()
        .attrs()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect::<BTreeMap<_, _>>();
    let media = contains_media(el);

    if SKIP_TAGS.contains(&tag.as_str()) {
        let kind = if MEDIA_TAGS.contains(&tag.as_str()) {
            SegmentKind::Image
        } else {
            SegmentKind::Skip
        };
        out.push(Segment::passthrough(kind, &tag, el.html(), attributes, media));
        return;
    }

    let heading = is_heading(&tag);
    if !heading && has_flow_children(el) {
        let (open, close) = split_outer_html(el);
        out.push(Segment::passthrough(
            SegmentKind::Skip,
            &tag,
            open,
            attributes,
            false,
        ));
        segment_children(el, out);
        out.push(Segment::passthrough(
            SegmentKind::Skip,
            &tag,
            close,
            BTreeMap::new(),
            false,
        ));
        return;
    }

    let is_block = heading || BLOCK_TAGS.contains(&tag.as_str());
    if is_block && el.text().all(|t| t.trim().is_empty()) {
        out.push(Segment::passthrough(
            SegmentKind::Skip,
            &tag,
            el.html(),
            attributes,
            media,
        ));
        return;
    }

    if heading {
        out.push(Segment::passthrough(
            SegmentKind::Heading,
            &tag,
            el.html(),
            attributes,
            media,
        ));
        return;
    }

    let text = translatable_text(el);
    if text.is_empty() {
        let kind = if is_block {
            SegmentKind::Text
        } else {
            SegmentKind::Skip
        };
        out.push(Segment::passthrough(kind, &tag, el.html(), attributes, media));
        return;
    }

    out.push(Segment {
        kind: SegmentKind::Text,
        source_tag: tag,
        translatable_text: text,
        original_html: el.html(),
        attributes,
        translate_flag: true,
        contains_media: media,
    });
}

pub(crate) fn is_heading(tag: &str) -> bool {
    matches!(tag, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

/// Whether a text node with these ancestor tags is excluded from translation.
///
/// Shared by extraction and injection so both walk the same set of text nodes.
pub(crate) fn is_excluded_text<'a>(ancestor_tags: impl IntoIterator<Item = &'a str>) -> bool {
    ancestor_tags.into_iter().any(|tag| {
        is_heading(tag) || SKIP_TAGS.contains(&tag) || RUBY_ANNOTATION_TAGS.contains(&tag)
    })
}

pub(crate) fn translatable_text(el: ElementRef<'_>) -> String {
    let pieces = el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let excluded = is_excluded_text(
            node.ancestors()
                .filter_map(|a| a.value().as_element())
                .map(|e| e.name()),
        );
        (!excluded).then_some(&**text)
    });
    join_text_pieces(pieces)
}

/// Concatenates text node contents into a single paragraph.
///
/// Source line breaks are formatting only; lines are glued back together, with a space
/// kept between two ASCII words.
pub(crate) fn join_text_pieces<'a>(pieces: impl IntoIterator<Item = &'a str>) -> String {
    let joined = pieces.into_iter().collect::<String>();
    let mut out = String::new();
    for line in joined.split('\n') {
        let line = line.trim_matches(|c: char| c.is_ascii_whitespace());
        if line.is_empty() {
            continue;
        }
        let needs_space = out.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
            && line.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        if needs_space {
            out.push(' ');
        }
        out.push_str(line);
    }
    out.trim().to_owned()
}

fn has_flow_children(el: ElementRef<'_>) -> bool {
    el.children().filter_map(ElementRef::wrap).any(|child| {
        let name = child.value().name();
        BLOCK_TAGS.contains(&name) || SECTIONING_TAGS.contains(&name)
    })
}

fn contains_media(el: ElementRef<'_>) -> bool {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .any(|e| MEDIA_TAGS.contains(&e.value().name()))
}

fn split_outer_html(el: ElementRef<'_>) -> (String, String) {
    let outer = el.html();
    let inner = el.inner_html();
    let close = format!("</{}>", el.value().name());
    if let Some(without_close) = outer.strip_suffix(&close)
        && let Some(open) = without_close.strip_suffix(&inner)
    {
        return (open.to_owned(), close);
    }

    let mut open = format!("<{}", el.value().name());
    for (name, value) in el.value().attrs() {
        open.push_str(&format!(" {name}=\"{}\"", escape_attribute(value)));
    }
    open.push('>');
    (open, close)
}

pub(crate) fn escape_text(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('\u{a0}', "&nbsp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn escape_attribute(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('\u{a0}', "&nbsp;")
        .replace('"', "&quot;")
}
