//! Rebuilds a chapter body from its segments and the translated paragraphs.
//!
//! Translated text goes back into the original markup: every non-excluded text node of a
//! segment receives a share of its paragraph proportional to the node's original length,
//! so inline formatting survives. Ruby annotations are kept intact; their base text is used
//! as an anchor inside the translation so it is not emitted twice.

use scraper::{ElementRef, Html, Node};

use crate::segment::{Segment, escape_attribute, escape_text, is_excluded_text};

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Reassembles the body markup. Paragraphs map 1:1 onto translatable segments in order.
pub fn rebuild(segments: &[Segment], translated: &str) -> String {
    let expected = segments.iter().filter(|s| s.is_translatable()).count();
    let mut paragraphs = translated
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect::<Vec<_>>();

    if paragraphs.len() != expected {
        tracing::warn!(
            expected = expected,
            got = paragraphs.len(),
            "paragraph count mismatch; surplus is merged into the last paragraph, missing paragraphs keep the source"
        );
    }
    if expected > 0 && paragraphs.len() > expected {
        let surplus = paragraphs.split_off(expected);
        if let Some(last) = paragraphs.last_mut() {
            last.push_str(&surplus.concat());
        }
    }

    let mut paragraphs = paragraphs.into_iter();
    let mut out = String::new();
    for segment in segments {
        if !segment.is_translatable() {
            out.push_str(&segment.original_html);
            continue;
        }
        match paragraphs.next() {
            Some(paragraph) => out.push_str(&inject_translation(segment, &paragraph)),
            None => out.push_str(&segment.original_html),
        }
    }
    out
}

/// Replaces the text of one segment, keeping its markup.
pub fn inject_translation(segment: &Segment, translation: &str) -> String {
    if segment.source_tag.is_empty() {
        let original = &segment.original_html;
        return format!(
            "{}{}{}",
            leading_whitespace(original),
            escape_text(translation),
            trailing_whitespace(original)
        );
    }
    inject_into_markup(&segment.original_html, translation)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Unit {
    Text { weight: usize },
    Ruby { base: String },
}

#[derive(Debug, Default)]
struct Plan {
    texts: Vec<String>,
    before_ruby: Vec<String>,
    after_ruby: Vec<String>,
}

#[derive(Debug, Default)]
struct Cursor {
    text: usize,
    ruby: usize,
}

pub fn inject_into_markup(html: &str, translation: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();

    let mut units = Vec::new();
    collect_units(root, false, &mut units);
    if units.is_empty() {
        return html.to_owned();
    }

    let plan = plan_injection(&units, translation.trim());
    let mut cursor = Cursor::default();
    let mut out = String::new();
    emit_children(root, false, &plan, &mut cursor, &mut out);
    out
}

fn collect_units(el: ElementRef<'_>, excluded: bool, units: &mut Vec<Unit>) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !excluded && !trimmed.is_empty() {
                    units.push(Unit::Text {
                        weight: trimmed.chars().count(),
                    });
                }
            }
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child_el.value().name();
                let child_excluded = excluded || is_excluded_text([name]);
                if name == "ruby" && !child_excluded {
                    units.push(Unit::Ruby {
                        base: ruby_base(child_el),
                    });
                } else if !child_excluded {
                    collect_units(child_el, false, units);
                }
            }
            _ => {}
        }
    }
}

/// Base text of a ruby element: everything except the reading and its fallback parentheses.
fn ruby_base(ruby: ElementRef<'_>) -> String {
    let mut base = String::new();
    collect_ruby_base(ruby, &mut base);
    base.trim().to_owned()
}

fn collect_ruby_base(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child)
                    && !matches!(child_el.value().name(), "rt" | "rp")
                {
                    collect_ruby_base(child_el, out);
                }
            }
            _ => {}
        }
    }
}

enum Overflow {
    BeforeRuby(usize),
    AfterRuby(usize),
}

fn plan_injection(units: &[Unit], translation: &str) -> Plan {
    let text_count = units
        .iter()
        .filter(|u| matches!(u, Unit::Text { .. }))
        .count();
    let ruby_count = units.len() - text_count;
    let mut plan = Plan {
        texts: vec![String::new(); text_count],
        before_ruby: vec![String::new(); ruby_count],
        after_ruby: vec![String::new(); ruby_count],
    };

    let mut receivers: Vec<(usize, usize)> = Vec::new();
    let mut text_index = 0;
    let mut ruby_index = 0;
    let mut cursor = 0;
    let mut last_anchor = None;

    for unit in units {
        match unit {
            Unit::Text { weight } => {
                receivers.push((text_index, *weight));
                text_index += 1;
            }
            Unit::Ruby { base } => {
                let found = (!base.is_empty())
                    .then(|| translation[cursor..].find(base.as_str()))
                    .flatten();
                if let Some(offset) = found {
                    let region = &translation[cursor..cursor + offset];
                    assign_region(&mut plan, region, &receivers, Overflow::BeforeRuby(ruby_index));
                    receivers.clear();
                    cursor += offset + base.len();
                    last_anchor = Some(ruby_index);
                }
                // Unanchored rubies keep their base; surrounding text flows past them.
                ruby_index += 1;
            }
        }
    }

    let tail = &translation[cursor..];
    let overflow = match last_anchor {
        Some(index) => Overflow::AfterRuby(index),
        None => Overflow::AfterRuby(ruby_count.saturating_sub(1)),
    };
    assign_region(&mut plan, tail, &receivers, overflow);
    plan
}

fn assign_region(plan: &mut Plan, region: &str, receivers: &[(usize, usize)], overflow: Overflow) {
    let region = region.trim();
    if receivers.is_empty() {
        if region.is_empty() {
            return;
        }
        let slot = match overflow {
            Overflow::BeforeRuby(index) => plan.before_ruby.get_mut(index),
            Overflow::AfterRuby(index) => plan.after_ruby.get_mut(index),
        };
        if let Some(slot) = slot {
            slot.push_str(region);
        }
        return;
    }

    let weights = receivers.iter().map(|(_, w)| *w).collect::<Vec<_>>();
    for ((text_index, _), piece) in receivers.iter().zip(distribute(region, &weights)) {
        plan.texts[*text_index] = piece;
    }
}

/// Splits `text` into consecutive pieces sized by cumulative weight; the last piece takes
/// the remainder.
fn distribute(text: &str, weights: &[usize]) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    let total_chars = chars.len();
    let total_weight = weights.iter().sum::<usize>();
    let mut pieces = Vec::with_capacity(weights.len());
    let mut start = 0;
    let mut cumulative = 0;

    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let end = if i + 1 == weights.len() {
            total_chars
        } else if total_weight == 0 {
            total_chars * (i + 1) / weights.len()
        } else {
            total_chars * cumulative / total_weight
        };
        let end = end.max(start);
        pieces.push(chars[start..end].iter().collect());
        start = end;
    }
    pieces
}

fn emit_children(
    el: ElementRef<'_>,
    excluded: bool,
    plan: &Plan,
    cursor: &mut Cursor,
    out: &mut String,
) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                if excluded || text.trim().is_empty() {
                    out.push_str(&escape_text(text));
                    continue;
                }
                let replacement = plan.texts.get(cursor.text).map(String::as_str);
                cursor.text += 1;
                match replacement {
                    Some(replacement) => {
                        out.push_str(&escape_text(leading_whitespace(text)));
                        out.push_str(&escape_text(replacement));
                        out.push_str(&escape_text(trailing_whitespace(text)));
                    }
                    None => out.push_str(&escape_text(text)),
                }
            }
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    emit_element(child_el, excluded, plan, cursor, out);
                }
            }
            _ => {}
        }
    }
}

fn emit_element(
    el: ElementRef<'_>,
    parent_excluded: bool,
    plan: &Plan,
    cursor: &mut Cursor,
    out: &mut String,
) {
    let name = el.value().name();
    let excluded = parent_excluded || is_excluded_text([name]);
    if excluded {
        out.push_str(&el.html());
        return;
    }

    if name == "ruby" {
        let index = cursor.ruby;
        cursor.ruby += 1;
        if let Some(before) = plan.before_ruby.get(index) {
            out.push_str(&escape_text(before));
        }
        out.push_str(&el.html());
        if let Some(after) = plan.after_ruby.get(index) {
            out.push_str(&escape_text(after));
        }
        return;
    }

    out.push('<');
    out.push_str(name);
    for (attr, value) in el.value().attrs() {
        out.push_str(&format!(" {attr}=\"{}\"", escape_attribute(value)));
    }
    out.push('>');
    if VOID_TAGS.contains(&name) {
        return;
    }
    emit_children(el, false, plan, cursor, out);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn leading_whitespace(text: &str) -> &str {
    &text[..text.len() - text.trim_start().len()]
}

fn trailing_whitespace(text: &str) -> &str {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return "";
    }
    &text[trimmed.len()..]
}
