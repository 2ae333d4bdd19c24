//! Main-content extraction from fetched pages.
//!
//! A readability-style density pass picks the most content-heavy container.
//! Guardrails protect technical documentation: if the pass returns almost
//! nothing, or strips more than half of the code blocks present in the
//! source, extraction falls back through known main-content selectors to
//! the raw HTML. Boilerplate (nav, footer, sidebars, TOCs) is stripped from
//! whatever wins.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

static CANDIDATES: Lazy<Selector> =
    Lazy::new(|| Selector::parse("main, article, section, div").expect("static selector"));
static PARAGRAPHS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p, pre, code, li, td").expect("static selector"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a").expect("static selector"));
static MAIN_CONTAINER: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div[class*=mdxContent], div[class*=markdown-body], div[class*=doc-content]")
        .expect("static selector")
});
static ARTICLE: Lazy<Selector> = Lazy::new(|| Selector::parse("article").expect("static selector"));
static MAIN: Lazy<Selector> = Lazy::new(|| Selector::parse("main").expect("static selector"));
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("static selector"));

/// Tags dropped wholesale during serialisation.
const BOILERPLATE_TAGS: &[&str] = &["nav", "footer", "header", "aside", "script", "style", "noscript"];

/// Class/id fragments marking boilerplate containers.
const BOILERPLATE_MARKERS: &[&str] = &["sidebar", "toc", "table-of-contents", "breadcrumb", "menu"];

/// Minimum plausible extraction size in bytes.
const MIN_EXTRACT_BYTES: usize = 100;

/// Extract the main content of a page as cleaned HTML.
pub fn extract_main_content(html: &str, url: &str) -> String {
    let original_code_blocks = count_code_blocks(html);
    let document = Html::parse_document(html);

    if let Some(extracted) = readability_extract(&document) {
        let kept_code_blocks = count_code_blocks(&extracted);
        let too_small = extracted.len() < MIN_EXTRACT_BYTES;
        let code_stripped =
            original_code_blocks > 0 && kept_code_blocks * 2 < original_code_blocks;

        if !too_small && !code_stripped {
            tracing::debug!(url = %url, "Extracted main content");
            return extracted;
        }

        let reason = if too_small { "produced almost nothing" } else { "stripped code blocks" };
        if let Some(fallback) = fallback_container(&document) {
            tracing::debug!(url = %url, reason = reason,
                "Readability pass rejected, using semantic container fallback");
            return fallback;
        }
        tracing::warn!(url = %url, reason = reason,
            "Readability pass rejected and no semantic container found, using raw HTML");
        return html.to_string();
    }

    if let Some(fallback) = fallback_container(&document) {
        return fallback;
    }
    html.to_string()
}

/// Count `<pre` / `<code` occurrences, case-insensitive.
fn count_code_blocks(html: &str) -> usize {
    let lower = html.to_ascii_lowercase();
    lower.matches("<pre").count() + lower.matches("<code").count()
}

/// Density-based candidate scoring: favour containers with lots of
/// paragraph and code text, penalise link-heavy regions.
fn readability_extract(document: &Html) -> Option<String> {
    let mut best: Option<(f64, ElementRef)> = None;

    for candidate in document.select(&CANDIDATES) {
        let content_len: usize = candidate
            .select(&PARAGRAPHS)
            .map(|p| p.text().map(str::len).sum::<usize>())
            .sum();
        if content_len == 0 {
            continue;
        }
        let link_len: usize = candidate
            .select(&ANCHORS)
            .map(|a| a.text().map(str::len).sum::<usize>())
            .sum();
        let total_len: usize = candidate.text().map(str::len).sum();
        let link_density = if total_len > 0 {
            link_len as f64 / total_len as f64
        } else {
            1.0
        };

        let score = content_len as f64 * (1.0 - link_density);
        // Prefer tighter containers: a parent scoring the same as its child
        // should lose to the child, so require a strict improvement.
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, candidate));
        }
    }

    best.map(|(_, element)| serialize_clean(element))
}

/// Fallback priority: known main-content container → `<article>` → `<main>`.
fn fallback_container(document: &Html) -> Option<String> {
    document
        .select(&MAIN_CONTAINER)
        .next()
        .or_else(|| document.select(&ARTICLE).next())
        .or_else(|| document.select(&MAIN).next())
        .map(serialize_clean)
}

/// Serialise an element subtree, dropping boilerplate subtrees.
fn serialize_clean(element: ElementRef) -> String {
    let mut out = String::new();
    serialize_node(element, &mut out);
    out
}

fn is_boilerplate(element: &scraper::node::Element) -> bool {
    let name = element.name();
    if BOILERPLATE_TAGS.contains(&name) {
        return true;
    }
    let mut markers = element
        .classes()
        .map(str::to_ascii_lowercase)
        .collect::<HashSet<_>>();
    if let Some(id) = element.id() {
        markers.insert(id.to_ascii_lowercase());
    }
    markers
        .iter()
        .any(|m| BOILERPLATE_MARKERS.iter().any(|b| m.contains(b)))
}

fn serialize_node(element: ElementRef, out: &mut String) {
    let value = element.value();
    if is_boilerplate(value) {
        return;
    }

    let name = value.name();
    out.push('<');
    out.push_str(name);
    for (attr, attr_value) in value.attrs() {
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        out.push_str(&escape_attr(attr_value));
        out.push('"');
    }
    out.push('>');

    for child in element.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    serialize_node(child_ref, out);
                }
            }
            Node::Text(text) => out.push_str(&escape_text(text)),
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

/// Plain-text projection of a page, for contextual enrichment prompts.
pub fn extract_plain_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = document
        .select(&BODY)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut text = String::new();
    collect_text(root, &mut text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(element: ElementRef, out: &mut String) {
    if is_boilerplate(element.value()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    collect_text(child_ref, out);
                }
            }
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            _ => {}
        }
    }
}
