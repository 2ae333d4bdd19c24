//! Semantic HTML chunking into parent and child chunks.
//!
//! The extracted HTML is walked in document order while a heading stack
//! (h1–h6) tracks the current section. A section is the content under one
//! heading until the next heading of equal or higher level; content before
//! any heading forms a section with an empty heading path. Sections pack
//! into parent chunks near the parent target size, parents split into child
//! chunks near the child target size. Code and table blocks are atomic: they
//! are never split, and one that alone exceeds the cap becomes its own chunk.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::config::RagSettings;
use crate::rag::tokenizer::{count_tokens, split_sentences};
use crate::rag::{chunk_id, Chunk, ChunkMetadata, ParentChunk};

static BLOCK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, p, ul, ol, dl, pre, table, blockquote")
        .expect("static selector")
});
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").expect("static regex"));

/// Cap on code identifiers recorded per chunk.
const MAX_CODE_IDENTIFIERS: usize = 20;

/// Result of chunking one page.
#[derive(Debug, Default)]
pub struct ChunkedPage {
    /// Context-granularity parent chunks.
    pub parents: Vec<ParentChunk>,
    /// Search-granularity child chunks (including parents materialised as
    /// children).
    pub children: Vec<Chunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Code,
    Table,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    text: String,
    tokens: usize,
}

#[derive(Debug)]
struct Section {
    heading_path: Vec<String>,
    blocks: Vec<Block>,
}

/// Chunk one page of extracted HTML.
pub fn semantic_chunk_html(
    html: &str,
    url: &str,
    lastmod: Option<&str>,
    settings: &RagSettings,
) -> ChunkedPage {
    let sections = collect_sections(html);
    let mut out = ChunkedPage::default();
    // One running counter per page keeps ids stable across rebuilds of
    // identical content and distinct within the page.
    let mut block_index = 0usize;

    for section in sections {
        let parents = pack_parents(&section, settings);
        for parent_blocks in parents {
            let parent_text = join_blocks(&parent_blocks);
            let parent_tokens = count_tokens(&parent_text);
            let parent_id = chunk_id(url, &section.heading_path, block_index);
            block_index += 1;

            out.parents.push(ParentChunk {
                parent_id: parent_id.clone(),
                text: parent_text.clone(),
                url: url.to_string(),
                heading_path: section.heading_path.clone(),
                lastmod: lastmod.map(str::to_string),
            });

            let children = pack_children(&parent_blocks, settings);
            if children.is_empty() || parent_tokens < settings.child_chunk_min_tokens {
                // Too small to split: the parent itself becomes searchable.
                out.children.push(Chunk {
                    chunk_id: parent_id.clone(),
                    parent_id: Some(parent_id.clone()),
                    text: parent_text.clone(),
                    original_text: None,
                    token_count: parent_tokens,
                    metadata: ChunkMetadata {
                        url: url.to_string(),
                        heading_path: section.heading_path.clone(),
                        doc_type: doc_type_of(&parent_blocks),
                        code_identifiers: code_identifiers_of(&parent_blocks),
                        is_parent_as_child: true,
                        tombstoned: false,
                        lastmod: lastmod.map(str::to_string),
                    },
                });
                continue;
            }

            for child_blocks in children {
                let child_text = join_blocks(&child_blocks);
                let child_tokens = count_tokens(&child_text);
                let child_id = chunk_id(url, &section.heading_path, block_index);
                block_index += 1;

                out.children.push(Chunk {
                    chunk_id: child_id,
                    parent_id: Some(parent_id.clone()),
                    text: child_text,
                    original_text: None,
                    token_count: child_tokens,
                    metadata: ChunkMetadata {
                        url: url.to_string(),
                        heading_path: section.heading_path.clone(),
                        doc_type: doc_type_of(&child_blocks),
                        code_identifiers: code_identifiers_of(&child_blocks),
                        is_parent_as_child: false,
                        tombstoned: false,
                        lastmod: lastmod.map(str::to_string),
                    },
                });
            }
        }
    }

    out
}

/// Walk the document in order, grouping blocks into heading-delimited
/// sections.
fn collect_sections(html: &str) -> Vec<Section> {
    let document = Html::parse_document(html);
    let mut sections: Vec<Section> = Vec::new();
    // (level, text) stack; the path is the texts in order.
    let mut heading_stack: Vec<(u8, String)> = Vec::new();
    let mut current = Section {
        heading_path: Vec::new(),
        blocks: Vec::new(),
    };

    for element in document.select(&BLOCK_SELECTOR) {
        if has_block_ancestor(element) {
            continue;
        }
        let name = element.value().name();

        if let Some(level) = heading_level(name) {
            if !current.blocks.is_empty() {
                sections.push(current);
            }
            while heading_stack
                .last()
                .is_some_and(|(l, _)| *l >= level)
            {
                heading_stack.pop();
            }
            let text = normalized_text(element);
            if !text.is_empty() {
                heading_stack.push((level, text));
            }
            current = Section {
                heading_path: heading_stack.iter().map(|(_, t)| t.clone()).collect(),
                blocks: Vec::new(),
            };
            continue;
        }

        let Some(block) = block_of(element, name) else {
            continue;
        };
        current.blocks.push(block);
    }

    if !current.blocks.is_empty() {
        sections.push(current);
    }
    sections
}

/// Whether an ancestor of this element also matches the block selector.
/// Nested matches (a `<p>` inside a `<blockquote>`) belong to the outer
/// block.
fn has_block_ancestor(element: ElementRef) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| BLOCK_SELECTOR.matches(&a))
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn block_of(element: ElementRef, name: &str) -> Option<Block> {
    let (kind, text) = match name {
        "pre" => (BlockKind::Code, code_text(element)),
        "table" => (BlockKind::Table, table_text(element)),
        "ul" | "ol" | "dl" => (BlockKind::Text, list_text(element)),
        _ => (BlockKind::Text, normalized_text(element)),
    };
    if text.trim().is_empty() {
        return None;
    }
    let tokens = count_tokens(&text);
    Some(Block { kind, text, tokens })
}

fn normalized_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Code keeps its line structure.
fn code_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn list_text(element: ElementRef) -> String {
    static ITEMS: Lazy<Selector> =
        Lazy::new(|| Selector::parse("li, dt, dd").expect("static selector"));
    let items: Vec<String> = element
        .select(&ITEMS)
        .map(|li| {
            li.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("- {t}"))
        .collect();
    items.join("\n")
}

fn table_text(element: ElementRef) -> String {
    static ROWS: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("static selector"));
    static CELLS: Lazy<Selector> =
        Lazy::new(|| Selector::parse("th, td").expect("static selector"));
    element
        .select(&ROWS)
        .map(|row| {
            row.select(&CELLS)
                .map(|cell| {
                    cell.text()
                        .collect::<String>()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .filter(|r| !r.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pack a section's blocks into parent-sized groups. Text blocks that alone
/// exceed the absolute cap are split on sentence boundaries; atomic blocks
/// pass through whole.
fn pack_parents(section: &Section, settings: &RagSettings) -> Vec<Vec<Block>> {
    let target = settings.parent_chunk_size;
    let cap = settings.absolute_max_chunk_tokens.max(target);

    let mut units: Vec<Block> = Vec::new();
    for block in &section.blocks {
        if block.tokens > cap && block.kind == BlockKind::Text {
            units.extend(split_text_block(block, cap));
        } else {
            units.push(block.clone());
        }
    }

    let mut parents: Vec<Vec<Block>> = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_tokens = 0usize;

    for unit in units {
        if !current.is_empty() && current_tokens + unit.tokens > target {
            parents.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += unit.tokens;
        current.push(unit);
    }
    if !current.is_empty() {
        parents.push(current);
    }

    // A trailing remainder below the parent minimum joins its predecessor
    // when the merge stays under the cap.
    if parents.len() > 1 {
        let tokens_of = |blocks: &[Block]| blocks.iter().map(|b| b.tokens).sum::<usize>();
        let last = parents.len() - 1;
        let last_tokens = tokens_of(&parents[last]);
        if last_tokens < settings.parent_chunk_min_tokens
            && last_tokens + tokens_of(&parents[last - 1]) <= cap
        {
            let tail = parents.remove(last);
            parents[last - 1].extend(tail);
        }
    }
    parents
}

/// Pack a parent's blocks into child-sized groups, then merge undersized
/// children with their neighbours until the lower bound is met.
fn pack_children(parent_blocks: &[Block], settings: &RagSettings) -> Vec<Vec<Block>> {
    let target = settings.child_chunk_size;
    let min = settings.child_chunk_min_tokens;
    let cap = settings.absolute_max_chunk_tokens.max(target);

    // Split oversized prose into sentence-bounded units; atomic blocks stay
    // whole even above the target.
    let mut units: Vec<Block> = Vec::new();
    for block in parent_blocks {
        if block.tokens > target && block.kind == BlockKind::Text {
            units.extend(split_text_block(block, target));
        } else {
            units.push(block.clone());
        }
    }

    let mut children: Vec<Vec<Block>> = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_tokens = 0usize;

    for unit in units {
        let atomic_oversize = unit.tokens > target;
        if atomic_oversize {
            if !current.is_empty() {
                children.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            children.push(vec![unit]);
            continue;
        }
        if !current.is_empty() && current_tokens + unit.tokens > target {
            children.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += unit.tokens;
        current.push(unit);
    }
    if !current.is_empty() {
        children.push(current);
    }

    merge_undersized(children, min, cap)
}

/// Merge children below `min` tokens into a neighbour, preferring the next
/// one, as long as the merge stays under `cap`.
fn merge_undersized(mut children: Vec<Vec<Block>>, min: usize, cap: usize) -> Vec<Vec<Block>> {
    let tokens_of = |blocks: &[Block]| blocks.iter().map(|b| b.tokens).sum::<usize>();

    let mut i = 0;
    while i < children.len() {
        if children.len() <= 1 {
            break;
        }
        let current_tokens = tokens_of(&children[i]);
        if current_tokens >= min {
            i += 1;
            continue;
        }

        if i + 1 < children.len() && current_tokens + tokens_of(&children[i + 1]) <= cap {
            let next = children.remove(i + 1);
            children[i].extend(next);
            // Re-check the merged chunk; it may still be under the bound.
        } else if i > 0 && current_tokens + tokens_of(&children[i - 1]) <= cap {
            let small = children.remove(i);
            children[i - 1].extend(small);
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }
    children
}

/// Split an oversized text block on sentence boundaries into pieces at most
/// `limit` tokens.
fn split_text_block(block: &Block, limit: usize) -> Vec<Block> {
    let sentences = split_sentences(&block.text);
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for sentence in sentences {
        let tokens = count_tokens(&sentence);
        if !current.is_empty() && current_tokens + tokens > limit {
            pieces.push(Block {
                kind: BlockKind::Text,
                text: std::mem::take(&mut current).trim().to_string(),
                tokens: current_tokens,
            });
            current_tokens = 0;
        }
        current.push_str(&sentence);
        current_tokens += tokens;
    }
    if !current.trim().is_empty() {
        pieces.push(Block {
            kind: BlockKind::Text,
            text: current.trim().to_string(),
            tokens: current_tokens,
        });
    }
    pieces
}

fn join_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn doc_type_of(blocks: &[Block]) -> String {
    let code = blocks.iter().filter(|b| b.kind == BlockKind::Code).count();
    if code == 0 {
        "text".to_string()
    } else if code == blocks.len() {
        "code".to_string()
    } else {
        "mixed".to_string()
    }
}

fn code_identifiers_of(blocks: &[Block]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for block in blocks.iter().filter(|b| b.kind == BlockKind::Code) {
        for m in IDENTIFIER.find_iter(&block.text) {
            let ident = m.as_str().to_string();
            if seen.insert(ident.clone()) {
                out.push(ident);
                if out.len() >= MAX_CODE_IDENTIFIERS {
                    return out;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RagSettings {
        RagSettings {
            base_url: "https://docs.example.com".into(),
            ..Default::default()
        }
    }

    fn paragraph(words: usize) -> String {
        format!("<p>{}</p>", "documentation words flow onward. ".repeat(words / 4))
    }

    #[test]
    fn heading_stack_builds_paths() {
        let html = r#"
            <h1>Guide</h1><p>intro paragraph for the guide.</p>
            <h2>Install</h2><p>install text.</p>
            <h3>Linux</h3><p>linux text.</p>
            <h2>Configure</h2><p>configure text.</p>
        "#;
        let sections = collect_sections(html);
        let paths: Vec<Vec<String>> = sections.iter().map(|s| s.heading_path.clone()).collect();
        assert_eq!(paths[0], vec!["Guide"]);
        assert_eq!(paths[1], vec!["Guide", "Install"]);
        assert_eq!(paths[2], vec!["Guide", "Install", "Linux"]);
        // h2 pops the h3 from the stack.
        assert_eq!(paths[3], vec!["Guide", "Configure"]);
    }

    #[test]
    fn intro_before_any_heading_has_empty_path() {
        let html = "<p>Preamble before the first heading.</p><h1>Title</h1><p>body.</p>";
        let sections = collect_sections(html);
        assert_eq!(sections[0].heading_path, Vec::<String>::new());
    }

    #[test]
    fn nested_blocks_are_not_double_counted() {
        let html = "<blockquote><p>quoted text here</p></blockquote>";
        let sections = collect_sections(html);
        assert_eq!(sections[0].blocks.len(), 1);
    }

    #[test]
    fn code_blocks_are_atomic() {
        let code = format!(
            "<pre><code>{}</code></pre>",
            "let binding = some_function(argument);\n".repeat(300)
        );
        let html = format!("<h1>API</h1>{code}");
        let page = semantic_chunk_html(&html, "https://docs.example.com/api", None, &settings());
        // The giant code block forms its own chunk, unsplit.
        let code_children: Vec<_> = page
            .children
            .iter()
            .filter(|c| c.metadata.doc_type == "code")
            .collect();
        assert_eq!(code_children.len(), 1);
        assert!(code_children[0].token_count > settings().child_chunk_size);
    }

    #[test]
    fn small_parent_becomes_parent_as_child() {
        let html = "<h1>Tiny</h1><p>just a few words here.</p>";
        let page = semantic_chunk_html(&html, "https://docs.example.com/tiny", None, &settings());
        assert_eq!(page.parents.len(), 1);
        assert_eq!(page.children.len(), 1);
        let child = &page.children[0];
        assert!(child.metadata.is_parent_as_child);
        assert_eq!(child.parent_id.as_deref(), Some(child.chunk_id.as_str()));
    }

    #[test]
    fn chunk_ids_are_deterministic_across_rechunks() {
        let html = format!("<h1>Stable</h1>{}{}", paragraph(400), paragraph(400));
        let a = semantic_chunk_html(&html, "https://docs.example.com/s", None, &settings());
        let b = semantic_chunk_html(&html, "https://docs.example.com/s", None, &settings());
        let ids_a: Vec<_> = a.children.iter().map(|c| c.chunk_id.clone()).collect();
        let ids_b: Vec<_> = b.children.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        let parent_ids_a: Vec<_> = a.parents.iter().map(|p| p.parent_id.clone()).collect();
        let parent_ids_b: Vec<_> = b.parents.iter().map(|p| p.parent_id.clone()).collect();
        assert_eq!(parent_ids_a, parent_ids_b);
    }

    #[test]
    fn children_reference_existing_parents() {
        let html = format!(
            "<h1>Doc</h1>{}{}{}",
            paragraph(600),
            paragraph(600),
            paragraph(600)
        );
        let page = semantic_chunk_html(&html, "https://docs.example.com/d", None, &settings());
        let parent_ids: std::collections::HashSet<_> =
            page.parents.iter().map(|p| p.parent_id.clone()).collect();
        for child in &page.children {
            let pid = child.parent_id.as_ref().unwrap();
            assert!(parent_ids.contains(pid), "dangling parent {pid}");
        }
    }

    #[test]
    fn parents_respect_target_size() {
        let html = format!("<h1>Long</h1>{}", paragraph(4000));
        let cfg = settings();
        let page = semantic_chunk_html(&html, "https://docs.example.com/l", None, &cfg);
        assert!(page.parents.len() > 1);
        for parent in &page.parents {
            // Retokenizing joined sentences can differ by a token or two
            // from the per-sentence sums used while packing.
            assert!(
                count_tokens(&parent.text) <= cfg.absolute_max_chunk_tokens + 16,
                "parent over the absolute cap"
            );
        }
    }

    #[test]
    fn undersized_children_are_merged() {
        let cfg = settings();
        let html = format!("<h1>Doc</h1>{}{}", paragraph(900), paragraph(900));
        let page = semantic_chunk_html(&html, "https://docs.example.com/m", None, &cfg);
        for child in &page.children {
            // Parents too small to split are indexed whole and may sit
            // below the child minimum.
            assert!(
                child.token_count >= cfg.child_chunk_min_tokens
                    || child.metadata.is_parent_as_child,
                "child below the minimum: {} tokens",
                child.token_count
            );
        }
    }

    #[test]
    fn code_identifiers_are_collected() {
        let html = "<h1>API</h1><pre><code>fn create_index(config: RagSettings) {}</code></pre>";
        let page = semantic_chunk_html(&html, "https://docs.example.com/c", None, &settings());
        let idents = &page.children[0].metadata.code_identifiers;
        assert!(idents.iter().any(|i| i == "create_index"));
        assert!(idents.iter().any(|i| i == "RagSettings"));
    }

    #[test]
    fn tables_are_atomic_rows() {
        let html = r#"<h1>Matrix</h1><table>
            <tr><th>OS</th><th>Arch</th></tr>
            <tr><td>linux</td><td>amd64</td></tr>
        </table>"#;
        let page = semantic_chunk_html(&html, "https://docs.example.com/t", None, &settings());
        assert!(page.children[0].text.contains("OS | Arch"));
        assert!(page.children[0].text.contains("linux | amd64"));
    }
}
