//! EPUB to chapters, using the `epub` crate for the container and `scraper`
//! for the XHTML inside it.
//!
//! One chapter per spine item, titled from the table of contents. Markup is
//! flattened to plain text; the blank-line heading heuristic used for `.txt`
//! uploads is not applied here.

use crate::error::{Error, Result};
use crate::models::Chapter;
use epub::doc::{EpubDoc, NavPoint};
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::LazyLock;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "pre", "blockquote", "td",
];

static HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3").expect("static selector"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("static selector"));
static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(&BLOCK_TAGS.join(", ")).expect("static selector"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubBook {
    pub title: Option<String>,
    pub chapters: Vec<Chapter>,
}

pub fn looks_like_epub(file_name: Option<&str>, bytes: &[u8]) -> bool {
    file_name.is_some_and(|name| name.to_lowercase().ends_with(".epub"))
        || bytes.starts_with(ZIP_MAGIC)
}

pub fn parse_epub(bytes: &[u8]) -> Result<EpubBook> {
    let mut doc = EpubDoc::from_reader(Cursor::new(bytes.to_vec()))
        .map_err(|e| Error::Epub(e.to_string()))?;

    let title = doc
        .mdata("title")
        .map(|m| collapse_whitespace(&m.value))
        .filter(|t| !t.is_empty());

    let mut toc = HashMap::new();
    collect_toc(&doc.toc, &mut toc);

    let mut chapters = Vec::new();
    for position in 0..doc.get_num_chapters() {
        if !doc.set_current_chapter(position) {
            continue;
        }
        let path = doc.get_current_path().map(|p| toc_key(&p.to_string_lossy()));
        let Some((html, mime)) = doc.get_current_str() else {
            tracing::warn!(position, "unreadable spine item");
            continue;
        };
        if !mime.contains("html") {
            continue;
        }

        let document = Html::parse_document(&html);
        let content = document_text(&document);
        if content.is_empty() {
            continue;
        }
        let title = path
            .and_then(|p| toc.get(&p).cloned())
            .or_else(|| section_heading(&document))
            .unwrap_or_else(|| format!("Section {}", position + 1));
        chapters.push(Chapter { title, content });
    }

    tracing::info!(title = ?title, chapters = chapters.len(), "decoded epub");
    Ok(EpubBook { title, chapters })
}

/// Archive path (no fragment) to label. The first label for a file wins.
fn collect_toc(points: &[NavPoint], toc: &mut HashMap<String, String>) {
    for point in points {
        let label = collapse_whitespace(&point.label);
        if !label.is_empty() {
            toc.entry(toc_key(&point.content.to_string_lossy()))
                .or_insert(label);
        }
        collect_toc(&point.children, toc);
    }
}

fn toc_key(path: &str) -> String {
    let path = path.split('#').next().unwrap_or(path);
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn section_heading(document: &Html) -> Option<String> {
    [&*HEADING, &*TITLE]
        .into_iter()
        .filter_map(|sel| document.select(sel).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

/// Body text, one paragraph per block element. Falls back to the whole body
/// when the markup has no block elements.
fn document_text(document: &Html) -> String {
    let mut paragraphs: Vec<String> = document
        .select(&BLOCKS)
        .filter(|el| !inside_block(el))
        .map(|el| block_text(&el))
        .filter(|text| !text.is_empty())
        .collect();

    if paragraphs.is_empty() {
        if let Some(body) = document.select(&BODY).next() {
            paragraphs.extend(Some(block_text(&body)).filter(|t| !t.is_empty()));
        }
    }
    paragraphs.join("\n\n")
}

fn inside_block(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| BLOCK_TAGS.contains(&a.value().name()))
}

fn block_text(el: &ElementRef) -> String {
    let mut raw = String::new();
    push_text(el, &mut raw);
    raw.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_text(el: &ElementRef, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&text.replace('\n', " ")),
            Node::Element(element) if element.name() == "br" => out.push('\n'),
            Node::Element(element) if matches!(element.name(), "script" | "style") => {}
            Node::Element(_) => {
                if let Some(inner) = ElementRef::wrap(child) {
                    push_text(&inner, out);
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
