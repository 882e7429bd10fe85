use crate::error::{Error, Result};
use crate::models::{BookRecord, Chapter};

const UNTITLED: &str = "Untitled Book";
const MAX_BOOK_TITLE_CHARS: usize = 100;
const MAX_HEADING_CHARS: usize = 50;
const BLANK_LINES_BEFORE_HEADING: usize = 4;

// Front-matter headings that look like chapter titles but never are.
const BANNED_TITLES: &[&str] = &[
    "CONTENTS",
    "TABLE OF CONTENTS",
    "COVER",
    "TITLE",
    "AUTHOR",
    "COPYRIGHT",
    "DEDICATION",
    "PUBLISHING HISTORY",
    "ACKNOWLEDGMENTS",
    "EPIGRAPH",
];

/// Turns raw upload bytes into text, skipping a UTF-8 BOM if present.
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(&[0xEF_u8, 0xBB, 0xBF][..]).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::InvalidUpload("text file is not valid UTF-8".to_string()))
}

/// Builds an unsaved book from plain text.
pub fn process_text(text: &str) -> BookRecord {
    let title = extract_title(text);
    let chapters = parse_chapters(text);
    tracing::info!(title = %title, chapters = chapters.len(), "segmented plain-text book");
    BookRecord::new(title, chapters)
}

/// First non-empty line, trimmed and cut to 100 characters.
pub fn extract_title(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(MAX_BOOK_TITLE_CHARS).collect())
        .unwrap_or_else(|| UNTITLED.to_string())
}

/// Splits plain text into chapters.
///
/// A heading is a short all-caps line preceded by four blank lines. Text
/// before the first heading is dropped, and a trailing heading with no body
/// does not make a chapter.
pub fn parse_chapters(text: &str) -> Vec<Chapter> {
    let padded = format!("{}{}", "\n".repeat(BLANK_LINES_BEFORE_HEADING), text);
    let lines: Vec<&str> = padded.lines().collect();

    let (mut chapters, current) = lines.iter().enumerate().fold(
        (Vec::new(), None::<Chapter>),
        |(mut chapters, current), (idx, line)| {
            if is_chapter_boundary(&lines, idx) {
                if let Some(done) = current {
                    chapters.push(finish(done));
                }
                let heading = Chapter {
                    title: line.trim().to_string(),
                    content: String::new(),
                };
                (chapters, Some(heading))
            } else {
                let current = current.map(|mut open| {
                    open.content.push_str(line);
                    open.content.push('\n');
                    open
                });
                (chapters, current)
            }
        },
    );

    if let Some(last) = current {
        let last = finish(last);
        if !last.content.is_empty() {
            chapters.push(last);
        }
    }

    chapters
}

fn finish(mut chapter: Chapter) -> Chapter {
    chapter.content = chapter.content.trim().to_string();
    chapter
}

fn is_chapter_boundary(lines: &[&str], idx: usize) -> bool {
    idx >= BLANK_LINES_BEFORE_HEADING
        && is_heading_candidate(lines[idx].trim())
        && lines[idx - BLANK_LINES_BEFORE_HEADING..idx]
            .iter()
            .all(|prev| prev.trim().is_empty())
}

fn is_heading_candidate(line: &str) -> bool {
    let len = line.chars().count();
    len > 0
        && len < MAX_HEADING_CHARS
        && line == line.to_uppercase()
        && line.chars().any(char::is_alphabetic)
        && !line
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '.' | ',' | '!' | '?' | '-'))
        && !BANNED_TITLES.contains(&line)
}
