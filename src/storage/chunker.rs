//! Mapping between a library and its bundle of blobs.
//!
//! Current layout, always written:
//!
//! - `index.json`: one [`IndexEntry`] per book
//! - `book_{id}.json`: the full record, when it fits under the size ceiling
//! - `book_{id}_meta.json` + `book_{id}_chunk_{n}.json`: otherwise, with the
//!   chapters split into fixed-size groups and summary/image keys made local
//!   to each group
//!
//! Reading also accepts the old single-file `books.json` and, when neither
//! index nor legacy file is present, whatever per-book files can be found.

use super::{BlobSource, Bundle};
use crate::error::Result;
use crate::models::{BookMeta, BookRecord, Chapter, IndexEntry, Summary};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

pub const INDEX_FILE: &str = "index.json";
pub const LEGACY_FILE: &str = "books.json";
pub const MAX_BLOB_BYTES: usize = 800_000;
pub const CHAPTERS_PER_CHUNK: usize = 10;

pub fn book_file(id: u64) -> String {
    format!("book_{id}.json")
}

pub fn meta_file(id: u64) -> String {
    format!("book_{id}_meta.json")
}

pub fn chunk_file(id: u64, n: usize) -> String {
    format!("book_{id}_chunk_{n}.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Serialized size above which a book is split.
    pub max_blob_bytes: usize,
    pub chapters_per_chunk: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_blob_bytes: MAX_BLOB_BYTES,
            chapters_per_chunk: CHAPTERS_PER_CHUNK,
        }
    }
}

/// Serializes the library into the current layout. Books without an id are
/// left out.
pub fn chunk_library(books: &[BookRecord], policy: &ChunkPolicy) -> Result<Bundle> {
    let mut bundle = Bundle::new();
    let mut index = Vec::with_capacity(books.len());

    for book in books {
        let Some(id) = book.id else {
            tracing::debug!(title = %book.title, "skipping book without id");
            continue;
        };
        index.push(IndexEntry {
            id,
            title: book.title.clone(),
            chapter_count: book.chapters.len(),
            summaries: book.summaries.clone(),
            images: book.images.clone(),
            last_accessed: book.last_accessed,
        });

        let whole = serde_json::to_string(book)?;
        if whole.len() <= policy.max_blob_bytes {
            bundle.insert(book_file(id), whole);
            continue;
        }

        let size = policy.chapters_per_chunk.max(1);
        let groups: Vec<&[Option<Chapter>]> = book.chapters.chunks(size).collect();
        for (n, group) in groups.iter().enumerate() {
            let base = n * size;
            let range = base..base + group.len();
            let chunk = BookRecord {
                id: Some(id),
                title: book.title.clone(),
                chapters: group.to_vec(),
                summaries: localize(&book.summaries, &range),
                images: localize(&book.images, &range),
                last_accessed: book.last_accessed,
            };
            bundle.insert(chunk_file(id, n), serde_json::to_string(&chunk)?);
        }
        let meta = BookMeta {
            id,
            title: book.title.clone(),
            total_chapters: book.chapters.len(),
            chunk_count: groups.len(),
            last_accessed: book.last_accessed,
        };
        tracing::debug!(book_id = id, bytes = whole.len(), chunks = groups.len(), "chunked book");
        bundle.insert(meta_file(id), serde_json::to_string(&meta)?);
    }

    bundle.insert(INDEX_FILE.to_string(), serde_json::to_string(&index)?);
    Ok(bundle)
}

fn localize<V: Clone>(
    map: &BTreeMap<usize, V>,
    range: &std::ops::Range<usize>,
) -> BTreeMap<usize, V> {
    map.range(range.clone())
        .map(|(k, v)| (k - range.start, v.clone()))
        .collect()
}

/// Whether a blob name belongs to the library layout (current or legacy).
pub fn is_library_file(name: &str) -> bool {
    name == INDEX_FILE || name == LEGACY_FILE || BookFile::parse(name).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookFile {
    Single(u64),
    Meta(u64),
    Chunk(u64, usize),
}

impl BookFile {
    fn parse(name: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^book_(\d+)(?:_(meta)|_chunk_(\d+))?\.json$").expect("valid regex")
        });
        let caps = pattern.captures(name)?;
        let id = caps[1].parse().ok()?;
        if caps.get(2).is_some() {
            return Some(BookFile::Meta(id));
        }
        match caps.get(3) {
            Some(n) => Some(BookFile::Chunk(id, n.as_str().parse().ok()?)),
            None => Some(BookFile::Single(id)),
        }
    }
}

/// Files found for one book when scanning names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct FoundFiles {
    single: bool,
    meta: bool,
    chunks: BTreeSet<usize>,
}

/// On-store layout, decided before any book is read.
#[derive(Debug)]
enum Layout {
    Indexed(Vec<IndexEntry>),
    Legacy(Vec<BookRecord>),
    Scavenged(BTreeMap<u64, FoundFiles>),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Indexed,
    Legacy,
    Scavenged,
    Empty,
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayoutKind::Indexed => "indexed",
            LayoutKind::Legacy => "legacy",
            LayoutKind::Scavenged => "scavenged",
            LayoutKind::Empty => "empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Missing,
    Malformed(String),
}

/// A blob that could not contribute to the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUnit {
    pub book_id: u64,
    pub blob: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub layout: LayoutKind,
    pub books: Vec<BookRecord>,
    pub skipped: Vec<SkippedUnit>,
}

/// Rebuilds the library from whichever layout the source holds.
///
/// Blobs that are missing or fail to parse are skipped and listed in the
/// report; only errors from the source itself abort the load.
pub async fn reassemble(source: &dyn BlobSource) -> Result<LoadReport> {
    let layout = detect_layout(source).await?;
    let mut loader = Loader {
        source,
        skipped: Vec::new(),
    };

    let (kind, books) = match layout {
        Layout::Indexed(entries) => {
            let mut books = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Some(mut book) = loader.load_book(entry.id).await? {
                    fill_from_index(&mut book, entry);
                    books.push(book);
                }
            }
            (LayoutKind::Indexed, books)
        }
        Layout::Legacy(books) => (LayoutKind::Legacy, books),
        Layout::Scavenged(found) => {
            let mut books = Vec::with_capacity(found.len());
            for (id, files) in found {
                let book = if files.meta || files.single {
                    loader.load_book(id).await?
                } else {
                    loader.load_orphan_chunks(id, &files.chunks).await?
                };
                books.extend(book);
            }
            (LayoutKind::Scavenged, books)
        }
        Layout::Empty => (LayoutKind::Empty, Vec::new()),
    };

    for unit in &loader.skipped {
        tracing::warn!(book_id = unit.book_id, blob = %unit.blob, reason = ?unit.reason, "skipped blob");
    }
    tracing::info!(layout = %kind, books = books.len(), skipped = loader.skipped.len(), "reassembled library");

    Ok(LoadReport {
        layout: kind,
        books,
        skipped: loader.skipped,
    })
}

async fn detect_layout(source: &dyn BlobSource) -> Result<Layout> {
    if let Some(text) = source.read(INDEX_FILE).await? {
        match serde_json::from_str::<Vec<IndexEntry>>(&text) {
            Ok(entries) if !entries.is_empty() => return Ok(Layout::Indexed(entries)),
            // An empty index still falls through to the other layouts, so a
            // cleared library with leftover book files is scavenged.
            Ok(_) => tracing::debug!("index lists no books"),
            Err(e) => tracing::warn!("unreadable index: {}", e),
        }
    }

    if let Some(text) = source.read(LEGACY_FILE).await? {
        match serde_json::from_str::<Vec<BookRecord>>(&text) {
            Ok(books) => return Ok(Layout::Legacy(books)),
            Err(e) => tracing::warn!("unreadable legacy library file: {}", e),
        }
    }

    let mut found: BTreeMap<u64, FoundFiles> = BTreeMap::new();
    for name in source.names() {
        match BookFile::parse(&name) {
            Some(BookFile::Single(id)) => found.entry(id).or_default().single = true,
            Some(BookFile::Meta(id)) => found.entry(id).or_default().meta = true,
            Some(BookFile::Chunk(id, n)) => {
                found.entry(id).or_default().chunks.insert(n);
            }
            None => {}
        }
    }
    if found.is_empty() {
        Ok(Layout::Empty)
    } else {
        Ok(Layout::Scavenged(found))
    }
}

/// Index entries carry summaries and images as well; they only fill gaps,
/// and only when the chapters loaded line up with the indexed count.
fn fill_from_index(book: &mut BookRecord, entry: IndexEntry) {
    if book.id.is_none() {
        book.id = Some(entry.id);
    }
    if book.title.is_empty() {
        book.title = entry.title;
    }
    if book.last_accessed == 0 {
        book.last_accessed = entry.last_accessed;
    }
    if book.chapters.len() != entry.chapter_count {
        return;
    }
    for (k, v) in entry.summaries {
        book.summaries.entry(k).or_insert(v);
    }
    for (k, v) in entry.images {
        book.images.entry(k).or_insert(v);
    }
}

struct Loader<'a> {
    source: &'a dyn BlobSource,
    skipped: Vec<SkippedUnit>,
}

/// Chapters and re-keyed maps accumulated across chunks.
#[derive(Default)]
struct Assembled {
    chapters: Vec<Option<Chapter>>,
    summaries: BTreeMap<usize, Summary>,
    images: BTreeMap<usize, String>,
    header: Option<(String, i64)>,
}

impl Loader<'_> {
    fn skip(&mut self, book_id: u64, blob: String, reason: SkipReason) {
        self.skipped.push(SkippedUnit {
            book_id,
            blob,
            reason,
        });
    }

    async fn parse_blob<T: serde::de::DeserializeOwned>(
        &mut self,
        book_id: u64,
        name: String,
    ) -> Result<Option<T>> {
        let Some(text) = self.source.read(&name).await? else {
            self.skip(book_id, name, SkipReason::Missing);
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.skip(book_id, name, SkipReason::Malformed(e.to_string()));
                Ok(None)
            }
        }
    }

    /// A meta blob means chunks; otherwise the single book file.
    async fn load_book(&mut self, id: u64) -> Result<Option<BookRecord>> {
        let meta_name = meta_file(id);
        if let Some(text) = self.source.read(&meta_name).await? {
            let meta: BookMeta = match serde_json::from_str(&text) {
                Ok(meta) => meta,
                Err(e) => {
                    self.skip(id, meta_name, SkipReason::Malformed(e.to_string()));
                    return Ok(None);
                }
            };
            let assembled = self.load_chunks(id, 0..meta.chunk_count).await?;
            if assembled.chapters.len() != meta.total_chapters {
                tracing::warn!(
                    book_id = id,
                    expected = meta.total_chapters,
                    loaded = assembled.chapters.len(),
                    "chunked book is incomplete"
                );
            }
            return Ok(Some(BookRecord {
                id: Some(meta.id),
                title: meta.title,
                chapters: assembled.chapters,
                summaries: assembled.summaries,
                images: assembled.images,
                last_accessed: meta.last_accessed,
            }));
        }

        let mut book: Option<BookRecord> = self.parse_blob(id, book_file(id)).await?;
        if let Some(book) = book.as_mut() {
            book.id.get_or_insert(id);
        }
        Ok(book)
    }

    /// Chunks found by name with no meta blob; title comes from the first
    /// chunk that parses.
    async fn load_orphan_chunks(
        &mut self,
        id: u64,
        numbers: &BTreeSet<usize>,
    ) -> Result<Option<BookRecord>> {
        let assembled = self.load_chunks(id, numbers.iter().copied()).await?;
        let Some((title, last_accessed)) = assembled.header else {
            return Ok(None);
        };
        Ok(Some(BookRecord {
            id: Some(id),
            title,
            chapters: assembled.chapters,
            summaries: assembled.summaries,
            images: assembled.images,
            last_accessed,
        }))
    }

    async fn load_chunks(
        &mut self,
        id: u64,
        numbers: impl Iterator<Item = usize>,
    ) -> Result<Assembled> {
        let mut assembled = Assembled::default();
        for n in numbers {
            let Some(chunk) = self.parse_blob::<BookRecord>(id, chunk_file(id, n)).await? else {
                continue;
            };
            // Offset by what has actually been appended; the last chunk may
            // be short and a skipped chunk contributes nothing.
            let offset = assembled.chapters.len();
            assembled
                .summaries
                .extend(chunk.summaries.into_iter().map(|(k, v)| (offset + k, v)));
            assembled
                .images
                .extend(chunk.images.into_iter().map(|(k, v)| (offset + k, v)));
            assembled.chapters.extend(chunk.chapters);
            assembled
                .header
                .get_or_insert((chunk.title, chunk.last_accessed));
        }
        Ok(assembled)
    }
}
