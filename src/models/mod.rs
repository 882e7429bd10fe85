use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub content: String,
}

/// Per-chapter summary. A complete summary has exactly three bullets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub quote: String,
}

impl Summary {
    pub fn is_complete(&self) -> bool {
        self.bullets.len() == 3
    }
}

/// A book as persisted in the library.
///
/// `chapters` may contain holes (`null` on the wire) after a damaged load;
/// [`BookRecord::cleanup`] removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<Option<Chapter>>,
    #[serde(default)]
    pub summaries: BTreeMap<usize, Summary>,
    #[serde(default)]
    pub images: BTreeMap<usize, String>,
    #[serde(default)]
    pub last_accessed: i64,
}

impl BookRecord {
    pub fn new(title: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        BookRecord {
            id: None,
            title: title.into(),
            chapters: chapters.into_iter().map(Some).collect(),
            summaries: BTreeMap::new(),
            images: BTreeMap::new(),
            last_accessed: 0,
        }
    }

    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index).and_then(Option::as_ref)
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Drops hole chapters and re-keys summaries and images onto the
    /// surviving chapters. Keys pointing at a hole or past the end are
    /// discarded. Returns the number of dropped chapter slots.
    pub fn cleanup(&mut self) -> usize {
        let before = self.chapters.len();
        let mut remap = BTreeMap::new();
        let mut kept = Vec::with_capacity(before);
        for (old, chapter) in std::mem::take(&mut self.chapters).into_iter().enumerate() {
            if let Some(chapter) = chapter {
                remap.insert(old, kept.len());
                kept.push(Some(chapter));
            }
        }
        self.chapters = kept;

        let stale_keys = self.summaries.keys().filter(|k| !remap.contains_key(k)).count()
            + self.images.keys().filter(|k| !remap.contains_key(k)).count();
        self.summaries = rekey(std::mem::take(&mut self.summaries), &remap);
        self.images = rekey(std::mem::take(&mut self.images), &remap);

        let dropped = before - self.chapters.len();
        if dropped > 0 || stale_keys > 0 {
            tracing::warn!(
                book_id = ?self.id,
                dropped_chapters = dropped,
                dropped_keys = stale_keys,
                "cleaned up damaged book record"
            );
        }
        dropped
    }

    pub fn listing(&self) -> Option<BookListing> {
        Some(BookListing {
            id: self.id?,
            title: self.title.clone(),
            chapter_count: self.chapters.len(),
            summary_count: self.summaries.len(),
            last_accessed: self.last_accessed,
        })
    }
}

fn rekey<V>(map: BTreeMap<usize, V>, remap: &BTreeMap<usize, usize>) -> BTreeMap<usize, V> {
    map.into_iter()
        .filter_map(|(old, value)| remap.get(&old).map(|&new| (new, value)))
        .collect()
}

/// One entry of the index blob: everything about a book except its chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapter_count: usize,
    #[serde(default)]
    pub summaries: BTreeMap<usize, Summary>,
    #[serde(default)]
    pub images: BTreeMap<usize, String>,
    #[serde(default)]
    pub last_accessed: i64,
}

/// Header blob for a book stored as several chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMeta {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub total_chapters: usize,
    pub chunk_count: usize,
    #[serde(default)]
    pub last_accessed: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookListing {
    pub id: u64,
    pub title: String,
    pub chapter_count: usize,
    pub summary_count: usize,
    pub last_accessed: i64,
}

#[derive(Debug, Serialize)]
pub struct ProcessResult {
    pub id: u64,
    pub title: String,
    pub chapter_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
