use crate::error::{Error, Result};
use crate::models::{BookListing, BookRecord, Summary, now_millis};
use crate::storage::chunker::{self, ChunkPolicy};
use crate::storage::{DocumentStore, FileChanges, RemoteBlobs};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// The bundle the library was last read from or written to.
#[derive(Debug, Clone)]
struct RemoteHandle {
    id: String,
    files: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    loaded: bool,
    dirty: bool,
    books: Vec<BookRecord>,
    remote: Option<RemoteHandle>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    label: String,
    policy: ChunkPolicy,
    state: Mutex<State>,
    // Serializes saves so the remote handle is never raced.
    save_lock: Mutex<()>,
}

/// In-memory library backed by a remote document store.
///
/// Bulk changes (adding a book, clearing) are saved right away. Per-chapter
/// updates are coalesced and saved once no further update arrives within
/// the debounce window.
pub struct LibraryService {
    inner: Arc<Inner>,
    saves: mpsc::UnboundedSender<()>,
}

impl LibraryService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        label: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self::with_policy(store, label, debounce, ChunkPolicy::default())
    }

    pub fn with_policy(
        store: Arc<dyn DocumentStore>,
        label: impl Into<String>,
        debounce: Duration,
        policy: ChunkPolicy,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            label: label.into(),
            policy,
            state: Mutex::new(State::default()),
            save_lock: Mutex::new(()),
        });
        let (saves, rx) = mpsc::unbounded_channel();
        tokio::spawn(debounced_saves(inner.clone(), rx, debounce));
        LibraryService { inner, saves }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Reads the library from the remote store, replacing what is cached.
    pub async fn load(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        self.inner.load_into(&mut state).await?;
        Ok(state.books.len())
    }

    pub async fn list_books(&self) -> Result<Vec<BookListing>> {
        let mut state = self.inner.loaded_state().await?;
        state
            .books
            .sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed).then(b.id.cmp(&a.id)));
        Ok(state.books.iter().filter_map(BookRecord::listing).collect())
    }

    /// Returns the book and marks it as just accessed.
    pub async fn get_book(&self, id: u64) -> Result<BookRecord> {
        let book = {
            let mut state = self.inner.loaded_state().await?;
            let book = find_mut(&mut state.books, id)?;
            book.last_accessed = now_millis();
            let book = book.clone();
            state.dirty = true;
            book
        };
        self.schedule_save();
        Ok(book)
    }

    /// Stores a new book under the next free id and saves immediately.
    pub async fn add_book(&self, mut draft: BookRecord) -> Result<u64> {
        let id = {
            let mut state = self.inner.loaded_state().await?;
            let id = state.books.iter().filter_map(|b| b.id).max().unwrap_or(0) + 1;
            draft.id = Some(id);
            draft.last_accessed = now_millis();
            tracing::info!(book_id = id, title = %draft.title, chapters = draft.chapters.len(), "adding book");
            state.books.push(draft);
            state.dirty = true;
            id
        };
        self.flush().await?;
        Ok(id)
    }

    /// Replaces a stored book with the same id.
    pub async fn update_book(&self, mut record: BookRecord) -> Result<()> {
        let id = record
            .id
            .ok_or_else(|| Error::InvalidUpload("book has no id".to_string()))?;
        {
            let mut state = self.inner.loaded_state().await?;
            let slot = find_mut(&mut state.books, id)?;
            record.last_accessed = now_millis();
            *slot = record;
            state.dirty = true;
        }
        self.schedule_save();
        Ok(())
    }

    pub async fn set_summary(&self, id: u64, index: usize, summary: Summary) -> Result<()> {
        self.edit_chapter(id, index, |book| {
            book.summaries.insert(index, summary);
        })
        .await
    }

    pub async fn set_image(&self, id: u64, index: usize, image: String) -> Result<()> {
        self.edit_chapter(id, index, |book| {
            book.images.insert(index, image);
        })
        .await
    }

    async fn edit_chapter(
        &self,
        id: u64,
        index: usize,
        edit: impl FnOnce(&mut BookRecord),
    ) -> Result<()> {
        {
            let mut state = self.inner.loaded_state().await?;
            let book = find_mut(&mut state.books, id)?;
            if book.chapter(index).is_none() {
                return Err(Error::ChapterNotFound { book_id: id, index });
            }
            edit(book);
            book.last_accessed = now_millis();
            state.dirty = true;
        }
        self.schedule_save();
        Ok(())
    }

    /// Removes every book and saves immediately.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.inner.loaded_state().await?;
            tracing::info!(books = state.books.len(), "clearing library");
            state.books.clear();
            state.dirty = true;
        }
        self.flush().await
    }

    /// Saves now if anything changed since the last save.
    pub async fn flush(&self) -> Result<()> {
        self.inner.save().await
    }

    fn schedule_save(&self) {
        if self.saves.send(()).is_err() {
            tracing::warn!("save worker has stopped; change kept in memory only");
        }
    }
}

fn find_mut(books: &mut [BookRecord], id: u64) -> Result<&mut BookRecord> {
    books
        .iter_mut()
        .find(|b| b.id == Some(id))
        .ok_or(Error::BookNotFound(id))
}

impl Inner {
    async fn loaded_state(&self) -> Result<tokio::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_into(&mut state).await?;
        }
        Ok(state)
    }

    async fn load_into(&self, state: &mut State) -> Result<()> {
        let (books, remote) = self
            .fetch()
            .await
            .map_err(|e| Error::LibraryLoad(e.to_string()))?;
        state.books = books;
        state.remote = remote;
        state.loaded = true;
        state.dirty = false;
        Ok(())
    }

    async fn fetch(&self) -> Result<(Vec<BookRecord>, Option<RemoteHandle>)> {
        let Some(id) = self.store.find_bundle(&self.label).await? else {
            tracing::info!(label = %self.label, "no library bundle yet");
            return Ok((Vec::new(), None));
        };
        let bundle = self.store.fetch_bundle(&id).await?;
        let report = chunker::reassemble(&RemoteBlobs::new(self.store.as_ref(), &bundle)).await?;

        let mut books = report.books;
        let dropped: usize = books.iter_mut().map(BookRecord::cleanup).sum();
        if dropped > 0 {
            tracing::warn!(dropped, "removed empty chapter slots while loading");
        }
        tracing::info!(
            gist = %id,
            layout = %report.layout,
            books = books.len(),
            skipped = report.skipped.len(),
            "loaded library"
        );

        let files = bundle.files.keys().cloned().collect();
        Ok((books, Some(RemoteHandle { id, files })))
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let (books, remote) = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            (state.books.clone(), state.remote.clone())
        };

        match self.write(&books, remote).await {
            Ok(handle) => {
                self.state.lock().await.remote = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.dirty = true;
                Err(Error::LibrarySave(e.to_string()))
            }
        }
    }

    /// Writes the whole library in the current layout. Files of an earlier
    /// layout that are no longer produced are deleted.
    async fn write(
        &self,
        books: &[BookRecord],
        remote: Option<RemoteHandle>,
    ) -> Result<RemoteHandle> {
        let bundle = chunker::chunk_library(books, &self.policy)?;
        let names: BTreeSet<String> = bundle.keys().cloned().collect();
        let changes: FileChanges = bundle.into_iter().map(|(k, v)| (k, Some(v))).collect();

        let id = match remote {
            Some(remote) => {
                let mut patch = changes.clone();
                for stale in remote.files.difference(&names) {
                    if chunker::is_library_file(stale) {
                        patch.insert(stale.clone(), None);
                    }
                }
                match self.store.patch_bundle(&remote.id, &patch).await {
                    Ok(()) => remote.id,
                    Err(Error::Remote { status: 404, .. }) => {
                        tracing::warn!(gist = %remote.id, "library gist no longer exists");
                        self.find_or_create(&changes).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            None => self.find_or_create(&changes).await?,
        };

        tracing::info!(gist = %id, books = books.len(), files = names.len(), "saved library");
        Ok(RemoteHandle { id, files: names })
    }

    async fn find_or_create(&self, changes: &FileChanges) -> Result<String> {
        match self.store.find_bundle(&self.label).await? {
            // Created elsewhere since we loaded; last write wins.
            Some(id) => {
                self.store.patch_bundle(&id, changes).await?;
                Ok(id)
            }
            None => self.store.create_bundle(&self.label, changes).await,
        }
    }
}

/// Coalesces save requests: saves once the channel has been quiet for
/// `window`, and once more when the channel closes with a save pending.
async fn debounced_saves(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<()>, window: Duration) {
    while rx.recv().await.is_some() {
        let mut closed = false;
        loop {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
        if let Err(e) = inner.save().await {
            tracing::warn!("debounced save failed: {}", e);
        }
        if closed {
            break;
        }
    }
    tracing::debug!("save worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chapter;
    use crate::storage::Bundle;
    use crate::storage::memory::MemoryStore;

    const LABEL: &str = "test-library";
    const WINDOW: Duration = Duration::from_millis(2000);

    fn draft(title: &str, chapters: usize) -> BookRecord {
        BookRecord::new(
            title,
            (0..chapters)
                .map(|i| Chapter {
                    title: format!("CHAPTER {i}"),
                    content: format!("body {i}"),
                })
                .collect(),
        )
    }

    fn summary(tag: &str) -> Summary {
        Summary {
            bullets: vec![tag.into(), tag.into(), tag.into()],
            quote: tag.into(),
        }
    }

    fn service(store: &Arc<MemoryStore>) -> LibraryService {
        LibraryService::new(store.clone(), LABEL, WINDOW)
    }

    #[tokio::test]
    async fn test_add_book_assigns_ids_and_saves() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);

        assert_eq!(library.add_book(draft("One", 2)).await.unwrap(), 1);
        assert_eq!(library.add_book(draft("Two", 1)).await.unwrap(), 2);
        assert_eq!(store.writes(), 2);

        let files = store.files(LABEL).unwrap();
        assert!(files.contains_key("index.json"));
        assert!(files.contains_key("book_1.json"));
        assert!(files.contains_key("book_2.json"));

        let reloaded = service(&store);
        let listing = reloaded.list_books().await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].title, "Two");
    }

    #[tokio::test]
    async fn test_ids_continue_after_highest_existing() {
        let mut existing = draft("Old", 1);
        existing.id = Some(41);
        let bundle = chunker::chunk_library(&[existing], &ChunkPolicy::default()).unwrap();
        let store = Arc::new(MemoryStore::with_bundle(LABEL, bundle));

        let library = service(&store);
        assert_eq!(library.load().await.unwrap(), 1);
        assert_eq!(library.add_book(draft("New", 1)).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_updates_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        let id = library.add_book(draft("Book", 3)).await.unwrap();
        assert_eq!(store.writes(), 1);

        for index in 0..3 {
            library.set_summary(id, index, summary("s")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(store.writes(), 1);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(store.writes(), 2);

        let files = store.files(LABEL).unwrap();
        let saved: BookRecord = serde_json::from_str(&files["book_1.json"]).unwrap();
        assert_eq!(saved.summaries.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_supersedes_pending_debounce() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        let id = library.add_book(draft("Book", 1)).await.unwrap();

        library.set_image(id, 0, "aW1n".to_string()).await.unwrap();
        library.flush().await.unwrap();
        assert_eq!(store.writes(), 2);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_chapter_index_is_validated() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        let id = library.add_book(draft("Book", 2)).await.unwrap();

        let err = library.set_summary(id, 5, summary("x")).await.unwrap_err();
        assert!(matches!(err, Error::ChapterNotFound { index: 5, .. }));
        let err = library.set_summary(99, 0, summary("x")).await.unwrap_err();
        assert!(matches!(err, Error::BookNotFound(99)));
    }

    #[tokio::test]
    async fn test_clear_removes_stale_files() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        library.add_book(draft("A", 1)).await.unwrap();
        library.add_book(draft("B", 1)).await.unwrap();

        library.clear().await.unwrap();

        let files = store.files(LABEL).unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["index.json"]);
        assert_eq!(files["index.json"], "[]");
        assert!(service(&store).list_books().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_library_is_migrated_on_next_save() {
        let mut old = draft("Legacy", 2);
        old.id = Some(3);
        old.summaries.insert(1, summary("kept"));
        let bundle = Bundle::from([(
            chunker::LEGACY_FILE.to_string(),
            serde_json::to_string(&vec![old]).unwrap(),
        )]);
        let store = Arc::new(MemoryStore::with_bundle(LABEL, bundle));
        let library = service(&store);

        let book = library.get_book(3).await.unwrap();
        assert_eq!(book.summaries.get(&1), Some(&summary("kept")));
        // Reading does not rewrite anything.
        assert!(store.files(LABEL).unwrap().contains_key("books.json"));

        library.flush().await.unwrap();
        let files = store.files(LABEL).unwrap();
        assert!(!files.contains_key("books.json"));
        assert!(files.contains_key("book_3.json"));
    }

    #[tokio::test]
    async fn test_loaded_books_are_cleaned_up() {
        let json = r#"[{"id":1,"title":"Holey","chapters":[{"title":"A","content":"a"},null,{"title":"B","content":"b"}],"summaries":{"0":{"bullets":[],"quote":"s0"},"2":{"bullets":[],"quote":"s2"}},"images":{},"lastAccessed":1}]"#;
        let bundle = Bundle::from([(chunker::LEGACY_FILE.to_string(), json.to_string())]);
        let store = Arc::new(MemoryStore::with_bundle(LABEL, bundle));
        let library = service(&store);

        let book = library.get_book(1).await.unwrap();
        assert_eq!(book.chapter_count(), 2);
        assert_eq!(book.summaries[&1].quote, "s2");
        assert_eq!(book.summaries[&0].quote, "s0");
    }

    #[tokio::test]
    async fn test_chunked_book_switches_back_to_single_file() {
        let store = Arc::new(MemoryStore::new());
        let policy = ChunkPolicy {
            max_blob_bytes: 200,
            chapters_per_chunk: 2,
        };
        let library = LibraryService::with_policy(store.clone(), LABEL, WINDOW, policy);
        let id = library.add_book(draft("Long", 5)).await.unwrap();
        assert!(store.files(LABEL).unwrap().contains_key("book_1_meta.json"));

        let mut shorter = library.get_book(id).await.unwrap();
        shorter.chapters.truncate(1);
        library.update_book(shorter).await.unwrap();
        library.flush().await.unwrap();

        let files = store.files(LABEL).unwrap();
        assert!(files.contains_key("book_1.json"));
        assert!(!files.keys().any(|k| k.contains("chunk") || k.contains("meta")));
    }

    #[tokio::test]
    async fn test_load_failure_is_reported_once() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let library = service(&store);

        let err = library.list_books().await.unwrap_err();
        assert!(matches!(err, Error::LibraryLoad(_)));
        assert!(err.to_string().starts_with("failed to load library"));

        store.set_offline(false);
        assert!(library.list_books().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_by_next_flush() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        library.load().await.unwrap();

        store.set_offline(true);
        let err = library.add_book(draft("A", 1)).await.unwrap_err();
        assert!(matches!(err, Error::LibrarySave(_)));

        store.set_offline(false);
        library.flush().await.unwrap();
        assert!(store.files(LABEL).unwrap().contains_key("book_1.json"));
    }

    #[tokio::test]
    async fn test_deleted_gist_is_recreated_on_save() {
        let store = Arc::new(MemoryStore::new());
        let library = service(&store);
        library.add_book(draft("Kept", 2)).await.unwrap();
        store.remove_bundle(LABEL);

        library.set_summary(1, 1, summary("s")).await.unwrap();
        library.flush().await.unwrap();
        library.add_book(draft("Next", 1)).await.unwrap();

        let files = store.files(LABEL).unwrap();
        let book: BookRecord = serde_json::from_str(&files["book_1.json"]).unwrap();
        assert_eq!(book.summaries.get(&1), Some(&summary("s")));
        assert!(files.contains_key("book_2.json"));
    }
}
