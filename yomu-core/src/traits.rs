use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chapter::{Chapter, ChapterId, HistoryEntry, MangaId, Page};

/// Turns a chapter into its ordered page descriptors. Implementations differ
/// by origin (downloaded files, remote source, local archive); the engine
/// only sees success or failure.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn load(&self, chapter: &Chapter) -> Result<Vec<Page>>;
}

/// Database collaborator: the chapter list and its mutable reading state plus
/// reading history live behind this seam.
#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn chapters_for_manga(&self, manga_id: MangaId) -> Result<Vec<Chapter>>;
    /// Writes the chapter's mutable fields (read, last_page_read, pages_left,
    /// bookmark) through to storage.
    async fn update_progress(&self, chapter: &Chapter) -> Result<()>;
    async fn upsert_history(&self, manga_id: MangaId, entry: &HistoryEntry) -> Result<()>;
}

/// Download queue collaborator. Deletions are deferred: the engine enqueues
/// eligible chapters as it goes and flushes on back-navigation, never
/// mid-read.
pub trait DownloadManager: Send + Sync {
    fn is_downloaded(&self, chapter: &Chapter) -> bool;
    fn enqueue_downloads(&self, chapters: &[Chapter]);
    fn enqueue_deletion(&self, chapter: &Chapter);
    fn cancel_deletion(&self, chapter_id: ChapterId);
    fn flush_deletions(&self, manga_id: MangaId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerWarning {
    pub service: String,
    pub message: String,
}

/// Remote tracker collaborator. Failures are reported, never thrown: the
/// local read-state mutation that triggered a sync is never rolled back.
#[async_trait]
pub trait TrackerSyncService: Send + Sync {
    /// Whether the manga has at least one active tracker (drives the
    /// incognito override).
    fn is_tracked(&self, manga_id: MangaId) -> bool;
    /// Marks the chapter read on every bound service; returns one warning per
    /// failing service.
    async fn mark_chapter_read(&self, manga_id: MangaId, chapter_number: f32)
        -> Vec<TrackerWarning>;
}

/// Inert download manager that still honors the deferred-deletion queue
/// semantics, so the engine's deletion policy stays observable without a real
/// downloader.
#[derive(Debug, Default)]
pub struct NullDownloadManager {
    pending_deletions: Mutex<Vec<ChapterId>>,
}

impl NullDownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_deletions(&self) -> Vec<ChapterId> {
        self.pending_deletions.lock().clone()
    }
}

impl DownloadManager for NullDownloadManager {
    fn is_downloaded(&self, _chapter: &Chapter) -> bool {
        false
    }

    fn enqueue_downloads(&self, chapters: &[Chapter]) {
        debug!(count = chapters.len(), "download request ignored by null manager");
    }

    fn enqueue_deletion(&self, chapter: &Chapter) {
        let mut pending = self.pending_deletions.lock();
        if !pending.contains(&chapter.id) {
            pending.push(chapter.id);
        }
    }

    fn cancel_deletion(&self, chapter_id: ChapterId) {
        self.pending_deletions.lock().retain(|id| *id != chapter_id);
    }

    fn flush_deletions(&self, manga_id: MangaId) {
        let flushed: Vec<ChapterId> = self.pending_deletions.lock().drain(..).collect();
        if !flushed.is_empty() {
            info!(manga = manga_id, chapters = ?flushed, "flushed deferred deletions");
        }
    }
}

/// Tracker service bound to no remote services.
#[derive(Debug, Default)]
pub struct NullTrackerService;

#[async_trait]
impl TrackerSyncService for NullTrackerService {
    fn is_tracked(&self, _manga_id: MangaId) -> bool {
        false
    }

    async fn mark_chapter_read(
        &self,
        _manga_id: MangaId,
        _chapter_number: f32,
    ) -> Vec<TrackerWarning> {
        Vec::new()
    }
}

/// In-memory repository, seedable with a chapter set. Used by tests and by
/// embedders that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryChapterRepository {
    chapters: Mutex<HashMap<MangaId, Vec<Chapter>>>,
    history: Mutex<HashMap<ChapterId, HistoryEntry>>,
}

impl MemoryChapterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_chapters(&self, manga_id: MangaId, chapters: Vec<Chapter>) {
        self.chapters.lock().insert(manga_id, chapters);
    }

    pub fn chapter(&self, manga_id: MangaId, chapter_id: ChapterId) -> Option<Chapter> {
        self.chapters
            .lock()
            .get(&manga_id)?
            .iter()
            .find(|c| c.id == chapter_id)
            .cloned()
    }

    pub fn history_for(&self, chapter_id: ChapterId) -> Option<HistoryEntry> {
        self.history.lock().get(&chapter_id).cloned()
    }
}

#[async_trait]
impl ChapterRepository for MemoryChapterRepository {
    async fn chapters_for_manga(&self, manga_id: MangaId) -> Result<Vec<Chapter>> {
        Ok(self
            .chapters
            .lock()
            .get(&manga_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_progress(&self, chapter: &Chapter) -> Result<()> {
        let mut map = self.chapters.lock();
        if let Some(list) = map.get_mut(&chapter.manga_id) {
            if let Some(stored) = list.iter_mut().find(|c| c.id == chapter.id) {
                stored.read = chapter.read;
                stored.last_page_read = chapter.last_page_read;
                stored.pages_left = chapter.pages_left;
                stored.bookmark = chapter.bookmark;
            }
        }
        Ok(())
    }

    async fn upsert_history(&self, _manga_id: MangaId, entry: &HistoryEntry) -> Result<()> {
        let mut history = self.history.lock();
        let merged = match history.get(&entry.chapter_id) {
            Some(existing) => HistoryEntry {
                chapter_id: entry.chapter_id,
                last_read_at: entry.last_read_at.max(existing.last_read_at),
                time_read_ms: existing.time_read_ms + entry.time_read_ms,
            },
            None => entry.clone(),
        };
        history.insert(entry.chapter_id, merged);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedReadState {
    read: bool,
    last_page_read: usize,
    pages_left: usize,
    bookmark: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedMangaState {
    chapters: HashMap<ChapterId, PersistedReadState>,
    history: HashMap<ChapterId, HistoryEntry>,
}

/// File-backed repository: one JSON file per manga under a root directory,
/// written atomically (temp file, then rename). The chapter set itself comes
/// from a seed (e.g. a filesystem scan); only reading state and history are
/// persisted.
#[derive(Debug)]
pub struct JsonChapterRepository {
    root: PathBuf,
    seeds: Mutex<HashMap<MangaId, Vec<Chapter>>>,
}

impl JsonChapterRepository {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self {
            root,
            seeds: Mutex::new(HashMap::new()),
        })
    }

    pub fn seed_chapters(&self, manga_id: MangaId, chapters: Vec<Chapter>) {
        self.seeds.lock().insert(manga_id, chapters);
    }

    fn state_path(&self, manga_id: MangaId) -> PathBuf {
        self.root.join(format!("{manga_id}.json"))
    }

    fn load_state(&self, manga_id: MangaId) -> Result<PersistedMangaState> {
        let path = self.state_path(manga_id);
        if !path.exists() {
            return Ok(PersistedMangaState::default());
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(state)
    }

    fn save_state(&self, manga_id: MangaId, state: &PersistedMangaState) -> Result<()> {
        let path = self.state_path(manga_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl ChapterRepository for JsonChapterRepository {
    async fn chapters_for_manga(&self, manga_id: MangaId) -> Result<Vec<Chapter>> {
        let seeded = self
            .seeds
            .lock()
            .get(&manga_id)
            .cloned()
            .unwrap_or_default();
        let state = self.load_state(manga_id)?;
        Ok(seeded
            .into_iter()
            .map(|mut chapter| {
                if let Some(persisted) = state.chapters.get(&chapter.id) {
                    chapter.read = persisted.read;
                    chapter.last_page_read = persisted.last_page_read;
                    chapter.pages_left = persisted.pages_left;
                    chapter.bookmark = persisted.bookmark;
                }
                chapter
            })
            .collect())
    }

    async fn update_progress(&self, chapter: &Chapter) -> Result<()> {
        let mut state = self.load_state(chapter.manga_id)?;
        state.chapters.insert(
            chapter.id,
            PersistedReadState {
                read: chapter.read,
                last_page_read: chapter.last_page_read,
                pages_left: chapter.pages_left,
                bookmark: chapter.bookmark,
            },
        );
        self.save_state(chapter.manga_id, &state)
    }

    async fn upsert_history(&self, manga_id: MangaId, entry: &HistoryEntry) -> Result<()> {
        let mut state = self.load_state(manga_id)?;
        let merged = match state.history.get(&entry.chapter_id) {
            Some(existing) => HistoryEntry {
                chapter_id: entry.chapter_id,
                last_read_at: entry.last_read_at.max(existing.last_read_at),
                time_read_ms: existing.time_read_ms + entry.time_read_ms,
            },
            None => entry.clone(),
        };
        state.history.insert(entry.chapter_id, merged);
        self.save_state(manga_id, &state)
    }
}
