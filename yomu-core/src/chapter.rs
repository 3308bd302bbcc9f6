use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type MangaId = i64;
pub type ChapterId = i64;

/// One chapter as the database collaborator hands it to the engine. Identity
/// fields are immutable for the session; the reading state (`read`,
/// `last_page_read`, `pages_left`, `bookmark`) is written back through the
/// repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub manga_id: MangaId,
    /// Source locator: URL for remote chapters, directory path for local ones.
    pub url: String,
    pub name: String,
    pub volume: Option<f32>,
    /// Declared chapter number; -1.0 when the source declares none.
    pub number: f32,
    pub scanlator: Option<String>,
    pub language: Option<String>,
    /// Position assigned by the source's own listing.
    pub source_order: i64,
    pub read: bool,
    pub last_page_read: usize,
    pub pages_left: usize,
    pub bookmark: bool,
}

impl Chapter {
    pub fn new(id: ChapterId, manga_id: MangaId, name: impl Into<String>) -> Self {
        Self {
            id,
            manga_id,
            url: String::new(),
            name: name.into(),
            volume: None,
            number: -1.0,
            scanlator: None,
            language: None,
            source_order: 0,
            read: false,
            last_page_read: 0,
            pages_left: 0,
            bookmark: false,
        }
    }

    pub fn with_number(mut self, number: f32) -> Self {
        self.number = number;
        self
    }

    pub fn with_source_order(mut self, source_order: i64) -> Self {
        self.source_order = source_order;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    Queued,
    Loading,
    Ready,
    Error,
}

/// Opaque content handle; only meaningful while the page is [`PageStatus::Ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageHandle {
    File(PathBuf),
    Url(String),
}

/// One page descriptor inside a loaded chapter. Pages belong to exactly one
/// chapter resource and do not outlive it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub index: usize,
    pub status: PageStatus,
    pub handle: Option<PageHandle>,
}

impl Page {
    pub fn ready(index: usize, handle: PageHandle) -> Self {
        Self {
            index,
            status: PageStatus::Ready,
            handle: Some(handle),
        }
    }

    pub fn queued(index: usize, handle: PageHandle) -> Self {
        Self {
            index,
            status: PageStatus::Queued,
            handle: Some(handle),
        }
    }
}

/// Reading-history entry persisted when a chapter segment ends (chapter
/// switch or session close).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub chapter_id: ChapterId,
    /// Unix epoch milliseconds.
    pub last_read_at: u64,
    /// Time spent in the chapter during this segment.
    pub time_read_ms: u64,
}
