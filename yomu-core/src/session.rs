use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, instrument, warn};

use crate::chapter::{Chapter, ChapterId, MangaId, PageHandle, PageStatus};
use crate::config::ReaderConfig;
use crate::coordinator::LoadCoordinator;
use crate::error::{OrderingError, SessionError};
use crate::events::{EventSender, SessionEvent};
use crate::ordering::{project_chapter_list, ChapterList, ChapterListEntry, OrderingOptions};
use crate::progress::ProgressTracker;
use crate::resource::{LoadOutcome, ResourceArena};
use crate::traits::{ChapterRepository, DownloadManager, PageSource, TrackerSyncService};
use crate::window::WindowSnapshot;

type DisplayFilterFn = dyn Fn(&Chapter) -> bool + Send + Sync;
type TieBreakFn = dyn Fn(&Chapter, &Chapter) -> Ordering + Send + Sync;

struct SessionState {
    manga_id: MangaId,
    /// Full unfiltered chapter snapshot, kept for the navigation projection
    /// and for bookmark toggles on chapters outside the session list.
    all_chapters: Mutex<Vec<Chapter>>,
    list: Arc<ChapterList>,
    arena: Arc<ResourceArena>,
    coordinator: Arc<LoadCoordinator>,
    progress: ProgressTracker,
    /// When the current chapter segment started, for history durations.
    segment_started: Mutex<Instant>,
}

/// One reading session for one manga, exposing the boundary API the viewer
/// drives. Collaborators are passed in explicitly; the engine never calls
/// into UI code, observers consume the event stream.
pub struct ReaderSession {
    repo: Arc<dyn ChapterRepository>,
    source: Arc<dyn PageSource>,
    downloads: Arc<dyn DownloadManager>,
    trackers: Arc<dyn TrackerSyncService>,
    config: ReaderConfig,
    display_filter: Option<Arc<DisplayFilterFn>>,
    tie_break: Option<Arc<TieBreakFn>>,
    events: EventSender,
    events_rx: Mutex<Option<UnboundedReceiver<SessionEvent>>>,
    state: OnceCell<SessionState>,
}

impl ReaderSession {
    pub fn new(
        repo: Arc<dyn ChapterRepository>,
        source: Arc<dyn PageSource>,
        downloads: Arc<dyn DownloadManager>,
        trackers: Arc<dyn TrackerSyncService>,
        config: ReaderConfig,
    ) -> Self {
        let (events, rx) = EventSender::channel();
        Self {
            repo,
            source,
            downloads,
            trackers,
            config,
            display_filter: None,
            tie_break: None,
            events,
            events_rx: Mutex::new(Some(rx)),
            state: OnceCell::new(),
        }
    }

    /// Installs the manga's display filter, consulted when `skip_filtered`
    /// is enabled.
    pub fn with_display_filter(mut self, filter: Arc<DisplayFilterFn>) -> Self {
        self.display_filter = Some(filter);
        self
    }

    /// Installs a custom duplicate-chapter-number tie-break policy.
    pub fn with_tie_break(mut self, tie_break: Arc<TieBreakFn>) -> Self {
        self.tie_break = Some(tie_break);
        self
    }

    /// Takes the receiving half of the event stream. Yields `None` after the
    /// first call.
    pub fn take_events(&self) -> Option<UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    fn state(&self) -> Result<&SessionState, SessionError> {
        self.state.get().ok_or(SessionError::NotInitialized)
    }

    /// Opens the session on `initial_chapter`. Any failure here is fatal,
    /// including the very first chapter load failing; the session must not
    /// proceed.
    #[instrument(skip(self))]
    pub async fn init(
        &self,
        manga_id: MangaId,
        initial_chapter: ChapterId,
    ) -> Result<(), SessionError> {
        if self.state.get().is_some() {
            return Err(SessionError::AlreadyInitialized);
        }

        let all = self
            .repo
            .chapters_for_manga(manga_id)
            .await
            .map_err(|source| SessionError::InitRepository { manga_id, source })?;
        if all.is_empty() {
            return Err(OrderingError::EmptyChapterList(manga_id).into());
        }

        let options = OrderingOptions {
            sort: self.config.sort,
            descending: self.config.descending,
            skip_read: self.config.skip_read,
            skip_filtered: self.config.skip_filtered,
        };
        let list = Arc::new(ChapterList::build(
            &all,
            initial_chapter,
            &options,
            self.display_filter.as_deref(),
            self.tie_break.as_deref(),
        )?);

        let arena = Arc::new(ResourceArena::new());
        let coordinator = LoadCoordinator::new(
            Arc::clone(&list),
            Arc::clone(&arena),
            Arc::clone(&self.source),
            self.events.clone(),
        );
        let progress = ProgressTracker::new(
            manga_id,
            Arc::clone(&self.repo),
            Arc::clone(&self.downloads),
            Arc::clone(&self.trackers),
            self.config.clone(),
            self.events.clone(),
            Arc::clone(&list),
            Arc::clone(&arena),
        );

        let state = SessionState {
            manga_id,
            all_chapters: Mutex::new(all),
            list,
            arena,
            coordinator,
            progress,
            segment_started: Mutex::new(Instant::now()),
        };
        self.state
            .set(state)
            .map_err(|_| SessionError::AlreadyInitialized)?;
        let state = self.state()?;

        match state.coordinator.load_active(initial_chapter).await? {
            LoadOutcome::Loaded => Ok(()),
            LoadOutcome::Failed(cause) => Err(SessionError::InitialChapterLoad {
                chapter_id: initial_chapter,
                cause,
            }),
            LoadOutcome::Cancelled => Err(SessionError::InitialChapterLoad {
                chapter_id: initial_chapter,
                cause: "load was cancelled".to_owned(),
            }),
        }
    }

    /// Handles a page-advance from the viewer. Advancing into a window
    /// neighbor is a chapter switch: the outgoing chapter's progress and
    /// history are persisted before the new chapter's load is requested.
    /// Events naming a chapter outside the window are stale and ignored.
    #[instrument(skip(self))]
    pub async fn on_page_advance(
        &self,
        chapter_id: ChapterId,
        page_index: usize,
        double_page_trailing: bool,
    ) -> Result<(), SessionError> {
        let state = self.state()?;
        let Some(window) = state.coordinator.window() else {
            return Err(SessionError::NotInitialized);
        };
        let Some(resource) = window.slot(chapter_id).cloned() else {
            debug!(chapter = chapter_id, "ignoring page advance for chapter outside the window");
            return Ok(());
        };

        if resource.id() != window.current.id() {
            let elapsed = self.restart_segment_clock(state);
            state
                .progress
                .persist_outgoing(&window.current, elapsed)
                .await?;

            let coordinator = Arc::clone(&state.coordinator);
            tokio::spawn(async move {
                match coordinator.load_active(chapter_id).await {
                    Ok(LoadOutcome::Failed(cause)) => {
                        warn!(chapter = chapter_id, %cause, "active chapter load failed");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(chapter = chapter_id, %err, "active chapter switch failed"),
                }
            });
        }

        // The auto-download policy looks at the chapter following the
        // advanced-into one; take it from the session list so a not-yet
        // re-published window cannot feed it a stale neighbor.
        let next_chapter = state
            .list
            .position_of(chapter_id)
            .and_then(|p| state.list.get(p + 1))
            .cloned();
        state
            .progress
            .on_page_advance(&resource, next_chapter, page_index, double_page_trailing)
            .await
    }

    fn restart_segment_clock(&self, state: &SessionState) -> Duration {
        let mut started = state.segment_started.lock();
        let elapsed = started.elapsed();
        *started = Instant::now();
        elapsed
    }

    /// Flips the persisted bookmark flag. Independent of the load state
    /// machine; a freshly bookmarked chapter is rescued from the deferred
    /// deletion queue.
    pub async fn toggle_bookmark(&self, chapter_id: ChapterId) -> Result<bool, SessionError> {
        let state = self.state()?;

        let snapshot = if let Some(resource) = state.arena.get(chapter_id) {
            resource.update_chapter(|c| {
                c.bookmark = !c.bookmark;
                c.clone()
            })
        } else {
            let mut all = state.all_chapters.lock();
            let chapter = all
                .iter_mut()
                .find(|c| c.id == chapter_id)
                .ok_or(SessionError::UnknownChapter(chapter_id))?;
            chapter.bookmark = !chapter.bookmark;
            chapter.clone()
        };

        // Keep the projection snapshot in step with live resources.
        {
            let mut all = state.all_chapters.lock();
            if let Some(chapter) = all.iter_mut().find(|c| c.id == chapter_id) {
                chapter.bookmark = snapshot.bookmark;
            }
        }

        // The deletion policy must see the new flag even for chapters with
        // no live resource in the arena.
        state.progress.note_bookmark(chapter_id, snapshot.bookmark);
        if snapshot.bookmark {
            self.downloads.cancel_deletion(chapter_id);
        }
        self.repo
            .update_progress(&snapshot)
            .await
            .map_err(SessionError::Persistence)?;
        Ok(snapshot.bookmark)
    }

    /// Copies a `Ready`, file-backed page into `dest_dir`. The outcome is
    /// also published as a `SaveImageResult` event.
    pub fn save_page(
        &self,
        chapter_id: ChapterId,
        page_index: usize,
        dest_dir: &Path,
    ) -> Result<PathBuf, SessionError> {
        let state = self.state()?;
        let result = state
            .arena
            .get(chapter_id)
            .ok_or_else(|| "chapter is not loaded".to_owned())
            .and_then(|resource| Self::copy_page(&resource.pages(), chapter_id, page_index, dest_dir));

        self.events.send(SessionEvent::SaveImageResult {
            chapter_id,
            page: page_index,
            result: result.clone(),
        });
        result.map_err(|cause| {
            debug!(chapter = chapter_id, page = page_index, %cause, "page save failed");
            SessionError::PageNotSaveable {
                chapter_id,
                page: page_index,
            }
        })
    }

    fn copy_page(
        pages: &Option<Arc<Vec<crate::chapter::Page>>>,
        chapter_id: ChapterId,
        page_index: usize,
        dest_dir: &Path,
    ) -> Result<PathBuf, String> {
        let pages = pages.as_ref().ok_or("chapter pages are not loaded")?;
        let page = pages.get(page_index).ok_or("page index out of range")?;
        match (&page.status, &page.handle) {
            (PageStatus::Ready, Some(PageHandle::File(path))) => {
                let name = path
                    .file_name()
                    .ok_or("page file has no name")?
                    .to_string_lossy();
                let dest = dest_dir.join(format!("{chapter_id}_{name}"));
                fs::create_dir_all(dest_dir).map_err(|e| e.to_string())?;
                fs::copy(path, &dest).map_err(|e| e.to_string())?;
                Ok(dest)
            }
            _ => Err("page content is not a readable file".to_owned()),
        }
    }

    /// Closes the reading view: final progress and history are persisted and
    /// the deferred deletions collected during the session are flushed.
    #[instrument(skip(self))]
    pub async fn on_back_pressed(&self) -> Result<(), SessionError> {
        let state = self.state()?;
        if let Some(window) = state.coordinator.window() {
            let elapsed = self.restart_segment_clock(state);
            state
                .progress
                .persist_outgoing(&window.current, elapsed)
                .await?;
        }
        self.downloads.flush_deletions(state.manga_id);
        state.coordinator.shutdown();
        Ok(())
    }

    /// Full unfiltered chapter list, in the configured sort and direction,
    /// with the active chapter flagged. Live in-memory reading state is
    /// overlaid on the database snapshot.
    pub fn chapter_list_projection(&self) -> Result<Vec<ChapterListEntry>, SessionError> {
        let state = self.state()?;
        let all: Vec<Chapter> = state
            .all_chapters
            .lock()
            .iter()
            .map(|c| {
                state
                    .arena
                    .get(c.id)
                    .map(|r| r.chapter())
                    .unwrap_or_else(|| c.clone())
            })
            .collect();
        let active = state.coordinator.snapshot().map(|w| w.current_id());
        Ok(project_chapter_list(
            &all,
            active,
            self.config.sort,
            self.config.descending,
            self.tie_break.as_deref(),
        ))
    }

    pub fn window_snapshot(&self) -> Option<WindowSnapshot> {
        self.state.get().and_then(|s| s.coordinator.snapshot())
    }
}
