use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chapter::{Chapter, ChapterId, HistoryEntry, MangaId};
use crate::config::ReaderConfig;
use crate::error::SessionError;
use crate::events::{EventSender, SessionEvent};
use crate::ordering::ChapterList;
use crate::resource::{ChapterResource, ResourceArena};
use crate::traits::{ChapterRepository, DownloadManager, TrackerSyncService};

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reacts to page-advance events: read-state accounting, read-completion,
/// and the side-effect train (persistence, tracker sync, delete-N-behind,
/// auto-download) in that order.
pub(crate) struct ProgressTracker {
    manga_id: MangaId,
    repo: Arc<dyn ChapterRepository>,
    downloads: Arc<dyn DownloadManager>,
    trackers: Arc<dyn TrackerSyncService>,
    config: ReaderConfig,
    events: EventSender,
    list: Arc<ChapterList>,
    arena: Arc<ResourceArena>,
    auto_download_fired: Mutex<HashSet<ChapterId>>,
    /// Mid-session bookmark toggles. The session list is an immutable
    /// snapshot, so the deletion policy must not trust its bookmark flags
    /// once the user has flipped one.
    bookmark_overrides: Mutex<HashMap<ChapterId, bool>>,
}

impl ProgressTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manga_id: MangaId,
        repo: Arc<dyn ChapterRepository>,
        downloads: Arc<dyn DownloadManager>,
        trackers: Arc<dyn TrackerSyncService>,
        config: ReaderConfig,
        events: EventSender,
        list: Arc<ChapterList>,
        arena: Arc<ResourceArena>,
    ) -> Self {
        Self {
            manga_id,
            repo,
            downloads,
            trackers,
            config,
            events,
            list,
            arena,
            auto_download_fired: Mutex::new(HashSet::new()),
            bookmark_overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Records a bookmark toggle so deletion eligibility sees it even for
    /// chapters with no live resource.
    pub fn note_bookmark(&self, chapter_id: ChapterId, bookmarked: bool) {
        self.bookmark_overrides.lock().insert(chapter_id, bookmarked);
    }

    /// Incognito suppresses local progress writes unless the manga is
    /// tracked remotely (sync needs something to read) or the user opted
    /// into always syncing.
    fn writes_progress(&self) -> bool {
        !self.config.incognito
            || self.config.always_sync_progress
            || self.trackers.is_tracked(self.manga_id)
    }

    /// Handles one page-advance within the chapter owned by `resource`.
    /// `next_in_window` is the chapter currently occupying the window's next
    /// slot, used by the auto-download policy.
    pub async fn on_page_advance(
        &self,
        resource: &Arc<ChapterResource>,
        next_in_window: Option<Chapter>,
        page_index: usize,
        double_page_trailing: bool,
    ) -> Result<(), SessionError> {
        let Some(pages) = resource.pages() else {
            // Advancing into a chapter whose pages have not landed yet
            // records nothing; the next event after the load applies.
            return Ok(());
        };
        let total = pages.len();
        let page_index = page_index.min(total.saturating_sub(1));

        if !self.writes_progress() {
            return Ok(());
        }

        let at_end = page_index + 1 == total
            || (double_page_trailing && total >= 2 && page_index + 2 == total);

        let (snapshot, completed_now) = resource.update_chapter(|chapter| {
            chapter.last_page_read = page_index;
            chapter.pages_left = total - page_index - 1;
            let mut completed = false;
            if at_end && !chapter.read {
                chapter.read = true;
                completed = true;
            }
            // A read chapter always reports zero pages left, also when the
            // final spread is re-rendered or the user rewinds into it.
            if chapter.read {
                chapter.pages_left = 0;
            }
            (chapter.clone(), completed)
        });

        self.repo
            .update_progress(&snapshot)
            .await
            .map_err(SessionError::Persistence)?;

        if completed_now {
            debug!(chapter = snapshot.id, "chapter read to completion");
            self.sync_trackers(&snapshot);
            self.evaluate_deletion(&snapshot);
        }

        self.maybe_auto_download(&snapshot, next_in_window.as_ref(), page_index, total);
        Ok(())
    }

    /// Persists the outgoing chapter's progress and reading history before a
    /// chapter switch or session close. Both writes happen inside this one
    /// awaited section so nothing re-reads the chapter's progress in between.
    pub async fn persist_outgoing(
        &self,
        resource: &Arc<ChapterResource>,
        time_read: Duration,
    ) -> Result<(), SessionError> {
        let chapter = resource.chapter();
        if self.writes_progress() {
            self.repo
                .update_progress(&chapter)
                .await
                .map_err(SessionError::Persistence)?;
        }
        if !self.config.incognito {
            let entry = HistoryEntry {
                chapter_id: chapter.id,
                last_read_at: unix_millis_now(),
                time_read_ms: time_read.as_millis() as u64,
            };
            self.repo
                .upsert_history(self.manga_id, &entry)
                .await
                .map_err(SessionError::Persistence)?;
        }
        Ok(())
    }

    /// Best-effort remote sync; warnings are collected and surfaced, never
    /// thrown, and the local read flag is never rolled back.
    fn sync_trackers(&self, chapter: &Chapter) {
        let trackers = Arc::clone(&self.trackers);
        let events = self.events.clone();
        let manga_id = self.manga_id;
        let number = chapter.number;
        tokio::spawn(async move {
            let warnings = trackers.mark_chapter_read(manga_id, number).await;
            if !warnings.is_empty() {
                for warning in &warnings {
                    warn!(service = %warning.service, message = %warning.message, "tracker sync failed");
                }
                events.send(SessionEvent::TrackingWarnings(warnings));
            }
        });
    }

    /// Delete-N-behind: the chapter `remove_after_read_slots` positions
    /// behind the one just finished becomes eligible for deferred deletion,
    /// unless bookmarked. Deletion happens at session end, never mid-read.
    fn evaluate_deletion(&self, finished: &Chapter) {
        let slots = self.config.remove_after_read_slots;
        if slots < 0 {
            return;
        }
        let Some(position) = self.list.position_of(finished.id) else {
            return;
        };
        let Some(target_position) = position.checked_sub(slots as usize) else {
            return;
        };
        let Some(target) = self.list.get(target_position) else {
            return;
        };
        // Bookmark flags, most authoritative first: a recorded mid-session
        // toggle, the live resource, then the list snapshot.
        let bookmarked = self
            .bookmark_overrides
            .lock()
            .get(&target.id)
            .copied()
            .or_else(|| self.arena.get(target.id).map(|r| r.chapter().bookmark))
            .unwrap_or(target.bookmark);
        if bookmarked {
            debug!(chapter = target.id, "skipping deletion of bookmarked chapter");
            return;
        }
        self.downloads.enqueue_deletion(target);
    }

    /// Once past the configured fraction of the current chapter, and with
    /// the next window chapter already on disk, queue the next N unread
    /// chapters for download.
    fn maybe_auto_download(
        &self,
        current: &Chapter,
        next_in_window: Option<&Chapter>,
        page_index: usize,
        total: usize,
    ) {
        let ahead = self.config.auto_download_ahead;
        if ahead == 0 || total == 0 {
            return;
        }
        if self.auto_download_fired.lock().contains(&current.id) {
            return;
        }
        let progress = (page_index + 1) as f32 / total as f32;
        if progress < self.config.auto_download_threshold {
            return;
        }
        let Some(next) = next_in_window else {
            return;
        };
        if !self.downloads.is_downloaded(next) {
            return;
        }
        let Some(position) = self.list.position_of(current.id) else {
            return;
        };
        let candidates: Vec<Chapter> = self.list.as_slice()[position + 1..]
            .iter()
            .filter(|c| !c.read && !self.downloads.is_downloaded(c))
            .take(ahead)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }
        self.auto_download_fired.lock().insert(current.id);
        debug!(
            chapter = current.id,
            queued = candidates.len(),
            "auto-downloading upcoming chapters"
        );
        self.downloads.enqueue_downloads(&candidates);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::chapter::{Page, PageHandle};
    use crate::ordering::OrderingOptions;
    use crate::traits::{MemoryChapterRepository, TrackerWarning};

    #[derive(Default)]
    struct RecordingDownloads {
        downloaded: Mutex<HashSet<ChapterId>>,
        enqueued: Mutex<Vec<Vec<ChapterId>>>,
        deletions: Mutex<Vec<ChapterId>>,
    }

    impl DownloadManager for RecordingDownloads {
        fn is_downloaded(&self, chapter: &Chapter) -> bool {
            self.downloaded.lock().contains(&chapter.id)
        }

        fn enqueue_downloads(&self, chapters: &[Chapter]) {
            self.enqueued.lock().push(chapters.iter().map(|c| c.id).collect());
        }

        fn enqueue_deletion(&self, chapter: &Chapter) {
            self.deletions.lock().push(chapter.id);
        }

        fn cancel_deletion(&self, chapter_id: ChapterId) {
            self.deletions.lock().retain(|id| *id != chapter_id);
        }

        fn flush_deletions(&self, _manga_id: MangaId) {
            self.deletions.lock().clear();
        }
    }

    #[derive(Default)]
    struct RecordingTracker {
        tracked: bool,
        warnings: Vec<TrackerWarning>,
        marked: Mutex<Vec<f32>>,
    }

    #[async_trait]
    impl TrackerSyncService for RecordingTracker {
        fn is_tracked(&self, _manga_id: MangaId) -> bool {
            self.tracked
        }

        async fn mark_chapter_read(
            &self,
            _manga_id: MangaId,
            chapter_number: f32,
        ) -> Vec<TrackerWarning> {
            self.marked.lock().push(chapter_number);
            self.warnings.clone()
        }
    }

    struct Fixture {
        tracker: ProgressTracker,
        repo: Arc<MemoryChapterRepository>,
        downloads: Arc<RecordingDownloads>,
        remote: Arc<RecordingTracker>,
        arena: Arc<ResourceArena>,
        list: Arc<ChapterList>,
        rx: UnboundedReceiver<SessionEvent>,
    }

    fn chapters(n: i64) -> Vec<Chapter> {
        (1..=n)
            .map(|id| {
                Chapter::new(id, 1, format!("Ch. {id}"))
                    .with_number(id as f32)
                    .with_source_order(id - 1)
            })
            .collect()
    }

    fn fixture(config: ReaderConfig, remote: RecordingTracker) -> Fixture {
        let all = chapters(10);
        let repo = Arc::new(MemoryChapterRepository::new());
        repo.seed_chapters(1, all.clone());
        let downloads = Arc::new(RecordingDownloads::default());
        let remote = Arc::new(remote);
        let list = Arc::new(
            ChapterList::build(&all, 5, &OrderingOptions::default(), None, None).unwrap(),
        );
        let arena = Arc::new(ResourceArena::new());
        let (events, rx) = EventSender::channel();
        let tracker = ProgressTracker::new(
            1,
            Arc::clone(&repo) as Arc<dyn ChapterRepository>,
            Arc::clone(&downloads) as Arc<dyn DownloadManager>,
            Arc::clone(&remote) as Arc<dyn TrackerSyncService>,
            config,
            events,
            Arc::clone(&list),
            Arc::clone(&arena),
        );
        Fixture {
            tracker,
            repo,
            downloads,
            remote,
            arena,
            list,
            rx,
        }
    }

    fn loaded_resource(fixture: &Fixture, id: ChapterId, pages: usize) -> Arc<ChapterResource> {
        let position = fixture.list.position_of(id).unwrap();
        let resource = fixture.arena.checkout(fixture.list.get(position).unwrap());
        let generation = resource.begin_load().unwrap();
        let pages = (0..pages)
            .map(|i| Page::ready(i, PageHandle::Url(format!("p{i}"))))
            .collect();
        resource.complete_load(generation, Ok(pages));
        resource
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn advance_updates_progress_monotonically() {
        let fx = fixture(ReaderConfig::default(), RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 20);

        let mut last = 0;
        for page in [0usize, 3, 7, 12] {
            fx.tracker
                .on_page_advance(&resource, None, page, false)
                .await
                .unwrap();
            let chapter = resource.chapter();
            assert!(chapter.last_page_read >= last);
            last = chapter.last_page_read;
            assert_eq!(chapter.pages_left, 20 - page - 1);
        }

        let persisted = fx.repo.chapter(1, 5).unwrap();
        assert_eq!(persisted.last_page_read, 12);
        assert!(!persisted.read);
    }

    #[tokio::test]
    async fn last_page_marks_chapter_read_and_fires_side_effects_once() {
        let mut config = ReaderConfig::default();
        config.remove_after_read_slots = 1;
        let mut fx = fixture(config, RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);

        fx.tracker.on_page_advance(&resource, None, 9, false).await.unwrap();
        // Re-render of the same last page must not re-fire.
        fx.tracker.on_page_advance(&resource, None, 9, false).await.unwrap();
        // A repeated trailing-edge event or a rewind into the read chapter
        // must not resurrect a nonzero pages_left.
        fx.tracker.on_page_advance(&resource, None, 8, true).await.unwrap();
        fx.tracker.on_page_advance(&resource, None, 4, false).await.unwrap();
        settle().await;

        let persisted = fx.repo.chapter(1, 5).unwrap();
        assert!(persisted.read);
        assert_eq!(persisted.pages_left, 0);

        assert_eq!(fx.remote.marked.lock().as_slice(), &[5.0]);
        // position(5) - 1 slot => chapter 4.
        assert_eq!(fx.downloads.deletions.lock().as_slice(), &[4]);

        // No warnings, so no warning events.
        while let Ok(event) = fx.rx.try_recv() {
            assert!(!matches!(event, SessionEvent::TrackingWarnings(_)));
        }
    }

    #[tokio::test]
    async fn double_page_trailing_edge_completes_on_second_to_last() {
        let fx = fixture(ReaderConfig::default(), RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);

        fx.tracker.on_page_advance(&resource, None, 8, true).await.unwrap();
        assert!(resource.chapter().read, "trailing spread counts as the end");

        let fx2 = fixture(ReaderConfig::default(), RecordingTracker::default());
        let resource2 = loaded_resource(&fx2, 5, 10);
        fx2.tracker.on_page_advance(&resource2, None, 8, false).await.unwrap();
        assert!(!resource2.chapter().read, "single-page mode needs the last page");
    }

    #[tokio::test]
    async fn tracker_warnings_are_collected_not_thrown() {
        let remote = RecordingTracker {
            tracked: false,
            warnings: vec![TrackerWarning {
                service: "example".into(),
                message: "503".into(),
            }],
            marked: Mutex::new(Vec::new()),
        };
        let mut fx = fixture(ReaderConfig::default(), remote);
        let resource = loaded_resource(&fx, 5, 4);

        fx.tracker.on_page_advance(&resource, None, 3, false).await.unwrap();
        settle().await;

        assert!(resource.chapter().read, "warnings never roll back read state");
        let mut saw_warning = false;
        while let Ok(event) = fx.rx.try_recv() {
            if let SessionEvent::TrackingWarnings(warnings) = event {
                assert_eq!(warnings[0].service, "example");
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn deletion_skips_bookmarked_and_out_of_range_targets() {
        let mut config = ReaderConfig::default();
        config.remove_after_read_slots = 1;
        let fx = fixture(config, RecordingTracker::default());

        // Bookmark chapter 4 through its live resource.
        let target = loaded_resource(&fx, 4, 4);
        target.update_chapter(|c| c.bookmark = true);
        let resource = loaded_resource(&fx, 5, 4);
        fx.tracker.on_page_advance(&resource, None, 3, false).await.unwrap();
        assert!(fx.downloads.deletions.lock().is_empty());

        // Finishing the first chapter with slots=2 underflows: silent no-op.
        let mut config = ReaderConfig::default();
        config.remove_after_read_slots = 2;
        let fx2 = fixture(config, RecordingTracker::default());
        let first = loaded_resource(&fx2, 1, 4);
        fx2.tracker.on_page_advance(&first, None, 3, false).await.unwrap();
        assert!(fx2.downloads.deletions.lock().is_empty());

        // Negative slots disable the policy entirely.
        let fx3 = fixture(ReaderConfig::default(), RecordingTracker::default());
        let resource3 = loaded_resource(&fx3, 5, 4);
        fx3.tracker.on_page_advance(&resource3, None, 3, false).await.unwrap();
        assert!(fx3.downloads.deletions.lock().is_empty());
    }

    #[tokio::test]
    async fn deletion_respects_bookmarks_toggled_without_a_live_resource() {
        let mut config = ReaderConfig::default();
        config.remove_after_read_slots = 2;
        let fx = fixture(config.clone(), RecordingTracker::default());

        // Chapter 3 has no resource in the arena; only the recorded toggle
        // carries the new flag.
        fx.tracker.note_bookmark(3, true);
        let resource = loaded_resource(&fx, 5, 4);
        fx.tracker.on_page_advance(&resource, None, 3, false).await.unwrap();
        assert!(fx.downloads.deletions.lock().is_empty());

        // Removing the bookmark restores eligibility.
        let fx2 = fixture(config, RecordingTracker::default());
        fx2.tracker.note_bookmark(3, true);
        fx2.tracker.note_bookmark(3, false);
        let resource2 = loaded_resource(&fx2, 5, 4);
        fx2.tracker.on_page_advance(&resource2, None, 3, false).await.unwrap();
        assert_eq!(fx2.downloads.deletions.lock().as_slice(), &[3]);
    }

    #[tokio::test]
    async fn incognito_skips_all_writes_unless_overridden() {
        let mut config = ReaderConfig::default();
        config.incognito = true;
        let fx = fixture(config, RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 4);

        fx.tracker.on_page_advance(&resource, None, 3, false).await.unwrap();
        settle().await;
        let persisted = fx.repo.chapter(1, 5).unwrap();
        assert!(!persisted.read);
        assert_eq!(persisted.last_page_read, 0);
        assert!(fx.remote.marked.lock().is_empty());

        // Tracked manga: progress still written locally so sync has data.
        let mut config = ReaderConfig::default();
        config.incognito = true;
        let remote = RecordingTracker {
            tracked: true,
            ..RecordingTracker::default()
        };
        let fx2 = fixture(config, remote);
        let resource2 = loaded_resource(&fx2, 5, 4);
        fx2.tracker.on_page_advance(&resource2, None, 3, false).await.unwrap();
        settle().await;
        assert!(fx2.repo.chapter(1, 5).unwrap().read);
        assert_eq!(fx2.remote.marked.lock().as_slice(), &[5.0]);
    }

    #[tokio::test]
    async fn incognito_blocks_history_but_override_keeps_progress() {
        let mut config = ReaderConfig::default();
        config.incognito = true;
        config.always_sync_progress = true;
        let fx = fixture(config, RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);
        resource.update_chapter(|c| c.last_page_read = 7);

        fx.tracker
            .persist_outgoing(&resource, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(fx.repo.chapter(1, 5).unwrap().last_page_read, 7);
        assert!(fx.repo.history_for(5).is_none(), "history stays private");
    }

    #[tokio::test]
    async fn persist_outgoing_writes_progress_and_history() {
        let fx = fixture(ReaderConfig::default(), RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);
        resource.update_chapter(|c| c.last_page_read = 4);

        fx.tracker
            .persist_outgoing(&resource, Duration::from_secs(90))
            .await
            .unwrap();

        assert_eq!(fx.repo.chapter(1, 5).unwrap().last_page_read, 4);
        let history = fx.repo.history_for(5).unwrap();
        assert_eq!(history.time_read_ms, 90_000);
        assert!(history.last_read_at > 0);
    }

    #[tokio::test]
    async fn auto_download_fires_once_past_threshold() {
        let mut config = ReaderConfig::default();
        config.auto_download_ahead = 2;
        let fx = fixture(config, RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);
        let next = fx.list.get(fx.list.position_of(6).unwrap()).unwrap().clone();
        fx.downloads.downloaded.lock().insert(6);

        // Page 0 of 10 is below the 20% threshold.
        fx.tracker
            .on_page_advance(&resource, Some(next.clone()), 0, false)
            .await
            .unwrap();
        assert!(fx.downloads.enqueued.lock().is_empty());

        fx.tracker
            .on_page_advance(&resource, Some(next.clone()), 3, false)
            .await
            .unwrap();
        assert_eq!(fx.downloads.enqueued.lock().as_slice(), &[vec![7, 8]]);

        // Further advances do not re-enqueue.
        fx.tracker
            .on_page_advance(&resource, Some(next), 4, false)
            .await
            .unwrap();
        assert_eq!(fx.downloads.enqueued.lock().len(), 1);
    }

    #[tokio::test]
    async fn auto_download_requires_downloaded_next_chapter() {
        let mut config = ReaderConfig::default();
        config.auto_download_ahead = 2;
        let fx = fixture(config, RecordingTracker::default());
        let resource = loaded_resource(&fx, 5, 10);
        let next = fx.list.get(fx.list.position_of(6).unwrap()).unwrap().clone();

        fx.tracker
            .on_page_advance(&resource, Some(next), 5, false)
            .await
            .unwrap();
        assert!(fx.downloads.enqueued.lock().is_empty());
    }
}
