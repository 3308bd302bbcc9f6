use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::chapter::{Chapter, ChapterId, Page};

/// Load lifecycle of one chapter resource.
///
/// `Wait -> Loading -> Loaded | Error`; `Error -> Loading` on retry. `Loaded`
/// chapters are never reloaded implicitly.
#[derive(Debug, Clone)]
pub enum ChapterState {
    Wait,
    Loading,
    Loaded(Arc<Vec<Page>>),
    Error(String),
}

impl ChapterState {
    pub fn label(&self) -> &'static str {
        match self {
            ChapterState::Wait => "wait",
            ChapterState::Loading => "loading",
            ChapterState::Loaded(_) => "loaded",
            ChapterState::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChapterState::Loaded(_) | ChapterState::Error(_))
    }

    pub fn pages(&self) -> Option<Arc<Vec<Page>>> {
        match self {
            ChapterState::Loaded(pages) => Some(Arc::clone(pages)),
            _ => None,
        }
    }
}

/// How one load attempt ended, from the perspective of a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed(String),
    /// The attempt was superseded or the resource was evicted before it
    /// settled.
    Cancelled,
}

/// The loadable unit wrapping one chapter: its page list once loaded, the
/// lifecycle state, and a reference count of viewer-window slots pinning it.
/// Load attempts are generation-tagged; completions with a stale generation
/// are dropped instead of applied.
#[derive(Debug)]
pub struct ChapterResource {
    id: ChapterId,
    chapter: Mutex<Chapter>,
    state: Mutex<ChapterState>,
    generation: AtomicU64,
    ref_count: AtomicUsize,
    settled: Notify,
}

impl ChapterResource {
    fn new(chapter: Chapter) -> Self {
        Self {
            id: chapter.id,
            chapter: Mutex::new(chapter),
            state: Mutex::new(ChapterState::Wait),
            generation: AtomicU64::new(0),
            ref_count: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    pub fn id(&self) -> ChapterId {
        self.id
    }

    /// Snapshot of the wrapped chapter, including live reading state.
    pub fn chapter(&self) -> Chapter {
        self.chapter.lock().clone()
    }

    /// Mutates the wrapped chapter's reading state in place.
    pub fn update_chapter<R>(&self, f: impl FnOnce(&mut Chapter) -> R) -> R {
        f(&mut self.chapter.lock())
    }

    pub fn state(&self) -> ChapterState {
        self.state.lock().clone()
    }

    pub fn pages(&self) -> Option<Arc<Vec<Page>>> {
        self.state.lock().pages()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Claims the resource for a load attempt. Returns the attempt's
    /// generation, or `None` if a load is already in flight or the chapter is
    /// already loaded; a second request for the same chapter is a no-op.
    pub(crate) fn begin_load(&self) -> Option<u64> {
        let mut state = self.state.lock();
        match *state {
            ChapterState::Wait | ChapterState::Error(_) => {
                *state = ChapterState::Loading;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                Some(generation)
            }
            ChapterState::Loading | ChapterState::Loaded(_) => None,
        }
    }

    /// Applies a load result. Returns `false` (and drops the result) when the
    /// attempt has been superseded or the resource is no longer `Loading`.
    pub(crate) fn complete_load(
        &self,
        generation: u64,
        result: Result<Vec<Page>, String>,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if self.generation.load(Ordering::SeqCst) != generation
                || !matches!(*state, ChapterState::Loading)
            {
                trace!(chapter = self.id, generation, "dropping stale load result");
                return false;
            }
            *state = match result {
                Ok(pages) if pages.is_empty() => {
                    ChapterState::Error("chapter has no pages".to_owned())
                }
                Ok(pages) => ChapterState::Loaded(Arc::new(pages)),
                Err(cause) => ChapterState::Error(cause),
            };
        }
        self.settled.notify_waiters();
        true
    }

    /// Cancels an in-flight attempt, resetting the resource so a later load
    /// or preload can retry it. The generation bump discards the cancelled
    /// attempt's eventual completion.
    pub(crate) fn cancel_load(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if self.generation.load(Ordering::SeqCst) != generation
                || !matches!(*state, ChapterState::Loading)
            {
                return;
            }
            *state = ChapterState::Wait;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.settled.notify_waiters();
    }

    /// Generation of the most recent load attempt; used to join an in-flight
    /// load rather than start a second one.
    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates all outstanding attempts; called on eviction.
    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    /// Waits until the attempt with `generation` reaches a terminal state or
    /// is cancelled.
    pub async fn wait_settled(&self, generation: u64) -> LoadOutcome {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.generation.load(Ordering::SeqCst) != generation {
                return LoadOutcome::Cancelled;
            }
            match &*self.state.lock() {
                ChapterState::Loaded(_) => return LoadOutcome::Loaded,
                ChapterState::Error(cause) => return LoadOutcome::Failed(cause.clone()),
                ChapterState::Wait | ChapterState::Loading => {}
            }

            notified.await;
        }
    }

    fn retain(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> usize {
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "release on chapter {} without a matching checkout", self.id);
        previous - 1
    }
}

/// The set of live chapter resources for one session, keyed by chapter id.
/// All mutation happens under one short-held lock with no I/O inside. A
/// resource is evicted only when its reference count returns to zero,
/// regardless of its state; a window may legitimately pin a chapter stuck
/// in `Error`.
#[derive(Debug, Default)]
pub struct ResourceArena {
    inner: Mutex<HashMap<ChapterId, Arc<ChapterResource>>>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets or creates the resource for `chapter` and takes one reference.
    pub fn checkout(&self, chapter: &Chapter) -> Arc<ChapterResource> {
        let mut map = self.inner.lock();
        let resource = map
            .entry(chapter.id)
            .or_insert_with(|| Arc::new(ChapterResource::new(chapter.clone())))
            .clone();
        let count = resource.retain();
        trace!(chapter = chapter.id, ref_count = count, "checked out chapter resource");
        resource
    }

    /// Drops one reference; evicts and invalidates the resource when the
    /// count reaches zero.
    pub fn release(&self, id: ChapterId) {
        let mut map = self.inner.lock();
        let Some(resource) = map.get(&id) else {
            debug_assert!(false, "release of unknown chapter {id}");
            return;
        };
        if resource.release() == 0 {
            let resource = map.remove(&id).expect("resource present");
            resource.invalidate();
            debug!(chapter = id, "evicted chapter resource");
        }
    }

    pub fn get(&self, id: ChapterId) -> Option<Arc<ChapterResource>> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::{Page, PageHandle};

    fn chapter(id: ChapterId) -> Chapter {
        Chapter::new(id, 1, format!("Ch. {id}"))
    }

    fn one_page() -> Vec<Page> {
        vec![Page::ready(0, PageHandle::Url("x".into()))]
    }

    #[test]
    fn at_most_one_load_in_flight() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));

        let generation = resource.begin_load().expect("first claim succeeds");
        assert!(resource.begin_load().is_none(), "second claim must be a no-op");

        assert!(resource.complete_load(generation, Ok(one_page())));
        assert!(resource.begin_load().is_none(), "loaded chapters are not reloaded");
    }

    #[test]
    fn error_state_allows_retry() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));

        let generation = resource.begin_load().unwrap();
        assert!(resource.complete_load(generation, Err("boom".into())));
        assert!(matches!(resource.state(), ChapterState::Error(_)));

        assert!(resource.begin_load().is_some(), "error is retryable");
    }

    #[test]
    fn stale_completion_is_dropped() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));

        let first = resource.begin_load().unwrap();
        resource.cancel_load(first);
        assert!(matches!(resource.state(), ChapterState::Wait));

        let second = resource.begin_load().unwrap();
        assert!(!resource.complete_load(first, Ok(one_page())), "superseded result applied");
        assert!(matches!(resource.state(), ChapterState::Loading));

        assert!(resource.complete_load(second, Ok(one_page())));
        assert!(matches!(resource.state(), ChapterState::Loaded(_)));
    }

    #[test]
    fn empty_page_list_is_an_error() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));
        let generation = resource.begin_load().unwrap();
        assert!(resource.complete_load(generation, Ok(Vec::new())));
        assert!(matches!(resource.state(), ChapterState::Error(_)));
    }

    #[test]
    fn refcount_drives_eviction() {
        let arena = ResourceArena::new();
        let ch = chapter(1);

        let first = arena.checkout(&ch);
        let second = arena.checkout(&ch);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);

        arena.release(1);
        assert_eq!(arena.live_count(), 1, "still referenced, must not be evicted");

        arena.release(1);
        assert_eq!(arena.live_count(), 0);

        // A fresh checkout after eviction starts a new lifetime.
        let third = arena.checkout(&ch);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.ref_count(), 1);
    }

    #[test]
    fn eviction_invalidates_in_flight_loads() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));
        let generation = resource.begin_load().unwrap();

        arena.release(1);
        assert!(!resource.complete_load(generation, Ok(one_page())));
    }

    #[tokio::test]
    async fn wait_settled_reports_outcomes() {
        let arena = ResourceArena::new();
        let resource = arena.checkout(&chapter(1));

        let generation = resource.begin_load().unwrap();
        let waiter = {
            let resource = Arc::clone(&resource);
            tokio::spawn(async move { resource.wait_settled(generation).await })
        };
        tokio::task::yield_now().await;
        resource.complete_load(generation, Ok(one_page()));
        assert_eq!(waiter.await.unwrap(), LoadOutcome::Loaded);

        // Failure path.
        let resource2 = arena.checkout(&chapter(2));
        let generation2 = resource2.begin_load().unwrap();
        resource2.complete_load(generation2, Err("nope".into()));
        assert_eq!(
            resource2.wait_settled(generation2).await,
            LoadOutcome::Failed("nope".into())
        );

        // Cancellation path.
        let resource3 = arena.checkout(&chapter(3));
        let generation3 = resource3.begin_load().unwrap();
        resource3.cancel_load(generation3);
        assert_eq!(resource3.wait_settled(generation3).await, LoadOutcome::Cancelled);
    }
}
