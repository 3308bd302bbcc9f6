use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::chapter::ChapterId;
use crate::error::SessionError;
use crate::events::{EventSender, SessionEvent};
use crate::ordering::ChapterList;
use crate::resource::{ChapterResource, ChapterState, LoadOutcome, ResourceArena};
use crate::traits::PageSource;
use crate::window::{Window, WindowSnapshot};

struct ActiveLoad {
    resource: Arc<ChapterResource>,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Orchestrates chapter loads: the active chapter with cancel-and-supersede
/// semantics, speculative neighbor preloads, and window publication after any
/// chapter's state changes.
pub(crate) struct LoadCoordinator {
    list: Arc<ChapterList>,
    arena: Arc<ResourceArena>,
    source: Arc<dyn PageSource>,
    events: EventSender,
    window: Mutex<Option<Window>>,
    active: Mutex<Option<ActiveLoad>>,
}

impl LoadCoordinator {
    pub fn new(
        list: Arc<ChapterList>,
        arena: Arc<ResourceArena>,
        source: Arc<dyn PageSource>,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            list,
            arena,
            source,
            events,
            window: Mutex::new(None),
            active: Mutex::new(None),
        })
    }

    /// Makes `chapter_id` the current chapter: supersedes any in-flight
    /// active load, swaps the window to the new triple, and drives the load
    /// to settlement. A `Failed` outcome is the caller's to interpret; the
    /// window is published either way, with the resource left in `Error`.
    #[instrument(skip(self))]
    pub async fn load_active(
        self: &Arc<Self>,
        chapter_id: ChapterId,
    ) -> Result<LoadOutcome, SessionError> {
        let position = self
            .list
            .position_of(chapter_id)
            .ok_or(SessionError::UnknownChapter(chapter_id))?;

        self.supersede_active();

        // Incoming window takes its references before the outgoing window
        // gives up its own, so a chapter held by both never transiently
        // drops to zero.
        let prev = position
            .checked_sub(1)
            .and_then(|p| self.list.get(p))
            .map(|c| self.arena.checkout(c));
        let current = self
            .arena
            .checkout(self.list.get(position).expect("position resolved above"));
        let next = self.list.get(position + 1).map(|c| self.arena.checkout(c));
        self.publish(Window {
            prev,
            current: Arc::clone(&current),
            next,
        });

        let outcome = match current.begin_load() {
            Some(generation) => {
                self.events.send(SessionEvent::ChapterStateChanged {
                    chapter_id,
                    state: ChapterState::Loading,
                });
                let handle = self.spawn_load(&current, generation);
                *self.active.lock() = Some(ActiveLoad {
                    resource: Arc::clone(&current),
                    generation,
                    handle,
                });
                current.wait_settled(generation).await
            }
            // The state-machine guard refused: join whatever is in flight
            // instead of starting a second load.
            None => match current.state() {
                ChapterState::Loaded(_) => LoadOutcome::Loaded,
                ChapterState::Error(cause) => LoadOutcome::Failed(cause),
                ChapterState::Loading => {
                    current.wait_settled(current.current_generation()).await
                }
                ChapterState::Wait => LoadOutcome::Cancelled,
            },
        };

        if outcome == LoadOutcome::Loaded {
            self.preload_neighbors();
        }
        Ok(outcome)
    }

    /// Warms up a neighbor. No-op unless the resource is `Wait` or `Error`;
    /// on an applied completion the existing window is re-published unchanged
    /// so observers learn pages became available without a chapter switch.
    pub fn preload(self: &Arc<Self>, resource: &Arc<ChapterResource>) {
        let Some(generation) = resource.begin_load() else {
            return;
        };
        self.events.send(SessionEvent::ChapterStateChanged {
            chapter_id: resource.id(),
            state: ChapterState::Loading,
        });
        debug!(chapter = resource.id(), "preloading chapter");
        self.spawn_load(resource, generation);
    }

    pub fn preload_neighbors(self: &Arc<Self>) {
        let (prev, next) = {
            let window = self.window.lock();
            match &*window {
                Some(w) => (w.prev.clone(), w.next.clone()),
                None => return,
            }
        };
        if let Some(prev) = prev {
            self.preload(&prev);
        }
        if let Some(next) = next {
            self.preload(&next);
        }
    }

    fn spawn_load(
        self: &Arc<Self>,
        resource: &Arc<ChapterResource>,
        generation: u64,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let resource = Arc::clone(resource);
        tokio::spawn(async move {
            let chapter = resource.chapter();
            let result = coordinator
                .source
                .load(&chapter)
                .await
                .map_err(|err| format!("{err:#}"));
            if resource.complete_load(generation, result) {
                coordinator.events.send(SessionEvent::ChapterStateChanged {
                    chapter_id: chapter.id,
                    state: resource.state(),
                });
                coordinator.republish();
            }
        })
    }

    /// Cancels the in-flight active load, if any. The aborted task never
    /// applies its result; the generation bump catches the case where the
    /// page source had already returned.
    fn supersede_active(&self) {
        if let Some(active) = self.active.lock().take() {
            active.handle.abort();
            active.resource.cancel_load(active.generation);
            debug!(chapter = active.resource.id(), "superseded active chapter load");
        }
    }

    fn publish(&self, window: Window) {
        let snapshot = window.snapshot();
        let released = {
            let mut slot = self.window.lock();
            slot.replace(window).map(|old| old.referenced_ids())
        };
        if let Some(ids) = released {
            for id in ids {
                self.arena.release(id);
            }
        }
        self.events.send(SessionEvent::WindowPublished(snapshot));
    }

    fn republish(&self) {
        let snapshot = self.window.lock().as_ref().map(Window::snapshot);
        if let Some(snapshot) = snapshot {
            self.events.send(SessionEvent::WindowPublished(snapshot));
        }
    }

    pub fn window(&self) -> Option<Window> {
        self.window.lock().clone()
    }

    pub fn snapshot(&self) -> Option<WindowSnapshot> {
        self.window.lock().as_ref().map(Window::snapshot)
    }

    /// Releases everything the coordinator pins; the session calls this on
    /// close.
    pub fn shutdown(&self) {
        self.supersede_active();
        let released = self.window.lock().take().map(|w| w.referenced_ids());
        if let Some(ids) = released {
            for id in ids {
                self.arena.release(id);
            }
        }
    }
}
