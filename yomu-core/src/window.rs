use std::sync::Arc;

use crate::chapter::{Chapter, ChapterId};
use crate::resource::{ChapterResource, ChapterState};

/// The triple of chapter resources currently pinned for the viewer. Ends may
/// be absent at list boundaries. While a window is published, every slot it
/// holds keeps one arena reference alive.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    pub prev: Option<Arc<ChapterResource>>,
    pub current: Arc<ChapterResource>,
    pub next: Option<Arc<ChapterResource>>,
}

impl Window {
    pub fn slot(&self, id: ChapterId) -> Option<&Arc<ChapterResource>> {
        [Some(&self.current), self.prev.as_ref(), self.next.as_ref()]
            .into_iter()
            .flatten()
            .find(|r| r.id() == id)
    }

    /// Ids of every referenced slot, used to release the outgoing window
    /// after the incoming one has taken its references.
    pub fn referenced_ids(&self) -> Vec<ChapterId> {
        [self.prev.as_ref(), Some(&self.current), self.next.as_ref()]
            .into_iter()
            .flatten()
            .map(|r| r.id())
            .collect()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            prev: self.prev.as_ref().map(ChapterSnapshot::of),
            current: ChapterSnapshot::of(&self.current),
            next: self.next.as_ref().map(ChapterSnapshot::of),
        }
    }
}

/// Immutable view of one window slot handed to observers.
#[derive(Debug, Clone)]
pub struct ChapterSnapshot {
    pub chapter: Chapter,
    pub state: ChapterState,
}

impl ChapterSnapshot {
    fn of(resource: &Arc<ChapterResource>) -> Self {
        Self {
            chapter: resource.chapter(),
            state: resource.state(),
        }
    }
}

/// What the UI observes: the published {previous, current, next} triple.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub prev: Option<ChapterSnapshot>,
    pub current: ChapterSnapshot,
    pub next: Option<ChapterSnapshot>,
}

impl WindowSnapshot {
    pub fn current_id(&self) -> ChapterId {
        self.current.chapter.id
    }
}
