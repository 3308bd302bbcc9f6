//! Reader session engine: chapter ordering, the per-chapter load state
//! machine, the three-slot viewer window, and progress persistence. A
//! frontend drives it through [`ReaderSession`] and observes the
//! [`SessionEvent`] stream; all collaborators are injected behind traits.

mod chapter;
mod config;
mod coordinator;
mod error;
mod events;
mod ordering;
mod progress;
mod resource;
mod session;
mod traits;
mod window;

pub use chapter::{Chapter, ChapterId, HistoryEntry, MangaId, Page, PageHandle, PageStatus};
pub use config::ReaderConfig;
pub use error::{OrderingError, SessionError};
pub use events::SessionEvent;
pub use ordering::{
    default_tie_break, project_chapter_list, ChapterList, ChapterListEntry, ChapterSort,
    DisplayFilter, OrderingOptions, TieBreak,
};
pub use resource::{ChapterState, LoadOutcome};
pub use session::ReaderSession;
pub use traits::{
    ChapterRepository, DownloadManager, JsonChapterRepository, MemoryChapterRepository,
    NullDownloadManager, NullTrackerService, PageSource, TrackerSyncService, TrackerWarning,
};
pub use window::{ChapterSnapshot, WindowSnapshot};
