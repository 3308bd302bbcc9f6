use thiserror::Error;

use crate::chapter::{ChapterId, MangaId};

/// Errors raised while building the per-session chapter list.
#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("chapter {0} is not in the manga's chapter list")]
    SelectedChapterMissing(ChapterId),
    #[error("manga {0} has no chapters")]
    EmptyChapterList(MangaId),
}

/// Session-level error taxonomy. Only `Init*` variants end the session;
/// everything after a successful init is chapter-local or best-effort.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InitOrdering(#[from] OrderingError),
    #[error("failed to read chapters for manga {manga_id}: {source}")]
    InitRepository {
        manga_id: MangaId,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load initial chapter {chapter_id}: {cause}")]
    InitialChapterLoad { chapter_id: ChapterId, cause: String },
    #[error("chapter {0} is not part of this session")]
    UnknownChapter(ChapterId),
    #[error("session is not initialized")]
    NotInitialized,
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("failed to persist reading progress: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("page {page} of chapter {chapter_id} is not saveable")]
    PageNotSaveable { chapter_id: ChapterId, page: usize },
}
