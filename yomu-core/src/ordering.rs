use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chapter::{Chapter, ChapterId};
use crate::error::OrderingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterSort {
    /// Order assigned by the source's own listing.
    BySource,
    /// Declared chapter number; duplicates resolved by the tie-break policy.
    ByNumber,
}

#[derive(Debug, Clone)]
pub struct OrderingOptions {
    pub sort: ChapterSort,
    pub descending: bool,
    pub skip_read: bool,
    pub skip_filtered: bool,
}

impl Default for OrderingOptions {
    fn default() -> Self {
        Self {
            sort: ChapterSort::BySource,
            descending: false,
            skip_read: false,
            skip_filtered: false,
        }
    }
}

pub type DisplayFilter<'a> = &'a (dyn Fn(&Chapter) -> bool + Send + Sync);
pub type TieBreak<'a> = &'a (dyn Fn(&Chapter, &Chapter) -> Ordering + Send + Sync);

/// Default duplicate-number policy: source order, then id.
pub fn default_tie_break(a: &Chapter, b: &Chapter) -> Ordering {
    a.source_order
        .cmp(&b.source_order)
        .then_with(|| a.id.cmp(&b.id))
}

/// The per-session candidate chapter sequence. Built once at init, read-only
/// afterwards; a new reading session gets a fresh list.
#[derive(Debug, Clone)]
pub struct ChapterList {
    chapters: Vec<Chapter>,
    positions: HashMap<ChapterId, usize>,
}

impl ChapterList {
    /// Builds the ordered candidate list. `skip_read`/`skip_filtered` drop
    /// chapters from the candidate set, but the selected chapter always
    /// survives filtering: the chapter being opened is never hidden from its
    /// own session.
    pub fn build(
        all: &[Chapter],
        selected: ChapterId,
        options: &OrderingOptions,
        display_filter: Option<DisplayFilter<'_>>,
        tie_break: Option<TieBreak<'_>>,
    ) -> Result<Self, OrderingError> {
        if !all.iter().any(|c| c.id == selected) {
            return Err(OrderingError::SelectedChapterMissing(selected));
        }

        let mut chapters: Vec<Chapter> = all
            .iter()
            .filter(|c| {
                if c.id == selected {
                    return true;
                }
                if options.skip_read && c.read {
                    return false;
                }
                if options.skip_filtered {
                    if let Some(filter) = display_filter {
                        if !filter(c) {
                            return false;
                        }
                    }
                }
                true
            })
            .cloned()
            .collect();

        let tie = tie_break.unwrap_or(&default_tie_break);
        chapters.sort_by(|a, b| {
            let forward = match options.sort {
                ChapterSort::BySource => a.source_order.cmp(&b.source_order).then_with(|| tie(a, b)),
                ChapterSort::ByNumber => a.number.total_cmp(&b.number).then_with(|| tie(a, b)),
            };
            if options.descending {
                forward.reverse()
            } else {
                forward
            }
        });

        let positions = chapters
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.id, pos))
            .collect();

        Ok(Self { chapters, positions })
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Chapter> {
        self.chapters.get(position)
    }

    pub fn position_of(&self, id: ChapterId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn as_slice(&self) -> &[Chapter] {
        &self.chapters
    }
}

/// One row of the navigation-sheet projection: the full unfiltered list with
/// the active chapter flagged.
#[derive(Debug, Clone)]
pub struct ChapterListEntry {
    pub chapter: Chapter,
    pub active: bool,
}

/// Read-only projection of the full database list in the configured sort and
/// direction. Recomputed on demand; not part of the page-advance hot path.
pub fn project_chapter_list(
    all: &[Chapter],
    active: Option<ChapterId>,
    sort: ChapterSort,
    descending: bool,
    tie_break: Option<TieBreak<'_>>,
) -> Vec<ChapterListEntry> {
    let mut chapters: Vec<Chapter> = all.to_vec();
    let tie = tie_break.unwrap_or(&default_tie_break);
    chapters.sort_by(|a, b| {
        let forward = match sort {
            ChapterSort::BySource => a.source_order.cmp(&b.source_order).then_with(|| tie(a, b)),
            ChapterSort::ByNumber => a.number.total_cmp(&b.number).then_with(|| tie(a, b)),
        };
        if descending {
            forward.reverse()
        } else {
            forward
        }
    });
    chapters
        .into_iter()
        .map(|chapter| {
            let is_active = Some(chapter.id) == active;
            ChapterListEntry {
                chapter,
                active: is_active,
            }
        })
        .collect()
}
