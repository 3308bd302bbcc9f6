//! Page sources backed by local storage.
//!
//! [`DirectoryPageSource`] serves a chapter whose `url` points at a directory
//! of image files, the layout produced by the downloader. Pages come back
//! `Ready` with file handles, ordered by a natural filename sort so `page2`
//! precedes `page10`.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};
use yomu_core::{Chapter, Page, PageHandle, PageSource};

const IMAGE_EXTENSIONS: &[&str] = &["avif", "bmp", "gif", "jpeg", "jpg", "png", "webp"];

#[derive(Debug, Error)]
pub enum DirectorySourceError {
    #[error("chapter {chapter_id} has no download directory recorded")]
    MissingLocation { chapter_id: i64 },
    #[error("chapter directory {path:?} does not exist")]
    DirectoryNotFound { path: PathBuf },
    #[error("chapter directory {path:?} contains no page images")]
    NoPages { path: PathBuf },
}

/// Loads pages from a downloaded chapter's directory. Stateless; one instance
/// serves every chapter of a session.
#[derive(Debug, Default)]
pub struct DirectoryPageSource;

impl DirectoryPageSource {
    pub fn new() -> Self {
        Self
    }

    fn scan(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read chapter directory {:?}", dir))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        files.sort_by(|a, b| natural_cmp(&name_of(a), &name_of(b)));
        Ok(files)
    }
}

#[async_trait]
impl PageSource for DirectoryPageSource {
    #[instrument(skip(self, chapter), fields(chapter = chapter.id))]
    async fn load(&self, chapter: &Chapter) -> Result<Vec<Page>> {
        if chapter.url.is_empty() {
            return Err(DirectorySourceError::MissingLocation {
                chapter_id: chapter.id,
            }
            .into());
        }
        let dir = PathBuf::from(&chapter.url);
        if !dir.is_dir() {
            return Err(DirectorySourceError::DirectoryNotFound { path: dir }.into());
        }

        let files = self.scan(&dir)?;
        if files.is_empty() {
            return Err(DirectorySourceError::NoPages { path: dir }.into());
        }
        debug!(pages = files.len(), "scanned chapter directory");
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, path)| Page::ready(index, PageHandle::File(path)))
            .collect())
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Filename comparison where runs of digits compare numerically.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) => {
                if lc.is_ascii_digit() && rc.is_ascii_digit() {
                    let ln = take_number(&mut left);
                    let rn = take_number(&mut right);
                    match ln.cmp(&rn) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    match lc.cmp(&rc) {
                        Ordering::Equal => {
                            left.next();
                            right.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value: u64 = 0;
    while let Some(c) = chars.peek().copied() {
        let Some(digit) = c.to_digit(10) else {
            break;
        };
        value = value.saturating_mul(10).saturating_add(digit as u64);
        chars.next();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chapter_at(dir: &Path) -> Chapter {
        Chapter::new(7, 1, "Ch. 7").with_url(dir.to_string_lossy())
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"img").unwrap();
    }

    #[tokio::test]
    async fn pages_come_back_in_natural_order() {
        let dir = tempdir().unwrap();
        for name in ["page10.png", "page2.png", "page1.png", "cover.jpg"] {
            touch(dir.path(), name);
        }

        let pages = DirectoryPageSource::new()
            .load(&chapter_at(dir.path()))
            .await
            .unwrap();

        let names: Vec<String> = pages
            .iter()
            .map(|p| match &p.handle {
                Some(PageHandle::File(path)) => name_of(path),
                other => panic!("unexpected handle {other:?}"),
            })
            .collect();
        assert_eq!(names, ["cover.jpg", "page1.png", "page2.png", "page10.png"]);
        assert!(pages.iter().enumerate().all(|(i, p)| p.index == i));
    }

    #[tokio::test]
    async fn non_image_files_are_skipped() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "page1.png");
        touch(dir.path(), "ComicInfo.xml");
        touch(dir.path(), ".nomedia");

        let pages = DirectoryPageSource::new()
            .load(&chapter_at(dir.path()))
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn empty_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let err = DirectoryPageSource::new()
            .load(&chapter_at(dir.path()))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<DirectorySourceError>().is_some());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let gone = dir.path().join("nope");
        let err = DirectoryPageSource::new()
            .load(&chapter_at(&gone))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DirectorySourceError>(),
            Some(DirectorySourceError::DirectoryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn chapter_without_location_is_an_error() {
        let chapter = Chapter::new(7, 1, "Ch. 7");
        let err = DirectoryPageSource::new().load(&chapter).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DirectorySourceError>(),
            Some(DirectorySourceError::MissingLocation { chapter_id: 7 })
        ));
    }

    #[test]
    fn natural_order_handles_mixed_names() {
        let mut names = vec!["p11", "p2", "p2b", "p02a", "cover"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, ["cover", "p2", "p02a", "p2b", "p11"]);
    }
}
