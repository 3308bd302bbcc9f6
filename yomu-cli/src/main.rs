use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use yomu_core::{
    Chapter, ChapterId, ChapterState, JsonChapterRepository, MangaId, NullDownloadManager,
    NullTrackerService, ReaderConfig, ReaderSession, SessionEvent,
};
use yomu_source::DirectoryPageSource;

#[derive(Debug, Parser)]
#[command(name = "yomu", version, about = "terminal manga reading session")]
struct Args {
    /// Directory holding one subdirectory of page images per chapter
    manga_dir: PathBuf,

    /// Chapter directory name to open; defaults to the first chapter
    #[arg(short = 'c', long = "chapter")]
    chapter: Option<String>,

    /// Reader config file (TOML); defaults to the platform config directory
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "yomu", "yomu")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = load_config(&args, &project_dirs)?;
    let manga_dir = args
        .manga_dir
        .canonicalize()
        .with_context(|| format!("failed to resolve {:?}", args.manga_dir))?;
    let manga_id = path_id(&manga_dir);
    let chapters = scan_chapters(&manga_dir, manga_id)?;
    if chapters.is_empty() {
        return Err(anyhow!("no chapter directories found under {:?}", manga_dir));
    }

    let initial = match &args.chapter {
        Some(name) => chapters
            .iter()
            .find(|c| c.name == *name)
            .map(|c| c.id)
            .ok_or_else(|| anyhow!("no chapter directory named {name:?}"))?,
        None => chapters[0].id,
    };

    let state_dir = project_dirs.data_local_dir().join("state");
    let repo = Arc::new(JsonChapterRepository::new(state_dir)?);
    repo.seed_chapters(manga_id, chapters);

    let session = Arc::new(ReaderSession::new(
        repo,
        Arc::new(DirectoryPageSource::new()),
        Arc::new(NullDownloadManager::new()),
        Arc::new(NullTrackerService),
        config,
    ));

    let events = session
        .take_events()
        .ok_or_else(|| anyhow!("event stream already taken"))?;
    tokio::spawn(print_events(events));

    session.init(manga_id, initial).await?;
    run_repl(&session).await
}

/// Line-command loop: `n`/`p` turn pages, `g <page>` jumps, `c <id>` switches
/// to an adjacent chapter, `l` lists chapters, `b <id>` toggles a bookmark,
/// `s <page> <dir>` saves a page, `q` closes the session.
async fn run_repl(session: &Arc<ReaderSession>) -> Result<()> {
    let mut cursor = Cursor::from_session(session)
        .ok_or_else(|| anyhow!("session opened without a window"))?;
    println!("reading {} (page {}/{})", cursor.name, cursor.page + 1, cursor.total);

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = read_line().await? else {
            break;
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("n") => {
                if cursor.page + 1 < cursor.total {
                    cursor.page += 1;
                    session
                        .on_page_advance(cursor.chapter_id, cursor.page, false)
                        .await?;
                } else if let Some(next) = session
                    .window_snapshot()
                    .and_then(|w| w.next.map(|s| s.chapter.id))
                {
                    session.on_page_advance(next, 0, false).await?;
                } else {
                    println!("already at the last page of the last chapter");
                }
            }
            Some("p") => {
                if cursor.page > 0 {
                    cursor.page -= 1;
                    session
                        .on_page_advance(cursor.chapter_id, cursor.page, false)
                        .await?;
                } else if let Some(prev) = session
                    .window_snapshot()
                    .and_then(|w| w.prev.map(|s| s.chapter.id))
                {
                    session.on_page_advance(prev, 0, false).await?;
                } else {
                    println!("already at the first page of the first chapter");
                }
            }
            Some("g") => match parts.next().and_then(|p| p.parse::<usize>().ok()) {
                Some(page) if page >= 1 => {
                    cursor.page = (page - 1).min(cursor.total.saturating_sub(1));
                    session
                        .on_page_advance(cursor.chapter_id, cursor.page, false)
                        .await?;
                }
                _ => println!("usage: g <page>"),
            },
            Some("c") => match parts.next().and_then(|p| p.parse::<ChapterId>().ok()) {
                Some(id) => {
                    let adjacent = session.window_snapshot().is_some_and(|w| {
                        w.prev.as_ref().map(|s| s.chapter.id) == Some(id)
                            || w.next.as_ref().map(|s| s.chapter.id) == Some(id)
                            || w.current.chapter.id == id
                    });
                    if adjacent {
                        session.on_page_advance(id, 0, false).await?;
                    } else {
                        println!("can only switch to an adjacent chapter (see l)");
                    }
                }
                None => println!("usage: c <chapter-id>"),
            },
            Some("l") => {
                for entry in session.chapter_list_projection()? {
                    let marker = if entry.active { "*" } else { " " };
                    let read = if entry.chapter.read { " read" } else { "" };
                    let bookmark = if entry.chapter.bookmark { " (bookmarked)" } else { "" };
                    println!(
                        "{marker} [{}] {}{read}{bookmark}",
                        entry.chapter.id, entry.chapter.name,
                    );
                }
            }
            Some("b") => match parts.next().and_then(|p| p.parse::<ChapterId>().ok()) {
                Some(id) => match session.toggle_bookmark(id).await {
                    Ok(true) => println!("bookmarked chapter {id}"),
                    Ok(false) => println!("removed bookmark from chapter {id}"),
                    Err(err) => println!("bookmark failed: {err}"),
                },
                None => println!("usage: b <chapter-id>"),
            },
            Some("s") => {
                let page = parts.next().and_then(|p| p.parse::<usize>().ok());
                let dir = parts.next().map(PathBuf::from);
                match (page, dir) {
                    (Some(page), Some(dir)) if page >= 1 => {
                        if let Err(err) = session.save_page(cursor.chapter_id, page - 1, &dir) {
                            println!("save failed: {err}");
                        }
                    }
                    _ => println!("usage: s <page> <dir>"),
                }
            }
            Some("q") => {
                session.on_back_pressed().await?;
                break;
            }
            Some(other) => println!("unknown command {other:?} (n p g c l b s q)"),
            None => {}
        }

        // Re-sync with the engine; a chapter switch may have settled.
        if let Some(updated) = Cursor::from_session(session) {
            if updated.chapter_id != cursor.chapter_id {
                println!("now reading {} ({} pages)", updated.name, updated.total);
                cursor = updated;
            } else {
                cursor.total = updated.total;
                cursor.name = updated.name;
            }
        }
    }
    Ok(())
}

/// Where the viewer currently is. The engine is the source of truth for the
/// chapter; the page is the CLI's own position within it.
struct Cursor {
    chapter_id: ChapterId,
    name: String,
    page: usize,
    total: usize,
}

impl Cursor {
    fn from_session(session: &ReaderSession) -> Option<Self> {
        let window = session.window_snapshot()?;
        let total = match &window.current.state {
            ChapterState::Loaded(pages) => pages.len(),
            _ => 0,
        };
        Some(Self {
            chapter_id: window.current.chapter.id,
            name: window.current.chapter.name.clone(),
            page: window.current.chapter.last_page_read.min(total.saturating_sub(1)),
            total,
        })
    }
}

async fn read_line() -> Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line.trim().to_owned())),
            Err(err) => Err(err.into()),
        }
    })
    .await?
}

async fn print_events(mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::WindowPublished(_) => {}
            SessionEvent::ChapterStateChanged { chapter_id, state } => {
                tracing::debug!(chapter = chapter_id, state = state.label(), "chapter state");
            }
            SessionEvent::SaveImageResult { page, result, .. } => match result {
                Ok(path) => println!("saved page {} to {:?}", page + 1, path),
                Err(cause) => println!("could not save page {}: {cause}", page + 1),
            },
            SessionEvent::TrackingWarnings(warnings) => {
                for w in warnings {
                    println!("tracker {}: {}", w.service, w.message);
                }
            }
        }
    }
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<ReaderConfig> {
    match &args.config {
        Some(path) => ReaderConfig::load(path),
        None => {
            let path = project_dirs.config_dir().join("config.toml");
            if path.exists() {
                ReaderConfig::load(&path)
            } else {
                Ok(ReaderConfig::default())
            }
        }
    }
}

/// Stable id derived from the canonical path, so reading state survives
/// restarts without a database.
fn path_id(path: &Path) -> i64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish() as i64
}

/// Each subdirectory of the manga directory is one chapter; its name supplies
/// the chapter number when it contains one.
fn scan_chapters(manga_dir: &Path, manga_id: MangaId) -> Result<Vec<Chapter>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(manga_dir)
        .with_context(|| format!("failed to read {:?}", manga_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    Ok(dirs
        .into_iter()
        .enumerate()
        .map(|(index, dir)| {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let number = parse_chapter_number(&name).unwrap_or(-1.0);
            if number < 0.0 {
                warn!(chapter = %name, "chapter directory name declares no number");
            }
            Chapter::new(path_id(&dir), manga_id, name)
                .with_number(number)
                .with_source_order(index as i64)
                .with_url(dir.to_string_lossy())
        })
        .collect())
}

/// First numeric token of the name, with an optional fractional part.
/// "Chapter 10.5 - Aftermath" parses to 10.5.
fn parse_chapter_number(name: &str) -> Option<f32> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let rest = &name[start..];
    let end = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    rest[..end].trim_end_matches('.').parse().ok()
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "yomu.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
