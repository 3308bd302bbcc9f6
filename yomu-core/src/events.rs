use std::path::PathBuf;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::chapter::ChapterId;
use crate::resource::ChapterState;
use crate::traits::TrackerWarning;
use crate::window::WindowSnapshot;

/// Outbound notifications from the engine to whatever is driving it. The
/// engine never calls into UI code; it only publishes here.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new window is live, or the existing window's pages changed.
    WindowPublished(WindowSnapshot),
    ChapterStateChanged {
        chapter_id: ChapterId,
        state: ChapterState,
    },
    SaveImageResult {
        chapter_id: ChapterId,
        page: usize,
        result: Result<PathBuf, String>,
    },
    /// Best-effort tracker sync problems, one per failing service.
    TrackingWarnings(Vec<TrackerWarning>),
}

/// Sender half of the session's event stream. Sending never fails loudly: a
/// hung-up receiver just means nobody is watching anymore.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("session event dropped: receiver hung up");
        }
    }
}
