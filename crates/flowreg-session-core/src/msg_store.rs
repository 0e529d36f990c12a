//! Broadcast + history event store so a surface can attach late and replay.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionEvent;

/// Default history size limit (8 MB).
const HISTORY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct StoredMsg {
    msg: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Event store with broadcast and history support.
///
/// New listeners receive history first, then live events.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    /// Create a new message store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, msg: SessionEvent) {
        let _ = self.sender.send(msg.clone()); // live listeners
        let bytes = msg.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push a progress line.
    pub fn push_progress<S: Into<String>>(&self, s: S) {
        self.push(SessionEvent::Progress(s.into()));
    }

    /// Push a warning.
    pub fn push_warning<S: Into<String>>(&self, s: S) {
        self.push(SessionEvent::Warning(s.into()));
    }

    /// Push stdout line.
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(SessionEvent::Stdout(s.into()));
    }

    /// Push stderr line.
    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(SessionEvent::Stderr(s.into()));
    }

    /// Push finished notification.
    pub fn push_finished(&self) {
        self.push(SessionEvent::Finished);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        Box::pin(hist.chain(live))
    }

    /// History plus live events, ending after `Finished`.
    #[must_use]
    pub fn until_finished(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        self.history_plus_stream()
            .take_while(|msg| future::ready(!matches!(msg, SessionEvent::Finished)))
            .boxed()
    }
}
