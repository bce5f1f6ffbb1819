//! Stream children
//!
//! A stream child is an external process owning a listener socket and
//! streaming audio to its subscribers. The dispatcher starts children
//! through the [`StreamSupervisor`] seam and keeps a table of the
//! continuous ones so an `extant` request can join instead of respawning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::ports::PortLease;
use super::store::ResolvedMedia;
use crate::error::Result;
use crate::watch::Watch;

/// How a child streams its media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Stream once to a single listener, then exit
    Single,
    /// Keep streaming and accept listeners joining mid-stream
    Continuous,
}

/// Commands deliverable to a stream child
#[derive(Debug, Clone)]
pub enum ChildCommand {
    /// Attach another listener, identified by its reply address
    AddListener(String),
}

/// Handle to a live stream child, cheap to clone
#[derive(Clone)]
pub struct StreamChildHandle {
    id: u64,
    commands: Arc<mpsc::UnboundedSender<ChildCommand>>,
    done: CancellationToken,
}

impl StreamChildHandle {
    /// Create a handle plus the child's command receiver and life guard
    ///
    /// The child's owner holds the guard; dropping it marks the child dead.
    pub fn new(id: u64) -> (Self, mpsc::UnboundedReceiver<ChildCommand>, DropGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let handle = Self {
            id,
            commands: Arc::new(tx),
            done: done.clone(),
        };
        (handle, rx, done.drop_guard())
    }

    /// The child's identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the child to attach another listener, best effort
    pub fn add_listener(&self, reply_to: impl Into<String>) {
        let _ = self.commands.send(ChildCommand::AddListener(reply_to.into()));
    }

    /// Token that fires when the child exits
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }
}

impl std::fmt::Debug for StreamChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChildHandle")
            .field("id", &self.id)
            .field("done", &self.done.is_cancelled())
            .finish()
    }
}

/// A successfully started stream child and its advertised location
pub struct StreamStarted {
    pub child: StreamChildHandle,
    /// Location listeners connect to, carried in the media response
    pub url: String,
}

/// External supervisor that spawns streaming children
#[async_trait]
pub trait StreamSupervisor: Send + Sync + 'static {
    /// Start a child streaming `media` on `port`, replying to `reply_to`
    async fn start(
        &self,
        media: ResolvedMedia,
        reply_to: &str,
        mode: StreamMode,
        port: PortLease,
    ) -> Result<StreamStarted>;
}

/// Table of live continuous streams keyed by media name
pub(super) struct StreamTable {
    entries: HashMap<String, StreamEntry>,
}

struct StreamEntry {
    child: StreamChildHandle,
    _watch: Watch,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a child for `media_id`, replacing any previous entry
    pub fn insert(&mut self, media_id: String, child: StreamChildHandle, watch: Watch) {
        self.entries.insert(
            media_id,
            StreamEntry {
                child,
                _watch: watch,
            },
        );
    }

    /// Live child for `media_id`, if any
    pub fn get(&self, media_id: &str) -> Option<StreamChildHandle> {
        self.entries.get(media_id).map(|entry| entry.child.clone())
    }

    /// Remove the entry if it still belongs to `child_id`; idempotent
    pub fn remove_if(&mut self, media_id: &str, child_id: u64) -> bool {
        match self.entries.get(media_id) {
            Some(entry) if entry.child.id() == child_id => {
                self.entries.remove(media_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_listener_reaches_child() {
        let (handle, mut commands, _guard) = StreamChildHandle::new(7);
        handle.add_listener("amq.gen-r1");

        match commands.recv().await {
            Some(ChildCommand::AddListener(who)) => assert_eq!(who, "amq.gen-r1"),
            None => panic!("command channel closed"),
        }
    }

    #[tokio::test]
    async fn test_removal_is_idempotent_and_id_checked() {
        let mut table = StreamTable::new();
        let (child, _commands, _guard) = StreamChildHandle::new(1);
        let observed = child.done_token();
        table.insert("greeting.wav".into(), child, Watch::spawn(observed, || {}));

        // wrong id leaves the entry alone
        assert!(!table.remove_if("greeting.wav", 2));
        assert_eq!(table.len(), 1);

        assert!(table.remove_if("greeting.wav", 1));
        assert!(!table.remove_if("greeting.wav", 1));
        assert_eq!(table.len(), 0);
    }
}
