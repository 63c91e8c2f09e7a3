//! Directory watcher.
//!
//! Watches directories for file changes and delivers them as batches of
//! `{directory, name, mask}` records over a channel. The channel keeps
//! producing batches until the owner drops the receiver or the platform
//! watcher reports an error, which is logged and ends the stream.

use dashmap::DashMap;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Set of change kinds a watch is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const CREATE: EventMask = EventMask(1 << 0);
    pub const MODIFY: EventMask = EventMask(1 << 1);
    /// A file opened for writing was closed.
    pub const CLOSE_WRITE: EventMask = EventMask(1 << 2);
    pub const REMOVE: EventMask = EventMask(1 << 3);
    /// A file was renamed into the directory.
    pub const MOVED_TO: EventMask = EventMask(1 << 4);

    pub const fn empty() -> Self {
        EventMask(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    fn from_kind(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Self::CREATE,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Self::MOVED_TO,
            EventKind::Modify(_) => Self::MODIFY,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => Self::CLOSE_WRITE,
            EventKind::Remove(_) => Self::REMOVE,
            _ => Self::empty(),
        }
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// One change inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWatcherEvent {
    pub directory: PathBuf,
    pub name: String,
    pub mask: EventMask,
}

impl FileWatcherEvent {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

pub type EventBatch = Vec<FileWatcherEvent>;

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    registered: Arc<DashMap<PathBuf, EventMask>>,
    events: Option<mpsc::UnboundedReceiver<EventBatch>>,
}

impl FileWatcher {
    pub fn new() -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registered = Arc::new(DashMap::new());

        let mut tx = Some(tx);
        let lookup = Arc::clone(&registered);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Some(sender) = tx.as_ref() else {
                    return;
                };
                match res {
                    Ok(event) => {
                        let batch = translate(&lookup, &event);
                        if !batch.is_empty() && sender.send(batch).is_err() {
                            tracing::debug!("File watch receiver dropped");
                            tx = None;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "File watch failed, stopping");
                        tx = None;
                    }
                }
            },
            notify::Config::default(),
        )?;

        Ok(Self {
            watcher,
            registered,
            events: Some(rx),
        })
    }

    /// Start watching `path` (a directory, or a single file) for `mask` events.
    pub fn add_path(&mut self, path: impl AsRef<Path>, mask: EventMask) -> notify::Result<()> {
        let path = normalize(path.as_ref());
        self.watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), mask = mask.bits(), "Watching path");
        self.registered
            .entry(path)
            .and_modify(|m| *m |= mask)
            .or_insert(mask);
        Ok(())
    }

    pub fn remove_path(&mut self, path: impl AsRef<Path>) -> notify::Result<()> {
        let path = normalize(path.as_ref());
        self.registered.remove(&path);
        self.watcher.unwatch(&path)
    }

    /// Take the stream of event batches. Only the first call returns it.
    pub fn watch(&mut self) -> Option<mpsc::UnboundedReceiver<EventBatch>> {
        self.events.take()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

fn translate(registered: &DashMap<PathBuf, EventMask>, event: &Event) -> EventBatch {
    let mask = EventMask::from_kind(&event.kind);
    if mask.is_empty() {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter_map(|path| {
            let path = normalize(path);
            let directory = path.parent()?.to_path_buf();
            let name = path.file_name()?.to_string_lossy().into_owned();

            let wanted = registered
                .get(&path)
                .or_else(|| registered.get(&directory))
                .map(|entry| *entry.value())?;
            wanted.intersects(mask).then(|| FileWatcherEvent {
                directory,
                name,
                mask,
            })
        })
        .collect()
}
