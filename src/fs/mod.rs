//! File system subsystem.
//!
//! # Data Flow
//! ```text
//! platform notifications (inotify / kqueue / ...)
//!     → watcher.rs (filter by registered path + mask, batch)
//!     → mpsc channel
//!     → owner task (certificate reload)
//! ```

pub mod watcher;

pub use watcher::{EventBatch, EventMask, FileWatcher, FileWatcherEvent};
