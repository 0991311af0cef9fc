//! Shared data model: queue items and the lifecycle events the engine emits for them.

use std::fmt;

/// An opaque unit enqueued for transmission to the device.
///
/// `id` is caller-chosen and may be empty. `seq`/`seq_max` are 1-based and
/// only meaningful when a single client submission expanded into several
/// lines (see [`crate::Engine::queue_command`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub data: String,
    pub seq: usize,
    pub seq_max: usize,
}

impl QueueItem {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            seq: 1,
            seq_max: 1,
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data.split_whitespace().next().unwrap_or(""))
    }
}

/// Anything a [`crate::Queue`] can carry must know its own byte length, so the
/// queue can maintain its running byte-length counter in `O(1)`.
pub trait ByteLenable {
    fn byte_len(&self) -> usize;
}

impl ByteLenable for QueueItem {
    fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl ByteLenable for String {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteLenable for CommandResponse {
    fn byte_len(&self) -> usize {
        self.item().data.len()
    }
}

/// A lifecycle event the engine emits for a queued [`QueueItem`].
///
/// For any item with a non-empty `id`, the engine emits `Queued` -> `Sent` ->
/// (`Done` | `Error`), each exactly once, in that order. Items with an empty
/// id may skip intermediate notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Queued(QueueItem),
    Sent(QueueItem),
    Done(QueueItem),
    Error(QueueItem, crate::Error),
}

impl CommandResponse {
    pub fn item(&self) -> &QueueItem {
        match self {
            CommandResponse::Queued(i)
            | CommandResponse::Sent(i)
            | CommandResponse::Done(i)
            | CommandResponse::Error(i, _) => i,
        }
    }
}
