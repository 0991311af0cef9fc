//! The pluggable protocol capability surface a device family implements.
//!
//! Grounded in `original_source/buffer/handler.go`'s `Handler` interface;
//! expressed as a trait with `&self` receivers, since spec.md §5 notes that
//! `check_buffer` is called from a queue's own servicing thread rather than
//! only the dispatch thread. Implementers needing private mutable state
//! (e.g. an in-flight accounting queue) must guard it themselves, as
//! [`crate::grbl::GrblHandler`] does.

use crate::flow::FlowConfig;
use crate::types::{CommandResponse, QueueItem};

/// A device protocol's view of the wire: what bytes are allowed onto it,
/// how responses correlate back to queued commands, and how device buffer
/// capacity is accounted for.
pub trait Handler: Send + Sync {
    /// The tokenization/classification rules this protocol needs.
    fn flow_config(&self) -> FlowConfig;

    /// True if `item` may be written to the device right now without
    /// overrunning its receive buffer.
    fn check_buffer(&self, item: &QueueItem) -> bool;

    /// True if the device is in a state (e.g. feed-hold) where only
    /// priority/control traffic should be written.
    fn is_paused(&self) -> bool;

    /// Called once per line about to be written to the device, before the
    /// admission check; lets the Handler record it as in-flight, or reject
    /// it outright (e.g. a jog command filtered during a feed hold).
    fn handle_input(&self, item: &QueueItem) -> Vec<CommandResponse>;

    /// Called for each line read back from the device; returns the
    /// lifecycle events (typically `Done`/`Error`) this response resolves.
    fn handle_response(&self, line: &str) -> Vec<CommandResponse>;

    /// Called for a meta command (`*init*`, `*status*`, ...) instead of
    /// ever touching the device; the returned string, if any, is delivered
    /// through the same channel as a device read.
    fn handle_meta(&self, cmd: &str) -> Option<String>;

    /// Called on the poll interval to optionally emit a status-request line.
    fn poll_command(&self) -> Option<String> {
        None
    }

    /// Invoked when a written item's payload matches
    /// `FlowConfig::is_partial_buffer_reset`; implementers with a private
    /// in-flight queue should drop entries `keep` rejects and return the
    /// resulting `Error`/`Done` events for them. Default: no-op.
    fn apply_reset_filter(&self, keep: &dyn Fn(&QueueItem) -> bool) -> Vec<CommandResponse> {
        let _ = keep;
        Vec::new()
    }
}

/// A no-op `Handler`: everything is admitted immediately, nothing is ever
/// paused, and meta/response handling produce no events. Grounded in
/// `original_source/buffer/default.go`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn flow_config(&self) -> FlowConfig {
        FlowConfig::default()
    }

    fn check_buffer(&self, _item: &QueueItem) -> bool {
        true
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn handle_input(&self, _item: &QueueItem) -> Vec<CommandResponse> {
        Vec::new()
    }

    fn handle_response(&self, _line: &str) -> Vec<CommandResponse> {
        Vec::new()
    }

    fn handle_meta(&self, _cmd: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_handler_admits_everything() {
        let h = NoopHandler;
        assert!(h.check_buffer(&QueueItem::new("", "G0X1")));
        assert!(!h.is_paused());
        assert!(h.handle_response("ok").is_empty());
        assert_eq!(h.handle_meta("*init*"), None);
    }
}
