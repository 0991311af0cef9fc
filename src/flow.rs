//! Protocol-specific tuning knobs a [`crate::Handler`] exposes to the engine.
//!
//! Mirrors `original_source/buffer/flowconfig.go`'s `Config` type: everything
//! here is a small pluggable function so a protocol (Grbl, or any other
//! line-oriented device) can override exactly the behaviors it needs while
//! inheriting sane defaults for the rest.

use std::sync::Arc;

use crate::scanner::{scan_lines, SplitFn};
use crate::types::QueueItem;

/// A predicate `FlowConfig` wraps in a `Box<dyn Fn>`.
pub type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub type WrapFn = Box<dyn Fn(&str) -> String + Send + Sync>;
/// Strips single-character realtime control bytes out of a submission,
/// returning them (in order) separately from the remaining data. These
/// bypass every queue and are written to the device immediately, ahead of
/// everything `IsControl` governs.
pub type ControlSplitFn = Box<dyn Fn(&str) -> (Vec<char>, String) + Send + Sync>;
/// The keep-predicate for a partial buffer reset: items it rejects are
/// dropped from both the engine's admission queues and the Handler's own
/// in-flight tracking. `Arc`-shared so the same predicate instance can be
/// applied to more than one queue without cloning its captured state.
pub type KeepPredicate = Arc<dyn Fn(&QueueItem) -> bool + Send + Sync>;
/// Returns the keep-predicate for a partial buffer reset, or `None` if
/// `data` does not trigger one.
pub type PartialResetFn = Box<dyn Fn(&str) -> Option<KeepPredicate> + Send + Sync>;

/// Tunes how the engine classifies and frames bytes for one protocol.
///
/// Grounded in `original_source/buffer/flowconfig.go`. Every field has a
/// meaningful default (see [`FlowConfig::default`]); a [`crate::Handler`]
/// overrides only the fields its protocol actually cares about.
pub struct FlowConfig {
    /// Pulls realtime control characters (e.g. Grbl's `?`) out of a raw
    /// submission. Default: none, the input passes through unchanged.
    pub split_control_chars: ControlSplitFn,
    /// Appends whatever line terminator the device expects. Default: `\n`.
    pub wrap_input: WrapFn,
    /// Tokenizes a client submission into the individual lines that must
    /// each be queued and acknowledged independently.
    pub send_split: SplitFn,
    /// Tokenizes bytes read from the device into response lines.
    pub recv_split: SplitFn,
    /// True if a queued line should bypass the normal write queue and go
    /// out via the priority queue instead (e.g. Grbl's `$J=` jog commands).
    pub is_control: Predicate,
    /// True if a command is meant for the Handler itself (e.g. `*init*`)
    /// and must never reach the device.
    pub is_meta: Predicate,
    /// True if writing this line clears the device's entire in-flight
    /// buffer (e.g. a soft-reset byte).
    pub is_buffer_reset: Predicate,
    /// True if writing this line only partially resets the in-flight
    /// buffer; see [`PartialResetFn`].
    pub is_partial_buffer_reset: PartialResetFn,
}

impl FlowConfig {
    /// Returns a [`ControlSplitFn`] that strips any of `chars` out of the
    /// input as individual realtime control characters. Grounded in
    /// `original_source/buffer/flowconfig.go`'s `SplitStaticControlChars`.
    pub fn split_static_control_chars(chars: &'static str) -> ControlSplitFn {
        Box::new(move |input: &str| {
            let mut ctrl = Vec::new();
            let mut data = String::with_capacity(input.len());
            for c in input.chars() {
                if chars.contains(c) {
                    ctrl.push(c);
                } else {
                    data.push(c);
                }
            }
            (ctrl, data)
        })
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            split_control_chars: Box::new(|input: &str| (Vec::new(), input.to_string())),
            wrap_input: Box::new(|s: &str| format!("{s}\n")),
            send_split: Box::new(scan_lines),
            recv_split: Box::new(scan_lines),
            is_control: Box::new(|_| false),
            is_meta: Box::new(|_| false),
            is_buffer_reset: Box::new(|_| false),
            is_partial_buffer_reset: Box::new(|_| None),
        }
    }
}
