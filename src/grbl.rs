//! A worked [`crate::Handler`] for Grbl-family CNC controllers.
//!
//! Ported from `original_source/buffer/grbl/handler.go` and
//! `original_source/buffer/grbl/scaninput.go`: a 125-byte device receive
//! buffer, jog-command filtering while feed-hold is active, and the
//! realtime/meta/reset control-byte layout Grbl firmwares use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::flow::FlowConfig;
use crate::handler::Handler;
use crate::types::{CommandResponse, QueueItem};

/// Grbl's serial receive buffer, in bytes. Matches the firmware's
/// `RX_BUFFER_SIZE - 1` convention used throughout the original source.
const GRBL_MAX: usize = 125;

/// Realtime single-byte commands Grbl accepts outside the normal line
/// protocol: soft reset, status query, feed hold/resume, and the jog
/// cancel/door/safety-door bytes.
const REALTIME_CHARS: &str = "\u{18}?~!\u{84}\u{85}";

fn is_jog(data: &str) -> bool {
    data.starts_with("$J=")
}

/// Tracks in-flight bytes written to the device and outstanding items
/// awaiting a response, so `check_buffer` can enforce [`GRBL_MAX`] and
/// `handle_response` can correlate the next `ok`/`error:*` line to the
/// oldest in-flight item.
struct Inflight {
    items: VecDeque<QueueItem>,
    bytes: usize,
}

/// A [`Handler`] for Grbl and Grbl-compatible firmwares.
pub struct GrblHandler {
    inflight: Mutex<Inflight>,
    feed_hold: AtomicBool,
    /// The firmware's startup banner, last reported by a `Grbl ...` line.
    version: Mutex<String>,
    /// The most recent `<...>` status report line.
    last_status: Mutex<String>,
}

impl Default for GrblHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GrblHandler {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(Inflight {
                items: VecDeque::new(),
                bytes: 0,
            }),
            feed_hold: AtomicBool::new(false),
            version: Mutex::new(String::new()),
            last_status: Mutex::new(String::new()),
        }
    }
}

impl Handler for GrblHandler {
    fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            split_control_chars: FlowConfig::split_static_control_chars(REALTIME_CHARS),
            send_split: Box::new(scan_input),
            is_control: Box::new(is_jog),
            is_meta: Box::new(|data: &str| data.starts_with('*') || data == "%"),
            is_buffer_reset: Box::new(|data: &str| data == "\u{18}" || data == "%"),
            is_partial_buffer_reset: Box::new(|data: &str| match data {
                "!" | "\u{84}" | "\u{85}" => {
                    Some(Arc::new(|item: &QueueItem| !is_jog(&item.data)) as crate::flow::KeepPredicate)
                }
                _ => None,
            }),
            ..FlowConfig::default()
        }
    }

    fn check_buffer(&self, item: &QueueItem) -> bool {
        let inflight = self.inflight.lock().unwrap();
        inflight.bytes + item.data.len() <= GRBL_MAX
    }

    fn is_paused(&self) -> bool {
        self.feed_hold.load(Ordering::SeqCst)
    }

    fn handle_input(&self, item: &QueueItem) -> Vec<CommandResponse> {
        if self.is_paused() && !is_jog(&item.data) {
            return vec![CommandResponse::Error(
                item.clone(),
                crate::Error::Protocol("only jog commands accepted during feed hold".into()),
            )];
        }

        if item.data.len() == 1 {
            return vec![CommandResponse::Done(item.clone())];
        }

        let mut inflight = self.inflight.lock().unwrap();
        let prospective = inflight.bytes + item.data.len();
        if prospective > GRBL_MAX {
            return vec![CommandResponse::Error(
                item.clone(),
                crate::Error::HandlerInvariant(format!(
                    "device receive buffer overflow: {prospective} > {GRBL_MAX}"
                )),
            )];
        }
        inflight.bytes = prospective;
        inflight.items.push_back(item.clone());
        Vec::new()
    }

    fn handle_response(&self, line: &str) -> Vec<CommandResponse> {
        if line.starts_with("Grbl") {
            *self.version.lock().unwrap() = line.to_string();
            let mut inflight = self.inflight.lock().unwrap();
            let removed: Vec<QueueItem> = inflight.items.drain(..).collect();
            inflight.bytes = 0;
            return removed
                .into_iter()
                .map(|item| CommandResponse::Error(item, crate::Error::Reset))
                .collect();
        }
        if line.starts_with('<') {
            *self.last_status.lock().unwrap() = line.to_string();
            self.feed_hold
                .store(line.contains("Hold") || line.contains("Door"), Ordering::SeqCst);
            return Vec::new();
        }

        let is_ok = line == "ok";
        let is_error = line.starts_with("error:");
        if !is_ok && !is_error {
            return Vec::new();
        }

        let mut inflight = self.inflight.lock().unwrap();
        let Some(item) = inflight.items.pop_front() else {
            return Vec::new();
        };
        inflight.bytes = inflight.bytes.saturating_sub(item.data.len());
        drop(inflight);

        if is_ok {
            vec![CommandResponse::Done(item)]
        } else {
            vec![CommandResponse::Error(item, crate::Error::Protocol(line.to_string()))]
        }
    }

    fn handle_meta(&self, cmd: &str) -> Option<String> {
        let reply = match cmd {
            "*init*" => self.version.lock().unwrap().clone(),
            "*status*" => self.last_status.lock().unwrap().clone(),
            _ => return None,
        };
        if reply.is_empty() {
            None
        } else {
            Some(reply)
        }
    }

    fn apply_reset_filter(&self, keep: &dyn Fn(&QueueItem) -> bool) -> Vec<CommandResponse> {
        let mut inflight = self.inflight.lock().unwrap();
        let mut kept = VecDeque::with_capacity(inflight.items.len());
        let mut events = Vec::new();
        for item in inflight.items.drain(..) {
            if keep(&item) {
                kept.push_back(item);
            } else {
                inflight.bytes = inflight.bytes.saturating_sub(item.data.len());
                events.push(CommandResponse::Done(item));
            }
        }
        inflight.items = kept;
        events
    }
}

/// A line-oriented tokenizer for g-code submitted to a Grbl controller:
/// splits on line boundaries like [`crate::scanner::scan_lines`], then
/// strips spaces, `;...` end-of-line comments, and `(...)` inline comments
/// from each line. Ported from `original_source/buffer/grbl/scaninput.go`.
pub fn scan_input(data: &[u8], at_eof: bool) -> Result<(usize, Option<Vec<u8>>), crate::Error> {
    let (advance, token) = match crate::scanner::scan_lines(data, at_eof)? {
        (advance, Some(token)) => (advance, token),
        (advance, None) => return Ok((advance, None)),
    };
    if token.is_empty() {
        return Ok((advance, Some(token)));
    }

    let mut tok: Vec<u8> = token.into_iter().filter(|&b| b != b' ').collect();

    if let Some(pos) = tok.iter().position(|&b| b == b';') {
        tok.truncate(pos);
    }

    loop {
        let Some(start) = tok.iter().position(|&b| b == b'(') else {
            return Ok((advance, Some(tok)));
        };
        match tok[start..].iter().position(|&b| b == b')') {
            Some(end) => {
                tok.drain(start..start + end + 1);
            }
            None => {
                tok.truncate(start);
                return Ok((advance, Some(tok)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_one(input: &str) -> String {
        let (_, token) = scan_input(input.as_bytes(), true).unwrap();
        String::from_utf8(token.unwrap_or_default()).unwrap()
    }

    #[test]
    fn scan_input_strips_semicolon_comments() {
        assert_eq!(scan_one("G0 X1 ; move to start"), "G0X1");
    }

    #[test]
    fn scan_input_strips_paren_comments() {
        assert_eq!(scan_one("G0 (rapid move) X1 Y2"), "G0X1Y2");
    }

    #[test]
    fn scan_input_passes_plain_gcode_through() {
        assert_eq!(scan_one("G0X1Y2"), "G0X1Y2");
    }

    #[test]
    fn scan_input_handles_unterminated_paren() {
        assert_eq!(scan_one("yet another ( broken one"), "yetanother");
    }

    #[test]
    fn scan_input_drops_text_after_broken_comment_mix() {
        assert_eq!(scan_one("and a (broken ; one)"), "anda");
    }

    #[test]
    fn check_buffer_enforces_125_byte_cap() {
        let h = GrblHandler::new();
        let big = QueueItem::new("", "x".repeat(GRBL_MAX));
        assert!(h.check_buffer(&big));
        h.handle_input(&big);
        let more = QueueItem::new("", "y");
        assert!(!h.check_buffer(&more));
    }

    #[test]
    fn handle_response_correlates_fifo() {
        let h = GrblHandler::new();
        let a = QueueItem::new("a", "G0X1");
        let b = QueueItem::new("b", "G0Y1");
        h.handle_input(&a);
        h.handle_input(&b);

        let events = h.handle_response("ok");
        assert_eq!(events, vec![CommandResponse::Done(a)]);

        let events = h.handle_response("error:9");
        match &events[0] {
            CommandResponse::Error(item, _) => assert_eq!(item.id, "b"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn non_jog_rejected_during_feed_hold() {
        let h = GrblHandler::new();
        h.handle_response("<Hold:0>");
        assert!(h.is_paused());
        let normal = QueueItem::new("g", "G0X1");
        let events = h.handle_input(&normal);
        assert!(matches!(events.as_slice(), [CommandResponse::Error(_, _)]));
    }

    #[test]
    fn jog_allowed_during_feed_hold() {
        let h = GrblHandler::new();
        h.handle_response("<Hold:0>");
        assert!(h.is_paused());
        let jog = QueueItem::new("j", "$J=X1");
        let events = h.handle_input(&jog);
        assert!(events.is_empty());
    }

    #[test]
    fn single_byte_control_is_done_immediately() {
        let h = GrblHandler::new();
        let ctrl = QueueItem::new("", "?");
        let events = h.handle_input(&ctrl);
        assert_eq!(events, vec![CommandResponse::Done(ctrl)]);
    }

    #[test]
    fn buffer_overflow_surfaces_handler_invariant() {
        let h = GrblHandler::new();
        let big = QueueItem::new("", "x".repeat(GRBL_MAX));
        assert!(h.handle_input(&big).is_empty());
        let overflow = QueueItem::new("", "yy");
        let events = h.handle_input(&overflow);
        assert!(matches!(
            events.as_slice(),
            [CommandResponse::Error(_, crate::Error::HandlerInvariant(_))]
        ));
    }

    #[test]
    fn handle_meta_reports_recorded_version_and_status() {
        let h = GrblHandler::new();
        assert_eq!(h.handle_meta("*init*"), None);
        h.handle_response("Grbl 1.1h ['$' for help]");
        assert_eq!(
            h.handle_meta("*init*"),
            Some("Grbl 1.1h ['$' for help]".to_string())
        );

        assert_eq!(h.handle_meta("*status*"), None);
        h.handle_response("<Idle|MPos:0,0,0>");
        assert_eq!(h.handle_meta("*status*"), Some("<Idle|MPos:0,0,0>".to_string()));
    }

    #[test]
    fn apply_reset_filter_drops_rejected_items() {
        let h = GrblHandler::new();
        let jog = QueueItem::new("j", "$J=X1");
        let cut = QueueItem::new("c", "G0X1");
        h.handle_input(&jog);
        h.handle_input(&cut);

        let events = h.apply_reset_filter(&|item| !is_jog(&item.data));
        assert_eq!(events, vec![CommandResponse::Done(jog)]);

        let more = QueueItem::new("", "z");
        assert!(h.check_buffer(&more));
    }

    #[test]
    fn flow_config_routes_jog_as_priority() {
        let h = GrblHandler::new();
        let cfg = h.flow_config();
        assert!((cfg.is_control)("$J=X1"));
        assert!(!(cfg.is_control)("G0X1"));
    }
}
