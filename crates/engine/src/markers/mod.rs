//! Incremental control-marker detection over the growing run buffer.
//!
//! [`ControlMarkerParser::scan`] is called after every append. It reports
//! what changed since the previous scan: new visible text, append-only
//! think-span updates, the first undispatched tool-call marker, and the
//! offset of an honored stop sequence. Once a marker has been dispatched
//! and its result appended, [`commit`](ControlMarkerParser::commit) settles
//! the buffer up to that point so it is never reported again.

pub mod scan;

use std::ops::Range;

use lt_domain::config::Channel;

pub use scan::MarkerKind;
use scan::{Piece, Segmenter};

/// A tool-call marker found in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedMarker {
    pub kind: MarkerKind,
    /// Byte range of the whole marker in the run buffer.
    pub span: Range<usize>,
    /// Marker text as the model wrote it.
    pub raw: String,
    /// The JSON (or plain) payload inside the marker.
    pub payload: String,
}

/// Incremental update for one think span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkUpdate {
    pub span_id: usize,
    /// Text not yet reported for this span.
    pub delta: String,
    pub complete: bool,
}

/// Result of one [`ControlMarkerParser::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanUpdate {
    /// Display text appended since the previous scan.
    pub visible_delta: String,
    pub think: Vec<ThinkUpdate>,
    pub marker: Option<DetectedMarker>,
    /// Buffer offset to truncate at: a stop sequence matched outside
    /// reasoning.
    pub stop_at: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct SpanProgress {
    emitted: usize,
    complete: bool,
}

pub struct ControlMarkerParser {
    channel: Channel,
    stop_sequences: Vec<String>,
    /// Buffer offset before which everything is settled.
    committed: usize,
    committed_visible: String,
    committed_spans: usize,
    /// Visible text reported so far.
    visible: String,
    spans: Vec<SpanProgress>,
}

impl ControlMarkerParser {
    pub fn new(channel: Channel, stop_sequences: Vec<String>) -> Self {
        let stop_sequences = stop_sequences.into_iter().filter(|s| !s.is_empty()).collect();
        Self {
            channel,
            stop_sequences,
            committed: 0,
            committed_visible: String::new(),
            committed_spans: 0,
            visible: String::new(),
            spans: Vec::new(),
        }
    }

    /// Visible text reported so far.
    pub fn visible_text(&self) -> &str {
        &self.visible
    }

    pub fn committed_offset(&self) -> usize {
        self.committed
    }

    fn segment(&self, buf: &str, at_end: bool) -> Vec<Piece> {
        Segmenter::new(
            &buf[self.committed..],
            self.committed,
            self.channel,
            &self.stop_sequences,
            at_end,
        )
        .run()
    }

    /// Classify `buf` and report what changed since the last scan.
    pub fn scan(&mut self, buf: &str) -> ScanUpdate {
        let pieces = self.segment(buf, false);
        let stop_at = self.find_stop(buf, &pieces);
        let marker = pieces.iter().find_map(|p| match p {
            Piece::ToolCall {
                span,
                payload,
                kind,
            } => Some(DetectedMarker {
                kind: *kind,
                span: span.clone(),
                raw: buf[span.clone()].to_string(),
                payload: buf[payload.clone()].to_string(),
            }),
            _ => None,
        });

        // Whichever comes first wins; the other is re-evaluated later.
        let (marker, stop_at) = match (marker, stop_at) {
            (Some(m), Some(s)) if s <= m.span.start => (None, Some(s)),
            (Some(m), _) => (Some(m), None),
            (None, s) => (None, s),
        };
        let limit = marker
            .as_ref()
            .map(|m| m.span.start)
            .or(stop_at)
            .unwrap_or(buf.len());

        let (visible_delta, think) = self.collect(buf, &pieces, limit);
        ScanUpdate {
            visible_delta,
            think,
            marker,
            stop_at,
        }
    }

    /// Final pass at natural end of stream: held-back fragments become
    /// text and open think spans are closed.
    pub fn finish(&mut self, buf: &str) -> ScanUpdate {
        let pieces = self.segment(buf, true);
        let (visible_delta, mut think) = self.collect(buf, &pieces, buf.len());
        for (span_id, progress) in self.spans.iter_mut().enumerate() {
            if !progress.complete {
                progress.complete = true;
                match think.iter_mut().find(|u| u.span_id == span_id) {
                    Some(update) => update.complete = true,
                    None => think.push(ThinkUpdate {
                        span_id,
                        delta: String::new(),
                        complete: true,
                    }),
                }
            }
        }
        ScanUpdate {
            visible_delta,
            think,
            marker: None,
            stop_at: None,
        }
    }

    /// Mark every open think span as interrupted. Returns their ids.
    pub fn interrupt(&mut self) -> Vec<usize> {
        self.spans
            .iter_mut()
            .enumerate()
            .filter(|(_, p)| !p.complete)
            .map(|(id, p)| {
                p.complete = true;
                id
            })
            .collect()
    }

    /// Settle the buffer up to `offset` (end of a dispatched marker and its
    /// appended result). Later scans start from there.
    pub fn commit(&mut self, buf: &str, offset: usize) {
        let pieces = self.segment(buf, false);
        let mut boundary = offset.min(buf.len());
        for piece in &pieces {
            let straddles = piece.start() < boundary && piece.end() > boundary;
            if straddles && !matches!(piece, Piece::Text(_)) {
                boundary = piece.start();
                break;
            }
        }

        for piece in pieces {
            if piece.start() >= boundary {
                break;
            }
            match piece {
                Piece::Text(r) => self
                    .committed_visible
                    .push_str(&buf[r.start..r.end.min(boundary)]),
                Piece::Think { .. } => self.committed_spans += 1,
                _ => {}
            }
        }
        self.committed = boundary;
    }

    /// Earliest stop-sequence match in text, unless reasoning is open.
    fn find_stop(&self, buf: &str, pieces: &[Piece]) -> Option<usize> {
        if self.stop_sequences.is_empty() {
            return None;
        }
        let open_think = pieces
            .iter()
            .any(|p| matches!(p, Piece::Think { complete: false, .. }));
        if open_think {
            return None;
        }
        pieces
            .iter()
            .filter_map(|p| match p {
                Piece::Text(r) => Some(r),
                _ => None,
            })
            .flat_map(|r| {
                self.stop_sequences
                    .iter()
                    .filter_map(move |stop| buf[r.clone()].find(stop.as_str()).map(|i| r.start + i))
            })
            .min()
    }

    fn collect(&mut self, buf: &str, pieces: &[Piece], limit: usize) -> (String, Vec<ThinkUpdate>) {
        let mut visible = self.committed_visible.clone();
        let mut think = Vec::new();
        let mut span_id = self.committed_spans;

        for piece in pieces {
            if piece.start() >= limit {
                break;
            }
            match piece {
                Piece::Text(r) => visible.push_str(&buf[r.start..r.end.min(limit)]),
                Piece::Think {
                    content, complete, ..
                } => {
                    if let Some(update) = self.advance_span(span_id, &buf[content.clone()], *complete) {
                        think.push(update);
                    }
                    span_id += 1;
                }
                _ => {}
            }
        }

        let delta = match visible.strip_prefix(self.visible.as_str()) {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            Some(_) => String::new(),
            None => {
                tracing::debug!(
                    reported = self.visible.len(),
                    current = visible.len(),
                    "visible text diverged from reported prefix"
                );
                String::new()
            }
        };
        if !delta.is_empty() {
            self.visible = visible;
        }
        (delta, think)
    }

    fn advance_span(&mut self, span_id: usize, content: &str, complete: bool) -> Option<ThinkUpdate> {
        if self.spans.len() <= span_id {
            self.spans.resize_with(span_id + 1, SpanProgress::default);
        }
        let progress = &mut self.spans[span_id];
        if progress.complete {
            return None;
        }
        let delta = match content.get(progress.emitted..) {
            Some(rest) => rest,
            None => "",
        };
        if delta.is_empty() && !complete {
            return None;
        }
        progress.emitted = progress.emitted.max(content.len());
        progress.complete = complete;
        Some(ThinkUpdate {
            span_id,
            delta: delta.to_string(),
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ControlMarkerParser {
        ControlMarkerParser::new(Channel::Local, Vec::new())
    }

    #[test]
    fn brace_inside_string_does_not_end_payload() {
        let mut p = parser();
        let buf = r#"TOOL_CALL:{"name":"x","arguments":{"a":"}"}}"#;
        let update = p.scan(buf);
        let marker = update.marker.unwrap();
        assert_eq!(marker.kind, MarkerKind::Line);
        assert_eq!(marker.payload, r#"{"name":"x","arguments":{"a":"}"}}"#);
        assert_eq!(marker.span, 0..buf.len());
    }

    #[test]
    fn unterminated_think_reports_incomplete() {
        let mut p = parser();
        let update = p.scan("<think>weighing options");
        assert_eq!(
            update.think,
            vec![ThinkUpdate {
                span_id: 0,
                delta: "weighing options".into(),
                complete: false
            }]
        );
        assert!(update.visible_delta.is_empty());
    }

    #[test]
    fn think_updates_are_append_only_and_complete_once() {
        let mut p = parser();
        let a = p.scan("<think>ab");
        let b = p.scan("<think>abc</th");
        let c = p.scan("<think>abc</think>x");
        let d = p.scan("<think>abc</think>xy");
        assert_eq!(a.think[0].delta, "ab");
        assert_eq!(b.think[0].delta, "c");
        assert!(!b.think[0].complete);
        assert_eq!(c.think[0].delta, "");
        assert!(c.think[0].complete);
        assert_eq!(c.visible_delta, "x");
        assert!(d.think.is_empty());
        assert_eq!(d.visible_delta, "y");
    }

    #[test]
    fn tool_call_inside_open_think_is_ignored_locally() {
        let mut p = parser();
        let update = p.scan(r#"<think>maybe TOOL_CALL: {"name":"x","arguments":{}}"#);
        assert!(update.marker.is_none());
        assert!(!update.think[0].complete);
    }

    #[test]
    fn tool_call_inside_open_think_is_honored_for_remote() {
        let mut p = ControlMarkerParser::new(Channel::Remote, Vec::new());
        let update = p.scan(r#"<think>maybe TOOL_CALL: {"name":"x","arguments":{}}"#);
        let marker = update.marker.unwrap();
        assert_eq!(marker.payload, r#"{"name":"x","arguments":{}}"#);
        assert_eq!(update.think[0].delta, "maybe ");
    }

    #[test]
    fn tool_call_inside_closed_think_is_ignored() {
        let mut p = ControlMarkerParser::new(Channel::Remote, Vec::new());
        let update = p.scan(r#"<think>TOOL_CALL: {"name":"x","arguments":{}}</think>done"#);
        assert!(update.marker.is_none());
        assert_eq!(update.visible_delta, "done");
    }

    #[test]
    fn stop_after_think_truncates_to_empty() {
        let mut p = ControlMarkerParser::new(Channel::Local, vec!["Hello".into()]);
        let buf = "<think>reasoning</think>Hello";
        let update = p.scan(buf);
        assert_eq!(update.stop_at, Some(24));
        assert_eq!(&buf[..24], "<think>reasoning</think>");
        assert_eq!(update.visible_delta, "");
        assert_eq!(p.visible_text(), "");
        assert!(update.think[0].complete);
    }

    #[test]
    fn stop_inside_open_think_is_not_honored() {
        let mut p = ControlMarkerParser::new(Channel::Local, vec!["Hello".into()]);
        let update = p.scan("Hi <think>say Hello");
        assert_eq!(update.stop_at, None);
        assert_eq!(update.visible_delta, "Hi ");
    }

    #[test]
    fn stop_prefix_is_held_back() {
        let mut p = ControlMarkerParser::new(Channel::Local, vec!["<|end|>".into()]);
        assert_eq!(p.scan("Done<|en").visible_delta, "Done");
        let update = p.scan("Done<|end|> junk");
        assert_eq!(update.stop_at, Some(4));
        assert_eq!(update.visible_delta, "");
    }

    #[test]
    fn partial_tag_is_held_back_until_resolved() {
        let mut p = parser();
        assert_eq!(p.scan("Hello <thi").visible_delta, "Hello ");
        let update = p.scan("Hello <thinking is fun");
        assert_eq!(update.visible_delta, "<thinking is fun");
    }

    #[test]
    fn tagged_and_bare_markers() {
        let mut p = parser();
        let tagged = p.scan("<tool_call>\n{\"name\":\"clock\",\"arguments\":{}}\n</tool_call>");
        let marker = tagged.marker.unwrap();
        assert_eq!(marker.kind, MarkerKind::Tagged);
        assert_eq!(marker.payload, "{\"name\":\"clock\",\"arguments\":{}}");

        let mut p = parser();
        let bare = p.scan(r#"Sure. {"tool": "clock", "args": {}} "#);
        assert_eq!(bare.visible_delta, "Sure. ");
        assert_eq!(bare.marker.unwrap().kind, MarkerKind::Bare);
    }

    #[test]
    fn result_echo_is_hidden() {
        let mut p = parser();
        let update = p.scan("A\nTOOL_RESULT: {\"ok\":true}\nB");
        assert!(update.marker.is_none());
        assert_eq!(update.visible_delta, "A\nB");
    }

    #[test]
    fn orphan_close_tag_is_hidden() {
        let mut p = parser();
        assert_eq!(p.scan("reasoned</think>Answer").visible_delta, "reasonedAnswer");
    }

    #[test]
    fn commit_settles_dispatched_marker() {
        let mut p = parser();
        let mut buf = String::from(r#"Checking. TOOL_CALL: {"name":"clock","arguments":{}}"#);
        let update = p.scan(&buf);
        assert_eq!(update.visible_delta, "Checking. ");
        let marker = update.marker.unwrap();

        buf.truncate(marker.span.end);
        buf.push('\n');
        buf.push_str(r#"TOOL_RESULT: {"utc":"noon"}"#);
        buf.push('\n');
        let settled = buf.len();
        buf.push_str("It is noon.");
        p.commit(&buf, settled);
        assert_eq!(p.committed_offset(), settled);

        let update = p.scan(&buf);
        assert!(update.marker.is_none());
        assert_eq!(update.visible_delta, "It is noon.");
        assert_eq!(p.visible_text(), "Checking. It is noon.");
    }

    #[test]
    fn finish_flushes_pending_and_closes_think() {
        let mut p = parser();
        p.scan("<think>abc");
        p.scan("<think>abc</think>Call TOOL_CA");
        let update = p.finish("<think>abc</think>Call TOOL_CA");
        assert_eq!(update.visible_delta, "TOOL_CA");
        assert_eq!(p.visible_text(), "Call TOOL_CA");

        let mut p = parser();
        p.scan("<think>abc");
        let update = p.finish("<think>abc");
        assert_eq!(
            update.think,
            vec![ThinkUpdate {
                span_id: 0,
                delta: String::new(),
                complete: true
            }]
        );
    }

    #[test]
    fn interrupt_reports_open_spans_once() {
        let mut p = parser();
        p.scan("<think>a</think><think>b");
        assert_eq!(p.interrupt(), vec![1]);
        assert!(p.interrupt().is_empty());
    }
}
