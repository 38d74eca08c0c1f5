//! Segmentation of raw model output into text, reasoning, and markers.
//!
//! Everything here is a pure function of the buffer. Payload extents are
//! found by depth-counted brace/bracket scanning that treats `"` as a
//! string toggle and `\` as an escape, so braces inside string values never
//! close an object early.

use std::ops::Range;

use lt_domain::config::Channel;
use serde_json::Value;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const TOOL_RESPONSE_OPEN: &str = "<tool_response>";
pub const TOOL_RESPONSE_CLOSE: &str = "</tool_response>";
pub const LINE_TOOL_CALL: &str = "TOOL_CALL:";
pub const LINE_TOOL_RESULT: &str = "TOOL_RESULT:";

pub(crate) const NAME_KEYS: [&str; 3] = ["tool_name", "name", "tool"];
pub(crate) const ARGS_KEYS: [&str; 2] = ["arguments", "args"];

const TAGS: [&str; 4] = [THINK_OPEN, THINK_CLOSE, TOOL_CALL_OPEN, TOOL_RESPONSE_OPEN];
const LINE_MARKERS: [&str; 2] = [LINE_TOOL_CALL, LINE_TOOL_RESULT];

/// How a tool-call marker was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `TOOL_CALL: {...}`
    Line,
    /// `<tool_call>...</tool_call>`
    Tagged,
    /// A bare JSON object with a name key and an arguments key.
    Bare,
}

/// One classified region of the buffer. Ranges are absolute byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Text(Range<usize>),
    Think {
        span: Range<usize>,
        content: Range<usize>,
        complete: bool,
    },
    ToolCall {
        span: Range<usize>,
        payload: Range<usize>,
        kind: MarkerKind,
    },
    /// A tool-result echo. Hidden, never dispatched.
    ToolResult { span: Range<usize> },
    /// Trailing text that may still turn into a marker or stop sequence.
    Pending(Range<usize>),
}

impl Piece {
    pub(crate) fn start(&self) -> usize {
        match self {
            Piece::Text(r) | Piece::Pending(r) => r.start,
            Piece::Think { span, .. } | Piece::ToolCall { span, .. } | Piece::ToolResult { span } => {
                span.start
            }
        }
    }

    pub(crate) fn end(&self) -> usize {
        match self {
            Piece::Text(r) | Piece::Pending(r) => r.end,
            Piece::Think { span, .. } | Piece::ToolCall { span, .. } | Piece::ToolResult { span } => {
                span.end
            }
        }
    }
}

/// Exclusive end of the JSON object or array starting at `start`, or
/// `None` if it is not closed yet.
pub(crate) fn json_extent(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Length of the longest proper prefix of `tag` that `s` ends with.
pub(crate) fn partial_suffix(s: &str, tag: &str) -> usize {
    let max = s.len().min(tag.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&k| {
            tag.is_char_boundary(k)
                && s.is_char_boundary(s.len() - k)
                && s.ends_with(&tag[..k])
        })
        .unwrap_or(0)
}

/// Line markers only count at the start of a whitespace-delimited token.
fn at_token_start(s: &str, pos: usize) -> bool {
    match s[..pos].chars().next_back() {
        None => true,
        Some(c) => c.is_whitespace() || c == '>',
    }
}

/// A `{` only opens a candidate object when a key (or nothing yet) follows.
fn opens_object(s: &str, pos: usize) -> bool {
    match s[pos + 1..].trim_start().chars().next() {
        None => true,
        Some(c) => c == '"',
    }
}

pub(crate) fn is_tool_object(raw: &str) -> bool {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => {
            NAME_KEYS.iter().any(|k| map.get(*k).is_some_and(Value::is_string))
                && ARGS_KEYS.iter().any(|k| map.contains_key(*k))
        }
        _ => false,
    }
}

fn find_line_marker(s: &str, from: usize, marker: &str) -> Option<usize> {
    let mut i = from;
    while let Some(rel) = s[i..].find(marker) {
        let pos = i + rel;
        if at_token_start(s, pos) {
            return Some(pos);
        }
        i = pos + marker.len();
    }
    None
}

fn find_object(s: &str, from: usize) -> Option<usize> {
    let mut i = from;
    while let Some(rel) = s[i..].find('{') {
        let pos = i + rel;
        if opens_object(s, pos) {
            return Some(pos);
        }
        i = pos + 1;
    }
    None
}

#[derive(Debug, Clone, Copy)]
enum Candidate {
    ThinkOpen,
    ThinkClose,
    CallOpen,
    ResponseOpen,
    Line { marker: &'static str, is_call: bool },
    Object,
}

fn next_candidate(s: &str, from: usize) -> Option<(usize, Candidate)> {
    let literal = [
        (THINK_OPEN, Candidate::ThinkOpen),
        (THINK_CLOSE, Candidate::ThinkClose),
        (TOOL_CALL_OPEN, Candidate::CallOpen),
        (TOOL_RESPONSE_OPEN, Candidate::ResponseOpen),
    ]
    .into_iter()
    .filter_map(|(tag, c)| s[from..].find(tag).map(|rel| (from + rel, c)));

    let lines = [
        (LINE_TOOL_CALL, true),
        (LINE_TOOL_RESULT, false),
    ]
    .into_iter()
    .filter_map(|(marker, is_call)| {
        find_line_marker(s, from, marker).map(|pos| (pos, Candidate::Line { marker, is_call }))
    });

    let object = find_object(s, from).map(|pos| (pos, Candidate::Object));

    literal.chain(lines).chain(object).min_by_key(|(pos, _)| *pos)
}

/// Range of `s[range]` with surrounding whitespace removed.
fn trimmed(s: &str, range: Range<usize>) -> Range<usize> {
    let inner = &s[range.clone()];
    let start = range.start + (inner.len() - inner.trim_start().len());
    let end = range.end - (inner.len() - inner.trim_end().len());
    start..end.max(start)
}

/// Splits a buffer region into [`Piece`]s.
pub(crate) struct Segmenter<'a> {
    s: &'a str,
    base: usize,
    channel: Channel,
    holdback: &'a [String],
    at_end: bool,
    pieces: Vec<Piece>,
    text_start: usize,
}

impl<'a> Segmenter<'a> {
    /// `s` is the unsettled tail of the buffer, starting at absolute offset
    /// `base`. With `at_end`, nothing is held back: partial constructs
    /// become text and open think spans run to the end.
    pub(crate) fn new(
        s: &'a str,
        base: usize,
        channel: Channel,
        holdback: &'a [String],
        at_end: bool,
    ) -> Self {
        Self {
            s,
            base,
            channel,
            holdback,
            at_end,
            pieces: Vec::new(),
            text_start: 0,
        }
    }

    pub(crate) fn run(mut self) -> Vec<Piece> {
        let mut i = 0;
        while let Some((pos, candidate)) = next_candidate(self.s, i) {
            let next = match candidate {
                Candidate::ThinkOpen => self.think(pos),
                Candidate::ThinkClose => {
                    // Orphan close tag: hide it.
                    self.push_text(pos);
                    self.text_start = pos + THINK_CLOSE.len();
                    Some(self.text_start)
                }
                Candidate::CallOpen => self.tagged(pos, TOOL_CALL_OPEN, TOOL_CALL_CLOSE, true),
                Candidate::ResponseOpen => {
                    self.tagged(pos, TOOL_RESPONSE_OPEN, TOOL_RESPONSE_CLOSE, false)
                }
                Candidate::Line { marker, is_call } => self.line(pos, marker, is_call),
                Candidate::Object => self.object(pos),
            };
            match next {
                Some(n) => i = n,
                None => return self.pieces,
            }
        }
        self.finish_text();
        self.pieces
    }

    fn abs(&self, r: Range<usize>) -> Range<usize> {
        self.base + r.start..self.base + r.end
    }

    fn push_text(&mut self, until: usize) {
        if self.text_start < until {
            let r = self.abs(self.text_start..until);
            self.pieces.push(Piece::Text(r));
        }
    }

    /// Everything from `pos` on is undecided.
    fn pending(&mut self, pos: usize) {
        self.push_text(pos);
        let r = self.abs(pos..self.s.len());
        self.pieces.push(if self.at_end {
            Piece::Text(r)
        } else {
            Piece::Pending(r)
        });
        self.text_start = self.s.len();
    }

    fn think(&mut self, pos: usize) -> Option<usize> {
        self.push_text(pos);
        let s = self.s;
        let content_start = pos + THINK_OPEN.len();

        if let Some(rel) = s[content_start..].find(THINK_CLOSE) {
            let close = content_start + rel;
            let end = close + THINK_CLOSE.len();
            self.pieces.push(Piece::Think {
                span: self.abs(pos..end),
                content: self.abs(content_start..close),
                complete: true,
            });
            self.text_start = end;
            return Some(end);
        }

        // Remote backends validate tool grammar upstream, so a call inside
        // open reasoning is still honored there.
        if self.channel == Channel::Remote {
            if let Some(m) = find_line_marker(s, content_start, LINE_TOOL_CALL) {
                self.pieces.push(Piece::Think {
                    span: self.abs(pos..m),
                    content: self.abs(content_start..m),
                    complete: false,
                });
                self.text_start = m;
                return Some(m);
            }
        }

        let content_end = if self.at_end {
            s.len()
        } else {
            s.len() - partial_suffix(&s[content_start..], THINK_CLOSE)
        };
        self.pieces.push(Piece::Think {
            span: self.abs(pos..s.len()),
            content: self.abs(content_start..content_end),
            complete: false,
        });
        self.text_start = s.len();
        None
    }

    fn tagged(&mut self, pos: usize, open: &str, close: &str, is_call: bool) -> Option<usize> {
        let inner_start = pos + open.len();
        let Some(rel) = self.s[inner_start..].find(close) else {
            self.pending(pos);
            return None;
        };
        self.push_text(pos);
        let inner_end = inner_start + rel;
        let end = inner_end + close.len();
        let span = self.abs(pos..end);
        let piece = if is_call {
            Piece::ToolCall {
                span,
                payload: self.abs(trimmed(self.s, inner_start..inner_end)),
                kind: MarkerKind::Tagged,
            }
        } else {
            Piece::ToolResult { span }
        };
        self.pieces.push(piece);
        self.text_start = end;
        Some(end)
    }

    fn line(&mut self, pos: usize, marker: &str, is_call: bool) -> Option<usize> {
        let s = self.s;
        let bytes = s.as_bytes();
        let mut p = pos + marker.len();
        while p < s.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        if p == s.len() {
            self.pending(pos);
            return None;
        }

        let payload_end = if bytes[p] == b'{' || bytes[p] == b'[' {
            json_extent(s, p)
        } else {
            s[p..].find('\n').map(|rel| p + rel)
        };
        let Some(payload_end) = payload_end else {
            self.pending(pos);
            return None;
        };

        let mut end = payload_end;
        if s[end..].starts_with('\n') {
            end += 1;
        }
        self.push_text(pos);
        let span = self.abs(pos..end);
        let piece = if is_call {
            Piece::ToolCall {
                span,
                payload: self.abs(trimmed(s, p..payload_end)),
                kind: MarkerKind::Line,
            }
        } else {
            Piece::ToolResult { span }
        };
        self.pieces.push(piece);
        self.text_start = end;
        Some(end)
    }

    fn object(&mut self, pos: usize) -> Option<usize> {
        let Some(end) = json_extent(self.s, pos) else {
            self.pending(pos);
            return None;
        };
        if is_tool_object(&self.s[pos..end]) {
            self.push_text(pos);
            self.pieces.push(Piece::ToolCall {
                span: self.abs(pos..end),
                payload: self.abs(pos..end),
                kind: MarkerKind::Bare,
            });
            self.text_start = end;
        }
        // A non-tool object stays part of the surrounding text.
        Some(end)
    }

    fn finish_text(&mut self) {
        let len = self.s.len();
        if self.text_start >= len {
            return;
        }
        let hold = if self.at_end {
            0
        } else {
            self.holdback_len(&self.s[self.text_start..])
        };
        self.push_text(len - hold);
        if hold > 0 {
            let r = self.abs(len - hold..len);
            self.pieces.push(Piece::Pending(r));
        }
        self.text_start = len;
    }

    /// Bytes at the end of `tail` that could still grow into a tag, line
    /// marker, or stop sequence.
    fn holdback_len(&self, tail: &str) -> usize {
        let tags = TAGS.iter().map(|t| partial_suffix(tail, t));
        let lines = LINE_MARKERS.iter().map(|m| {
            let k = partial_suffix(tail, m);
            let start = self.s.len() - k;
            if k > 0 && at_token_start(self.s, start) {
                k
            } else {
                0
            }
        });
        let stops = self.holdback.iter().map(|stop| partial_suffix(tail, stop));
        tags.chain(lines).chain(stops).max().unwrap_or(0)
    }
}
