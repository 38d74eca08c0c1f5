//! Tool-call handling between generation segments.
//!
//! When the parser reports a tool-call marker, the orchestrator stops the
//! active stream, runs the tool, and serializes the outcome as a
//! `TOOL_RESULT:` line. [`ContinuationState`] bounds how many tool turns
//! and transient-failure retries one user message may consume.

use std::sync::Arc;
use std::time::Duration;

use lt_domain::error::{Error, Result};
use lt_domain::tool::ToolCall;
use lt_providers::{TokenSource, ToolExecutor};
use serde_json::{json, Value};
use tracing::Instrument;

use crate::backoff::RetryBackoff;
use crate::markers::scan::{ARGS_KEYS, LINE_TOOL_RESULT, NAME_KEYS};
use crate::markers::DetectedMarker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PendingToolCall / ContinuationState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A detected call between marker detection and history folding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub raw: String,
    pub payload: Value,
    /// Assistant text of this segment written before the marker. The
    /// prompt is rebuilt from it so tool JSON is never replayed as speech.
    pub assistant_text: String,
}

/// Loop bounds for one user message.
#[derive(Debug, Clone)]
pub struct ContinuationState {
    remaining_tool_turns: u32,
    tool_rounds: u32,
    retry_attempt: u32,
    backoff: RetryBackoff,
}

impl ContinuationState {
    pub fn new(max_tool_turns: u32, backoff: RetryBackoff) -> Self {
        Self {
            remaining_tool_turns: max_tool_turns,
            tool_rounds: 0,
            retry_attempt: 0,
            backoff,
        }
    }

    pub fn remaining_tool_turns(&self) -> u32 {
        self.remaining_tool_turns
    }

    /// Tool turns dispatched so far.
    pub fn tool_rounds(&self) -> u32 {
        self.tool_rounds
    }

    /// Spend one tool turn. `false` once the budget is exhausted.
    pub fn take_tool_turn(&mut self) -> bool {
        if self.remaining_tool_turns == 0 {
            return false;
        }
        self.remaining_tool_turns -= 1;
        self.tool_rounds += 1;
        true
    }

    /// Delay before the next retry, or `None` once the ceiling is reached.
    pub fn next_retry_delay(&mut self) -> Option<Duration> {
        if self.backoff.should_give_up(self.retry_attempt) {
            return None;
        }
        let delay = self.backoff.delay_for_attempt(self.retry_attempt);
        self.retry_attempt += 1;
        Some(delay)
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// A segment streamed successfully; the next failure starts over.
    pub fn reset_retries(&mut self) {
        self.retry_attempt = 0;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolCallOrchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything produced by one dispatched tool turn.
#[derive(Debug, Clone)]
pub struct ToolRound {
    pub call: ToolCall,
    pub pending: PendingToolCall,
    /// Tool output, or `{"error": ...}` when the tool failed.
    pub result: Value,
    pub is_error: bool,
    /// `TOOL_RESULT: {...}` line appended to the buffer.
    pub result_marker: String,
    /// Text that followed the marker in the buffer. Kept, not discarded.
    pub trailing: String,
}

impl ToolRound {
    /// Body of the tool-role history entry.
    pub fn tool_content(&self) -> String {
        self.result.to_string()
    }
}

pub struct ToolCallOrchestrator {
    source: Arc<dyn TokenSource>,
    tools: Arc<dyn ToolExecutor>,
}

impl ToolCallOrchestrator {
    pub fn new(source: Arc<dyn TokenSource>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self { source, tools }
    }

    /// Turn a marker into a call. `Ok(None)` when the payload names no
    /// tool; an error when it cannot be parsed even after repair.
    pub fn actionable(&self, marker: &DetectedMarker) -> Result<Option<ToolCall>> {
        let Some((tool_name, arguments)) = parse_tool_payload(&marker.payload)? else {
            return Ok(None);
        };
        Ok(Some(ToolCall {
            call_id: new_call_id(),
            tool_name,
            arguments,
        }))
    }

    /// Stop the stream, execute `call`, and build the result marker.
    pub async fn handle(
        &self,
        call: ToolCall,
        marker: &DetectedMarker,
        buffer: &str,
        assistant_text: String,
    ) -> ToolRound {
        self.source.cancel();

        let span = tracing::info_span!(
            "tool.call",
            tool_name = %call.tool_name,
            call_id = %call.call_id,
        );
        let outcome = self
            .tools
            .execute(&call.tool_name, &call.arguments)
            .instrument(span)
            .await;

        let (result, is_error, marker_payload) = match outcome {
            Ok(value) => {
                let payload = json!({ "tool_name": call.tool_name, "result": value });
                (value, false, payload)
            }
            Err(message) => {
                tracing::warn!(tool = %call.tool_name, error = %message, "tool returned an error");
                let payload = json!({ "tool_name": call.tool_name, "error": message });
                (json!({ "error": message }), true, payload)
            }
        };

        let tail = buffer.get(marker.span.end..).unwrap_or_default();
        let trailing = tail.strip_prefix('\n').unwrap_or(tail).to_string();

        ToolRound {
            pending: PendingToolCall {
                raw: marker.raw.clone(),
                payload: json!({ "name": call.tool_name, "arguments": call.arguments }),
                assistant_text,
            },
            call,
            result,
            is_error,
            result_marker: format!("{LINE_TOOL_RESULT} {marker_payload}"),
            trailing,
        }
    }
}

fn new_call_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &id[..12])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a marker payload into `(tool_name, arguments)`.
pub fn parse_tool_payload(payload: &str) -> Result<Option<(String, Value)>> {
    let payload = payload.trim();
    if is_bare_identifier(payload) {
        return Ok(Some((payload.to_string(), json!({}))));
    }
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(first) => serde_json::from_str(&strip_trailing_commas(payload)).map_err(|_| {
            Error::MalformedToolCall(format!("{first} in {}", preview(payload, 120)))
        })?,
    };
    Ok(extract_call(&value))
}

fn extract_call(value: &Value) -> Option<(String, Value)> {
    match value {
        Value::Object(map) => {
            let name = NAME_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))?
                .to_string();
            let arguments = ARGS_KEYS
                .iter()
                .chain(std::iter::once(&"parameters"))
                .find_map(|k| map.get(*k))
                .cloned()
                .unwrap_or_else(|| json!({}));
            // Some models emit arguments as a JSON-encoded string.
            let arguments = match arguments {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            Some((name, arguments))
        }
        Value::Array(items) => items.first().and_then(extract_call),
        _ => None,
    }
}

fn is_bare_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Remove commas directly before a closing brace or bracket, outside
/// string literals.
fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn preview(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::MarkerKind;
    use lt_providers::ReplayTokenSource;

    struct FixedTools;

    #[async_trait::async_trait]
    impl ToolExecutor for FixedTools {
        async fn execute(&self, tool_name: &str, arguments: &Value) -> std::result::Result<Value, String> {
            match tool_name {
                "clock" => Ok(json!({"utc": "12:00"})),
                "echo" => Ok(arguments.clone()),
                other => Err(format!("unknown tool '{other}'")),
            }
        }
    }

    fn marker(buf: &str, payload: &str) -> DetectedMarker {
        let start = buf.find("TOOL_CALL:").unwrap();
        let end = buf.find(payload).unwrap() + payload.len();
        DetectedMarker {
            kind: MarkerKind::Line,
            span: start..end,
            raw: buf[start..end].to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn parses_common_payload_shapes() {
        let (name, args) = parse_tool_payload(r#"{"name":"x","arguments":{"a":"}"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(name, "x");
        assert_eq!(args, json!({"a": "}"}));

        let (name, args) = parse_tool_payload(r#"{"tool_name":"echo","args":"{\"text\":\"hi\"}"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(name, "echo");
        assert_eq!(args, json!({"text": "hi"}));

        let (name, args) = parse_tool_payload("clock").unwrap().unwrap();
        assert_eq!(name, "clock");
        assert_eq!(args, json!({}));
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let (name, args) = parse_tool_payload(r#"{"name":"echo","arguments":{"text":"a,}",},}"#)
            .unwrap()
            .unwrap();
        assert_eq!(name, "echo");
        assert_eq!(args, json!({"text": "a,}"}));
    }

    #[test]
    fn nameless_payload_is_not_actionable() {
        assert!(parse_tool_payload(r#"{"arguments":{}}"#).unwrap().is_none());
        assert!(parse_tool_payload("[]").unwrap().is_none());
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = parse_tool_payload(r#"{"name": clock please}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedToolCall(_)));
    }

    #[test]
    fn tool_turn_budget_is_bounded() {
        let mut state = ContinuationState::new(2, RetryBackoff::default());
        assert!(state.take_tool_turn());
        assert!(state.take_tool_turn());
        assert!(!state.take_tool_turn());
        assert_eq!(state.tool_rounds(), 2);
        assert_eq!(state.remaining_tool_turns(), 0);
    }

    #[test]
    fn retries_back_off_then_give_up() {
        let mut state = ContinuationState::new(2, RetryBackoff::default());
        assert_eq!(state.next_retry_delay(), Some(Duration::from_millis(250)));
        assert_eq!(state.next_retry_delay(), Some(Duration::from_millis(500)));
        assert_eq!(state.next_retry_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(state.next_retry_delay(), None);
        state.reset_retries();
        assert_eq!(state.next_retry_delay(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn handle_cancels_source_and_keeps_trailing_text() {
        let source = Arc::new(ReplayTokenSource::new(Vec::new()));
        let orch = ToolCallOrchestrator::new(source.clone(), Arc::new(FixedTools));
        let buf = r#"Checking. TOOL_CALL: {"name":"clock","arguments":{}}
then more"#;
        let m = marker(buf, r#"{"name":"clock","arguments":{}}"#);
        let call = orch.actionable(&m).unwrap().unwrap();
        assert!(call.call_id.starts_with("call_"));

        let round = orch.handle(call, &m, buf, "Checking. ".into()).await;
        assert_eq!(source.cancel_calls(), 1);
        assert!(!round.is_error);
        assert_eq!(
            round.result_marker,
            r#"TOOL_RESULT: {"result":{"utc":"12:00"},"tool_name":"clock"}"#
        );
        assert_eq!(round.trailing, "then more");
        assert_eq!(round.pending.assistant_text, "Checking. ");
        assert_eq!(round.tool_content(), r#"{"utc":"12:00"}"#);
    }

    #[tokio::test]
    async fn tool_error_becomes_error_payload() {
        let source = Arc::new(ReplayTokenSource::new(Vec::new()));
        let orch = ToolCallOrchestrator::new(source, Arc::new(FixedTools));
        let buf = r#"TOOL_CALL: {"name":"weather","arguments":{}}"#;
        let m = marker(buf, r#"{"name":"weather","arguments":{}}"#);
        let call = orch.actionable(&m).unwrap().unwrap();
        let round = orch.handle(call, &m, buf, String::new()).await;
        assert!(round.is_error);
        assert_eq!(round.result, json!({"error": "unknown tool 'weather'"}));
        assert!(round.result_marker.contains(r#""error":"unknown tool 'weather'""#));
        assert!(round.trailing.is_empty());
    }
}
